//! Hidden-representation stack returned by a forward step

use anyhow::Result;
use candle_core::Tensor;

/// Residual stream captured during one forward step
///
/// Holds `n_layers + 1` tensors, each shape `(seq_len, d_model)` covering the
/// positions processed in that step. Index 0 is the embedding output; index
/// `i + 1` is the output of transformer layer `i`, before the final norm.
#[derive(Debug, Clone)]
pub struct HiddenStates {
    states: Vec<Tensor>,
}

impl HiddenStates {
    /// Create an empty stack with room for the embedding plus `n_layers`
    pub fn with_capacity(n_layers: usize) -> Self {
        Self {
            states: Vec::with_capacity(n_layers + 1),
        }
    }

    /// Build from collected states (embedding first)
    pub fn new(states: Vec<Tensor>) -> Self {
        Self { states }
    }

    /// Append the next state. The first push is the embedding output.
    pub fn push(&mut self, tensor: Tensor) {
        self.states.push(tensor);
    }

    /// Number of transformer layers (excludes the embedding output)
    pub fn n_layers(&self) -> usize {
        self.states.len().saturating_sub(1)
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    /// Full `(seq_len, d_model)` output of transformer layer `layer`
    pub fn layer(&self, layer: usize) -> Option<&Tensor> {
        self.states.get(layer + 1)
    }

    /// Representation of the most recent position at `layer`, shape `(1, d_model)`
    pub fn last_token(&self, layer: usize) -> Result<Tensor> {
        let tensor = self.layer(layer).ok_or_else(|| {
            anyhow::anyhow!(
                "Layer {layer} not in hidden states ({} layers)",
                self.n_layers()
            )
        })?;
        let seq_len = tensor.dim(0)?;
        anyhow::ensure!(seq_len > 0, "Hidden state for layer {layer} is empty");
        Ok(tensor.narrow(0, seq_len - 1, 1)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    #[test]
    fn test_layer_offset_skips_embedding() {
        let device = Device::Cpu;
        let emb = Tensor::zeros((3, 4), DType::F32, &device).unwrap();
        let l0 = Tensor::ones((3, 4), DType::F32, &device).unwrap();
        let l1 = (Tensor::ones((3, 4), DType::F32, &device).unwrap() * 2.0).unwrap();

        let stack = HiddenStates::new(vec![emb, l0, l1]);

        assert_eq!(stack.n_layers(), 2);
        assert!(stack.layer(2).is_none());
        let last: Vec<f32> = stack.layer(1).unwrap().flatten_all().unwrap().to_vec1().unwrap();
        assert!(last.iter().all(|&v| v == 2.0));
    }

    #[test]
    fn test_last_token_takes_final_position() {
        let device = Device::Cpu;
        let emb = Tensor::zeros((2, 2), DType::F32, &device).unwrap();
        let l0 = Tensor::new(&[[1f32, 2.], [3., 4.]], &device).unwrap();

        let mut stack = HiddenStates::with_capacity(1);
        assert!(stack.is_empty());
        stack.push(emb);
        stack.push(l0);

        let last = stack.last_token(0).unwrap();
        assert_eq!(last.dims(), &[1, 2]);
        assert_eq!(last.to_vec2::<f32>().unwrap(), vec![vec![3., 4.]]);
        assert!(stack.last_token(1).is_err());
    }
}

//! Layer projection: intermediate hidden states to vocabulary logits
//!
//! Same idea as a logit lens: push a layer's residual through the model's
//! final norm and output head to see what that layer would predict. Only the
//! most recent position is projected; earlier positions live in the KV-cache.

use anyhow::Result;
use candle_core::{DType, IndexOp, Module, Tensor};

use crate::hidden_states::HiddenStates;
use crate::layers::ChosenLayers;
use crate::model::SledBackend;

/// Projects chosen layers through the backend's norm and head
///
/// Hidden states are stored before the final norm, so projecting the last
/// layer reproduces the backend's own logits.
pub struct LayerProjector<'m> {
    /// `[d_model] -> [vocab_size]`
    head: &'m dyn Module,
    /// Skipped when the backend has no final norm
    norm: Option<&'m dyn Module>,
}

impl<'m> LayerProjector<'m> {
    /// Build a projector for `backend`
    ///
    /// Fails once, here, if the backend exposes no output head.
    pub fn new(backend: &'m dyn SledBackend) -> Result<Self> {
        let head = backend.output_head().ok_or_else(|| {
            anyhow::anyhow!(
                "Model does not expose an output head compatible with logits projection"
            )
        })?;
        Ok(Self {
            head,
            norm: backend.final_norm(),
        })
    }

    /// Logits `(vocab_size,)` for the last position of `layer`
    fn project_layer(&self, hidden: &HiddenStates, layer: usize) -> Result<Tensor> {
        let mut h = hidden.last_token(layer)?;
        if let Some(norm) = self.norm {
            h = norm.forward(&h)?;
        }
        Ok(self.head.forward(&h)?.squeeze(0)?)
    }

    /// One vocabulary logit vector per chosen layer, in layer order
    pub fn project(&self, hidden: &HiddenStates, chosen: &ChosenLayers) -> Result<Vec<Tensor>> {
        chosen
            .iter()
            .map(|layer| self.project_layer(hidden, layer))
            .collect()
    }

    /// The logit of `token_id` at each chosen layer
    ///
    /// Used by calibration, which only needs the correct token's score.
    pub fn project_token(
        &self,
        hidden: &HiddenStates,
        chosen: &ChosenLayers,
        token_id: u32,
    ) -> Result<Vec<f32>> {
        chosen
            .iter()
            .map(|layer| {
                let logits = self.project_layer(hidden, layer)?;
                let vocab = logits.dim(0)?;
                anyhow::ensure!(
                    (token_id as usize) < vocab,
                    "Token {token_id} outside vocabulary of {vocab}"
                );
                Ok(logits
                    .i(token_id as usize)?
                    .to_dtype(DType::F32)?
                    .to_scalar::<f32>()?)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv_cache::KvCache;
    use crate::model::StepOutput;
    use candle_core::Device;
    use candle_nn::Linear;

    /// Head-only backend; forward is never called
    struct HeadOnly {
        head: Option<Linear>,
        norm: Option<Linear>,
    }

    impl SledBackend for HeadOnly {
        fn n_layers(&self) -> usize {
            2
        }
        fn d_model(&self) -> usize {
            2
        }
        fn vocab_size(&self) -> usize {
            3
        }
        fn new_kv_cache(&self) -> KvCache {
            KvCache::new(2)
        }
        fn forward_step(&self, _: &[u32], _: &mut KvCache, _: bool) -> Result<StepOutput> {
            anyhow::bail!("not used")
        }
        fn output_head(&self) -> Option<&dyn Module> {
            self.head.as_ref().map(|h| h as &dyn Module)
        }
        fn final_norm(&self) -> Option<&dyn Module> {
            self.norm.as_ref().map(|n| n as &dyn Module)
        }
    }

    fn head() -> Linear {
        // vocab 3 x d_model 2
        let w = Tensor::new(&[[1f32, 0.], [0., 1.], [1., 1.]], &Device::Cpu).unwrap();
        Linear::new(w, None)
    }

    fn stack() -> HiddenStates {
        let device = Device::Cpu;
        HiddenStates::new(vec![
            Tensor::new(&[[0f32, 0.], [0., 0.]], &device).unwrap(),
            Tensor::new(&[[9f32, 9.], [1., 2.]], &device).unwrap(),
            Tensor::new(&[[9f32, 9.], [3., 5.]], &device).unwrap(),
        ])
    }

    #[test]
    fn test_missing_head_fails_at_setup() {
        let backend = HeadOnly {
            head: None,
            norm: None,
        };
        assert!(LayerProjector::new(&backend).is_err());
    }

    #[test]
    fn test_project_uses_last_position() {
        let backend = HeadOnly {
            head: Some(head()),
            norm: None,
        };
        let projector = LayerProjector::new(&backend).unwrap();
        let chosen = ChosenLayers::from_indices(vec![0, 1]).unwrap();

        let logits = projector.project(&stack(), &chosen).unwrap();
        assert_eq!(logits.len(), 2);
        assert_eq!(logits[0].to_vec1::<f32>().unwrap(), vec![1., 2., 3.]);
        assert_eq!(logits[1].to_vec1::<f32>().unwrap(), vec![3., 5., 8.]);
    }

    #[test]
    fn test_project_token_matches_full_projection() {
        let backend = HeadOnly {
            head: Some(head()),
            norm: None,
        };
        let projector = LayerProjector::new(&backend).unwrap();
        let chosen = ChosenLayers::from_indices(vec![0, 1]).unwrap();

        let values = projector.project_token(&stack(), &chosen, 2).unwrap();
        assert_eq!(values, vec![3., 8.]);
        assert!(projector.project_token(&stack(), &chosen, 7).is_err());
    }

    #[test]
    fn test_norm_applied_before_head() {
        // "norm" doubles the hidden vector
        let norm = Linear::new(
            Tensor::new(&[[2f32, 0.], [0., 2.]], &Device::Cpu).unwrap(),
            None,
        );
        let backend = HeadOnly {
            head: Some(head()),
            norm: Some(norm),
        };
        let projector = LayerProjector::new(&backend).unwrap();
        let chosen = ChosenLayers::from_indices(vec![0]).unwrap();

        let logits = projector.project(&stack(), &chosen).unwrap();
        assert_eq!(logits[0].to_vec1::<f32>().unwrap(), vec![2., 4., 6.]);
    }
}

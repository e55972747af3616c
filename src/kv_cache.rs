//! KV-cache handle for incremental decoding
//!
//! Stores key and value tensors from previous positions so each decode step
//! only feeds the newest token through the model. One cache belongs to one
//! in-flight request; it is created by the backend and threaded through the
//! decode loop, never shared.
//!
//! ## Memory Layout
//!
//! Each layer stores:
//! - keys: `[batch, num_kv_heads, seq_len, head_dim]`
//! - values: `[batch, num_kv_heads, seq_len, head_dim]`

use anyhow::Result;
use candle_core::Tensor;

/// Per-layer key/value cache for one decode request
#[derive(Debug, Clone)]
pub struct KvCache {
    keys: Vec<Option<Tensor>>,
    values: Vec<Option<Tensor>>,
}

impl KvCache {
    /// Create a new empty cache for the given number of layers
    pub fn new(n_layers: usize) -> Self {
        Self {
            keys: vec![None; n_layers],
            values: vec![None; n_layers],
        }
    }

    /// Number of positions already cached (0 if empty)
    pub fn seq_len(&self) -> usize {
        self.keys
            .iter()
            .find_map(|k| k.as_ref())
            .map_or(0, |k| k.dim(2).unwrap_or(0))
    }

    pub fn is_empty(&self) -> bool {
        self.keys.iter().all(std::option::Option::is_none)
    }

    pub fn n_layers(&self) -> usize {
        self.keys.len()
    }

    /// Append new keys/values for `layer` along the sequence axis
    ///
    /// Returns the full (cached + new) key and value tensors to attend over.
    pub fn append(&mut self, layer: usize, k: &Tensor, v: &Tensor) -> Result<(Tensor, Tensor)> {
        anyhow::ensure!(
            layer < self.n_layers(),
            "Layer {layer} out of range for KV-cache with {} layers",
            self.n_layers()
        );

        let (k, v) = match (&self.keys[layer], &self.values[layer]) {
            (Some(prev_k), Some(prev_v)) => (
                Tensor::cat(&[prev_k, k], 2)?,
                Tensor::cat(&[prev_v, v], 2)?,
            ),
            _ => (k.clone(), v.clone()),
        };

        self.keys[layer] = Some(k.clone());
        self.values[layer] = Some(v.clone());
        Ok((k, v))
    }

    /// Total bytes held by cached tensors
    pub fn memory_usage(&self) -> usize {
        self.keys
            .iter()
            .chain(self.values.iter())
            .flatten()
            .map(|t| t.elem_count() * t.dtype().size_in_bytes())
            .sum()
    }
}

impl Default for KvCache {
    fn default() -> Self {
        Self::new(0)
    }
}

//! Attention masks for cached decoding

use anyhow::Result;
use candle_core::{DType, Device, Tensor};

/// Causal mask for a forward step over a KV-cache
///
/// - `new_seq_len`: number of positions fed in this step (the prompt length on
///   the first step, 1 afterwards)
/// - `total_seq_len`: cached + new positions
/// - `start_pos`: number of cached positions
///
/// New position `i` may attend to every cached position and to new positions
/// up to and including itself.
///
/// # Returns
///
/// A tensor of shape `[1, 1, new_seq_len, total_seq_len]` holding `0.0` where
/// attention is allowed and `-inf` elsewhere.
pub fn create_generation_mask(
    new_seq_len: usize,
    total_seq_len: usize,
    start_pos: usize,
    device: &Device,
    dtype: DType,
) -> Result<Tensor> {
    if new_seq_len == 1 {
        return Ok(Tensor::zeros((1, 1, 1, total_seq_len), dtype, device)?);
    }

    let mask: Vec<f32> = (0..new_seq_len)
        .flat_map(|i| {
            let visible_up_to = start_pos + i;
            (0..total_seq_len).map(move |j| {
                if j <= visible_up_to {
                    0.0
                } else {
                    f32::NEG_INFINITY
                }
            })
        })
        .collect();

    Ok(Tensor::from_vec(mask, (1, 1, new_seq_len, total_seq_len), device)?.to_dtype(dtype)?)
}

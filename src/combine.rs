//! Combining per-layer logits into one distribution
//!
//! Weighting policies:
//! - `uniform`: equal weight `1/k`
//! - `depth_softmax`: softmax over depth ranks `1..=k`; deeper layers weigh more
//! - `learned`: calibrated weights from an artifact, falling back to uniform
//!   when none are available or they do not fit the chosen layers
//!
//! The blended logits are an elementwise weighted sum over the vocabulary.

use std::fmt;
use std::str::FromStr;

use anyhow::Result;
use candle_core::{DType, Tensor};
use serde::{Deserialize, Serialize};

/// Requested (or applied) weighting policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Weighting {
    #[default]
    Uniform,
    DepthSoftmax,
    Learned,
}

impl Weighting {
    pub fn as_str(&self) -> &'static str {
        match self {
            Weighting::Uniform => "uniform",
            Weighting::DepthSoftmax => "depth_softmax",
            Weighting::Learned => "learned",
        }
    }
}

impl fmt::Display for Weighting {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Weighting {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "uniform" => Ok(Weighting::Uniform),
            "depth_softmax" => Ok(Weighting::DepthSoftmax),
            "learned" => Ok(Weighting::Learned),
            other => anyhow::bail!(
                "Unknown weighting '{other}' (expected uniform, depth_softmax or learned)"
            ),
        }
    }
}

/// Non-negative per-layer weights summing to 1
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MixingWeights(Vec<f32>);

impl MixingWeights {
    /// Equal weights for `n` layers
    pub fn uniform(n: usize) -> Self {
        Self(vec![1.0 / n as f32; n])
    }

    /// Softmax over depth ranks `1..=n`, shallowest first
    pub fn depth_softmax(n: usize) -> Self {
        let max_rank = n as f32;
        let exp: Vec<f32> = (1..=n).map(|r| (r as f32 - max_rank).exp()).collect();
        let sum: f32 = exp.iter().sum();
        Self(exp.into_iter().map(|e| e / sum).collect())
    }

    /// Normalize raw weights: clip negatives to zero and rescale to sum 1
    ///
    /// Non-finite entries count as zero. If nothing positive remains the
    /// result is uniform, so the weights are always usable.
    pub fn from_raw(raw: &[f32]) -> Self {
        let clipped: Vec<f32> = raw
            .iter()
            .map(|&w| if w.is_finite() && w > 0.0 { w } else { 0.0 })
            .collect();
        let sum: f32 = clipped.iter().sum();
        if sum > 0.0 && sum.is_finite() {
            Self(clipped.into_iter().map(|w| w / sum).collect())
        } else {
            Self::uniform(raw.len())
        }
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn sum(&self) -> f32 {
        self.0.iter().sum()
    }
}

/// Weights to use for a request, plus the policy actually applied
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedWeights {
    pub weights: MixingWeights,
    pub requested: Weighting,
    pub applied: Weighting,
}

impl ResolvedWeights {
    /// True when `learned` was requested but uniform was applied instead
    pub fn fell_back(&self) -> bool {
        self.requested != self.applied
    }
}

/// Pick the weights for `k_eff` layers under `weighting`
///
/// `learned` uses `learned` only when its length matches `k_eff`; anything
/// else degrades to uniform and is reported through `applied`.
pub fn resolve_weights(
    weighting: Weighting,
    k_eff: usize,
    learned: Option<&MixingWeights>,
) -> ResolvedWeights {
    let (weights, applied) = match weighting {
        Weighting::Uniform => (MixingWeights::uniform(k_eff), Weighting::Uniform),
        Weighting::DepthSoftmax => (MixingWeights::depth_softmax(k_eff), Weighting::DepthSoftmax),
        Weighting::Learned => match learned {
            Some(w) if w.len() == k_eff => (w.clone(), Weighting::Learned),
            _ => (MixingWeights::uniform(k_eff), Weighting::Uniform),
        },
    };
    ResolvedWeights {
        weights,
        requested: weighting,
        applied,
    }
}

/// Elementwise weighted sum of per-layer logits, in F32
///
/// A single layer passes through unchanged.
pub fn weighted_sum(layer_logits: &[Tensor], weights: &MixingWeights) -> Result<Tensor> {
    anyhow::ensure!(!layer_logits.is_empty(), "No layer logits to combine");
    anyhow::ensure!(
        layer_logits.len() == weights.len(),
        "Got {} layer logits but {} weights",
        layer_logits.len(),
        weights.len()
    );

    if layer_logits.len() == 1 {
        return Ok(layer_logits[0].to_dtype(DType::F32)?);
    }

    let stacked = Tensor::stack(layer_logits, 0)?.to_dtype(DType::F32)?; // [k, vocab]
    let device = stacked.device();
    let w = Tensor::new(weights.as_slice(), device)?.unsqueeze(1)?; // [k, 1]
    Ok(stacked.broadcast_mul(&w)?.sum(0)?)
}

/// Result of [`combine`]
#[derive(Debug, Clone)]
pub struct Combined {
    pub logits: Tensor,
    pub weighting_applied: Weighting,
}

/// Resolve the weighting and blend `layer_logits` in one call
pub fn combine(
    layer_logits: &[Tensor],
    weighting: Weighting,
    learned: Option<&MixingWeights>,
) -> Result<Combined> {
    let resolved = resolve_weights(weighting, layer_logits.len(), learned);
    let logits = weighted_sum(layer_logits, &resolved.weights)?;
    Ok(Combined {
        logits,
        weighting_applied: resolved.applied,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn t(values: &[f32]) -> Tensor {
        Tensor::new(values, &Device::Cpu).unwrap()
    }

    #[test]
    fn test_uniform_two_layers() {
        let out = combine(&[t(&[0., 0.]), t(&[2., 2.])], Weighting::Uniform, None).unwrap();
        assert_eq!(out.logits.to_vec1::<f32>().unwrap(), vec![1., 1.]);
        assert_eq!(out.weighting_applied, Weighting::Uniform);
    }

    #[test]
    fn test_single_layer_passthrough() {
        let out = combine(&[t(&[3., -1., 7.])], Weighting::DepthSoftmax, None).unwrap();
        assert_eq!(out.logits.to_vec1::<f32>().unwrap(), vec![3., -1., 7.]);
    }

    #[test]
    fn test_depth_softmax_favours_deeper_layers() {
        let w = MixingWeights::depth_softmax(4);
        assert!((w.sum() - 1.0).abs() < 1e-6);
        assert!(w.as_slice().windows(2).all(|p| p[0] < p[1]));

        let layers = [t(&[0.; 10]), t(&[1.; 10]), t(&(0..10).map(|i| i as f32).collect::<Vec<_>>())];
        let uniform = combine(&layers, Weighting::Uniform, None).unwrap();
        let depth = combine(&layers, Weighting::DepthSoftmax, None).unwrap();
        let u: Vec<f32> = uniform.logits.to_vec1().unwrap();
        let d: Vec<f32> = depth.logits.to_vec1().unwrap();
        // the deepest layer carries the slope, so depth weighting steepens it
        assert!(d[9] - d[0] > u[9] - u[0]);
    }

    #[test]
    fn test_learned_without_weights_falls_back() {
        let out = combine(&[t(&[1.]), t(&[3.])], Weighting::Learned, None).unwrap();
        assert_eq!(out.weighting_applied, Weighting::Uniform);
        assert_eq!(out.logits.to_vec1::<f32>().unwrap(), vec![2.]);
    }

    #[test]
    fn test_learned_length_mismatch_falls_back() {
        let learned = MixingWeights::from_raw(&[1., 1., 2.]);
        let resolved = resolve_weights(Weighting::Learned, 2, Some(&learned));
        assert_eq!(resolved.applied, Weighting::Uniform);
        assert!(resolved.fell_back());
    }

    #[test]
    fn test_learned_weights_applied() {
        let learned = MixingWeights::from_raw(&[1., 3.]);
        let out = combine(&[t(&[4., 0.]), t(&[0., 4.])], Weighting::Learned, Some(&learned)).unwrap();
        assert_eq!(out.weighting_applied, Weighting::Learned);
        assert_eq!(out.logits.to_vec1::<f32>().unwrap(), vec![1., 3.]);
    }

    #[test]
    fn test_weighted_sum_matches_manual_and_is_permutation_invariant() {
        let a = t(&[0.5, -2.0, 4.0]);
        let b = t(&[1.0, 3.0, -1.0]);
        let c = t(&[2.0, 0.25, 0.0]);
        let w = MixingWeights::from_raw(&[0.5, 0.25, 0.25]);

        let out: Vec<f32> = weighted_sum(&[a.clone(), b.clone(), c.clone()], &w)
            .unwrap()
            .to_vec1()
            .unwrap();
        let expected = [
            0.5 * 0.5 + 0.25 * 1.0 + 0.25 * 2.0,
            0.5 * -2.0 + 0.25 * 3.0 + 0.25 * 0.25,
            0.5 * 4.0 + 0.25 * -1.0 + 0.25 * 0.0,
        ];
        for (o, e) in out.iter().zip(expected.iter()) {
            assert!((o - e).abs() < 1e-6);
        }

        // same layers and weights, rotated together
        let w_perm = MixingWeights::from_raw(&[0.25, 0.5, 0.25]);
        let permuted: Vec<f32> = weighted_sum(&[c, a, b], &w_perm)
            .unwrap()
            .to_vec1()
            .unwrap();
        for (o, p) in out.iter().zip(permuted.iter()) {
            assert!((o - p).abs() < 1e-6);
        }
    }

    #[test]
    fn test_combine_is_deterministic() {
        let layers = [t(&[0.1, 0.7, -0.3]), t(&[1.3, -0.2, 0.9]), t(&[0.0, 0.4, 2.2])];
        let first: Vec<f32> = combine(&layers, Weighting::DepthSoftmax, None)
            .unwrap()
            .logits
            .to_vec1()
            .unwrap();
        for _ in 0..10 {
            let again: Vec<f32> = combine(&layers, Weighting::DepthSoftmax, None)
                .unwrap()
                .logits
                .to_vec1()
                .unwrap();
            assert_eq!(
                first.iter().map(|v| v.to_bits()).collect::<Vec<_>>(),
                again.iter().map(|v| v.to_bits()).collect::<Vec<_>>()
            );
        }
    }

    #[test]
    fn test_from_raw_normalizes() {
        let w = MixingWeights::from_raw(&[-1.0, 2.0, 6.0]);
        assert_eq!(w.as_slice(), &[0.0, 0.25, 0.75]);

        let w = MixingWeights::from_raw(&[-1.0, 0.0, f32::NAN]);
        assert_eq!(w, MixingWeights::uniform(3));
    }

    #[test]
    fn test_weighted_sum_length_mismatch() {
        assert!(weighted_sum(&[t(&[1.])], &MixingWeights::uniform(2)).is_err());
        assert!(weighted_sum(&[], &MixingWeights::uniform(0)).is_err());
    }
}

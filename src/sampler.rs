//! Token sampling: greedy arg-max or nucleus (top-p) with temperature

use std::cmp::Ordering;

use anyhow::Result;
use candle_core::{DType, Tensor};
use rand::distributions::{Distribution, WeightedIndex};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Index of the largest logit; the first one wins ties and NaNs are skipped
pub fn argmax(logits: &[f32]) -> Option<u32> {
    let mut best: Option<(usize, f32)> = None;
    for (idx, &value) in logits.iter().enumerate() {
        if value.is_nan() {
            continue;
        }
        match best {
            Some((_, current)) if value <= current => {}
            _ => best = Some((idx, value)),
        }
    }
    best.map(|(idx, _)| idx as u32)
        .or_else(|| (!logits.is_empty()).then_some(0))
}

/// Sample one token id from `logits`
///
/// `temperature <= 0` is deterministic arg-max and ignores `top_p`. Otherwise
/// the logits are scaled by `1/temperature`, softmaxed and sorted; sampling is
/// restricted to the shortest prefix whose cumulative probability exceeds
/// `top_p`. When no prefix crosses `top_p` the whole sorted distribution is used.
pub fn sample<R: Rng + ?Sized>(
    logits: &[f32],
    temperature: f32,
    top_p: f32,
    rng: &mut R,
) -> Result<u32> {
    let greedy = argmax(logits).ok_or_else(|| anyhow::anyhow!("Empty logits"))?;
    if temperature <= 0.0 {
        return Ok(greedy);
    }

    let t = temperature.max(1e-6);
    let scaled: Vec<f32> = logits.iter().map(|x| x / t).collect();
    let max_val = scaled.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let exp_vals: Vec<f32> = scaled.iter().map(|x| (x - max_val).exp()).collect();
    let sum: f32 = exp_vals.iter().sum();
    if !(sum.is_finite() && sum > 0.0) {
        return Ok(greedy);
    }

    let mut sorted: Vec<(usize, f32)> = exp_vals.iter().map(|e| e / sum).enumerate().collect();
    sorted.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(Ordering::Equal));

    let mut cumsum = 0.0f32;
    let cutoff = sorted.iter().position(|&(_, p)| {
        cumsum += p;
        cumsum > top_p
    });
    let keep = match cutoff {
        Some(last) => &sorted[..=last],
        None => &sorted[..],
    };

    // WeightedIndex renormalizes; it only fails on degenerate weights
    match WeightedIndex::new(keep.iter().map(|&(_, p)| p)) {
        Ok(dist) => Ok(keep[dist.sample(rng)].0 as u32),
        Err(_) => Ok(greedy),
    }
}

/// Per-request sampler holding its own RNG
#[derive(Debug, Clone)]
pub struct NucleusSampler {
    temperature: f32,
    top_p: f32,
    rng: StdRng,
}

impl NucleusSampler {
    /// Seeded for reproducible sampling; `None` draws a seed from entropy
    pub fn new(temperature: f32, top_p: f32, seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            temperature,
            top_p,
            rng,
        }
    }

    pub fn is_greedy(&self) -> bool {
        self.temperature <= 0.0
    }

    /// Sample from a `(vocab_size,)` logits tensor of any float dtype
    pub fn sample(&mut self, logits: &Tensor) -> Result<u32> {
        let logits: Vec<f32> = logits.to_dtype(DType::F32)?.flatten_all()?.to_vec1()?;
        sample(&logits, self.temperature, self.top_p, &mut self.rng)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn test_greedy_is_deterministic() {
        let logits = [0.1, 2.5, -1.0, 2.4];
        let mut rng = StdRng::seed_from_u64(0);
        for _ in 0..20 {
            assert_eq!(sample(&logits, 0.0, 0.9, &mut rng).unwrap(), 1);
            assert_eq!(sample(&logits, -1.0, 0.0, &mut rng).unwrap(), 1);
        }
    }

    #[test]
    fn test_argmax_first_tie_wins() {
        assert_eq!(argmax(&[1.0, 3.0, 3.0]), Some(1));
        assert_eq!(argmax(&[f32::NAN, 1.0]), Some(1));
        assert_eq!(argmax(&[]), None);
    }

    #[test]
    fn test_empty_logits_error() {
        let mut rng = StdRng::seed_from_u64(0);
        assert!(sample(&[], 1.0, 0.9, &mut rng).is_err());
    }

    #[test]
    fn test_small_top_p_keeps_only_top_token() {
        // probabilities ~[0.64, 0.24, 0.09, 0.03]
        let logits = [3.0, 2.0, 1.0, 0.0];
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..200 {
            assert_eq!(sample(&logits, 1.0, 0.5, &mut rng).unwrap(), 0);
        }
    }

    #[test]
    fn test_top_p_prefix_is_inclusive() {
        // p(0) ~0.64 < 0.7, so token 1 joins the nucleus; token 2 and 3 never do
        let logits = [3.0, 2.0, 1.0, 0.0];
        let mut rng = StdRng::seed_from_u64(11);
        let mut seen = [0usize; 4];
        for _ in 0..2000 {
            seen[sample(&logits, 1.0, 0.7, &mut rng).unwrap() as usize] += 1;
        }
        assert!(seen[0] > 0 && seen[1] > 0);
        assert_eq!(seen[2] + seen[3], 0);
    }

    #[test]
    fn test_top_p_one_uses_full_distribution() {
        let logits = [0.0, 0.0, 0.0, 0.0];
        let mut rng = StdRng::seed_from_u64(3);
        let mut seen = [false; 4];
        for _ in 0..500 {
            seen[sample(&logits, 1.0, 1.0, &mut rng).unwrap() as usize] = true;
        }
        assert!(seen.iter().all(|&s| s));
    }

    #[test]
    fn test_seeded_sampler_reproducible() {
        let logits = Tensor::new(&[0.3f32, 0.1, 0.2, 0.4, 0.0], &Device::Cpu).unwrap();
        let mut a = NucleusSampler::new(1.0, 0.95, Some(42));
        let mut b = NucleusSampler::new(1.0, 0.95, Some(42));
        for _ in 0..50 {
            assert_eq!(a.sample(&logits).unwrap(), b.sample(&logits).unwrap());
        }
        assert!(!a.is_greedy());
    }

    #[test]
    fn test_infinite_logits_never_raise() {
        let logits = [f32::INFINITY, 1.0, f32::NEG_INFINITY];
        let mut rng = StdRng::seed_from_u64(1);
        assert_eq!(sample(&logits, 1.0, 0.9, &mut rng).unwrap(), 0);
    }
}

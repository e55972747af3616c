//! Layer selection for multi-layer decoding
//!
//! Picks which transformer layers contribute logits to the blend. Selection is a
//! pure function of the layer count, the strategy, and `k`; it is computed once
//! per request and never changes mid-decode.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// How layers are chosen from the model's stack
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LayerStrategy {
    /// The final `k` layers (clamped to `[1, total_layers]`)
    #[default]
    LastK,
    /// Every layer
    All,
}

impl LayerStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            LayerStrategy::LastK => "last_k",
            LayerStrategy::All => "all",
        }
    }
}

impl fmt::Display for LayerStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LayerStrategy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "last_k" => Ok(LayerStrategy::LastK),
            "all" => Ok(LayerStrategy::All),
            other => anyhow::bail!("Unknown layer strategy '{other}' (expected last_k or all)"),
        }
    }
}

/// Ordered, distinct layer indices chosen for one request
///
/// Indices are 0-based transformer layers (the embedding output is not a layer).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChosenLayers(Vec<usize>);

impl ChosenLayers {
    /// Wrap indices loaded from elsewhere (e.g. an artifact)
    ///
    /// Fails if the indices are not strictly ascending.
    pub fn from_indices(indices: Vec<usize>) -> anyhow::Result<Self> {
        anyhow::ensure!(
            indices.windows(2).all(|w| w[0] < w[1]),
            "Layer indices must be strictly ascending: {indices:?}"
        );
        Ok(Self(indices))
    }

    pub fn indices(&self) -> &[usize] {
        &self.0
    }

    /// Effective number of layers (k_eff)
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// True when every index is a valid layer for a model of `total_layers`
    pub fn fits(&self, total_layers: usize) -> bool {
        self.0.iter().all(|&i| i < total_layers)
    }

    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        self.0.iter().copied()
    }
}

/// Select the layers to blend
///
/// Out-of-range `k` is clamped silently: `k = 0` behaves like 1, and `k` larger
/// than the stack selects every layer.
pub fn select_layers(total_layers: usize, strategy: LayerStrategy, k: usize) -> ChosenLayers {
    match strategy {
        LayerStrategy::All => ChosenLayers((0..total_layers).collect()),
        LayerStrategy::LastK => {
            let k = k.max(1).min(total_layers);
            ChosenLayers((total_layers - k..total_layers).collect())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_last_k_twelve_layers() {
        let chosen = select_layers(12, LayerStrategy::LastK, 8);
        assert_eq!(chosen.indices(), &[4, 5, 6, 7, 8, 9, 10, 11]);
    }

    #[test]
    fn test_last_k_clamps_to_stack() {
        let chosen = select_layers(3, LayerStrategy::LastK, 8);
        assert_eq!(chosen.indices(), &[0, 1, 2]);
    }

    #[test]
    fn test_last_k_zero_means_one() {
        let chosen = select_layers(5, LayerStrategy::LastK, 0);
        assert_eq!(chosen.indices(), &[4]);
    }

    #[test]
    fn test_all_ignores_k() {
        let chosen = select_layers(5, LayerStrategy::All, 2);
        assert_eq!(chosen.indices(), &[0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_last_k_is_contiguous_suffix() {
        for total in 1..20 {
            for k in 1..25 {
                let chosen = select_layers(total, LayerStrategy::LastK, k);
                assert_eq!(chosen.len(), k.min(total));
                assert_eq!(chosen.indices().last(), Some(&(total - 1)));
                assert!(chosen.indices().windows(2).all(|w| w[1] == w[0] + 1));
                assert!(chosen.fits(total));
            }
        }
    }

    #[test]
    fn test_strategy_parse() {
        assert_eq!("last_k".parse::<LayerStrategy>().unwrap(), LayerStrategy::LastK);
        assert_eq!("all".parse::<LayerStrategy>().unwrap(), LayerStrategy::All);
        assert!("first_k".parse::<LayerStrategy>().is_err());
    }

    #[test]
    fn test_from_indices_rejects_unordered() {
        assert!(ChosenLayers::from_indices(vec![2, 1]).is_err());
        assert!(ChosenLayers::from_indices(vec![1, 1]).is_err());
        assert!(ChosenLayers::from_indices(vec![1, 4]).is_ok());
    }
}

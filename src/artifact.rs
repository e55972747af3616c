//! Calibration artifact: learned mixing weights paired with the layers they were fit on
//!
//! Stored as a small safetensors file:
//! - `layer_weights`: F32 `[k]`
//! - `chosen`: I32 `[k]`, ascending layer indices
//!
//! plus header metadata `format`, `strategy` and `k`. An artifact is only usable
//! for a request whose chosen layers match `chosen` exactly; anything else is
//! rejected rather than reinterpreted.

use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use safetensors::tensor::{SafeTensors, TensorView};
use safetensors::Dtype;
use tracing::{debug, info};

use crate::combine::MixingWeights;
use crate::layers::{ChosenLayers, LayerStrategy};

const FORMAT: &str = "sled-layer-weights";
const WEIGHTS_TENSOR: &str = "layer_weights";
const CHOSEN_TENSOR: &str = "chosen";

/// Mixing weights and the exact layer selection they belong to
#[derive(Debug, Clone, PartialEq)]
pub struct CalibrationArtifact {
    pub weights: MixingWeights,
    pub chosen: ChosenLayers,
    pub strategy: LayerStrategy,
}

impl CalibrationArtifact {
    pub fn new(
        weights: MixingWeights,
        chosen: ChosenLayers,
        strategy: LayerStrategy,
    ) -> Result<Self> {
        anyhow::ensure!(
            weights.len() == chosen.len(),
            "Artifact has {} weights for {} layers",
            weights.len(),
            chosen.len()
        );
        Ok(Self {
            weights,
            chosen,
            strategy,
        })
    }

    /// Write to `path` via a sibling temp file and a rename
    ///
    /// Concurrent writers to the same path are not coordinated; the last rename wins.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }

        let k = self.weights.len();
        let weight_bytes: Vec<u8> = self
            .weights
            .as_slice()
            .iter()
            .flat_map(|w| w.to_le_bytes())
            .collect();
        let chosen_i32 = self
            .chosen
            .iter()
            .map(|i| i32::try_from(i).context("Layer index does not fit in i32"))
            .collect::<Result<Vec<i32>>>()?;
        let chosen_bytes: Vec<u8> = chosen_i32.iter().flat_map(|i| i.to_le_bytes()).collect();

        let weights_view = TensorView::new(Dtype::F32, vec![k], &weight_bytes)
            .map_err(|e| anyhow::anyhow!("Invalid weights tensor: {e}"))?;
        let chosen_view = TensorView::new(Dtype::I32, vec![k], &chosen_bytes)
            .map_err(|e| anyhow::anyhow!("Invalid chosen tensor: {e}"))?;

        let metadata: HashMap<String, String> = [
            ("format".to_string(), FORMAT.to_string()),
            ("strategy".to_string(), self.strategy.to_string()),
            ("k".to_string(), k.to_string()),
        ]
        .into_iter()
        .collect();

        let bytes = safetensors::tensor::serialize(
            [(WEIGHTS_TENSOR, &weights_view), (CHOSEN_TENSOR, &chosen_view)],
            &Some(metadata),
        )
        .map_err(|e| anyhow::anyhow!("Failed to serialize artifact: {e}"))?;

        let file_name = path
            .file_name()
            .ok_or_else(|| anyhow::anyhow!("Artifact path has no file name: {}", path.display()))?;
        let tmp = path.with_file_name(format!("{}.tmp", file_name.to_string_lossy()));
        std::fs::write(&tmp, &bytes)
            .with_context(|| format!("Failed to write {}", tmp.display()))?;
        std::fs::rename(&tmp, path)
            .with_context(|| format!("Failed to move artifact into {}", path.display()))?;

        info!("Saved {k} layer weights to {}", path.display());
        Ok(())
    }

    /// Read an artifact without checking it against any selection
    pub fn read(path: &Path) -> Result<Self> {
        let data =
            std::fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;

        let (_, header) = SafeTensors::read_metadata(&data)
            .map_err(|e| anyhow::anyhow!("Not a safetensors file: {e}"))?;
        let meta = header.metadata().clone().unwrap_or_default();
        if let Some(format) = meta.get("format") {
            anyhow::ensure!(format == FORMAT, "Unexpected artifact format '{format}'");
        }
        let strategy = match meta.get("strategy") {
            Some(s) => s.parse()?,
            None => LayerStrategy::default(),
        };

        let st = SafeTensors::deserialize(&data)
            .map_err(|e| anyhow::anyhow!("Failed to deserialize artifact: {e}"))?;
        let weights_view = st
            .tensor(WEIGHTS_TENSOR)
            .map_err(|_| anyhow::anyhow!("Artifact has no '{WEIGHTS_TENSOR}' tensor"))?;
        let chosen_view = st
            .tensor(CHOSEN_TENSOR)
            .map_err(|_| anyhow::anyhow!("Artifact has no '{CHOSEN_TENSOR}' tensor"))?;

        anyhow::ensure!(
            weights_view.dtype() == Dtype::F32,
            "'{WEIGHTS_TENSOR}' must be F32, got {:?}",
            weights_view.dtype()
        );
        anyhow::ensure!(
            chosen_view.dtype() == Dtype::I32,
            "'{CHOSEN_TENSOR}' must be I32, got {:?}",
            chosen_view.dtype()
        );

        let raw_weights: Vec<f32> = weights_view
            .data()
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        let raw_chosen: Vec<i32> = chosen_view
            .data()
            .chunks_exact(4)
            .map(|c| i32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();

        anyhow::ensure!(
            raw_weights.len() == raw_chosen.len(),
            "Artifact has {} weights for {} layers",
            raw_weights.len(),
            raw_chosen.len()
        );
        let indices = raw_chosen
            .iter()
            .map(|&i| usize::try_from(i).map_err(|_| anyhow::anyhow!("Negative layer index {i}")))
            .collect::<Result<Vec<usize>>>()?;

        Ok(Self {
            weights: MixingWeights::from_raw(&raw_weights),
            chosen: ChosenLayers::from_indices(indices)?,
            strategy,
        })
    }

    /// Load the weights for `expected`, or the reason the artifact cannot be used
    pub fn load_for(path: &Path, expected: &ChosenLayers) -> Result<MixingWeights> {
        let artifact = Self::read(path)?;
        anyhow::ensure!(
            &artifact.chosen == expected,
            "Artifact layers {:?} do not match requested layers {:?}",
            artifact.chosen.indices(),
            expected.indices()
        );
        debug!("Loaded learned weights from {}", path.display());
        Ok(artifact.weights)
    }
}

//! Offline calibration of learned layer weights
//!
//! Streams a labeled dataset, teacher-forces each target continuation through
//! the model, and records one feature row per forced step:
//!
//! - features: the logit each chosen layer assigns to the correct next token
//! - target: the final-layer logit for that same token
//!
//! A ridge fit over the rows gives the mixing weights, which are clipped to be
//! non-negative, normalized, and saved together with the chosen layers.
//!
//! ## Usage
//!
//! ```ignore
//! use sled_decode::{CalibrationConfig, Calibrator, SledModel};
//!
//! let model = SledModel::from_pretrained("Qwen/Qwen2.5-0.5B-Instruct")?;
//! let calibrator = Calibrator::new(model.backend(), model.tokenizer())?;
//! let report = calibrator.fit(&CalibrationConfig::default());
//! println!("{}", serde_json::to_string_pretty(&report)?);
//! ```

use std::path::PathBuf;

use anyhow::{Context, Result};
use candle_core::{DType, IndexOp};
use ndarray::{Array1, Array2};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::artifact::CalibrationArtifact;
use crate::codec::TokenCodec;
use crate::combine::MixingWeights;
use crate::dataset::{CalibrationItem, DatasetReader};
use crate::layers::{select_layers, ChosenLayers, LayerStrategy};
use crate::model::SledBackend;
use crate::projector::LayerProjector;
use crate::ridge::ridge_solve;

/// Text fed once to discover the model's layer count
const PROBE_TEXT: &str = "hi";

/// Settings for one calibration run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CalibrationConfig {
    pub dataset_path: PathBuf,
    pub layers: LayerStrategy,
    pub k: usize,
    /// L2 penalty on the normal equations
    pub ridge_alpha: f64,
    /// Stop after this many items contributed rows
    pub max_items: usize,
    /// Forced steps per item
    pub max_new_tokens_per_item: usize,
    pub out_path: PathBuf,
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            dataset_path: PathBuf::from("eval/items.jsonl"),
            layers: LayerStrategy::LastK,
            k: 8,
            ridge_alpha: 1.0,
            max_items: 200,
            max_new_tokens_per_item: 32,
            out_path: PathBuf::from("sled_weights.safetensors"),
        }
    }
}

/// Outcome of [`Calibrator::fit`]; failures are reported here, never raised
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CalibrationReport {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub k: Option<usize>,
    pub items_used: usize,
    pub items_skipped: usize,
    pub steps_collected: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chosen_indices: Option<ChosenLayers>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub weights: Option<MixingWeights>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub out_path: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl CalibrationReport {
    fn failed(error: impl Into<String>) -> Self {
        Self {
            ok: false,
            error: Some(error.into()),
            ..Self::default()
        }
    }
}

/// One forced decode step
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureRow {
    /// Logit of the correct token at each chosen layer
    pub layer_logits: Vec<f32>,
    /// Final-layer logit of the same token
    pub baseline_logit: f32,
}

/// Fits mixing weights against one backend and codec
pub struct Calibrator<'m> {
    backend: &'m dyn SledBackend,
    codec: &'m dyn TokenCodec,
    projector: LayerProjector<'m>,
}

impl<'m> Calibrator<'m> {
    /// Fails if the backend exposes no output head
    pub fn new(backend: &'m dyn SledBackend, codec: &'m dyn TokenCodec) -> Result<Self> {
        Ok(Self {
            backend,
            codec,
            projector: LayerProjector::new(backend)?,
        })
    }

    /// Run calibration and persist the artifact on success
    ///
    /// An item whose forward pass fails is logged, counted in `items_skipped`,
    /// and passed over. Setup failures (layer probe, unreadable dataset, no
    /// usable rows) come back as `ok: false` with a message. No artifact is
    /// written unless the fit succeeds.
    pub fn fit(&self, config: &CalibrationConfig) -> CalibrationReport {
        match self.try_fit(config) {
            Ok(report) => report,
            Err(e) => {
                warn!("Calibration failed: {e:#}");
                CalibrationReport::failed(format!("{e:#}"))
            }
        }
    }

    fn try_fit(&self, config: &CalibrationConfig) -> Result<CalibrationReport> {
        let total_layers = self.probe_layers()?;
        let chosen = select_layers(total_layers, config.layers, config.k);
        if chosen.is_empty() {
            return Ok(CalibrationReport::failed("No layers selected for calibration."));
        }
        let k = chosen.len();
        info!(
            "Calibrating {k} layers {:?} from {}",
            chosen.indices(),
            config.dataset_path.display()
        );

        let mut reader = DatasetReader::open(&config.dataset_path)?;
        let mut features: Vec<f64> = Vec::new();
        let mut targets: Vec<f64> = Vec::new();
        let mut items_used = 0usize;
        let mut rejected_items = 0usize;

        for item in reader.by_ref() {
            let item = item?;
            let rows =
                match self.collect_item_features(&item, &chosen, config.max_new_tokens_per_item) {
                    Ok(rows) if !rows.is_empty() => rows,
                    Ok(_) => {
                        rejected_items += 1;
                        continue;
                    }
                    Err(e) => {
                        warn!("Failed to collect features for item {:?}: {e:#}", item.prompt);
                        rejected_items += 1;
                        continue;
                    }
                };
            for row in &rows {
                features.extend(row.layer_logits.iter().map(|&v| f64::from(v)));
                targets.push(f64::from(row.baseline_logit));
            }
            items_used += 1;
            if items_used >= config.max_items.max(1) {
                break;
            }
        }
        let items_skipped = reader.skipped() + rejected_items;

        if targets.is_empty() {
            return Ok(CalibrationReport {
                items_skipped,
                ..CalibrationReport::failed("No usable calibration items found.")
            });
        }

        let steps = targets.len();
        let x = Array2::from_shape_vec((steps, k), features)
            .context("Failed to create feature matrix")?;
        let y = Array1::from(targets);
        let solved = ridge_solve(&x, &y, config.ridge_alpha)?;
        debug!("Raw ridge weights: {solved:?}");

        let raw: Vec<f32> = solved.iter().map(|&w| w as f32).collect();
        let weights = MixingWeights::from_raw(&raw);
        CalibrationArtifact::new(weights.clone(), chosen.clone(), config.layers)?
            .save(&config.out_path)?;

        info!("Calibration used {items_used} items, {steps} steps, skipped {items_skipped}");
        Ok(CalibrationReport {
            ok: true,
            k: Some(k),
            items_used,
            items_skipped,
            steps_collected: steps,
            chosen_indices: Some(chosen),
            weights: Some(weights),
            out_path: Some(config.out_path.clone()),
            error: None,
        })
    }

    /// Layer count from one forward pass over a short probe text
    fn probe_layers(&self) -> Result<usize> {
        let ids = self.codec.encode(PROBE_TEXT)?;
        anyhow::ensure!(!ids.is_empty(), "Probe text encodes to zero tokens");
        let mut cache = self.backend.new_kv_cache();
        let out = self.backend.forward_step(&ids, &mut cache, true)?;
        let hidden = out
            .hidden_states
            .ok_or_else(|| anyhow::anyhow!("Backend did not return hidden states"))?;
        Ok(hidden.n_layers())
    }

    /// Teacher-force `item.target` after `item.prompt`, one row per step
    ///
    /// The token fed back at each step is always the target's next token, even
    /// where the model would have predicted something else; rows describe how
    /// each layer scores the reference continuation. Target tokens are the
    /// ids of `prompt + target` past the prompt's own length, capped at
    /// `max_steps`. Returns no rows when the target adds no tokens.
    pub fn collect_item_features(
        &self,
        item: &CalibrationItem,
        chosen: &ChosenLayers,
        max_steps: usize,
    ) -> Result<Vec<FeatureRow>> {
        let prompt_ids = self.codec.encode(&item.prompt)?;
        if prompt_ids.is_empty() {
            return Ok(Vec::new());
        }
        let full_ids = self.codec.encode(&format!("{}{}", item.prompt, item.target))?;
        let target_ids: Vec<u32> = full_ids
            .get(prompt_ids.len()..)
            .unwrap_or_default()
            .iter()
            .take(max_steps)
            .copied()
            .collect();
        if target_ids.is_empty() {
            return Ok(Vec::new());
        }

        let mut cache = self.backend.new_kv_cache();
        let mut input = prompt_ids;
        let mut rows = Vec::with_capacity(target_ids.len());

        for &correct in &target_ids {
            let out = self.backend.forward_step(&input, &mut cache, true)?;
            let hidden = out
                .hidden_states
                .ok_or_else(|| anyhow::anyhow!("Backend did not return hidden states"))?;

            let layer_logits = self.projector.project_token(&hidden, chosen, correct)?;
            let baseline_logit = out
                .logits
                .i(correct as usize)?
                .to_dtype(DType::F32)?
                .to_scalar::<f32>()?;
            rows.push(FeatureRow {
                layer_logits,
                baseline_logit,
            });

            input = vec![correct];
        }
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = CalibrationConfig::default();
        assert_eq!(config.k, 8);
        assert_eq!(config.max_items, 200);
        assert_eq!(config.max_new_tokens_per_item, 32);
        assert!((config.ridge_alpha - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_failed_report_serializes_without_optionals() {
        let report = CalibrationReport::failed("No usable calibration items found.");
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["ok"], false);
        assert_eq!(json["error"], "No usable calibration items found.");
        assert!(json.get("k").is_none());
        assert!(json.get("weights").is_none());
    }
}

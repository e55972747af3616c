//! Decode loops: baseline (final-layer logits) and multi-layer blended
//!
//! Both loops share one shape. The prompt is encoded and fed once, then each
//! step samples a token, appends it, checks the stopping rules, and feeds only
//! that token back with the carried KV-cache.
//!
//! The multi-layer loop additionally asks the backend for its hidden stack on
//! every step, projects the chosen layers to vocabulary logits, and blends them
//! before sampling. Layer selection and mixing weights are resolved once, after
//! the prompt forward, and stay fixed for the whole request.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::artifact::CalibrationArtifact;
use crate::codec::TokenCodec;
use crate::combine::{resolve_weights, weighted_sum, ResolvedWeights, Weighting};
use crate::hidden_states::HiddenStates;
use crate::kv_cache::KvCache;
use crate::layers::{select_layers, ChosenLayers, LayerStrategy};
use crate::model::{SledBackend, StepOutput};
use crate::projector::LayerProjector;
use crate::sampler::NucleusSampler;

/// Reported when `learned` weighting was requested but could not be applied
pub const LEARNED_FALLBACK_INFO: &str = "learned_missing_fallback_uniform";

/// Sampling and length parameters for one request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationConfig {
    pub max_new_tokens: usize,
    /// `<= 0` means greedy
    pub temperature: f32,
    pub top_p: f32,
    /// Fixed RNG seed for reproducible sampling
    pub seed: Option<u64>,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            max_new_tokens: 256,
            temperature: 0.7,
            top_p: 0.95,
            seed: None,
        }
    }
}

/// Multi-layer settings: which layers, how to weigh them, where learned weights live
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SledConfig {
    pub layers: LayerStrategy,
    pub k: usize,
    pub weighting: Weighting,
    pub weights_path: PathBuf,
}

impl Default for SledConfig {
    fn default() -> Self {
        Self {
            layers: LayerStrategy::LastK,
            k: 8,
            weighting: Weighting::Uniform,
            weights_path: PathBuf::from("sled_weights.safetensors"),
        }
    }
}

/// Why a decode loop stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    EndOfSequence,
    MaxNewTokens,
    Cancelled,
}

/// Mutable state of one in-flight request
///
/// Owned by a single call; never shared between requests.
#[derive(Debug)]
pub struct DecodeState {
    cache: KvCache,
    output_ids: Vec<u32>,
    step: usize,
}

impl DecodeState {
    pub fn new(cache: KvCache) -> Self {
        Self {
            cache,
            output_ids: Vec::new(),
            step: 0,
        }
    }

    pub fn cache_mut(&mut self) -> &mut KvCache {
        &mut self.cache
    }

    /// Completion ids so far (prompt excluded)
    pub fn output_ids(&self) -> &[u32] {
        &self.output_ids
    }

    pub fn step(&self) -> usize {
        self.step
    }

    fn push(&mut self, token: u32) {
        self.output_ids.push(token);
        self.step += 1;
    }

    fn into_output_ids(self) -> Vec<u32> {
        self.output_ids
    }
}

/// Decoded completion
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Generation {
    pub text: String,
    /// Generated ids, including the end-of-sequence id if one was sampled
    pub completion_ids: Vec<u32>,
    pub stop_reason: StopReason,
}

impl Generation {
    pub fn tokens_generated(&self) -> usize {
        self.completion_ids.len()
    }
}

/// What the multi-layer loop actually did; always returned on success
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SledMetadata {
    pub layers: LayerStrategy,
    /// Effective number of blended layers
    pub k: usize,
    pub chosen_indices: ChosenLayers,
    pub weighting_requested: Weighting,
    pub weighting_applied: Weighting,
    pub weights_info: String,
    /// Artifact path, set only when learned weights were applied
    pub weights_path: Option<PathBuf>,
    pub tokens_generated: usize,
    pub stop_reason: StopReason,
}

/// Drives generation against a backend and codec
///
/// Both are borrowed for the decoder's lifetime; per-request state lives in a
/// fresh [`DecodeState`] on each call.
pub struct Decoder<'m> {
    backend: &'m dyn SledBackend,
    codec: &'m dyn TokenCodec,
    cancel: Option<Arc<AtomicBool>>,
}

impl<'m> Decoder<'m> {
    pub fn new(backend: &'m dyn SledBackend, codec: &'m dyn TokenCodec) -> Self {
        Self {
            backend,
            codec,
            cancel: None,
        }
    }

    /// Stop cooperatively between steps once `flag` is set
    pub fn with_cancel(mut self, flag: Arc<AtomicBool>) -> Self {
        self.cancel = Some(flag);
        self
    }

    fn cancelled(&self) -> bool {
        self.cancel
            .as_ref()
            .is_some_and(|flag| flag.load(Ordering::Relaxed))
    }

    fn encode_prompt(&self, prompt: &str) -> Result<Vec<u32>> {
        let ids = self.codec.encode(prompt)?;
        anyhow::ensure!(!ids.is_empty(), "Prompt encodes to zero tokens");
        Ok(ids)
    }

    /// Shared stopping rule after a token has been appended
    fn stop_after(
        &self,
        state: &DecodeState,
        token: u32,
        config: &GenerationConfig,
    ) -> Option<StopReason> {
        if self.codec.eos_token_id() == Some(token) {
            Some(StopReason::EndOfSequence)
        } else if state.output_ids().len() >= config.max_new_tokens {
            Some(StopReason::MaxNewTokens)
        } else {
            None
        }
    }

    fn finish(&self, state: DecodeState, stop_reason: StopReason) -> Result<Generation> {
        debug!(
            "Decode stopped after {} steps ({stop_reason:?}), KV-cache {} bytes",
            state.step(),
            state.cache.memory_usage()
        );
        let completion_ids = state.into_output_ids();
        let text = self.codec.decode(&completion_ids)?;
        Ok(Generation {
            text,
            completion_ids,
            stop_reason,
        })
    }

    /// Sample directly from the model's final-layer logits
    pub fn generate_baseline(&self, prompt: &str, config: &GenerationConfig) -> Result<Generation> {
        let prompt_ids = self.encode_prompt(prompt)?;
        let mut state = DecodeState::new(self.backend.new_kv_cache());
        let mut sampler = NucleusSampler::new(config.temperature, config.top_p, config.seed);

        debug!(
            "Baseline decode: {} prompt tokens, max_new_tokens={}",
            prompt_ids.len(),
            config.max_new_tokens
        );

        if config.max_new_tokens == 0 {
            return self.finish(state, StopReason::MaxNewTokens);
        }

        let mut input = prompt_ids;
        let stop_reason = loop {
            if self.cancelled() {
                break StopReason::Cancelled;
            }
            let out = self.backend.forward_step(&input, state.cache_mut(), false)?;
            let token = sampler.sample(&out.logits)?;
            state.push(token);
            if let Some(reason) = self.stop_after(&state, token, config) {
                break reason;
            }
            input = vec![token];
        };

        self.finish(state, stop_reason)
    }

    /// Blend logits from several layers at every step
    ///
    /// Fails up front if the backend has no output head. A `learned` request
    /// whose artifact is missing or was fit on other layers decodes with uniform
    /// weights and says so in the metadata.
    pub fn generate_sled(
        &self,
        prompt: &str,
        config: &GenerationConfig,
        sled: &SledConfig,
    ) -> Result<(Generation, SledMetadata)> {
        let projector = LayerProjector::new(self.backend)?;
        let prompt_ids = self.encode_prompt(prompt)?;
        let mut state = DecodeState::new(self.backend.new_kv_cache());
        let mut sampler = NucleusSampler::new(config.temperature, config.top_p, config.seed);

        let out = self.backend.forward_step(&prompt_ids, state.cache_mut(), true)?;
        let mut hidden = require_hidden(out)?;
        let total_layers = hidden.n_layers();
        anyhow::ensure!(total_layers > 0, "Model returned no transformer layers");

        let chosen = select_layers(total_layers, sled.layers, sled.k);
        let resolved = self.resolve_for(&chosen, sled);
        info!(
            "SLED decode: layers={:?} weighting={} (requested {})",
            chosen.indices(),
            resolved.applied,
            resolved.requested
        );

        let stop_reason = if config.max_new_tokens == 0 {
            StopReason::MaxNewTokens
        } else {
            loop {
                if self.cancelled() {
                    break StopReason::Cancelled;
                }
                let layer_logits = projector.project(&hidden, &chosen)?;
                let blended = weighted_sum(&layer_logits, &resolved.weights)?;
                let token = sampler.sample(&blended)?;
                state.push(token);
                if let Some(reason) = self.stop_after(&state, token, config) {
                    break reason;
                }
                let out = self.backend.forward_step(&[token], state.cache_mut(), true)?;
                hidden = require_hidden(out)?;
            }
        };

        let generation = self.finish(state, stop_reason)?;
        let metadata = SledMetadata {
            layers: sled.layers,
            k: chosen.len(),
            chosen_indices: chosen,
            weighting_requested: resolved.requested,
            weighting_applied: resolved.applied,
            weights_info: weights_info(&resolved),
            weights_path: (resolved.applied == Weighting::Learned)
                .then(|| sled.weights_path.clone()),
            tokens_generated: generation.tokens_generated(),
            stop_reason,
        };
        Ok((generation, metadata))
    }

    fn resolve_for(&self, chosen: &ChosenLayers, sled: &SledConfig) -> ResolvedWeights {
        let learned = if sled.weighting == Weighting::Learned {
            match CalibrationArtifact::load_for(&sled.weights_path, chosen) {
                Ok(weights) => Some(weights),
                Err(e) => {
                    warn!(
                        "Learned weights unavailable ({}): {e:#}; using uniform",
                        sled.weights_path.display()
                    );
                    None
                }
            }
        } else {
            None
        };
        resolve_weights(sled.weighting, chosen.len(), learned.as_ref())
    }
}

fn require_hidden(out: StepOutput) -> Result<HiddenStates> {
    out.hidden_states
        .ok_or_else(|| anyhow::anyhow!("Backend did not return hidden states"))
}

fn weights_info(resolved: &ResolvedWeights) -> String {
    if resolved.fell_back() {
        LEARNED_FALLBACK_INFO.to_string()
    } else {
        resolved.applied.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generation_config_defaults() {
        let config = GenerationConfig::default();
        assert_eq!(config.max_new_tokens, 256);
        assert!((config.temperature - 0.7).abs() < 1e-6);
        assert!((config.top_p - 0.95).abs() < 1e-6);
        assert_eq!(config.seed, None);
    }

    #[test]
    fn test_sled_config_partial_json() {
        let config: SledConfig =
            serde_json::from_str(r#"{"k": 4, "weighting": "depth_softmax"}"#).unwrap();
        assert_eq!(config.k, 4);
        assert_eq!(config.weighting, Weighting::DepthSoftmax);
        assert_eq!(config.layers, LayerStrategy::LastK);
        assert_eq!(config.weights_path, PathBuf::from("sled_weights.safetensors"));
    }

    #[test]
    fn test_weights_info_labels() {
        let fell_back = resolve_weights(Weighting::Learned, 3, None);
        assert_eq!(weights_info(&fell_back), LEARNED_FALLBACK_INFO);

        let depth = resolve_weights(Weighting::DepthSoftmax, 3, None);
        assert_eq!(weights_info(&depth), "depth_softmax");
    }

    #[test]
    fn test_stop_reason_serializes_snake_case() {
        let json = serde_json::to_string(&StopReason::EndOfSequence).unwrap();
        assert_eq!(json, "\"end_of_sequence\"");
    }

    #[test]
    fn test_decode_state_counts_steps() {
        let mut state = DecodeState::new(KvCache::new(1));
        state.push(5);
        state.push(6);
        assert_eq!(state.step(), 2);
        assert_eq!(state.output_ids(), &[5, 6]);
    }
}

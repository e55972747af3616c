//! Deterministic toy model and codec for driving the engine without downloads
//!
//! The toy "model" always predicts the successor token: token `t` embeds as the
//! one-hot vector of `(t + 1) % VOCAB`, and transformer layer `i` scales that
//! vector by `i + 1`. The output head is the identity, so layer `i` gives the
//! successor a logit of `i + 1` and every other token 0.

#![allow(dead_code)]

use anyhow::Result;
use candle_core::{DType, Device, Module, Tensor};
use candle_nn::Linear;
use sled_decode::{HiddenStates, KvCache, SledBackend, StepOutput, TokenCodec};

pub const VOCAB: usize = 8;
pub const LAYERS: usize = 3;
pub const EOS: u32 = (VOCAB - 1) as u32;

pub struct ToyBackend {
    head: Option<Linear>,
    device: Device,
    /// Longest sequence the cache may hold, like a position-embedding limit
    max_positions: Option<usize>,
}

impl ToyBackend {
    pub fn new() -> Self {
        let device = Device::Cpu;
        let mut identity = vec![0f32; VOCAB * VOCAB];
        for i in 0..VOCAB {
            identity[i * VOCAB + i] = 1.0;
        }
        let eye = Tensor::from_vec(identity, (VOCAB, VOCAB), &device).unwrap();
        Self {
            head: Some(Linear::new(eye, None)),
            device,
            max_positions: None,
        }
    }

    /// Backend that errors once a request grows past `max_positions`
    pub fn with_max_positions(max_positions: usize) -> Self {
        Self {
            max_positions: Some(max_positions),
            ..Self::new()
        }
    }

    /// Backend that cannot project intermediate layers
    pub fn headless() -> Self {
        Self {
            head: None,
            device: Device::Cpu,
            max_positions: None,
        }
    }

    fn embed(&self, input_ids: &[u32]) -> Result<Tensor> {
        let mut data = vec![0f32; input_ids.len() * VOCAB];
        for (pos, &id) in input_ids.iter().enumerate() {
            data[pos * VOCAB + (id as usize + 1) % VOCAB] = 1.0;
        }
        Ok(Tensor::from_vec(data, (input_ids.len(), VOCAB), &self.device)?)
    }
}

impl SledBackend for ToyBackend {
    fn n_layers(&self) -> usize {
        LAYERS
    }

    fn d_model(&self) -> usize {
        VOCAB
    }

    fn vocab_size(&self) -> usize {
        VOCAB
    }

    fn new_kv_cache(&self) -> KvCache {
        KvCache::new(1)
    }

    fn forward_step(
        &self,
        input_ids: &[u32],
        kv_cache: &mut KvCache,
        output_hidden_states: bool,
    ) -> Result<StepOutput> {
        anyhow::ensure!(!input_ids.is_empty(), "empty input");
        let seq = input_ids.len();
        if let Some(max) = self.max_positions {
            anyhow::ensure!(
                kv_cache.seq_len() + seq <= max,
                "position out of range: {} > {max}",
                kv_cache.seq_len() + seq
            );
        }
        let marker = Tensor::zeros((1, 1, seq, 1), DType::F32, &self.device)?;
        kv_cache.append(0, &marker, &marker)?;

        let emb = self.embed(input_ids)?;
        let mut hidden = HiddenStates::with_capacity(LAYERS);
        hidden.push(emb.clone());
        for layer in 0..LAYERS {
            hidden.push((&emb * (layer as f64 + 1.0))?);
        }

        let logits = hidden.last_token(LAYERS - 1)?.squeeze(0)?;
        Ok(StepOutput {
            logits,
            hidden_states: output_hidden_states.then_some(hidden),
        })
    }

    fn output_head(&self) -> Option<&dyn Module> {
        self.head.as_ref().map(|h| h as &dyn Module)
    }
}

/// Whitespace-separated ids; words that are not numbers encode as 0
pub struct ToyCodec {
    pub eos: Option<u32>,
}

impl ToyCodec {
    pub fn new() -> Self {
        Self { eos: Some(EOS) }
    }
}

impl TokenCodec for ToyCodec {
    fn encode(&self, text: &str) -> Result<Vec<u32>> {
        Ok(text
            .split_whitespace()
            .map(|word| word.parse::<u32>().unwrap_or(0) % VOCAB as u32)
            .collect())
    }

    fn decode(&self, ids: &[u32]) -> Result<String> {
        Ok(ids
            .iter()
            .filter(|&&id| Some(id) != self.eos)
            .map(u32::to_string)
            .collect::<Vec<_>>()
            .join(" "))
    }

    fn eos_token_id(&self) -> Option<u32> {
        self.eos
    }
}

/// Write `lines` as a JSONL file inside `dir`
pub fn write_dataset(dir: &std::path::Path, lines: &[&str]) -> std::path::PathBuf {
    let path = dir.join("items.jsonl");
    std::fs::write(&path, lines.join("\n")).unwrap();
    path
}

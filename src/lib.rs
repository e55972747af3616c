// Pedantic clippy configuration for ML/math codebase
#![allow(clippy::cast_precision_loss)] // usize→f32/f64 intentional in ML
#![allow(clippy::cast_possible_truncation)] // usize→u32 token ids, f64→f32 weights
#![allow(clippy::cast_possible_wrap)] // usize→i64 in tensor ops
#![allow(clippy::cast_sign_loss)] // f64→usize when value is known positive
#![allow(clippy::many_single_char_names)] // x, y, a, b, w standard in math
#![allow(clippy::similar_names)] // related variables like `mkp`/`mkq`
#![allow(clippy::module_name_repetitions)] // SledModel in model.rs is fine
#![allow(clippy::doc_markdown)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::return_self_not_must_use)]

//! sled-decode: multi-layer blended decoding for causal language models
//!
//! Instead of sampling only from the final layer, each step projects several
//! intermediate layers to vocabulary logits and blends them. Blend weights are
//! uniform, depth-weighted, or learned offline by ridge regression.
//!
//! ## Architecture
//!
//! - `model`: backend contract (`SledBackend`) and `SledModel` loader
//! - `forward_llama`: LLaMA / Qwen2 / Mistral forward pass with hidden-state capture
//! - `kv_cache`: per-request KV-cache handle
//! - `masks`: causal masks for cached attention
//! - `codec`: tokenizer contract and `tokenizers`-backed implementation
//! - `hidden_states`: per-step residual stack (embedding + each layer)
//! - `layers`: which layers to blend
//! - `projector`: intermediate layers to vocabulary logits
//! - `combine`: weighting policies and the weighted sum
//! - `sampler`: greedy and nucleus sampling
//! - `decode`: baseline and multi-layer decode loops
//! - `dataset`: JSONL calibration items
//! - `ridge`: ridge regression solve
//! - `calibrate`: learned weights from teacher-forced features
//! - `artifact`: safetensors persistence of learned weights
//! - `service`: JSON request handling for the `serve` command

pub mod artifact;
pub mod calibrate;
pub mod codec;
pub mod combine;
pub mod dataset;
pub mod decode;
pub mod forward_llama;
pub mod hidden_states;
pub mod kv_cache;
pub mod layers;
pub mod masks;
pub mod model;
pub mod projector;
pub mod ridge;
pub mod sampler;
pub mod service;

pub use artifact::CalibrationArtifact;
pub use calibrate::{CalibrationConfig, CalibrationReport, Calibrator, FeatureRow};
pub use codec::{SledTokenizer, TokenCodec};
pub use combine::{
    combine, resolve_weights, weighted_sum, Combined, MixingWeights, ResolvedWeights, Weighting,
};
pub use dataset::{CalibrationItem, DatasetReader};
pub use decode::{
    DecodeState, Decoder, Generation, GenerationConfig, SledConfig, SledMetadata, StopReason,
    LEARNED_FALLBACK_INFO,
};
pub use forward_llama::SledLlama;
pub use hidden_states::HiddenStates;
pub use kv_cache::KvCache;
pub use layers::{select_layers, ChosenLayers, LayerStrategy};
pub use masks::create_generation_mask;
pub use model::{ModelArchitecture, ModelFiles, SledBackend, SledModel, StepOutput};
pub use projector::LayerProjector;
pub use ridge::ridge_solve;
pub use sampler::{sample, NucleusSampler};
pub use service::{
    CalibrateRequest, Envelope, GenerateArgs, GenerateData, GenerateMeta, GenerateMode,
    GenerateRequest, ServiceRequest, SledService,
};

//! Request handling for the `serve` command
//!
//! Wraps the decode loops and the calibrator behind JSON request/response
//! types. Every response is an envelope `{ok, data, error}`; handlers never
//! return errors to the caller. The service owns the live [`SledConfig`], which
//! a successful calibration updates so later multi-layer requests use the new
//! layers and weights.
//!
//! ## Wire format
//!
//! One JSON request per input line, tagged by `op`:
//!
//! ```json
//! {"op": "generate", "mode": "sled", "prompt": "Q: 2+2?\nA:", "gen_args": {"max_new_tokens": 16}}
//! {"op": "calibrate", "path": "eval/items.jsonl", "k": 4, "weighting": "learned"}
//! ```
//!
//! and one JSON response per output line.

use std::io::{BufRead, Write};
use std::path::PathBuf;
use std::time::Instant;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::calibrate::{CalibrationConfig, CalibrationReport, Calibrator};
use crate::codec::TokenCodec;
use crate::combine::Weighting;
use crate::decode::{Decoder, GenerationConfig, SledConfig, SledMetadata, StopReason};
use crate::layers::LayerStrategy;
use crate::model::SledBackend;

/// Which decode loop serves a generate request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GenerateMode {
    Baseline,
    #[default]
    Sled,
}

/// Sampling arguments of a generate request
///
/// Accepts every [`GenerationConfig`] field plus an optional `weights_path`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct GenerateArgs {
    #[serde(flatten)]
    pub config: GenerationConfig,
    pub weights_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct GenerateRequest {
    pub mode: GenerateMode,
    pub prompt: String,
    pub gen_args: GenerateArgs,
    /// Overrides the configured artifact path for this request only; takes
    /// precedence over `gen_args.weights_path`
    pub weights_path: Option<PathBuf>,
}

impl GenerateRequest {
    /// Artifact override from the request, if any
    pub fn weights_override(&self) -> Option<&PathBuf> {
        self.weights_path
            .as_ref()
            .or(self.gen_args.weights_path.as_ref())
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct CalibrateRequest {
    pub path: Option<PathBuf>,
    pub out_path: Option<PathBuf>,
    pub layers: Option<LayerStrategy>,
    pub k: Option<usize>,
    /// Weighting to switch to after a successful fit
    pub weighting: Option<Weighting>,
    pub alpha: Option<f64>,
    pub max_items: Option<usize>,
    pub max_new_tokens: Option<usize>,
}

/// A request line, tagged by `op`
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ServiceRequest {
    Generate(GenerateRequest),
    Calibrate(CalibrateRequest),
}

/// Response envelope
#[derive(Debug, Clone, Serialize)]
pub struct Envelope<T> {
    pub ok: bool,
    pub data: Option<T>,
    pub error: Option<String>,
}

impl<T> Envelope<T> {
    pub fn success(data: T) -> Self {
        Self {
            ok: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            ok: false,
            data: None,
            error: Some(error.into()),
        }
    }
}

/// Per-mode metadata carried in a generate response
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum GenerateMeta {
    Sled(SledMetadata),
    Baseline {
        layers: Option<LayerStrategy>,
        weights_info: String,
        weights_path: Option<PathBuf>,
        tokens_generated: usize,
        stop_reason: StopReason,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct GenerateData {
    pub answer: String,
    pub used_mode: GenerateMode,
    #[serde(flatten)]
    pub meta: GenerateMeta,
    pub latency_s: f64,
}

/// Serves generate and calibrate requests against one loaded model
pub struct SledService<'m> {
    backend: &'m dyn SledBackend,
    codec: &'m dyn TokenCodec,
    config: SledConfig,
}

impl<'m> SledService<'m> {
    pub fn new(
        backend: &'m dyn SledBackend,
        codec: &'m dyn TokenCodec,
        config: SledConfig,
    ) -> Self {
        Self {
            backend,
            codec,
            config,
        }
    }

    /// Current multi-layer settings
    pub fn config(&self) -> &SledConfig {
        &self.config
    }

    pub fn handle_generate(&self, request: &GenerateRequest) -> Envelope<GenerateData> {
        if request.prompt.is_empty() {
            return Envelope::failure("Missing prompt");
        }

        let start = Instant::now();
        match self.generate(request) {
            Ok((answer, meta)) => {
                let latency_s = (start.elapsed().as_secs_f64() * 1000.0).round() / 1000.0;
                info!("generate mode={:?} latency_s={latency_s:.3}", request.mode);
                Envelope::success(GenerateData {
                    answer,
                    used_mode: request.mode,
                    meta,
                    latency_s,
                })
            }
            Err(e) => {
                warn!("generate failed: {e:#}");
                Envelope::failure(format!("{e:#}"))
            }
        }
    }

    fn generate(&self, request: &GenerateRequest) -> Result<(String, GenerateMeta)> {
        let decoder = Decoder::new(self.backend, self.codec);
        match request.mode {
            GenerateMode::Baseline => {
                let generation = decoder.generate_baseline(&request.prompt, &request.gen_args.config)?;
                let meta = GenerateMeta::Baseline {
                    layers: None,
                    weights_info: "n/a".to_string(),
                    weights_path: None,
                    tokens_generated: generation.tokens_generated(),
                    stop_reason: generation.stop_reason,
                };
                Ok((generation.text, meta))
            }
            GenerateMode::Sled => {
                let mut sled = self.config.clone();
                if let Some(path) = request.weights_override() {
                    sled.weights_path = path.clone();
                }
                let (generation, metadata) =
                    decoder.generate_sled(&request.prompt, &request.gen_args.config, &sled)?;
                Ok((generation.text, GenerateMeta::Sled(metadata)))
            }
        }
    }

    /// Fit weights; on success adopt the new layers, k and artifact path
    pub fn handle_calibrate(&mut self, request: &CalibrateRequest) -> Envelope<CalibrationReport> {
        let defaults = CalibrationConfig::default();
        let config = CalibrationConfig {
            dataset_path: request.path.clone().unwrap_or(defaults.dataset_path),
            layers: request.layers.unwrap_or(self.config.layers),
            k: request.k.unwrap_or(self.config.k),
            ridge_alpha: request.alpha.unwrap_or(defaults.ridge_alpha),
            max_items: request.max_items.unwrap_or(defaults.max_items),
            max_new_tokens_per_item: request
                .max_new_tokens
                .unwrap_or(defaults.max_new_tokens_per_item),
            out_path: request
                .out_path
                .clone()
                .unwrap_or_else(|| self.config.weights_path.clone()),
        };

        let calibrator = match Calibrator::new(self.backend, self.codec) {
            Ok(c) => c,
            Err(e) => return Envelope::failure(format!("{e:#}")),
        };
        let report = calibrator.fit(&config);
        info!("calibrate ok={}", report.ok);

        if !report.ok {
            let error = report.error.unwrap_or_else(|| "unknown".to_string());
            return Envelope::failure(error);
        }

        self.config.layers = config.layers;
        self.config.k = config.k;
        self.config.weights_path = config.out_path;
        if let Some(weighting) = request.weighting {
            self.config.weighting = weighting;
        }
        Envelope::success(report)
    }

    /// Handle one request line and return the response line
    pub fn handle_line(&mut self, line: &str) -> Result<String> {
        let response = match serde_json::from_str::<ServiceRequest>(line) {
            Ok(ServiceRequest::Generate(request)) => {
                serde_json::to_string(&self.handle_generate(&request))?
            }
            Ok(ServiceRequest::Calibrate(request)) => {
                serde_json::to_string(&self.handle_calibrate(&request))?
            }
            Err(e) => {
                serde_json::to_string(&Envelope::<()>::failure(format!("Invalid request: {e}")))?
            }
        };
        Ok(response)
    }

    /// Answer JSON-lines requests from `input` until it closes
    ///
    /// Requests are handled one at a time, so calibrations never overlap.
    pub fn serve<R: BufRead, W: Write>(&mut self, input: R, mut output: W) -> Result<()> {
        for line in input.lines() {
            let line = line.context("Failed to read request")?;
            if line.trim().is_empty() {
                continue;
            }
            let response = self.handle_line(&line)?;
            writeln!(output, "{response}").context("Failed to write response")?;
            output.flush()?;
        }
        Ok(())
    }
}

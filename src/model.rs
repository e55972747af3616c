//! Model oracle: the backend contract the decode loops and calibrator drive,
//! plus `SledModel`, which loads a concrete backend and its tokenizer.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use candle_core::{DType, Device, Module, Tensor};
use hf_hub::{api::sync::Api, Repo, RepoType};
use tracing::info;

use crate::codec::SledTokenizer;
use crate::forward_llama::SledLlama;
use crate::hidden_states::HiddenStates;
use crate::kv_cache::KvCache;

/// Supported model architectures
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelArchitecture {
    /// LLaMA / Code-LLaMA (Meta)
    Llama,
    /// Qwen2 / Qwen2.5 (Alibaba): bias on Q/K/V projections
    Qwen2,
    /// Mistral (Mistral AI)
    Mistral,
}

impl ModelArchitecture {
    /// Detect from the `model_type` field of `config.json`
    pub fn from_model_type(model_type: &str) -> Option<Self> {
        match model_type {
            "llama" => Some(ModelArchitecture::Llama),
            "qwen2" => Some(ModelArchitecture::Qwen2),
            "mistral" => Some(ModelArchitecture::Mistral),
            _ => None,
        }
    }

    /// Detect architecture from a model id or path
    pub fn from_model_id(model_id: &str) -> Self {
        let model_lower = model_id.to_lowercase();
        if model_lower.contains("qwen") {
            ModelArchitecture::Qwen2
        } else if model_lower.contains("mistral") {
            ModelArchitecture::Mistral
        } else if model_lower.contains("llama") {
            ModelArchitecture::Llama
        } else {
            info!(
                "Unknown model architecture for '{}', defaulting to Llama",
                model_id
            );
            ModelArchitecture::Llama
        }
    }

    /// Whether Q/K/V projections carry a bias by default
    pub fn qkv_bias(&self) -> bool {
        matches!(self, ModelArchitecture::Qwen2)
    }
}

/// Output of one incremental forward step
#[derive(Debug, Clone)]
pub struct StepOutput {
    /// Final-layer logits for the last input position, shape `(vocab_size,)`
    pub logits: Tensor,
    /// Full hidden-representation stack, present when requested
    pub hidden_states: Option<HiddenStates>,
}

/// Backend contract for multi-layer decoding.
///
/// A backend runs incremental forward steps over an opaque [`KvCache`], can dump
/// its hidden-representation stack on demand, and exposes the output head and
/// optional final norm so intermediate layers can be projected to vocabulary
/// space.
pub trait SledBackend {
    // --- Metadata ---
    fn n_layers(&self) -> usize;
    fn d_model(&self) -> usize;
    fn vocab_size(&self) -> usize;

    // --- Incremental forward ---
    fn new_kv_cache(&self) -> KvCache;

    /// Feed `input_ids` after whatever `kv_cache` already holds
    ///
    /// The first call of a request passes the whole prompt; later calls pass
    /// only the newest token.
    fn forward_step(
        &self,
        input_ids: &[u32],
        kv_cache: &mut KvCache,
        output_hidden_states: bool,
    ) -> Result<StepOutput>;

    // --- Projection ---

    /// Hidden -> vocabulary projection; `None` if the model has no usable head
    fn output_head(&self) -> Option<&dyn Module>;

    /// Normalization applied before the head, if the model has one
    fn final_norm(&self) -> Option<&dyn Module> {
        None
    }
}

/// Local paths of everything needed to load a model
#[derive(Debug, Clone)]
pub struct ModelFiles {
    pub config: PathBuf,
    pub tokenizer: PathBuf,
    pub weights: Vec<PathBuf>,
}

/// Safetensors index for sharded models
#[derive(Debug, serde::Deserialize)]
struct SafetensorsIndex {
    weight_map: std::collections::HashMap<String, String>,
}

fn shard_names(index_path: &Path) -> Result<Vec<String>> {
    let index_str = std::fs::read_to_string(index_path).context("Failed to read index")?;
    let index: SafetensorsIndex = serde_json::from_str(&index_str)?;
    let mut names: Vec<String> = index.weight_map.into_values().collect();
    names.sort();
    names.dedup();
    Ok(names)
}

impl ModelFiles {
    /// Resolve a local model directory or a HuggingFace model id
    ///
    /// Existing directories are used as-is with no network access.
    pub fn resolve(model: &str) -> Result<Self> {
        let path = Path::new(model);
        if path.is_dir() {
            Self::from_dir(path)
        } else {
            Self::from_hub(model)
        }
    }

    /// Load from a local directory (offline)
    pub fn from_dir(dir: &Path) -> Result<Self> {
        info!("Loading model files from {}", dir.display());
        let config = dir.join("config.json");
        anyhow::ensure!(config.is_file(), "Missing {}", config.display());
        let tokenizer = dir.join("tokenizer.json");
        anyhow::ensure!(tokenizer.is_file(), "Missing {}", tokenizer.display());

        let index_path = dir.join("model.safetensors.index.json");
        let weights = if index_path.is_file() {
            shard_names(&index_path)?
                .iter()
                .map(|name| dir.join(name))
                .collect()
        } else {
            vec![dir.join("model.safetensors")]
        };
        for path in &weights {
            anyhow::ensure!(path.is_file(), "Missing weights file {}", path.display());
        }

        Ok(Self {
            config,
            tokenizer,
            weights,
        })
    }

    /// Download (or reuse the local hub cache for) a HuggingFace model
    pub fn from_hub(model_id: &str) -> Result<Self> {
        info!("Fetching model files for {} from HuggingFace", model_id);
        let api = Api::new()?;
        let repo = api.repo(Repo::new(model_id.to_string(), RepoType::Model));

        let config = repo
            .get("config.json")
            .context("Failed to download config.json")?;
        let tokenizer = repo
            .get("tokenizer.json")
            .context("Failed to download tokenizer.json")?;

        let weights = if let Ok(index_path) = repo.get("model.safetensors.index.json") {
            let names = shard_names(&index_path)?;
            info!("Downloading {} shard files...", names.len());
            names
                .iter()
                .map(|name| {
                    repo.get(name)
                        .with_context(|| format!("Failed to download {name}"))
                })
                .collect::<Result<Vec<_>>>()?
        } else {
            vec![repo
                .get("model.safetensors")
                .context("Failed to download model.safetensors")?]
        };

        Ok(Self {
            config,
            tokenizer,
            weights,
        })
    }
}

#[derive(Debug, serde::Deserialize)]
struct ModelTypeProbe {
    model_type: Option<String>,
}

/// A loaded backend together with its tokenizer
pub struct SledModel {
    backend: Box<dyn SledBackend>,
    tokenizer: SledTokenizer,
    device: Device,
    architecture: ModelArchitecture,
    model_id: String,
}

impl SledModel {
    /// Load a model (tries CUDA, falls back to CPU)
    pub fn from_pretrained(model: &str) -> Result<Self> {
        Self::from_pretrained_with_device(model, None)
    }

    /// Load with explicit device choice (None = auto-detect)
    pub fn from_pretrained_with_device(model: &str, force_cpu: Option<bool>) -> Result<Self> {
        let (device, dtype) = if force_cpu == Some(true) {
            info!("Forcing CPU mode");
            (Device::Cpu, DType::F32)
        } else {
            match Device::cuda_if_available(0) {
                Ok(dev) if dev.is_cuda() => {
                    info!("Using CUDA device");
                    (dev, DType::BF16)
                }
                _ => {
                    info!("CUDA not available, using CPU");
                    (Device::Cpu, DType::F32)
                }
            }
        };

        let files = ModelFiles::resolve(model)?;

        let config_str =
            std::fs::read_to_string(&files.config).context("Failed to read config")?;
        let probe: ModelTypeProbe = serde_json::from_str(&config_str)?;
        let architecture = probe
            .model_type
            .as_deref()
            .and_then(ModelArchitecture::from_model_type)
            .unwrap_or_else(|| ModelArchitecture::from_model_id(model));

        info!("Loading model: {}", model);
        info!("Architecture: {:?}", architecture);
        info!("Device: {:?}", device);
        info!("Dtype: {:?}", dtype);

        let tokenizer = SledTokenizer::from_file(&files.tokenizer)?;
        let backend: Box<dyn SledBackend> =
            Box::new(SledLlama::load(&files, architecture, &device, dtype)?);

        Ok(Self {
            backend,
            tokenizer,
            device,
            architecture,
            model_id: model.to_string(),
        })
    }

    pub fn backend(&self) -> &dyn SledBackend {
        &*self.backend
    }

    pub fn tokenizer(&self) -> &SledTokenizer {
        &self.tokenizer
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn architecture(&self) -> ModelArchitecture {
        self.architecture
    }

    pub fn model_id(&self) -> &str {
        &self.model_id
    }

    pub fn n_layers(&self) -> usize {
        self.backend.n_layers()
    }

    pub fn d_model(&self) -> usize {
        self.backend.d_model()
    }

    pub fn vocab_size(&self) -> usize {
        self.backend.vocab_size()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_architecture_from_model_type() {
        assert_eq!(
            ModelArchitecture::from_model_type("qwen2"),
            Some(ModelArchitecture::Qwen2)
        );
        assert_eq!(
            ModelArchitecture::from_model_type("llama"),
            Some(ModelArchitecture::Llama)
        );
        assert_eq!(ModelArchitecture::from_model_type("gpt2"), None);
    }

    #[test]
    fn test_architecture_from_model_id() {
        assert_eq!(
            ModelArchitecture::from_model_id("Qwen/Qwen2.5-0.5B"),
            ModelArchitecture::Qwen2
        );
        assert_eq!(
            ModelArchitecture::from_model_id("mistralai/Mistral-7B-v0.1"),
            ModelArchitecture::Mistral
        );
        assert_eq!(
            ModelArchitecture::from_model_id("/models/unknown"),
            ModelArchitecture::Llama
        );
        assert!(ModelArchitecture::Qwen2.qkv_bias());
        assert!(!ModelArchitecture::Llama.qkv_bias());
    }

    #[test]
    fn test_model_files_missing_dir_contents() {
        let dir = tempfile::tempdir().unwrap();
        let err = ModelFiles::from_dir(dir.path()).unwrap_err();
        assert!(err.to_string().contains("config.json"));
    }
}

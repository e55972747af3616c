//! LLaMA-family forward pass with KV-cache and hidden-state capture
//!
//! Runs the decoder layer-by-layer so each step can hand back the residual
//! stream after every layer, alongside the usual final-layer logits.
//!
//! Covers the LLaMA, Qwen2 and Mistral checkpoints that share this layout:
//! - RMSNorm pre-norm blocks with SwiGLU MLP
//! - grouped-query attention with rotary position embeddings
//! - optional bias on Q/K/V (Qwen2)
//! - optional tied word embeddings (head = embedding matrix)

use anyhow::{Context, Result};
use candle_core::{DType, Device, Module, Tensor};
use candle_nn::{embedding, linear_b, linear_no_bias, Embedding, Linear, RmsNorm, VarBuilder};
use tracing::{debug, info};

use crate::hidden_states::HiddenStates;
use crate::kv_cache::KvCache;
use crate::masks::create_generation_mask;
use crate::model::{ModelArchitecture, ModelFiles, SledBackend, StepOutput};

/// Model configuration (subset of HuggingFace config.json)
#[derive(Debug, Clone, serde::Deserialize)]
pub struct LlamaConfig {
    pub hidden_size: usize,
    pub intermediate_size: usize,
    pub num_attention_heads: usize,
    pub num_key_value_heads: Option<usize>,
    pub num_hidden_layers: usize,
    pub vocab_size: usize,
    pub head_dim: Option<usize>,
    #[serde(default = "default_rope_theta")]
    pub rope_theta: f64,
    #[serde(default = "default_rms_norm_eps")]
    pub rms_norm_eps: f64,
    #[serde(default = "default_max_position_embeddings")]
    pub max_position_embeddings: usize,
    #[serde(default)]
    pub tie_word_embeddings: bool,
    pub attention_bias: Option<bool>,
}

fn default_rope_theta() -> f64 {
    10_000.0
}

fn default_rms_norm_eps() -> f64 {
    1e-5
}

fn default_max_position_embeddings() -> usize {
    4096
}

impl LlamaConfig {
    /// Falls back to multi-head attention when the checkpoint omits it
    fn num_kv_heads(&self) -> usize {
        self.num_key_value_heads.unwrap_or(self.num_attention_heads)
    }

    fn head_dim(&self) -> usize {
        self.head_dim
            .unwrap_or(self.hidden_size / self.num_attention_heads)
    }
}

/// Rotary Position Embeddings (RoPE), half-split layout
struct RotaryEmbedding {
    cos: Tensor,
    sin: Tensor,
}

impl RotaryEmbedding {
    /// Precompute cos/sin tables for every position up to `max_seq_len`
    fn new(
        dim: usize,
        max_seq_len: usize,
        theta: f64,
        device: &Device,
        dtype: DType,
    ) -> Result<Self> {
        let inv_freq: Vec<f32> = (0..dim)
            .step_by(2)
            .map(|i| (1.0 / theta.powf(i as f64 / dim as f64)) as f32)
            .collect();
        let inv_freq = Tensor::new(inv_freq, device)?;

        let positions: Vec<f32> = (0..max_seq_len).map(|i| i as f32).collect();
        let positions = Tensor::new(positions, device)?;

        // [seq_len, dim/2]
        let freqs = positions.unsqueeze(1)?.matmul(&inv_freq.unsqueeze(0)?)?;
        Ok(Self {
            cos: freqs.cos()?.to_dtype(dtype)?,
            sin: freqs.sin()?.to_dtype(dtype)?,
        })
    }

    /// Rotate `q` and `k` for positions `start_pos..start_pos + seq_len`
    fn apply(&self, q: &Tensor, k: &Tensor, start_pos: usize) -> Result<(Tensor, Tensor)> {
        let seq_len = q.dim(2)?;
        let cos = self.cos.narrow(0, start_pos, seq_len)?;
        let sin = self.sin.narrow(0, start_pos, seq_len)?;

        let q = candle_nn::rotary_emb::rope(&q.contiguous()?, &cos, &sin)?;
        let k = candle_nn::rotary_emb::rope(&k.contiguous()?, &cos, &sin)?;
        Ok((q, k))
    }
}

/// Repeat each KV head `n_rep` times so GQA keys line up with query heads
///
/// `[b, num_kv_heads, seq, head_dim]` -> `[b, num_kv_heads * n_rep, seq, head_dim]`
fn repeat_kv(x: Tensor, n_rep: usize) -> Result<Tensor> {
    if n_rep == 1 {
        return Ok(x);
    }
    let (b, num_kv_heads, seq_len, head_dim) = x.dims4()?;
    let x = x.unsqueeze(2)?;
    let x = x.expand((b, num_kv_heads, n_rep, seq_len, head_dim))?;
    Ok(x.reshape((b, num_kv_heads * n_rep, seq_len, head_dim))?)
}

/// Grouped-query self-attention over the KV-cache
struct Attention {
    q_proj: Linear,
    k_proj: Linear,
    v_proj: Linear,
    o_proj: Linear,
    num_heads: usize,
    num_kv_heads: usize,
    head_dim: usize,
}

impl Attention {
    fn load(vb: VarBuilder, config: &LlamaConfig, qkv_bias: bool) -> Result<Self> {
        let head_dim = config.head_dim();
        let num_heads = config.num_attention_heads;
        let num_kv_heads = config.num_kv_heads();

        let q_proj = linear_b(config.hidden_size, num_heads * head_dim, qkv_bias, vb.pp("q_proj"))?;
        let k_proj = linear_b(
            config.hidden_size,
            num_kv_heads * head_dim,
            qkv_bias,
            vb.pp("k_proj"),
        )?;
        let v_proj = linear_b(
            config.hidden_size,
            num_kv_heads * head_dim,
            qkv_bias,
            vb.pp("v_proj"),
        )?;
        let o_proj = linear_no_bias(num_heads * head_dim, config.hidden_size, vb.pp("o_proj"))?;

        Ok(Self {
            q_proj,
            k_proj,
            v_proj,
            o_proj,
            num_heads,
            num_kv_heads,
            head_dim,
        })
    }

    /// Returns the residual stream after this block, before any final norm
    fn forward(
        &self,
        x: &Tensor,
        rotary: &RotaryEmbedding,
        start_pos: usize,
        mask: &Tensor,
        kv_cache: &mut KvCache,
        layer_idx: usize,
    ) -> Result<Tensor> {
        let (b, seq_len, _) = x.dims3()?;

        let q = self
            .q_proj
            .forward(x)?
            .reshape((b, seq_len, self.num_heads, self.head_dim))?
            .transpose(1, 2)?;
        let k = self
            .k_proj
            .forward(x)?
            .reshape((b, seq_len, self.num_kv_heads, self.head_dim))?
            .transpose(1, 2)?;
        let v = self
            .v_proj
            .forward(x)?
            .reshape((b, seq_len, self.num_kv_heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()?;

        let (q, k) = rotary.apply(&q, &k, start_pos)?;
        let (k, v) = kv_cache.append(layer_idx, &k, &v)?;

        let n_rep = self.num_heads / self.num_kv_heads;
        let k = repeat_kv(k, n_rep)?.contiguous()?;
        let v = repeat_kv(v, n_rep)?.contiguous()?;

        let scale = 1.0 / (self.head_dim as f64).sqrt();
        let attn_weights = (q.matmul(&k.transpose(2, 3)?.contiguous()?)? * scale)?;
        let attn_weights = attn_weights.broadcast_add(mask)?;
        let attn_weights = candle_nn::ops::softmax_last_dim(&attn_weights)?;
        let attn_output = attn_weights.matmul(&v)?;

        let attn_output = attn_output.transpose(1, 2)?.reshape((b, seq_len, ()))?;
        Ok(self.o_proj.forward(&attn_output)?)
    }
}

/// SwiGLU MLP, no bias
#[allow(clippy::upper_case_acronyms)]
struct MLP {
    gate_proj: Linear,
    up_proj: Linear,
    down_proj: Linear,
}

impl MLP {
    fn load(vb: VarBuilder, config: &LlamaConfig) -> Result<Self> {
        Ok(Self {
            gate_proj: linear_no_bias(
                config.hidden_size,
                config.intermediate_size,
                vb.pp("gate_proj"),
            )?,
            up_proj: linear_no_bias(
                config.hidden_size,
                config.intermediate_size,
                vb.pp("up_proj"),
            )?,
            down_proj: linear_no_bias(
                config.intermediate_size,
                config.hidden_size,
                vb.pp("down_proj"),
            )?,
        })
    }

    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        // down(silu(gate(x)) * up(x))
        let gate = candle_nn::ops::silu(&self.gate_proj.forward(x)?)?;
        let up = self.up_proj.forward(x)?;
        Ok(self.down_proj.forward(&(gate * up)?)?)
    }
}

/// One pre-norm transformer block: attention then MLP, each with a residual add
struct DecoderLayer {
    self_attn: Attention,
    mlp: MLP,
    input_layernorm: RmsNorm,
    post_attention_layernorm: RmsNorm,
}

impl DecoderLayer {
    fn load(vb: VarBuilder, config: &LlamaConfig, qkv_bias: bool) -> Result<Self> {
        Ok(Self {
            self_attn: Attention::load(vb.pp("self_attn"), config, qkv_bias)?,
            mlp: MLP::load(vb.pp("mlp"), config)?,
            input_layernorm: candle_nn::rms_norm(
                config.hidden_size,
                config.rms_norm_eps,
                vb.pp("input_layernorm"),
            )?,
            post_attention_layernorm: candle_nn::rms_norm(
                config.hidden_size,
                config.rms_norm_eps,
                vb.pp("post_attention_layernorm"),
            )?,
        })
    }

    /// Returns the residual stream after this block, before any final norm
    fn forward(
        &self,
        x: &Tensor,
        rotary: &RotaryEmbedding,
        start_pos: usize,
        mask: &Tensor,
        kv_cache: &mut KvCache,
        layer_idx: usize,
    ) -> Result<Tensor> {
        let residual = x;
        let x = self.input_layernorm.forward(x)?;
        let x = self
            .self_attn
            .forward(&x, rotary, start_pos, mask, kv_cache, layer_idx)?;
        let x = (residual + x)?;

        let residual = &x;
        let x = self.post_attention_layernorm.forward(&x)?;
        let x = self.mlp.forward(&x)?;
        Ok((residual + x)?)
    }
}

/// LLaMA-family decoder exposing per-layer hidden states
pub struct SledLlama {
    embed_tokens: Embedding,
    layers: Vec<DecoderLayer>,
    norm: RmsNorm,
    /// Separate head, or the embedding matrix when weights are tied
    lm_head: Linear,
    rotary: RotaryEmbedding,
    device: Device,
    dtype: DType,
    /// Positions covered by the rotary tables
    max_positions: usize,
    n_layers: usize,
    hidden_size: usize,
    vocab_size: usize,
}

impl SledLlama {
    /// Load weights from resolved model files
    ///
    /// Q/K/V bias follows `attention_bias` in config.json when present,
    /// otherwise the architecture default (on for Qwen2).
    pub fn load(
        files: &ModelFiles,
        architecture: ModelArchitecture,
        device: &Device,
        dtype: DType,
    ) -> Result<Self> {
        let config_str =
            std::fs::read_to_string(&files.config).context("Failed to read config")?;
        let config: LlamaConfig = serde_json::from_str(&config_str)?;
        let qkv_bias = config
            .attention_bias
            .unwrap_or_else(|| architecture.qkv_bias());

        info!(
            "Model config: {} layers, {} hidden, {} vocab",
            config.num_hidden_layers, config.hidden_size, config.vocab_size
        );
        info!("Loading weights from {} file(s)...", files.weights.len());

        let vb = unsafe { VarBuilder::from_mmaped_safetensors(&files.weights, dtype, device)? };
        let vb_model = vb.pp("model");

        let embed_tokens = embedding(
            config.vocab_size,
            config.hidden_size,
            vb_model.pp("embed_tokens"),
        )?;

        let mut layers = Vec::with_capacity(config.num_hidden_layers);
        for i in 0..config.num_hidden_layers {
            if (i + 1) % 10 == 0 || i == 0 {
                info!("Loading layer {}/{}", i + 1, config.num_hidden_layers);
            }
            layers.push(DecoderLayer::load(
                vb_model.pp(format!("layers.{i}")),
                &config,
                qkv_bias,
            )?);
        }

        let norm =
            candle_nn::rms_norm(config.hidden_size, config.rms_norm_eps, vb_model.pp("norm"))?;

        let lm_head = if config.tie_word_embeddings {
            info!("Using tied embeddings as output head");
            Linear::new(embed_tokens.embeddings().clone(), None)
        } else {
            linear_no_bias(config.hidden_size, config.vocab_size, vb.pp("lm_head"))?
        };

        let rotary = RotaryEmbedding::new(
            config.head_dim(),
            config.max_position_embeddings,
            config.rope_theta,
            device,
            dtype,
        )?;

        info!(
            "Model loaded successfully with {} layers (vocab_size: {})",
            config.num_hidden_layers, config.vocab_size
        );

        Ok(Self {
            embed_tokens,
            layers,
            norm,
            lm_head,
            rotary,
            device: device.clone(),
            dtype,
            max_positions: config.max_position_embeddings,
            n_layers: config.num_hidden_layers,
            hidden_size: config.hidden_size,
            vocab_size: config.vocab_size,
        })
    }
}

impl SledBackend for SledLlama {
    fn n_layers(&self) -> usize {
        self.n_layers
    }

    fn d_model(&self) -> usize {
        self.hidden_size
    }

    fn vocab_size(&self) -> usize {
        self.vocab_size
    }

    fn new_kv_cache(&self) -> KvCache {
        KvCache::new(self.n_layers)
    }

    /// Feed `input_ids` after the cached positions
    ///
    /// Fails without touching the cache when the request would run past
    /// `max_position_embeddings`.
    fn forward_step(
        &self,
        input_ids: &[u32],
        kv_cache: &mut KvCache,
        output_hidden_states: bool,
    ) -> Result<StepOutput> {
        anyhow::ensure!(!input_ids.is_empty(), "forward_step called with no input ids");

        let seq_len = input_ids.len();
        let start_pos = kv_cache.seq_len();
        anyhow::ensure!(
            start_pos + seq_len <= self.max_positions,
            "Sequence of {} positions exceeds the model context of {}",
            start_pos + seq_len,
            self.max_positions
        );
        let input = Tensor::new(input_ids, &self.device)?.unsqueeze(0)?;
        let mask = create_generation_mask(
            seq_len,
            start_pos + seq_len,
            start_pos,
            &self.device,
            self.dtype,
        )?;

        let mut hidden = self.embed_tokens.forward(&input)?;
        let mut states = output_hidden_states.then(|| HiddenStates::with_capacity(self.n_layers));
        if let Some(states) = states.as_mut() {
            states.push(hidden.squeeze(0)?);
        }

        for (i, layer) in self.layers.iter().enumerate() {
            hidden = layer.forward(&hidden, &self.rotary, start_pos, &mask, kv_cache, i)?;
            if let Some(states) = states.as_mut() {
                states.push(hidden.squeeze(0)?);
            }
        }
        debug!(start_pos, seq_len, "forward step complete");

        // [1, d_model] for the last position
        let last_hidden = hidden.narrow(1, seq_len - 1, 1)?.squeeze(1)?;
        let logits = self
            .lm_head
            .forward(&self.norm.forward(&last_hidden)?)?
            .squeeze(0)?;

        Ok(StepOutput {
            logits,
            hidden_states: states,
        })
    }

    fn output_head(&self) -> Option<&dyn Module> {
        Some(&self.lm_head)
    }

    fn final_norm(&self) -> Option<&dyn Module> {
        Some(&self.norm)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config: LlamaConfig = serde_json::from_str(
            r#"{
                "hidden_size": 64,
                "intermediate_size": 128,
                "num_attention_heads": 4,
                "num_hidden_layers": 2,
                "vocab_size": 100
            }"#,
        )
        .unwrap();

        assert_eq!(config.num_kv_heads(), 4);
        assert_eq!(config.head_dim(), 16);
        assert!(!config.tie_word_embeddings);
        assert!(config.attention_bias.is_none());
        assert!((config.rope_theta - 10_000.0).abs() < 1e-9);
    }

    #[test]
    fn test_repeat_kv_expands_heads() {
        let x = Tensor::zeros((1, 2, 3, 4), DType::F32, &Device::Cpu).unwrap();
        let y = repeat_kv(x, 3).unwrap();
        assert_eq!(y.dims(), &[1, 6, 3, 4]);
    }

    #[test]
    fn test_rotary_position_zero_is_identity() {
        let rotary = RotaryEmbedding::new(4, 8, 10_000.0, &Device::Cpu, DType::F32).unwrap();
        let q = Tensor::new(&[[[[1f32, 2., 3., 4.]]]], &Device::Cpu).unwrap();
        let (q_rot, _) = rotary.apply(&q, &q, 0).unwrap();
        let before: Vec<f32> = q.flatten_all().unwrap().to_vec1().unwrap();
        let after: Vec<f32> = q_rot.flatten_all().unwrap().to_vec1().unwrap();
        for (a, b) in before.iter().zip(after.iter()) {
            assert!((a - b).abs() < 1e-6);
        }
    }
}

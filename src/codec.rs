//! Token codec: text <-> token ids

use std::path::Path;

use anyhow::Result;
use tokenizers::Tokenizer;

/// Encodes prompts and decodes completions for the decode loops
pub trait TokenCodec {
    fn encode(&self, text: &str) -> Result<Vec<u32>>;

    /// Decode ids to text, skipping special tokens
    fn decode(&self, ids: &[u32]) -> Result<String>;

    /// End-of-sequence id; `None` means generation stops on length only
    fn eos_token_id(&self) -> Option<u32>;
}

/// Special tokens tried, in order, when looking for an end-of-sequence id
const EOS_CANDIDATES: [&str; 5] = [
    "<|im_end|>",
    "<|endoftext|>",
    "</s>",
    "<end_of_turn>",
    "<|eot_id|>",
];

/// `tokenizers`-backed codec
pub struct SledTokenizer {
    tokenizer: Tokenizer,
    eos_token_id: Option<u32>,
}

impl SledTokenizer {
    pub fn new(tokenizer: Tokenizer) -> Self {
        let vocab = tokenizer.get_vocab(true);
        let eos_token_id = EOS_CANDIDATES
            .iter()
            .find_map(|token| vocab.get(*token).copied());
        Self {
            tokenizer,
            eos_token_id,
        }
    }

    /// Load a `tokenizer.json`
    pub fn from_file(path: &Path) -> Result<Self> {
        let tokenizer = Tokenizer::from_file(path)
            .map_err(|e| anyhow::anyhow!("Tokenizer error ({}): {e}", path.display()))?;
        Ok(Self::new(tokenizer))
    }
}

impl TokenCodec for SledTokenizer {
    fn encode(&self, text: &str) -> Result<Vec<u32>> {
        let encoding = self
            .tokenizer
            .encode(text, false)
            .map_err(|e| anyhow::anyhow!("Tokenization error: {e}"))?;
        Ok(encoding.get_ids().to_vec())
    }

    fn decode(&self, ids: &[u32]) -> Result<String> {
        self.tokenizer
            .decode(ids, true)
            .map_err(|e| anyhow::anyhow!("Decode error: {e}"))
    }

    fn eos_token_id(&self) -> Option<u32> {
        self.eos_token_id
    }
}

use crate::core::{Result, TokenId};

pub trait Tokenizer: Send + Sync {
    fn encode(&self, text: &str) -> Vec<TokenId>;

    /// Raw bytes for a token sequence. Marker matching happens on bytes,
    /// so a decoder must not lossily re-encode partial characters.
    fn decode(&self, tokens: &[TokenId]) -> Result<Vec<u8>>;

    fn vocab_size(&self) -> usize;
}

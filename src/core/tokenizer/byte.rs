use super::traits::Tokenizer;
use crate::core::{Result, TokenId};
use crate::error::RunnerError;

/// One token per byte of UTF-8 input. Vocabulary is exactly 256.
#[derive(Debug, Clone, Copy, Default)]
pub struct ByteTokenizer;

impl ByteTokenizer {
    pub const VOCAB_SIZE: usize = 256;

    pub fn new() -> Self {
        Self
    }
}

impl Tokenizer for ByteTokenizer {
    fn encode(&self, text: &str) -> Vec<TokenId> {
        text.bytes().map(|b| TokenId(b as u32)).collect()
    }

    fn decode(&self, tokens: &[TokenId]) -> Result<Vec<u8>> {
        tokens
            .iter()
            .map(|t| {
                u8::try_from(t.0)
                    .map_err(|_| RunnerError::model(format!("token {} outside byte vocabulary", t.0)))
            })
            .collect()
    }

    fn vocab_size(&self) -> usize {
        Self::VOCAB_SIZE
    }
}

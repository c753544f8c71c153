use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use serde::{Deserialize, Serialize};

use super::traits::Model;
use crate::core::{ByteTokenizer, Result, TokenId, Tokenizer};
use crate::error::RunnerError;

const BUNDLED_CORPUS: &str = include_str!("../../../assets/corpus.txt");
const FLOOR: f32 = 1e-6;

#[derive(Debug, Clone, Default)]
struct NextCounts {
    total: u32,
    next: BTreeMap<u8, u32>,
}

/// Byte-level back-off n-gram model.
///
/// Small enough to run anywhere and stateful in the same way a recurrent
/// model is: everything it remembers lives in `NgramState`.
pub struct NgramModel {
    order: usize,
    tokenizer: ByteTokenizer,
    counts: HashMap<Vec<u8>, NextCounts>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct NgramState {
    pub context: Vec<u8>,
    pub n_tokens: u64,
}

impl NgramModel {
    pub fn new(corpus: &[u8], order: usize) -> Self {
        let order = order.max(1);
        let mut counts: HashMap<Vec<u8>, NextCounts> = HashMap::new();

        for i in 0..corpus.len() {
            for k in 0..order.min(i + 1) {
                let entry = counts.entry(corpus[i - k..i].to_vec()).or_default();
                entry.total += 1;
                *entry.next.entry(corpus[i]).or_insert(0) += 1;
            }
        }

        tracing::debug!("n-gram model built: order={} contexts={}", order, counts.len());

        Self {
            order,
            tokenizer: ByteTokenizer::new(),
            counts,
        }
    }

    pub fn bundled(order: usize) -> Self {
        Self::new(BUNDLED_CORPUS.as_bytes(), order)
    }

    pub fn from_file<P: AsRef<Path>>(path: P, order: usize) -> Result<Self> {
        let corpus = std::fs::read(path.as_ref())?;
        if corpus.is_empty() {
            return Err(RunnerError::model(format!(
                "corpus {} is empty",
                path.as_ref().display()
            )));
        }
        Ok(Self::new(&corpus, order))
    }

    pub fn order(&self) -> usize {
        self.order
    }

    fn max_context(&self) -> usize {
        self.order - 1
    }

    fn logits(&self, context: &[u8]) -> Vec<f32> {
        let mut probs = vec![0.0f32; ByteTokenizer::VOCAB_SIZE];
        let mut weight_sum = 0.0f32;

        // Longer matching contexts get exponentially more weight.
        for k in 0..=context.len().min(self.max_context()) {
            let Some(entry) = self.counts.get(&context[context.len() - k..]) else {
                continue;
            };
            let weight = (1u32 << k.min(31)) as f32;
            weight_sum += weight;
            for (&byte, &count) in &entry.next {
                probs[byte as usize] += weight * count as f32 / entry.total as f32;
            }
        }

        probs
            .into_iter()
            .map(|p| {
                let p = if weight_sum > 0.0 { p / weight_sum } else { 0.0 };
                (p + FLOOR).ln()
            })
            .collect()
    }
}

impl Model for NgramModel {
    type State = NgramState;

    fn tokenizer(&self) -> &dyn Tokenizer {
        &self.tokenizer
    }

    fn initial_state(&self) -> NgramState {
        NgramState::default()
    }

    fn step(&mut self, state: &mut NgramState, tokens: &[TokenId]) -> Result<Vec<f32>> {
        let bytes = self.tokenizer.decode(tokens)?;
        let max = self.max_context();

        state.context.extend_from_slice(&bytes);
        if state.context.len() > max {
            state.context.drain(..state.context.len() - max);
        }
        state.n_tokens += bytes.len() as u64;

        Ok(self.logits(&state.context))
    }

    fn serialize(&self, state: &NgramState) -> Result<Vec<u8>> {
        serde_json::to_vec(state).map_err(|e| RunnerError::model(e.to_string()))
    }

    fn deserialize(&self, bytes: &[u8]) -> Result<NgramState> {
        let state: NgramState =
            serde_json::from_slice(bytes).map_err(|e| RunnerError::model(e.to_string()))?;
        if state.context.len() > self.max_context() {
            return Err(RunnerError::model(format!(
                "state context of {} bytes exceeds model order {}",
                state.context.len(),
                self.order
            )));
        }
        Ok(state)
    }

    /// NUL can never appear in a reply frame, so the byte vocabulary uses it as end-of-sequence.
    fn eos_token(&self) -> Option<TokenId> {
        Some(TokenId(0))
    }
}

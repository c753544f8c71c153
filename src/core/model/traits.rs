use crate::core::{Result, TokenId, Tokenizer};

/// Capability surface the runner needs from a sequence model.
///
/// The runner never looks inside `State`; it only steps it, snapshots it
/// through `serialize`, and restores it through `deserialize`. Recurrent,
/// state-space and attention backends all fit as long as their memory can
/// round-trip through bytes.
pub trait Model: Send + 'static {
    type State: Clone + Send + 'static;

    fn tokenizer(&self) -> &dyn Tokenizer;

    /// State of a freshly started process, before any token was seen.
    fn initial_state(&self) -> Self::State;

    /// Feeds `tokens` in order and returns the next-token logits.
    /// An empty slice returns logits for `state` as it is.
    fn step(&mut self, state: &mut Self::State, tokens: &[TokenId]) -> Result<Vec<f32>>;

    fn serialize(&self, state: &Self::State) -> Result<Vec<u8>>;

    fn deserialize(&self, bytes: &[u8]) -> Result<Self::State>;

    fn eos_token(&self) -> Option<TokenId> {
        None
    }
}

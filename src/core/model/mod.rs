pub mod traits;
pub mod ngram;

pub use traits::Model;
pub use ngram::{NgramModel, NgramState};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TokenId(pub u32);

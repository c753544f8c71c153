pub mod model;
pub mod tokenizer;

pub use model::{Model, NgramModel, TokenId};
pub use tokenizer::{ByteTokenizer, Tokenizer};

pub type Result<T> = crate::error::Result<T>;

pub mod traits;
pub mod byte;

pub use traits::Tokenizer;
pub use byte::ByteTokenizer;

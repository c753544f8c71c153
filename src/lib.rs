pub mod checkpoint;
pub mod core;
pub mod envconfig;
pub mod error;
pub mod format;
pub mod protocol;
pub mod sample;
pub mod server;
pub mod session;

pub use checkpoint::{CheckpointEntry, CheckpointStore};
pub use core::{ByteTokenizer, Model, NgramModel, TokenId, Tokenizer};
pub use envconfig::RunnerConfig;
pub use error::{Result, RunnerError};
pub use protocol::{BangDirective, Request, RequestShape, SlashCommand};
pub use sample::{Sampler, SamplingSettings};
pub use server::{ConnectionOptions, Server, SessionHandle};
pub use session::{Phase, Reply, Session, Stop, TurnLimits, TurnOutcome};

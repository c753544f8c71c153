use thiserror::Error;

pub type Result<T> = std::result::Result<T, RunnerError>;

#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("{0}")]
    Protocol(String),

    #[error("checkpoint not found: {0}")]
    CheckpointNotFound(String),

    #[error("invalid checkpoint name: {0:?}")]
    InvalidCheckpointName(String),

    #[error("failed to write checkpoint {name}: {source}")]
    CheckpointWrite {
        name: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to read checkpoint {name}: {reason}")]
    CheckpointRead { name: String, reason: String },

    #[error("model error: {0}")]
    Model(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl RunnerError {
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    pub fn model(msg: impl Into<String>) -> Self {
        Self::Model(msg.into())
    }

    /// Short tag used when the error is rendered back to a client.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Protocol(_) => "protocol",
            Self::CheckpointNotFound(_) | Self::CheckpointRead { .. } => "load",
            Self::InvalidCheckpointName(_) => "name",
            Self::CheckpointWrite { .. } => "save",
            Self::Model(_) => "model",
            Self::Io(_) => "io",
        }
    }

    /// One-line response body, e.g. `[load error] checkpoint not found: missing`.
    pub fn to_response(&self) -> String {
        format!("[{} error] {}\n", self.kind(), self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_response_rendering() {
        let err = RunnerError::CheckpointNotFound("missing".into());
        assert_eq!(err.to_response(), "[load error] checkpoint not found: missing\n");

        let err = RunnerError::protocol("unknown command: /nope");
        assert_eq!(err.to_response(), "[protocol error] unknown command: /nope\n");
    }
}

use thiserror::Error;

/// Classified failure of a [`FrameSource`](crate::FrameSource) operation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SourceError {
    /// No frame within the requested wait. Not a failure; retry.
    #[error("timed out waiting for frame")]
    Timeout,
    /// Device or link hiccup. Recovered by a full stop/start of the stream.
    #[error("{0}")]
    Transient(String),
    /// The source can never produce frames again.
    #[error("{0}")]
    Fatal(String),
}

impl SourceError {
    pub fn transient(msg: impl std::fmt::Display) -> Self {
        SourceError::Transient(msg.to_string())
    }

    pub fn fatal(msg: impl std::fmt::Display) -> Self {
        SourceError::Fatal(msg.to_string())
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, SourceError::Timeout)
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, SourceError::Fatal(_))
    }
}

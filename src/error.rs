use std::time::Duration;

use thiserror::Error;

use crate::tokens::TokenRole;

pub type Result<T> = std::result::Result<T, Error>;

/// Failures raised by an external forward-pass implementation.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ModelError {
    #[error("forward pass failed: {0}")]
    Forward(String),
    #[error("token id {id} is outside the model vocabulary ({size})")]
    TokenOutOfRange { id: u32, size: usize },
    #[error("prefill called with an empty sequence")]
    EmptyPrefill,
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("malformed encoding: expected {expected:?} token, found id {found}")]
    MalformedEncoding { expected: TokenRole, found: u32 },

    #[error("input on reserved output channel {channel}")]
    ReservedChannelViolation { channel: u8 },

    #[error("vocabulary has {vocabulary} symbols but the model expects {model}")]
    VocabularyMismatch { vocabulary: usize, model: usize },

    #[error("cache rebuild failed, context reset: {0}")]
    CacheRebuildFailed(ModelError),

    #[error("latency budget exceeded ({elapsed:?} > {budget:?})")]
    LatencyBudgetExceeded { elapsed: Duration, budget: Duration },

    #[error("model error: {0}")]
    Model(#[from] ModelError),

    #[error("event cannot be encoded: {0}")]
    Unencodable(String),

    #[error("invalid vocabulary at line {line}: {message}")]
    InvalidVocabulary { line: usize, message: String },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("config parse error: {0}")]
    ConfigParse(#[from] ron::error::SpannedError),

    #[error("config serialize error: {0}")]
    ConfigSerialize(#[from] ron::Error),

    #[error("file watch error: {0}")]
    Watch(#[from] notify::Error),

    #[error("MIDI device error: {0}")]
    Device(String),

    #[error("output schedule is full")]
    ScheduleFull,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Fatal errors can only surface at startup; everything else degrades to
    /// "drop and continue".
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::VocabularyMismatch { .. }
                | Error::InvalidVocabulary { .. }
                | Error::Config(_)
                | Error::ConfigParse(_)
        )
    }
}

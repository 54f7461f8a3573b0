use thiserror::Error;

/// Errors produced by the engine.
///
/// Only `SessionNotFound`, `InvalidMarkup`, `InvalidRule` and `Config` are returned to
/// callers. The remaining variants describe conditions the engine resolves
/// locally (fallback text, empty output) and are only logged.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EngineError {
    #[error("session not found: {0}")]
    SessionNotFound(String),

    #[error("no rule matched input '{input}'")]
    NoMatch { input: String },

    #[error("recursion limit exceeded at depth {depth}")]
    RecursionLimitExceeded { depth: usize },

    #[error("unresolved reference: {0}")]
    UnresolvedReference(String),

    #[error("invalid markup at line {line}: {reason}")]
    InvalidMarkup { line: usize, reason: String },

    #[error("invalid rule #{index}: {reason}")]
    InvalidRule { index: usize, reason: String },

    #[error("persistence failed: {0}")]
    Persistence(String),

    #[error("service call failed: {0}")]
    Service(String),

    #[error("invalid config: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, EngineError>;

//! Error types for supervoice-gpt-rs.

use std::fmt;

/// Result type alias using [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Candle tensor/model error.
    #[error("candle: {0}")]
    Candle(#[from] candle_core::Error),

    /// Forward-pass precondition violated (rank, batch size, sequence length).
    #[error("shape: {0}")]
    Shape(String),

    /// Conditioning prefix references a reserved special-token id.
    #[error("invalid conditioning: {0}")]
    InvalidConditioning(String),

    /// Tokenizer error (unknown symbol or id, tokenizer file failures).
    #[error("tokenizer: {0}")]
    Tokenizer(TokenizerError),

    /// Model weight loading error.
    #[error("weight loading: {0}")]
    WeightLoad(String),

    /// Invalid configuration.
    #[error("config: {0}")]
    Config(String),

    /// I/O error.
    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error.
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
}

/// Wrapper for tokenizer errors (tokenizers::Error doesn't impl std::error::Error).
#[derive(Debug)]
pub struct TokenizerError(pub String);

impl fmt::Display for TokenizerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Error {
    pub(crate) fn tokenizer(message: impl Into<String>) -> Self {
        Error::Tokenizer(TokenizerError(message.into()))
    }
}

impl From<tokenizers::Error> for Error {
    fn from(error: tokenizers::Error) -> Self {
        Error::Tokenizer(TokenizerError(error.to_string()))
    }
}

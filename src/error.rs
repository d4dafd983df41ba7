//! Error types for lora-merge

use thiserror::Error;

/// Main error type for merge operations
#[derive(Error, Debug)]
pub enum Error {
    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Base model loading error
    #[error("Model loading error: {0}")]
    ModelLoad(String),

    /// Adapter loading error
    #[error("Adapter loading error: {0}")]
    AdapterLoad(String),

    /// Adapter tensors do not line up with the base model
    #[error("Shape mismatch for layer {layer}: {reason}")]
    ShapeMismatch {
        /// Adapter layer name (normalized, without PEFT prefixes)
        layer: String,
        /// What did not line up
        reason: String,
    },

    /// Tensor operation error
    #[error("Tensor operation error: {0}")]
    Tensor(#[from] candle_core::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// HuggingFace Hub fetch error
    #[error("Hub error: {0}")]
    Hub(#[from] hf_hub::api::sync::ApiError),

    /// Tokenizer error
    #[error("Tokenizer error: {0}")]
    Tokenizer(String),
}

/// Result type alias for merge operations
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Create a model loading error
    pub fn model_load(msg: impl Into<String>) -> Self {
        Self::ModelLoad(msg.into())
    }

    /// Create an adapter loading error
    pub fn adapter_load(msg: impl Into<String>) -> Self {
        Self::AdapterLoad(msg.into())
    }

    /// Create an invalid input error
    pub fn invalid_input(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }
}

//! Error types for mmwave-amca

use thiserror::Error;

/// Main error type for training and data operations
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Dataset loading or preprocessing error
    #[error("Data error: {0}")]
    Data(String),

    /// Model construction or forward pass error
    #[error("Model error: {0}")]
    Model(String),

    /// Checkpoint save/restore error
    #[error("Checkpoint error: {0}")]
    Checkpoint(String),

    /// Tensor operation error
    #[error("Tensor operation error: {0}")]
    Tensor(#[from] candle_core::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// YAML config error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// HDF5 error
    #[error("HDF5 error: {0}")]
    Hdf5(#[from] hdf5::Error),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),

    /// Other errors
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Result type alias for mmwave-amca operations
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a data error
    pub fn data(msg: impl Into<String>) -> Self {
        Self::Data(msg.into())
    }

    /// Create a model error
    pub fn model(msg: impl Into<String>) -> Self {
        Self::Model(msg.into())
    }

    /// Create a checkpoint error
    pub fn checkpoint(msg: impl Into<String>) -> Self {
        Self::Checkpoint(msg.into())
    }

    /// Create an invalid input error
    pub fn invalid_input(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }

    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }
}

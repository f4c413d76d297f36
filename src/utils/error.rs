//! Error Handling Module
//!
//! Defines the error type shared by the registry, the model assembler,
//! the inference driver and the fitting entry points.
//! Uses thiserror for ergonomic error definitions.

use std::path::PathBuf;

use thiserror::Error;

/// Main error type for backbone classifier operations
#[derive(Error, Debug)]
pub enum ClassifierError {
    /// Requested backbone name is not registered
    #[error("Backbone '{name}' is not supported (available: {})", .available.join(", "))]
    UnsupportedBackbone {
        name: String,
        available: Vec<String>,
    },

    /// One or more input paths do not exist
    #[error("Input file(s) not found: {}", display_paths(.0))]
    MissingFiles(Vec<PathBuf>),

    /// Prediction was requested without a transform
    #[error("A transform is required for prediction")]
    MissingTransform,

    /// Pretrained weights were requested but the record file is absent
    #[error("Pretrained weights for '{backbone}' not found at '{}'", .path.display())]
    PretrainedWeights { backbone: String, path: PathBuf },

    /// Error loading or decoding an image
    #[error("Failed to load image at '{0}': {1}")]
    ImageLoad(PathBuf, String),

    /// Error saving or loading a module record
    #[error("Checkpoint error: {0}")]
    Checkpoint(String),

    /// Error raised while evaluating a data source
    #[error("Inference error: {0}")]
    Inference(String),

    /// Error with training
    #[error("Training error: {0}")]
    Training(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<serde_json::Error> for ClassifierError {
    fn from(err: serde_json::Error) -> Self {
        ClassifierError::Serialization(err.to_string())
    }
}

impl From<burn::record::RecorderError> for ClassifierError {
    fn from(err: burn::record::RecorderError) -> Self {
        ClassifierError::Checkpoint(format!("{:?}", err))
    }
}

fn display_paths(paths: &[PathBuf]) -> String {
    paths
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Convenience Result type for backbone classifier operations
pub type Result<T> = std::result::Result<T, ClassifierError>;

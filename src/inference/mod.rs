//! Inference module for batched prediction
//!
//! This module provides:
//! - The `Runner` seam and the default softmax `Evaluator`
//! - The prediction driver mapping runner output back to file paths
//! - Prediction tables with CSV and JSON export

pub mod predictor;
pub mod runner;

// Re-export main types for convenience
pub use predictor::{
    assemble_tables, flatten_entry, predict, PredictConfig, PredictionRecord, PredictionTable,
};
pub use runner::{DataSource, Evaluator, PredictionBatch, PredictionEntry, RunOutput, Runner};

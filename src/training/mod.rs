//! Training module
//!
//! This module provides:
//! - Task hyper-parameters (optimizer, loss, metrics) and fitting parameters
//! - The training loop built on Burn's autodiff backend and optimizers
//! - Per-epoch metric reports and best-model checkpoints

pub mod config;
pub mod trainer;

// Re-export main types for convenience
pub use config::{FitConfig, LossKind, MetricKind, OptimizerKind, TaskConfig};
pub use trainer::{fit, EpochMetrics, FitReport, Trainer, BEST_MODEL_FILE, FIT_REPORT_FILE};

/// Default number of training epochs
pub const DEFAULT_EPOCHS: usize = 10;

/// Default batch size
pub const DEFAULT_BATCH_SIZE: usize = 32;

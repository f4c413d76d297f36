//! # Backbone Classifier
//!
//! Image classification on top of registered CNN backbones, built with the
//! Burn framework.
//!
//! ## Modules
//!
//! - `model`: backbone registry (ResNet-18 to 152, plain ConvNets), trunk
//!   extraction and the classifier head with freeze/unfreeze
//! - `dataset`: image loaders, transforms, path and folder datasets, batchers
//! - `inference`: the runner seam and the prediction driver producing
//!   per-image tables
//! - `training`: task hyper-parameters and the fitting loop
//! - `task`: the classification task tying them together
//! - `utils`: logging, errors and formatting helpers
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use backbone_classifier::{
//!     backend::{default_device, DefaultBackend},
//!     BackboneRegistry, ImageClassificationTask, ImageClassifierConfig, PredictConfig,
//!     ResizeNormalize, TaskConfig,
//! };
//!
//! let registry = BackboneRegistry::<DefaultBackend>::default();
//! let config = TaskConfig::new(ImageClassifierConfig::new(10).with_backbone("resnet50".into()));
//! let task = ImageClassificationTask::new(config, &registry, default_device())?;
//!
//! let tables = task.predict(
//!     &["leaf.jpg".into()],
//!     Some(Arc::new(ResizeNormalize::default())),
//!     &PredictConfig::default(),
//! )?;
//! ```

pub mod backend;
pub mod dataset;
pub mod inference;
pub mod model;
pub mod task;
pub mod training;
pub mod utils;

// Re-export commonly used items for convenience
pub use dataset::{
    ImageFolder, ImageLoader, ImagePathDataset, LabeledImageDataset, ResizeNormalize,
    RgbImageLoader, Transform,
};
pub use inference::{predict, DataSource, Evaluator, PredictConfig, PredictionTable, RunOutput, Runner};
pub use model::{
    assemble, BackboneProvider, BackboneRegistry, ImageClassifier, ImageClassifierConfig,
    PretrainedWeights,
};
pub use task::ImageClassificationTask;
pub use training::{fit, FitConfig, FitReport, OptimizerKind, TaskConfig};
pub use utils::error::{ClassifierError, Result};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

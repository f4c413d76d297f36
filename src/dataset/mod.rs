//! Dataset module
//!
//! This module provides:
//! - Loader and transform capabilities for turning paths into model input
//! - Positional path datasets for prediction
//! - Class-per-directory datasets with seeded train/validation splits
//! - Burn batchers for both

pub mod burn_dataset;
pub mod folder;
pub mod transform;

// Re-export main types for convenience
pub use burn_dataset::{
    ClassificationBatch, ClassificationBatcher, ImageItem, ImagePathDataset, LabeledImageDataset,
    LabeledImageItem, PredictBatch, PredictBatcher,
};
pub use folder::{ImageFolder, ImageSample};
pub use transform::{
    ImageLoader, ImageTensor, ResizeNormalize, RgbImageLoader, Transform, DEFAULT_IMAGE_SIZE,
    IMAGENET_MEAN, IMAGENET_STD,
};

/// File extensions recognised as images
pub const IMAGE_EXTENSIONS: [&str; 4] = ["jpg", "jpeg", "png", "bmp"];

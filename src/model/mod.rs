//! Model module: backbone zoo, registry and the assembled classifier
//!
//! ## Architecture
//!
//! A classifier is a backbone trunk (a registered network with its pooling and
//! final linear layer removed) followed by a new head:
//! adaptive average pool to 1x1, flatten, linear to `num_classes`.
//!
//! Registered backbones:
//! - `resnet18`, `resnet34` (basic blocks, 512 features)
//! - `resnet50`, `resnet101`, `resnet152` (bottleneck blocks, 2048 features)
//! - `convnet-tiny`, `convnet` (plain conv blocks, 64 / 256 features)

pub mod backbone;
pub mod classifier;
pub mod convnet;
pub mod resnet;

// Re-export main types for convenience
pub use backbone::{
    Backbone, BackboneProvider, BackboneRegistry, PretrainedWeights, Trunk, WEIGHTS_DIR_ENV,
};
pub use classifier::{assemble, ClassifierHead, ImageClassifier, ImageClassifierConfig};
pub use convnet::{ConvNet, ConvNetConfig};
pub use resnet::{ResNet, ResNetConfig, ResNetDepth};

/// Backbone used when none is configured
pub const DEFAULT_BACKBONE: &str = "resnet18";

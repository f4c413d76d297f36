//! Image Classifier
//!
//! A backbone trunk followed by a fresh classification head
//! (adaptive average pool to 1x1, flatten, linear layer).

use burn::{
    config::Config,
    module::{Module, ModuleMapper, ModuleVisitor, Param},
    nn::{
        pool::{AdaptiveAvgPool2d, AdaptiveAvgPool2dConfig},
        Linear, LinearConfig,
    },
    tensor::{backend::Backend, Tensor},
};
use tracing::{debug, info};

use crate::model::backbone::{BackboneRegistry, Trunk};
use crate::utils::error::ClassifierError;

/// Configuration for an [`ImageClassifier`]
#[derive(Config, Debug)]
pub struct ImageClassifierConfig {
    /// Number of target classes
    pub num_classes: usize,

    /// Registered backbone name
    #[config(default = "String::from(\"resnet18\")")]
    pub backbone: String,

    /// Load pretrained backbone weights
    #[config(default = "true")]
    pub pretrained: bool,
}

impl ImageClassifierConfig {
    /// Assemble the classifier described by this configuration
    pub fn init<B: Backend>(
        &self,
        registry: &BackboneRegistry<B>,
        device: &B::Device,
    ) -> crate::utils::error::Result<ImageClassifier<B>> {
        assemble(
            self.num_classes,
            &self.backbone,
            self.pretrained,
            registry,
            device,
        )
    }
}

/// Pooling and linear layer mapping trunk features to class logits
#[derive(Module, Debug)]
pub struct ClassifierHead<B: Backend> {
    pool: AdaptiveAvgPool2d,
    fc: Linear<B>,
}

impl<B: Backend> ClassifierHead<B> {
    pub fn new(in_features: usize, num_classes: usize, device: &B::Device) -> Self {
        Self {
            pool: AdaptiveAvgPool2dConfig::new([1, 1]).init(),
            fc: LinearConfig::new(in_features, num_classes).init(device),
        }
    }

    /// [batch_size, channels, h, w] feature maps to [batch_size, num_classes] logits
    pub fn forward(&self, features: Tensor<B, 4>) -> Tensor<B, 2> {
        let x = self.pool.forward(features);
        let x: Tensor<B, 2> = x.flatten(1, 3);
        self.fc.forward(x)
    }

    pub fn in_features(&self) -> usize {
        self.fc.weight.val().dims()[0]
    }

    pub fn num_classes(&self) -> usize {
        self.fc.weight.val().dims()[1]
    }
}

/// Backbone trunk with a task-specific head
#[derive(Module, Debug)]
pub struct ImageClassifier<B: Backend> {
    pub trunk: Trunk<B>,
    pub head: ClassifierHead<B>,
}

impl<B: Backend> ImageClassifier<B> {
    /// Forward pass
    ///
    /// # Arguments
    /// * `images` - Input tensor of shape [batch_size, channels, height, width]
    ///
    /// # Returns
    /// * Unnormalized logits of shape [batch_size, num_classes]
    pub fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        let features = self.trunk.forward(images);
        self.head.forward(features)
    }

    /// Stop gradient tracking for every trunk parameter
    pub fn freeze(self) -> Self {
        debug!("Freezing backbone trunk");
        self.set_trunk_require_grad(false)
    }

    /// Resume gradient tracking for every trunk parameter
    pub fn unfreeze(self) -> Self {
        debug!("Unfreezing backbone trunk");
        self.set_trunk_require_grad(true)
    }

    /// True when no trunk tensor tracks gradients.
    ///
    /// Backends without autodiff never track gradients, so this is always
    /// true there.
    pub fn is_trunk_frozen(&self) -> bool {
        let mut visitor = RequireGradVisitor::default();
        self.trunk.visit(&mut visitor);
        visitor.tracked == 0
    }

    pub fn num_classes(&self) -> usize {
        self.head.num_classes()
    }

    /// Width of the features the trunk produces
    pub fn feature_width(&self) -> usize {
        self.head.in_features()
    }

    fn set_trunk_require_grad(self, require_grad: bool) -> Self {
        let mut mapper = RequireGrad(require_grad);
        Self {
            trunk: self.trunk.map(&mut mapper),
            head: self.head,
        }
    }
}

/// Build a classifier from a registered backbone
///
/// The head width is read from the full network before its classification
/// layers are removed.
pub fn assemble<B: Backend>(
    num_classes: usize,
    backbone: &str,
    pretrained: bool,
    registry: &BackboneRegistry<B>,
    device: &B::Device,
) -> crate::utils::error::Result<ImageClassifier<B>> {
    if num_classes == 0 {
        return Err(ClassifierError::InvalidInput(
            "num_classes must be positive".to_string(),
        ));
    }

    let provider = registry.lookup(backbone)?;
    let network = provider.build(pretrained, device)?;
    let width = provider.feature_width(&network);
    let trunk = provider.extract_trunk(network);

    info!(
        "Assembled {} classifier: {} features -> {} classes (pretrained: {})",
        backbone, width, num_classes, pretrained
    );

    Ok(ImageClassifier {
        trunk,
        head: ClassifierHead::new(width, num_classes, device),
    })
}

/// Sets the gradient flag of every float parameter it visits
struct RequireGrad(bool);

impl<B: Backend> ModuleMapper<B> for RequireGrad {
    fn map_float<const D: usize>(&mut self, param: Param<Tensor<B, D>>) -> Param<Tensor<B, D>> {
        param.set_require_grad(self.0)
    }
}

/// Counts float tensors that track gradients
#[derive(Default)]
struct RequireGradVisitor {
    tracked: usize,
}

impl<B: Backend> ModuleVisitor<B> for RequireGradVisitor {
    fn visit_float<const D: usize>(&mut self, param: &Param<Tensor<B, D>>) {
        if param.val().is_require_grad() {
            self.tracked += 1;
        }
    }
}

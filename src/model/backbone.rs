//! Backbone Registry
//!
//! Maps backbone names to providers. A provider knows how to build the full
//! network (optionally with pretrained weights), how to strip its pooling and
//! classification layers, and how wide the features feeding the stripped
//! classifier are.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use burn::{
    module::Module,
    record::CompactRecorder,
    tensor::{backend::Backend, Tensor},
};
use tracing::{debug, info};

use crate::model::convnet::{ConvNet, ConvNetConfig, ConvNetTrunk};
use crate::model::resnet::{ResNet, ResNetConfig, ResNetDepth, ResNetTrunk};
use crate::utils::error::{ClassifierError, Result};

/// Environment variable naming the directory with pretrained records
pub const WEIGHTS_DIR_ENV: &str = "BACKBONE_WEIGHTS_DIR";

/// Directory used when the environment variable is unset
pub const DEFAULT_WEIGHTS_DIR: &str = "weights";

/// A complete backbone network, classifier layers included
#[derive(Module, Debug)]
pub enum Backbone<B: Backend> {
    ResNet(ResNet<B>),
    ConvNet(ConvNet<B>),
}

impl<B: Backend> Backbone<B> {
    /// Class logits of the original network
    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 2> {
        match self {
            Backbone::ResNet(net) => net.forward(x),
            Backbone::ConvNet(net) => net.forward(x),
        }
    }

    /// Input width of the final linear layer
    pub fn classifier_in_features(&self) -> usize {
        match self {
            Backbone::ResNet(net) => net.fc_in_features(),
            Backbone::ConvNet(net) => net.fc_in_features(),
        }
    }

    /// Discard global pooling and the final linear layer
    pub fn into_trunk(self) -> Trunk<B> {
        match self {
            Backbone::ResNet(net) => Trunk::ResNet(net.into_trunk()),
            Backbone::ConvNet(net) => Trunk::ConvNet(net.into_trunk()),
        }
    }
}

/// Feature extractor left after the classifier layers are removed
#[derive(Module, Debug)]
pub enum Trunk<B: Backend> {
    ResNet(ResNetTrunk<B>),
    ConvNet(ConvNetTrunk<B>),
}

impl<B: Backend> Trunk<B> {
    /// Feature maps of shape [batch_size, feature_width, h, w]
    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        match self {
            Trunk::ResNet(trunk) => trunk.forward(x),
            Trunk::ConvNet(trunk) => trunk.forward(x),
        }
    }
}

/// Capability set every registered backbone offers
pub trait BackboneProvider<B: Backend>: Send + Sync {
    /// Registry key
    fn name(&self) -> &str;

    /// Build the full network, loading pretrained weights when requested
    fn build(&self, pretrained: bool, device: &B::Device) -> Result<Backbone<B>>;

    /// Remove the classification layers from a network built by `build`
    fn extract_trunk(&self, network: Backbone<B>) -> Trunk<B> {
        network.into_trunk()
    }

    /// Width of the features the trunk hands to the classifier
    fn feature_width(&self, network: &Backbone<B>) -> usize {
        network.classifier_in_features()
    }
}

/// Location of pretrained backbone records (`<dir>/<name>.mpk`)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PretrainedWeights {
    dir: PathBuf,
}

impl PretrainedWeights {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Read the directory from `BACKBONE_WEIGHTS_DIR`, falling back to `weights/`
    pub fn from_env() -> Self {
        let dir = std::env::var_os(WEIGHTS_DIR_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_WEIGHTS_DIR));
        Self { dir }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Record file expected for a backbone
    pub fn path_for(&self, backbone: &str) -> PathBuf {
        self.dir.join(format!("{}.mpk", backbone))
    }

    /// Load the record of `backbone` into `module`
    pub fn load<B: Backend, M: Module<B>>(
        &self,
        backbone: &str,
        module: M,
        device: &B::Device,
    ) -> Result<M> {
        let path = self.path_for(backbone);
        if !path.exists() {
            return Err(ClassifierError::PretrainedWeights {
                backbone: backbone.to_string(),
                path,
            });
        }

        info!("Loading pretrained weights for {} from {:?}", backbone, path);

        // The recorder appends its own extension
        let module = module.load_file(path.with_extension(""), &CompactRecorder::new(), device)?;
        Ok(module)
    }
}

impl Default for PretrainedWeights {
    fn default() -> Self {
        Self::from_env()
    }
}

/// Provider for the ResNet family
#[derive(Debug, Clone)]
pub struct ResNetProvider {
    depth: ResNetDepth,
    weights: PretrainedWeights,
}

impl ResNetProvider {
    pub fn new(depth: ResNetDepth, weights: PretrainedWeights) -> Self {
        Self { depth, weights }
    }
}

impl<B: Backend> BackboneProvider<B> for ResNetProvider {
    fn name(&self) -> &str {
        self.depth.name()
    }

    fn build(&self, pretrained: bool, device: &B::Device) -> Result<Backbone<B>> {
        let network = ResNetConfig::new(self.depth).init::<B>(device);
        let network = if pretrained {
            self.weights.load(self.depth.name(), network, device)?
        } else {
            network
        };
        Ok(Backbone::ResNet(network))
    }
}

/// Provider for plain convolutional backbones
#[derive(Debug, Clone)]
pub struct ConvNetProvider {
    name: String,
    config: ConvNetConfig,
    weights: PretrainedWeights,
}

impl ConvNetProvider {
    pub fn new(name: impl Into<String>, config: ConvNetConfig, weights: PretrainedWeights) -> Self {
        Self {
            name: name.into(),
            config,
            weights,
        }
    }

    /// 8 base filters, 64-wide features
    pub fn tiny(weights: PretrainedWeights) -> Self {
        Self::new("convnet-tiny", ConvNetConfig::new().with_base_filters(8), weights)
    }

    /// 32 base filters, 256-wide features
    pub fn standard(weights: PretrainedWeights) -> Self {
        Self::new("convnet", ConvNetConfig::new(), weights)
    }
}

impl<B: Backend> BackboneProvider<B> for ConvNetProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn build(&self, pretrained: bool, device: &B::Device) -> Result<Backbone<B>> {
        let network = self.config.init::<B>(device);
        let network = if pretrained {
            self.weights.load(&self.name, network, device)?
        } else {
            network
        };
        Ok(Backbone::ConvNet(network))
    }
}

/// Name to provider lookup table
///
/// Populated while it is being built and read-only afterwards.
pub struct BackboneRegistry<B: Backend> {
    providers: BTreeMap<String, Arc<dyn BackboneProvider<B>>>,
}

impl<B: Backend> BackboneRegistry<B> {
    /// Registry with every built-in backbone
    pub fn new(weights: PretrainedWeights) -> Self {
        let mut registry = Self::empty();
        for depth in ResNetDepth::ALL {
            registry = registry.with_provider(ResNetProvider::new(depth, weights.clone()));
        }
        registry
            .with_provider(ConvNetProvider::tiny(weights.clone()))
            .with_provider(ConvNetProvider::standard(weights))
    }

    /// Registry without any provider
    pub fn empty() -> Self {
        Self {
            providers: BTreeMap::new(),
        }
    }

    /// Register a provider under its own name, replacing any previous one
    pub fn with_provider<P>(mut self, provider: P) -> Self
    where
        P: BackboneProvider<B> + 'static,
    {
        let name = provider.name().to_string();
        debug!("Registering backbone {}", name);
        self.providers.insert(name, Arc::new(provider));
        self
    }

    /// Resolve a backbone by name
    pub fn lookup(&self, name: &str) -> Result<&dyn BackboneProvider<B>> {
        self.providers
            .get(name)
            .map(|provider| provider.as_ref())
            .ok_or_else(|| ClassifierError::UnsupportedBackbone {
                name: name.to_string(),
                available: self.names(),
            })
    }

    /// Registered names in sorted order
    pub fn names(&self) -> Vec<String> {
        self.providers.keys().cloned().collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.providers.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.providers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }
}

impl<B: Backend> Default for BackboneRegistry<B> {
    fn default() -> Self {
        Self::new(PretrainedWeights::from_env())
    }
}

impl<B: Backend> fmt::Debug for BackboneRegistry<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackboneRegistry")
            .field("backbones", &self.names())
            .finish()
    }
}

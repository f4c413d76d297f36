//! Plain Convolutional Backbones
//!
//! A VGG-style stack of four convolution blocks (Conv2d, BatchNorm, ReLU,
//! MaxPool) followed by global average pooling and a linear classifier.
//! Much cheaper than the ResNets, so it is the backbone of choice for
//! CPU-only runs and for quick experiments.

use burn::{
    config::Config,
    module::Module,
    nn::{
        conv::{Conv2d, Conv2dConfig},
        pool::{AdaptiveAvgPool2d, AdaptiveAvgPool2dConfig, MaxPool2d, MaxPool2dConfig},
        BatchNorm, BatchNormConfig, Dropout, DropoutConfig, Linear, LinearConfig, PaddingConfig2d,
        Relu,
    },
    tensor::{backend::Backend, Tensor},
};

/// Configuration for a [`ConvNet`]
#[derive(Config, Debug)]
pub struct ConvNetConfig {
    /// Filters of the first block; doubled by every following block
    #[config(default = "32")]
    pub base_filters: usize,

    /// Number of input channels (3 for RGB)
    #[config(default = "3")]
    pub in_channels: usize,

    /// Outputs of the classifier layer
    #[config(default = "crate::model::resnet::IMAGENET_CLASSES")]
    pub num_classes: usize,

    /// Dropout applied before the classifier layer
    #[config(default = "0.3")]
    pub dropout_rate: f64,
}

impl ConvNetConfig {
    /// Channel count produced by the last block
    pub fn out_channels(&self) -> usize {
        self.base_filters * 8
    }

    /// Initialize a randomly weighted network
    pub fn init<B: Backend>(&self, device: &B::Device) -> ConvNet<B> {
        let base = self.base_filters;

        // Channels: in -> base -> 2x -> 4x -> 8x, each block halves the resolution
        let trunk = ConvNetTrunk {
            block1: ConvBlock::new(self.in_channels, base, 3, true, device),
            block2: ConvBlock::new(base, base * 2, 3, true, device),
            block3: ConvBlock::new(base * 2, base * 4, 3, true, device),
            block4: ConvBlock::new(base * 4, base * 8, 3, true, device),
        };

        ConvNet {
            trunk,
            global_pool: AdaptiveAvgPool2dConfig::new([1, 1]).init(),
            dropout: DropoutConfig::new(self.dropout_rate).init(),
            fc: LinearConfig::new(self.out_channels(), self.num_classes).init(device),
        }
    }
}

/// A CNN block with Conv2d, BatchNorm, ReLU, and optional MaxPool
#[derive(Module, Debug)]
pub struct ConvBlock<B: Backend> {
    pub conv: Conv2d<B>,
    pub bn: BatchNorm<B>,
    pub relu: Relu,
    pub pool: Option<MaxPool2d>,
}

impl<B: Backend> ConvBlock<B> {
    /// Create a new convolutional block
    pub fn new(
        in_channels: usize,
        out_channels: usize,
        kernel_size: usize,
        with_pool: bool,
        device: &B::Device,
    ) -> Self {
        let conv = Conv2dConfig::new([in_channels, out_channels], [kernel_size, kernel_size])
            .with_padding(PaddingConfig2d::Same)
            .init(device);

        let pool = with_pool.then(|| MaxPool2dConfig::new([2, 2]).with_strides([2, 2]).init());

        Self {
            conv,
            bn: BatchNormConfig::new(out_channels).init(device),
            relu: Relu::new(),
            pool,
        }
    }

    /// Forward pass through the block
    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = self.conv.forward(x);
        let x = self.bn.forward(x);
        let x = self.relu.forward(x);

        match &self.pool {
            Some(pool) => pool.forward(x),
            None => x,
        }
    }
}

/// The four convolution blocks of a [`ConvNet`]
#[derive(Module, Debug)]
pub struct ConvNetTrunk<B: Backend> {
    pub block1: ConvBlock<B>,
    pub block2: ConvBlock<B>,
    pub block3: ConvBlock<B>,
    pub block4: ConvBlock<B>,
}

impl<B: Backend> ConvNetTrunk<B> {
    /// Feature maps of shape [batch_size, 8 * base_filters, height / 16, width / 16]
    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = self.block1.forward(x);
        let x = self.block2.forward(x);
        let x = self.block3.forward(x);
        self.block4.forward(x)
    }
}

/// Convolutional classifier: trunk, global pooling, dropout, linear layer
#[derive(Module, Debug)]
pub struct ConvNet<B: Backend> {
    pub trunk: ConvNetTrunk<B>,
    pub global_pool: AdaptiveAvgPool2d,
    pub dropout: Dropout,
    pub fc: Linear<B>,
}

impl<B: Backend> ConvNet<B> {
    /// Forward pass through the network
    ///
    /// # Arguments
    /// * `x` - Input tensor of shape [batch_size, 3, height, width]
    ///
    /// # Returns
    /// * Logits tensor of shape [batch_size, num_classes]
    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 2> {
        let x = self.trunk.forward(x);

        // Global pooling: [B, C, H, W] -> [B, C, 1, 1]
        let x = self.global_pool.forward(x);

        // Flatten: [B, C, 1, 1] -> [B, C]
        let [batch_size, channels, _, _] = x.dims();
        let x = x.reshape([batch_size, channels]);

        let x = self.dropout.forward(x);
        self.fc.forward(x)
    }

    /// Input width of the classifier layer
    pub fn fc_in_features(&self) -> usize {
        self.fc.weight.val().dims()[0]
    }

    /// Drop pooling and classifier, keeping the convolution blocks
    pub fn into_trunk(self) -> ConvNetTrunk<B> {
        self.trunk
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn_ndarray::NdArray;

    type TestBackend = NdArray;

    #[test]
    fn test_convnet_output_shape() {
        let device = Default::default();
        let model = ConvNetConfig::new()
            .with_base_filters(8)
            .with_num_classes(5)
            .init::<TestBackend>(&device);

        let input = Tensor::<TestBackend, 4>::zeros([2, 3, 32, 32], &device);
        let output = model.forward(input);

        assert_eq!(output.dims(), [2, 5]);
    }

    #[test]
    fn test_trunk_output_channels() {
        let device = Default::default();
        let config = ConvNetConfig::new().with_base_filters(4);
        let trunk = config.init::<TestBackend>(&device).into_trunk();

        let input = Tensor::<TestBackend, 4>::zeros([1, 3, 32, 32], &device);
        let features = trunk.forward(input);

        assert_eq!(features.dims(), [1, 32, 2, 2]);
    }

    #[test]
    fn test_fc_in_features_matches_config() {
        let device = Default::default();
        let config = ConvNetConfig::new().with_base_filters(8);
        let model = config.init::<TestBackend>(&device);

        assert_eq!(model.fc_in_features(), config.out_channels());
        assert_eq!(model.fc_in_features(), 64);
    }
}

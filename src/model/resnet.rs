//! ResNet Backbones
//!
//! ResNet-18/34 (basic residual blocks) and ResNet-50/101/152 (bottleneck
//! blocks) with the ImageNet layout: 7x7 stem, max-pool, four residual
//! stages, global average pooling and a fully connected classifier.
//!
//! The network keeps the feature-producing layers in [`ResNetTrunk`] so the
//! classifier part (`avgpool` + `fc`) can be dropped without rebuilding.

use burn::{
    config::Config,
    module::Module,
    nn::{
        conv::{Conv2d, Conv2dConfig},
        pool::{AdaptiveAvgPool2d, AdaptiveAvgPool2dConfig, MaxPool2d, MaxPool2dConfig},
        BatchNorm, BatchNormConfig, Linear, LinearConfig, PaddingConfig2d, Relu,
    },
    tensor::{backend::Backend, Tensor},
};
use serde::{Deserialize, Serialize};

/// Width of the first residual stage
const BASE_WIDTH: usize = 64;

/// Output channel multiplier of a bottleneck block
const BOTTLENECK_EXPANSION: usize = 4;

/// Number of classes of the ImageNet classifier the zoo networks ship with
pub const IMAGENET_CLASSES: usize = 1000;

/// Supported ResNet depths
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResNetDepth {
    D18,
    D34,
    D50,
    D101,
    D152,
}

impl ResNetDepth {
    /// All depths, shallowest first
    pub const ALL: [ResNetDepth; 5] = [
        ResNetDepth::D18,
        ResNetDepth::D34,
        ResNetDepth::D50,
        ResNetDepth::D101,
        ResNetDepth::D152,
    ];

    /// Number of residual blocks in each of the four stages
    pub fn blocks(&self) -> [usize; 4] {
        match self {
            ResNetDepth::D18 => [2, 2, 2, 2],
            ResNetDepth::D34 => [3, 4, 6, 3],
            ResNetDepth::D50 => [3, 4, 6, 3],
            ResNetDepth::D101 => [3, 4, 23, 3],
            ResNetDepth::D152 => [3, 8, 36, 3],
        }
    }

    /// Whether the stages are built from bottleneck blocks
    pub fn uses_bottleneck(&self) -> bool {
        matches!(self, ResNetDepth::D50 | ResNetDepth::D101 | ResNetDepth::D152)
    }

    /// Channel count produced by the last stage
    pub fn out_channels(&self) -> usize {
        let expansion = if self.uses_bottleneck() {
            BOTTLENECK_EXPANSION
        } else {
            1
        };
        BASE_WIDTH * 8 * expansion
    }

    /// Registry name, e.g. `resnet50`
    pub fn name(&self) -> &'static str {
        match self {
            ResNetDepth::D18 => "resnet18",
            ResNetDepth::D34 => "resnet34",
            ResNetDepth::D50 => "resnet50",
            ResNetDepth::D101 => "resnet101",
            ResNetDepth::D152 => "resnet152",
        }
    }
}

/// Configuration for a full ResNet network
#[derive(Config, Debug)]
pub struct ResNetConfig {
    /// Depth variant
    pub depth: ResNetDepth,

    /// Outputs of the final fully connected layer
    #[config(default = "crate::model::resnet::IMAGENET_CLASSES")]
    pub num_classes: usize,

    /// Number of input channels (3 for RGB)
    #[config(default = "3")]
    pub in_channels: usize,
}

impl ResNetConfig {
    /// Initialize a randomly weighted network
    pub fn init<B: Backend>(&self, device: &B::Device) -> ResNet<B> {
        let trunk = ResNetTrunk::new(self.depth, self.in_channels, device);
        let avgpool = AdaptiveAvgPool2dConfig::new([1, 1]).init();
        let fc = LinearConfig::new(self.depth.out_channels(), self.num_classes).init(device);

        ResNet { trunk, avgpool, fc }
    }
}

fn conv3x3<B: Backend>(
    in_channels: usize,
    out_channels: usize,
    stride: usize,
    device: &B::Device,
) -> Conv2d<B> {
    Conv2dConfig::new([in_channels, out_channels], [3, 3])
        .with_stride([stride, stride])
        .with_padding(PaddingConfig2d::Explicit(1, 1))
        .with_bias(false)
        .init(device)
}

fn conv1x1<B: Backend>(
    in_channels: usize,
    out_channels: usize,
    stride: usize,
    device: &B::Device,
) -> Conv2d<B> {
    Conv2dConfig::new([in_channels, out_channels], [1, 1])
        .with_stride([stride, stride])
        .with_bias(false)
        .init(device)
}

/// Projection shortcut used when a block changes resolution or width
#[derive(Module, Debug)]
pub struct Downsample<B: Backend> {
    conv: Conv2d<B>,
    bn: BatchNorm<B>,
}

impl<B: Backend> Downsample<B> {
    fn new(in_channels: usize, out_channels: usize, stride: usize, device: &B::Device) -> Self {
        Self {
            conv: conv1x1(in_channels, out_channels, stride, device),
            bn: BatchNormConfig::new(out_channels).init(device),
        }
    }

    fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        self.bn.forward(self.conv.forward(x))
    }
}

/// Two 3x3 convolutions with an identity or projection shortcut
#[derive(Module, Debug)]
pub struct BasicBlock<B: Backend> {
    conv1: Conv2d<B>,
    bn1: BatchNorm<B>,
    conv2: Conv2d<B>,
    bn2: BatchNorm<B>,
    relu: Relu,
    downsample: Option<Downsample<B>>,
}

impl<B: Backend> BasicBlock<B> {
    fn new(in_channels: usize, planes: usize, stride: usize, device: &B::Device) -> Self {
        let downsample = if stride != 1 || in_channels != planes {
            Some(Downsample::new(in_channels, planes, stride, device))
        } else {
            None
        };

        Self {
            conv1: conv3x3(in_channels, planes, stride, device),
            bn1: BatchNormConfig::new(planes).init(device),
            conv2: conv3x3(planes, planes, 1, device),
            bn2: BatchNormConfig::new(planes).init(device),
            relu: Relu::new(),
            downsample,
        }
    }

    fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let identity = match &self.downsample {
            Some(downsample) => downsample.forward(x.clone()),
            None => x.clone(),
        };

        let out = self.conv1.forward(x);
        let out = self.bn1.forward(out);
        let out = self.relu.forward(out);
        let out = self.conv2.forward(out);
        let out = self.bn2.forward(out);

        self.relu.forward(out + identity)
    }
}

/// 1x1 reduce, 3x3, 1x1 expand (x4) with a shortcut
#[derive(Module, Debug)]
pub struct Bottleneck<B: Backend> {
    conv1: Conv2d<B>,
    bn1: BatchNorm<B>,
    conv2: Conv2d<B>,
    bn2: BatchNorm<B>,
    conv3: Conv2d<B>,
    bn3: BatchNorm<B>,
    relu: Relu,
    downsample: Option<Downsample<B>>,
}

impl<B: Backend> Bottleneck<B> {
    fn new(in_channels: usize, planes: usize, stride: usize, device: &B::Device) -> Self {
        let out_channels = planes * BOTTLENECK_EXPANSION;
        let downsample = if stride != 1 || in_channels != out_channels {
            Some(Downsample::new(in_channels, out_channels, stride, device))
        } else {
            None
        };

        Self {
            conv1: conv1x1(in_channels, planes, 1, device),
            bn1: BatchNormConfig::new(planes).init(device),
            // Stride sits on the 3x3 convolution (torchvision v1.5 layout)
            conv2: conv3x3(planes, planes, stride, device),
            bn2: BatchNormConfig::new(planes).init(device),
            conv3: conv1x1(planes, out_channels, 1, device),
            bn3: BatchNormConfig::new(out_channels).init(device),
            relu: Relu::new(),
            downsample,
        }
    }

    fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let identity = match &self.downsample {
            Some(downsample) => downsample.forward(x.clone()),
            None => x.clone(),
        };

        let out = self.relu.forward(self.bn1.forward(self.conv1.forward(x)));
        let out = self.relu.forward(self.bn2.forward(self.conv2.forward(out)));
        let out = self.bn3.forward(self.conv3.forward(out));

        self.relu.forward(out + identity)
    }
}

/// A residual block of either kind
#[derive(Module, Debug)]
pub enum ResidualBlock<B: Backend> {
    Basic(BasicBlock<B>),
    Bottleneck(Bottleneck<B>),
}

impl<B: Backend> ResidualBlock<B> {
    fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        match self {
            ResidualBlock::Basic(block) => block.forward(x),
            ResidualBlock::Bottleneck(block) => block.forward(x),
        }
    }
}

/// A sequence of residual blocks sharing one output width
#[derive(Module, Debug)]
pub struct ResidualStage<B: Backend> {
    blocks: Vec<ResidualBlock<B>>,
}

impl<B: Backend> ResidualStage<B> {
    /// Build a stage; only the first block may downsample.
    ///
    /// Returns the stage and its output channel count.
    fn new(
        in_channels: usize,
        planes: usize,
        num_blocks: usize,
        stride: usize,
        bottleneck: bool,
        device: &B::Device,
    ) -> (Self, usize) {
        let mut blocks = Vec::with_capacity(num_blocks);
        let mut channels = in_channels;

        for i in 0..num_blocks {
            let block_stride = if i == 0 { stride } else { 1 };
            if bottleneck {
                blocks.push(ResidualBlock::Bottleneck(Bottleneck::new(
                    channels,
                    planes,
                    block_stride,
                    device,
                )));
                channels = planes * BOTTLENECK_EXPANSION;
            } else {
                blocks.push(ResidualBlock::Basic(BasicBlock::new(
                    channels,
                    planes,
                    block_stride,
                    device,
                )));
                channels = planes;
            }
        }

        (Self { blocks }, channels)
    }

    fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        self.blocks.iter().fold(x, |x, block| block.forward(x))
    }

    /// Number of residual blocks in this stage
    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    /// Whether the stage has no blocks
    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }
}

/// Feature-producing layers of a ResNet (everything before `avgpool`)
#[derive(Module, Debug)]
pub struct ResNetTrunk<B: Backend> {
    conv1: Conv2d<B>,
    bn1: BatchNorm<B>,
    relu: Relu,
    maxpool: MaxPool2d,
    pub layer1: ResidualStage<B>,
    pub layer2: ResidualStage<B>,
    pub layer3: ResidualStage<B>,
    pub layer4: ResidualStage<B>,
}

impl<B: Backend> ResNetTrunk<B> {
    fn new(depth: ResNetDepth, in_channels: usize, device: &B::Device) -> Self {
        let conv1 = Conv2dConfig::new([in_channels, BASE_WIDTH], [7, 7])
            .with_stride([2, 2])
            .with_padding(PaddingConfig2d::Explicit(3, 3))
            .with_bias(false)
            .init(device);
        let bn1 = BatchNormConfig::new(BASE_WIDTH).init(device);
        let maxpool = MaxPool2dConfig::new([3, 3])
            .with_strides([2, 2])
            .with_padding(PaddingConfig2d::Explicit(1, 1))
            .init();

        let [n1, n2, n3, n4] = depth.blocks();
        let bottleneck = depth.uses_bottleneck();

        let (layer1, channels) =
            ResidualStage::new(BASE_WIDTH, BASE_WIDTH, n1, 1, bottleneck, device);
        let (layer2, channels) =
            ResidualStage::new(channels, BASE_WIDTH * 2, n2, 2, bottleneck, device);
        let (layer3, channels) =
            ResidualStage::new(channels, BASE_WIDTH * 4, n3, 2, bottleneck, device);
        let (layer4, _) = ResidualStage::new(channels, BASE_WIDTH * 8, n4, 2, bottleneck, device);

        Self {
            conv1,
            bn1,
            relu: Relu::new(),
            maxpool,
            layer1,
            layer2,
            layer3,
            layer4,
        }
    }

    /// Forward pass
    ///
    /// # Arguments
    /// * `x` - Input tensor of shape [batch_size, channels, height, width]
    ///
    /// # Returns
    /// * Feature maps of shape [batch_size, out_channels, height / 32, width / 32]
    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = self.conv1.forward(x);
        let x = self.bn1.forward(x);
        let x = self.relu.forward(x);
        let x = self.maxpool.forward(x);

        let x = self.layer1.forward(x);
        let x = self.layer2.forward(x);
        let x = self.layer3.forward(x);
        self.layer4.forward(x)
    }
}

/// A complete ResNet: trunk, global average pooling and classifier
#[derive(Module, Debug)]
pub struct ResNet<B: Backend> {
    pub trunk: ResNetTrunk<B>,
    pub avgpool: AdaptiveAvgPool2d,
    pub fc: Linear<B>,
}

impl<B: Backend> ResNet<B> {
    /// Forward pass producing class logits
    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 2> {
        let x = self.trunk.forward(x);
        let x = self.avgpool.forward(x);
        let x: Tensor<B, 2> = x.flatten(1, 3);
        self.fc.forward(x)
    }

    /// Input width of the final fully connected layer
    pub fn fc_in_features(&self) -> usize {
        // Linear weights are stored as [d_input, d_output]
        self.fc.weight.val().dims()[0]
    }

    /// Drop `avgpool` and `fc`, keeping the feature extractor
    pub fn into_trunk(self) -> ResNetTrunk<B> {
        self.trunk
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn_ndarray::NdArray;

    type TestBackend = NdArray;

    #[test]
    fn test_depth_blocks() {
        assert_eq!(ResNetDepth::D18.blocks(), [2, 2, 2, 2]);
        assert_eq!(ResNetDepth::D101.blocks(), [3, 4, 23, 3]);
        assert_eq!(ResNetDepth::D152.blocks(), [3, 8, 36, 3]);
    }

    #[test]
    fn test_out_channels() {
        assert_eq!(ResNetDepth::D18.out_channels(), 512);
        assert_eq!(ResNetDepth::D34.out_channels(), 512);
        assert_eq!(ResNetDepth::D50.out_channels(), 2048);
        assert_eq!(ResNetDepth::D152.out_channels(), 2048);
    }

    #[test]
    fn test_zoo_defaults_to_imagenet_head() {
        assert_eq!(ResNetConfig::new(ResNetDepth::D50).num_classes, IMAGENET_CLASSES);
        assert_eq!(
            crate::model::convnet::ConvNetConfig::new().num_classes,
            IMAGENET_CLASSES
        );
    }

    #[test]
    fn test_stage_lengths_match_depth() {
        let device = Default::default();
        let model = ResNetConfig::new(ResNetDepth::D34).init::<TestBackend>(&device);

        assert_eq!(model.trunk.layer1.len(), 3);
        assert_eq!(model.trunk.layer2.len(), 4);
        assert_eq!(model.trunk.layer3.len(), 6);
        assert_eq!(model.trunk.layer4.len(), 3);
    }

    #[test]
    fn test_resnet18_output_shape() {
        let device = Default::default();
        let model = ResNetConfig::new(ResNetDepth::D18)
            .with_num_classes(10)
            .init::<TestBackend>(&device);

        let input = Tensor::<TestBackend, 4>::zeros([2, 3, 64, 64], &device);
        let output = model.forward(input);

        assert_eq!(output.dims(), [2, 10]);
    }

    #[test]
    fn test_trunk_feature_maps() {
        let device = Default::default();
        let model = ResNetConfig::new(ResNetDepth::D18).init::<TestBackend>(&device);
        let trunk = model.into_trunk();

        let input = Tensor::<TestBackend, 4>::zeros([1, 3, 64, 64], &device);
        let features = trunk.forward(input);

        // Total stride of the trunk is 32
        assert_eq!(features.dims(), [1, 512, 2, 2]);
    }

    #[test]
    fn test_fc_in_features() {
        let device = Default::default();
        let model = ResNetConfig::new(ResNetDepth::D50).init::<TestBackend>(&device);
        assert_eq!(model.fc_in_features(), 2048);
    }
}

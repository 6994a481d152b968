use burn::{
    nn::{
        BatchNorm, BatchNormConfig, LeakyRelu, LeakyReluConfig, PaddingConfig2d, Relu,
        conv::{Conv2d, Conv2dConfig, ConvTranspose2d, ConvTranspose2dConfig},
    },
    prelude::*,
};

use crate::model::composition::CompositionModel;
use crate::model::constants::{GENERATOR_INPUT_CHANNELS, GENERATOR_OUTPUT_CHANNELS};
use crate::model::flow::resize;
use crate::model::warp_net::FlowWarpNetConfig;

#[derive(Module, Debug)]
pub struct ResidualBlock<B: Backend> {
    conv1: Conv2d<B>,
    bn1: BatchNorm<B, 2>,
    conv2: Conv2d<B>,
    bn2: BatchNorm<B, 2>,
    activation: Relu,
}

impl<B: Backend> ResidualBlock<B> {
    fn new(channels: usize, device: &B::Device) -> Self {
        let conv = || {
            Conv2dConfig::new([channels, channels], [3, 3])
                .with_padding(PaddingConfig2d::Explicit(1, 1))
                .with_bias(false)
                .init(device)
        };
        Self {
            conv1: conv(),
            bn1: BatchNormConfig::new(channels).init(device),
            conv2: conv(),
            bn2: BatchNormConfig::new(channels).init(device),
            activation: Relu::new(),
        }
    }

    pub fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        let mut x = self.conv1.forward(input.clone());
        x = self.bn1.forward(x);
        x = self.activation.forward(x);
        x = self.conv2.forward(x);
        x = self.bn2.forward(x);
        self.activation.forward(x + input)
    }
}

#[derive(Module, Debug)]
pub struct DownBlock<B: Backend> {
    conv: Conv2d<B>,
    bn: BatchNorm<B, 2>,
    activation: LeakyRelu,
    residual: ResidualBlock<B>,
}

impl<B: Backend> DownBlock<B> {
    pub fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        let mut x = self.conv.forward(input);
        x = self.bn.forward(x);
        x = self.activation.forward(x);
        self.residual.forward(x)
    }
}

#[derive(Module, Debug)]
pub struct UpBlock<B: Backend> {
    deconv: ConvTranspose2d<B>,
    bn: BatchNorm<B, 2>,
    activation: Relu,
    residual: ResidualBlock<B>,
    /// Merges the upsampled features with the encoder skip.
    fuse: Conv2d<B>,
}

impl<B: Backend> UpBlock<B> {
    pub fn forward(&self, input: Tensor<B, 4>, skip: Tensor<B, 4>) -> Tensor<B, 4> {
        let [_, _, height, width] = skip.dims();
        let mut x = self.deconv.forward(input);
        x = self.bn.forward(x);
        x = self.activation.forward(x);
        x = self.residual.forward(resize(x, height, width));
        self.fuse.forward(Tensor::cat(vec![x, skip], 1))
    }
}

/// U-Net with residual blocks at every level. Emits raw logits: three
/// rendering channels followed by one composite-mask channel.
#[derive(Module, Debug)]
pub struct ResUnetGenerator<B: Backend> {
    stem: Conv2d<B>,
    stem_bn: BatchNorm<B, 2>,
    stem_activation: Relu,
    stem_residual: ResidualBlock<B>,
    downs: Vec<DownBlock<B>>,
    ups: Vec<UpBlock<B>>,
    head: Conv2d<B>,
}

#[derive(Config, Debug)]
pub struct ResUnetGeneratorConfig {
    #[config(default = "GENERATOR_INPUT_CHANNELS")]
    pub input_channels: usize,
    #[config(default = "GENERATOR_OUTPUT_CHANNELS")]
    pub output_channels: usize,
    #[config(default = 5)]
    pub num_downs: usize,
    #[config(default = 64)]
    pub ngf: usize,
    #[config(default = 0.2)]
    pub leaky_relu_slope: f64,
}

impl ResUnetGeneratorConfig {
    fn width(&self, level: usize) -> usize {
        self.ngf * (1 << level.min(3))
    }

    pub fn init<B: Backend>(&self, device: &B::Device) -> ResUnetGenerator<B> {
        let downs = (0..self.num_downs)
            .map(|level| {
                let (c_in, c_out) = (self.width(level), self.width(level + 1));
                DownBlock {
                    conv: Conv2dConfig::new([c_in, c_out], [4, 4])
                        .with_stride([2, 2])
                        .with_padding(PaddingConfig2d::Explicit(1, 1))
                        .init(device),
                    bn: BatchNormConfig::new(c_out).init(device),
                    activation: LeakyReluConfig::new()
                        .with_negative_slope(self.leaky_relu_slope)
                        .init(),
                    residual: ResidualBlock::new(c_out, device),
                }
            })
            .collect();

        let ups = (0..self.num_downs)
            .rev()
            .map(|level| {
                let (c_in, c_out) = (self.width(level + 1), self.width(level));
                UpBlock {
                    deconv: ConvTranspose2dConfig::new([c_in, c_out], [3, 3])
                        .with_stride([2, 2])
                        .with_padding([1, 1])
                        .with_padding_out([1, 1])
                        .init(device),
                    bn: BatchNormConfig::new(c_out).init(device),
                    activation: Relu::new(),
                    residual: ResidualBlock::new(c_out, device),
                    fuse: Conv2dConfig::new([2 * c_out, c_out], [1, 1]).init(device),
                }
            })
            .collect();

        ResUnetGenerator {
            stem: Conv2dConfig::new([self.input_channels, self.ngf], [3, 3])
                .with_padding(PaddingConfig2d::Explicit(1, 1))
                .init(device),
            stem_bn: BatchNormConfig::new(self.ngf).init(device),
            stem_activation: Relu::new(),
            stem_residual: ResidualBlock::new(self.ngf, device),
            downs,
            ups,
            head: Conv2dConfig::new([self.ngf, self.output_channels], [1, 1]).init(device),
        }
    }
}

impl<B: Backend> ResUnetGenerator<B> {
    pub fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        let mut x = self.stem.forward(input);
        x = self.stem_bn.forward(x);
        x = self.stem_activation.forward(x);
        x = self.stem_residual.forward(x);

        let mut skips = Vec::with_capacity(self.downs.len());
        for down in &self.downs {
            skips.push(x.clone());
            x = down.forward(x);
        }
        for (up, skip) in self.ups.iter().zip(skips.into_iter().rev()) {
            x = up.forward(x, skip);
        }
        self.head.forward(x)
    }
}

impl<B: Backend> CompositionModel<B> for ResUnetGenerator<B> {
    fn render(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        self.forward(input)
    }
}

#[derive(Config, Debug)]
pub struct TryOnModelConfig {
    pub warp: FlowWarpNetConfig,
    pub generator: ResUnetGeneratorConfig,
}

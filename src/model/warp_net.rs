use burn::{
    nn::{
        LeakyRelu, LeakyReluConfig, PaddingConfig2d,
        conv::{Conv2d, Conv2dConfig},
    },
    prelude::*,
};

use crate::model::constants::{NUM_SCALES, WARP_CONDITION_CHANNELS};
use crate::model::flow::{resize, warp_by_flow};
use crate::model::warp::{WarpModel, WarpOutput, scaled_len};

#[derive(Config, Debug)]
pub struct FlowWarpNetConfig {
    #[config(default = "WARP_CONDITION_CHANNELS")]
    pub condition_channels: usize,
    /// Clothing RGB plus its silhouette.
    #[config(default = 4)]
    pub clothes_channels: usize,
    #[config(default = 64)]
    pub base_channels: usize,
    #[config(default = 0.1)]
    pub leaky_relu_slope: f64,
}

/// One level of a feature pyramid; level 0 keeps full resolution.
#[derive(Module, Debug)]
pub struct EncoderLevel<B: Backend> {
    down: Conv2d<B>,
    refine: Conv2d<B>,
    activation: LeakyRelu,
}

impl<B: Backend> EncoderLevel<B> {
    pub fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = self.activation.forward(self.down.forward(input));
        self.activation.forward(self.refine.forward(x))
    }
}

/// Predicts a flow refinement from warped clothing and conditioning features.
#[derive(Module, Debug)]
pub struct FlowHead<B: Backend> {
    hidden: Conv2d<B>,
    out: Conv2d<B>,
    activation: LeakyRelu,
}

impl<B: Backend> FlowHead<B> {
    pub fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = self.activation.forward(self.hidden.forward(input));
        self.out.forward(x)
    }
}

/// Coarse-to-fine appearance-flow warping network.
#[derive(Module, Debug)]
pub struct FlowWarpNet<B: Backend> {
    condition_encoder: Vec<EncoderLevel<B>>,
    clothes_encoder: Vec<EncoderLevel<B>>,
    /// Indexed by pyramid stage, coarse first.
    heads: Vec<FlowHead<B>>,
}

impl FlowWarpNetConfig {
    fn widths(&self) -> Vec<usize> {
        (0..NUM_SCALES)
            .map(|level| self.base_channels * (1 << level.min(2)))
            .collect()
    }

    fn encoder<B: Backend>(&self, in_channels: usize, device: &B::Device) -> Vec<EncoderLevel<B>> {
        let widths = self.widths();
        let mut levels = Vec::with_capacity(NUM_SCALES);
        let mut c_in = in_channels;
        for (level, &c_out) in widths.iter().enumerate() {
            let stride = if level == 0 { 1 } else { 2 };
            levels.push(EncoderLevel {
                down: Conv2dConfig::new([c_in, c_out], [3, 3])
                    .with_stride([stride, stride])
                    .with_padding(PaddingConfig2d::Explicit(1, 1))
                    .init(device),
                refine: Conv2dConfig::new([c_out, c_out], [3, 3])
                    .with_padding(PaddingConfig2d::Explicit(1, 1))
                    .init(device),
                activation: LeakyReluConfig::new()
                    .with_negative_slope(self.leaky_relu_slope)
                    .init(),
            });
            c_in = c_out;
        }
        levels
    }

    pub fn init<B: Backend>(&self, device: &B::Device) -> FlowWarpNet<B> {
        let widths = self.widths();
        let heads = (0..NUM_SCALES)
            .map(|stage| {
                let c = widths[NUM_SCALES - 1 - stage];
                FlowHead {
                    hidden: Conv2dConfig::new([2 * c, c], [3, 3])
                        .with_padding(PaddingConfig2d::Explicit(1, 1))
                        .init(device),
                    out: Conv2dConfig::new([c, 2], [3, 3])
                        .with_padding(PaddingConfig2d::Explicit(1, 1))
                        .init(device),
                    activation: LeakyReluConfig::new()
                        .with_negative_slope(self.leaky_relu_slope)
                        .init(),
                }
            })
            .collect();

        FlowWarpNet {
            condition_encoder: self.encoder(self.condition_channels, device),
            clothes_encoder: self.encoder(self.clothes_channels, device),
            heads,
        }
    }
}

fn pyramid<B: Backend>(levels: &[EncoderLevel<B>], input: Tensor<B, 4>) -> Vec<Tensor<B, 4>> {
    let mut features = Vec::with_capacity(levels.len());
    let mut x = input;
    for level in levels {
        x = level.forward(x);
        features.push(x.clone());
    }
    features
}

impl<B: Backend> WarpModel<B> for FlowWarpNet<B> {
    fn warp(
        &self,
        condition: Tensor<B, 4>,
        clothes: Tensor<B, 4>,
        clothes_edge: Tensor<B, 4>,
    ) -> WarpOutput<B> {
        let [batch, _, height, width] = clothes.dims();
        let device = clothes.device();

        let condition_features = pyramid(&self.condition_encoder, condition);
        let clothes_features = pyramid(
            &self.clothes_encoder,
            Tensor::cat(vec![clothes.clone(), clothes_edge.clone()], 1),
        );

        let mut flow: Option<Tensor<B, 4>> = None;
        let mut output = WarpOutput {
            warped_cloth: clothes.clone(),
            last_flow: Tensor::zeros([batch, 2, height, width], &device),
            flow_all: Vec::with_capacity(NUM_SCALES),
            delta_list: Vec::with_capacity(NUM_SCALES),
            x_all: Vec::with_capacity(NUM_SCALES),
            x_edge_all: Vec::with_capacity(NUM_SCALES),
            delta_x_all: Vec::with_capacity(NUM_SCALES),
            delta_y_all: Vec::with_capacity(NUM_SCALES),
        };

        for (stage, head) in self.heads.iter().enumerate() {
            let level = NUM_SCALES - 1 - stage;
            let (h, w) = (scaled_len(height, stage), scaled_len(width, stage));
            let cond = resize(condition_features[level].clone(), h, w);
            let cloth_feat = resize(clothes_features[level].clone(), h, w);

            let prior = match flow.take() {
                Some(previous) => resize(previous, h, w),
                None => Tensor::zeros([batch, 2, h, w], &device),
            };
            let warped_feat = warp_by_flow(cloth_feat, prior.clone());
            let delta = head.forward(Tensor::cat(vec![warped_feat, cond], 1));
            let current = prior + delta.clone();

            let x = warp_by_flow(resize(clothes.clone(), h, w), current.clone());
            let x_edge = warp_by_flow(resize(clothes_edge.clone(), h, w), current.clone());

            output.delta_x_all.push(delta.clone().slice([0..batch, 0..1, 0..h, 0..w]));
            output.delta_y_all.push(delta.clone().slice([0..batch, 1..2, 0..h, 0..w]));
            output.delta_list.push(delta);
            output.x_all.push(x);
            output.x_edge_all.push(x_edge);
            output.flow_all.push(current.clone());
            flow = Some(current);
        }

        output.warped_cloth = output.x_all[NUM_SCALES - 1].clone();
        if let Some(last) = flow {
            output.last_flow = last;
        }
        output
    }
}

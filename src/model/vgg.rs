use burn::{
    nn::{
        PaddingConfig2d, Relu,
        conv::{Conv2d, Conv2dConfig},
        pool::{MaxPool2d, MaxPool2dConfig},
    },
    prelude::*,
    record::CompactRecorder,
};
use std::path::Path;

use crate::error::{Result, TryOnError};

/// Feature weights for relu1_1 .. relu5_1, deepest counts most.
pub const FEATURE_WEIGHTS: [f32; 5] = [1.0 / 32.0, 1.0 / 16.0, 1.0 / 8.0, 1.0 / 4.0, 1.0];

/// Convolutions finishing one VGG stage, an optional pool, then the first
/// convolution of the next stage whose activation is the emitted feature.
#[derive(Module, Debug)]
pub struct VggSlice<B: Backend> {
    pre: Vec<Conv2d<B>>,
    pool: Option<MaxPool2d>,
    post: Conv2d<B>,
    activation: Relu,
}

impl<B: Backend> VggSlice<B> {
    fn new(channels: &[usize], pool: bool, out: usize, device: &B::Device) -> Self {
        let conv = |c_in: usize, c_out: usize| {
            Conv2dConfig::new([c_in, c_out], [3, 3])
                .with_padding(PaddingConfig2d::Explicit(1, 1))
                .init(device)
        };
        let pre = channels.windows(2).map(|pair| conv(pair[0], pair[1])).collect();
        let last = *channels.last().unwrap_or(&3);
        Self {
            pre,
            pool: pool.then(|| MaxPool2dConfig::new([2, 2]).with_strides([2, 2]).init()),
            post: conv(last, out),
            activation: Relu::new(),
        }
    }

    pub fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        let mut x = input;
        for conv in &self.pre {
            x = self.activation.forward(conv.forward(x));
        }
        // coarse pyramid levels are too small for every pool
        let [_, _, height, width] = x.dims();
        if let Some(pool) = &self.pool {
            if height >= 2 && width >= 2 {
                x = pool.forward(x);
            }
        }
        self.activation.forward(self.post.forward(x))
    }
}

/// VGG19 trunk cut at relu1_1, relu2_1, relu3_1, relu4_1 and relu5_1.
#[derive(Module, Debug)]
pub struct Vgg19Features<B: Backend> {
    slices: Vec<VggSlice<B>>,
}

impl<B: Backend> Vgg19Features<B> {
    pub fn new(device: &B::Device) -> Self {
        let slices = vec![
            VggSlice::new(&[3], false, 64, device),
            VggSlice::new(&[64, 64], true, 128, device),
            VggSlice::new(&[128, 128], true, 256, device),
            VggSlice::new(&[256, 256, 256, 256], true, 512, device),
            VggSlice::new(&[512, 512, 512, 512], true, 512, device),
        ];
        Self { slices }
    }

    pub fn forward(&self, input: Tensor<B, 4>) -> Vec<Tensor<B, 4>> {
        let mut features = Vec::with_capacity(self.slices.len());
        let mut x = input;
        for slice in &self.slices {
            x = slice.forward(x);
            features.push(x.clone());
        }
        features
    }
}

/// Perceptual distance: weighted L1 between VGG19 activations.
/// The target branch is detached and the trunk itself is frozen.
#[derive(Module, Debug)]
pub struct VggLoss<B: Backend> {
    features: Vgg19Features<B>,
}

impl<B: Backend> VggLoss<B> {
    pub fn new(device: &B::Device) -> Self {
        Self {
            features: Vgg19Features::new(device).no_grad(),
        }
    }

    /// Loads trunk weights from a burn record file.
    pub fn from_record<P: AsRef<Path>>(path: P, device: &B::Device) -> Result<Self> {
        let path = path.as_ref();
        let features = Vgg19Features::new(device)
            .load_file(path.to_path_buf(), &CompactRecorder::new(), device)
            .map_err(|err| TryOnError::Checkpoint {
                path: path.to_path_buf(),
                reason: err.to_string(),
            })?;
        Ok(Self {
            features: features.no_grad(),
        })
    }

    pub fn forward(&self, prediction: Tensor<B, 4>, target: Tensor<B, 4>) -> Tensor<B, 1> {
        let device = prediction.device();
        let pred_features = self.features.forward(prediction);
        let target_features = self.features.forward(target.detach());
        pred_features
            .into_iter()
            .zip(target_features)
            .zip(FEATURE_WEIGHTS)
            .fold(Tensor::zeros([1], &device), |acc, ((p, t), weight)| {
                acc + (p - t.detach()).abs().mean().mul_scalar(weight)
            })
    }
}

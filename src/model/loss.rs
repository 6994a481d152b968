//! Loss functors consumed by the per-step objective.

use burn::prelude::*;

use crate::model::vgg::VggLoss;

/// Distance between a prediction and its target, reduced to a scalar.
pub trait PairCriterion<B: Backend> {
    fn distance(&self, prediction: Tensor<B, 4>, target: Tensor<B, 4>) -> Tensor<B, 1>;
}

/// Regularizer over a single field, reduced to a scalar.
pub trait FieldCriterion<B: Backend> {
    fn penalty(&self, field: Tensor<B, 4>) -> Tensor<B, 1>;
}

/// Mean absolute error.
#[derive(Debug, Clone, Copy, Default)]
pub struct L1Loss;

impl<B: Backend> PairCriterion<B> for L1Loss {
    fn distance(&self, prediction: Tensor<B, 4>, target: Tensor<B, 4>) -> Tensor<B, 1> {
        let (pred_dims, target_dims) = (prediction.dims(), target.dims());
        assert_eq!(
            pred_dims, target_dims,
            "Shape of predictions ({pred_dims:?}) must match targets ({target_dims:?})"
        );
        (prediction - target).abs().mean()
    }
}

/// Total variation: mean absolute difference between vertical neighbours
/// plus mean absolute difference between horizontal neighbours.
#[derive(Debug, Clone, Copy, Default)]
pub struct TvLoss;

impl<B: Backend> FieldCriterion<B> for TvLoss {
    fn penalty(&self, field: Tensor<B, 4>) -> Tensor<B, 1> {
        let [batch, channels, height, width] = field.dims();
        let device = field.device();
        let mut total = Tensor::zeros([1], &device);
        if height > 1 {
            let below = field.clone().slice([0..batch, 0..channels, 1..height, 0..width]);
            let above = field.clone().slice([0..batch, 0..channels, 0..height - 1, 0..width]);
            total = total + (below - above).abs().mean();
        }
        if width > 1 {
            let right = field.clone().slice([0..batch, 0..channels, 0..height, 1..width]);
            let left = field.slice([0..batch, 0..channels, 0..height, 0..width - 1]);
            total = total + (right - left).abs().mean();
        }
        total
    }
}

impl<B: Backend> PairCriterion<B> for VggLoss<B> {
    fn distance(&self, prediction: Tensor<B, 4>, target: Tensor<B, 4>) -> Tensor<B, 1> {
        self.forward(prediction, target)
    }
}

/// Robust sub-quadratic penalty `mean((x^2 + eps^2)^exponent)`.
pub fn charbonnier<B: Backend>(field: Tensor<B, 4>, epsilon: f32, exponent: f32) -> Tensor<B, 1> {
    field
        .powf_scalar(2.0)
        .add_scalar(epsilon * epsilon)
        .powf_scalar(exponent)
        .mean()
}

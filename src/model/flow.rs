//! Differentiable flow warping on normalized `[-1, 1]` grids.

use burn::prelude::*;
use burn::tensor::module::interpolate;
use burn::tensor::ops::{InterpolateMode, InterpolateOptions};

/// Bilinear resize to `[height, width]`.
pub fn resize<B: Backend>(tensor: Tensor<B, 4>, height: usize, width: usize) -> Tensor<B, 4> {
    let [_, _, h, w] = tensor.dims();
    if h == height && w == width {
        return tensor;
    }
    interpolate(
        tensor,
        [height, width],
        InterpolateOptions::new(InterpolateMode::Bilinear),
    )
}

/// Source taps of a half-pixel-centred linear resample along one axis:
/// lower index, upper index and the weight of the upper one.
fn half_pixel_taps(input: usize, output: usize) -> (Vec<i64>, Vec<i64>, Vec<f32>) {
    let ratio = input as f32 / output as f32;
    let last = input.saturating_sub(1);
    let mut lower = Vec::with_capacity(output);
    let mut upper = Vec::with_capacity(output);
    let mut weight = Vec::with_capacity(output);
    for i in 0..output {
        let src = ((i as f32 + 0.5) * ratio - 0.5).max(0.0);
        let low = (src.floor() as usize).min(last);
        lower.push(low as i64);
        upper.push((low + 1).min(last) as i64);
        weight.push(src - low as f32);
    }
    (lower, upper, weight)
}

fn resample_axis<B: Backend>(tensor: Tensor<B, 4>, dim: usize, output: usize) -> Tensor<B, 4> {
    let input = tensor.dims()[dim];
    if input == output {
        return tensor;
    }
    let device = tensor.device();
    let (lower, upper, weight) = half_pixel_taps(input, output);
    let index = |taps: Vec<i64>| {
        Tensor::<B, 1, Int>::from_data(
            TensorData::new(taps, [output]).convert::<B::IntElem>(),
            &device,
        )
    };
    let mut shape = [1, 1, 1, 1];
    shape[dim] = output;
    let weight = Tensor::<B, 1>::from_data(
        TensorData::new(weight, [output]).convert::<B::FloatElem>(),
        &device,
    )
    .reshape(shape);

    let low = tensor.clone().select(dim, index(lower));
    let high = tensor.select(dim, index(upper));
    low.clone() + (high - low) * weight
}

/// Bilinear resize with half-pixel centres, the convention the pyramid loss
/// targets are defined in. A 2x reduction averages each 2x2 block. Unlike
/// [`resize`] the corners are not pinned to the source corners.
pub fn downsample<B: Backend>(tensor: Tensor<B, 4>, height: usize, width: usize) -> Tensor<B, 4> {
    let rows = resample_axis(tensor, 2, height);
    resample_axis(rows, 3, width)
}

/// Normalized pixel centers with corners aligned: `-1` at index 0, `1` at `len - 1`.
fn axis_coords(len: usize) -> Vec<f32> {
    if len <= 1 {
        return vec![0.0; len];
    }
    (0..len)
        .map(|i| 2.0 * i as f32 / (len - 1) as f32 - 1.0)
        .collect()
}

/// Identity sampling grid as `[1, 2, H, W]` (x then y).
pub fn base_grid<B: Backend>(height: usize, width: usize, device: &B::Device) -> Tensor<B, 4> {
    let xs = axis_coords(width);
    let ys = axis_coords(height);
    let mut data = Vec::with_capacity(2 * height * width);
    for _ in 0..height {
        data.extend_from_slice(&xs);
    }
    for &y in &ys {
        data.extend(std::iter::repeat_n(y, width));
    }
    Tensor::from_data(
        TensorData::new(data, [1, 2, height, width]).convert::<B::FloatElem>(),
        device,
    )
}

/// Samples `source` at `grid + flow` with bilinear weights, clamping at the border.
///
/// `flow` is `[batch, 2, H, W]` in normalized units and must match the spatial
/// size of `source`.
pub fn warp_by_flow<B: Backend>(source: Tensor<B, 4>, flow: Tensor<B, 4>) -> Tensor<B, 4> {
    let [batch, channels, height, width] = source.dims();
    let device = source.device();
    let coords = base_grid::<B>(height, width, &device) + flow;

    let to_pixels = |normalized: Tensor<B, 4>, len: usize| {
        normalized
            .add_scalar(1.0)
            .mul_scalar(0.5 * (len.max(1) - 1) as f32)
            .clamp(0.0, (len.max(1) - 1) as f32)
    };
    let px = to_pixels(coords.clone().slice([0..batch, 0..1, 0..height, 0..width]), width);
    let py = to_pixels(coords.slice([0..batch, 1..2, 0..height, 0..width]), height);

    // coordinates are non-negative, so truncation is floor
    let x0 = px.clone().int().float();
    let y0 = py.clone().int().float();
    let x1 = x0.clone().add_scalar(1.0).clamp_max((width - 1) as f32);
    let y1 = y0.clone().add_scalar(1.0).clamp_max((height - 1) as f32);
    let wx = px - x0.clone();
    let wy = py - y0.clone();

    let flat = source.reshape([batch, channels, height * width]);
    let gather = |ys: &Tensor<B, 4>, xs: &Tensor<B, 4>| {
        let index = (ys.clone().mul_scalar(width as f32) + xs.clone())
            .reshape([batch, 1, height * width])
            .int();
        let index = Tensor::cat(vec![index; channels], 1);
        flat.clone()
            .gather(2, index)
            .reshape([batch, channels, height, width])
    };

    let top = gather(&y0, &x0) * (wx.ones_like() - wx.clone()) + gather(&y0, &x1) * wx.clone();
    let bottom = gather(&y1, &x0) * (wx.ones_like() - wx.clone()) + gather(&y1, &x1) * wx;
    top * (wy.ones_like() - wy.clone()) + bottom * wy
}

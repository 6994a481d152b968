use burn::prelude::*;
use burn::tensor::activation;

use crate::error::{Result, TryOnError};
use crate::model::constants::{CHANNELS, GENERATOR_OUTPUT_CHANNELS};
use crate::model::masks::SemanticMasks;
use crate::model::warp::WarpOutput;

/// The generative stage: renders the person and predicts the blend mask.
pub trait CompositionModel<B: Backend> {
    /// Maps `[batch, 8, H, W]` to raw `[batch, 4, H, W]` logits.
    fn render(&self, input: Tensor<B, 4>) -> Tensor<B, 4>;
}

#[derive(Debug, Clone)]
pub struct Composite<B: Backend> {
    /// Synthesized person in `[-1, 1]`.
    pub p_rendered: Tensor<B, 4>,
    /// Blend weight of the warped cloth in `[0, 1]`, zero outside its silhouette.
    pub m_composite: Tensor<B, 4>,
    pub p_tryon: Tensor<B, 4>,
    pub warped_cloth: Tensor<B, 4>,
    pub warped_edge: Tensor<B, 4>,
}

/// `[preserve_region, warped_cloth, warped_edge, dense_preserve_mask]` along channels.
pub fn generator_input<B: Backend>(masks: &SemanticMasks<B>, warp: &WarpOutput<B>) -> Tensor<B, 4> {
    Tensor::cat(
        vec![
            masks.preserve_region.clone(),
            warp.warped_cloth.clone(),
            warp.warped_edge(),
            masks.dense_preserve_mask.clone(),
        ],
        1,
    )
}

/// Splits generator logits and alpha-blends the warped cloth over the rendering.
pub fn compose<B: Backend>(
    logits: Tensor<B, 4>,
    warped_cloth: Tensor<B, 4>,
    warped_edge: Tensor<B, 4>,
) -> Result<Composite<B>> {
    let [batch, channels, height, width] = logits.dims();
    if channels != GENERATOR_OUTPUT_CHANNELS {
        return Err(TryOnError::GeneratorChannels {
            expected: GENERATOR_OUTPUT_CHANNELS,
            actual: channels,
        });
    }
    if warped_cloth.dims() != [batch, CHANNELS, height, width] {
        return Err(TryOnError::shape_mismatch(
            "warped cloth vs generator output",
            &warped_cloth.dims(),
            &[batch, CHANNELS, height, width],
        ));
    }

    let p_rendered = activation::tanh(logits.clone().slice([0..batch, 0..CHANNELS, 0..height, 0..width]));
    let m_composite = activation::sigmoid(logits.slice([
        0..batch,
        CHANNELS..GENERATOR_OUTPUT_CHANNELS,
        0..height,
        0..width,
    ])) * warped_edge.clone();

    let p_tryon = warped_cloth.clone() * m_composite.clone()
        + p_rendered.clone() * (m_composite.ones_like() - m_composite.clone());

    Ok(Composite {
        p_rendered,
        m_composite,
        p_tryon,
        warped_cloth,
        warped_edge,
    })
}

pub fn run_composition_stage<B: Backend, G: CompositionModel<B> + ?Sized>(
    model: &G,
    masks: &SemanticMasks<B>,
    warp: &WarpOutput<B>,
) -> Result<Composite<B>> {
    let logits = model.render(generator_input(masks, warp));
    compose(logits, warp.warped_cloth.clone(), warp.warped_edge())
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;
    use burn::tensor::Distribution;

    type TestBackend = NdArray;

    fn values(tensor: Tensor<TestBackend, 4>) -> Vec<f32> {
        tensor.into_data().to_vec::<f32>().unwrap()
    }

    #[test]
    fn outputs_are_bounded_for_extreme_logits() {
        let device = Default::default();
        let logits =
            Tensor::<TestBackend, 4>::random([2, 4, 3, 3], Distribution::Uniform(-50.0, 50.0), &device);
        let cloth = Tensor::random([2, 3, 3, 3], Distribution::Uniform(-1.0, 1.0), &device);
        let edge = Tensor::ones([2, 1, 3, 3], &device);

        let composite = compose(logits, cloth, edge).unwrap();
        assert!(values(composite.m_composite).iter().all(|v| (0.0..=1.0).contains(v)));
        assert!(values(composite.p_rendered).iter().all(|v| (-1.0..=1.0).contains(v)));
    }

    #[test]
    fn tryon_is_convex_blend() {
        let device = Default::default();
        let logits = Tensor::<TestBackend, 4>::random([1, 4, 2, 2], Distribution::Default, &device);
        let cloth = Tensor::random([1, 3, 2, 2], Distribution::Uniform(-1.0, 1.0), &device);
        let edge = Tensor::<TestBackend, 4>::from_data(
            TensorData::new(vec![1.0, 0.0, 1.0, 1.0], [1, 1, 2, 2]),
            &device,
        );
        let composite = compose(logits, cloth.clone(), edge).unwrap();

        let m = composite.m_composite.clone();
        let expected = cloth * m.clone() + composite.p_rendered.clone() * (m.ones_like() - m);
        for (a, e) in values(composite.p_tryon).iter().zip(values(expected).iter()) {
            assert!((a - e).abs() < 1e-6);
        }
    }

    #[test]
    fn mask_is_zero_outside_warped_silhouette() {
        let device = Default::default();
        let logits = Tensor::<TestBackend, 4>::full([1, 4, 1, 2], 3.0, &device);
        let cloth = Tensor::ones([1, 3, 1, 2], &device);
        let edge = Tensor::<TestBackend, 4>::from_data(TensorData::new(vec![0.0, 1.0], [1, 1, 1, 2]), &device);

        let composite = compose(logits, cloth, edge).unwrap();
        let mask = values(composite.m_composite);
        assert_eq!(mask[0], 0.0);
        assert!((mask[1] - 1.0 / (1.0 + (-3.0f32).exp())).abs() < 1e-6);
        // outside the silhouette the rendering shows through untouched
        let tryon = values(composite.p_tryon);
        assert!((tryon[0] - 3.0f32.tanh()).abs() < 1e-6);
    }

    #[test]
    fn wrong_channel_count_is_rejected() {
        let device = Default::default();
        let logits = Tensor::<TestBackend, 4>::zeros([1, 3, 2, 2], &device);
        let result = compose(logits, Tensor::zeros([1, 3, 2, 2], &device), Tensor::zeros([1, 1, 2, 2], &device));
        assert!(matches!(
            result,
            Err(TryOnError::GeneratorChannels { expected: 4, actual: 3 })
        ));
    }
}

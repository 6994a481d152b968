//! Multi-term objectives of the warping and composition stages.

use burn::prelude::*;

use crate::error::{Result, TryOnError};
use crate::model::composition::Composite;
use crate::model::constants::NUM_SCALES;
use crate::model::flow::downsample;
use crate::model::loss::{FieldCriterion, PairCriterion, charbonnier};
use crate::model::masks::SemanticMasks;
use crate::model::warp::{WarpOutput, scaled_len};

#[derive(Config, Debug)]
pub struct LossWeightsConfig {
    #[config(default = 1.0)]
    pub warp_l1: f32,
    #[config(default = 0.2)]
    pub warp_vgg: f32,
    #[config(default = 2.0)]
    pub warp_edge: f32,
    #[config(default = 6.0)]
    pub warp_second_smooth: f32,
    #[config(default = 0.001)]
    pub flow_epsilon: f32,
    #[config(default = 0.45)]
    pub flow_exponent: f32,
    #[config(default = 0.01)]
    pub tv: f32,
    #[config(default = 5.0)]
    pub gen_l1: f32,
    #[config(default = 1.0)]
    pub gen_vgg: f32,
    #[config(default = 1.0)]
    pub gen_mask: f32,
    #[config(default = 0.5)]
    pub warp_total: f32,
    #[config(default = 1.0)]
    pub gen_total: f32,
}

/// Loss functors shared by both stages.
pub struct Criteria<'a, B: Backend> {
    pub smoothness: &'a dyn FieldCriterion<B>,
    pub l1: &'a dyn PairCriterion<B>,
    pub perceptual: &'a dyn PairCriterion<B>,
}

fn ensure_same(context: &str, left: [usize; 4], right: [usize; 4]) -> Result<()> {
    if left != right {
        return Err(TryOnError::shape_mismatch(context, &left, &right));
    }
    Ok(())
}

/// Pyramid reconstruction, edge and flow-smoothness loss.
///
/// Stage `n` is weighted by `n + 1` so finer scales count more. The total
/// variation of every flow refinement is added once at the end.
pub fn warp_loss<B: Backend>(
    weights: &LossWeightsConfig,
    warp: &WarpOutput<B>,
    masks: &SemanticMasks<B>,
    criteria: &Criteria<'_, B>,
) -> Result<Tensor<B, 1>> {
    warp.validate()?;
    let [_, _, height, width] = masks.person_clothes.dims();
    let device = masks.person_clothes.device();

    let mut total = Tensor::<B, 1>::zeros([1], &device);
    for stage in 0..NUM_SCALES {
        let (h, w) = (scaled_len(height, stage), scaled_len(width, stage));
        let cur_person_clothes = downsample(masks.person_clothes.clone(), h, w);
        let cur_person_clothes_edge = downsample(masks.person_clothes_edge.clone(), h, w);

        let x = warp.x_all[stage].clone();
        let x_edge = warp.x_edge_all[stage].clone();
        ensure_same("warped cloth vs target", x.dims(), cur_person_clothes.dims())?;
        ensure_same("warped edge vs target", x_edge.dims(), cur_person_clothes_edge.dims())?;

        let loss_l1 = criteria.l1.distance(x.clone(), cur_person_clothes.clone());
        let loss_vgg = criteria.perceptual.distance(x, cur_person_clothes);
        let loss_edge = criteria.l1.distance(x_edge, cur_person_clothes_edge);

        let loss_flow_x = charbonnier(
            warp.delta_x_all[stage].clone(),
            weights.flow_epsilon,
            weights.flow_exponent,
        );
        let loss_flow_y = charbonnier(
            warp.delta_y_all[stage].clone(),
            weights.flow_epsilon,
            weights.flow_exponent,
        );
        let loss_second_smooth = loss_flow_x + loss_flow_y;

        let scale = (stage + 1) as f32;
        total = total
            + loss_l1.mul_scalar(scale * weights.warp_l1)
            + loss_vgg.mul_scalar(scale * weights.warp_vgg)
            + loss_edge.mul_scalar(scale * weights.warp_edge)
            + loss_second_smooth.mul_scalar(scale * weights.warp_second_smooth);
    }

    let loss_smooth = warp
        .delta_list
        .iter()
        .fold(Tensor::<B, 1>::zeros([1], &device), |acc, delta| {
            acc + criteria.smoothness.penalty(delta.clone())
        });

    Ok(total + loss_smooth.mul_scalar(weights.tv))
}

/// Mask supervision plus pixel and perceptual distance of the try-on result.
pub fn generation_loss<B: Backend>(
    weights: &LossWeightsConfig,
    composite: &Composite<B>,
    masks: &SemanticMasks<B>,
    real_image: &Tensor<B, 4>,
    criteria: &Criteria<'_, B>,
) -> Result<Tensor<B, 1>> {
    ensure_same(
        "composite mask vs clothes silhouette",
        composite.m_composite.dims(),
        masks.person_clothes_edge.dims(),
    )?;
    ensure_same("try-on vs real image", composite.p_tryon.dims(), real_image.dims())?;

    let loss_mask_l1 = criteria.l1.distance(
        masks.person_clothes_edge.clone(),
        composite.m_composite.clone(),
    );
    let loss_l1 = criteria.l1.distance(composite.p_tryon.clone(), real_image.clone());
    let loss_vgg = criteria
        .perceptual
        .distance(composite.p_tryon.clone(), real_image.clone());

    Ok(loss_l1.mul_scalar(weights.gen_l1)
        + loss_vgg.mul_scalar(weights.gen_vgg)
        + loss_mask_l1.mul_scalar(weights.gen_mask))
}

/// The quantity that is backpropagated.
pub fn combined_loss<B: Backend>(
    weights: &LossWeightsConfig,
    warp_loss: Tensor<B, 1>,
    gen_loss: Tensor<B, 1>,
) -> Tensor<B, 1> {
    warp_loss.mul_scalar(weights.warp_total) + gen_loss.mul_scalar(weights.gen_total)
}

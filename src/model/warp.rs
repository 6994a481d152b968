use burn::prelude::*;

use crate::error::{Result, TryOnError};
use crate::model::constants::NUM_SCALES;
use crate::model::masks::SemanticMasks;

/// Resolution factor of pyramid stage `stage`; the last stage is full size.
pub fn scale_factor(stage: usize) -> f64 {
    0.5f64.powi((NUM_SCALES - 1 - stage) as i32)
}

/// Spatial length of `len` at pyramid stage `stage`.
pub fn scaled_len(len: usize, stage: usize) -> usize {
    ((len as f64 * scale_factor(stage)).floor() as usize).max(1)
}

/// Everything the warping network produces for one batch.
///
/// Per-scale sequences run coarse to fine and hold `NUM_SCALES` entries.
#[derive(Debug, Clone)]
pub struct WarpOutput<B: Backend> {
    /// Clothing warped at full resolution, `[batch, 3, H, W]`.
    pub warped_cloth: Tensor<B, 4>,
    /// Full-resolution flow, `[batch, 2, H, W]`.
    pub last_flow: Tensor<B, 4>,
    /// Accumulated flow at each scale.
    pub flow_all: Vec<Tensor<B, 4>>,
    /// Flow refinements fed to the total-variation term.
    pub delta_list: Vec<Tensor<B, 4>>,
    pub x_all: Vec<Tensor<B, 4>>,
    pub x_edge_all: Vec<Tensor<B, 4>>,
    pub delta_x_all: Vec<Tensor<B, 4>>,
    pub delta_y_all: Vec<Tensor<B, 4>>,
}

impl<B: Backend> WarpOutput<B> {
    pub fn validate(&self) -> Result<()> {
        let pyramids = [
            ("x_all", self.x_all.len()),
            ("x_edge_all", self.x_edge_all.len()),
            ("delta_x_all", self.delta_x_all.len()),
            ("delta_y_all", self.delta_y_all.len()),
        ];
        for (field, actual) in pyramids {
            if actual != NUM_SCALES {
                return Err(TryOnError::ScaleCount {
                    field,
                    expected: NUM_SCALES,
                    actual,
                });
            }
        }
        Ok(())
    }

    /// Warped clothing silhouette at full resolution.
    pub fn warped_edge(&self) -> Tensor<B, 4> {
        self.x_edge_all[NUM_SCALES - 1].clone()
    }
}

/// The geometric stage: aligns clothing to the person.
pub trait WarpModel<B: Backend> {
    fn warp(
        &self,
        condition: Tensor<B, 4>,
        clothes: Tensor<B, 4>,
        clothes_edge: Tensor<B, 4>,
    ) -> WarpOutput<B>;
}

/// Feeds the conditioning, masked clothing and clothing edge to `model`.
pub fn run_warp_stage<B: Backend, W: WarpModel<B> + ?Sized>(
    model: &W,
    masks: &SemanticMasks<B>,
) -> Result<WarpOutput<B>> {
    let output = model.warp(
        masks.concat.clone(),
        masks.clothes.clone(),
        masks.pre_clothes_edge.clone(),
    );
    output.validate()?;
    Ok(output)
}

use burn::prelude::*;

use crate::error::Result;
use crate::model::composition::{Composite, CompositionModel, run_composition_stage};
use crate::model::data::TryOnBatch;
use crate::model::diagnostics::DiagnosticSink;
use crate::model::masks::SemanticMasks;
use crate::model::objective::{
    Criteria, LossWeightsConfig, combined_loss, generation_loss, warp_loss,
};
use crate::model::warp::{WarpModel, WarpOutput, run_warp_stage};

/// Everything a single forward pass produces.
#[derive(Debug, Clone)]
pub struct StepOutput<B: Backend> {
    pub warp_loss: Tensor<B, 1>,
    pub gen_loss: Tensor<B, 1>,
    /// The quantity to backpropagate.
    pub total: Tensor<B, 1>,
    pub masks: SemanticMasks<B>,
    pub warp: WarpOutput<B>,
    pub composite: Composite<B>,
}

/// One training forward pass: masks, warping, composition and the losses.
///
/// Diagnostics are only written when a sink is given and `step` is due.
/// They never fail the step.
pub fn run_once<B, W, G>(
    weights: &LossWeightsConfig,
    batch: &TryOnBatch<B>,
    step: usize,
    warp_model: &W,
    gen_model: &G,
    criteria: &Criteria<'_, B>,
    diagnostics: Option<&mut DiagnosticSink<'_>>,
) -> Result<StepOutput<B>>
where
    B: Backend,
    W: WarpModel<B> + ?Sized,
    G: CompositionModel<B> + ?Sized,
{
    let masks = SemanticMasks::build(batch);

    let warp = run_warp_stage(warp_model, &masks)?;
    let warp_loss = warp_loss(weights, &warp, &masks, criteria)?;

    let composite = run_composition_stage(gen_model, &masks, &warp)?;
    let gen_loss = generation_loss(weights, &composite, &masks, &batch.image, criteria)?;

    let total = combined_loss(weights, warp_loss.clone(), gen_loss.clone());

    if let Some(sink) = diagnostics {
        if sink.is_due(step) {
            sink.record(step, &batch.image, &masks, &composite);
        }
    }

    Ok(StepOutput {
        warp_loss,
        gen_loss,
        total,
        masks,
        warp,
        composite,
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::model::diagnostics::SampleWriter;
    use crate::model::diagnostics::tests::{RecordingWriter, scratch_dir};
    use crate::model::masks::tests::batch_from_maps;
    use crate::model::objective::tests::{ConstField, ConstPair, flat_pyramid};
    use burn::backend::NdArray;

    type TestBackend = NdArray;

    /// Returns a constant pyramid shaped after the clothing input.
    pub(crate) struct FlatWarp;

    impl<B: Backend> WarpModel<B> for FlatWarp {
        fn warp(
            &self,
            _condition: Tensor<B, 4>,
            clothes: Tensor<B, 4>,
            _clothes_edge: Tensor<B, 4>,
        ) -> WarpOutput<B> {
            let [_, _, height, width] = clothes.dims();
            flat_pyramid(height, width, 0.0, &clothes.device())
        }
    }

    /// Emits zero logits: a grey rendering and a half-open mask.
    pub(crate) struct ZeroGenerator;

    impl<B: Backend> CompositionModel<B> for ZeroGenerator {
        fn render(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
            let [batch, _, height, width] = input.dims();
            Tensor::zeros([batch, 4, height, width], &input.device())
        }
    }

    fn scalar(tensor: Tensor<TestBackend, 1>) -> f32 {
        tensor.into_data().to_vec::<f32>().unwrap()[0]
    }

    fn clothes_only_batch(device: &<TestBackend as Backend>::Device) -> TryOnBatch<TestBackend> {
        batch_from_maps::<TestBackend>(&[4.0; 256], &[15.0; 256], 16, 16, device)
    }

    #[test]
    fn losses_combine_exactly_with_closed_form_collaborators() {
        let device = Default::default();
        let batch = clothes_only_batch(&device);
        let weights = LossWeightsConfig::new()
            .with_flow_epsilon(1.0)
            .with_flow_exponent(1.0);
        let (one, tv) = (ConstPair(1.0), ConstField(1.0));
        let criteria = Criteria {
            smoothness: &tv,
            l1: &one,
            perceptual: &one,
        };

        let output = run_once(&weights, &batch, 1, &FlatWarp, &ZeroGenerator, &criteria, None).unwrap();

        let warp = 15.0 * 15.2 + 0.01 * 5.0;
        let gen_loss = 5.0 + 1.0 + 1.0;
        assert!((scalar(output.warp_loss) - warp).abs() < 1e-3);
        assert!((scalar(output.gen_loss) - gen_loss).abs() < 1e-6);
        assert!((scalar(output.total) - (0.5 * warp + gen_loss)).abs() < 1e-3);
    }

    #[test]
    fn clothes_only_batch_preserves_nothing() {
        let device = Default::default();
        let batch = clothes_only_batch(&device);
        let one = ConstPair(1.0);
        let tv = ConstField(0.0);
        let criteria = Criteria {
            smoothness: &tv,
            l1: &one,
            perceptual: &one,
        };

        let output = run_once(
            &LossWeightsConfig::new(),
            &batch,
            0,
            &FlatWarp,
            &ZeroGenerator,
            &criteria,
            None,
        )
        .unwrap();

        let zeros = |t: Tensor<TestBackend, 4>| t.into_data().to_vec::<f32>().unwrap().iter().all(|v| *v == 0.0);
        assert!(zeros(output.masks.dense_preserve_mask));
        assert!(zeros(output.masks.preserve_region));
        // the warped edge is all ones so the mask is sigmoid(0)
        let mask = output.composite.m_composite.into_data().to_vec::<f32>().unwrap();
        assert!(mask.iter().all(|v| (v - 0.5).abs() < 1e-6));
    }

    #[test]
    fn samples_are_written_only_on_due_steps() {
        let device = Default::default();
        let batch = clothes_only_batch(&device);
        let one = ConstPair(1.0);
        let tv = ConstField(0.0);
        let criteria = Criteria {
            smoothness: &tv,
            l1: &one,
            perceptual: &one,
        };
        let dir = scratch_dir("step_samples");
        let samples = SampleWriter::new(&dir, 1000);
        let mut writer = RecordingWriter::default();

        for step in [999, 1000, 1001, 2000] {
            let mut sink = DiagnosticSink {
                samples: &samples,
                writer: &mut writer,
            };
            run_once(
                &LossWeightsConfig::new(),
                &batch,
                step,
                &FlatWarp,
                &ZeroGenerator,
                &criteria,
                Some(&mut sink),
            )
            .unwrap();
        }

        let steps: Vec<usize> = writer.images.iter().map(|(_, step, _, _)| *step).collect();
        assert_eq!(steps, vec![1000, 2000]);
        assert_eq!(writer.images[0], ("combine".to_string(), 1000, 16, 16 * 11));
        assert!(samples.sample_path(1000).is_file());
        assert!(!samples.sample_path(999).exists());
        std::fs::remove_dir_all(dir).ok();
    }

    #[test]
    fn unwritable_sample_dir_does_not_fail_the_step() {
        let device = Default::default();
        let batch = clothes_only_batch(&device);
        let one = ConstPair(1.0);
        let tv = ConstField(0.0);
        let criteria = Criteria {
            smoothness: &tv,
            l1: &one,
            perceptual: &one,
        };
        // a regular file where the sample directory should be
        let dir = scratch_dir("blocked");
        let blocker = dir.join("not_a_dir");
        std::fs::write(&blocker, b"x").unwrap();
        let samples = SampleWriter::new(&blocker, 1);
        let mut writer = RecordingWriter::default();
        let mut sink = DiagnosticSink {
            samples: &samples,
            writer: &mut writer,
        };

        let result = run_once(
            &LossWeightsConfig::new(),
            &batch,
            0,
            &FlatWarp,
            &ZeroGenerator,
            &criteria,
            Some(&mut sink),
        );
        assert!(result.is_ok());
        std::fs::remove_dir_all(dir).ok();
    }
}

//! Training state with explicit ownership and an explicit gradient collective.

use std::path::Path;

use burn::{
    module::AutodiffModule,
    optim::{GradientsParams, Optimizer},
    prelude::*,
    record::CompactRecorder,
    tensor::{ElementConversion, backend::AutodiffBackend},
};
use tracing::{debug, info};

use crate::error::{Result, TryOnError};
use crate::model::composition::CompositionModel;
use crate::model::data::TryOnBatch;
use crate::model::diagnostics::{DiagnosticSink, SampleWriter, SummaryWriter};
use crate::model::loss::{FieldCriterion, PairCriterion};
use crate::model::objective::{Criteria, LossWeightsConfig};
use crate::model::step::run_once;
use crate::model::warp::WarpModel;

/// Data-parallel gradient averaging across training processes.
///
/// Called once per model after backward and before the optimizer step.
/// Implementations return gradients averaged over `world_size` replicas.
pub trait GradientSync {
    fn rank(&self) -> usize;
    fn world_size(&self) -> usize;
    fn all_reduce<B: AutodiffBackend, M: AutodiffModule<B>>(
        &mut self,
        grads: GradientsParams,
        module: &M,
    ) -> Result<GradientsParams>;
}

/// Single-process collective: gradients pass through untouched.
#[derive(Debug, Clone, Default)]
pub struct LocalSync;

impl GradientSync for LocalSync {
    fn rank(&self) -> usize {
        0
    }

    fn world_size(&self) -> usize {
        1
    }

    fn all_reduce<B: AutodiffBackend, M: AutodiffModule<B>>(
        &mut self,
        grads: GradientsParams,
        _module: &M,
    ) -> Result<GradientsParams> {
        Ok(grads)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct StepLosses {
    pub warp: f64,
    pub gen_loss: f64,
    pub total: f64,
}

/// Running sums over the current epoch.
#[derive(Debug, Clone, Default)]
pub struct LossAccumulator {
    sums: StepLosses,
    count: usize,
}

impl LossAccumulator {
    pub fn add(&mut self, losses: StepLosses) {
        self.sums.warp += losses.warp;
        self.sums.gen_loss += losses.gen_loss;
        self.sums.total += losses.total;
        self.count += 1;
    }

    pub fn count(&self) -> usize {
        self.count
    }

    /// Returns the means and resets the accumulator.
    pub fn take_means(&mut self) -> StepLosses {
        let count = self.count.max(1) as f64;
        let means = StepLosses {
            warp: self.sums.warp / count,
            gen_loss: self.sums.gen_loss / count,
            total: self.sums.total / count,
        };
        *self = Self::default();
        means
    }
}

/// Linear decay of both learning rates once `niter` epochs have passed.
#[derive(Debug, Clone, Copy)]
pub struct LearningRates {
    pub base: f64,
    pub warp_ratio: f64,
    pub niter: usize,
    pub niter_decay: usize,
    pub gen_lr: f64,
    pub warp_lr: f64,
}

impl LearningRates {
    pub fn new(base: f64, warp_ratio: f64, niter: usize, niter_decay: usize) -> Self {
        Self {
            base,
            warp_ratio,
            niter,
            niter_decay,
            gen_lr: base,
            warp_lr: base * warp_ratio,
        }
    }

    /// Applied at the end of `epoch`.
    pub fn end_epoch(&mut self, epoch: usize) {
        if epoch <= self.niter || self.niter_decay == 0 {
            return;
        }
        let step = self.base / self.niter_decay as f64;
        self.gen_lr = (self.gen_lr - step).max(0.0);
        self.warp_lr = (self.warp_lr - step * self.warp_ratio).max(0.0);
        info!(gen_lr = self.gen_lr, warp_lr = self.warp_lr, "updated learning rates");
    }
}

/// Loss functors used by every step.
pub struct SessionCriteria<B: Backend> {
    pub smoothness: Box<dyn FieldCriterion<B>>,
    pub l1: Box<dyn PairCriterion<B>>,
    pub perceptual: Box<dyn PairCriterion<B>>,
}

/// Owns both models, their optimizers, the collective and the counters.
pub struct TrainingSession<B, W, G, OW, OG, S>
where
    B: AutodiffBackend,
{
    pub warp_model: W,
    pub gen_model: G,
    warp_optim: OW,
    gen_optim: OG,
    pub learning_rates: LearningRates,
    pub weights: LossWeightsConfig,
    criteria: SessionCriteria<B>,
    sync: S,
    samples: Option<SampleWriter>,
    summary: Option<Box<dyn SummaryWriter>>,
    pub step: usize,
    /// 1-based, advanced by [`Self::end_epoch`].
    pub epoch: usize,
    pub losses: LossAccumulator,
}

impl<B, W, G, OW, OG, S> TrainingSession<B, W, G, OW, OG, S>
where
    B: AutodiffBackend,
    W: AutodiffModule<B> + WarpModel<B>,
    G: AutodiffModule<B> + CompositionModel<B>,
    OW: Optimizer<W, B>,
    OG: Optimizer<G, B>,
    S: GradientSync,
{
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        warp_model: W,
        gen_model: G,
        warp_optim: OW,
        gen_optim: OG,
        learning_rates: LearningRates,
        weights: LossWeightsConfig,
        criteria: SessionCriteria<B>,
        sync: S,
    ) -> Self {
        Self {
            warp_model,
            gen_model,
            warp_optim,
            gen_optim,
            learning_rates,
            weights,
            criteria,
            sync,
            samples: None,
            summary: None,
            step: 0,
            epoch: 1,
            losses: LossAccumulator::default(),
        }
    }

    /// Attaches sample and summary output. Ignored on non-coordinators.
    pub fn with_outputs(mut self, samples: SampleWriter, summary: Box<dyn SummaryWriter>) -> Self {
        if self.is_coordinator() {
            self.samples = Some(samples);
            self.summary = Some(summary);
        }
        self
    }

    pub fn is_coordinator(&self) -> bool {
        self.sync.rank() == 0
    }

    pub fn rank(&self) -> usize {
        self.sync.rank()
    }

    pub fn world_size(&self) -> usize {
        self.sync.world_size()
    }

    /// Forward, backward, collective, then both optimizer updates.
    pub fn train_step(&mut self, batch: &TryOnBatch<B>) -> Result<StepLosses> {
        let criteria = Criteria {
            smoothness: self.criteria.smoothness.as_ref(),
            l1: self.criteria.l1.as_ref(),
            perceptual: self.criteria.perceptual.as_ref(),
        };
        let mut sink = match (&self.samples, &mut self.summary) {
            (Some(samples), Some(writer)) => Some(DiagnosticSink {
                samples,
                writer: writer.as_mut(),
            }),
            _ => None,
        };

        let output = run_once(
            &self.weights,
            batch,
            self.step,
            &self.warp_model,
            &self.gen_model,
            &criteria,
            sink.as_mut(),
        )?;

        let losses = StepLosses {
            warp: scalar(&output.warp_loss),
            gen_loss: scalar(&output.gen_loss),
            total: scalar(&output.total),
        };
        self.losses.add(losses);

        let mut grads = output.total.backward();
        let warp_grads = GradientsParams::from_module(&mut grads, &self.warp_model);
        let gen_grads = GradientsParams::from_module(&mut grads, &self.gen_model);
        let (warp_grads, gen_grads) = self.all_reduce_gradients(warp_grads, gen_grads)?;

        self.warp_model =
            self.warp_optim
                .step(self.learning_rates.warp_lr, self.warp_model.clone(), warp_grads);
        self.gen_model =
            self.gen_optim
                .step(self.learning_rates.gen_lr, self.gen_model.clone(), gen_grads);

        self.step += 1;
        Ok(losses)
    }

    /// The single synchronization point of a step.
    pub fn all_reduce_gradients(
        &mut self,
        warp_grads: GradientsParams,
        gen_grads: GradientsParams,
    ) -> Result<(GradientsParams, GradientsParams)> {
        let warp_grads = self.sync.all_reduce(warp_grads, &self.warp_model)?;
        let gen_grads = self.sync.all_reduce(gen_grads, &self.gen_model)?;
        Ok((warp_grads, gen_grads))
    }

    /// Closes the epoch: writes the mean losses and advances the schedule.
    pub fn end_epoch(&mut self) -> Result<StepLosses> {
        let means = self.losses.take_means();
        let epoch = self.epoch;
        if let Some(writer) = self.summary.as_mut() {
            writer.add_scalar("train_warp_loss", means.warp, epoch)?;
            writer.add_scalar("train_gen_loss", means.gen_loss, epoch)?;
            writer.add_scalar("train_loss", means.total, epoch)?;
        }
        self.learning_rates.end_epoch(epoch);
        self.epoch += 1;
        Ok(means)
    }

    /// Writes both models as `PBAFN_{warp,gen}_epoch_NNN`. Coordinator only.
    pub fn save_checkpoints(&self, dir: &Path, epoch: usize) -> Result<()> {
        if !self.is_coordinator() {
            return Ok(());
        }
        std::fs::create_dir_all(dir)?;
        let recorder = CompactRecorder::new();
        let warp_path = dir.join(format!("PBAFN_warp_epoch_{:03}", epoch + 1));
        let gen_path = dir.join(format!("PBAFN_gen_epoch_{:03}", epoch + 1));
        self.warp_model
            .clone()
            .save_file(&warp_path, &recorder)
            .map_err(|err| TryOnError::Checkpoint {
                path: warp_path.clone(),
                reason: err.to_string(),
            })?;
        self.gen_model
            .clone()
            .save_file(&gen_path, &recorder)
            .map_err(|err| TryOnError::Checkpoint {
                path: gen_path.clone(),
                reason: err.to_string(),
            })?;
        debug!(warp = %warp_path.display(), generator = %gen_path.display(), "saved checkpoints");
        Ok(())
    }
}

/// Loads a model record saved by [`TrainingSession::save_checkpoints`].
pub fn load_checkpoint<B: Backend, M: Module<B>>(
    module: M,
    path: &Path,
    device: &B::Device,
) -> Result<M> {
    module
        .load_file(path, &CompactRecorder::new(), device)
        .map_err(|err| TryOnError::Checkpoint {
            path: path.to_path_buf(),
            reason: err.to_string(),
        })
}

fn scalar<B: Backend>(tensor: &Tensor<B, 1>) -> f64 {
    tensor.clone().into_scalar().elem::<f64>()
}

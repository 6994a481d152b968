use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use burn::{
    data::dataloader::DataLoaderBuilder,
    data::dataset::Dataset,
    optim::AdamConfig,
    prelude::*,
    tensor::backend::AutodiffBackend,
};
use tracing::{info, warn};

use crate::error::{Result, TryOnError};
use crate::model::{
    architecture::{ResUnetGenerator, ResUnetGeneratorConfig, TryOnModelConfig},
    data::{TryOnBatcher, TryOnDataset},
    diagnostics::{EventFileWriter, SampleWriter},
    loss::{L1Loss, TvLoss},
    objective::LossWeightsConfig,
    session::{GradientSync, LearningRates, SessionCriteria, TrainingSession, load_checkpoint},
    vgg::VggLoss,
    warp_net::{FlowWarpNet, FlowWarpNetConfig},
};

#[derive(Config)]
pub struct TrainingConfig {
    pub model: TryOnModelConfig,
    pub loss: LossWeightsConfig,
    pub optimizer: AdamConfig,

    /// Dataset root holding `train_pairs.txt` and `train/`.
    pub dataroot: String,
    /// Run name used for the sample, summary and checkpoint folders.
    pub name: String,

    /// Epochs at the initial learning rate.
    #[config(default = 100)]
    pub niter: usize,
    /// Epochs of linear decay to zero.
    #[config(default = 100)]
    pub niter_decay: usize,
    /// Overrides `niter + niter_decay`.
    pub num_epochs: Option<usize>,

    #[config(default = 5e-5)]
    pub learning_rate: f64,
    #[config(default = 0.2)]
    pub warp_lr_ratio: f64,
    #[config(default = 0.5)]
    pub beta1: f32,

    #[config(default = 8)]
    pub batch_size: usize,
    #[config(default = 4)]
    pub num_workers: usize,
    #[config(default = 42)]
    pub seed: u64,

    #[config(default = 10)]
    pub save_epoch_freq: usize,
    #[config(default = 100)]
    pub log_interval: usize,
    #[config(default = 1000)]
    pub sample_interval: usize,

    pub warp_checkpoint: Option<String>,
    pub gen_checkpoint: Option<String>,
    /// Burn record of the VGG19 feature extractor.
    pub vgg_weights: Option<String>,
}

impl TrainingConfig {
    pub fn epochs(&self) -> usize {
        self.num_epochs.unwrap_or(self.niter + self.niter_decay)
    }
}

/// Output folders of a run below the artifact directory.
#[derive(Debug, Clone)]
pub struct RunDirs {
    pub samples: PathBuf,
    pub summaries: PathBuf,
    pub checkpoints: PathBuf,
}

impl RunDirs {
    pub fn new(artifact_dir: &Path, name: &str) -> Self {
        Self {
            samples: artifact_dir.join("sample").join(name),
            summaries: artifact_dir.join("runs").join(name),
            checkpoints: artifact_dir.join("checkpoints").join(name),
        }
    }
}

fn create_artifact_dir(artifact_dir: &Path) -> Result<()> {
    std::fs::create_dir_all(artifact_dir)?;
    Ok(())
}

/// Human-readable `H:MM:SS`.
pub fn format_eta(eta: Duration) -> String {
    let secs = eta.as_secs();
    format!("{}:{:02}:{:02}", secs / 3600, (secs / 60) % 60, secs % 60)
}

/// Time left if every remaining step takes `iter_time`.
pub fn estimate_remaining(iter_time: Duration, remaining_steps: usize) -> Duration {
    Duration::from_secs_f64(iter_time.as_secs_f64() * remaining_steps as f64)
}

pub fn train<B: AutodiffBackend, S: GradientSync>(
    artifact_dir: &Path,
    config: TrainingConfig,
    device: B::Device,
    sync: S,
) -> Result<()> {
    let coordinator = sync.rank() == 0;
    let dirs = RunDirs::new(artifact_dir, &config.name);
    if coordinator {
        create_artifact_dir(artifact_dir)?;
        config.save(artifact_dir.join("config.json"))?;
    }

    B::seed(config.seed);

    let dataset = TryOnDataset::train(&config.dataroot)?;
    let dataset_len = dataset.len();
    let dataloader_train = DataLoaderBuilder::new(TryOnBatcher::default())
        .batch_size(config.batch_size)
        .shuffle(config.seed)
        .num_workers(config.num_workers)
        .build(dataset);

    let mut warp_model = config.model.warp.init::<B>(&device);
    if let Some(path) = &config.warp_checkpoint {
        warp_model = load_checkpoint(warp_model, Path::new(path), &device)?;
        info!(path = %path, "warm-started warp model");
    }
    let mut gen_model = config.model.generator.init::<B>(&device);
    if let Some(path) = &config.gen_checkpoint {
        gen_model = load_checkpoint(gen_model, Path::new(path), &device)?;
        info!(path = %path, "warm-started generator");
    }

    let perceptual = match &config.vgg_weights {
        Some(path) => VggLoss::from_record(path, &device)?,
        None => {
            warn!("no VGG19 weights configured, perceptual loss uses random features");
            VggLoss::new(&device)
        }
    };

    let optimizer = config
        .optimizer
        .clone()
        .with_beta_1(config.beta1)
        .with_beta_2(0.999);
    let warp_optim = optimizer.init::<B, FlowWarpNet<B>>();
    let gen_optim = optimizer.init::<B, ResUnetGenerator<B>>();

    let mut session = TrainingSession::new(
        warp_model,
        gen_model,
        warp_optim,
        gen_optim,
        LearningRates::new(
            config.learning_rate,
            config.warp_lr_ratio,
            config.niter,
            config.niter_decay,
        ),
        config.loss.clone(),
        SessionCriteria {
            smoothness: Box::new(TvLoss),
            l1: Box::new(L1Loss),
            perceptual: Box::new(perceptual),
        },
        sync,
    );
    if session.is_coordinator() {
        let summary = EventFileWriter::new(&dirs.summaries)?;
        session = session.with_outputs(
            SampleWriter::new(&dirs.samples, config.sample_interval),
            Box::new(summary),
        );
    }

    let epochs = config.epochs();
    let steps_per_epoch = dataset_len.div_ceil(config.batch_size.max(1));
    let all_steps = steps_per_epoch * epochs;
    info!(
        pairs = dataset_len,
        steps_per_epoch,
        epochs,
        rank = session.rank(),
        world_size = session.world_size(),
        "starting training"
    );

    for epoch in 1..=epochs {
        let epoch_start = Instant::now();
        let mut iter_start = Instant::now();

        for batch in dataloader_train.iter() {
            let batch = batch.to_device(&device);
            let losses = session.train_step(&batch)?;

            let iter_time = iter_start.elapsed();
            iter_start = Instant::now();
            let step = session.step;
            if session.is_coordinator() && step % config.log_interval.max(1) == 0 {
                let remaining = all_steps.saturating_sub(step);
                info!(
                    epoch,
                    step,
                    all_steps,
                    progress = %format!("{:.2}%", 100.0 * step as f64 / all_steps.max(1) as f64),
                    loss = losses.total,
                    warp_loss = losses.warp,
                    gen_loss = losses.gen_loss,
                    lr = session.learning_rates.gen_lr,
                    eta = %format_eta(estimate_remaining(iter_time, remaining)),
                    "training step"
                );
            }
        }

        let means = session.end_epoch()?;
        if session.is_coordinator() {
            info!(
                epoch,
                epochs,
                train_loss = %format!("{:.3}", means.total),
                elapsed_secs = epoch_start.elapsed().as_secs(),
                "end of epoch"
            );
        }

        if epoch % config.save_epoch_freq.max(1) == 0 && session.is_coordinator() {
            info!(epoch, step = session.step, "saving the model");
            session.save_checkpoints(&dirs.checkpoints, epoch)?;
        }
    }

    Ok(())
}

/// Writes a default configuration for `dataroot` to `path`.
pub fn write_default_config(path: &Path, dataroot: &str, name: &str) -> Result<TrainingConfig> {
    let config = TrainingConfig::new(
        TryOnModelConfig::new(FlowWarpNetConfig::new(), ResUnetGeneratorConfig::new()),
        LossWeightsConfig::new(),
        AdamConfig::new(),
        dataroot.to_string(),
        name.to_string(),
    );
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    config.save(path)?;
    Ok(config)
}

/// Reads a configuration file.
pub fn load_config(path: &Path) -> Result<TrainingConfig> {
    TrainingConfig::load(path).map_err(|err| TryOnError::Config {
        path: path.to_path_buf(),
        reason: err.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::diagnostics::tests::scratch_dir;

    #[test]
    fn epochs_default_to_both_phases() {
        let dir = scratch_dir("config_epochs");
        let config = write_default_config(&dir.join("config.json"), "data", "run").unwrap();
        assert_eq!(config.epochs(), 200);
        assert_eq!(config.with_num_epochs(Some(3)).epochs(), 3);
        std::fs::remove_dir_all(dir).ok();
    }

    #[test]
    fn config_round_trips_through_json() {
        let dir = scratch_dir("config_json");
        let path = dir.join("nested").join("config.json");
        let written = write_default_config(&path, "viton", "PBAFN_e2e").unwrap();
        let read = load_config(&path).unwrap();

        assert_eq!(read.dataroot, "viton");
        assert_eq!(read.name, written.name);
        assert_eq!(read.loss.warp_second_smooth, 6.0);
        assert_eq!(read.model.generator.num_downs, 5);
        assert_eq!(read.warp_lr_ratio, 0.2);
        assert!(read.warp_checkpoint.is_none());
        std::fs::remove_dir_all(dir).ok();
    }

    #[test]
    fn broken_config_is_reported() {
        let dir = scratch_dir("config_broken");
        let path = dir.join("config.json");
        std::fs::write(&path, "{ not json").unwrap();
        assert!(load_config(&path).is_err());
        std::fs::remove_dir_all(dir).ok();
    }

    #[test]
    fn run_dirs_follow_the_artifact_layout() {
        let dirs = RunDirs::new(Path::new("/tmp/artifacts"), "exp");
        assert_eq!(dirs.samples, Path::new("/tmp/artifacts/sample/exp"));
        assert_eq!(dirs.summaries, Path::new("/tmp/artifacts/runs/exp"));
        assert_eq!(dirs.checkpoints, Path::new("/tmp/artifacts/checkpoints/exp"));
    }

    #[test]
    fn eta_is_formatted_as_clock_time() {
        assert_eq!(format_eta(Duration::from_secs(3725)), "1:02:05");
        assert_eq!(format_eta(Duration::from_secs(59)), "0:00:59");
    }

    #[test]
    fn eta_survives_schedules_beyond_u32_steps() {
        let remaining = u32::MAX as usize + 1_000;
        let eta = estimate_remaining(Duration::from_millis(2), remaining);
        assert_eq!(eta.as_secs(), (remaining as u64 * 2) / 1000);
        assert_eq!(
            estimate_remaining(Duration::from_millis(500), 10),
            Duration::from_secs(5)
        );
    }
}

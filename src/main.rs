mod error;
mod model;
mod utils;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::{Level, info};

use crate::error::TryOnError;
use crate::model::session::LocalSync;
use crate::model::training::{load_config, train, write_default_config};

#[cfg(feature = "cuda")]
mod backend {
    pub type Backend = burn::backend::Cuda<f32, i32>;
    pub type AutodiffBackend = burn::backend::Autodiff<Backend>;

    pub fn device() -> burn::backend::cuda::CudaDevice {
        burn::backend::cuda::CudaDevice::default()
    }
}

#[cfg(not(feature = "cuda"))]
mod backend {
    pub type Backend = burn::backend::NdArray<f32>;
    pub type AutodiffBackend = burn::backend::Autodiff<Backend>;

    pub fn device() -> burn::backend::ndarray::NdArrayDevice {
        burn::backend::ndarray::NdArrayDevice::Cpu
    }
}

#[derive(Parser)]
#[command(name = "pbafn-tryon")]
#[command(about = "Train the parser-based appearance-flow virtual try-on networks")]
#[command(version)]
struct Cli {
    /// More output (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Train the warp and generator models end to end
    Train {
        /// Training configuration (JSON)
        #[arg(short, long)]
        config: PathBuf,

        /// Where samples, summaries and checkpoints go
        #[arg(short, long, default_value = "artifacts")]
        artifact_dir: PathBuf,

        /// Rank of this process
        #[arg(long, default_value = "0")]
        rank: usize,

        /// Number of training processes
        #[arg(long, default_value = "1")]
        world_size: usize,
    },

    /// Write a default configuration file
    InitConfig {
        /// Output path
        path: PathBuf,

        /// Dataset root
        #[arg(long, default_value = "dataset/VITON")]
        dataroot: String,

        /// Run name
        #[arg(long, default_value = "PBAFN_e2e")]
        name: String,
    },
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => Level::INFO,
        1 => Level::DEBUG,
        _ => Level::TRACE,
    };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .init();
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match cli.command {
        Commands::Train {
            config,
            artifact_dir,
            rank,
            world_size,
        } => {
            if world_size != 1 || rank != 0 {
                bail!(TryOnError::Collective(format!(
                    "rank {rank} of {world_size}: only single-process training is available"
                )));
            }
            let config = load_config(&config)
                .with_context(|| format!("failed to load config {}", config.display()))?;
            info!(name = %config.name, dataroot = %config.dataroot, "loaded configuration");

            train::<backend::AutodiffBackend, _>(&artifact_dir, config, backend::device(), LocalSync)
                .context("training failed")?;
        }
        Commands::InitConfig {
            path,
            dataroot,
            name,
        } => {
            write_default_config(&path, &dataroot, &name)
                .with_context(|| format!("failed to write {}", path.display()))?;
            info!(path = %path.display(), "wrote default configuration");
        }
    }
    Ok(())
}

//! Periodic visual samples and the metrics writer.

use burn::prelude::*;
use serde::Serialize;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, warn};

use crate::error::{Result, TryOnError};
use crate::model::composition::Composite;
use crate::model::masks::SemanticMasks;
use crate::utils::{chw_unit_to_image, to_unit_range};

/// Planar RGB float image in `[0, 1]`.
#[derive(Debug, Clone)]
pub struct ImageStrip {
    pub height: usize,
    pub width: usize,
    pub data: Vec<f32>,
}

/// Sink for scalar curves and images keyed by tag and step.
pub trait SummaryWriter {
    fn add_scalar(&mut self, tag: &str, value: f64, step: usize) -> Result<()>;
    fn add_image(&mut self, tag: &str, image: &ImageStrip, step: usize) -> Result<()>;
}

#[derive(Serialize)]
struct ScalarEvent<'a> {
    tag: &'a str,
    value: f64,
    step: usize,
    wall_time: f64,
}

/// Appends scalars to `scalars.jsonl` and stores images as PNG files.
pub struct EventFileWriter {
    dir: PathBuf,
    scalars: BufWriter<File>,
}

impl EventFileWriter {
    pub fn new<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(dir.join("scalars.jsonl"))?;
        Ok(Self {
            dir,
            scalars: BufWriter::new(file),
        })
    }
}

impl SummaryWriter for EventFileWriter {
    fn add_scalar(&mut self, tag: &str, value: f64, step: usize) -> Result<()> {
        let wall_time = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs_f64())
            .unwrap_or_default();
        let event = ScalarEvent {
            tag,
            value,
            step,
            wall_time,
        };
        serde_json::to_writer(&mut self.scalars, &event)?;
        self.scalars.write_all(b"\n")?;
        self.scalars.flush()?;
        Ok(())
    }

    fn add_image(&mut self, tag: &str, image: &ImageStrip, step: usize) -> Result<()> {
        let rgb = chw_unit_to_image(&image.data, image.height, image.width).ok_or_else(|| {
            TryOnError::TensorData(format!("image `{tag}` does not match its dimensions"))
        })?;
        rgb.save(self.dir.join(format!("{tag}_{step:08}.png")))?;
        Ok(())
    }
}

/// Replicates a single-channel map to three channels for display.
fn gray_to_rgb<B: Backend>(tensor: Tensor<B, 3>) -> Tensor<B, 3> {
    Tensor::cat(vec![tensor.clone(), tensor.clone(), tensor], 0)
}

fn first_sample<B: Backend>(tensor: &Tensor<B, 4>) -> Tensor<B, 3> {
    let [_, channels, height, width] = tensor.dims();
    tensor
        .clone()
        .slice([0..1, 0..channels, 0..height, 0..width])
        .squeeze::<3>(0)
}

/// Side-by-side strip of the first sample, still in `[-1, 1]`:
/// real image, person clothes, clothes, densepose, warped cloth, warped edge,
/// preserve region, dense preserve mask, rendering, composite mask, try-on.
pub fn sample_strip<B: Backend>(
    real_image: &Tensor<B, 4>,
    masks: &SemanticMasks<B>,
    composite: &Composite<B>,
) -> Tensor<B, 3> {
    let panels = vec![
        first_sample(real_image),
        first_sample(&masks.person_clothes),
        first_sample(&masks.clothes),
        gray_to_rgb(first_sample(&masks.densepose_fore)),
        first_sample(&composite.warped_cloth),
        gray_to_rgb(first_sample(&composite.warped_edge)),
        first_sample(&masks.preserve_region),
        gray_to_rgb(first_sample(&masks.dense_preserve_mask)),
        first_sample(&composite.p_rendered),
        gray_to_rgb(first_sample(&composite.m_composite)),
        first_sample(&composite.p_tryon),
    ];
    Tensor::cat(panels, 2)
}

/// Writes a sample strip every `interval` steps.
#[derive(Debug, Clone)]
pub struct SampleWriter {
    dir: PathBuf,
    interval: usize,
}

impl SampleWriter {
    pub fn new<P: AsRef<Path>>(dir: P, interval: usize) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
            interval: interval.max(1),
        }
    }

    pub fn is_due(&self, step: usize) -> bool {
        step % self.interval == 0
    }

    pub fn sample_path(&self, step: usize) -> PathBuf {
        self.dir.join(format!("{step}.jpg"))
    }

    fn write<B: Backend>(
        &self,
        step: usize,
        strip: Tensor<B, 3>,
        writer: &mut dyn SummaryWriter,
    ) -> Result<()> {
        let [_, height, width] = strip.dims();
        let data = strip
            .into_data()
            .convert::<f32>()
            .to_vec::<f32>()
            .map_err(|err| TryOnError::TensorData(format!("{err:?}")))?
            .into_iter()
            .map(to_unit_range)
            .collect::<Vec<_>>();
        let image = ImageStrip {
            height,
            width,
            data,
        };
        writer.add_image("combine", &image, step)?;

        let rgb = chw_unit_to_image(&image.data, height, width).ok_or_else(|| {
            TryOnError::TensorData("sample strip does not match its dimensions".to_string())
        })?;
        fs::create_dir_all(&self.dir)?;
        rgb.save(self.sample_path(step))?;
        Ok(())
    }
}

/// Coordinator-side diagnostics handed to a training step.
pub struct DiagnosticSink<'a> {
    pub samples: &'a SampleWriter,
    pub writer: &'a mut dyn SummaryWriter,
}

impl DiagnosticSink<'_> {
    pub fn is_due(&self, step: usize) -> bool {
        self.samples.is_due(step)
    }

    /// Best effort: failures are logged and never abort the step.
    pub fn record<B: Backend>(
        &mut self,
        step: usize,
        real_image: &Tensor<B, 4>,
        masks: &SemanticMasks<B>,
        composite: &Composite<B>,
    ) {
        let strip = sample_strip(real_image, masks, composite).detach();
        match self.samples.write(step, strip, self.writer) {
            Ok(()) => debug!(step, path = %self.samples.sample_path(step).display(), "wrote sample"),
            Err(err) => warn!(step, error = %err, "failed to write diagnostic sample"),
        }
    }
}

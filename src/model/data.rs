use burn::data::dataloader::batcher::Batcher;
use burn::data::dataset::Dataset;
use burn::prelude::*;
use image::{DynamicImage, GrayImage, ImageReader, Luma, imageops::FilterType};
use imageproc::{drawing::draw_filled_rect_mut, rect::Rect};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::error::{Result, TryOnError};
use crate::model::constants::{CHANNELS, HEIGHT, POSE_CHANNELS, WIDTH};

/// Half side of the square drawn around each pose keypoint.
const POSE_RADIUS: i32 = 5;

/// One person/cloth pair, flattened CHW.
#[derive(Debug, Clone)]
pub struct TryOnItem {
    pub image: Vec<f32>,
    pub color: Vec<f32>,
    pub edge: Vec<f32>,
    pub label: Vec<f32>,
    pub densepose: Vec<f32>,
    pub pose: Vec<f32>,
}

#[derive(Debug, Clone)]
struct PairEntry {
    person: String,
    cloth: String,
}

/// Every file one pair is read from.
struct PairFiles {
    image: PathBuf,
    cloth: PathBuf,
    cloth_mask: PathBuf,
    parse: PathBuf,
    densepose: PathBuf,
    keypoints: PathBuf,
}

impl PairFiles {
    fn new(root: &Path, pair: &PairEntry) -> Self {
        let stem = Path::new(&pair.person)
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or(&pair.person);
        Self {
            image: root.join("image").join(&pair.person),
            cloth: root.join("cloth").join(&pair.cloth),
            cloth_mask: root.join("cloth-mask").join(&pair.cloth),
            parse: root.join("image-parse").join(format!("{stem}.png")),
            densepose: root.join("densepose").join(format!("{stem}.png")),
            keypoints: root
                .join("openpose_json")
                .join(format!("{stem}_keypoints.json")),
        }
    }

    fn all(&self) -> [&Path; 6] {
        [
            &self.image,
            &self.cloth,
            &self.cloth_mask,
            &self.parse,
            &self.densepose,
            &self.keypoints,
        ]
    }
}

/// VITON-style dataset. Parsing maps are 8-bit grayscale PNGs whose pixel
/// values are the integer part codes. Densepose codes are read from the
/// first channel.
pub struct TryOnDataset {
    root: PathBuf,
    pairs: Vec<PairEntry>,
}

#[derive(Deserialize)]
struct OpenPoseFile {
    people: Vec<OpenPosePerson>,
}

#[derive(Deserialize)]
struct OpenPosePerson {
    pose_keypoints_2d: Vec<f32>,
}

impl TryOnDataset {
    pub fn new<P: AsRef<Path>>(root: P, phase: &str) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        let pairs_path = root.join(format!("{phase}_pairs.txt"));
        let text = fs::read_to_string(&pairs_path)?;

        let pairs: Vec<PairEntry> = text
            .lines()
            .filter_map(|line| {
                let mut fields = line.split_whitespace();
                let person = fields.next()?;
                let cloth = fields.next()?;
                Some(PairEntry {
                    person: person.to_string(),
                    cloth: cloth.to_string(),
                })
            })
            .collect();

        if pairs.is_empty() {
            return Err(TryOnError::Dataset(format!(
                "no person/cloth pairs listed in {}",
                pairs_path.display()
            )));
        }

        let root = root.join(phase);
        for (line, pair) in pairs.iter().enumerate() {
            let files = PairFiles::new(&root, pair);
            if let Some(missing) = files.all().into_iter().find(|path| !path.is_file()) {
                return Err(TryOnError::Dataset(format!(
                    "pair {} ({} / {}) in {}: missing {}",
                    line + 1,
                    pair.person,
                    pair.cloth,
                    pairs_path.display(),
                    missing.display()
                )));
            }
        }
        debug!(pairs = pairs.len(), root = %root.display(), "dataset files present");

        Ok(Self { root, pairs })
    }

    pub fn train<P: AsRef<Path>>(root: P) -> Result<Self> {
        Self::new(root, "train")
    }

    pub fn load(&self, index: usize) -> Result<TryOnItem> {
        let pair = self.pairs.get(index).ok_or_else(|| {
            TryOnError::Dataset(format!("index {index} out of {} pairs", self.pairs.len()))
        })?;
        let files = PairFiles::new(&self.root, pair);

        let person = open_image(&files.image)?;
        let (orig_width, orig_height) = (person.width(), person.height());
        let image = normalize_rgb(&person);

        let cloth = open_image(&files.cloth)?;
        let color = normalize_rgb(&cloth);

        let edge = open_image(&files.cloth_mask)?
            .resize_exact(WIDTH as u32, HEIGHT as u32, FilterType::Nearest)
            .to_luma8()
            .pixels()
            .map(|p| p[0] as f32 / 255.0)
            .collect();

        let label = load_label_codes(&files.parse)?;
        let densepose = load_densepose_codes(&files.densepose)?;

        let keypoints = read_keypoints(&files.keypoints)?;
        let pose = render_pose(
            &keypoints,
            WIDTH as f32 / orig_width as f32,
            HEIGHT as f32 / orig_height as f32,
        );

        Ok(TryOnItem {
            image,
            color,
            edge,
            label,
            densepose,
            pose,
        })
    }
}

impl Dataset<TryOnItem> for TryOnDataset {
    fn len(&self) -> usize {
        self.pairs.len()
    }

    /// A `None` here would end the loader's epoch early, so a sample that
    /// cannot be decoded aborts instead.
    fn get(&self, index: usize) -> Option<TryOnItem> {
        if index >= self.pairs.len() {
            return None;
        }
        match self.load(index) {
            Ok(item) => Some(item),
            Err(err) => panic!("unreadable training sample {index}: {err}"),
        }
    }
}

fn open_image(path: &Path) -> Result<image::DynamicImage> {
    let open = || -> std::result::Result<image::DynamicImage, image::ImageError> {
        Ok(ImageReader::open(path)?.decode()?)
    };
    open().map_err(|source| TryOnError::ImageOpen {
        path: path.to_path_buf(),
        source,
    })
}

/// Resizes to the training resolution and maps RGB into [-1, 1], CHW order.
fn normalize_rgb(image: &image::DynamicImage) -> Vec<f32> {
    let rgb = image
        .resize_exact(WIDTH as u32, HEIGHT as u32, FilterType::Triangle)
        .to_rgb8();
    let mut data = vec![0.0f32; CHANNELS * HEIGHT * WIDTH];
    for (x, y, pixel) in rgb.enumerate_pixels() {
        let offset = y as usize * WIDTH + x as usize;
        for c in 0..CHANNELS {
            data[c * HEIGHT * WIDTH + offset] = (pixel[c] as f32 / 127.5) - 1.0;
        }
    }
    data
}

/// Categorical maps must never be interpolated, so resize with nearest.
fn nearest(image: &DynamicImage) -> DynamicImage {
    image.resize_exact(WIDTH as u32, HEIGHT as u32, FilterType::Nearest)
}

/// Palette and RGB parsing maps would come out as luminance, not codes.
fn load_label_codes(path: &Path) -> Result<Vec<f32>> {
    let parse = open_image(path)?;
    if !matches!(parse, DynamicImage::ImageLuma8(_)) {
        return Err(TryOnError::Dataset(format!(
            "{}: parsing map must be 8-bit grayscale codes, found {:?}",
            path.display(),
            parse.color()
        )));
    }
    Ok(nearest(&parse).to_luma8().pixels().map(|p| p[0] as f32).collect())
}

fn load_densepose_codes(path: &Path) -> Result<Vec<f32>> {
    let densepose = open_image(path)?;
    Ok(nearest(&densepose)
        .to_rgb8()
        .pixels()
        .map(|p| p[0] as f32)
        .collect())
}

fn read_keypoints(path: &Path) -> Result<Vec<[f32; 2]>> {
    let text = fs::read_to_string(path)?;
    let file: OpenPoseFile = serde_json::from_str(&text)?;
    let person = file
        .people
        .into_iter()
        .next()
        .ok_or_else(|| TryOnError::PoseKeypoints {
            path: path.to_path_buf(),
            reason: "no people detected".to_string(),
        })?;

    if person.pose_keypoints_2d.len() < POSE_CHANNELS * 3 {
        return Err(TryOnError::PoseKeypoints {
            path: path.to_path_buf(),
            reason: format!(
                "expected {} values, found {}",
                POSE_CHANNELS * 3,
                person.pose_keypoints_2d.len()
            ),
        });
    }

    Ok(person
        .pose_keypoints_2d
        .chunks_exact(3)
        .take(POSE_CHANNELS)
        .map(|kp| [kp[0], kp[1]])
        .collect())
}

/// One channel per keypoint with a filled square around it. Keypoints at
/// non-positive coordinates were not detected and leave their channel empty.
pub fn render_pose(keypoints: &[[f32; 2]], scale_x: f32, scale_y: f32) -> Vec<f32> {
    let mut pose = Vec::with_capacity(POSE_CHANNELS * HEIGHT * WIDTH);
    for channel in 0..POSE_CHANNELS {
        let mut canvas = GrayImage::new(WIDTH as u32, HEIGHT as u32);
        if let Some(&[x, y]) = keypoints.get(channel) {
            if x > 0.0 && y > 0.0 {
                let cx = (x * scale_x) as i32;
                let cy = (y * scale_y) as i32;
                let side = (2 * POSE_RADIUS + 1) as u32;
                draw_filled_rect_mut(
                    &mut canvas,
                    Rect::at(cx - POSE_RADIUS, cy - POSE_RADIUS).of_size(side, side),
                    Luma([255u8]),
                );
            }
        }
        pose.extend(canvas.pixels().map(|p| if p[0] > 0 { 1.0 } else { 0.0 }));
    }
    pose
}

#[derive(Clone, Default)]
pub struct TryOnBatcher {}

#[derive(Clone, Debug)]
pub struct TryOnBatch<B: Backend> {
    pub label: Tensor<B, 4>,     // [batch, 1, H, W] parsing codes
    pub edge: Tensor<B, 4>,      // [batch, 1, H, W] cloth silhouette
    pub color: Tensor<B, 4>,     // [batch, 3, H, W] cloth image
    pub image: Tensor<B, 4>,     // [batch, 3, H, W] person image
    pub pose: Tensor<B, 4>,      // [batch, POSE_CHANNELS, H, W]
    pub densepose: Tensor<B, 4>, // [batch, 1, H, W] part codes
}

impl<B: Backend> TryOnBatch<B> {
    pub fn to_device(self, device: &B::Device) -> Self {
        Self {
            label: self.label.to_device(device),
            edge: self.edge.to_device(device),
            color: self.color.to_device(device),
            image: self.image.to_device(device),
            pose: self.pose.to_device(device),
            densepose: self.densepose.to_device(device),
        }
    }

    pub fn batch_size(&self) -> usize {
        self.image.dims()[0]
    }
}

fn stack<B: Backend>(
    items: &[TryOnItem],
    channels: usize,
    field: fn(&TryOnItem) -> &Vec<f32>,
    device: &B::Device,
) -> Tensor<B, 4> {
    let tensors: Vec<Tensor<B, 4>> = items
        .iter()
        .map(|item| {
            Tensor::<B, 3>::from_data(
                TensorData::new(field(item).clone(), [channels, HEIGHT, WIDTH])
                    .convert::<B::FloatElem>(),
                device,
            )
            .reshape([1, channels, HEIGHT, WIDTH])
        })
        .collect();
    Tensor::cat(tensors, 0)
}

impl<B: Backend> Batcher<B, TryOnItem, TryOnBatch<B>> for TryOnBatcher {
    fn batch(&self, items: Vec<TryOnItem>, device: &B::Device) -> TryOnBatch<B> {
        TryOnBatch {
            label: stack(&items, 1, |item| &item.label, device),
            edge: stack(&items, 1, |item| &item.edge, device),
            color: stack(&items, CHANNELS, |item| &item.color, device),
            image: stack(&items, CHANNELS, |item| &item.image, device),
            pose: stack(&items, POSE_CHANNELS, |item| &item.pose, device),
            densepose: stack(&items, 1, |item| &item.densepose, device),
        }
    }
}

use crate::error::TrainError;
use crate::model::ModelConfig;
use crate::retrieval::Tokenizer;
use anyhow::{Context, Result};
use burn::data::dataloader::batcher::Batcher;
use burn::data::dataset::Dataset;
use burn::prelude::*;
use burn::tensor::TensorData;
use image::RgbImage;
use serde::Deserialize;
use std::path::Path;
use std::sync::Arc;

/// A single caption/image pair loaded from the dataset manifest.
#[derive(Debug, Clone)]
pub struct CaptionedImage {
    pub caption: String,
    pub bytes: Vec<u8>,
}

/// One manifest line: `{"caption": "...", "image": "relative/path.jpg"}`.
#[derive(Debug, Deserialize)]
struct ManifestEntry {
    caption: String,
    image: String,
}

/// Load a JSON-lines manifest; image paths are resolved relative to it.
pub fn load_examples(manifest: &Path) -> Result<Vec<CaptionedImage>> {
    let contents = std::fs::read_to_string(manifest)
        .with_context(|| format!("failed to read {}", manifest.display()))?;
    let base = manifest.parent().unwrap_or_else(|| Path::new("."));

    let mut examples = Vec::new();
    for (line_no, line) in contents.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let entry: ManifestEntry = serde_json::from_str(line)
            .with_context(|| format!("bad manifest entry at line {}", line_no + 1))?;
        let image_path = base.join(&entry.image);
        let bytes = std::fs::read(&image_path)
            .with_context(|| format!("failed to read {}", image_path.display()))?;
        examples.push(CaptionedImage {
            caption: entry.caption,
            bytes,
        });
    }
    Ok(examples)
}

/// A training batch: caption tokens plus per-level real and mismatched
/// images, smallest resolution first.
#[derive(Clone, Debug)]
pub struct TrainBatch<B: Backend> {
    pub tokens: Tensor<B, 2, Int>,
    pub reals: Vec<Tensor<B, 4>>,
    pub wrongs: Vec<Tensor<B, 4>>,
    pub captions: Vec<String>,
}

/// Check a batch against the configured resolution levels before any forward
/// pass runs.
pub fn validate_batch<B: Backend>(
    batch: &TrainBatch<B>,
    model: &ModelConfig,
) -> Result<(), TrainError> {
    let batch_size = batch.tokens.dims()[0];
    let resolutions = model.resolutions();

    for (name, images) in [("real", &batch.reals), ("wrong", &batch.wrongs)] {
        if images.len() != model.levels {
            return Err(TrainError::ShapeMismatch(format!(
                "{name} images have {} levels, configured for {}",
                images.len(),
                model.levels
            )));
        }
        for (level, image) in images.iter().enumerate() {
            let [b, c, h, w] = image.dims();
            let expected = resolutions[level];
            if b != batch_size || c != 3 || h != expected || w != expected {
                return Err(TrainError::ShapeMismatch(format!(
                    "{name} level {level} is [{b}, {c}, {h}, {w}], expected [{batch_size}, 3, {expected}, {expected}]"
                )));
            }
        }
    }
    Ok(())
}

/// Dataset wrapper whose reported length is padded to a whole number of
/// batches so iteration wraps around instead of truncating.
#[derive(Clone)]
pub struct CyclicDataset {
    examples: Vec<Arc<CaptionedImage>>,
    len: usize,
}

impl CyclicDataset {
    pub fn new(examples: Vec<Arc<CaptionedImage>>, batch_size: usize) -> Self {
        let len = if examples.is_empty() {
            0
        } else {
            examples.len().div_ceil(batch_size) * batch_size
        };
        Self { examples, len }
    }
}

impl Dataset<Arc<CaptionedImage>> for CyclicDataset {
    fn get(&self, index: usize) -> Option<Arc<CaptionedImage>> {
        if self.examples.is_empty() {
            return None;
        }
        self.examples.get(index % self.examples.len()).cloned()
    }

    fn len(&self) -> usize {
        self.len
    }
}

/// Batcher producing multi-level image tensors and caption tokens.
#[derive(Clone)]
pub struct TextImageBatcher {
    tokenizer: Tokenizer,
    resolutions: Vec<usize>,
}

impl TextImageBatcher {
    pub fn new(tokenizer: Tokenizer, resolutions: Vec<usize>) -> Self {
        Self {
            tokenizer,
            resolutions,
        }
    }
}

impl<B: Backend> Batcher<B, Arc<CaptionedImage>, TrainBatch<B>> for TextImageBatcher {
    fn batch(&self, items: Vec<Arc<CaptionedImage>>, device: &B::Device) -> TrainBatch<B> {
        let batch_size = items.len();
        let captions: Vec<String> = items.iter().map(|item| item.caption.clone()).collect();
        let tokens = self.tokenizer.encode(&captions, device);

        let decoded: Vec<RgbImage> = items
            .iter()
            .map(|item| decode_image(&item.bytes).expect("failed to decode dataset image"))
            .collect();

        let mut reals = Vec::with_capacity(self.resolutions.len());
        let mut wrongs = Vec::with_capacity(self.resolutions.len());
        for &resolution in &self.resolutions {
            let real = images_to_tensor::<B>(&decoded, resolution, device);
            // The mismatched pairing rotates the batch by one: every caption
            // faces a real image belonging to a different sample.
            let wrong = rotate_batch(real.clone(), batch_size);
            reals.push(real);
            wrongs.push(wrong);
        }

        TrainBatch {
            tokens,
            reals,
            wrongs,
            captions,
        }
    }
}

/// Rotate a batch tensor by one sample along the batch dimension.
fn rotate_batch<B: Backend>(images: Tensor<B, 4>, batch_size: usize) -> Tensor<B, 4> {
    if batch_size < 2 {
        return images;
    }
    let head = images.clone().slice_dim(0, 0..1);
    let tail = images.slice_dim(0, 1..batch_size);
    Tensor::cat(vec![tail, head], 0)
}

fn images_to_tensor<B: Backend>(
    images: &[RgbImage],
    resolution: usize,
    device: &B::Device,
) -> Tensor<B, 4> {
    let batch_size = images.len();
    let mut values = Vec::with_capacity(batch_size * 3 * resolution * resolution);
    for img in images {
        let resized = if img.width() as usize != resolution || img.height() as usize != resolution
        {
            image::imageops::resize(
                img,
                resolution as u32,
                resolution as u32,
                image::imageops::FilterType::CatmullRom,
            )
        } else {
            img.clone()
        };
        values.extend(image_to_chw(&resized));
    }
    Tensor::from_data(
        TensorData::new(values, [batch_size, 3, resolution, resolution]),
        device,
    )
}

/// Decode raw image bytes into an RGB image.
fn decode_image(bytes: &[u8]) -> Result<RgbImage> {
    let img = image::load_from_memory(bytes)
        .context("failed to decode image bytes")?
        .to_rgb8();
    Ok(img)
}

/// Convert RGB image data to CHW floats normalized to [-1, 1].
fn image_to_chw(img: &RgbImage) -> Vec<f32> {
    let (width, height) = img.dimensions();
    let hw = (width * height) as usize;
    let mut out = vec![0.0f32; hw * 3];

    for y in 0..height {
        for x in 0..width {
            let pixel = img.get_pixel(x, y).0;
            let idx = (y * width + x) as usize;
            out[idx] = (pixel[0] as f32 / 127.5) - 1.0;
            out[hw + idx] = (pixel[1] as f32 / 127.5) - 1.0;
            out[2 * hw + idx] = (pixel[2] as f32 / 127.5) - 1.0;
        }
    }

    out
}

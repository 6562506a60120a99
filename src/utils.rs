use anyhow::{bail, Context, Result};
use burn::prelude::*;
use image::{Rgb, RgbImage};
use std::path::Path;

/// Split a `[batch, 3, h, w]` tensor in [-1, 1] into one RGB image per sample.
pub fn batch_to_rgb<B: Backend>(images: Tensor<B, 4>) -> Result<Vec<RgbImage>> {
    let [batch, channels, height, width] = images.dims();
    if channels != 3 {
        bail!("expected 3 image channels, got {channels}");
    }
    let values = images
        .into_data()
        .convert::<f32>()
        .to_vec::<f32>()
        .map_err(|err| anyhow::anyhow!("failed to read image tensor as f32: {err:?}"))?;

    let plane = height * width;
    let rgb = (0..batch)
        .map(|sample| {
            let base = sample * 3 * plane;
            RgbImage::from_fn(width as u32, height as u32, |x, y| {
                let idx = base + y as usize * width + x as usize;
                Rgb([
                    to_byte(values[idx]),
                    to_byte(values[idx + plane]),
                    to_byte(values[idx + 2 * plane]),
                ])
            })
        })
        .collect();
    Ok(rgb)
}

fn to_byte(value: f32) -> u8 {
    ((value + 1.0) * 127.5).clamp(0.0, 255.0) as u8
}

/// Assemble rows of equally sized images into one grid and save it as a
/// single file. The sampling hook uses one row of reals over one row of
/// generated images.
pub fn save_image_rows(rows: &[Vec<RgbImage>], path: &Path) -> Result<()> {
    let grid = assemble_rows(rows)?;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    grid.save(path)
        .with_context(|| format!("failed to save {}", path.display()))
}

fn assemble_rows(rows: &[Vec<RgbImage>]) -> Result<RgbImage> {
    let Some(first) = rows.iter().flatten().next() else {
        bail!("no images to lay out");
    };
    let (cell_w, cell_h) = first.dimensions();
    let cols = rows.iter().map(Vec::len).max().unwrap_or(0) as u32;

    let mut grid = RgbImage::new(cols * cell_w, rows.len() as u32 * cell_h);
    for (row, images) in rows.iter().enumerate() {
        for (col, img) in images.iter().enumerate() {
            if img.dimensions() != (cell_w, cell_h) {
                bail!(
                    "grid cell {row},{col} is {:?}, expected {:?}",
                    img.dimensions(),
                    (cell_w, cell_h)
                );
            }
            let (x0, y0) = (col as u32 * cell_w, row as u32 * cell_h);
            for (x, y, pixel) in img.enumerate_pixels() {
                grid.put_pixel(x0 + x, y0 + y, *pixel);
            }
        }
    }
    Ok(grid)
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::ndarray::NdArray;

    #[test]
    fn batch_splits_into_per_sample_images() {
        let device = Default::default();
        let tensor = Tensor::<NdArray, 4>::zeros([2, 3, 4, 4], &device);
        let images = batch_to_rgb(tensor).unwrap();
        assert_eq!(images.len(), 2);
        assert_eq!(images[0].dimensions(), (4, 4));
        // 0.0 in [-1, 1] lands on mid gray.
        assert_eq!(images[0].get_pixel(0, 0).0, [127, 127, 127]);
    }

    #[test]
    fn batch_rejects_non_rgb_channel_count() {
        let device = Default::default();
        let tensor = Tensor::<NdArray, 4>::zeros([1, 1, 4, 4], &device);
        assert!(batch_to_rgb(tensor).is_err());
    }

    #[test]
    fn rows_assemble_into_a_grid() {
        let red = RgbImage::from_pixel(2, 2, Rgb([255, 0, 0]));
        let green = RgbImage::from_pixel(2, 2, Rgb([0, 255, 0]));
        let blue = RgbImage::from_pixel(2, 2, Rgb([0, 0, 255]));

        let grid = assemble_rows(&[vec![red, green], vec![blue]]).unwrap();
        assert_eq!(grid.dimensions(), (4, 4));
        assert_eq!(grid.get_pixel(0, 0).0, [255, 0, 0]);
        assert_eq!(grid.get_pixel(2, 0).0, [0, 255, 0]);
        assert_eq!(grid.get_pixel(0, 2).0, [0, 0, 255]);
        // The short row's missing cell stays black.
        assert_eq!(grid.get_pixel(2, 2).0, [0, 0, 0]);
    }

    #[test]
    fn rows_reject_mismatched_cell_sizes() {
        let small = RgbImage::from_pixel(2, 2, Rgb([0, 0, 0]));
        let large = RgbImage::from_pixel(4, 4, Rgb([0, 0, 0]));
        assert!(assemble_rows(&[vec![small, large]]).is_err());
    }
}

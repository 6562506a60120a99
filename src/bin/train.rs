#![recursion_limit = "256"]
use anyhow::{Context, Result};
use burn::backend::wgpu::graphics::AutoGraphicsApi;
use burn::backend::wgpu::{init_setup, RuntimeOptions};
use burn::backend::{Autodiff, WebGpu};
use burn::config::Config;
use clap::Parser;
use stackgan_burn::model::ModelConfig;
use stackgan_burn::training::TrainingConfig;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(about = "Train a text-to-image GAN with Burn")]
struct Args {
    #[arg(long)]
    experiment_dir: PathBuf,
    #[arg(long, default_value = "config.json")]
    config: PathBuf,
}

fn main() -> Result<()> {
    let args = Args::parse();
    let mut config = TrainingConfig::load(&args.config)
        .with_context(|| format!("failed to load config from {}", args.config.display()))?;

    type Backend = WebGpu<f32, i32>;
    type AutodiffBackend = Autodiff<Backend>;
    let device = burn::backend::wgpu::WgpuDevice::default();
    let setup = init_setup::<AutoGraphicsApi>(&device, RuntimeOptions::default());
    let max_storage_buffer_binding_size =
        setup.device.limits().max_storage_buffer_binding_size as u64;
    adjust_batch_size_for_wgpu(&mut config, max_storage_buffer_binding_size)?;

    stackgan_burn::training::train::<AutodiffBackend>(&args.experiment_dir, config, device)?;
    Ok(())
}

fn adjust_batch_size_for_wgpu(
    config: &mut TrainingConfig,
    max_storage_buffer_binding_size: u64,
) -> Result<()> {
    let elem_bytes = std::mem::size_of::<f32>() as u64;
    let per_sample_bytes = estimate_max_conv_workspace_bytes(&config.model, elem_bytes);
    if per_sample_bytes == 0 {
        return Ok(());
    }

    let safe_limit = max_storage_buffer_binding_size.saturating_sub(1);
    let max_batch = (safe_limit / per_sample_bytes) as usize;
    if max_batch == 0 {
        return Err(anyhow::anyhow!(
            "WGPU max storage buffer size ({max_storage_buffer_binding_size} bytes) is too small for a single sample (estimated {per_sample_bytes} bytes). Reduce base_size, levels or model dims."
        ));
    }

    if config.batch_size > max_batch {
        println!(
            "wgpu max storage buffer size {} bytes; estimated max conv workspace per sample {} bytes. lowering batch_size from {} to {}.",
            max_storage_buffer_binding_size,
            per_sample_bytes,
            config.batch_size,
            max_batch
        );
        config.batch_size = max_batch;
    }

    Ok(())
}

fn estimate_max_conv_workspace_bytes(model: &ModelConfig, elem_bytes: u64) -> u64 {
    estimate_max_conv_workspace_elems(model).saturating_mul(elem_bytes)
}

/// Upper bound on the im2col/col2im workspace of the largest convolution a
/// single sample flows through, across the generator and every level
/// discriminator.
fn estimate_max_conv_workspace_elems(model: &ModelConfig) -> u64 {
    let kernel_area = 16u64;
    let mut max_elems = 0u64;

    // Generator upsampling chain: 4x4 up to the top resolution, channels
    // halving from 8x the base width.
    let top_size = (model.base_size << (model.levels - 1)) as u64;
    let mut size = 4u64;
    let mut channels = model.generator_dim as u64 * 8;
    while size < top_size {
        size *= 2;
        let elems = channels * size * size * kernel_area;
        if elems > max_elems {
            max_elems = elems;
        }
        channels = (channels / 2).max(model.generator_dim as u64);
    }

    // Each discriminator downsamples its level resolution to 4x4 with
    // stride-2 4x4 convolutions, channels doubling up to 8x the base width.
    for level in 0..model.levels {
        let mut disc_size = (model.base_size << level) as u64;
        let mut in_channels = 3u64;
        let mut out_channels = model.discriminator_dim as u64;
        while disc_size > 4 {
            disc_size = conv_out(disc_size, 4, 2, 1);
            let elems = in_channels * disc_size * disc_size * kernel_area;
            if elems > max_elems {
                max_elems = elems;
            }
            in_channels = out_channels;
            out_channels = (out_channels * 2).min(model.discriminator_dim as u64 * 8);
        }
    }

    max_elems
}

fn conv_out(input: u64, kernel: u64, stride: u64, padding: u64) -> u64 {
    (input + 2 * padding - (kernel - 1) - 1) / stride + 1
}

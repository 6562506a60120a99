pub mod discriminator;
pub mod generator;

use burn::prelude::*;

pub use discriminator::{DiscriminatorConfig, DiscriminatorOutput, LevelDiscriminator};
pub use generator::{GeneratorConfig, GeneratorOutput, MultiScaleGenerator};

/// Input-noise decay horizon in steps.
pub const NOISE_DECAY_STEPS: usize = 80_000;

/// Hyperparameters for the generator and the per-level discriminators.
#[derive(Config, Debug)]
pub struct ModelConfig {
    pub z_dim: usize,
    /// Width of the frozen retrieval embeddings.
    pub feature_dim: usize,
    /// Width of the variational conditioning code.
    pub condition_dim: usize,
    pub generator_dim: usize,
    pub discriminator_dim: usize,
    /// Number of resolution levels; level i renders at `base_size << i`.
    pub levels: usize,
    #[config(default = 64)]
    pub base_size: usize,
    #[config(default = true)]
    pub unconditional_heads: bool,
}

impl ModelConfig {
    /// Spatial resolution of each level, smallest first.
    pub fn resolutions(&self) -> Vec<usize> {
        (0..self.levels).map(|level| self.base_size << level).collect()
    }

    pub fn generator_config(&self) -> GeneratorConfig {
        GeneratorConfig::new(
            self.z_dim,
            self.feature_dim,
            self.condition_dim,
            self.generator_dim,
            self.levels,
        )
        .with_base_size(self.base_size)
    }

    pub fn init_generator<B: Backend>(&self, device: &B::Device) -> MultiScaleGenerator<B> {
        self.generator_config().init(device)
    }

    pub fn init_discriminators<B: Backend>(&self, device: &B::Device) -> Vec<LevelDiscriminator<B>> {
        self.resolutions()
            .into_iter()
            .map(|resolution| {
                DiscriminatorConfig::new(self.discriminator_dim, self.condition_dim, resolution)
                    .with_unconditional_head(self.unconditional_heads)
                    .init(device)
            })
            .collect()
    }
}

/// Weighting for each loss term used during training.
#[derive(Config, Debug)]
pub struct LossConfig {
    #[config(default = 1.0)]
    pub uncond_weight: f64,
    #[config(default = 1.0)]
    pub cycle_text_weight: f64,
    #[config(default = 1.0)]
    pub cycle_image_weight: f64,
    #[config(default = 2.0)]
    pub kl_weight: f64,
    #[config(default = 0.3)]
    pub cycle_margin: f64,
    /// Additive Gaussian input noise on discriminator inputs, decaying
    /// linearly to zero over the first `NOISE_DECAY_STEPS` steps.
    #[config(default = false)]
    pub input_noise: bool,
}

/// Discriminator loss terms for one level.
#[derive(Clone, Debug)]
pub struct DiscriminatorLoss<B: Backend> {
    pub total: Tensor<B, 1>,
    pub cond: Tensor<B, 1>,
    pub uncond: Option<Tensor<B, 1>>,
}

/// Numerically stable binary cross entropy on raw logits with float targets.
///
/// Float targets are required because the smoothing policies produce labels
/// strictly inside (0, 1).
pub fn bce_with_logits<B: Backend>(logits: Tensor<B, 1>, targets: Tensor<B, 1>) -> Tensor<B, 1> {
    let loss = logits.clone().clamp_min(0.0).sub(logits.clone().mul(targets))
        + logits.abs().neg().exp().add_scalar(1.0).log();
    loss.mean()
}

/// Discriminator loss for one level, given logits for real, mismatched and
/// detached fake images.
///
/// With an unconditional head the mismatched image is still judged real by
/// it: only image realism, not text match, is scored unconditionally. Without
/// one, the conditional loss falls back to down-weighting the two negative
/// terms.
pub fn discriminator_loss<B: Backend>(
    real: &DiscriminatorOutput<B>,
    wrong: &DiscriminatorOutput<B>,
    fake: &DiscriminatorOutput<B>,
    real_labels: &Tensor<B, 1>,
    fake_labels: &Tensor<B, 1>,
    uncond_weight: f64,
) -> DiscriminatorLoss<B> {
    let err_real = bce_with_logits(real.cond.clone(), real_labels.clone());
    let err_wrong = bce_with_logits(wrong.cond.clone(), fake_labels.clone());
    let err_fake = bce_with_logits(fake.cond.clone(), fake_labels.clone());

    match (&real.uncond, &wrong.uncond, &fake.uncond) {
        (Some(real_u), Some(wrong_u), Some(fake_u)) => {
            let cond = err_real + err_wrong + err_fake;
            let uncond = bce_with_logits(real_u.clone(), real_labels.clone())
                + bce_with_logits(wrong_u.clone(), real_labels.clone())
                + bce_with_logits(fake_u.clone(), fake_labels.clone());
            DiscriminatorLoss {
                total: cond.clone() + uncond.clone().mul_scalar(uncond_weight),
                cond,
                uncond: Some(uncond),
            }
        }
        _ => {
            let cond = err_real + (err_wrong + err_fake).mul_scalar(0.5);
            DiscriminatorLoss {
                total: cond.clone(),
                cond,
                uncond: None,
            }
        }
    }
}

/// Adversarial part of the generator loss for one level: the fake logits are
/// pushed toward the real labels on both heads.
pub fn generator_adversarial_loss<B: Backend>(
    fake: &DiscriminatorOutput<B>,
    real_labels: &Tensor<B, 1>,
    uncond_weight: f64,
) -> Tensor<B, 1> {
    let cond = bce_with_logits(fake.cond.clone(), real_labels.clone());
    match &fake.uncond {
        Some(uncond) => {
            cond + bce_with_logits(uncond.clone(), real_labels.clone()).mul_scalar(uncond_weight)
        }
        None => cond,
    }
}

/// Cosine embedding loss between two feature batches.
///
/// `paired = true` pulls the pair together (target +1); `paired = false`
/// pushes similarity below `margin` (target -1).
pub fn cycle_loss<B: Backend>(
    a: Tensor<B, 2>,
    b: Tensor<B, 2>,
    margin: f64,
    paired: bool,
) -> Tensor<B, 1> {
    let eps = 1e-8;
    let dot = a.clone().mul(b.clone()).sum_dim(1);
    let norm_a = a.powf_scalar(2.0).sum_dim(1).sqrt();
    let norm_b = b.powf_scalar(2.0).sum_dim(1).sqrt();
    let cosine = dot.div(norm_a.mul(norm_b).add_scalar(eps));

    if paired {
        cosine.neg().add_scalar(1.0).mean()
    } else {
        cosine.sub_scalar(margin).clamp_min(0.0).mean()
    }
}

/// KL divergence of the conditioning distribution against a unit Gaussian.
///
/// Divides by the embedding width on top of the batch mean. That deviates
/// from the textbook formula on purpose: it matches StackGAN's released
/// training code, and changing it would change training dynamics and break
/// comparability with existing runs.
pub fn kl_divergence<B: Backend>(mu: Tensor<B, 2>, logvar: Tensor<B, 2>) -> Tensor<B, 1> {
    let embedding_dim = mu.dims()[1];
    let term = logvar
        .clone()
        .exp()
        .add(mu.powf_scalar(2.0))
        .sub(logvar)
        .sub_scalar(1.0);
    term.sum_dim(1)
        .mul_scalar(0.5)
        .mean()
        .div_scalar(embedding_dim as f64)
}

/// Standard deviation of the additive discriminator input noise at a step.
pub fn input_noise_sigma(step: usize, enabled: bool) -> f64 {
    if !enabled {
        return 0.0;
    }
    (1.0 - step as f64 / NOISE_DECAY_STEPS as f64).clamp(0.0, 1.0) * 0.1
}

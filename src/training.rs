use crate::checkpoint::{self, DiscriminatorOptimizer, GeneratorOptimizer};
use crate::data::{self, validate_batch, CaptionedImage, CyclicDataset, TextImageBatcher, TrainBatch};
use crate::error::TrainError;
use crate::labels::{sample_labels, LabelPolicy};
use crate::model::{
    cycle_loss, discriminator_loss, generator_adversarial_loss, input_noise_sigma, kl_divergence,
    LevelDiscriminator, LossConfig, ModelConfig, MultiScaleGenerator,
};
use crate::retrieval::RetrievalFeatureBridge;
use crate::telemetry::{StdoutSink, TelemetrySink};
use crate::utils::{batch_to_rgb, save_image_rows};
use anyhow::{Context, Result};
use burn::config::Config;
use burn::data::dataloader::DataLoaderBuilder;
use burn::module::AutodiffModule;
use burn::optim::{AdamConfig, GradientsParams, Optimizer};
use burn::prelude::*;
use burn::tensor::backend::AutodiffBackend;
use burn::tensor::TensorData;
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, StandardNormal};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Training configuration loaded from `config.json`.
#[derive(Config, Debug)]
pub struct TrainingConfig {
    pub model: ModelConfig,
    pub loss: LossConfig,
    pub labels: LabelPolicy,
    /// Retrieval artifact directory (frozen encoders + tokenizer).
    pub retrieval_dir: String,
    /// JSON-lines dataset manifest.
    pub data_manifest: String,
    pub num_steps: usize,
    pub batch_size: usize,
    pub seed: u64,
    pub optimizer_gen: AdamConfig,
    pub optimizer_disc: AdamConfig,
    #[config(default = 2e-4)]
    pub lr_generator: f64,
    #[config(default = 2e-4)]
    pub lr_discriminator: f64,
    #[config(default = 1000)]
    pub sample_steps: usize,
    #[config(default = 10000)]
    pub checkpoint_steps: usize,
    #[config(default = 100)]
    pub log_steps: usize,
    /// Checkpoint directory to restore before training.
    pub resume_from: Option<String>,
}

/// Scalar losses observed during one step.
#[derive(Clone, Debug)]
pub struct StepMetrics {
    pub err_d_levels: Vec<f64>,
    pub err_d_total: f64,
    pub err_g_total: f64,
    pub err_g_kl: f64,
}

/// Fixed inputs reused by every invocation of the sampling hook, so sample
/// grids stay comparable across a run.
pub struct FixedSample<B: Backend> {
    pub noise: Tensor<B, 2>,
    pub tokens: Tensor<B, 2, Int>,
    pub real: Tensor<B, 4>,
    pub captions: Vec<String>,
}

/// Owns the full training state for the duration of a run: the generator,
/// one (discriminator, optimizer) pair per level, and the step counter.
pub struct Trainer<B: AutodiffBackend> {
    config: TrainingConfig,
    generator: MultiScaleGenerator<B>,
    discriminators: Vec<LevelDiscriminator<B>>,
    optimizer_gen: GeneratorOptimizer<B>,
    optimizers_disc: Vec<DiscriminatorOptimizer<B>>,
    next_step: usize,
    device: B::Device,
}

impl<B: AutodiffBackend> core::fmt::Debug for Trainer<B> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Trainer")
            .field("config", &self.config)
            .field("next_step", &self.next_step)
            .finish_non_exhaustive()
    }
}

impl<B: AutodiffBackend> Trainer<B> {
    /// Fresh training state at step 0.
    pub fn new(config: TrainingConfig, device: B::Device) -> Self {
        B::seed(&device, config.seed);
        let generator = config.model.init_generator(&device);
        let discriminators = config.model.init_discriminators(&device);
        let optimizer_gen = config.optimizer_gen.init();
        let optimizers_disc = (0..config.model.levels)
            .map(|_| config.optimizer_disc.init())
            .collect();
        Self {
            config,
            generator,
            discriminators,
            optimizer_gen,
            optimizers_disc,
            next_step: 0,
            device,
        }
    }

    /// Restore state from a checkpoint and continue from the step after the
    /// one it recorded.
    pub fn resume(
        config: TrainingConfig,
        checkpoint_dir: &Path,
        device: B::Device,
    ) -> Result<Self, TrainError> {
        B::seed(&device, config.seed);
        let optimizer_gen = config.optimizer_gen.init();
        let optimizers_disc = (0..config.model.levels)
            .map(|_| config.optimizer_disc.init())
            .collect();

        let restored = checkpoint::load::<B>(
            checkpoint_dir,
            &config.model,
            optimizer_gen,
            optimizers_disc,
            &device,
        )?;

        Ok(Self {
            config,
            generator: restored.generator,
            discriminators: restored.discriminators,
            optimizer_gen: restored.optimizer_gen,
            optimizers_disc: restored.optimizers_disc,
            next_step: restored.step + 1,
            device,
        })
    }

    /// Index of the next step to execute.
    pub fn next_step(&self) -> usize {
        self.next_step
    }

    pub fn config(&self) -> &TrainingConfig {
        &self.config
    }

    pub fn generator(&self) -> &MultiScaleGenerator<B> {
        &self.generator
    }

    pub fn discriminators(&self) -> &[LevelDiscriminator<B>] {
        &self.discriminators
    }

    /// One full update: every discriminator level, then the generator.
    ///
    /// All fake images come from a single generator forward pass shared by
    /// every level. Discriminator losses for all levels are computed and
    /// checked finite before any optimizer step is applied; the generator
    /// update then runs fresh, non-detached discriminator forward passes.
    pub fn train_step(
        &mut self,
        batch: &TrainBatch<B>,
        bridge: &RetrievalFeatureBridge<B>,
    ) -> Result<StepMetrics, TrainError> {
        let step = self.next_step;
        validate_batch(batch, &self.config.model)?;

        let batch_size = batch.tokens.dims()[0];
        let levels = self.config.model.levels;
        let loss_cfg = &self.config.loss;

        // Every random draw of the step comes from a step-derived stream, so
        // a resumed run replays the identical noise from `step + 1` on.
        let mut rng = StdRng::seed_from_u64(self.config.seed.wrapping_add(step as u64));

        let (real_labels, fake_labels) =
            sample_labels::<B>(batch_size, self.config.labels, &mut rng, &self.device);
        let noise = normal_tensor::<B>(
            [batch_size, self.config.model.z_dim],
            &mut rng,
            &self.device,
        );
        let eps = normal_tensor::<B>(
            [batch_size, self.config.model.condition_dim],
            &mut rng,
            &self.device,
        );

        let txt_feature = bridge.text_feature(&batch.tokens);
        let generated = self.generator.forward(noise, txt_feature.clone(), eps);
        let sigma = input_noise_sigma(step, loss_cfg.input_noise);
        let mu_detached = generated.mu.clone().detach();

        // Discriminator losses for every level, all from the shared forward.
        let mut disc_losses = Vec::with_capacity(levels);
        let mut err_d_levels = Vec::with_capacity(levels);
        let mut err_d_total = 0.0;
        for level in 0..levels {
            let real = perturb(batch.reals[level].clone(), sigma, &mut rng);
            let wrong = perturb(batch.wrongs[level].clone(), sigma, &mut rng);
            let fake = perturb(generated.images[level].clone().detach(), sigma, &mut rng);

            let disc = &self.discriminators[level];
            let real_out = disc.forward(real, mu_detached.clone());
            let wrong_out = disc.forward(wrong, mu_detached.clone());
            let fake_out = disc.forward(fake, mu_detached.clone());

            let loss = discriminator_loss(
                &real_out,
                &wrong_out,
                &fake_out,
                &real_labels,
                &fake_labels,
                loss_cfg.uncond_weight,
            );
            let value = ensure_finite(&loss.total, "errD", step)?;
            err_d_levels.push(value);
            err_d_total += value;
            disc_losses.push(loss);
        }

        // All levels verified finite; apply the per-level steps.
        for (level, loss) in disc_losses.into_iter().enumerate() {
            let grads = loss.total.backward();
            let disc = self.discriminators[level].clone();
            let grads = GradientsParams::from_grads(grads, &disc);
            self.discriminators[level] =
                self.optimizers_disc[level].step(self.config.lr_discriminator, disc, grads);
        }

        // Generator update against the freshly stepped discriminators.
        let mut err_g_total = Tensor::<B, 1>::zeros([1], &self.device);
        for level in 0..levels {
            let fake = perturb(generated.images[level].clone(), sigma, &mut rng);
            let fake_out = self.discriminators[level].forward(fake, generated.mu.clone());
            let adversarial =
                generator_adversarial_loss(&fake_out, &real_labels, loss_cfg.uncond_weight);

            let fake_feature = bridge.image_feature(generated.images[level].clone());
            let cycle_txt = cycle_loss(
                fake_feature.clone(),
                txt_feature.clone(),
                loss_cfg.cycle_margin,
                true,
            );
            let real_feature = bridge.image_feature_frozen(batch.reals[level].clone());
            let cycle_img = cycle_loss(fake_feature, real_feature, loss_cfg.cycle_margin, true);

            err_g_total = err_g_total
                + adversarial
                + cycle_txt.mul_scalar(loss_cfg.cycle_text_weight)
                + cycle_img.mul_scalar(loss_cfg.cycle_image_weight);
        }

        let kl = kl_divergence(generated.mu.clone(), generated.logvar.clone());
        let err_g_kl = ensure_finite(&kl, "errG_kl", step)?;
        err_g_total = err_g_total + kl.mul_scalar(loss_cfg.kl_weight);
        let err_g_value = ensure_finite(&err_g_total, "errG_total", step)?;

        let grads = err_g_total.backward();
        let generator = self.generator.clone();
        let grads = GradientsParams::from_grads(grads, &generator);
        self.generator = self
            .optimizer_gen
            .step(self.config.lr_generator, generator, grads);

        self.next_step += 1;
        Ok(StepMetrics {
            err_d_levels,
            err_d_total,
            err_g_total: err_g_value,
            err_g_kl,
        })
    }

    /// Persist the full training state. Synchronous by design; call only
    /// between steps so partially-stepped state is never written.
    pub fn checkpoint(&self, dir: &Path) -> Result<(), TrainError> {
        checkpoint::save(
            dir,
            self.next_step.saturating_sub(1),
            &self.config,
            &self.generator,
            &self.discriminators,
            &self.optimizer_gen,
            &self.optimizers_disc,
        )
    }

    /// Sampling hook: render the fixed batch at the highest level and save a
    /// real/generated grid. Reads state, never mutates it.
    pub fn sample(
        &self,
        fixed: &FixedSample<B>,
        bridge: &RetrievalFeatureBridge<B>,
        dir: &Path,
    ) -> Result<PathBuf> {
        let generator = self.generator.valid();
        let txt_feature = bridge.text_feature(&fixed.tokens).inner();
        let batch_size = fixed.noise.dims()[0];
        // The conditioning mean is used directly when sampling.
        let eps = Tensor::zeros([batch_size, self.config.model.condition_dim], &self.device);

        let generated = generator.forward(fixed.noise.clone().inner(), txt_feature, eps);
        let fake = generated
            .images
            .last()
            .expect("generator produced no levels")
            .clone();

        let real_row = batch_to_rgb(fixed.real.clone().inner())?;
        let fake_row = batch_to_rgb(fake)?;

        std::fs::create_dir_all(dir)?;
        let caption_path = dir.join("captions.txt");
        if !caption_path.exists() {
            std::fs::write(&caption_path, fixed.captions.join("\n"))?;
        }

        let path = dir.join(format!("sample_{:07}.png", self.next_step));
        save_image_rows(&[real_row, fake_row], &path)?;
        Ok(path)
    }
}

/// Fixed noise in the reference layout: the first half of the batch shares
/// one draw, the second half gets independent draws.
pub fn fixed_noise<B: Backend>(
    batch_size: usize,
    z_dim: usize,
    rng: &mut StdRng,
    device: &B::Device,
) -> Tensor<B, 2> {
    let shared_rows = (batch_size / 2).max(1).min(batch_size);
    let shared = normal_tensor::<B>([1, z_dim], rng, device).repeat(&[shared_rows, 1]);
    if shared_rows == batch_size {
        return shared;
    }
    let rest = normal_tensor::<B>([batch_size - shared_rows, z_dim], rng, device);
    Tensor::cat(vec![shared, rest], 0)
}

fn normal_tensor<B: Backend>(
    dims: [usize; 2],
    rng: &mut StdRng,
    device: &B::Device,
) -> Tensor<B, 2> {
    let count = dims[0] * dims[1];
    let values: Vec<f32> = (0..count).map(|_| StandardNormal.sample(rng)).collect();
    Tensor::from_data(TensorData::new(values, dims), device)
}

/// Additive zero-mean Gaussian input noise on discriminator inputs.
fn perturb<B: Backend>(images: Tensor<B, 4>, sigma: f64, rng: &mut StdRng) -> Tensor<B, 4> {
    if sigma <= 0.0 {
        return images;
    }
    let dims = images.dims();
    let count: usize = dims.iter().product();
    let values: Vec<f32> = (0..count)
        .map(|_| {
            let v: f32 = StandardNormal.sample(rng);
            v * sigma as f32
        })
        .collect();
    let noise = Tensor::from_data(TensorData::new(values, dims), &images.device());
    images.add(noise)
}

fn ensure_finite<B: Backend>(
    loss: &Tensor<B, 1>,
    name: &'static str,
    step: usize,
) -> Result<f64, TrainError> {
    let value: f64 = loss.clone().into_scalar().elem();
    if !value.is_finite() {
        return Err(TrainError::NumericalInstability {
            loss: name,
            step,
            value,
        });
    }
    Ok(value)
}

/// Train a multi-scale text-to-image GAN, handling checkpoints and sampling.
pub fn train<B: AutodiffBackend>(
    experiment_dir: &Path,
    config: TrainingConfig,
    device: B::Device,
) -> Result<()> {
    let mut sink = StdoutSink;
    train_with_sink::<B>(experiment_dir, config, device, &mut sink)
}

/// [`train`] with an injected telemetry sink.
pub fn train_with_sink<B: AutodiffBackend>(
    experiment_dir: &Path,
    config: TrainingConfig,
    device: B::Device,
    sink: &mut dyn TelemetrySink,
) -> Result<()> {
    let checkpoint_dir = experiment_dir.join("checkpoint");
    let sample_dir = experiment_dir.join("samples");
    std::fs::create_dir_all(&checkpoint_dir)?;
    config.save(experiment_dir.join("config.json"))?;

    let bridge = RetrievalFeatureBridge::<B>::load(
        Path::new(&config.retrieval_dir),
        config.model.feature_dim,
        &device,
    )?;

    let examples = data::load_examples(Path::new(&config.data_manifest))?;
    println!("train examples -> {}", examples.len());
    if examples.is_empty() {
        return Err(anyhow::anyhow!("no training examples found"));
    }

    let mut trainer = match &config.resume_from {
        Some(path) => Trainer::resume(config.clone(), Path::new(path), device.clone())?,
        None => Trainer::new(config.clone(), device.clone()),
    };

    let examples: Vec<Arc<CaptionedImage>> = examples.into_iter().map(Arc::new).collect();
    let dataset = CyclicDataset::new(examples, config.batch_size);
    let batcher = TextImageBatcher::new(bridge.tokenizer().clone(), config.model.resolutions());
    let loader = DataLoaderBuilder::<B, Arc<CaptionedImage>, TrainBatch<B>>::new(batcher)
        .batch_size(config.batch_size)
        .shuffle(config.seed)
        .set_device(device.clone())
        .build(dataset);

    // Fixed sampling inputs, drawn once outside the per-step streams.
    let mut sample_rng = StdRng::seed_from_u64(config.seed ^ 0x5a5a_5a5a_5a5a_5a5a);
    let first_batch = loader
        .iter()
        .next()
        .context("dataloader yielded no batches")?;
    let fixed = FixedSample {
        noise: fixed_noise::<B>(config.batch_size, config.model.z_dim, &mut sample_rng, &device),
        tokens: first_batch.tokens.clone(),
        real: first_batch
            .reals
            .last()
            .expect("batch has no levels")
            .clone(),
        captions: first_batch.captions.clone(),
    };

    'training: loop {
        for batch in loader.iter() {
            let step = trainer.next_step();
            if step >= config.num_steps {
                break 'training;
            }

            let metrics = trainer.train_step(&batch, &bridge)?;

            if config.log_steps > 0 && step % config.log_steps == 0 {
                let mut scalars = vec![
                    ("errD_total", metrics.err_d_total),
                    ("errG_total", metrics.err_g_total),
                    ("errG_kl", metrics.err_g_kl),
                ];
                let per_level: Vec<(String, f64)> = metrics
                    .err_d_levels
                    .iter()
                    .enumerate()
                    .map(|(level, value)| (format!("errD{level}"), *value))
                    .collect();
                scalars.extend(per_level.iter().map(|(name, value)| (name.as_str(), *value)));
                sink.log_scalars(step, &scalars);
            }

            if config.sample_steps > 0 && step % config.sample_steps == 0 {
                let path = trainer.sample(&fixed, &bridge, &sample_dir)?;
                sink.log_image(step, &path);
            }

            if config.checkpoint_steps > 0 && step > 0 && step % config.checkpoint_steps == 0 {
                trainer.checkpoint(&checkpoint_dir)?;
            }
        }
    }

    trainer.checkpoint(&checkpoint_dir)?;
    Ok(())
}

use crate::error::TrainError;
use crate::model::{LevelDiscriminator, ModelConfig, MultiScaleGenerator};
use crate::training::TrainingConfig;
use burn::config::Config;
use burn::module::Module;
use burn::optim::adaptor::OptimizerAdaptor;
use burn::optim::{Adam, Optimizer};
use burn::record::{FullPrecisionSettings, NamedMpkFileRecorder, Recorder};
use burn::tensor::backend::AutodiffBackend;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub type GeneratorOptimizer<B> = OptimizerAdaptor<Adam, MultiScaleGenerator<B>, B>;
pub type DiscriminatorOptimizer<B> = OptimizerAdaptor<Adam, LevelDiscriminator<B>, B>;

type GeneratorOptimizerRecord<B> =
    <GeneratorOptimizer<B> as Optimizer<MultiScaleGenerator<B>, B>>::Record;
type DiscriminatorOptimizerRecord<B> =
    <DiscriminatorOptimizer<B> as Optimizer<LevelDiscriminator<B>, B>>::Record;

/// Step counter persisted next to the weight records.
#[derive(Serialize, Deserialize, Debug)]
struct StepState {
    step: usize,
}

/// Everything restored from a checkpoint artifact.
pub struct RestoredState<B: AutodiffBackend> {
    pub step: usize,
    pub generator: MultiScaleGenerator<B>,
    pub discriminators: Vec<LevelDiscriminator<B>>,
    pub optimizer_gen: GeneratorOptimizer<B>,
    pub optimizers_disc: Vec<DiscriminatorOptimizer<B>>,
}

fn recorder() -> NamedMpkFileRecorder<FullPrecisionSettings> {
    // Full precision: checkpoint round-trips must be bit-identical.
    NamedMpkFileRecorder::<FullPrecisionSettings>::new()
}

fn state_path(dir: &Path) -> PathBuf {
    dir.join("state.json")
}

/// Persist the full training state to `dir` with overwrite semantics.
///
/// The write is synchronous; the loop blocks until it finishes so no
/// partially-stepped state is ever persisted.
pub fn save<B: AutodiffBackend>(
    dir: &Path,
    step: usize,
    config: &TrainingConfig,
    generator: &MultiScaleGenerator<B>,
    discriminators: &[LevelDiscriminator<B>],
    optimizer_gen: &GeneratorOptimizer<B>,
    optimizers_disc: &[DiscriminatorOptimizer<B>],
) -> Result<(), TrainError> {
    std::fs::create_dir_all(dir).map_err(|err| TrainError::io(dir, err))?;

    config
        .save(dir.join("config.json"))
        .map_err(|err| TrainError::io(dir.join("config.json"), err))?;

    let state = serde_json::to_string_pretty(&StepState { step })
        .map_err(|err| TrainError::corrupt(state_path(dir), err))?;
    std::fs::write(state_path(dir), state).map_err(|err| TrainError::io(state_path(dir), err))?;

    let recorder = recorder();
    generator
        .clone()
        .save_file(dir.join("generator"), &recorder)
        .map_err(|err| TrainError::corrupt(dir.join("generator"), err))?;
    recorder
        .record(optimizer_gen.to_record(), dir.join("optim_generator"))
        .map_err(|err| TrainError::corrupt(dir.join("optim_generator"), err))?;

    for (level, (disc, optim)) in discriminators.iter().zip(optimizers_disc).enumerate() {
        disc.clone()
            .save_file(dir.join(format!("discriminator_{level}")), &recorder)
            .map_err(|err| TrainError::corrupt(dir.join(format!("discriminator_{level}")), err))?;
        recorder
            .record(
                optim.to_record(),
                dir.join(format!("optim_discriminator_{level}")),
            )
            .map_err(|err| {
                TrainError::corrupt(dir.join(format!("optim_discriminator_{level}")), err)
            })?;
    }

    Ok(())
}

/// Restore a checkpoint written by [`save`].
///
/// The embedded model configuration is validated field-by-field against the
/// run configuration before any weights are applied; incompatibility is a
/// `ConfigMismatch`, undeserializable artifacts are `CorruptArtifact`.
pub fn load<B: AutodiffBackend>(
    dir: &Path,
    run_model: &ModelConfig,
    fresh_optim_gen: GeneratorOptimizer<B>,
    fresh_optims_disc: Vec<DiscriminatorOptimizer<B>>,
    device: &B::Device,
) -> Result<RestoredState<B>, TrainError> {
    let config_path = dir.join("config.json");
    let stored = TrainingConfig::load(&config_path)
        .map_err(|err| TrainError::corrupt(&config_path, err))?;
    validate_model_config(&stored.model, run_model)?;

    let state_file = std::fs::read_to_string(state_path(dir))
        .map_err(|err| TrainError::io(state_path(dir), err))?;
    let state: StepState = serde_json::from_str(&state_file)
        .map_err(|err| TrainError::corrupt(state_path(dir), err))?;

    let recorder = recorder();
    let generator = run_model
        .init_generator::<B>(device)
        .load_file(dir.join("generator"), &recorder, device)
        .map_err(|err| TrainError::corrupt(dir.join("generator"), err))?;

    let gen_record: GeneratorOptimizerRecord<B> = recorder
        .load(dir.join("optim_generator"), device)
        .map_err(|err| TrainError::corrupt(dir.join("optim_generator"), err))?;
    let optimizer_gen = fresh_optim_gen.load_record(gen_record);

    let mut discriminators = Vec::with_capacity(run_model.levels);
    let mut optimizers_disc = Vec::with_capacity(run_model.levels);
    for (level, (fresh_disc, fresh_optim)) in run_model
        .init_discriminators::<B>(device)
        .into_iter()
        .zip(fresh_optims_disc)
        .enumerate()
    {
        let disc = fresh_disc
            .load_file(dir.join(format!("discriminator_{level}")), &recorder, device)
            .map_err(|err| TrainError::corrupt(dir.join(format!("discriminator_{level}")), err))?;
        let record: DiscriminatorOptimizerRecord<B> = recorder
            .load(dir.join(format!("optim_discriminator_{level}")), device)
            .map_err(|err| {
                TrainError::corrupt(dir.join(format!("optim_discriminator_{level}")), err)
            })?;
        discriminators.push(disc);
        optimizers_disc.push(fresh_optim.load_record(record));
    }

    Ok(RestoredState {
        step: state.step,
        generator,
        discriminators,
        optimizer_gen,
        optimizers_disc,
    })
}

/// Structural compatibility between a stored and a requested architecture.
fn validate_model_config(stored: &ModelConfig, requested: &ModelConfig) -> Result<(), TrainError> {
    let fields = [
        ("levels", stored.levels, requested.levels),
        ("z_dim", stored.z_dim, requested.z_dim),
        ("feature_dim", stored.feature_dim, requested.feature_dim),
        ("condition_dim", stored.condition_dim, requested.condition_dim),
        ("generator_dim", stored.generator_dim, requested.generator_dim),
        (
            "discriminator_dim",
            stored.discriminator_dim,
            requested.discriminator_dim,
        ),
        ("base_size", stored.base_size, requested.base_size),
    ];
    for (name, stored_value, requested_value) in fields {
        if stored_value != requested_value {
            return Err(TrainError::ConfigMismatch(format!(
                "checkpoint {name} = {stored_value}, run configured with {requested_value}"
            )));
        }
    }
    if stored.unconditional_heads != requested.unconditional_heads {
        return Err(TrainError::ConfigMismatch(
            "checkpoint and run disagree on unconditional discriminator heads".into(),
        ));
    }
    Ok(())
}

use burn::backend::{ndarray::NdArray, Autodiff};
use burn::module::{AutodiffModule, Module, ModuleVisitor, Param};
use burn::optim::AdamConfig;
use burn::prelude::*;
use burn::tensor::TensorData;
use stackgan_burn::data::TrainBatch;
use stackgan_burn::error::TrainError;
use stackgan_burn::labels::LabelPolicy;
use stackgan_burn::model::{LossConfig, ModelConfig};
use stackgan_burn::retrieval::{save_artifact, RetrievalConfig, RetrievalFeatureBridge, Tokenizer};
use stackgan_burn::telemetry::NullSink;
use stackgan_burn::training::{train_with_sink, Trainer, TrainingConfig};

type TB = Autodiff<NdArray>;
type Dev = <TB as Backend>::Device;

fn tiny_config(seed: u64) -> TrainingConfig {
    TrainingConfig::new(
        ModelConfig::new(16, 12, 6, 4, 4, 2).with_base_size(8),
        LossConfig::new(),
        LabelPolicy::Original,
        "unused".into(),
        "unused".into(),
        4,
        4,
        seed,
        AdamConfig::new().with_beta_1(0.5),
        AdamConfig::new().with_beta_1(0.5),
    )
}

fn tiny_bridge(device: &Dev) -> RetrievalFeatureBridge<TB> {
    let config = RetrievalConfig::new(16, 3, 8, 12, 4);
    let tokenizer = Tokenizer::new(["red", "bird", "yellow", "beak"].map(String::from), 3);
    RetrievalFeatureBridge::from_parts(
        config.clone(),
        tokenizer,
        config.init_text_encoder(device),
        config.init_image_encoder(device),
    )
    .unwrap()
}

fn synthetic_batch(
    model: &ModelConfig,
    batch_size: usize,
    bridge: &RetrievalFeatureBridge<TB>,
    device: &Dev,
) -> TrainBatch<TB> {
    let captions: Vec<String> = (0..batch_size)
        .map(|i| {
            if i % 2 == 0 {
                "red bird".to_string()
            } else {
                "yellow beak".to_string()
            }
        })
        .collect();
    let tokens = bridge.tokenizer().encode::<TB>(&captions, device);

    let level_images = |offset: usize| {
        model
            .resolutions()
            .into_iter()
            .map(|res| {
                let count = batch_size * 3 * res * res;
                let values: Vec<f32> = (0..count)
                    .map(|i| (((i + offset) % 17) as f32 / 8.5) - 1.0)
                    .collect();
                Tensor::<TB, 4>::from_data(
                    TensorData::new(values, [batch_size, 3, res, res]),
                    device,
                )
            })
            .collect::<Vec<_>>()
    };

    TrainBatch {
        tokens,
        reals: level_images(0),
        wrongs: level_images(5),
        captions,
    }
}

/// Generator output on a fixed probe input, for comparing trainer states.
fn probe(trainer: &Trainer<TB>, bridge: &RetrievalFeatureBridge<TB>, device: &Dev) -> Vec<f32> {
    let tokens = bridge
        .tokenizer()
        .encode::<TB>(&["red bird".to_string()], device);
    let txt = bridge.text_feature(&tokens);
    let noise = Tensor::<TB, 2>::ones([1, 16], device);
    let eps = Tensor::<TB, 2>::zeros([1, 6], device);
    let out = trainer
        .generator()
        .valid()
        .forward(noise.inner(), txt.inner(), eps.inner());
    out.images.last().unwrap().to_data().to_vec().unwrap()
}

fn assert_close(a: &[f32], b: &[f32], tolerance: f32) {
    assert_eq!(a.len(), b.len());
    for (idx, (x, y)) in a.iter().zip(b).enumerate() {
        assert!((x - y).abs() <= tolerance, "index {idx}: {x} vs {y}");
    }
}

/// Collects every float parameter of a module, in traversal order.
struct WeightCollector {
    weights: Vec<Vec<f32>>,
}

impl ModuleVisitor<TB> for WeightCollector {
    fn visit_float<const D: usize>(&mut self, param: &Param<Tensor<TB, D>>) {
        self.weights
            .push(param.val().to_data().convert::<f32>().to_vec().unwrap());
    }
}

fn module_weights<M: Module<TB>>(module: &M) -> Vec<Vec<f32>> {
    let mut collector = WeightCollector {
        weights: Vec::new(),
    };
    module.visit(&mut collector);
    collector.weights
}

#[test]
fn train_step_yields_finite_losses_for_every_level() {
    let device = Dev::default();
    let config = tiny_config(11);
    let bridge = tiny_bridge(&device);
    let batch = synthetic_batch(&config.model, config.batch_size, &bridge, &device);

    let mut trainer = Trainer::new(config, device);
    let metrics = trainer.train_step(&batch, &bridge).unwrap();

    assert_eq!(metrics.err_d_levels.len(), 2);
    assert!(metrics.err_d_levels.iter().all(|v| v.is_finite()));
    assert!(metrics.err_d_total.is_finite());
    assert!(metrics.err_g_total.is_finite());
    assert!(metrics.err_g_kl.is_finite());
    assert_eq!(trainer.next_step(), 1);
}

#[test]
fn train_step_rejects_batch_with_missing_level() {
    let device = Dev::default();
    let config = tiny_config(3);
    let bridge = tiny_bridge(&device);
    let mut batch = synthetic_batch(&config.model, config.batch_size, &bridge, &device);
    batch.reals.pop();

    let mut trainer = Trainer::new(config, device);
    let err = trainer.train_step(&batch, &bridge).unwrap_err();
    assert!(matches!(err, TrainError::ShapeMismatch(_)));
    assert_eq!(trainer.next_step(), 0);
}

#[test]
fn checkpoint_round_trips_weights_and_step() {
    let device = Dev::default();
    let config = tiny_config(21);
    let bridge = tiny_bridge(&device);
    let batch = synthetic_batch(&config.model, config.batch_size, &bridge, &device);

    let mut trainer = Trainer::new(config.clone(), device.clone());
    trainer.train_step(&batch, &bridge).unwrap();

    let dir = tempfile::tempdir().unwrap();
    trainer.checkpoint(dir.path()).unwrap();

    let resumed = Trainer::<TB>::resume(config, dir.path(), device.clone()).unwrap();
    assert_eq!(resumed.next_step(), trainer.next_step());

    // Restored weights must be bit-identical, not merely close.
    assert_eq!(
        module_weights(trainer.generator()),
        module_weights(resumed.generator())
    );
    assert_eq!(trainer.discriminators().len(), resumed.discriminators().len());
    for (saved, restored) in trainer
        .discriminators()
        .iter()
        .zip(resumed.discriminators())
    {
        assert_eq!(module_weights(saved), module_weights(restored));
    }
}

#[test]
fn resumed_run_matches_uninterrupted_run() {
    let device = Dev::default();
    let config = tiny_config(33);
    let bridge = tiny_bridge(&device);
    let batch = synthetic_batch(&config.model, config.batch_size, &bridge, &device);

    let mut continuous = Trainer::new(config.clone(), device.clone());
    continuous.train_step(&batch, &bridge).unwrap();
    continuous.train_step(&batch, &bridge).unwrap();

    let mut interrupted = Trainer::new(config.clone(), device.clone());
    interrupted.train_step(&batch, &bridge).unwrap();
    let dir = tempfile::tempdir().unwrap();
    interrupted.checkpoint(dir.path()).unwrap();

    let mut resumed = Trainer::<TB>::resume(config, dir.path(), device.clone()).unwrap();
    assert_eq!(resumed.next_step(), 1);
    resumed.train_step(&batch, &bridge).unwrap();

    assert_eq!(resumed.next_step(), continuous.next_step());
    assert_close(
        &probe(&resumed, &bridge, &device),
        &probe(&continuous, &bridge, &device),
        1e-5,
    );
}

#[test]
fn full_run_writes_samples_and_a_final_checkpoint() {
    let device = Dev::default();
    let root = tempfile::tempdir().unwrap();

    let retrieval_dir = root.path().join("retrieval");
    let rconfig = RetrievalConfig::new(16, 3, 8, 12, 4);
    let tokenizer = Tokenizer::new(["red", "bird", "yellow", "beak"].map(String::from), 3);
    save_artifact::<TB>(
        &retrieval_dir,
        &rconfig,
        &tokenizer,
        rconfig.init_text_encoder(&device),
        rconfig.init_image_encoder(&device),
    )
    .unwrap();

    let data_dir = root.path().join("data");
    std::fs::create_dir_all(&data_dir).unwrap();
    let mut manifest = String::new();
    for (i, caption) in ["red bird", "yellow beak"].iter().enumerate() {
        let img = image::RgbImage::from_pixel(8, 8, image::Rgb([(i as u8) * 90, 30, 200]));
        img.save(data_dir.join(format!("img_{i}.png"))).unwrap();
        manifest.push_str(&format!(
            "{{\"caption\": \"{caption}\", \"image\": \"img_{i}.png\"}}\n"
        ));
    }
    let manifest_path = data_dir.join("manifest.jsonl");
    std::fs::write(&manifest_path, manifest).unwrap();

    let mut config = tiny_config(9);
    config.retrieval_dir = retrieval_dir.to_string_lossy().into_owned();
    config.data_manifest = manifest_path.to_string_lossy().into_owned();
    config.num_steps = 2;
    config.batch_size = 2;
    config.sample_steps = 1;
    config.log_steps = 1;

    let experiment = root.path().join("experiment");
    let mut sink = NullSink;
    train_with_sink::<TB>(&experiment, config, device, &mut sink).unwrap();

    assert!(experiment.join("config.json").exists());
    assert!(experiment.join("checkpoint").join("state.json").exists());
    assert!(experiment.join("checkpoint").join("generator.mpk").exists());
    assert!(experiment.join("samples").join("captions.txt").exists());
    assert!(experiment.join("samples").join("sample_0000001.png").exists());
}

#[test]
fn resume_rejects_checkpoint_with_different_level_count() {
    let device = Dev::default();
    let mut three_level = tiny_config(5);
    three_level.model = ModelConfig::new(16, 12, 6, 4, 4, 3).with_base_size(8);

    let trainer = Trainer::<TB>::new(three_level, device.clone());
    let dir = tempfile::tempdir().unwrap();
    trainer.checkpoint(dir.path()).unwrap();

    let err = Trainer::<TB>::resume(tiny_config(5), dir.path(), device).unwrap_err();
    assert!(matches!(err, TrainError::ConfigMismatch(_)));
}

use crate::error::TrainError;
use crate::init::{initializer_for, LayerRole};
use burn::module::AutodiffModule;
use burn::nn::conv::{Conv2d, Conv2dConfig};
use burn::nn::pool::{AdaptiveAvgPool2d, AdaptiveAvgPool2dConfig};
use burn::nn::{Embedding, EmbeddingConfig, Linear, LinearConfig, PaddingConfig2d};
use burn::prelude::*;
use burn::record::{FullPrecisionSettings, NamedMpkFileRecorder};
use burn::tensor::activation::leaky_relu;
use burn::tensor::backend::AutodiffBackend;
use burn::tensor::TensorData;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

/// Architecture of the pretrained cross-modal retrieval encoders.
#[derive(Config, Debug)]
pub struct RetrievalConfig {
    pub vocab_size: usize,
    /// Fixed token count per caption after padding/truncation.
    pub token_len: usize,
    /// Word embedding width inside the text encoder.
    pub word_dim: usize,
    /// Shared embedding width of both encoders.
    pub feature_dim: usize,
    /// Channel multiplier of the image encoder.
    pub encoder_dim: usize,
}

/// Whitespace tokenizer with the retrieval model's fixed vocabulary.
///
/// Index 0 is padding, index 1 is the unknown token.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Tokenizer {
    vocab: HashMap<String, i64>,
    token_len: usize,
}

impl Tokenizer {
    pub fn new(words: impl IntoIterator<Item = String>, token_len: usize) -> Self {
        let vocab = words
            .into_iter()
            .enumerate()
            .map(|(idx, word)| (word, idx as i64 + 2))
            .collect();
        Self { vocab, token_len }
    }

    pub fn vocab_size(&self) -> usize {
        self.vocab.len() + 2
    }

    pub fn token_len(&self) -> usize {
        self.token_len
    }

    /// Encode captions into a padded `[batch, token_len]` id tensor.
    pub fn encode<B: Backend>(&self, captions: &[String], device: &B::Device) -> Tensor<B, 2, Int> {
        let batch = captions.len();
        let mut ids = vec![0i64; batch * self.token_len];
        for (row, caption) in captions.iter().enumerate() {
            for (col, word) in caption
                .split_whitespace()
                .take(self.token_len)
                .enumerate()
            {
                let id = self
                    .vocab
                    .get(&word.to_lowercase())
                    .copied()
                    .unwrap_or(1);
                ids[row * self.token_len + col] = id;
            }
        }
        Tensor::from_data(TensorData::new(ids, [batch, self.token_len]), device)
    }
}

/// Frozen text encoder: word embeddings, mean pooling, linear projection.
#[derive(Module, Debug)]
pub struct TextEncoder<B: Backend> {
    embedding: Embedding<B>,
    project: Linear<B>,
}

impl<B: Backend> TextEncoder<B> {
    pub fn forward(&self, tokens: Tensor<B, 2, Int>) -> Tensor<B, 2> {
        let embedded = self.embedding.forward(tokens);
        let pooled = embedded.mean_dim(1).squeeze_dim::<2>(1);
        self.project.forward(pooled)
    }
}

/// Frozen image encoder; adaptive pooling keeps it resolution-agnostic so a
/// single encoder serves every generator level.
#[derive(Module, Debug)]
pub struct ImageEncoder<B: Backend> {
    convs: Vec<Conv2d<B>>,
    pool: AdaptiveAvgPool2d,
    project: Linear<B>,
}

impl<B: Backend> ImageEncoder<B> {
    pub fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        let mut x = images;
        for conv in &self.convs {
            x = leaky_relu(conv.forward(x), 0.2);
        }
        let pooled = self.pool.forward(x);
        let [batch, channels, _, _] = pooled.dims();
        self.project.forward(pooled.reshape([batch, channels]))
    }
}

impl RetrievalConfig {
    pub fn init_text_encoder<B: Backend>(&self, device: &B::Device) -> TextEncoder<B> {
        TextEncoder {
            embedding: EmbeddingConfig::new(self.vocab_size, self.word_dim).init(device),
            project: LinearConfig::new(self.word_dim, self.feature_dim)
                .with_initializer(initializer_for(LayerRole::Linear))
                .init(device),
        }
    }

    pub fn init_image_encoder<B: Backend>(&self, device: &B::Device) -> ImageEncoder<B> {
        let dims = [
            (3, self.encoder_dim),
            (self.encoder_dim, self.encoder_dim * 2),
            (self.encoder_dim * 2, self.encoder_dim * 4),
        ];
        let convs = dims
            .into_iter()
            .map(|(cin, cout)| {
                Conv2dConfig::new([cin, cout], [4, 4])
                    .with_stride([2, 2])
                    .with_padding(PaddingConfig2d::Explicit(1, 1))
                    .with_initializer(initializer_for(LayerRole::Convolutional))
                    .init(device)
            })
            .collect();
        ImageEncoder {
            convs,
            pool: AdaptiveAvgPool2dConfig::new([1, 1]).init(),
            project: LinearConfig::new(self.encoder_dim * 4, self.feature_dim)
                .with_initializer(initializer_for(LayerRole::Linear))
                .init(device),
        }
    }
}

/// Frozen retrieval encoders plus the calls the training loop needs.
///
/// The text encoder lives on the inner backend: its features are constants to
/// autodiff. The image encoder lives on the autodiff backend with its
/// parameters marked no-grad, so cycle-loss gradients flow back into the
/// generator but never into the encoder.
#[derive(Debug)]
pub struct RetrievalFeatureBridge<B: AutodiffBackend> {
    config: RetrievalConfig,
    tokenizer: Tokenizer,
    text_encoder: TextEncoder<B::InnerBackend>,
    image_encoder: ImageEncoder<B>,
}

impl<B: AutodiffBackend> RetrievalFeatureBridge<B> {
    /// Wrap freshly constructed or already-loaded encoders.
    pub fn from_parts(
        config: RetrievalConfig,
        tokenizer: Tokenizer,
        text_encoder: TextEncoder<B>,
        image_encoder: ImageEncoder<B>,
    ) -> Result<Self, TrainError> {
        if tokenizer.vocab_size() > config.vocab_size {
            return Err(TrainError::ConfigMismatch(format!(
                "tokenizer vocabulary ({}) exceeds declared vocab_size ({})",
                tokenizer.vocab_size(),
                config.vocab_size
            )));
        }
        Ok(Self {
            config,
            tokenizer,
            text_encoder: text_encoder.valid(),
            image_encoder: image_encoder.no_grad(),
        })
    }

    /// Load a retrieval artifact directory written by [`save_artifact`].
    ///
    /// Fails with `ConfigMismatch` before any training step if the artifact's
    /// feature width disagrees with the run configuration, and with
    /// `CorruptArtifact` if any file cannot be deserialized.
    pub fn load(
        dir: &Path,
        expected_feature_dim: usize,
        device: &B::Device,
    ) -> Result<Self, TrainError> {
        let config_path = dir.join("retrieval.json");
        let config = RetrievalConfig::load(&config_path)
            .map_err(|err| TrainError::corrupt(&config_path, err))?;
        if config.feature_dim != expected_feature_dim {
            return Err(TrainError::ConfigMismatch(format!(
                "retrieval feature_dim {} but the run expects {}",
                config.feature_dim, expected_feature_dim
            )));
        }

        let vocab_path = dir.join("vocab.json");
        let vocab_file = std::fs::read_to_string(&vocab_path)
            .map_err(|err| TrainError::io(&vocab_path, err))?;
        let tokenizer: Tokenizer = serde_json::from_str(&vocab_file)
            .map_err(|err| TrainError::corrupt(&vocab_path, err))?;

        let recorder = NamedMpkFileRecorder::<FullPrecisionSettings>::new();
        let text_encoder = config
            .init_text_encoder::<B>(device)
            .load_file(dir.join("text_encoder"), &recorder, device)
            .map_err(|err| TrainError::corrupt(dir.join("text_encoder"), err))?;
        let image_encoder = config
            .init_image_encoder::<B>(device)
            .load_file(dir.join("image_encoder"), &recorder, device)
            .map_err(|err| TrainError::corrupt(dir.join("image_encoder"), err))?;

        Self::from_parts(config, tokenizer, text_encoder, image_encoder)
    }

    pub fn config(&self) -> &RetrievalConfig {
        &self.config
    }

    pub fn tokenizer(&self) -> &Tokenizer {
        &self.tokenizer
    }

    /// Frozen text embedding for a token batch. Never gradient-tracked.
    pub fn text_feature(&self, tokens: &Tensor<B, 2, Int>) -> Tensor<B, 2> {
        let device = tokens.device();
        let inner_tokens =
            Tensor::<B::InnerBackend, 2, Int>::from_data(tokens.to_data(), &device);
        Tensor::from_inner(self.text_encoder.forward(inner_tokens))
    }

    /// Image embedding with gradients flowing back into the input, used on
    /// generator outputs for the cycle losses.
    pub fn image_feature(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        self.image_encoder.forward(images)
    }

    /// No-grad image embedding for stored real images used as loss targets.
    pub fn image_feature_frozen(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        Tensor::from_inner(self.image_encoder.valid().forward(images.inner()))
    }
}

/// Persist retrieval encoders as a loadable artifact directory.
pub fn save_artifact<B: Backend>(
    dir: &Path,
    config: &RetrievalConfig,
    tokenizer: &Tokenizer,
    text_encoder: TextEncoder<B>,
    image_encoder: ImageEncoder<B>,
) -> Result<(), TrainError> {
    std::fs::create_dir_all(dir).map_err(|err| TrainError::io(dir, err))?;
    config
        .save(dir.join("retrieval.json"))
        .map_err(|err| TrainError::io(dir.join("retrieval.json"), err))?;

    let vocab_path = dir.join("vocab.json");
    let vocab_json = serde_json::to_string(tokenizer)
        .map_err(|err| TrainError::corrupt(&vocab_path, err))?;
    std::fs::write(&vocab_path, vocab_json).map_err(|err| TrainError::io(&vocab_path, err))?;

    let recorder = NamedMpkFileRecorder::<FullPrecisionSettings>::new();
    text_encoder
        .save_file(dir.join("text_encoder"), &recorder)
        .map_err(|err| TrainError::corrupt(dir.join("text_encoder"), err))?;
    image_encoder
        .save_file(dir.join("image_encoder"), &recorder)
        .map_err(|err| TrainError::corrupt(dir.join("image_encoder"), err))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::{ndarray::NdArray, Autodiff};

    type B = Autodiff<NdArray>;

    fn tiny_config() -> RetrievalConfig {
        RetrievalConfig::new(16, 4, 8, 12, 4)
    }

    fn tiny_tokenizer() -> Tokenizer {
        Tokenizer::new(
            ["cheese", "tomato", "basil"].map(String::from),
            4,
        )
    }

    #[test]
    fn tokenizer_pads_and_maps_unknowns() {
        let tokenizer = tiny_tokenizer();
        let device = Default::default();
        let tokens = tokenizer.encode::<NdArray>(
            &["cheese anchovy".to_string(), "".to_string()],
            &device,
        );
        assert_eq!(tokens.dims(), [2, 4]);
        let ids: Vec<i64> = tokens.to_data().to_vec().unwrap();
        assert_eq!(ids[0], 2); // first vocab word
        assert_eq!(ids[1], 1); // unknown
        assert_eq!(&ids[2..], &[0, 0, 0, 0, 0, 0]); // padding
    }

    #[test]
    fn artifact_round_trips_and_validates_feature_dim() {
        let device = Default::default();
        let config = tiny_config();
        let dir = tempfile::tempdir().unwrap();

        save_artifact::<B>(
            dir.path(),
            &config,
            &tiny_tokenizer(),
            config.init_text_encoder(&device),
            config.init_image_encoder(&device),
        )
        .unwrap();

        let bridge = RetrievalFeatureBridge::<B>::load(dir.path(), 12, &device).unwrap();
        let tokens = bridge
            .tokenizer()
            .encode::<B>(&["tomato basil".to_string()], &device);
        let feature = bridge.text_feature(&tokens);
        assert_eq!(feature.dims(), [1, 12]);

        let err = RetrievalFeatureBridge::<B>::load(dir.path(), 64, &device).unwrap_err();
        assert!(matches!(err, TrainError::ConfigMismatch(_)));
    }

    #[test]
    fn image_features_share_width_across_resolutions() {
        let device = Default::default();
        let config = tiny_config();
        let bridge = RetrievalFeatureBridge::<B>::from_parts(
            config.clone(),
            tiny_tokenizer(),
            config.init_text_encoder(&device),
            config.init_image_encoder(&device),
        )
        .unwrap();

        for size in [16, 32] {
            let images = Tensor::<B, 4>::zeros([2, 3, size, size], &device);
            assert_eq!(bridge.image_feature(images.clone()).dims(), [2, 12]);
            assert_eq!(bridge.image_feature_frozen(images).dims(), [2, 12]);
        }
    }
}

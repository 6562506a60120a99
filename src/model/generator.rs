use crate::init::{initializer_for, LayerRole};
use burn::nn::conv::{Conv2d, Conv2dConfig, ConvTranspose2d, ConvTranspose2dConfig};
use burn::nn::{BatchNorm, BatchNormConfig, Linear, LinearConfig, PaddingConfig2d};
use burn::prelude::*;
use burn::tensor::activation::relu;

/// Configuration for the multi-scale generator.
#[derive(Config, Debug)]
pub struct GeneratorConfig {
    /// Noise vector width.
    pub z_dim: usize,
    /// Width of the frozen text embedding fed to the conditioning branch.
    pub feature_dim: usize,
    /// Width of the variational conditioning code.
    pub condition_dim: usize,
    /// Base channel multiplier.
    pub generator_dim: usize,
    /// Number of resolution levels.
    pub levels: usize,
    /// Spatial resolution of the first level; level i is `base_size << i`.
    #[config(default = 64)]
    pub base_size: usize,
}

/// One generator forward pass: images ordered by strictly increasing
/// resolution, plus the variational parameters of the conditioning branch.
#[derive(Clone, Debug)]
pub struct GeneratorOutput<B: Backend> {
    pub images: Vec<Tensor<B, 4>>,
    pub mu: Tensor<B, 2>,
    pub logvar: Tensor<B, 2>,
}

/// Variational conditioning branch: projects the text embedding to a
/// (mean, log-variance) pair and reparameterizes it into a code.
#[derive(Module, Debug)]
pub struct ConditioningAugment<B: Backend> {
    fc: Linear<B>,
    #[module(ignore)]
    condition_dim: usize,
}

impl<B: Backend> ConditioningAugment<B> {
    /// Returns (code, mu, logvar). `eps` is the caller-supplied standard
    /// normal draw so every random stream stays on the training loop's RNG.
    pub fn forward(
        &self,
        txt_feature: Tensor<B, 2>,
        eps: Tensor<B, 2>,
    ) -> (Tensor<B, 2>, Tensor<B, 2>, Tensor<B, 2>) {
        let hidden = relu(self.fc.forward(txt_feature));
        let mu = hidden.clone().slice_dim(1, 0..self.condition_dim);
        let logvar = hidden.slice_dim(1, self.condition_dim..self.condition_dim * 2);
        let std = logvar.clone().mul_scalar(0.5).exp();
        let code = mu.clone().add(std.mul(eps));
        (code, mu, logvar)
    }
}

/// Generator producing one image per resolution level from a single forward
/// pass, conditioned on noise and the variational text code.
#[derive(Module, Debug)]
pub struct MultiScaleGenerator<B: Backend> {
    ca: ConditioningAugment<B>,
    fc: Linear<B>,
    ups: Vec<ConvTranspose2d<B>>,
    up_norms: Vec<BatchNorm<B>>,
    to_rgb: Vec<Conv2d<B>>,
    #[module(ignore)]
    initial_channels: usize,
    #[module(ignore)]
    base_upsamples: usize,
    #[module(ignore)]
    levels: usize,
}

impl GeneratorConfig {
    /// Initialize generator layers on the given device.
    pub fn init<B: Backend>(&self, device: &B::Device) -> MultiScaleGenerator<B> {
        assert!(self.levels >= 1, "at least one resolution level");
        assert!(
            self.base_size >= 8 && self.base_size.is_power_of_two(),
            "base_size must be a power of two >= 8"
        );

        let ca = ConditioningAugment {
            fc: LinearConfig::new(self.feature_dim, self.condition_dim * 2)
                .with_initializer(initializer_for(LayerRole::Linear))
                .init(device),
            condition_dim: self.condition_dim,
        };

        let initial_channels = self.generator_dim * 8;
        let fc = LinearConfig::new(
            self.z_dim + self.condition_dim,
            initial_channels * 4 * 4,
        )
        .with_initializer(initializer_for(LayerRole::Linear))
        .init(device);

        // Upsample 4x4 to base_size, then once more per additional level.
        let base_upsamples = (self.base_size / 4).trailing_zeros() as usize;
        let total_upsamples = base_upsamples + self.levels - 1;

        let mut ups = Vec::with_capacity(total_upsamples);
        let mut up_norms = Vec::with_capacity(total_upsamples);
        let mut to_rgb = Vec::with_capacity(self.levels);

        let mut channels = initial_channels;
        for step in 0..total_upsamples {
            let next = (channels / 2).max(self.generator_dim);
            ups.push(up_conv(channels, next, device));
            up_norms.push(BatchNormConfig::new(next).init(device));
            channels = next;

            if step + 1 >= base_upsamples {
                to_rgb.push(rgb_conv(channels, device));
            }
        }
        MultiScaleGenerator {
            ca,
            fc,
            ups,
            up_norms,
            to_rgb,
            initial_channels,
            base_upsamples,
            levels: self.levels,
        }
    }
}

impl<B: Backend> MultiScaleGenerator<B> {
    /// Joint forward pass over all levels.
    pub fn forward(
        &self,
        noise: Tensor<B, 2>,
        txt_feature: Tensor<B, 2>,
        eps: Tensor<B, 2>,
    ) -> GeneratorOutput<B> {
        let batch = noise.dims()[0];
        let (code, mu, logvar) = self.ca.forward(txt_feature, eps);

        let x = Tensor::cat(vec![noise, code], 1);
        let mut hidden = self
            .fc
            .forward(x)
            .reshape([batch, self.initial_channels, 4, 4]);

        let mut images = Vec::with_capacity(self.levels);
        for (step, (up, norm)) in self.ups.iter().zip(self.up_norms.iter()).enumerate() {
            hidden = relu(norm.forward(up.forward(hidden)));
            if step + 1 >= self.base_upsamples {
                let level = step + 1 - self.base_upsamples;
                images.push(self.to_rgb[level].forward(hidden.clone()).tanh());
            }
        }

        GeneratorOutput { images, mu, logvar }
    }
}

fn up_conv<B: Backend>(
    in_channels: usize,
    out_channels: usize,
    device: &B::Device,
) -> ConvTranspose2d<B> {
    ConvTranspose2dConfig::new([in_channels, out_channels], [4, 4])
        .with_stride([2, 2])
        .with_padding([1, 1])
        .with_bias(false)
        .with_initializer(initializer_for(LayerRole::Convolutional))
        .init(device)
}

fn rgb_conv<B: Backend>(in_channels: usize, device: &B::Device) -> Conv2d<B> {
    Conv2dConfig::new([in_channels, 3], [3, 3])
        .with_padding(PaddingConfig2d::Explicit(1, 1))
        .with_initializer(initializer_for(LayerRole::Convolutional))
        .init(device)
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::ndarray::NdArray;
    use burn::tensor::TensorData;

    type B = NdArray;

    #[test]
    fn levels_have_strictly_increasing_resolution() {
        let device = Default::default();
        let config = GeneratorConfig::new(16, 32, 8, 4, 3).with_base_size(16);
        let generator = config.init::<B>(&device);

        let noise = Tensor::zeros([2, 16], &device);
        let txt = Tensor::from_data(TensorData::new(vec![0.1f32; 2 * 32], [2, 32]), &device);
        let eps = Tensor::zeros([2, 8], &device);
        let out = generator.forward(noise, txt, eps);

        assert_eq!(out.images.len(), 3);
        for (level, image) in out.images.iter().enumerate() {
            assert_eq!(image.dims(), [2, 3, 16 << level, 16 << level]);
        }
        assert_eq!(out.mu.dims(), [2, 8]);
        assert_eq!(out.logvar.dims(), [2, 8]);
    }
}

use crate::init::{initializer_for, LayerRole};
use burn::nn::conv::{Conv2d, Conv2dConfig};
use burn::nn::{BatchNorm, BatchNormConfig, PaddingConfig2d};
use burn::prelude::*;
use burn::tensor::activation::leaky_relu;

/// Configuration for one resolution level's discriminator.
#[derive(Config, Debug)]
pub struct DiscriminatorConfig {
    /// Base channel multiplier.
    pub discriminator_dim: usize,
    /// Width of the conditioning code (the generator's variational mean).
    pub condition_dim: usize,
    /// Input spatial resolution for this level.
    pub resolution: usize,
    /// Whether this level also judges realism without text conditioning.
    #[config(default = true)]
    pub unconditional_head: bool,
}

/// Raw logits from one discriminator evaluation.
#[derive(Clone, Debug)]
pub struct DiscriminatorOutput<B: Backend> {
    pub cond: Tensor<B, 1>,
    pub uncond: Option<Tensor<B, 1>>,
}

/// Discriminator for a single resolution level with a conditional head and
/// an optional unconditional head. Outputs are logits; BCE is applied in
/// logit space by the loss composer.
#[derive(Module, Debug)]
pub struct LevelDiscriminator<B: Backend> {
    downs: Vec<Conv2d<B>>,
    down_norms: Vec<BatchNorm<B>>,
    joint: Conv2d<B>,
    joint_norm: BatchNorm<B>,
    cond_head: Conv2d<B>,
    uncond_head: Option<Conv2d<B>>,
    #[module(ignore)]
    condition_dim: usize,
}

impl DiscriminatorConfig {
    /// Initialize the discriminator layers on the given device.
    pub fn init<B: Backend>(&self, device: &B::Device) -> LevelDiscriminator<B> {
        assert!(
            self.resolution >= 8 && self.resolution.is_power_of_two(),
            "resolution must be a power of two >= 8"
        );

        // Strided convs from `resolution` down to 4x4 features.
        let n_down = (self.resolution / 4).trailing_zeros() as usize;
        let mut downs = Vec::with_capacity(n_down);
        let mut down_norms = Vec::with_capacity(n_down.saturating_sub(1));

        let mut channels = 3;
        for step in 0..n_down {
            let next = (self.discriminator_dim << step).min(self.discriminator_dim * 8);
            downs.push(down_conv(channels, next, step == 0, device));
            if step > 0 {
                down_norms.push(BatchNormConfig::new(next).init(device));
            }
            channels = next;
        }

        let joint = Conv2dConfig::new([channels + self.condition_dim, channels], [3, 3])
            .with_padding(PaddingConfig2d::Explicit(1, 1))
            .with_bias(false)
            .with_initializer(initializer_for(LayerRole::Convolutional))
            .init(device);
        let joint_norm = BatchNormConfig::new(channels).init(device);

        let cond_head = logit_conv(channels, device);
        let uncond_head = self.unconditional_head.then(|| logit_conv(channels, device));

        LevelDiscriminator {
            downs,
            down_norms,
            joint,
            joint_norm,
            cond_head,
            uncond_head,
            condition_dim: self.condition_dim,
        }
    }
}

impl<B: Backend> LevelDiscriminator<B> {
    /// Evaluate a batch of images against a conditioning code.
    pub fn forward(&self, images: Tensor<B, 4>, condition: Tensor<B, 2>) -> DiscriminatorOutput<B> {
        let mut x = leaky_relu(self.downs[0].forward(images), 0.2);
        for (conv, norm) in self.downs[1..].iter().zip(self.down_norms.iter()) {
            x = leaky_relu(norm.forward(conv.forward(x)), 0.2);
        }

        let [batch, _, height, width] = x.dims();
        let spatial_code = condition
            .reshape([batch, self.condition_dim, 1, 1])
            .repeat(&[1, 1, height, width]);
        let joint = Tensor::cat(vec![x.clone(), spatial_code], 1);
        let joint = leaky_relu(self.joint_norm.forward(self.joint.forward(joint)), 0.2);

        let cond = self.cond_head.forward(joint).reshape([batch]);
        let uncond = self
            .uncond_head
            .as_ref()
            .map(|head| head.forward(x).reshape([batch]));

        DiscriminatorOutput { cond, uncond }
    }
}

fn down_conv<B: Backend>(
    in_channels: usize,
    out_channels: usize,
    bias: bool,
    device: &B::Device,
) -> Conv2d<B> {
    Conv2dConfig::new([in_channels, out_channels], [4, 4])
        .with_stride([2, 2])
        .with_padding(PaddingConfig2d::Explicit(1, 1))
        .with_bias(bias)
        .with_initializer(initializer_for(LayerRole::Convolutional))
        .init(device)
}

fn logit_conv<B: Backend>(in_channels: usize, device: &B::Device) -> Conv2d<B> {
    Conv2dConfig::new([in_channels, 1], [4, 4])
        .with_stride([4, 4])
        .with_initializer(initializer_for(LayerRole::Convolutional))
        .init(device)
}

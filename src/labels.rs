use burn::prelude::*;
use burn::tensor::TensorData;
use rand::Rng;
use serde::{Deserialize, Serialize};

/// Real/fake target policy applied when sampling adversarial labels.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LabelPolicy {
    /// real = 1.0, fake = 0.0.
    Original,
    /// One-sided smoothing: real in (0.9, 1.0], fake in [0.0, 0.1).
    Smooth,
    /// Hard labels flipped with probability 0.1.
    Flip,
    /// Smoothed labels flipped via an absolute-difference perturbation.
    FlipSmooth,
}

/// Per-batch real/fake label tensors under the given policy.
///
/// Pure function of (batch size, policy, rng); labels are redrawn every step
/// and never persisted.
pub fn sample_labels<B: Backend>(
    batch_size: usize,
    policy: LabelPolicy,
    rng: &mut impl Rng,
    device: &B::Device,
) -> (Tensor<B, 1>, Tensor<B, 1>) {
    let mut real = Vec::with_capacity(batch_size);
    let mut fake = Vec::with_capacity(batch_size);

    for _ in 0..batch_size {
        match policy {
            LabelPolicy::Original => {
                real.push(1.0f32);
                fake.push(0.0f32);
            }
            LabelPolicy::Smooth => {
                real.push(1.0 - rng.gen::<f32>() * 0.1);
                fake.push(rng.gen::<f32>() * 0.1);
            }
            LabelPolicy::Flip => {
                real.push(if rng.gen::<f32>() < 0.9 { 1.0 } else { 0.0 });
                fake.push(if rng.gen::<f32>() > 0.9 { 1.0 } else { 0.0 });
            }
            LabelPolicy::FlipSmooth => {
                let real_mask = if rng.gen::<f32>() > 0.9 { 1.0 } else { 0.0 };
                let smoothed_real = 1.0 - rng.gen::<f32>() * 0.1;
                real.push((real_mask - smoothed_real).abs());
                let fake_mask = if rng.gen::<f32>() > 0.9 { 1.0 } else { 0.0 };
                let smoothed_fake = rng.gen::<f32>() * 0.1;
                fake.push((fake_mask - smoothed_fake).abs());
            }
        }
    }

    (
        Tensor::from_data(TensorData::new(real, [batch_size]), device),
        Tensor::from_data(TensorData::new(fake, [batch_size]), device),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::ndarray::NdArray;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    type B = NdArray;

    fn values(tensor: Tensor<B, 1>) -> Vec<f32> {
        tensor.to_data().to_vec().unwrap()
    }

    #[test]
    fn all_policies_yield_batch_sized_labels_in_unit_interval() {
        let device = Default::default();
        let mut rng = StdRng::seed_from_u64(42);
        for policy in [
            LabelPolicy::Original,
            LabelPolicy::Smooth,
            LabelPolicy::Flip,
            LabelPolicy::FlipSmooth,
        ] {
            let (real, fake) = sample_labels::<B>(7, policy, &mut rng, &device);
            let real = values(real);
            let fake = values(fake);
            assert_eq!(real.len(), 7);
            assert_eq!(fake.len(), 7);
            for v in real.iter().chain(fake.iter()) {
                assert!((0.0..=1.0).contains(v), "{policy:?} produced {v}");
            }
        }
    }

    #[test]
    fn original_policy_is_constant() {
        let device = Default::default();
        let mut rng = StdRng::seed_from_u64(0);
        let (real, fake) = sample_labels::<B>(4, LabelPolicy::Original, &mut rng, &device);
        assert_eq!(values(real), vec![1.0; 4]);
        assert_eq!(values(fake), vec![0.0; 4]);
    }

    #[test]
    fn flip_policy_is_hard() {
        let device = Default::default();
        let mut rng = StdRng::seed_from_u64(7);
        let (real, fake) = sample_labels::<B>(64, LabelPolicy::Flip, &mut rng, &device);
        for v in values(real).into_iter().chain(values(fake)) {
            assert!(v == 0.0 || v == 1.0);
        }
    }
}

// Every random draw goes through an explicitly seeded `StdRng` that the caller
// owns, so CEM sampling, bootstrap permutations and particle noise replay
// exactly under the same seed.

use candle_core::{Device, Result, Shape, Tensor};
use rand::{Rng, SeedableRng, rngs::StdRng, seq::SliceRandom};
use rand_distr::StandardNormal;

pub fn seeded(seed: u64) -> StdRng {
    StdRng::seed_from_u64(seed)
}

pub fn randn<S: Into<Shape>>(rng: &mut StdRng, shape: S, device: &Device) -> Result<Tensor> {
    let shape = shape.into();
    let data: Vec<f32> = (0..shape.elem_count())
        .map(|_| rng.sample::<f32, _>(StandardNormal))
        .collect();
    Tensor::from_vec(data, shape, device)
}

/// Uniform samples in `[0, 1)` of any shape.
pub fn uniform<S: Into<Shape>>(rng: &mut StdRng, shape: S, device: &Device) -> Result<Tensor> {
    let shape = shape.into();
    let data: Vec<f32> = (0..shape.elem_count()).map(|_| rng.random::<f32>()).collect();
    Tensor::from_vec(data, shape, device)
}

/// Uniform samples in `[low, high]` element-wise along the last dimension.
pub fn uniform_in(rng: &mut StdRng, low: &[f32], high: &[f32], device: &Device) -> Result<Tensor> {
    let data: Vec<f32> = low
        .iter()
        .zip(high.iter())
        .map(|(l, h)| if l < h { rng.random_range(*l..=*h) } else { *l })
        .collect();
    Tensor::from_vec(data, low.len(), device)
}

pub fn randperm(rng: &mut StdRng, n: usize) -> Vec<u32> {
    let mut perm: Vec<u32> = (0..n as u32).collect();
    perm.shuffle(rng);
    perm
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn same_seed_same_draws() -> Result<()> {
        let a = randn(&mut seeded(3), (4, 2), &Device::Cpu)?;
        let b = randn(&mut seeded(3), (4, 2), &Device::Cpu)?;
        assert_eq!(a.to_vec2::<f32>()?, b.to_vec2::<f32>()?);
        Ok(())
    }

    #[test]
    fn unit_uniform_stays_in_range() -> Result<()> {
        let xs: Vec<f32> = uniform(&mut seeded(4), 1000, &Device::Cpu)?.to_vec1()?;
        assert!(xs.iter().all(|x| (0. ..1.).contains(x)));
        let mean = xs.iter().sum::<f32>() / xs.len() as f32;
        assert!((mean - 0.5).abs() < 0.05, "mean {mean}");
        Ok(())
    }

    #[test]
    fn randperm_is_a_permutation() {
        let mut perm = randperm(&mut seeded(1), 50);
        perm.sort();
        assert_eq!(perm, (0..50).collect::<Vec<u32>>());
    }

    #[test]
    fn uniform_respects_bounds() -> Result<()> {
        let mut rng = seeded(9);
        for _ in 0..100 {
            let sample: Vec<f32> =
                uniform_in(&mut rng, &[-1., 0.], &[1., 0.5], &Device::Cpu)?.to_vec1()?;
            assert!((-1. ..=1.).contains(&sample[0]));
            assert!((0. ..=0.5).contains(&sample[1]));
        }
        Ok(())
    }
}

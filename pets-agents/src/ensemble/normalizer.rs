use candle_core::{Device, Tensor};
use pets_core::{PetsError, Result};

const MIN_STD: f64 = 1e-12;

/// Per feature mean and standard deviation of the model inputs.
#[derive(Debug, Clone)]
pub struct NormalizationStats {
    pub mean: Tensor,
    pub std: Tensor,
}

impl NormalizationStats {
    /// Statistics over all rows of `inputs` `(rows, features)`. Accumulates in
    /// f64 on the host, so the result does not depend on row order beyond
    /// rounding.
    pub fn fit(inputs: &Tensor, device: &Device) -> Result<Self> {
        let rows: Vec<Vec<f32>> = inputs.to_device(&Device::Cpu)?.to_vec2()?;
        let Some(first) = rows.first() else {
            return Err(PetsError::empty_batch("cannot fit input stats on no rows"));
        };
        let features = first.len();
        let count = rows.len() as f64;
        let mut mean = vec![0f64; features];
        for row in rows.iter() {
            for (m, x) in mean.iter_mut().zip(row.iter()) {
                *m += *x as f64;
            }
        }
        mean.iter_mut().for_each(|m| *m /= count);
        let mut var = vec![0f64; features];
        for row in rows.iter() {
            for ((v, m), x) in var.iter_mut().zip(mean.iter()).zip(row.iter()) {
                *v += (*x as f64 - m).powi(2);
            }
        }
        let std: Vec<f32> = var
            .iter()
            .map(|v| (v / count).sqrt())
            .map(|s| if s < MIN_STD { 1. } else { s as f32 })
            .collect();
        let mean: Vec<f32> = mean.into_iter().map(|m| m as f32).collect();
        Ok(Self {
            mean: Tensor::from_vec(mean, (1, features), device)?,
            std: Tensor::from_vec(std, (1, features), device)?,
        })
    }

    pub fn features(&self) -> usize {
        self.mean.dims()[1]
    }

    pub fn normalize(&self, xs: &Tensor) -> Result<Tensor> {
        Ok(xs.broadcast_sub(&self.mean)?.broadcast_div(&self.std)?)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use pets_core::rng;

    #[test]
    fn constant_feature_gets_unit_std() -> Result<()> {
        let xs = Tensor::new(&[[1f32, 2.], [1., 4.]], &Device::Cpu)?;
        let stats = NormalizationStats::fit(&xs, &Device::Cpu)?;
        assert_eq!(stats.mean.to_vec2::<f32>()?, vec![vec![1., 3.]]);
        assert_eq!(stats.std.to_vec2::<f32>()?, vec![vec![1., 1.]]);
        let normalized = stats.normalize(&xs)?.to_vec2::<f32>()?;
        assert_eq!(normalized, vec![vec![0., -1.], vec![0., 1.]]);
        Ok(())
    }

    #[test]
    fn independent_of_row_order() -> Result<()> {
        let device = Device::Cpu;
        let mut rng = rng::seeded(4);
        let a = (rng::randn(&mut rng, (64, 3), &device)? * 3.)?;
        let b = (rng::randn(&mut rng, (32, 3), &device)? + 5.)?;
        let ab = Tensor::cat(&[&a, &b], 0)?;
        let ba = Tensor::cat(&[&b, &a], 0)?;
        let perm = Tensor::new(rng::randperm(&mut rng, 96).as_slice(), &device)?;
        let shuffled = ab.index_select(&perm, 0)?;
        let reference = NormalizationStats::fit(&ab, &device)?;
        for other in [&ba, &shuffled] {
            let stats = NormalizationStats::fit(other, &device)?;
            let mean_diff = (&stats.mean - &reference.mean)?.abs()?.max_all()?;
            let std_diff = (&stats.std - &reference.std)?.abs()?.max_all()?;
            assert!(mean_diff.to_scalar::<f32>()? < 1e-5);
            assert!(std_diff.to_scalar::<f32>()? < 1e-5);
        }
        Ok(())
    }

    #[test]
    fn empty_input_is_rejected() -> Result<()> {
        let xs = Tensor::zeros((0, 3), candle_core::DType::F32, &Device::Cpu)?;
        assert!(matches!(
            NormalizationStats::fit(&xs, &Device::Cpu),
            Err(PetsError::EmptyBatch(_))
        ));
        Ok(())
    }
}

use candle_core::{DType, Device, Tensor};
use pets_core::{
    PetsError, Result,
    env::ActionBounds,
    metrics::{MetricMap, Metrics},
    rng,
    tensors::Plans,
};
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CemConfig {
    pub iterations: usize,
    pub popsize: usize,
    pub num_elites: usize,
}

impl Default for CemConfig {
    fn default() -> Self {
        Self {
            iterations: 5,
            popsize: 1000,
            num_elites: 50,
        }
    }
}

impl CemConfig {
    pub fn validate(&self) -> Result<()> {
        if self.iterations == 0 || self.popsize == 0 {
            return Err(PetsError::invalid_config(
                "cem needs at least one iteration and one candidate",
            ));
        }
        if self.num_elites == 0 {
            return Err(PetsError::invalid_config("cem needs at least one elite"));
        }
        if self.num_elites > self.popsize {
            return Err(PetsError::invalid_config(format!(
                "num_elites ({}) exceeds popsize ({})",
                self.num_elites, self.popsize
            )));
        }
        Ok(())
    }
}

/// Cross entropy method over flattened `horizon * act_features` action
/// sequences, one independent Gaussian belief per starting observation.
pub struct CemOptimizer {
    config: CemConfig,
    horizon: usize,
    bounds: ActionBounds,
    low: Tensor,
    high: Tensor,
    rng: StdRng,
    device: Device,
}

impl CemOptimizer {
    pub fn new(
        bounds: ActionBounds,
        horizon: usize,
        config: CemConfig,
        seed: u64,
        device: &Device,
    ) -> Result<Self> {
        config.validate()?;
        if horizon == 0 {
            return Err(PetsError::invalid_config("planning horizon must be positive"));
        }
        let tile = |v: &[f32]| -> Result<Tensor> {
            let data: Vec<f32> = v.iter().copied().cycle().take(v.len() * horizon).collect();
            Ok(Tensor::from_vec(data, (1, 1, v.len() * horizon), device)?)
        };
        Ok(Self {
            low: tile(&bounds.low)?,
            high: tile(&bounds.high)?,
            config,
            horizon,
            bounds,
            rng: rng::seeded(seed),
            device: device.clone(),
        })
    }

    pub fn solution_dim(&self) -> usize {
        self.horizon * self.bounds.dim()
    }

    /// Refines the belief for every row of `observations` and returns the
    /// first action of each final belief mean, `(num_obs, act_features)`.
    ///
    /// `score_fn` receives `(num_obs, popsize, solution_dim)` candidates and
    /// must return a `(num_obs, popsize)` score matrix, higher is better.
    pub fn obtain_solution<F>(
        &mut self,
        observations: &Tensor,
        mut score_fn: F,
        mut stats: Option<&mut Metrics>,
    ) -> Result<Tensor>
    where
        F: FnMut(&Plans, &Tensor, Option<&mut Metrics>) -> Result<Tensor>,
    {
        let num_obs = observations.dim(0)?;
        if num_obs == 0 {
            return Err(PetsError::empty_batch("no starting observations to plan for"));
        }
        let CemConfig {
            iterations,
            popsize,
            num_elites,
        } = self.config;
        let dim = self.solution_dim();
        let mut mean = Tensor::zeros((num_obs, 1, dim), DType::F32, &self.device)?;
        let mut std = Tensor::full(self.bounds.magnitude(), (num_obs, 1, dim), &self.device)?;

        for iteration in 0..iterations {
            let noise = rng::randn(&mut self.rng, (num_obs, popsize, dim), &self.device)?;
            let plans = noise
                .broadcast_mul(&std)?
                .broadcast_add(&mean)?
                .broadcast_maximum(&self.low)?
                .broadcast_minimum(&self.high)?;
            let scores = score_fn(&Plans(plans.clone()), observations, stats.as_deref_mut())?;
            if scores.dims() != [num_obs, popsize] {
                return Err(PetsError::ShapeMismatch {
                    expected: vec![num_obs, popsize],
                    actual: scores.dims().to_vec(),
                });
            }
            let (elite_idxs, elite_scores) = elites(&scores, num_elites)?;
            let elite_idxs = Tensor::from_vec(elite_idxs, (num_obs, num_elites, 1), &self.device)?
                .broadcast_as((num_obs, num_elites, dim))?
                .contiguous()?;
            let elites = plans.gather(&elite_idxs, 1)?;
            mean = elites.mean_keepdim(1)?;
            std = elites
                .broadcast_sub(&mean)?
                .sqr()?
                .mean_keepdim(1)?
                .sqrt()?;

            if let Some(stats) = stats.as_deref_mut() {
                let belief_std = std.mean_all()?.to_scalar::<f32>()?;
                let elite_mean = elite_scores.iter().sum::<f32>() / elite_scores.len() as f32;
                stats.store(MetricMap::from([
                    ("cem/elite_score_mean".to_string(), elite_mean),
                    ("cem/belief_std_mean".to_string(), belief_std),
                ]));
            }
            tracing::trace!(iteration, "cem iteration done");
        }
        Ok(mean.squeeze(1)?.narrow(1, 0, self.bounds.dim())?)
    }
}

/// Indices and scores of the `k` best candidates per row. Sorting is stable
/// and NaN scores rank lowest.
fn elites(scores: &Tensor, k: usize) -> Result<(Vec<u32>, Vec<f32>)> {
    let scores: Vec<Vec<f32>> = scores.to_device(&Device::Cpu)?.to_vec2()?;
    let key = |s: f32| if s.is_nan() { f32::NEG_INFINITY } else { s };
    let mut idxs = Vec::with_capacity(scores.len() * k);
    let mut elite_scores = Vec::with_capacity(scores.len() * k);
    for row in scores.iter() {
        let mut order: Vec<usize> = (0..row.len()).collect();
        order.sort_by(|a, b| {
            key(row[*a])
                .partial_cmp(&key(row[*b]))
                .unwrap_or(Ordering::Equal)
        });
        for idx in &order[row.len() - k..] {
            idxs.push(*idx as u32);
            elite_scores.push(row[*idx]);
        }
    }
    Ok((idxs, elite_scores))
}

#[cfg(test)]
mod test {
    use super::*;
    use pets_core::env::Space;

    fn optimizer(config: CemConfig, horizon: usize, seed: u64) -> Result<CemOptimizer> {
        let bounds = Space::symmetric_box(1., 2).bounds()?;
        CemOptimizer::new(bounds, horizon, config, seed, &Device::Cpu)
    }

    fn sum_score(plans: &Plans, _: &Tensor, _: Option<&mut Metrics>) -> Result<Tensor> {
        Ok(plans.sum(2)?)
    }

    #[test]
    fn rejects_invalid_elite_counts() {
        for (popsize, num_elites) in [(10, 11), (10, 0), (0, 0)] {
            let config = CemConfig {
                iterations: 3,
                popsize,
                num_elites,
            };
            assert!(matches!(
                optimizer(config, 4, 0),
                Err(PetsError::InvalidConfig(_))
            ));
        }
        let config = CemConfig {
            iterations: 3,
            popsize: 10,
            num_elites: 10,
        };
        assert!(optimizer(config.clone(), 4, 0).is_ok());
        assert!(optimizer(config, 0, 0).is_err());
    }

    #[test]
    fn converges_to_upper_bound_for_monotone_score() -> Result<()> {
        let config = CemConfig {
            iterations: 30,
            popsize: 200,
            num_elites: 20,
        };
        let mut cem = optimizer(config, 2, 7)?;
        let observations = Tensor::zeros((3, 5), DType::F32, &Device::Cpu)?;
        let actions = cem.obtain_solution(&observations, sum_score, None)?;
        assert_eq!(actions.dims(), &[3, 2]);
        for action in actions.flatten_all()?.to_vec1::<f32>()? {
            assert!(action <= 1. && action > 0.95, "action {action}");
        }
        Ok(())
    }

    #[test]
    fn same_seed_same_solution() -> Result<()> {
        let observations = Tensor::zeros((2, 1), DType::F32, &Device::Cpu)?;
        let score = |plans: &Plans, _: &Tensor, _: Option<&mut Metrics>| -> Result<Tensor> {
            // peak at 0.3 for every element
            Ok(((&**plans - 0.3)?.sqr()?.neg()?).sum(2)?)
        };
        let a = optimizer(CemConfig::default(), 3, 11)?.obtain_solution(&observations, score, None)?;
        let b = optimizer(CemConfig::default(), 3, 11)?.obtain_solution(&observations, score, None)?;
        assert_eq!(a.to_vec2::<f32>()?, b.to_vec2::<f32>()?);
        for action in a.flatten_all()?.to_vec1::<f32>()? {
            assert!((action - 0.3).abs() < 0.1, "action {action}");
        }
        Ok(())
    }

    #[test]
    fn records_belief_statistics() -> Result<()> {
        let config = CemConfig {
            iterations: 2,
            popsize: 20,
            num_elites: 5,
        };
        let mut cem = optimizer(config, 2, 0)?;
        let observations = Tensor::zeros((1, 1), DType::F32, &Device::Cpu)?;
        let mut stats = Metrics::new();
        let mut calls = 0;
        cem.obtain_solution(
            &observations,
            |plans, obs, sink| {
                calls += 1;
                assert!(sink.is_some());
                sum_score(plans, obs, None)
            },
            Some(&mut stats),
        )?;
        assert_eq!(calls, 2);
        let stats = stats.average();
        assert!(stats.contains_key("cem/elite_score_mean"));
        assert!(stats["cem/belief_std_mean"] >= 0.);
        Ok(())
    }

    #[test]
    fn rejects_badly_shaped_scores_and_empty_batches() -> Result<()> {
        let mut cem = optimizer(CemConfig::default(), 2, 0)?;
        let observations = Tensor::zeros((2, 1), DType::F32, &Device::Cpu)?;
        let res = cem.obtain_solution(
            &observations,
            |plans, _, _| Ok(plans.sum(2)?.sum(0)?),
            None,
        );
        assert!(matches!(res, Err(PetsError::ShapeMismatch { .. })));
        let empty = Tensor::zeros((0, 1), DType::F32, &Device::Cpu)?;
        let res = cem.obtain_solution(&empty, sum_score, None);
        assert!(matches!(res, Err(PetsError::EmptyBatch(_))));
        Ok(())
    }

    #[test]
    fn nan_scores_are_never_elite() -> Result<()> {
        let scores = Tensor::new(&[[1f32, f32::NAN, 3., 2.]], &Device::Cpu)?;
        let (idxs, values) = elites(&scores, 2)?;
        assert_eq!(idxs, vec![3, 2]);
        assert_eq!(values, vec![2., 3.]);
        Ok(())
    }
}

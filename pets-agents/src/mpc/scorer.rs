use candle_core::{D, Device, Tensor};
use pets_core::{
    PetsError, Result,
    metrics::{MetricMap, Metrics, log_statistics},
    model::DynamicsModel,
    task::TaskHooks,
    tensors::Plans,
};
use rand::rngs::StdRng;

/// Assignment of particles to ensemble members.
///
/// A flat batch holds groups of `num_particles` consecutive rows. Inside every
/// group, particle `p` is propagated by member `p / (num_particles / ensemble_size)`.
/// `to_members` gathers the rows of each member into one contiguous slice,
/// `from_members` puts them back where they came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParticlePartition {
    ensemble_size: usize,
    num_particles: usize,
}

impl ParticlePartition {
    pub fn new(ensemble_size: usize, num_particles: usize) -> Result<Self> {
        if ensemble_size == 0 || num_particles == 0 {
            return Err(PetsError::invalid_config(
                "ensemble size and particle count must be positive",
            ));
        }
        if num_particles % ensemble_size != 0 {
            return Err(PetsError::invalid_config(format!(
                "num_particles ({num_particles}) is not a multiple of ensemble_size ({ensemble_size})"
            )));
        }
        Ok(Self {
            ensemble_size,
            num_particles,
        })
    }

    /// Particles per member inside one group.
    pub fn share(&self) -> usize {
        self.num_particles / self.ensemble_size
    }

    fn groups(&self, rows: usize) -> Result<usize> {
        if rows == 0 || rows % self.num_particles != 0 {
            return Err(PetsError::ShapeMismatch {
                expected: vec![self.num_particles],
                actual: vec![rows],
            });
        }
        Ok(rows / self.num_particles)
    }

    /// Flat row feeding position `i` of the member-major layout.
    fn source_rows(&self, groups: usize) -> Vec<u32> {
        let share = self.share();
        let mut rows = Vec::with_capacity(groups * self.num_particles);
        for member in 0..self.ensemble_size {
            for group in 0..groups {
                for j in 0..share {
                    rows.push((group * self.num_particles + member * share + j) as u32);
                }
            }
        }
        rows
    }

    /// Member-major position of flat row `r`.
    fn target_rows(&self, groups: usize) -> Vec<u32> {
        let share = self.share();
        (0..groups * self.num_particles)
            .map(|row| {
                let (group, particle) = (row / self.num_particles, row % self.num_particles);
                let (member, j) = (particle / share, particle % share);
                (member * groups * share + group * share + j) as u32
            })
            .collect()
    }

    /// `(groups * num_particles, F)` to `(ensemble_size, groups * share, F)`.
    pub fn to_members(&self, xs: &Tensor) -> Result<Tensor> {
        let (rows, features) = xs.dims2()?;
        let groups = self.groups(rows)?;
        let idxs = Tensor::from_vec(self.source_rows(groups), rows, xs.device())?;
        // index_select needs a contiguous source
        Ok(xs
            .contiguous()?
            .index_select(&idxs, 0)?
            .reshape((self.ensemble_size, rows / self.ensemble_size, features))?)
    }

    /// Inverse of [`Self::to_members`].
    pub fn from_members(&self, xs: &Tensor) -> Result<Tensor> {
        let (members, per_member, features) = xs.dims3()?;
        if members != self.ensemble_size {
            return Err(PetsError::ShapeMismatch {
                expected: vec![self.ensemble_size, per_member, features],
                actual: xs.dims().to_vec(),
            });
        }
        let rows = members * per_member;
        let groups = self.groups(rows)?;
        let idxs = Tensor::from_vec(self.target_rows(groups), rows, xs.device())?;
        Ok(xs.reshape((rows, features))?.index_select(&idxs, 0)?)
    }
}

/// Everything a rollout needs besides the controller's mutable state.
pub struct Rollout<'a, M, T> {
    pub model: &'a M,
    pub hooks: &'a T,
    pub rng: &'a mut StdRng,
}

impl<M: DynamicsModel, T: TaskHooks> Rollout<'_, M, T> {
    /// Next observations with every particle group split across the members.
    pub fn predict_divide(
        &mut self,
        partition: &ParticlePartition,
        obs: &Tensor,
        acts: &Tensor,
    ) -> Result<Tensor> {
        let features = self.hooks.obs_preproc(obs)?;
        let input = Tensor::cat(&[&features, acts], 1)?;
        let preds = self.model.sample(&partition.to_members(&input)?, self.rng)?;
        let preds = partition.from_members(&preds)?;
        self.hooks.pred_postproc(obs, &preds)
    }

    /// Next observations from the mean of all members' samples.
    pub fn predict_average(&mut self, obs: &Tensor, acts: &Tensor) -> Result<Tensor> {
        let features = self.hooks.obs_preproc(obs)?;
        let input = Tensor::cat(&[&features, acts], 1)?;
        let (rows, in_features) = input.dims2()?;
        let stacked = input
            .unsqueeze(0)?
            .broadcast_as((self.model.ensemble_size(), rows, in_features))?
            .contiguous()?;
        let preds = self.model.sample(&stacked, self.rng)?.mean(0)?;
        self.hooks.pred_postproc(obs, &preds)
    }
}

/// Scores candidate plans by their particle averaged return under the model.
#[derive(Debug, Clone)]
pub struct TrajectoryScorer {
    partition: ParticlePartition,
    plan_hor: usize,
    act_features: usize,
    max_batch_size: usize,
}

impl TrajectoryScorer {
    pub fn new(
        partition: ParticlePartition,
        plan_hor: usize,
        act_features: usize,
        max_batch_size: usize,
    ) -> Result<Self> {
        if plan_hor == 0 || act_features == 0 {
            return Err(PetsError::invalid_config(
                "planning horizon and action features must be positive",
            ));
        }
        if max_batch_size == 0 || max_batch_size % partition.num_particles != 0 {
            return Err(PetsError::invalid_config(format!(
                "max_batch_size ({max_batch_size}) must be a positive multiple of num_particles ({})",
                partition.num_particles
            )));
        }
        Ok(Self {
            partition,
            plan_hor,
            act_features,
            max_batch_size,
        })
    }

    pub fn partition(&self) -> &ParticlePartition {
        &self.partition
    }

    /// Expected return of every plan, `(num_obs, num_plans)`.
    ///
    /// Flat row `r` is particle `r % P` of plan `(r / P) % num_plans` started
    /// from observation `r / (num_plans * P)`. Rows are rolled out in chunks of
    /// at most `max_batch_size`.
    pub fn score<M: DynamicsModel, T: TaskHooks>(
        &self,
        rollout: &mut Rollout<'_, M, T>,
        plans: &Plans,
        observations: &Tensor,
        mut particle_info: Option<&mut Metrics>,
    ) -> Result<Tensor> {
        let (num_obs, num_plans, solution_dim) = plans.dims3()?;
        let (obs_rows, obs_features) = observations.dims2()?;
        if obs_rows != num_obs || solution_dim != self.plan_hor * self.act_features {
            return Err(PetsError::ShapeMismatch {
                expected: vec![obs_rows, num_plans, self.plan_hor * self.act_features],
                actual: plans.dims().to_vec(),
            });
        }
        let num_part = self.partition.num_particles;
        let total = num_obs * num_plans * num_part;
        if total == 0 {
            return Err(PetsError::empty_batch("no plans to score"));
        }
        let device = rollout.model.device().clone();
        let flat_plans = plans.reshape((num_obs * num_plans, solution_dim))?;
        let observations = observations.to_device(&device)?;

        let mut chunk_scores = Vec::with_capacity(total.div_ceil(self.max_batch_size));
        for start in (0..total).step_by(self.max_batch_size) {
            let end = (start + self.max_batch_size).min(total);
            let rows = end - start;
            let plan_idxs: Vec<u32> = (start..end).map(|r| (r / num_part) as u32).collect();
            let obs_idxs: Vec<u32> = (start..end)
                .map(|r| (r / (num_plans * num_part)) as u32)
                .collect();
            let chunk_plans = flat_plans
                .index_select(&Tensor::from_vec(plan_idxs, rows, &device)?, 0)?
                .reshape((rows, self.plan_hor, self.act_features))?;
            let mut obs =
                observations.index_select(&Tensor::from_vec(obs_idxs, rows, &device)?, 0)?;
            let mut alive = Tensor::ones(rows, obs.dtype(), &device)?;
            let mut scores = Tensor::zeros(rows, obs.dtype(), &device)?;

            for t in 0..self.plan_hor {
                let acts = chunk_plans.narrow(1, t, 1)?.squeeze(1)?;
                let next_obs = rollout.predict_divide(&self.partition, &obs, &acts)?;

                if let Some(info) = particle_info.as_deref_mut() {
                    let spread = sample_std(
                        &next_obs.reshape((rows / num_part, num_part, obs_features))?,
                        1,
                    )?;
                    let mut metrics = MetricMap::new();
                    log_statistics(&mut metrics, &spread, "particle/obs_std")?;
                    info.store(metrics);
                }

                let (rewards, dones) = rollout.hooks.get_reward(&obs, &acts, &next_obs)?;
                alive = alive.minimum(&dones.affine(-1., 1.)?)?;
                scores = (scores + alive.mul(&rewards)?)?;
                obs = next_obs;
                if alive.sum_all()?.to_scalar::<f32>()? == 0. {
                    tracing::trace!(step = t, start, "all particles terminated");
                    break;
                }
            }
            chunk_scores.push(scores);
        }

        let scores = Tensor::cat(&chunk_scores, 0)?.reshape((num_obs, num_plans, num_part))?;
        if let Some(info) = particle_info {
            let mut metrics = MetricMap::new();
            let host = scores.to_device(&Device::Cpu)?;
            log_statistics(&mut metrics, &host.mean(D::Minus1)?, "particle/score_mean")?;
            log_statistics(
                &mut metrics,
                &sample_std(&host, 2)?,
                "particle/score_std",
            )?;
            info.store(metrics);
        }
        Ok(scores.mean(D::Minus1)?)
    }
}

/// Unbiased standard deviation along `dim`, zero when `dim` has a single entry.
fn sample_std(xs: &Tensor, dim: usize) -> Result<Tensor> {
    let n = xs.dim(dim)?;
    let mean = xs.mean_keepdim(dim)?;
    let sq = xs.broadcast_sub(&mean)?.sqr()?.sum(dim)?;
    Ok((sq / n.saturating_sub(1).max(1) as f64)?.sqrt()?)
}

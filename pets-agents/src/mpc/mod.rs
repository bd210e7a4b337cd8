pub mod dataset;
pub mod scorer;

use crate::cem::{CemConfig, CemOptimizer};
use candle_core::Tensor;
use dataset::{TransitionDataset, bootstrap_permutations, minibatch, permute_columns};
use pets_core::{
    Controller, PetsError, Result,
    early_stopping::{EarlyStopping, StoppingDecision},
    env::{ActionBounds, EnvironmentDescription},
    logger::Logger,
    metrics::{MetricMap, Metrics},
    model::DynamicsModel,
    rng,
    task::TaskHooks,
    tensors::{ParameterSnapshot, Plans},
};
use rand::rngs::StdRng;
use scorer::{ParticlePartition, Rollout, TrajectoryScorer};
use serde::{Deserialize, Serialize};
use std::time::Instant;

const DEBUG_LOG_EVERY: usize = 10;
const VAL_METRIC: &str = "xentropy/val_mean";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    pub plan_hor: usize,
    pub num_part: usize,
    pub train_epochs: usize,
    pub batches_per_epoch: usize,
    /// Upper bound on the rows of one rollout chunk, a multiple of `num_part`.
    pub max_batch_size: usize,
    pub seed: u64,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            plan_hor: 25,
            num_part: 20,
            train_epochs: 10,
            batches_per_epoch: 100,
            max_batch_size: 1_000_000,
            seed: 0,
        }
    }
}

/// Metrics of a training call together with the parameters it ended with.
#[derive(Debug, Clone)]
pub struct TrainingReport {
    pub metrics: MetricMap,
    pub weights: ParameterSnapshot,
}

/// Model predictive controller planning through a learned ensemble.
///
/// Untrained until the first successful [`MpcController::train_initial`], in
/// which state `act` explores uniformly at random.
pub struct MpcController<M: DynamicsModel, T: TaskHooks> {
    config: ControllerConfig,
    model: M,
    hooks: T,
    optimizer: CemOptimizer,
    scorer: TrajectoryScorer,
    dataset: TransitionDataset,
    bounds: ActionBounds,
    rng: StdRng,
    trained: bool,
}

impl<M: DynamicsModel, T: TaskHooks> MpcController<M, T> {
    pub fn new(
        env_description: &EnvironmentDescription,
        config: ControllerConfig,
        cem_config: CemConfig,
        model: M,
        hooks: T,
    ) -> Result<Self> {
        if config.train_epochs == 0 || config.batches_per_epoch == 0 {
            return Err(PetsError::invalid_config(
                "train_epochs and batches_per_epoch must be positive",
            ));
        }
        let bounds = env_description.action_space.bounds()?;
        let partition = ParticlePartition::new(model.ensemble_size(), config.num_part)?;
        let scorer = TrajectoryScorer::new(
            partition,
            config.plan_hor,
            bounds.dim(),
            config.max_batch_size,
        )?;
        let optimizer = CemOptimizer::new(
            bounds.clone(),
            config.plan_hor,
            cem_config,
            config.seed,
            model.device(),
        )?;
        Ok(Self {
            rng: rng::seeded(config.seed.wrapping_add(1)),
            config,
            model,
            hooks,
            optimizer,
            scorer,
            dataset: TransitionDataset::new(),
            bounds,
            trained: false,
        })
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    pub fn dataset(&self) -> &TransitionDataset {
        &self.dataset
    }

    pub fn is_trained(&self) -> bool {
        self.trained
    }

    /// Model inputs and targets of a list of episodes. Episode `i` holds
    /// `T + 1` observations and `T` actions.
    fn preprocess_train_data(&self, obs: &[Tensor], acts: &[Tensor]) -> Result<(Tensor, Tensor)> {
        if obs.is_empty() || obs.len() != acts.len() {
            return Err(PetsError::empty_batch(format!(
                "{} observation and {} action episodes",
                obs.len(),
                acts.len()
            )));
        }
        let mut inputs = vec![];
        let mut targets = vec![];
        for (o, a) in obs.iter().zip(acts.iter()) {
            let steps = a.dim(0)?;
            if o.dim(0)? != steps + 1 {
                return Err(PetsError::ShapeMismatch {
                    expected: vec![steps + 1],
                    actual: vec![o.dim(0)?],
                });
            }
            let current = o.narrow(0, 0, steps)?;
            let next = o.narrow(0, 1, steps)?;
            let features = self.hooks.obs_preproc(&current)?;
            inputs.push(Tensor::cat(&[&features, a], 1)?);
            targets.push(self.hooks.targ_proc(&current, &next)?);
        }
        Ok((Tensor::cat(&inputs, 0)?, Tensor::cat(&targets, 0)?))
    }

    /// Builds the dataset from scratch and trains with early stopping on the
    /// mean validation cross entropy. The best parameters are restored before
    /// returning.
    pub fn train_initial(
        &mut self,
        obs: &[Tensor],
        acts: &[Tensor],
        train_split: f32,
        mut debug_logger: Option<&mut dyn Logger>,
    ) -> Result<TrainingReport> {
        if !(0. ..1.).contains(&train_split) {
            return Err(PetsError::invalid_config("train_split must be in [0, 1)"));
        }
        let (inputs, targets) = self.preprocess_train_data(obs, acts)?;
        let mut dataset = TransitionDataset::new();
        dataset.extend(&inputs, &targets)?;
        self.model.fit_input_stats(dataset.inputs()?)?;

        let len = dataset.len();
        let train_size = (train_split * len as f32) as usize;
        let val_size = len - train_size;
        let batch_size = len / self.config.batches_per_epoch;
        let train_batches = (train_split * self.config.batches_per_epoch as f32) as usize;
        let val_batches = self.config.batches_per_epoch - train_batches;
        if batch_size == 0 || train_batches == 0 || val_batches == 0 || train_size == 0 {
            return Err(PetsError::empty_batch(format!(
                "{len} transitions over {} batches leave an empty train or validation batch",
                self.config.batches_per_epoch
            )));
        }

        let members = self.model.ensemble_size();
        let idxs = bootstrap_permutations(&mut self.rng, len, members);
        let train_idxs: Vec<Vec<u32>> = idxs.iter().map(|i| i[..train_size].to_vec()).collect();
        let val_idxs: Vec<Vec<u32>> = idxs.iter().map(|i| i[train_size..].to_vec()).collect();

        let mut early_stopping = EarlyStopping::default();
        let start = Instant::now();
        let mut epoch = 0;
        while !early_stopping.early_stop() {
            epoch += 1;
            let train_epoch = permute_columns(&train_idxs, &rng::randperm(&mut self.rng, train_size));
            let val_epoch = permute_columns(&val_idxs, &rng::randperm(&mut self.rng, val_size));

            self.model.set_training(true);
            let mut train_metrics = Metrics::new();
            for batch in 0..train_batches {
                let (xs, ys) = dataset.member_batch(&minibatch(&train_epoch, batch, batch_size))?;
                train_metrics.store(self.model.update(&xs, &ys)?);
            }

            self.model.set_training(false);
            let mut val_metrics = Metrics::new();
            for batch in 0..val_batches {
                let window = minibatch(&val_epoch, batch, batch_size);
                if window.iter().any(|w| w.is_empty()) {
                    break;
                }
                let (xs, ys) = dataset.member_batch(&window)?;
                val_metrics.store(self.model.evaluate_val(&xs, &ys)?);
            }

            let mut metrics = train_metrics.average();
            metrics.extend(val_metrics.average());
            let val_xentropy = *metrics
                .get(VAL_METRIC)
                .ok_or_else(|| PetsError::empty_batch("no validation batch in epoch"))?;

            if let Some(logger) = debug_logger.as_deref_mut() {
                if epoch % DEBUG_LOG_EVERY == 0 {
                    for (name, value) in metrics.iter() {
                        logger.log_scalar(name, *value, epoch);
                    }
                    for (name, param) in self.model.snapshot()?.iter() {
                        logger.log_histogram(name, param, epoch)?;
                    }
                }
            }

            let model = &self.model;
            let decision = early_stopping.step(val_xentropy, || {
                Ok(TrainingReport {
                    metrics: metrics.clone(),
                    weights: model.snapshot()?,
                })
            })?;
            match decision {
                StoppingDecision::NewBest => {
                    tracing::debug!(epoch, val_xentropy, "new best validation cross entropy")
                }
                StoppingDecision::NoImprovement { count, remaining } => {
                    tracing::debug!(epoch, val_xentropy, count, remaining, "no improvement")
                }
                StoppingDecision::Stop => {
                    tracing::warn!(epoch, best = early_stopping.best_value(), "patience exhausted")
                }
            }
        }

        let patience = early_stopping.patience();
        let mut best = early_stopping.load_best().ok_or(PetsError::NoCheckpoint)?;
        self.model.restore(&best.weights)?;
        best.metrics
            .insert("time/train_time".to_string(), start.elapsed().as_secs_f32());
        best.metrics.insert(
            "time/train_epochs".to_string(),
            epoch.saturating_sub(patience) as f32,
        );
        self.dataset = dataset;
        self.trained = true;
        tracing::info!(epochs = epoch, transitions = len, "initial training done");
        Ok(best)
    }

    /// Adds new episodes to the dataset and trains `train_epochs` epochs over
    /// all of it. The returned `*/test_*` metrics describe the new episodes
    /// before any training on them.
    pub fn train_iteration(&mut self, obs: &[Tensor], acts: &[Tensor]) -> Result<TrainingReport> {
        if !self.trained {
            return Err(PetsError::Untrained);
        }
        let (inputs, targets) = self.preprocess_train_data(obs, acts)?;
        let members = self.model.ensemble_size();

        self.model.set_training(false);
        let mut metrics = self
            .model
            .evaluate_test(&stack_members(&inputs, members)?, &stack_members(&targets, members)?)?;

        self.dataset.extend(&inputs, &targets)?;
        self.model.fit_input_stats(self.dataset.inputs()?)?;

        let len = self.dataset.len();
        let batch_size = len / self.config.batches_per_epoch;
        if batch_size == 0 {
            return Err(PetsError::empty_batch(format!(
                "{len} transitions over {} batches",
                self.config.batches_per_epoch
            )));
        }

        let start = Instant::now();
        let mut epoch_metrics = Metrics::new();
        for epoch in 0..self.config.train_epochs {
            let idxs = bootstrap_permutations(&mut self.rng, len, members);
            self.model.set_training(true);
            epoch_metrics = Metrics::new();
            for batch in 0..self.config.batches_per_epoch {
                let (xs, ys) = self.dataset.member_batch(&minibatch(&idxs, batch, batch_size))?;
                epoch_metrics.store(self.model.update(&xs, &ys)?);
            }
            tracing::debug!(epoch, "incremental training epoch done");
        }
        self.model.set_training(false);

        metrics.extend(epoch_metrics.average());
        metrics.insert("time/train_time".to_string(), start.elapsed().as_secs_f32());
        metrics.insert(
            "time/train_epochs".to_string(),
            self.config.train_epochs as f32,
        );
        tracing::info!(transitions = len, "incremental training done");
        Ok(TrainingReport {
            metrics,
            weights: self.model.snapshot()?,
        })
    }

    /// First actions of the plans chosen for each `(num_obs, obs_features)`
    /// observation.
    pub fn act_parallel(
        &mut self,
        obs: &Tensor,
        particle_info: Option<&mut Metrics>,
    ) -> Result<Tensor> {
        self.model.set_training(false);
        let Self {
            model,
            hooks,
            optimizer,
            scorer,
            rng,
            ..
        } = self;
        let mut rollout = Rollout {
            model: &*model,
            hooks: &*hooks,
            rng,
        };
        optimizer.obtain_solution(
            obs,
            |plans, obs, info| scorer.score(&mut rollout, plans, obs, info),
            particle_info,
        )
    }

    /// Particle averaged return of `(num_obs, num_plans, plan_hor * act_features)`
    /// plans started from `(num_obs, obs_features)` observations.
    pub fn compile_score(
        &mut self,
        plans: &Plans,
        obs: &Tensor,
        particle_info: Option<&mut Metrics>,
    ) -> Result<Tensor> {
        let mut rollout = Rollout {
            model: &self.model,
            hooks: &self.hooks,
            rng: &mut self.rng,
        };
        self.scorer.score(&mut rollout, plans, obs, particle_info)
    }

    /// One step of trajectory sampling: every particle group of `obs` rows is
    /// split evenly across the members.
    pub fn predict_next_obs_divide(&mut self, obs: &Tensor, acts: &Tensor) -> Result<Tensor> {
        let mut rollout = Rollout {
            model: &self.model,
            hooks: &self.hooks,
            rng: &mut self.rng,
        };
        rollout.predict_divide(self.scorer.partition(), obs, acts)
    }

    pub fn predict_next_obs_average(&mut self, obs: &Tensor, acts: &Tensor) -> Result<Tensor> {
        let mut rollout = Rollout {
            model: &self.model,
            hooks: &self.hooks,
            rng: &mut self.rng,
        };
        rollout.predict_average(obs, acts)
    }
}

impl<M: DynamicsModel, T: TaskHooks> Controller for MpcController<M, T> {
    fn act(&mut self, observation: &Tensor) -> Result<(Tensor, MetricMap)> {
        if !self.trained {
            let bound = self.bounds.magnitude();
            let low = vec![-bound; self.bounds.dim()];
            let high = vec![bound; self.bounds.dim()];
            let action = rng::uniform_in(&mut self.rng, &low, &high, observation.device())?;
            return Ok((action, MetricMap::new()));
        }
        let mut particle_info = Metrics::new();
        let actions = self.act_parallel(&observation.unsqueeze(0)?, Some(&mut particle_info))?;
        Ok((actions.get(0)?, particle_info.average()))
    }
}

fn stack_members(xs: &Tensor, members: usize) -> Result<Tensor> {
    let (rows, features) = xs.dims2()?;
    Ok(xs
        .unsqueeze(0)?
        .broadcast_as((members, rows, features))?
        .contiguous()?)
}

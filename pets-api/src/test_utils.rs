use candle_core::{DType, Device, Tensor};
use pets_core::{
    PetsError, Result,
    env::{Env, EnvironmentDescription, SnapShot, Space},
    logger::Logger,
    metrics::{MetricMap, log_members},
    model::DynamicsModel,
    rng,
    task::TaskHooks,
    tensors::ParameterSnapshot,
};
use rand::rngs::StdRng;
use std::{cell::Cell, collections::BTreeMap};

/// One dimensional point moved by its action, `x' = x + a`, rewarded by its
/// new position. Truncates after `max_steps`.
pub struct PointMassEnv {
    pub bound: f32,
    pub max_steps: usize,
    position: f32,
    steps: usize,
    rng: StdRng,
}

impl PointMassEnv {
    pub fn new(bound: f32, max_steps: usize) -> Self {
        Self {
            bound,
            max_steps,
            position: 0.,
            steps: 0,
            rng: rng::seeded(0),
        }
    }
}

impl Env for PointMassEnv {
    fn reset(&mut self, seed: u64) -> Result<Tensor> {
        self.rng = rng::seeded(seed);
        self.steps = 0;
        let start = rng::uniform_in(&mut self.rng, &[-1.], &[1.], &Device::Cpu)?;
        self.position = start.to_vec1::<f32>()?[0];
        Ok(start)
    }

    fn step(&mut self, action: &Tensor) -> Result<SnapShot> {
        let action = action.flatten_all()?.to_vec1::<f32>()?;
        let action = action
            .first()
            .ok_or_else(|| PetsError::empty_batch("point mass needs one action"))?
            .clamp(-self.bound, self.bound);
        self.position += action;
        self.steps += 1;
        Ok(SnapShot {
            state: Tensor::new(&[self.position], &Device::Cpu)?,
            reward: self.position,
            terminated: false,
            trancuated: self.steps >= self.max_steps,
        })
    }

    fn env_description(&self) -> EnvironmentDescription {
        EnvironmentDescription::new(
            Space::continous_from_dims(vec![1]),
            Space::symmetric_box(self.bound, 1),
            1.,
        )
    }
}

/// Deterministic "ensemble" whose every member predicts `obs + act`. Inputs
/// hold `obs_features` observation columns followed by as many action columns.
pub struct ShiftModel {
    pub ensemble_size: usize,
    pub updates: usize,
    pub stats_fits: usize,
    /// Rows seen by the latest `fit_input_stats`.
    pub stats_rows: usize,
    /// `updates` at the time of the latest `evaluate_test`.
    pub updates_at_test: Cell<Option<usize>>,
    device: Device,
}

impl ShiftModel {
    pub fn new(ensemble_size: usize) -> Self {
        Self {
            ensemble_size,
            updates: 0,
            stats_fits: 0,
            stats_rows: 0,
            updates_at_test: Cell::new(None),
            device: Device::Cpu,
        }
    }

    fn predict(&self, inputs: &Tensor) -> Result<Tensor> {
        let features = inputs.dim(2)? / 2;
        Ok((inputs.narrow(2, 0, features)? + inputs.narrow(2, features, features)?)?)
    }

    fn evaluate(&self, inputs: &Tensor, targets: &Tensor, split: &str) -> Result<MetricMap> {
        let mse: Vec<f32> = (self.predict(inputs)? - targets)?
            .sqr()?
            .mean((1, 2))?
            .to_vec1()?;
        let mut metrics = MetricMap::new();
        log_members(&mut metrics, &format!("xentropy/{split}"), &mse);
        log_members(&mut metrics, &format!("mse/{split}"), &mse);
        Ok(metrics)
    }
}

impl DynamicsModel for ShiftModel {
    fn ensemble_size(&self) -> usize {
        self.ensemble_size
    }

    fn device(&self) -> &Device {
        &self.device
    }

    fn fit_input_stats(&mut self, inputs: &Tensor) -> Result<()> {
        self.stats_fits += 1;
        self.stats_rows = inputs.dim(0)?;
        Ok(())
    }

    fn set_training(&mut self, _training: bool) {}

    fn update(&mut self, inputs: &Tensor, targets: &Tensor) -> Result<MetricMap> {
        self.updates += 1;
        self.evaluate(inputs, targets, "train")
    }

    fn evaluate_val(&self, inputs: &Tensor, targets: &Tensor) -> Result<MetricMap> {
        self.evaluate(inputs, targets, "val")
    }

    fn evaluate_test(&self, inputs: &Tensor, targets: &Tensor) -> Result<MetricMap> {
        self.updates_at_test.set(Some(self.updates));
        self.evaluate(inputs, targets, "test")
    }

    fn sample(&self, inputs: &Tensor, _rng: &mut StdRng) -> Result<Tensor> {
        self.predict(inputs)
    }

    fn snapshot(&self) -> Result<ParameterSnapshot> {
        let updates = Tensor::new(&[self.updates as f32], &self.device)?;
        Ok(ParameterSnapshot(BTreeMap::from([("updates".to_string(), updates)])))
    }

    fn restore(&mut self, _snapshot: &ParameterSnapshot) -> Result<()> {
        Ok(())
    }
}

/// Predictions are next observations and the reward is the first feature of
/// the next observation. Every step reports the same `done` flag.
#[derive(Debug, Clone, Copy, Default)]
pub struct DirectTask {
    pub done: f32,
}

impl TaskHooks for DirectTask {
    fn obs_preproc(&self, obs: &Tensor) -> Result<Tensor> {
        Ok(obs.clone())
    }

    fn pred_postproc(&self, _obs: &Tensor, pred: &Tensor) -> Result<Tensor> {
        Ok(pred.clone())
    }

    fn targ_proc(&self, _obs: &Tensor, next_obs: &Tensor) -> Result<Tensor> {
        Ok(next_obs.clone())
    }

    fn get_reward(&self, _obs: &Tensor, _act: &Tensor, next_obs: &Tensor) -> Result<(Tensor, Tensor)> {
        let reward = next_obs.narrow(1, 0, 1)?.squeeze(1)?;
        let done = Tensor::full(self.done, reward.shape(), reward.device())?;
        Ok((reward, done))
    }
}

/// Delta targets for [`PointMassEnv`], rewarded by the next position.
#[derive(Debug, Clone, Copy, Default)]
pub struct PointMassTask;

impl TaskHooks for PointMassTask {
    fn obs_preproc(&self, obs: &Tensor) -> Result<Tensor> {
        Ok(obs.clone())
    }

    fn pred_postproc(&self, obs: &Tensor, pred: &Tensor) -> Result<Tensor> {
        Ok((obs + pred)?)
    }

    fn targ_proc(&self, obs: &Tensor, next_obs: &Tensor) -> Result<Tensor> {
        Ok((next_obs - obs)?)
    }

    fn get_reward(&self, _obs: &Tensor, _act: &Tensor, next_obs: &Tensor) -> Result<(Tensor, Tensor)> {
        let reward = next_obs.narrow(1, 0, 1)?.squeeze(1)?;
        let done = Tensor::zeros(reward.shape(), DType::F32, reward.device())?;
        Ok((reward, done))
    }
}

#[derive(Debug, Default)]
pub struct RecordingLogger {
    pub scalars: Vec<(String, f32, usize)>,
    pub histograms: Vec<(String, usize)>,
}

impl Logger for RecordingLogger {
    fn log_scalar(&mut self, name: &str, value: f32, step: usize) {
        self.scalars.push((name.to_string(), value, step));
    }

    fn log_histogram(&mut self, name: &str, _values: &Tensor, step: usize) -> Result<()> {
        self.histograms.push((name.to_string(), step));
        Ok(())
    }
}

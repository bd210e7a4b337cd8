use candle_core::Tensor;
use pets_core::{PetsError, Result, task::TaskHooks};

const ACTION_COST: f64 = 0.1;

/// Running task on a half cheetah style body. Observation column 0 is the
/// forward position, column 2 the body angle.
#[derive(Debug, Clone)]
pub struct HalfCheetahTask {
    pub dt: f32,
    /// Simulator steps per controller step.
    pub action_repeat: usize,
}

impl HalfCheetahTask {
    pub fn new(dt: f32, action_repeat: usize) -> Result<Self> {
        if dt <= 0. || action_repeat == 0 {
            return Err(PetsError::invalid_config(
                "dt and action_repeat must be positive",
            ));
        }
        Ok(Self { dt, action_repeat })
    }
}

impl TaskHooks for HalfCheetahTask {
    // position is dropped, the angle is replaced by its sine and cosine
    fn obs_preproc(&self, obs: &Tensor) -> Result<Tensor> {
        let features = obs.dim(1)?;
        if features < 3 {
            return Err(PetsError::ShapeMismatch {
                expected: vec![obs.dim(0)?, 3],
                actual: obs.dims().to_vec(),
            });
        }
        let angle = obs.narrow(1, 2, 1)?;
        Ok(Tensor::cat(
            &[
                &obs.narrow(1, 1, 1)?,
                &angle.sin()?,
                &angle.cos()?,
                &obs.narrow(1, 3, features - 3)?,
            ],
            1,
        )?)
    }

    fn pred_postproc(&self, obs: &Tensor, pred: &Tensor) -> Result<Tensor> {
        Ok((obs + pred)?)
    }

    fn targ_proc(&self, obs: &Tensor, next_obs: &Tensor) -> Result<Tensor> {
        Ok((next_obs - obs)?)
    }

    fn get_reward(&self, obs: &Tensor, act: &Tensor, next_obs: &Tensor) -> Result<(Tensor, Tensor)> {
        let run = ((next_obs.narrow(1, 0, 1)? - obs.narrow(1, 0, 1)?)? / self.dt as f64)?
            .squeeze(1)?;
        let effort = (act.sqr()?.sum(1)? * (-ACTION_COST * self.action_repeat as f64))?;
        let reward = (run + effort)?;
        let done = reward.zeros_like()?;
        Ok((reward, done))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use candle_core::Device;

    #[test]
    fn preprocessing_keeps_feature_count() -> Result<()> {
        let task = HalfCheetahTask::new(0.05, 1)?;
        let obs = Tensor::new(&[[5f32, 1., 0., 7.]], &Device::Cpu)?;
        let features = task.obs_preproc(&obs)?;
        assert_eq!(features.to_vec2::<f32>()?, vec![vec![1., 0., 1., 7.]]);
        assert_eq!(task.obs_features_preprocessed(4), 4);
        Ok(())
    }

    #[test]
    fn reward_is_velocity_minus_effort() -> Result<()> {
        let task = HalfCheetahTask::new(0.5, 2)?;
        let obs = Tensor::new(&[[0f32, 0., 0.], [1., 0., 0.]], &Device::Cpu)?;
        let next_obs = Tensor::new(&[[1f32, 0., 0.], [1., 0., 0.]], &Device::Cpu)?;
        let act = Tensor::new(&[[1f32, 0.], [0., 2.]], &Device::Cpu)?;
        let (reward, done) = task.get_reward(&obs, &act, &next_obs)?;
        let reward: Vec<f32> = reward.to_vec1()?;
        assert!((reward[0] - (2. - 0.2)).abs() < 1e-6);
        assert!((reward[1] + 0.8).abs() < 1e-6);
        assert_eq!(done.to_vec1::<f32>()?, vec![0., 0.]);
        Ok(())
    }

    #[test]
    fn targets_invert_postprocessing() -> Result<()> {
        let task = HalfCheetahTask::new(0.05, 1)?;
        let obs = Tensor::new(&[[1f32, 2., 3.]], &Device::Cpu)?;
        let next_obs = Tensor::new(&[[2f32, 0., 3.5]], &Device::Cpu)?;
        let target = task.targ_proc(&obs, &next_obs)?;
        let restored = task.pred_postproc(&obs, &target)?;
        assert_eq!(restored.to_vec2::<f32>()?, next_obs.to_vec2::<f32>()?);
        Ok(())
    }

    #[test]
    fn rejects_non_positive_timestep() {
        assert!(HalfCheetahTask::new(0., 1).is_err());
        assert!(HalfCheetahTask::new(0.05, 0).is_err());
    }
}

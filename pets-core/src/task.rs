use crate::error::Result;
use candle_core::Tensor;

/// Task specific feature engineering plugged into the controller.
///
/// All tensors are batched along the first dimension: `obs` and `next_obs`
/// are `(batch, obs_features)` and `act` is `(batch, act_features)`.
pub trait TaskHooks {
    /// Maps raw observations to the features the dynamics model consumes.
    fn obs_preproc(&self, obs: &Tensor) -> Result<Tensor>;

    /// Turns a model prediction back into the next observation.
    fn pred_postproc(&self, obs: &Tensor, pred: &Tensor) -> Result<Tensor>;

    /// Training target for the transition `obs -> next_obs`.
    fn targ_proc(&self, obs: &Tensor, next_obs: &Tensor) -> Result<Tensor>;

    /// Per row `(reward, done)`, both `(batch,)`. `done` is 1.0 on termination.
    fn get_reward(&self, obs: &Tensor, act: &Tensor, next_obs: &Tensor)
    -> Result<(Tensor, Tensor)>;

    fn obs_features_preprocessed(&self, obs_features: usize) -> usize {
        obs_features
    }

    fn target_features(&self, obs_features: usize) -> usize {
        obs_features
    }
}

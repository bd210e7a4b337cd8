// builders + tasks + higher level helpers
pub mod builders;
pub mod tasks;

#[cfg(feature = "test-utils")]
pub mod test_utils;

use anyhow::Result;
use candle_core::Tensor;
use pets_core::{Controller, env::Env};

/// One rollout of `controller` in `env`, stopped by termination, truncation
/// or after `max_steps` steps.
#[derive(Debug)]
pub struct Episode {
    /// `(steps + 1, obs_features)`.
    pub observations: Tensor,
    /// `(steps, act_features)`.
    pub actions: Tensor,
    pub total_reward: f32,
}

impl Episode {
    pub fn len(&self) -> usize {
        self.actions.dims()[0]
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub fn run_episode<E: Env, C: Controller>(
    env: &mut E,
    controller: &mut C,
    max_steps: usize,
    seed: u64,
) -> Result<Episode> {
    let mut state = env.reset(seed)?;
    let mut observations = vec![state.clone()];
    let mut actions = vec![];
    let mut total_reward = 0.;
    for _ in 0..max_steps {
        let (action, _) = controller.act(&state)?;
        let snapshot = env.step(&action)?;
        total_reward += snapshot.reward;
        actions.push(action);
        observations.push(snapshot.state.clone());
        state = snapshot.state;
        if snapshot.terminated || snapshot.trancuated {
            break;
        }
    }
    if actions.is_empty() {
        anyhow::bail!("episode took no steps");
    }
    tracing::debug!(steps = actions.len(), total_reward, "episode finished");
    Ok(Episode {
        observations: Tensor::stack(&observations, 0)?,
        actions: Tensor::stack(&actions, 0)?,
        total_reward,
    })
}

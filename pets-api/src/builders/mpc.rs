use crate::builders::ensemble::EnsembleBuilder;
use candle_core::Device;
use pets_agents::{
    cem::CemConfig,
    ensemble::BootstrapEnsemble,
    mpc::{ControllerConfig, MpcController},
};
use pets_core::{Result, env::EnvironmentDescription, rng, task::TaskHooks};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Everything needed to assemble a controller apart from the environment
/// and the task. Defaults reproduce the half cheetah setup.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MpcBuilder {
    pub controller: ControllerConfig,
    pub ensemble: EnsembleBuilder,
    pub cem: CemConfig,
}

impl MpcBuilder {
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json(&json)
    }

    pub fn build<T: TaskHooks>(
        &self,
        device: &Device,
        env_description: &EnvironmentDescription,
        hooks: T,
    ) -> Result<MpcController<BootstrapEnsemble, T>> {
        let obs_features = env_description.observation_size();
        let in_features =
            hooks.obs_features_preprocessed(obs_features) + env_description.action_size();
        let out_features = hooks.target_features(obs_features);
        // separate stream for parameter initialization
        let mut init_rng = rng::seeded(self.controller.seed.wrapping_add(2));
        let model = self
            .ensemble
            .build(in_features, out_features, device, &mut init_rng)?;
        tracing::info!(in_features, out_features, "building mpc controller");
        MpcController::new(
            env_description,
            self.controller.clone(),
            self.cem.clone(),
            model,
            hooks,
        )
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::tasks::HalfCheetahTask;
    use pets_core::env::Space;

    #[test]
    fn defaults_match_reference_setup() {
        let builder = MpcBuilder::default();
        assert_eq!(builder.controller.plan_hor, 25);
        assert_eq!(builder.controller.num_part, 20);
        assert_eq!(builder.ensemble.ensemble_size, 5);
        assert_eq!(builder.ensemble.hid_features, vec![200; 4]);
        assert_eq!(builder.cem.popsize, 1000);
        assert_eq!(builder.cem.num_elites, 50);
    }

    #[test]
    fn partial_json_keeps_defaults() -> Result<()> {
        let builder = MpcBuilder::from_json(
            r#"{"controller": {"plan_hor": 5, "num_part": 10},
                "ensemble": {"activation": "relu", "hid_features": [8]}}"#,
        )?;
        assert_eq!(builder.controller.plan_hor, 5);
        assert_eq!(builder.controller.train_epochs, 10);
        assert_eq!(builder.ensemble.hid_features, vec![8]);
        assert_eq!(builder.ensemble.ensemble_size, 5);
        assert_eq!(builder.cem.iterations, 5);
        Ok(())
    }

    #[test]
    fn builds_controller_for_task() -> Result<()> {
        let env_description =
            EnvironmentDescription::new(Space::continous_from_dims(vec![6]), Space::symmetric_box(1., 2), 0.05);
        let mut builder = MpcBuilder::default();
        builder.ensemble.hid_features = vec![8];
        let controller =
            builder.build(&Device::Cpu, &env_description, HalfCheetahTask::new(0.05, 1)?)?;
        assert!(!controller.is_trained());
        assert_eq!(controller.model().config().in_features, 8);
        assert_eq!(controller.model().config().out_features, 6);
        Ok(())
    }

    #[test]
    fn uneven_particle_split_is_rejected() -> Result<()> {
        let env_description =
            EnvironmentDescription::new(Space::continous_from_dims(vec![6]), Space::symmetric_box(1., 2), 0.05);
        let mut builder = MpcBuilder::default();
        builder.ensemble.hid_features = vec![8];
        builder.controller.num_part = 12;
        assert!(
            builder
                .build(&Device::Cpu, &env_description, HalfCheetahTask::new(0.05, 1)?)
                .is_err()
        );
        Ok(())
    }
}

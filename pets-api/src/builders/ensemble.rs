use pets_agents::ensemble::{BootstrapEnsemble, EnsembleConfig, layers::ActivationKind};
use candle_core::Device;
use pets_core::Result;
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};

/// Ensemble hyper parameters without the feature counts, which are derived
/// from the environment and the task.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EnsembleBuilder {
    pub ensemble_size: usize,
    pub hid_features: Vec<usize>,
    pub activation: ActivationKind,
    pub lr: f64,
    pub weight_decay: f64,
    pub dropout: f32,
}

impl Default for EnsembleBuilder {
    fn default() -> Self {
        let EnsembleConfig {
            ensemble_size,
            hid_features,
            activation,
            lr,
            weight_decay,
            dropout,
            ..
        } = EnsembleConfig::default();
        Self {
            ensemble_size,
            hid_features,
            activation,
            lr,
            weight_decay,
            dropout,
        }
    }
}

impl EnsembleBuilder {
    pub fn config(&self, in_features: usize, out_features: usize) -> EnsembleConfig {
        EnsembleConfig {
            ensemble_size: self.ensemble_size,
            in_features,
            out_features,
            hid_features: self.hid_features.clone(),
            activation: self.activation,
            lr: self.lr,
            weight_decay: self.weight_decay,
            dropout: self.dropout,
        }
    }

    pub fn build(
        &self,
        in_features: usize,
        out_features: usize,
        device: &Device,
        rng: &mut StdRng,
    ) -> Result<BootstrapEnsemble> {
        BootstrapEnsemble::new(self.config(in_features, out_features), device, rng)
    }
}

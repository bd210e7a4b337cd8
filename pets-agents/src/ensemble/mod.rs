pub mod layers;
pub mod normalizer;

use candle_core::{DType, Device, Tensor, safetensors};
use candle_nn::{AdamW, Optimizer, ParamsAdamW, VarBuilder, VarMap};
use layers::{ActivationKind, EnsembleMlp};
use normalizer::NormalizationStats;
use pets_core::{
    PetsError, Result,
    metrics::{MetricMap, log_members},
    model::DynamicsModel,
    rng,
    tensors::{MemberLoss, Mse, ParameterSnapshot, Xentropy},
};
use rand::{Rng, rngs::StdRng};
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, path::Path};

const LOGVAR_BOUND_COEF: f64 = 0.01;
const INPUT_MEAN: &str = "input_stats.mean";
const INPUT_STD: &str = "input_stats.std";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnsembleConfig {
    pub ensemble_size: usize,
    pub in_features: usize,
    pub out_features: usize,
    pub hid_features: Vec<usize>,
    pub activation: ActivationKind,
    pub lr: f64,
    pub weight_decay: f64,
    pub dropout: f32,
}

impl Default for EnsembleConfig {
    fn default() -> Self {
        Self {
            ensemble_size: 5,
            in_features: 0,
            out_features: 0,
            hid_features: vec![200, 200, 200, 200],
            activation: ActivationKind::Swish,
            lr: 1e-3,
            weight_decay: 1e-4,
            dropout: 0.,
        }
    }
}

impl EnsembleConfig {
    pub fn validate(&self) -> Result<()> {
        if self.ensemble_size == 0 {
            return Err(PetsError::invalid_config("ensemble_size must be positive"));
        }
        if self.in_features == 0 || self.out_features == 0 {
            return Err(PetsError::invalid_config(
                "in_features and out_features must be positive",
            ));
        }
        if self.hid_features.contains(&0) {
            return Err(PetsError::invalid_config("hidden layers must not be empty"));
        }
        if !(0. ..1.).contains(&self.dropout) {
            return Err(PetsError::invalid_config("dropout must be in [0, 1)"));
        }
        if self.lr <= 0. || self.weight_decay < 0. {
            return Err(PetsError::invalid_config(
                "lr must be positive and weight_decay non negative",
            ));
        }
        Ok(())
    }
}

/// Probabilistic ensemble trained on bootstrapped datasets.
///
/// Every parameter tensor is stacked along a leading member axis, so member
/// `m` owns slice `m` of each of them. One optimizer step therefore updates
/// all members at once while each member only sees its own rows of the batch.
pub struct BootstrapEnsemble {
    config: EnsembleConfig,
    net: EnsembleMlp,
    varmap: VarMap,
    optimizer: AdamW,
    stats: Option<NormalizationStats>,
    training: bool,
    dropout_rng: StdRng,
    device: Device,
}

impl BootstrapEnsemble {
    pub fn new(config: EnsembleConfig, device: &Device, rng: &mut StdRng) -> Result<Self> {
        config.validate()?;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
        let net = EnsembleMlp::build(
            config.ensemble_size,
            config.in_features,
            &config.hid_features,
            config.out_features,
            config.activation,
            config.dropout,
            &vb,
            rng,
        )?;
        // Weight decay enters the loss explicitly, per member.
        let optimizer_params = ParamsAdamW {
            lr: config.lr,
            weight_decay: 0.,
            ..Default::default()
        };
        let optimizer = AdamW::new(varmap.all_vars(), optimizer_params)?;
        Ok(Self {
            config,
            net,
            varmap,
            optimizer,
            stats: None,
            training: false,
            dropout_rng: rng::seeded(rng.random()),
            device: device.clone(),
        })
    }

    pub fn config(&self) -> &EnsembleConfig {
        &self.config
    }

    fn check_batch(&self, inputs: &Tensor, targets: Option<&Tensor>) -> Result<usize> {
        let n = self.config.ensemble_size;
        let (members, rows, features) = inputs.dims3()?;
        if members != n || features != self.config.in_features {
            return Err(PetsError::ShapeMismatch {
                expected: vec![n, rows, self.config.in_features],
                actual: inputs.dims().to_vec(),
            });
        }
        if let Some(targets) = targets {
            let expected = [n, rows, self.config.out_features];
            if targets.dims() != expected {
                return Err(PetsError::ShapeMismatch {
                    expected: expected.to_vec(),
                    actual: targets.dims().to_vec(),
                });
            }
        }
        if rows == 0 {
            return Err(PetsError::empty_batch("ensemble batch has no rows"));
        }
        Ok(rows)
    }

    fn normalize(&self, inputs: &Tensor) -> Result<Tensor> {
        let stats = self.stats.as_ref().ok_or(PetsError::MissingInputStats)?;
        stats.normalize(&inputs.to_device(&self.device)?)
    }

    fn forward(&self, inputs: &Tensor) -> Result<(Tensor, Tensor)> {
        Ok(self.net.forward_t(&self.normalize(inputs)?, None)?)
    }

    fn losses(mean: &Tensor, logvar: &Tensor, targets: &Tensor) -> Result<(Xentropy, Mse)> {
        let sq_err = (mean - targets)?.sqr()?;
        let inv_var = logvar.neg()?.exp()?;
        let xentropy = (sq_err.mul(&inv_var)? + logvar)?.mean((1, 2))?;
        let mse = sq_err.mean((1, 2))?;
        Ok((Xentropy(xentropy), Mse(mse)))
    }

    fn evaluate(&self, inputs: &Tensor, targets: &Tensor, split: &str) -> Result<MetricMap> {
        self.check_batch(inputs, Some(targets))?;
        let targets = targets.to_device(&self.device)?;
        let (mean, logvar) = self.forward(inputs)?;
        let (xentropy, mse) = Self::losses(&mean, &logvar, &targets)?;
        let mut metrics = MetricMap::new();
        log_members(&mut metrics, &format!("xentropy/{split}"), &xentropy.to_vec1::<f32>()?);
        log_members(&mut metrics, &format!("mse/{split}"), &mse.to_vec1::<f32>()?);
        Ok(metrics)
    }

    /// Writes parameters and input statistics to a safetensors file.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let mut tensors: HashMap<String, Tensor> = self.snapshot()?.0.into_iter().collect();
        if let Some(stats) = &self.stats {
            tensors.insert(INPUT_MEAN.to_string(), stats.mean.clone());
            tensors.insert(INPUT_STD.to_string(), stats.std.clone());
        }
        safetensors::save(&tensors, path.as_ref())?;
        tracing::debug!(path = %path.as_ref().display(), tensors = tensors.len(), "saved ensemble");
        Ok(())
    }

    pub fn load<P: AsRef<Path>>(&mut self, path: P) -> Result<()> {
        let mut tensors = safetensors::load(path, &self.device)?;
        let mean = tensors.remove(INPUT_MEAN);
        let std = tensors.remove(INPUT_STD);
        self.restore(&ParameterSnapshot(tensors.into_iter().collect()))?;
        self.stats = match (mean, std) {
            (Some(mean), Some(std)) => Some(NormalizationStats { mean, std }),
            _ => None,
        };
        Ok(())
    }
}

impl DynamicsModel for BootstrapEnsemble {
    fn ensemble_size(&self) -> usize {
        self.config.ensemble_size
    }

    fn device(&self) -> &Device {
        &self.device
    }

    fn fit_input_stats(&mut self, inputs: &Tensor) -> Result<()> {
        let stats = NormalizationStats::fit(inputs, &self.device)?;
        if stats.features() != self.config.in_features {
            return Err(PetsError::ShapeMismatch {
                expected: vec![self.config.in_features],
                actual: vec![stats.features()],
            });
        }
        self.stats = Some(stats);
        Ok(())
    }

    fn set_training(&mut self, training: bool) {
        self.training = training;
    }

    fn update(&mut self, inputs: &Tensor, targets: &Tensor) -> Result<MetricMap> {
        self.check_batch(inputs, Some(targets))?;
        let targets = targets.to_device(&self.device)?;
        let inputs = self.normalize(inputs)?;
        let dropout_rng = self.training.then_some(&mut self.dropout_rng);
        let (mean, logvar) = self.net.forward_t(&inputs, dropout_rng)?;
        let (xentropy, mse) = Self::losses(&mean, &logvar, &targets)?;
        let decay = (self.net.weight_sq_norm()? * (0.5 * self.config.weight_decay))?;
        let bound = (self.net.logvar_bound_penalty()? * LOGVAR_BOUND_COEF)?;
        let loss = MemberLoss(((&*xentropy + decay)? + bound)?);

        let per_member = loss.to_vec1::<f32>()?;
        if let Some((member, value)) = per_member
            .iter()
            .enumerate()
            .find(|(_, value)| !value.is_finite())
        {
            return Err(PetsError::NonFiniteLoss {
                member,
                value: *value,
            });
        }
        self.optimizer.backward_step(&loss.sum_all()?)?;

        let mut metrics = MetricMap::new();
        log_members(&mut metrics, "loss/train", &per_member);
        log_members(&mut metrics, "xentropy/train", &xentropy.to_vec1::<f32>()?);
        log_members(&mut metrics, "mse/train", &mse.to_vec1::<f32>()?);
        Ok(metrics)
    }

    fn evaluate_val(&self, inputs: &Tensor, targets: &Tensor) -> Result<MetricMap> {
        self.evaluate(inputs, targets, "val")
    }

    fn evaluate_test(&self, inputs: &Tensor, targets: &Tensor) -> Result<MetricMap> {
        self.evaluate(inputs, targets, "test")
    }

    fn sample(&self, inputs: &Tensor, rng: &mut StdRng) -> Result<Tensor> {
        self.check_batch(inputs, None)?;
        let (mean, logvar) = self.forward(inputs)?;
        let noise = rng::randn(rng, mean.shape(), &self.device)?;
        let std = (logvar * 0.5)?.exp()?;
        Ok((mean + std.mul(&noise)?)?)
    }

    fn snapshot(&self) -> Result<ParameterSnapshot> {
        let data = self
            .varmap
            .data()
            .lock()
            .map_err(|err| candle_core::Error::Msg(err.to_string()))?;
        let mut snapshot = std::collections::BTreeMap::new();
        for (name, var) in data.iter() {
            snapshot.insert(name.clone(), var.as_tensor().detach().copy()?);
        }
        Ok(ParameterSnapshot(snapshot))
    }

    fn restore(&mut self, snapshot: &ParameterSnapshot) -> Result<()> {
        let data = self
            .varmap
            .data()
            .lock()
            .map_err(|err| candle_core::Error::Msg(err.to_string()))?;
        for (name, var) in data.iter() {
            let value = snapshot.get(name).ok_or_else(|| {
                PetsError::invalid_config(format!("snapshot is missing parameter {name}"))
            })?;
            var.set(&value.to_device(&self.device)?)?;
        }
        Ok(())
    }
}

use crate::{error::Result, metrics::MetricMap, tensors::ParameterSnapshot};
use candle_core::{Device, Tensor};
use rand::rngs::StdRng;

/// An ensemble of probabilistic next-state regressors.
///
/// Batched inputs are laid out member axis first: `(ensemble_size, rows, features)`.
pub trait DynamicsModel {
    fn ensemble_size(&self) -> usize;

    fn device(&self) -> &Device;

    /// Overwrites the input normalization with statistics over `inputs`.
    fn fit_input_stats(&mut self, inputs: &Tensor) -> Result<()>;

    /// Toggles dropout.
    fn set_training(&mut self, training: bool);

    /// One optimization step, each member on its own slice of the batch.
    fn update(&mut self, inputs: &Tensor, targets: &Tensor) -> Result<MetricMap>;

    fn evaluate_val(&self, inputs: &Tensor, targets: &Tensor) -> Result<MetricMap>;

    fn evaluate_test(&self, inputs: &Tensor, targets: &Tensor) -> Result<MetricMap>;

    /// One draw from every member's predictive distribution per row.
    fn sample(&self, inputs: &Tensor, rng: &mut StdRng) -> Result<Tensor>;

    fn snapshot(&self) -> Result<ParameterSnapshot>;

    fn restore(&mut self, snapshot: &ParameterSnapshot) -> Result<()>;
}

pub mod early_stopping;
pub mod env;
pub mod error;
pub mod logger;
pub mod metrics;
pub mod model;
pub mod rng;
pub mod task;
pub mod tensors;

pub use error::{PetsError, Result};

/// Anything that picks actions for observations.
pub trait Controller {
    /// Action for a single `(obs_features,)` observation together with
    /// diagnostics gathered while choosing it.
    fn act(&mut self, observation: &candle_core::Tensor)
    -> Result<(candle_core::Tensor, metrics::MetricMap)>;
}

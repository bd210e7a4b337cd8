use candle_core::Tensor;
use derive_more::{Deref, DerefMut};
use std::collections::BTreeMap;

/// Per member cross entropy, shape `(ensemble_size,)`.
#[derive(Deref, DerefMut, Debug, Clone)]
pub struct Xentropy(pub Tensor);

/// Per member mean squared error, shape `(ensemble_size,)`.
#[derive(Deref, DerefMut, Debug, Clone)]
pub struct Mse(pub Tensor);

/// Per member regularized training loss, shape `(ensemble_size,)`.
#[derive(Deref, DerefMut, Debug, Clone)]
pub struct MemberLoss(pub Tensor);

/// Flat batch of candidate action sequences, `(num_obs, num_plans, horizon * act_features)`.
#[derive(Deref, Debug, Clone)]
pub struct Plans(pub Tensor);

/// Deep copy of named model parameters. Never aliases the live parameters.
#[derive(Deref, Debug, Clone, Default)]
pub struct ParameterSnapshot(pub BTreeMap<String, Tensor>);

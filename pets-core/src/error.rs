use thiserror::Error;

pub type Result<T> = std::result::Result<T, PetsError>;

#[derive(Debug, Error)]
pub enum PetsError {
    /// Rejected at construction, before any training or planning happens.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("empty batch: {0}")]
    EmptyBatch(String),

    /// The probabilistic loss of an ensemble member was NaN or infinite. The
    /// optimizer step is skipped so the parameters are left untouched.
    #[error("non finite loss {value} for ensemble member {member}")]
    NonFiniteLoss { member: usize, value: f32 },

    #[error("input statistics have not been fitted yet")]
    MissingInputStats,

    #[error("controller has not completed initial training")]
    Untrained,

    /// Early stopping finished without a single epoch improving on the
    /// validation metric, so there is no checkpoint to restore.
    #[error("no checkpoint recorded, validation metric never improved")]
    NoCheckpoint,

    #[error("shape mismatch: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    #[error("unknown activation: {0}")]
    UnknownActivation(String),

    #[error("tensor error: {0}")]
    Tensor(#[from] candle_core::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("config error: {0}")]
    Config(#[from] serde_json::Error),
}

impl PetsError {
    pub fn invalid_config(msg: impl Into<String>) -> Self {
        Self::InvalidConfig(msg.into())
    }

    pub fn empty_batch(msg: impl Into<String>) -> Self {
        Self::EmptyBatch(msg.into())
    }
}

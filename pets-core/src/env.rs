use crate::error::{PetsError, Result};
use candle_core::Tensor;

#[derive(Debug, Clone)]
pub enum Space {
    Continous {
        min: Option<Vec<f32>>,
        max: Option<Vec<f32>>,
        size: usize,
    },
}

impl Space {
    pub fn continous_from_dims(dims: Vec<usize>) -> Self {
        Self::Continous {
            min: None,
            max: None,
            size: dims.iter().product(),
        }
    }

    /// A box space with the same bound on every dimension.
    pub fn symmetric_box(bound: f32, size: usize) -> Self {
        Self::Continous {
            min: Some(vec![-bound; size]),
            max: Some(vec![bound; size]),
            size,
        }
    }

    pub fn size(&self) -> usize {
        let Self::Continous { size, .. } = self;
        *size
    }

    pub fn bounds(&self) -> Result<ActionBounds> {
        match self {
            Self::Continous {
                min: Some(min),
                max: Some(max),
                size,
            } => ActionBounds::new(min.clone(), max.clone(), *size),
            Self::Continous { .. } => Err(PetsError::invalid_config(
                "planning needs a bounded continous action space",
            )),
        }
    }
}

/// Element-wise legal range of a continous action.
#[derive(Debug, Clone, PartialEq)]
pub struct ActionBounds {
    pub low: Vec<f32>,
    pub high: Vec<f32>,
}

impl ActionBounds {
    pub fn new(low: Vec<f32>, high: Vec<f32>, size: usize) -> Result<Self> {
        if size == 0 {
            return Err(PetsError::invalid_config("action space has no dimensions"));
        }
        if low.len() != size || high.len() != size {
            return Err(PetsError::ShapeMismatch {
                expected: vec![size],
                actual: vec![low.len().min(high.len())],
            });
        }
        if low.iter().zip(high.iter()).any(|(l, h)| l > h) {
            return Err(PetsError::invalid_config("action lower bound above upper bound"));
        }
        Ok(Self { low, high })
    }

    pub fn dim(&self) -> usize {
        self.low.len()
    }

    /// Magnitude used as the initial belief std and for random exploration.
    pub fn magnitude(&self) -> f32 {
        self.high[0]
    }
}

#[derive(Debug, Clone)]
pub struct EnvironmentDescription {
    pub observation_space: Space,
    pub action_space: Space,
    /// Simulated seconds per environment step.
    pub dt: f32,
}

impl EnvironmentDescription {
    pub fn new(observation_space: Space, action_space: Space, dt: f32) -> Self {
        Self {
            observation_space,
            action_space,
            dt,
        }
    }

    pub fn action_size(&self) -> usize {
        self.action_space.size()
    }

    pub fn observation_size(&self) -> usize {
        self.observation_space.size()
    }
}

pub struct SnapShot {
    pub state: Tensor,
    pub reward: f32,
    pub terminated: bool,
    pub trancuated: bool,
}

pub trait Env {
    fn reset(&mut self, seed: u64) -> Result<Tensor>;
    fn step(&mut self, action: &Tensor) -> Result<SnapShot>;
    fn env_description(&self) -> EnvironmentDescription;
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn symmetric_box_bounds() -> Result<()> {
        let bounds = Space::symmetric_box(2., 3).bounds()?;
        assert_eq!(bounds.dim(), 3);
        assert_eq!(bounds.magnitude(), 2.);
        assert_eq!(bounds.low, vec![-2.; 3]);
        Ok(())
    }

    #[test]
    fn unbounded_space_is_rejected() {
        let space = Space::continous_from_dims(vec![2]);
        assert!(matches!(space.bounds(), Err(PetsError::InvalidConfig(_))));
    }
}

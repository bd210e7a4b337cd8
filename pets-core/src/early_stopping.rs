//! Early stopping with a by-value checkpoint of the best state.
//!
//! The monitored metric is minimized. A step counts as an improvement only if
//! the value is strictly lower than the best seen so far; after `patience`
//! consecutive steps without improvement the tracker stops.

use crate::error::Result;

pub const DEFAULT_PATIENCE: usize = 20;

#[derive(Debug, Clone, PartialEq)]
pub enum StoppingDecision {
    /// New best value, the checkpoint was replaced.
    NewBest,
    NoImprovement { count: usize, remaining: usize },
    /// Patience exhausted.
    Stop,
}

#[derive(Debug)]
pub struct EarlyStopping<S> {
    patience: usize,
    best_value: f32,
    counter: usize,
    best: Option<S>,
    stopped: bool,
}

impl<S> EarlyStopping<S> {
    pub fn new(patience: usize) -> Self {
        Self {
            patience,
            best_value: f32::INFINITY,
            counter: 0,
            best: None,
            stopped: false,
        }
    }

    /// Feeds the metric of one epoch. `checkpoint` is only invoked when the
    /// value improves, so capturing an expensive snapshot is lazy.
    pub fn step<F>(&mut self, value: f32, checkpoint: F) -> Result<StoppingDecision>
    where
        F: FnOnce() -> Result<S>,
    {
        if self.stopped {
            return Ok(StoppingDecision::Stop);
        }
        if value < self.best_value {
            self.best = Some(checkpoint()?);
            self.best_value = value;
            self.counter = 0;
            return Ok(StoppingDecision::NewBest);
        }
        self.counter += 1;
        if self.counter >= self.patience {
            self.stopped = true;
            Ok(StoppingDecision::Stop)
        } else {
            Ok(StoppingDecision::NoImprovement {
                count: self.counter,
                remaining: self.patience - self.counter,
            })
        }
    }

    pub fn early_stop(&self) -> bool {
        self.stopped
    }

    pub fn patience(&self) -> usize {
        self.patience
    }

    pub fn best_value(&self) -> f32 {
        self.best_value
    }

    /// Consumes the tracker and hands out the best checkpoint.
    pub fn load_best(self) -> Option<S> {
        self.best
    }
}

impl<S> Default for EarlyStopping<S> {
    fn default() -> Self {
        Self::new(DEFAULT_PATIENCE)
    }
}

//! Optimizers and learning rate schedulers
//!
//! Optimizers update the variables of a `candle_nn::VarMap` in place from a
//! `GradStore`. Their moment estimates are exposed as named tensors so the
//! checkpoint manager can write them next to the model weights.

pub mod adam;
pub mod schedulers;

pub use adam::{Adam, AdamConfig};
pub use schedulers::PolynomialDecay;

use std::collections::HashMap;

use candle_core::backprop::GradStore;
use candle_core::Tensor;

use crate::error::Result;

/// Trait for optimizers
pub trait Optimizer {
    /// Optimizer name
    fn name(&self) -> &str;

    /// Apply one update from `gradients`
    fn step(&mut self, gradients: &GradStore) -> Result<()>;

    /// Current learning rate
    fn learning_rate(&self) -> f64;

    /// Set the learning rate used by the next step
    fn set_learning_rate(&mut self, lr: f64);

    /// Updates applied so far
    fn step_count(&self) -> usize;

    /// Optimizer state as named tensors, including the step counter
    fn state_tensors(&self) -> Result<HashMap<String, Tensor>>;

    /// Restore state written by [`Optimizer::state_tensors`]
    fn load_state_tensors(&mut self, state: HashMap<String, Tensor>) -> Result<()>;
}

/// Trait for learning rate schedules over the global step
pub trait Scheduler {
    /// Scheduler name
    fn name(&self) -> &str;

    /// Learning rate at `step`
    fn lr_at(&self, step: usize) -> f64;
}

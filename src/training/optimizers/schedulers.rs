//! Learning rate schedules

use serde::{Deserialize, Serialize};

use super::Scheduler;

/// Polynomial decay from `initial_lr` to `end_lr` over `decay_steps`
///
/// With `cycle` the horizon is stretched to the next multiple of
/// `decay_steps` once it is passed, so the rate restarts higher and decays
/// again. Step 0 counts as one full horizon.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PolynomialDecay {
    /// Rate at step 0
    pub initial_lr: f64,
    /// Rate at the end of every horizon
    pub end_lr: f64,
    /// Length of one horizon in steps
    pub decay_steps: usize,
    /// Exponent of the decay curve
    pub power: f64,
    /// Restart after each horizon instead of holding `end_lr`
    pub cycle: bool,
}

impl PolynomialDecay {
    /// Linear cycling decay to `initial_lr / 100`
    pub fn new(initial_lr: f64, decay_steps: usize) -> Self {
        Self {
            initial_lr,
            end_lr: initial_lr * 1e-2,
            decay_steps: decay_steps.max(1),
            power: 1.0,
            cycle: true,
        }
    }

    /// Schedule for `num_train` source samples split into `batch_size`
    /// batches, decaying over 200 epochs
    pub fn for_training(initial_lr: f64, num_train: usize, batch_size: usize) -> Self {
        let steps_per_epoch = num_train / batch_size.max(1);
        Self::new(initial_lr, steps_per_epoch * 200)
    }
}

impl Scheduler for PolynomialDecay {
    fn name(&self) -> &str {
        "polynomial_decay"
    }

    fn lr_at(&self, step: usize) -> f64 {
        let decay_steps = self.decay_steps.max(1) as f64;
        let step = step as f64;
        let (step, horizon) = if self.cycle {
            let multiple = (step / decay_steps).ceil().max(1.0);
            (step, decay_steps * multiple)
        } else {
            (step.min(decay_steps), decay_steps)
        };
        let remaining = 1.0 - step / horizon;
        (self.initial_lr - self.end_lr) * remaining.powf(self.power) + self.end_lr
    }
}

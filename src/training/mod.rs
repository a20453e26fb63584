//! Training infrastructure for the AMCA classifier
//!
//! # Main Components
//!
//! - **Loss**: margin cross-entropy, cutmix cross-entropy and the
//!   orthogonality loss over in-batch class centroids
//! - **Step**: [`Learner`] performs one optimisation step or one evaluation
//!   pass
//! - **Trainer**: the epoch loop over source/server batches with per-domain
//!   evaluation
//! - **Optimizers**: Adam with a cycling polynomial-decay schedule
//! - **Checkpoints**: safetensors checkpoints with bounded retention
//! - **Metrics / Summary**: per-epoch accumulators, confusion matrices and
//!   the scalar/image event log
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use mmwave_amca::training::{Learner, LearnerConfig, Trainer, TrainerOptions};
//!
//! let learner = Learner::new(model, var_map, LearnerConfig::from_run_config(&config, n_train))?;
//! let mut trainer = Trainer::new(learner, data, TrainerOptions::from(&config), summary, checkpoints);
//! let history = trainer.run()?;
//! ```

pub mod checkpoints;
pub mod loss;
pub mod metrics;
pub mod optimizers;
pub mod step;
pub mod summary;
pub mod trainer;

#[cfg(test)]
mod tests;

pub use checkpoints::{CheckpointInfo, CheckpointManager, RestoredState, DEFAULT_MAX_TO_KEEP};
pub use metrics::{
    CategoricalAccuracy, ConfusionMatrix, EpochSummary, Mean, StepLosses, TrainAccumulators,
};
pub use optimizers::{Adam, AdamConfig, Optimizer, PolynomialDecay, Scheduler};
pub use step::{Learner, LearnerConfig};
pub use summary::{ConfusionRenderer, PgmHeatmap, RenderedImage, ScalarEvent, SummaryWriter};
pub use trainer::{anneal_margin, on_cadence, Trainer, TrainerOptions};

//! mmwave-amca - domain-adaptive mmWave gesture classification
//!
//! Trains a residual classifier on labelled source-domain radar recordings
//! with an additive-margin cross-entropy, a cutmix cross-entropy and an
//! orthogonality loss over class centroids of source and server batches,
//! then evaluates it on time-shifted, office, server and conference
//! recordings every epoch.

#![warn(missing_docs)]
#![warn(rustdoc::broken_intra_doc_links)]

pub mod config;
pub mod data;
pub mod error;
pub mod logging;
pub mod model;
pub mod training;

// Re-exports
pub use config::RunConfig;
pub use data::{Batch, CutMix, Domain, DomainSets, LabeledSplit};
pub use error::{Error, Result};
pub use model::{Activation, Model, ModelOutput, ResNetAmca, ResNetAmcaConfig};
pub use training::{
    CheckpointManager, EpochSummary, Learner, LearnerConfig, SummaryWriter, Trainer,
    TrainerOptions,
};

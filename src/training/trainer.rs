//! Epoch orchestration
//!
//! Every epoch trains on zipped source/server batches, evaluates the five
//! test domains, writes the epoch's scalars (and on cadence the confusion
//! matrices) and saves a checkpoint on cadence.

use candle_core::Device;
use tracing::{info, warn};

use super::checkpoints::{CheckpointManager, RestoredState};
use super::metrics::{CategoricalAccuracy, ConfusionMatrix, EpochSummary, TrainAccumulators};
use super::optimizers::Optimizer;
use super::step::Learner;
use super::summary::SummaryWriter;
use crate::config::RunConfig;
use crate::data::{Domain, DomainSets};
use crate::error::Result;
use crate::model::Model;

/// Margin used during `epoch`: grows linearly from 0 and reaches `m` after
/// `epochs / anneal` epochs
pub fn anneal_margin(m: f64, epoch: usize, epochs: usize, anneal: usize) -> f64 {
    if epochs == 0 || anneal == 0 {
        return m;
    }
    let ramp = epochs as f64 / anneal as f64;
    (m * (epoch as f64 / ramp)).min(m)
}

/// Whether a `freq`-epoch cadence fires after `epoch`; 0 disables it
pub fn on_cadence(epoch: usize, freq: usize) -> bool {
    freq != 0 && (epoch + 1) % freq == 0
}

/// Schedule of a training run
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrainerOptions {
    /// Number of epochs
    pub epochs: usize,
    /// Mini-batch size of training and evaluation
    pub batch_size: usize,
    /// Final additive margin
    pub m: f64,
    /// Margin warm-up divisor
    pub anneal: usize,
    /// Checkpoint cadence in epochs
    pub save_freq: usize,
    /// Confusion-matrix cadence in epochs
    pub log_images_freq: usize,
}

impl From<&RunConfig> for TrainerOptions {
    fn from(config: &RunConfig) -> Self {
        Self {
            epochs: config.epochs,
            batch_size: config.batch_size,
            m: config.m,
            anneal: config.anneal,
            save_freq: config.save_freq,
            log_images_freq: config.log_images_freq,
        }
    }
}

/// Runs the epoch loop of one training run
pub struct Trainer<M: Model> {
    learner: Learner<M>,
    data: DomainSets,
    options: TrainerOptions,
    summary: SummaryWriter,
    checkpoints: CheckpointManager,
    start_epoch: usize,
}

impl<M: Model> Trainer<M> {
    /// Create a trainer that starts at epoch 0
    pub fn new(
        learner: Learner<M>,
        data: DomainSets,
        options: TrainerOptions,
        summary: SummaryWriter,
        checkpoints: CheckpointManager,
    ) -> Self {
        Self {
            learner,
            data,
            options,
            summary,
            checkpoints,
            start_epoch: 0,
        }
    }

    /// Wrapped learner
    pub fn learner(&self) -> &Learner<M> {
        &self.learner
    }

    /// Epoch the next `run` starts at
    pub fn start_epoch(&self) -> usize {
        self.start_epoch
    }

    /// Resume from the newest checkpoint; training continues after its epoch
    pub fn resume(&mut self, device: &Device) -> Result<Option<RestoredState>> {
        let restored = self.learner.restore_latest(&self.checkpoints, device)?;
        match restored {
            Some(state) => {
                self.start_epoch = state.epoch + 1;
                info!(
                    "Resuming at epoch {} (global step {})",
                    self.start_epoch + 1,
                    state.global_step
                );
            }
            None => info!("No checkpoint in {}, starting fresh", self.checkpoints.dir().display()),
        }
        Ok(restored)
    }

    /// Run the remaining epochs and return one summary per epoch
    pub fn run(&mut self) -> Result<Vec<EpochSummary>> {
        let TrainerOptions { epochs, batch_size, .. } = self.options;
        let steps_per_epoch = self
            .data
            .source_train
            .num_batches(batch_size, true)
            .min(self.data.server_train.num_batches(batch_size, true));
        if steps_per_epoch == 0 {
            warn!(
                "No full source/server batch pair (source {}, server {}, batch {}); epochs will not update the model",
                self.data.source_train.len(),
                self.data.server_train.len(),
                batch_size
            );
        }
        info!(
            "Training epochs {}..{} with {} steps per epoch",
            self.start_epoch + 1,
            epochs,
            steps_per_epoch
        );

        let mut history = Vec::with_capacity(epochs.saturating_sub(self.start_epoch));
        for epoch in self.start_epoch..epochs {
            let summary = self.run_epoch(epoch)?;
            info!(
                "Epoch {}/{}: ce {:.4} cm {:.4} orth {:.4} train {:.3} temporal {:.3} source {:.3} office {:.3} server {:.3} conference {:.3}",
                epoch + 1,
                epochs,
                summary.scalar("cross_entropy_loss").unwrap_or(0.0),
                summary.scalar("cm_cross_entropy_loss").unwrap_or(0.0),
                summary.scalar("orth_loss").unwrap_or(0.0),
                summary.scalar("source_train_acc").unwrap_or(0.0),
                summary.scalar("temporal_test_acc").unwrap_or(0.0),
                summary.scalar("source_test_acc").unwrap_or(0.0),
                summary.scalar("office_test_acc").unwrap_or(0.0),
                summary.scalar("server_test_acc").unwrap_or(0.0),
                summary.scalar("conference_test_acc").unwrap_or(0.0),
            );
            history.push(summary);

            if on_cadence(epoch, self.options.save_freq) {
                self.learner.save_checkpoint(&self.checkpoints, epoch)?;
            }
        }

        if let Some(last) = epochs.checked_sub(1) {
            let ran = self.start_epoch <= last;
            if ran && self.options.save_freq != 0 {
                self.learner.save_checkpoint(&self.checkpoints, last)?;
            }
        }
        self.summary.flush()?;
        self.start_epoch = self.start_epoch.max(epochs);
        Ok(history)
    }

    fn run_epoch(&mut self, epoch: usize) -> Result<EpochSummary> {
        let batch_size = self.options.batch_size;
        let m_anneal = anneal_margin(self.options.m, epoch, self.options.epochs, self.options.anneal);
        let mut train = TrainAccumulators::new();

        let source = self
            .data
            .source_train
            .batches(batch_size, true, Some(self.learner.rng_mut()))?;
        let server = self
            .data
            .server_train
            .batches(batch_size, true, Some(self.learner.rng_mut()))?;
        // Stops at the shorter of the two sequences.
        for (src, srv) in source.zip(server) {
            self.learner.train_step(&src?, &srv?, m_anneal, &mut train)?;
        }

        let log_images = on_cadence(epoch, self.options.log_images_freq);
        let mut test = Vec::with_capacity(Domain::EVALUATION_ORDER.len());
        for domain in Domain::EVALUATION_ORDER {
            let split = self.data.test_split(domain);
            let predictions = self.learner.predict(split, batch_size)?;
            let labels = split.class_indices()?;

            let mut accuracy = CategoricalAccuracy::default();
            accuracy.update_indices(&labels, &predictions);

            if log_images {
                let matrix = ConfusionMatrix::from_predictions(
                    &labels,
                    &predictions,
                    self.data.class_names.len(),
                )?;
                self.summary.confusion_matrix(
                    domain.confusion_tag(),
                    &matrix,
                    &self.data.class_names,
                    epoch,
                )?;
            }
            test.push((domain, accuracy));
        }

        let summary = EpochSummary::new(
            epoch,
            m_anneal,
            self.learner.optimizer().learning_rate(),
            &train,
            &test,
        );
        self.write_scalars(&summary)?;
        Ok(summary)
    }

    fn write_scalars(&mut self, summary: &EpochSummary) -> Result<()> {
        const ORDER: [&str; 9] = [
            "temporal_test_acc",
            "source_train_acc",
            "source_test_acc",
            "office_test_acc",
            "server_test_acc",
            "conference_test_acc",
            "cross_entropy_loss",
            "cm_cross_entropy_loss",
            "orth_loss",
        ];
        for tag in ORDER {
            let value = summary.scalar(tag).unwrap_or(0.0);
            self.summary.scalar(tag, value, summary.epoch)?;
        }
        Ok(())
    }
}

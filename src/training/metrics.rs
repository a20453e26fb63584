//! Running metrics for one epoch
//!
//! Accumulators are plain values: an epoch starts with a fresh
//! [`TrainAccumulators`] and ends by folding it into an [`EpochSummary`].

use std::collections::BTreeMap;

use candle_core::Tensor;
use serde::{Deserialize, Serialize};

use super::loss;
use crate::data::Domain;
use crate::error::{Error, Result};

/// Fraction of samples whose predicted class matches the label
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CategoricalAccuracy {
    correct: usize,
    total: usize,
}

impl CategoricalAccuracy {
    /// Accumulate a batch of labels and predictions
    pub fn update(&mut self, labels: &Tensor, predictions: &Tensor) -> Result<()> {
        self.correct += loss::correct_predictions(labels, predictions)?;
        self.total += labels.dims().first().copied().unwrap_or(0);
        Ok(())
    }

    /// Accumulate class indices directly
    pub fn update_indices(&mut self, labels: &[u32], predictions: &[u32]) {
        self.correct += labels.iter().zip(predictions).filter(|(l, p)| l == p).count();
        self.total += labels.len().min(predictions.len());
    }

    /// Accuracy so far; 0 before any update
    pub fn result(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.correct as f64 / self.total as f64
        }
    }

    /// Samples seen
    pub fn count(&self) -> usize {
        self.total
    }
}

/// Arithmetic mean of scalar observations
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Mean {
    sum: f64,
    count: usize,
}

impl Mean {
    /// Add one observation
    pub fn update(&mut self, value: f64) {
        self.sum += value;
        self.count += 1;
    }

    /// Mean so far; 0 before any update
    pub fn result(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.sum / self.count as f64
        }
    }

    /// Observations seen
    pub fn count(&self) -> usize {
        self.count
    }
}

/// Training-side accumulators of one epoch
#[derive(Debug, Clone, Default)]
pub struct TrainAccumulators {
    /// Source training accuracy
    pub source_train_acc: CategoricalAccuracy,
    /// Margin cross-entropy on source batches
    pub cross_entropy_loss: Mean,
    /// Cross-entropy on cutmix batches
    pub cm_cross_entropy_loss: Mean,
    /// Orthogonality loss
    pub orth_loss: Mean,
}

impl TrainAccumulators {
    /// Fresh accumulators
    pub fn new() -> Self {
        Self::default()
    }
}

/// Scalar losses of one training step
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StepLosses {
    /// Margin cross-entropy on the source batch
    pub cross_entropy: f64,
    /// Cross-entropy on the cutmix batch
    pub cm_cross_entropy: f64,
    /// Source plus server orthogonality loss
    pub orth: f64,
    /// Weighted total that was differentiated
    pub total: f64,
}

/// Everything logged for one finished epoch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpochSummary {
    /// Epoch index
    pub epoch: usize,
    /// Margin used during the epoch
    pub margin: f64,
    /// Learning rate after the last step of the epoch
    pub learning_rate: f64,
    /// Training steps taken during the epoch
    pub steps: usize,
    /// Scalar metrics keyed by tag
    pub scalars: BTreeMap<String, f64>,
}

impl EpochSummary {
    /// Fold the epoch's accumulators into a summary
    pub fn new(
        epoch: usize,
        margin: f64,
        learning_rate: f64,
        train: &TrainAccumulators,
        test: &[(Domain, CategoricalAccuracy)],
    ) -> Self {
        let mut scalars = BTreeMap::new();
        for (domain, accuracy) in test {
            scalars.insert(domain.accuracy_tag().to_string(), accuracy.result());
        }
        scalars.insert("source_train_acc".to_string(), train.source_train_acc.result());
        scalars.insert("cross_entropy_loss".to_string(), train.cross_entropy_loss.result());
        scalars.insert("cm_cross_entropy_loss".to_string(), train.cm_cross_entropy_loss.result());
        scalars.insert("orth_loss".to_string(), train.orth_loss.result());

        Self {
            epoch,
            margin,
            learning_rate,
            steps: train.cross_entropy_loss.count(),
            scalars,
        }
    }

    /// Value of a scalar tag
    pub fn scalar(&self, tag: &str) -> Option<f64> {
        self.scalars.get(tag).copied()
    }
}

/// Confusion counts; rows are true classes, columns predicted classes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfusionMatrix {
    counts: Vec<Vec<u64>>,
}

impl ConfusionMatrix {
    /// Count `(true, predicted)` pairs over `num_classes` classes
    pub fn from_predictions(y_true: &[u32], y_pred: &[u32], num_classes: usize) -> Result<Self> {
        if y_true.len() != y_pred.len() {
            return Err(Error::invalid_input(format!(
                "{} labels but {} predictions",
                y_true.len(),
                y_pred.len()
            )));
        }
        let mut counts = vec![vec![0u64; num_classes]; num_classes];
        for (&t, &p) in y_true.iter().zip(y_pred) {
            let (t, p) = (t as usize, p as usize);
            if t >= num_classes || p >= num_classes {
                return Err(Error::invalid_input(format!(
                    "class pair ({}, {}) outside {} classes",
                    t, p, num_classes
                )));
            }
            counts[t][p] += 1;
        }
        Ok(Self { counts })
    }

    /// Number of classes
    pub fn num_classes(&self) -> usize {
        self.counts.len()
    }

    /// Count of samples of class `truth` predicted as `predicted`
    pub fn get(&self, truth: usize, predicted: usize) -> u64 {
        self.counts
            .get(truth)
            .and_then(|row| row.get(predicted))
            .copied()
            .unwrap_or(0)
    }

    /// Rows of counts
    pub fn rows(&self) -> &[Vec<u64>] {
        &self.counts
    }

    /// Total number of samples
    pub fn total(&self) -> u64 {
        self.counts.iter().flatten().sum()
    }

    /// Largest single cell
    pub fn max_count(&self) -> u64 {
        self.counts.iter().flatten().copied().max().unwrap_or(0)
    }
}

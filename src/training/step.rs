//! Training and evaluation steps
//!
//! [`Learner`] owns the model, its variables, the optimizer and the random
//! state of one run. A training step consumes one source batch and one
//! server batch; an evaluation step only reads the model.

use candle_core::{Device, Tensor, D};
use candle_nn::ops::softmax;
use candle_nn::VarMap;
use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::{debug, instrument};

use super::checkpoints::{CheckpointInfo, CheckpointManager, RestoredState};
use super::loss;
use super::metrics::{StepLosses, TrainAccumulators};
use super::optimizers::{Adam, AdamConfig, Optimizer, PolynomialDecay, Scheduler};
use crate::config::RunConfig;
use crate::data::{Batch, CutMix, LabeledSplit};
use crate::error::Result;
use crate::model::Model;

/// Loss weights and optimisation settings of a [`Learner`]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LearnerConfig {
    /// Logit scale of the margin cross-entropy
    pub s: f64,
    /// Weight of the cutmix cross-entropy
    pub cm_lambda: f64,
    /// Weight of the orthogonality loss
    pub orth_lambda: f64,
    /// Beta prior of cutmix
    pub cutmix_alpha: f64,
    /// Seed of shuffling and cutmix
    pub seed: u64,
    /// Adam settings; the learning rate is the schedule's start
    pub adam: AdamConfig,
    /// Learning rate schedule over the global step
    pub schedule: PolynomialDecay,
}

impl LearnerConfig {
    /// Settings of a run over `num_source_train` labelled source samples
    pub fn from_run_config(config: &RunConfig, num_source_train: usize) -> Self {
        Self {
            s: config.s,
            cm_lambda: config.cm_lambda,
            orth_lambda: config.orth_lambda,
            cutmix_alpha: config.cutmix_alpha,
            seed: config.seed,
            adam: AdamConfig {
                learning_rate: config.init_lr,
                ..AdamConfig::default()
            },
            schedule: PolynomialDecay::for_training(
                config.init_lr,
                num_source_train,
                config.batch_size,
            ),
        }
    }
}

/// Model plus everything needed to train it
pub struct Learner<M: Model> {
    model: M,
    var_map: VarMap,
    optimizer: Adam,
    schedule: PolynomialDecay,
    cutmix: CutMix,
    rng: StdRng,
    s: f64,
    cm_lambda: f64,
    orth_lambda: f64,
    global_step: usize,
}

impl<M: Model> Learner<M> {
    /// Wrap `model`, whose parameters live in `var_map`
    pub fn new(model: M, var_map: VarMap, config: LearnerConfig) -> Result<Self> {
        Ok(Self {
            optimizer: Adam::new(&var_map, config.adam)?,
            cutmix: CutMix::new(config.cutmix_alpha)?,
            rng: StdRng::seed_from_u64(config.seed),
            schedule: config.schedule,
            s: config.s,
            cm_lambda: config.cm_lambda,
            orth_lambda: config.orth_lambda,
            global_step: 0,
            model,
            var_map,
        })
    }

    /// Wrapped model
    pub fn model(&self) -> &M {
        &self.model
    }

    /// Model variables
    pub fn var_map(&self) -> &VarMap {
        &self.var_map
    }

    /// Optimizer
    pub fn optimizer(&self) -> &Adam {
        &self.optimizer
    }

    /// Training steps taken so far
    pub fn global_step(&self) -> usize {
        self.global_step
    }

    /// Learning rate the next step will use
    pub fn next_learning_rate(&self) -> f64 {
        self.schedule.lr_at(self.global_step)
    }

    /// Random state used for shuffling and cutmix
    pub fn rng_mut(&mut self) -> &mut StdRng {
        &mut self.rng
    }

    /// Restart the random state from `seed`
    pub fn reseed(&mut self, seed: u64) {
        self.rng = StdRng::seed_from_u64(seed);
    }

    /// One optimisation step on a source batch and a server batch
    ///
    /// The server batch has no trusted labels: its orthogonality term groups
    /// samples by the arg-max of the model's own softmax output.
    #[instrument(level = "trace", skip_all, fields(step = self.global_step))]
    pub fn train_step(
        &mut self,
        source: &Batch,
        server: &Batch,
        m_anneal: f64,
        acc: &mut TrainAccumulators,
    ) -> Result<StepLosses> {
        let src = self.model.forward(&source.inputs, true)?;
        let ce = loss::margin_cross_entropy(&source.labels, &src.logits, m_anneal, self.s)?;

        let srv = self.model.forward(&server.inputs, true)?;
        let pseudo_labels = softmax(&srv.logits, D::Minus1)?;
        let orth = (loss::orthogonality_loss(&src.encodings, &source.labels)?
            + loss::orthogonality_loss(&srv.encodings, &pseudo_labels)?)?;

        let mixed = self.cutmix.apply(source, &mut self.rng)?;
        let mixed_out = self.model.forward(&mixed.inputs, true)?;
        let cm_ce = loss::cross_entropy(&mixed.labels, &mixed_out.logits)?;

        let total = ((&ce + (&cm_ce * self.cm_lambda)?)? + (&orth * self.orth_lambda)?)?;

        let grads = total.backward()?;
        let lr = self.schedule.lr_at(self.global_step);
        self.optimizer.set_learning_rate(lr);
        self.optimizer.step(&grads)?;
        self.global_step += 1;

        let losses = StepLosses {
            cross_entropy: scalar(&ce)?,
            cm_cross_entropy: scalar(&cm_ce)?,
            orth: scalar(&orth)?,
            total: scalar(&total)?,
        };

        let src_probs = softmax(&src.logits.detach(), D::Minus1)?;
        acc.source_train_acc.update(&source.labels, &src_probs)?;
        acc.cross_entropy_loss.update(losses.cross_entropy);
        acc.cm_cross_entropy_loss.update(losses.cm_cross_entropy);
        acc.orth_loss.update(losses.orth);

        debug!(
            "step {} lr {:.3e}: ce {:.4} cm {:.4} orth {:.4}",
            self.global_step, lr, losses.cross_entropy, losses.cm_cross_entropy, losses.orth
        );
        Ok(losses)
    }

    /// Softmax class probabilities `[batch, classes]` in inference mode
    pub fn test_step(&self, inputs: &Tensor) -> Result<Tensor> {
        let out = self.model.forward(inputs, false)?;
        Ok(softmax(&out.logits.detach(), D::Minus1)?)
    }

    /// Arg-max predictions over a whole split, in stored order
    pub fn predict(&self, split: &LabeledSplit, batch_size: usize) -> Result<Vec<u32>> {
        let mut predictions = Vec::with_capacity(split.len());
        for batch in split.batches::<StdRng>(batch_size, false, None)? {
            let probs = self.test_step(&batch?.inputs)?;
            predictions.extend(probs.argmax(D::Minus1)?.to_vec1::<u32>()?);
        }
        Ok(predictions)
    }

    /// Save model and optimizer state after `epoch`
    pub fn save_checkpoint(&self, manager: &CheckpointManager, epoch: usize) -> Result<CheckpointInfo> {
        manager.save(epoch, self.global_step, &self.var_map, &self.optimizer)
    }

    /// Resume from the newest checkpoint of `manager`, if any
    pub fn restore_latest(
        &mut self,
        manager: &CheckpointManager,
        device: &Device,
    ) -> Result<Option<RestoredState>> {
        let restored = manager.restore_latest(&mut self.var_map, &mut self.optimizer, device)?;
        if let Some(state) = restored {
            self.global_step = state.global_step;
        }
        Ok(restored)
    }
}

fn scalar(t: &Tensor) -> Result<f64> {
    Ok(t.to_dtype(candle_core::DType::F64)?.to_scalar::<f64>()?)
}

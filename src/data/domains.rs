//! Per-domain train/test splits
//!
//! The source recordings provide the labelled training split plus two test
//! splits: a held-out slice of the training days and the later,
//! time-shifted days. Server, conference and office recordings are separate
//! target domains split by recording day.

use std::fmt;
use std::path::Path;

use candle_core::Device;
use tracing::{info, warn};

use super::preprocess::{self, NormStats};
use super::{LabeledSplit, RawDataset};
use crate::config::RunConfig;
use crate::error::{Error, Result};

/// Days considered when balancing the source recordings
pub const BALANCE_DAYS: usize = 10;
/// Per (day, class) sample cap when balancing the source recordings
pub const BALANCE_MAX_PER_CLASS: usize = 95;
/// Fraction of the source training days held out for testing
pub const SOURCE_TEST_FRACTION: f64 = 0.10;
/// Seed of the source train/test split
pub const SOURCE_SPLIT_SEED: u64 = 42;

/// Evaluation domains
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Domain {
    /// Source recordings from days after the training window
    Temporal,
    /// Held-out source recordings from the training days
    Source,
    /// Office environment
    Office,
    /// Server-room environment
    Server,
    /// Conference-room environment
    Conference,
}

impl Domain {
    /// Order in which domains are evaluated every epoch
    pub const EVALUATION_ORDER: [Domain; 5] = [
        Domain::Temporal,
        Domain::Source,
        Domain::Office,
        Domain::Server,
        Domain::Conference,
    ];

    /// Scalar tag of the domain's test accuracy
    pub fn accuracy_tag(&self) -> &'static str {
        match self {
            Domain::Temporal => "temporal_test_acc",
            Domain::Source => "source_test_acc",
            Domain::Office => "office_test_acc",
            Domain::Server => "server_test_acc",
            Domain::Conference => "conference_test_acc",
        }
    }

    /// Image tag of the domain's confusion matrix
    pub fn confusion_tag(&self) -> &'static str {
        match self {
            Domain::Temporal => "Temporal Test Confusion Matrix",
            Domain::Source => "Source Test Confusion Matrix",
            Domain::Office => "Office Test Confusion Matrix",
            Domain::Server => "Server Test Confusion Matrix",
            Domain::Conference => "Conference Test Confusion Matrix",
        }
    }
}

impl fmt::Display for Domain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Domain::Temporal => "temporal",
            Domain::Source => "source",
            Domain::Office => "office",
            Domain::Server => "server",
            Domain::Conference => "conference",
        };
        f.write_str(name)
    }
}

/// Every split a training run consumes
#[derive(Debug, Clone)]
pub struct DomainSets {
    /// Class names in label-index order
    pub class_names: Vec<String>,
    /// Labelled source training split
    pub source_train: LabeledSplit,
    /// Server-domain training split
    pub server_train: LabeledSplit,
    /// Conference-domain training split
    pub conference_train: LabeledSplit,
    /// Time-shifted source test split
    pub temporal_test: LabeledSplit,
    /// Held-out source test split
    pub source_test: LabeledSplit,
    /// Office test split
    pub office_test: LabeledSplit,
    /// Server test split
    pub server_test: LabeledSplit,
    /// Conference test split
    pub conference_test: LabeledSplit,
}

impl DomainSets {
    /// Test split of `domain`
    pub fn test_split(&self, domain: Domain) -> &LabeledSplit {
        match domain {
            Domain::Temporal => &self.temporal_test,
            Domain::Source => &self.source_test,
            Domain::Office => &self.office_test,
            Domain::Server => &self.server_test,
            Domain::Conference => &self.conference_test,
        }
    }

    /// Per-sample shape `(C, H, W)` of the source training inputs
    pub fn input_shape(&self) -> Option<(usize, usize, usize)> {
        let dims = self.source_train.inputs()?.dims().to_vec();
        match dims.as_slice() {
            [_, c, h, w] => Some((*c, *h, *w)),
            _ => None,
        }
    }

    /// Load every domain from `<repo>/data/*.h5`
    pub fn load(config: &RunConfig, device: &Device) -> Result<Self> {
        let data_dir = config.dataset_dir();

        let raw = RawDataset::open(&data_dir.join("source_data.h5"))?;
        let raw = preprocess::balance(&raw, BALANCE_DAYS, BALANCE_MAX_PER_CLASS);
        let class_names = raw.class_names.clone();
        if class_names.len() != config.num_classes {
            return Err(Error::config(format!(
                "num_classes is {} but source data has {} classes",
                config.num_classes,
                class_names.len()
            )));
        }
        let num_classes = class_names.len();

        let source_days = config.train_source_days;
        let unlabeled_end = source_days + config.train_source_unlabeled_days;

        let source = raw.filter_days(|day| day < source_days);
        let (train_idx, test_idx) =
            preprocess::stratified_split(&source.labels, SOURCE_TEST_FRACTION, SOURCE_SPLIT_SEED);
        let source_train = source.select(&train_idx);
        let source_test = source.select(&test_idx);

        let later = raw.filter_days(|day| day >= source_days);
        let unlabeled = later.filter_days(|day| day < unlabeled_end);
        let temporal_test = raw.filter_days(|day| day >= unlabeled_end);

        let source_stats = NormStats::fit(&source_train)?;
        let temporal_stats = if unlabeled.is_empty() {
            source_stats.clone()
        } else {
            NormStats::fit(&unlabeled)?
        };

        info!(
            "Source: {} train, {} test, {} unlabeled, {} temporal test",
            source_train.len(),
            source_test.len(),
            unlabeled.len(),
            temporal_test.len()
        );

        let (conference_train, conference_test) = load_target(
            &data_dir.join("target_conf_data.h5"),
            &class_names,
            config.train_conference_days,
            &source_stats,
            device,
        )?;
        let (server_train, server_test) = load_target(
            &data_dir.join("target_server_data.h5"),
            &class_names,
            config.train_server_days,
            &source_stats,
            device,
        )?;
        let (_, office_test) = load_target(
            &data_dir.join("target_office_data.h5"),
            &class_names,
            0,
            &source_stats,
            device,
        )?;

        Ok(Self {
            source_train: preprocess::to_split(source_train, &source_stats, num_classes, device)?,
            source_test: preprocess::to_split(source_test, &source_stats, num_classes, device)?,
            temporal_test: preprocess::to_split(temporal_test, &temporal_stats, num_classes, device)?,
            server_train,
            server_test,
            conference_train,
            conference_test,
            office_test,
            class_names,
        })
    }
}

/// Load a target-domain file and split it at `train_days`
///
/// The training days define the normalisation statistics of both splits;
/// with no training days the source statistics are used instead.
pub fn load_target(
    path: &Path,
    source_classes: &[String],
    train_days: usize,
    source_stats: &NormStats,
    device: &Device,
) -> Result<(LabeledSplit, LabeledSplit)> {
    let raw = RawDataset::open(path)?.remap_classes(source_classes)?;
    split_target(raw, train_days, source_stats, source_classes.len(), device)
}

/// Day split and normalisation of an already loaded target domain
pub fn split_target(
    raw: RawDataset,
    train_days: usize,
    source_stats: &NormStats,
    num_classes: usize,
    device: &Device,
) -> Result<(LabeledSplit, LabeledSplit)> {
    let train = raw.filter_days(|day| day < train_days);
    let test = raw.filter_days(|day| day >= train_days);

    let stats = if train.is_empty() {
        if train_days > 0 {
            warn!("No target samples in the first {} days; using source statistics", train_days);
        }
        source_stats.clone()
    } else {
        NormStats::fit(&train)?
    };

    Ok((
        preprocess::to_split(train, &stats, num_classes, device)?,
        preprocess::to_split(test, &stats, num_classes, device)?,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array4;

    fn target(days: Vec<usize>, offset: f32) -> anyhow::Result<RawDataset> {
        let n = days.len();
        let x = Array4::from_shape_fn((n, 1, 1, 1), |(i, _, _, _)| i as f32 + offset);
        let labels = (0..n).map(|i| i % 2).collect();
        Ok(RawDataset::new(x, labels, days, vec!["a".into(), "b".into()])?)
    }

    #[test]
    fn evaluation_order_is_fixed() {
        let tags: Vec<_> = Domain::EVALUATION_ORDER.iter().map(|d| d.accuracy_tag()).collect();
        assert_eq!(
            tags,
            vec![
                "temporal_test_acc",
                "source_test_acc",
                "office_test_acc",
                "server_test_acc",
                "conference_test_acc"
            ]
        );
    }

    #[test]
    fn empty_target_training_falls_back_to_source_stats() -> anyhow::Result<()> {
        let source = target(vec![0, 0, 0, 0], 0.0)?;
        let source_stats = NormStats::fit(&source)?;

        let raw = target(vec![1, 1, 2], 100.0)?;
        let (train, test) = split_target(raw.clone(), 0, &source_stats, 2, &Device::Cpu)?;
        assert!(train.is_empty());
        assert_eq!(test.len(), 3);

        let mut expected = raw;
        source_stats.apply(&mut expected)?;
        let values = test
            .inputs()
            .ok_or_else(|| anyhow::anyhow!("missing inputs"))?
            .flatten_all()?
            .to_vec1::<f32>()?;
        let expected: Vec<f32> = expected.x.iter().copied().collect();
        assert_eq!(values, expected);
        Ok(())
    }

    #[test]
    fn target_training_days_define_statistics() -> anyhow::Result<()> {
        let source = target(vec![0, 0], 0.0)?;
        let source_stats = NormStats::fit(&source)?;

        let raw = target(vec![0, 0, 1, 1], 10.0)?;
        let (train, test) = split_target(raw, 1, &source_stats, 2, &Device::Cpu)?;
        assert_eq!(train.len(), 2);
        assert_eq!(test.len(), 2);

        let values = train
            .inputs()
            .ok_or_else(|| anyhow::anyhow!("missing inputs"))?
            .flatten_all()?
            .to_vec1::<f32>()?;
        assert_eq!(values, vec![0.0, 1.0]);
        Ok(())
    }
}

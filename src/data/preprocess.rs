//! Dataset balancing, splitting and normalisation

use std::collections::BTreeMap;

use candle_core::Device;
use ndarray::{Array3, Axis};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use tracing::debug;

use super::{LabeledSplit, RawDataset};
use crate::error::{Error, Result};

/// Cap every (day, class) cell at `max_per_class` samples, keeping days
/// `0..num_days` and the first samples of each cell in file order
pub fn balance(raw: &RawDataset, num_days: usize, max_per_class: usize) -> RawDataset {
    let mut taken: BTreeMap<(usize, usize), usize> = BTreeMap::new();
    let mut keep = Vec::with_capacity(raw.len());

    for (i, (&day, &label)) in raw.days.iter().zip(&raw.labels).enumerate() {
        if day >= num_days {
            continue;
        }
        let count = taken.entry((day, label)).or_insert(0);
        if *count < max_per_class {
            *count += 1;
            keep.push(i);
        }
    }

    debug!("Balanced dataset: kept {} of {} samples", keep.len(), raw.len());
    raw.select(&keep)
}

/// Stratified train/test split over class labels
///
/// Each class contributes `round(count * test_fraction)` samples to the test
/// side, at least one whenever the class has two or more samples. Returns
/// `(train_indices, test_indices)`, both sorted.
pub fn stratified_split(labels: &[usize], test_fraction: f64, seed: u64) -> (Vec<usize>, Vec<usize>) {
    let mut by_class: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
    for (i, &label) in labels.iter().enumerate() {
        by_class.entry(label).or_default().push(i);
    }

    let mut rng = StdRng::seed_from_u64(seed);
    let mut train = Vec::with_capacity(labels.len());
    let mut test = Vec::new();

    for (_, mut members) in by_class {
        members.shuffle(&mut rng);
        let mut n_test = (members.len() as f64 * test_fraction).round() as usize;
        if n_test == 0 && members.len() >= 2 && test_fraction > 0.0 {
            n_test = 1;
        }
        n_test = n_test.min(members.len().saturating_sub(1));
        test.extend_from_slice(&members[..n_test]);
        train.extend_from_slice(&members[n_test..]);
    }

    train.sort_unstable();
    test.sort_unstable();
    (train, test)
}

/// Mean-centring and min/peak-to-peak scaling statistics of a training split
#[derive(Debug, Clone, PartialEq)]
pub struct NormStats {
    /// Per-feature mean `[C, H, W]`
    pub mean: Array3<f32>,
    /// Global minimum of the centred data
    pub min: f32,
    /// Global peak-to-peak of the centred data
    pub ptp: f32,
}

impl NormStats {
    /// Fit statistics on `raw`
    pub fn fit(raw: &RawDataset) -> Result<Self> {
        let mean = raw
            .x
            .mean_axis(Axis(0))
            .ok_or_else(|| Error::data("cannot fit normalisation on an empty split"))?;

        let centered = &raw.x - &mean.view().insert_axis(Axis(0));
        let min = centered.iter().copied().fold(f32::INFINITY, f32::min);
        let max = centered.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        let ptp = if max > min { max - min } else { 1.0 };

        Ok(Self { mean, min, ptp })
    }

    /// Normalise `raw` in place
    pub fn apply(&self, raw: &mut RawDataset) -> Result<()> {
        if raw.is_empty() {
            return Ok(());
        }
        if raw.x.shape()[1..] != *self.mean.shape() {
            return Err(Error::data(format!(
                "sample shape {:?} does not match statistics shape {:?}",
                &raw.x.shape()[1..],
                self.mean.shape()
            )));
        }
        raw.x -= &self.mean.view().insert_axis(Axis(0));
        raw.x.mapv_inplace(|v| (v - self.min) / self.ptp);
        Ok(())
    }
}

/// Normalise `raw` with `stats` and move it onto `device`
pub fn to_split(
    mut raw: RawDataset,
    stats: &NormStats,
    num_classes: usize,
    device: &Device,
) -> Result<LabeledSplit> {
    if raw.is_empty() {
        return Ok(LabeledSplit::empty(num_classes));
    }
    stats.apply(&mut raw)?;

    let shape = raw.x.shape();
    let shape = [shape[0], shape[1], shape[2], shape[3]];
    let values = raw.x.as_standard_layout().iter().copied().collect();
    LabeledSplit::from_parts(values, shape, &raw.labels, num_classes, device)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::Array4;

    fn raw(labels: Vec<usize>, days: Vec<usize>) -> anyhow::Result<RawDataset> {
        let n = labels.len();
        let x = Array4::from_shape_fn((n, 1, 1, 2), |(i, _, _, w)| (i * 2 + w) as f32);
        Ok(RawDataset::new(x, labels, days, vec!["a".into(), "b".into()])?)
    }

    #[test]
    fn balance_caps_each_day_class_cell() -> anyhow::Result<()> {
        let data = raw(vec![0, 0, 0, 1, 0, 0], vec![0, 0, 0, 0, 1, 11])?;
        let balanced = balance(&data, 10, 2);
        assert_eq!(balanced.labels, vec![0, 0, 1, 0]);
        assert_eq!(balanced.days, vec![0, 0, 0, 1]);
        Ok(())
    }

    #[test]
    fn stratified_split_keeps_every_class_in_test() {
        let labels: Vec<usize> = (0..40).map(|i| i % 4).collect();
        let (train, test) = stratified_split(&labels, 0.1, 42);
        assert_eq!(train.len() + test.len(), 40);
        for class in 0..4 {
            assert!(test.iter().any(|&i| labels[i] == class));
        }
        assert!(train.iter().all(|i| !test.contains(i)));
    }

    #[test]
    fn stratified_split_is_deterministic() {
        let labels: Vec<usize> = (0..30).map(|i| i % 3).collect();
        assert_eq!(stratified_split(&labels, 0.1, 42), stratified_split(&labels, 0.1, 42));
    }

    #[test]
    fn normalised_training_data_spans_unit_interval() -> anyhow::Result<()> {
        let mut data = raw(vec![0, 1, 0, 1], vec![0; 4])?;
        let stats = NormStats::fit(&data)?;
        stats.apply(&mut data)?;
        let min = data.x.iter().copied().fold(f32::INFINITY, f32::min);
        let max = data.x.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        assert_relative_eq!(min, 0.0, epsilon = 1e-6);
        assert_relative_eq!(max, 1.0, epsilon = 1e-6);
        Ok(())
    }

    #[test]
    fn fit_on_empty_split_fails() -> anyhow::Result<()> {
        let data = raw(vec![], vec![])?;
        assert!(NormStats::fit(&data).is_err());
        Ok(())
    }
}

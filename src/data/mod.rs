//! Dataset ingestion and batching
//!
//! Raw `.h5` recordings are loaded by [`h5`], cleaned up by [`preprocess`]
//! and assembled into the per-domain train/test splits by [`domains`].
//! Every split ends up as a [`LabeledSplit`] of device tensors that hands out
//! [`Batch`]es.

pub mod cutmix;
pub mod domains;
pub mod h5;
pub mod preprocess;

pub use cutmix::CutMix;
pub use domains::{Domain, DomainSets};
pub use h5::RawDataset;
pub use preprocess::NormStats;

use candle_core::{Device, Tensor, D};
use rand::seq::SliceRandom;
use rand::Rng;

use crate::error::{Error, Result};

/// One mini-batch of inputs and (one-hot or soft) labels
#[derive(Debug, Clone)]
pub struct Batch {
    /// Inputs `[batch, channels, height, width]`
    pub inputs: Tensor,
    /// Labels `[batch, num_classes]`
    pub labels: Tensor,
}

impl Batch {
    /// Number of samples
    pub fn len(&self) -> usize {
        self.inputs.dims().first().copied().unwrap_or(0)
    }

    /// Whether the batch holds no samples
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A whole split held in memory as `x[N,C,H,W]` and one-hot `y[N,K]`
#[derive(Debug, Clone)]
pub struct LabeledSplit {
    x: Option<Tensor>,
    y: Option<Tensor>,
    len: usize,
    num_classes: usize,
}

impl LabeledSplit {
    /// Build a split from dense NCHW inputs and class indices
    pub fn from_parts(
        inputs: Vec<f32>,
        shape: [usize; 4],
        classes: &[usize],
        num_classes: usize,
        device: &Device,
    ) -> Result<Self> {
        let [n, c, h, w] = shape;
        if inputs.len() != n * c * h * w {
            return Err(Error::data(format!(
                "input buffer has {} values, shape {:?} needs {}",
                inputs.len(),
                shape,
                n * c * h * w
            )));
        }
        if classes.len() != n {
            return Err(Error::data(format!(
                "{} labels for {} samples",
                classes.len(),
                n
            )));
        }
        if let Some(bad) = classes.iter().find(|&&class| class >= num_classes) {
            return Err(Error::data(format!(
                "class index {} out of range for {} classes",
                bad, num_classes
            )));
        }

        if n == 0 {
            return Ok(Self::empty(num_classes));
        }

        let mut one_hot = vec![0f32; n * num_classes];
        for (row, &class) in classes.iter().enumerate() {
            one_hot[row * num_classes + class] = 1.0;
        }

        Ok(Self {
            x: Some(Tensor::from_vec(inputs, (n, c, h, w), device)?),
            y: Some(Tensor::from_vec(one_hot, (n, num_classes), device)?),
            len: n,
            num_classes,
        })
    }

    /// A split with no samples
    pub fn empty(num_classes: usize) -> Self {
        Self {
            x: None,
            y: None,
            len: 0,
            num_classes,
        }
    }

    /// Number of samples
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the split holds no samples
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Label cardinality
    pub fn num_classes(&self) -> usize {
        self.num_classes
    }

    /// Input tensor of the whole split
    pub fn inputs(&self) -> Option<&Tensor> {
        self.x.as_ref()
    }

    /// Class index of every sample, in stored order
    pub fn class_indices(&self) -> Result<Vec<u32>> {
        match &self.y {
            Some(y) => Ok(y.argmax(D::Minus1)?.to_vec1::<u32>()?),
            None => Ok(Vec::new()),
        }
    }

    /// Number of batches `batches` yields for this split
    pub fn num_batches(&self, batch_size: usize, drop_remainder: bool) -> usize {
        if batch_size == 0 {
            return 0;
        }
        if drop_remainder {
            self.len / batch_size
        } else {
            self.len.div_ceil(batch_size)
        }
    }

    /// Iterate over mini-batches
    ///
    /// With `shuffle` the sample order is drawn from `rng` once per call;
    /// without it batches follow the stored order, which keeps evaluation
    /// reproducible.
    pub fn batches<R: Rng + ?Sized>(
        &self,
        batch_size: usize,
        drop_remainder: bool,
        shuffle: Option<&mut R>,
    ) -> Result<BatchIter> {
        let (x, y) = match (&self.x, &self.y) {
            (Some(x), Some(y)) if batch_size > 0 => (x, y),
            _ => return Ok(BatchIter::exhausted()),
        };

        let (x, y) = match shuffle {
            Some(rng) => {
                let mut order: Vec<u32> = (0..self.len as u32).collect();
                order.shuffle(rng);
                let ids = Tensor::from_vec(order, self.len, x.device())?;
                (x.index_select(&ids, 0)?, y.index_select(&ids, 0)?)
            }
            None => (x.clone(), y.clone()),
        };

        Ok(BatchIter {
            x: Some(x),
            y: Some(y),
            cursor: 0,
            remaining: self.num_batches(batch_size, drop_remainder),
            batch_size,
            len: self.len,
        })
    }

    /// Rows selected by `indices`, as a new split
    pub fn select(&self, indices: &[u32]) -> Result<Self> {
        match (&self.x, &self.y) {
            (Some(x), Some(y)) if !indices.is_empty() => {
                let ids = Tensor::from_slice(indices, indices.len(), x.device())?;
                Ok(Self {
                    x: Some(x.index_select(&ids, 0)?),
                    y: Some(y.index_select(&ids, 0)?),
                    len: indices.len(),
                    num_classes: self.num_classes,
                })
            }
            _ => Ok(Self::empty(self.num_classes)),
        }
    }
}

/// Iterator over the batches of a [`LabeledSplit`]
pub struct BatchIter {
    x: Option<Tensor>,
    y: Option<Tensor>,
    cursor: usize,
    remaining: usize,
    batch_size: usize,
    len: usize,
}

impl BatchIter {
    fn exhausted() -> Self {
        Self {
            x: None,
            y: None,
            cursor: 0,
            remaining: 0,
            batch_size: 0,
            len: 0,
        }
    }
}

impl Iterator for BatchIter {
    type Item = Result<Batch>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        let (x, y) = match (&self.x, &self.y) {
            (Some(x), Some(y)) => (x, y),
            _ => return None,
        };

        let take = self.batch_size.min(self.len - self.cursor);
        let start = self.cursor;
        self.cursor += take;
        self.remaining -= 1;

        let batch = x
            .narrow(0, start, take)
            .and_then(|inputs| Ok(Batch { inputs, labels: y.narrow(0, start, take)? }))
            .map_err(Error::from);
        Some(batch)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.remaining, Some(self.remaining))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn split(n: usize) -> anyhow::Result<LabeledSplit> {
        let inputs: Vec<f32> = (0..n * 4).map(|v| v as f32).collect();
        let classes: Vec<usize> = (0..n).map(|i| i % 2).collect();
        Ok(LabeledSplit::from_parts(inputs, [n, 1, 2, 2], &classes, 2, &Device::Cpu)?)
    }

    #[test]
    fn ordered_batches_keep_remainder() -> anyhow::Result<()> {
        let split = split(5)?;
        let sizes: Vec<usize> = split
            .batches::<StdRng>(2, false, None)?
            .map(|b| b.map(|b| b.len()))
            .collect::<Result<_>>()?;
        assert_eq!(sizes, vec![2, 2, 1]);
        Ok(())
    }

    #[test]
    fn shuffled_batches_drop_remainder() -> anyhow::Result<()> {
        let split = split(5)?;
        let mut rng = StdRng::seed_from_u64(7);
        let batches: Vec<Batch> = split.batches(2, true, Some(&mut rng))?.collect::<Result<_>>()?;
        assert_eq!(batches.len(), 2);
        assert!(batches.iter().all(|b| b.len() == 2));
        Ok(())
    }

    #[test]
    fn empty_split_yields_nothing() -> anyhow::Result<()> {
        let split = LabeledSplit::empty(3);
        assert_eq!(split.batches::<StdRng>(4, false, None)?.count(), 0);
        assert!(split.class_indices()?.is_empty());
        Ok(())
    }

    #[test]
    fn rejects_out_of_range_labels() {
        let result = LabeledSplit::from_parts(vec![0.0; 4], [1, 1, 2, 2], &[3], 2, &Device::Cpu);
        assert!(result.is_err());
    }
}

//! HDF5 recording loader
//!
//! A recording file holds three datasets:
//!
//! - `X_data`: `f32` samples, either `[N, H, W, C]` or `[N, H, W]`
//! - `y_data`: integer `[N, 2]` rows of `(class index, recording day)`
//! - `classes`: class names, indexed by the class column of `y_data`

use std::path::Path;

use hdf5::types::{VarLenAscii, VarLenUnicode};
use ndarray::{Array4, Axis, Ix2};
use tracing::{debug, info, instrument};

use crate::error::{Error, Result};

/// Samples of one recording file, converted to channel-first layout
#[derive(Debug, Clone)]
pub struct RawDataset {
    /// Samples `[N, C, H, W]`
    pub x: Array4<f32>,
    /// Class index per sample
    pub labels: Vec<usize>,
    /// Recording day per sample
    pub days: Vec<usize>,
    /// Class names
    pub class_names: Vec<String>,
}

impl RawDataset {
    /// Assemble a dataset from in-memory parts
    pub fn new(
        x: Array4<f32>,
        labels: Vec<usize>,
        days: Vec<usize>,
        class_names: Vec<String>,
    ) -> Result<Self> {
        let n = x.len_of(Axis(0));
        if labels.len() != n || days.len() != n {
            return Err(Error::data(format!(
                "{} samples but {} labels and {} days",
                n,
                labels.len(),
                days.len()
            )));
        }
        Ok(Self {
            x,
            labels,
            days,
            class_names,
        })
    }

    /// Read a recording file
    #[instrument]
    pub fn open(path: &Path) -> Result<Self> {
        let file = hdf5::File::open(path)
            .map_err(|e| Error::data(format!("cannot open {}: {}", path.display(), e)))?;

        let raw = file.dataset("X_data")?.read_dyn::<f32>()?;
        let x = match raw.ndim() {
            4 => raw
                .into_dimensionality::<ndarray::Ix4>()
                .map_err(|e| Error::data(e.to_string()))?
                .permuted_axes([0, 3, 1, 2])
                .as_standard_layout()
                .into_owned(),
            3 => raw
                .insert_axis(Axis(1))
                .into_dimensionality::<ndarray::Ix4>()
                .map_err(|e| Error::data(e.to_string()))?,
            n => {
                return Err(Error::data(format!(
                    "X_data in {} has rank {}, expected 3 or 4",
                    path.display(),
                    n
                )))
            }
        };

        let y = file
            .dataset("y_data")?
            .read_dyn::<i64>()?
            .into_dimensionality::<Ix2>()
            .map_err(|e| Error::data(format!("y_data: {}", e)))?;
        if y.ncols() < 2 {
            return Err(Error::data("y_data needs (class, day) columns"));
        }
        let to_index = |v: i64| {
            usize::try_from(v).map_err(|_| Error::data(format!("negative label value {}", v)))
        };
        let labels = y.column(0).iter().map(|&v| to_index(v)).collect::<Result<Vec<_>>>()?;
        let days = y.column(1).iter().map(|&v| to_index(v)).collect::<Result<Vec<_>>>()?;

        let class_names = read_class_names(&file)?;
        debug!("X_data shape {:?}, {} classes", x.shape(), class_names.len());

        let dataset = Self::new(x, labels, days, class_names)?;
        info!("Loaded {} samples from {}", dataset.len(), path.display());
        Ok(dataset)
    }

    /// Number of samples
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    /// Whether the dataset holds no samples
    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    /// Per-sample shape `(C, H, W)`
    pub fn sample_shape(&self) -> (usize, usize, usize) {
        let shape = self.x.shape();
        (shape[1], shape[2], shape[3])
    }

    /// Samples at `indices`, in that order
    pub fn select(&self, indices: &[usize]) -> Self {
        Self {
            x: self.x.select(Axis(0), indices),
            labels: indices.iter().map(|&i| self.labels[i]).collect(),
            days: indices.iter().map(|&i| self.days[i]).collect(),
            class_names: self.class_names.clone(),
        }
    }

    /// Samples whose recording day satisfies `keep`
    pub fn filter_days(&self, keep: impl Fn(usize) -> bool) -> Self {
        let indices: Vec<usize> = (0..self.len()).filter(|&i| keep(self.days[i])).collect();
        self.select(&indices)
    }

    /// Re-index labels onto `reference` class names
    pub fn remap_classes(mut self, reference: &[String]) -> Result<Self> {
        let mapping = self
            .class_names
            .iter()
            .map(|name| {
                reference
                    .iter()
                    .position(|r| r == name)
                    .ok_or_else(|| Error::data(format!("class '{}' not present in source classes", name)))
            })
            .collect::<Result<Vec<_>>>()?;

        for label in &mut self.labels {
            *label = *mapping
                .get(*label)
                .ok_or_else(|| Error::data(format!("label {} has no class name", label)))?;
        }
        self.class_names = reference.to_vec();
        Ok(self)
    }
}

fn read_class_names(file: &hdf5::File) -> Result<Vec<String>> {
    let dataset = file.dataset("classes")?;
    if let Ok(names) = dataset.read_1d::<VarLenUnicode>() {
        return Ok(names.iter().map(|s| s.as_str().to_string()).collect());
    }
    let names = dataset.read_1d::<VarLenAscii>()?;
    Ok(names.iter().map(|s| s.as_str().to_string()).collect())
}

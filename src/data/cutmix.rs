//! CutMix augmentation
//!
//! A rectangular patch from a randomly paired sample is pasted into every
//! input and the labels are mixed by the area that stayed untouched.

use candle_core::{DType, Tensor};
use rand::seq::SliceRandom;
use rand::Rng;
use rand_distr::{Beta, Distribution};

use super::Batch;
use crate::error::{Error, Result};

/// CutMix with a `Beta(alpha, alpha)` mixing prior
#[derive(Debug, Clone)]
pub struct CutMix {
    beta: Beta<f64>,
    alpha: f64,
}

/// Patch sampled for one batch
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CutMixBox {
    /// Fraction of each image kept from the original sample
    pub lambda: f64,
    /// First row of the patch
    pub y1: usize,
    /// One past the last row of the patch
    pub y2: usize,
    /// First column of the patch
    pub x1: usize,
    /// One past the last column of the patch
    pub x2: usize,
}

impl CutMix {
    /// Create a CutMix sampler
    pub fn new(alpha: f64) -> Result<Self> {
        let beta = Beta::new(alpha, alpha)
            .map_err(|e| Error::invalid_input(format!("cutmix alpha {}: {}", alpha, e)))?;
        Ok(Self { beta, alpha })
    }

    /// Shape parameter of the Beta prior
    pub fn alpha(&self) -> f64 {
        self.alpha
    }

    /// Sample a patch for `height x width` images
    pub fn sample_box<R: Rng + ?Sized>(&self, height: usize, width: usize, rng: &mut R) -> CutMixBox {
        let lambda = self.beta.sample(rng);
        let ratio = (1.0 - lambda).sqrt();
        let cut_h = (height as f64 * ratio) as usize;
        let cut_w = (width as f64 * ratio) as usize;

        let cy = rng.random_range(0..height);
        let cx = rng.random_range(0..width);

        let y1 = cy.saturating_sub(cut_h / 2);
        let y2 = (cy + cut_h / 2).min(height);
        let x1 = cx.saturating_sub(cut_w / 2);
        let x2 = (cx + cut_w / 2).min(width);

        let area = ((y2 - y1) * (x2 - x1)) as f64;
        CutMixBox {
            lambda: 1.0 - area / (height * width) as f64,
            y1,
            y2,
            x1,
            x2,
        }
    }

    /// Mix a batch: every sample receives a patch from a random partner and
    /// its label becomes `lambda * own + (1 - lambda) * partner`
    pub fn apply<R: Rng + ?Sized>(&self, batch: &Batch, rng: &mut R) -> Result<Batch> {
        let (n, _, height, width) = batch.inputs.dims4()?;
        if n == 0 || height == 0 || width == 0 {
            return Ok(batch.clone());
        }
        let device = batch.inputs.device();

        let mut partners: Vec<u32> = (0..n as u32).collect();
        partners.shuffle(rng);
        let partners = Tensor::from_vec(partners, n, device)?;
        let partner_inputs = batch.inputs.index_select(&partners, 0)?;
        let partner_labels = batch.labels.index_select(&partners, 0)?;

        let patch = self.sample_box(height, width, rng);
        let mut mask = vec![0f32; height * width];
        for y in patch.y1..patch.y2 {
            for x in patch.x1..patch.x2 {
                mask[y * width + x] = 1.0;
            }
        }
        let mask = Tensor::from_vec(mask, (1, 1, height, width), device)?
            .to_dtype(batch.inputs.dtype())?;
        let keep = mask.affine(-1.0, 1.0)?;

        let inputs = (batch.inputs.broadcast_mul(&keep)? + partner_inputs.broadcast_mul(&mask)?)?;
        let labels = ((batch.labels.to_dtype(DType::F32)? * patch.lambda)?
            + (partner_labels.to_dtype(DType::F32)? * (1.0 - patch.lambda))?)?;

        Ok(Batch { inputs, labels })
    }
}

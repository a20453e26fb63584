//! Classifier models
//!
//! The training loop only sees the [`Model`] trait: one forward pass that
//! returns class logits together with the encodings they were computed from.
//! [`ResNetAmca`] is the default residual backbone with a cosine classifier
//! head.

pub mod resnet;

pub use resnet::{ResNetAmca, ResNetAmcaConfig};

use std::fmt;

use candle_core::{Tensor, D};
use clap::ValueEnum;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Output of a single forward pass
#[derive(Debug, Clone)]
pub struct ModelOutput {
    /// Class logits `[batch, num_classes]`
    pub logits: Tensor,
    /// Encodings `[batch, num_features]`
    pub encodings: Tensor,
}

/// A classifier whose parameters live in a `candle_nn::VarMap`
pub trait Model {
    /// Run the model; `train` enables training-only behaviour such as
    /// batch-norm statistic updates.
    fn forward(&self, xs: &Tensor, train: bool) -> Result<ModelOutput>;

    /// Model name for logs
    fn name(&self) -> &str {
        "model"
    }
}

/// Backbone activation
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Activation {
    /// Scaled exponential linear unit
    Selu,
    /// Exponential linear unit
    Elu,
    /// Rectified linear unit
    Relu,
    /// Gaussian error linear unit
    Gelu,
    /// Sigmoid linear unit
    Silu,
}

const SELU_ALPHA: f64 = 1.673_263_242_354_377_3;
const SELU_SCALE: f64 = 1.050_700_987_355_480_5;

impl Activation {
    /// Apply the activation element-wise
    pub fn apply(&self, xs: &Tensor) -> Result<Tensor> {
        let ys = match self {
            Activation::Selu => (xs.elu(SELU_ALPHA)? * SELU_SCALE)?,
            Activation::Elu => xs.elu(1.0)?,
            Activation::Relu => xs.relu()?,
            Activation::Gelu => xs.gelu()?,
            Activation::Silu => xs.silu()?,
        };
        Ok(ys)
    }
}

impl fmt::Display for Activation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Activation::Selu => "selu",
            Activation::Elu => "elu",
            Activation::Relu => "relu",
            Activation::Gelu => "gelu",
            Activation::Silu => "silu",
        };
        f.write_str(name)
    }
}

/// Scale each row of `xs` to unit L2 norm
pub fn l2_normalize(xs: &Tensor) -> Result<Tensor> {
    let norm = (xs.sqr()?.sum_keepdim(D::Minus1)? + 1e-12)?.sqrt()?;
    Ok(xs.broadcast_div(&norm)?)
}

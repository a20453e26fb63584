//! Residual backbone with an additive-margin cosine head

use candle_core::{Module, ModuleT, Tensor};
use candle_nn::{BatchNorm, BatchNormConfig, Conv2d, Conv2dConfig, Linear, VarBuilder};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{l2_normalize, Activation, Model, ModelOutput};
use crate::error::{Error, Result};

/// Shape and width of a [`ResNetAmca`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResNetAmcaConfig {
    /// Input channels
    pub in_channels: usize,
    /// Number of classes
    pub num_classes: usize,
    /// Encoding dimension
    pub num_features: usize,
    /// Filters of the first stage; later stages double it
    pub num_filters: usize,
    /// Activation used after every normalisation
    pub activation: Activation,
}

fn bn_config() -> BatchNormConfig {
    BatchNormConfig {
        eps: 1e-3,
        momentum: 0.01,
        ..Default::default()
    }
}

struct ResidualBlock {
    conv1: Conv2d,
    bn1: BatchNorm,
    conv2: Conv2d,
    bn2: BatchNorm,
    shortcut: Option<(Conv2d, BatchNorm)>,
    activation: Activation,
}

impl ResidualBlock {
    fn new(
        in_channels: usize,
        out_channels: usize,
        stride: usize,
        activation: Activation,
        vb: VarBuilder,
    ) -> Result<Self> {
        let conv3 = |stride| Conv2dConfig {
            padding: 1,
            stride,
            ..Default::default()
        };
        let conv1 = candle_nn::conv2d_no_bias(in_channels, out_channels, 3, conv3(stride), vb.pp("conv1"))?;
        let bn1 = candle_nn::batch_norm(out_channels, bn_config(), vb.pp("bn1"))?;
        let conv2 = candle_nn::conv2d_no_bias(out_channels, out_channels, 3, conv3(1), vb.pp("conv2"))?;
        let bn2 = candle_nn::batch_norm(out_channels, bn_config(), vb.pp("bn2"))?;

        let shortcut = if stride != 1 || in_channels != out_channels {
            let cfg = Conv2dConfig {
                stride,
                ..Default::default()
            };
            let conv = candle_nn::conv2d_no_bias(in_channels, out_channels, 1, cfg, vb.pp("shortcut_conv"))?;
            let bn = candle_nn::batch_norm(out_channels, bn_config(), vb.pp("shortcut_bn"))?;
            Some((conv, bn))
        } else {
            None
        };

        Ok(Self {
            conv1,
            bn1,
            conv2,
            bn2,
            shortcut,
            activation,
        })
    }

    fn forward(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        let ys = self.bn1.forward_t(&self.conv1.forward(xs)?, train)?;
        let ys = self.activation.apply(&ys)?;
        let ys = self.bn2.forward_t(&self.conv2.forward(&ys)?, train)?;

        let residual = match &self.shortcut {
            Some((conv, bn)) => bn.forward_t(&conv.forward(xs)?, train)?,
            None => xs.clone(),
        };
        self.activation.apply(&(ys + residual)?)
    }
}

/// Three-stage residual network producing L2-normalised encodings and
/// cosine-similarity logits in `[-1, 1]`
pub struct ResNetAmca {
    stem: Conv2d,
    stem_bn: BatchNorm,
    blocks: Vec<ResidualBlock>,
    embedding: Linear,
    class_weights: Tensor,
    config: ResNetAmcaConfig,
}

impl ResNetAmca {
    /// Build the network, registering its parameters in `vb`
    pub fn new(config: ResNetAmcaConfig, vb: VarBuilder) -> Result<Self> {
        if config.num_classes == 0 || config.num_features == 0 || config.num_filters == 0 {
            return Err(Error::model("ResNetAmca dimensions must be > 0"));
        }

        let f = config.num_filters;
        let stem_cfg = Conv2dConfig {
            padding: 1,
            ..Default::default()
        };
        let stem = candle_nn::conv2d_no_bias(config.in_channels, f, 3, stem_cfg, vb.pp("stem"))?;
        let stem_bn = candle_nn::batch_norm(f, bn_config(), vb.pp("stem_bn"))?;

        let blocks = vec![
            ResidualBlock::new(f, f, 1, config.activation, vb.pp("block1"))?,
            ResidualBlock::new(f, 2 * f, 2, config.activation, vb.pp("block2"))?,
            ResidualBlock::new(2 * f, 4 * f, 2, config.activation, vb.pp("block3"))?,
        ];

        let embedding = candle_nn::linear(4 * f, config.num_features, vb.pp("embedding"))?;
        let class_weights = vb.pp("amca").get_with_hints(
            (config.num_classes, config.num_features),
            "weight",
            candle_nn::init::DEFAULT_KAIMING_NORMAL,
        )?;

        debug!(
            "Built ResNetAmca: in_channels={}, filters={}, features={}, classes={}",
            config.in_channels, f, config.num_features, config.num_classes
        );

        Ok(Self {
            stem,
            stem_bn,
            blocks,
            embedding,
            class_weights,
            config,
        })
    }

    /// Model configuration
    pub fn config(&self) -> &ResNetAmcaConfig {
        &self.config
    }
}

impl Model for ResNetAmca {
    fn forward(&self, xs: &Tensor, train: bool) -> Result<ModelOutput> {
        let (_, channels, _, _) = xs.dims4()?;
        if channels != self.config.in_channels {
            return Err(Error::model(format!(
                "expected {} input channels, got {}",
                self.config.in_channels, channels
            )));
        }

        let mut ys = self.stem_bn.forward_t(&self.stem.forward(xs)?, train)?;
        ys = self.config.activation.apply(&ys)?;
        for block in &self.blocks {
            ys = block.forward(&ys, train)?;
        }

        // Global average pooling over height and width.
        let pooled = ys.mean(3)?.mean(2)?;
        let encodings = l2_normalize(&self.embedding.forward(&pooled)?)?;

        let weights = l2_normalize(&self.class_weights)?;
        let logits = encodings.matmul(&weights.t()?)?;

        Ok(ModelOutput { logits, encodings })
    }

    fn name(&self) -> &str {
        "resnet_amca"
    }
}

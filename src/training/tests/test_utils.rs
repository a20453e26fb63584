//! Common utilities for testing the training pipeline

use anyhow::Result;
use candle_core::{DType, Device, Tensor};
use candle_nn::{VarBuilder, VarMap};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::data::{Batch, DomainSets, LabeledSplit};
use crate::model::{Activation, ResNetAmca, ResNetAmcaConfig};
use crate::training::{AdamConfig, LearnerConfig, PolynomialDecay};

/// Classes of the synthetic task
pub const NUM_CLASSES: usize = 3;
/// Synthetic input shape `(C, H, W)`
pub const INPUT_SHAPE: (usize, usize, usize) = (1, 8, 8);

/// Create a test device (CPU for CI compatibility)
pub fn create_test_device() -> Device {
    Device::Cpu
}

/// A small ResNet-AMCA and the variables it registered
pub fn create_test_model(device: &Device) -> Result<(ResNetAmca, VarMap)> {
    let var_map = VarMap::new();
    let vb = VarBuilder::from_varmap(&var_map, DType::F32, device);
    let config = ResNetAmcaConfig {
        in_channels: INPUT_SHAPE.0,
        num_classes: NUM_CLASSES,
        num_features: 8,
        num_filters: 4,
        activation: Activation::Selu,
    };
    Ok((ResNetAmca::new(config, vb)?, var_map))
}

/// Learner settings with a fixed schedule horizon
pub fn create_test_learner_config(seed: u64) -> LearnerConfig {
    LearnerConfig {
        s: 10.0,
        cm_lambda: 0.1,
        orth_lambda: 0.1,
        cutmix_alpha: 1.0,
        seed,
        adam: AdamConfig::default(),
        schedule: PolynomialDecay::new(1e-3, 100),
    }
}

/// `n` samples whose class shifts the mean of every pixel
pub fn synthetic_split(n: usize, seed: u64, device: &Device) -> Result<LabeledSplit> {
    let (c, h, w) = INPUT_SHAPE;
    let mut rng = StdRng::seed_from_u64(seed);
    let classes: Vec<usize> = (0..n).map(|i| i % NUM_CLASSES).collect();
    let mut inputs = Vec::with_capacity(n * c * h * w);
    for &class in &classes {
        for _ in 0..c * h * w {
            inputs.push(class as f32 * 0.3 + rng.random::<f32>() * 0.1);
        }
    }
    Ok(LabeledSplit::from_parts(inputs, [n, c, h, w], &classes, NUM_CLASSES, device)?)
}

/// First `n` samples of a synthetic split as one batch
pub fn synthetic_batch(n: usize, seed: u64, device: &Device) -> Result<Batch> {
    let split = synthetic_split(n, seed, device)?;
    split
        .batches::<StdRng>(n, false, None)?
        .next()
        .ok_or_else(|| anyhow::anyhow!("empty synthetic split"))?
        .map_err(anyhow::Error::from)
}

/// Every domain filled with small synthetic splits
pub fn create_test_domains(device: &Device) -> Result<DomainSets> {
    Ok(DomainSets {
        class_names: (0..NUM_CLASSES).map(|i| format!("gesture_{}", i)).collect(),
        source_train: synthetic_split(12, 1, device)?,
        server_train: synthetic_split(8, 2, device)?,
        conference_train: LabeledSplit::empty(NUM_CLASSES),
        temporal_test: synthetic_split(5, 3, device)?,
        source_test: synthetic_split(4, 4, device)?,
        office_test: synthetic_split(6, 5, device)?,
        server_test: synthetic_split(3, 6, device)?,
        conference_test: synthetic_split(7, 7, device)?,
    })
}

/// Snapshot of every variable, sorted by name
pub fn snapshot(var_map: &VarMap) -> Result<Vec<(String, Vec<f32>)>> {
    let data = var_map
        .data()
        .lock()
        .map_err(|e| anyhow::anyhow!("var map lock poisoned: {}", e))?;
    let mut values = Vec::with_capacity(data.len());
    for (name, var) in data.iter() {
        values.push((name.clone(), var.as_tensor().flatten_all()?.to_vec1::<f32>()?));
    }
    values.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(values)
}

/// Assert two tensors agree element-wise within `atol`
pub fn assert_tensor_close(a: &Tensor, b: &Tensor, atol: f32) -> Result<()> {
    assert_eq!(a.dims(), b.dims(), "Tensor shapes must match");
    let a = a.flatten_all()?.to_dtype(DType::F32)?.to_vec1::<f32>()?;
    let b = b.flatten_all()?.to_dtype(DType::F32)?.to_vec1::<f32>()?;
    for (x, y) in a.iter().zip(&b) {
        assert!((x - y).abs() <= atol, "{} and {} differ by more than {}", x, y, atol);
    }
    Ok(())
}

//! Tests for checkpointing functionality

use anyhow::Result;
use candle_core::{DType, Tensor};
use candle_nn::{Init, VarMap};
use proptest::prelude::*;
use tempfile::TempDir;

use crate::training::{Adam, AdamConfig, CheckpointManager, Optimizer, DEFAULT_MAX_TO_KEEP};

use super::test_utils::{create_test_device, snapshot};

fn tiny_var_map() -> Result<VarMap> {
    let var_map = VarMap::new();
    var_map.get((2, 3), "dense.weight", Init::Const(0.5), DType::F32, &create_test_device())?;
    var_map.get(3, "dense.bias", Init::Const(0.0), DType::F32, &create_test_device())?;
    Ok(var_map)
}

fn take_step(var_map: &VarMap, adam: &mut Adam) -> Result<()> {
    let mut loss = Tensor::zeros((), DType::F32, &create_test_device())?;
    for var in var_map.all_vars() {
        loss = (loss + var.as_tensor().sqr()?.sum_all()?)?;
    }
    adam.step(&loss.backward()?)?;
    Ok(())
}

#[test]
fn test_checkpoint_manager_creation() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let checkpoint_dir = temp_dir.path().join("checkpoints");

    let manager = CheckpointManager::new(&checkpoint_dir, DEFAULT_MAX_TO_KEEP)?;

    assert!(checkpoint_dir.is_dir());
    assert!(manager.latest()?.is_none());
    assert!(CheckpointManager::new(&checkpoint_dir, 0).is_err());
    Ok(())
}

#[test]
fn test_checkpoint_save_restore() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let manager = CheckpointManager::new(temp_dir.path(), DEFAULT_MAX_TO_KEEP)?;
    let mut var_map = tiny_var_map()?;
    let mut adam = Adam::new(&var_map, AdamConfig::default())?;
    take_step(&var_map, &mut adam)?;

    let info = manager.save(4, 17, &var_map, &adam)?;
    let saved = snapshot(&var_map)?;
    assert!(temp_dir.path().join(&info.model_file).exists());
    assert!(temp_dir.path().join(&info.optimizer_file).exists());

    take_step(&var_map, &mut adam)?;
    assert_ne!(snapshot(&var_map)?, saved);

    let mut fresh = Adam::new(&var_map, AdamConfig::default())?;
    let restored = manager.restore(&info, &mut var_map, &mut fresh, &create_test_device())?;
    assert_eq!(restored.epoch, 4);
    assert_eq!(restored.global_step, 17);
    assert_eq!(snapshot(&var_map)?, saved);
    assert_eq!(fresh.step_count(), 1);
    Ok(())
}

#[test]
fn test_checkpoint_limit_enforcement() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let manager = CheckpointManager::new(temp_dir.path(), DEFAULT_MAX_TO_KEEP)?;
    let var_map = tiny_var_map()?;
    let adam = Adam::new(&var_map, AdamConfig::default())?;

    for epoch in 0..7 {
        manager.save(epoch, epoch * 10, &var_map, &adam)?;
    }

    let kept = manager.list()?;
    assert_eq!(kept.len(), 5);
    assert_eq!(kept.first().map(|c| c.index), Some(2));
    assert_eq!(manager.latest()?.map(|c| c.epoch), Some(6));
    assert!(!temp_dir.path().join("ckpt-0.safetensors").exists());
    assert!(!temp_dir.path().join("ckpt-1.optim.safetensors").exists());
    assert!(temp_dir.path().join("ckpt-2.safetensors").exists());
    Ok(())
}

#[test]
fn test_restore_missing_file_fails() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let manager = CheckpointManager::new(temp_dir.path(), DEFAULT_MAX_TO_KEEP)?;
    let mut var_map = tiny_var_map()?;
    let mut adam = Adam::new(&var_map, AdamConfig::default())?;
    let info = manager.save(0, 0, &var_map, &adam)?;
    std::fs::remove_file(temp_dir.path().join(&info.model_file))?;

    assert!(manager
        .restore(&info, &mut var_map, &mut adam, &create_test_device())
        .is_err());
    Ok(())
}

#[test]
fn failed_manifest_write_keeps_evicted_files() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let manager = CheckpointManager::new(temp_dir.path(), 1)?;
    let var_map = tiny_var_map()?;
    let adam = Adam::new(&var_map, AdamConfig::default())?;
    let first = manager.save(0, 0, &var_map, &adam)?;

    // A directory in the staging path makes the manifest write fail.
    std::fs::create_dir(temp_dir.path().join("checkpoint.json.tmp"))?;
    assert!(manager.save(1, 1, &var_map, &adam).is_err());

    let listed = manager.list()?;
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].index, first.index);
    assert!(temp_dir.path().join(&first.model_file).exists());
    assert!(temp_dir.path().join(&first.optimizer_file).exists());
    Ok(())
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(8))]

    #[test]
    fn prop_retention_never_exceeds_limit(saves in 1usize..12, keep in 1usize..6) {
        let temp_dir = TempDir::new().unwrap();
        let manager = CheckpointManager::new(temp_dir.path(), keep).unwrap();
        let var_map = tiny_var_map().unwrap();
        let adam = Adam::new(&var_map, AdamConfig::default()).unwrap();

        for epoch in 0..saves {
            manager.save(epoch, epoch, &var_map, &adam).unwrap();
            prop_assert!(manager.list().unwrap().len() <= keep);
        }
        let files = std::fs::read_dir(temp_dir.path())
            .unwrap()
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_name().to_string_lossy().ends_with(".safetensors"))
            .count();
        prop_assert_eq!(files, 2 * saves.min(keep));
    }
}

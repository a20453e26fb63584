//! Checkpoint storage with bounded retention
//!
//! Each checkpoint is a pair of safetensors files, `ckpt-N.safetensors` for
//! the model variables and `ckpt-N.optim.safetensors` for the optimizer
//! state. A JSON manifest `checkpoint.json` lists the retained checkpoints
//! oldest first; once more than `max_to_keep` exist the oldest is deleted.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use candle_core::Device;
use candle_nn::VarMap;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::optimizers::Optimizer;
use crate::error::{Error, Result};

/// Checkpoints retained by default
pub const DEFAULT_MAX_TO_KEEP: usize = 5;

const MANIFEST: &str = "checkpoint.json";

/// One saved checkpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointInfo {
    /// Sequence number, increasing across saves
    pub index: usize,
    /// Epoch after which the checkpoint was written
    pub epoch: usize,
    /// Training steps taken so far
    pub global_step: usize,
    /// Model variables file, relative to the checkpoint directory
    pub model_file: String,
    /// Optimizer state file, relative to the checkpoint directory
    pub optimizer_file: String,
    /// Write time
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Manifest {
    next_index: usize,
    checkpoints: Vec<CheckpointInfo>,
}

/// State recovered from a checkpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RestoredState {
    /// Epoch the checkpoint was written after
    pub epoch: usize,
    /// Training steps taken before the checkpoint
    pub global_step: usize,
}

/// Saves, lists and restores checkpoints in one directory
#[derive(Debug, Clone)]
pub struct CheckpointManager {
    dir: PathBuf,
    max_to_keep: usize,
}

impl CheckpointManager {
    /// Open (and create) a checkpoint directory
    pub fn new(dir: impl AsRef<Path>, max_to_keep: usize) -> Result<Self> {
        if max_to_keep == 0 {
            return Err(Error::config("max_to_keep must be at least 1"));
        }
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir, max_to_keep })
    }

    /// Checkpoint directory
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Retention limit
    pub fn max_to_keep(&self) -> usize {
        self.max_to_keep
    }

    /// Write model and optimizer state, then evict the oldest checkpoints
    /// beyond the retention limit
    pub fn save(
        &self,
        epoch: usize,
        global_step: usize,
        var_map: &VarMap,
        optimizer: &dyn Optimizer,
    ) -> Result<CheckpointInfo> {
        let mut manifest = self.read_manifest()?;
        let index = manifest.next_index;

        let model_file = format!("ckpt-{}.safetensors", index);
        let optimizer_file = format!("ckpt-{}.optim.safetensors", index);
        var_map.save(self.dir.join(&model_file))?;
        candle_core::safetensors::save(&optimizer.state_tensors()?, self.dir.join(&optimizer_file))?;

        let info = CheckpointInfo {
            index,
            epoch,
            global_step,
            model_file,
            optimizer_file,
            timestamp: Utc::now(),
        };
        manifest.next_index = index + 1;
        manifest.checkpoints.push(info.clone());

        let excess = manifest.checkpoints.len().saturating_sub(self.max_to_keep);
        let evicted: Vec<CheckpointInfo> = manifest.checkpoints.drain(..excess).collect();
        // Files go only once the manifest no longer lists them.
        self.write_manifest(&manifest)?;
        for old in &evicted {
            self.remove_files(old);
            debug!("Evicted checkpoint {}", old.index);
        }

        info!(
            "Saved checkpoint for epoch {} at {}",
            epoch + 1,
            self.dir.join(&info.model_file).display()
        );
        Ok(info)
    }

    /// Retained checkpoints, oldest first
    pub fn list(&self) -> Result<Vec<CheckpointInfo>> {
        Ok(self.read_manifest()?.checkpoints)
    }

    /// Most recent checkpoint, if any
    pub fn latest(&self) -> Result<Option<CheckpointInfo>> {
        Ok(self.read_manifest()?.checkpoints.pop())
    }

    /// Load `info` into the variables of `var_map` and into `optimizer`
    pub fn restore(
        &self,
        info: &CheckpointInfo,
        var_map: &mut VarMap,
        optimizer: &mut dyn Optimizer,
        device: &Device,
    ) -> Result<RestoredState> {
        let model_path = self.dir.join(&info.model_file);
        if !model_path.exists() {
            return Err(Error::checkpoint(format!(
                "checkpoint file {} is missing",
                model_path.display()
            )));
        }
        var_map.load(&model_path)?;

        let state: HashMap<String, _> =
            candle_core::safetensors::load(self.dir.join(&info.optimizer_file), device)?;
        optimizer.load_state_tensors(state)?;

        info!("Restored checkpoint {} (epoch {})", info.index, info.epoch + 1);
        Ok(RestoredState {
            epoch: info.epoch,
            global_step: info.global_step,
        })
    }

    /// Restore the latest checkpoint; `None` when the directory holds none
    pub fn restore_latest(
        &self,
        var_map: &mut VarMap,
        optimizer: &mut dyn Optimizer,
        device: &Device,
    ) -> Result<Option<RestoredState>> {
        match self.latest()? {
            Some(info) => Ok(Some(self.restore(&info, var_map, optimizer, device)?)),
            None => Ok(None),
        }
    }

    fn remove_files(&self, info: &CheckpointInfo) {
        for file in [&info.model_file, &info.optimizer_file] {
            let path = self.dir.join(file);
            if let Err(e) = fs::remove_file(&path) {
                warn!("Could not remove {}: {}", path.display(), e);
            }
        }
    }

    fn read_manifest(&self) -> Result<Manifest> {
        let path = self.dir.join(MANIFEST);
        if !path.exists() {
            return Ok(Manifest::default());
        }
        let text = fs::read_to_string(&path)?;
        Ok(serde_json::from_str(&text)?)
    }

    fn write_manifest(&self, manifest: &Manifest) -> Result<()> {
        let text = serde_json::to_string_pretty(manifest)?;
        let staged = self.dir.join(format!("{}.tmp", MANIFEST));
        fs::write(&staged, text)?;
        fs::rename(&staged, self.dir.join(MANIFEST))?;
        Ok(())
    }
}

//! Run configuration for AMCA training
//!
//! Every hyper-parameter of a run lives in [`RunConfig`], which doubles as
//! the `train` subcommand's argument set and as the `config.yaml` snapshot
//! written into the run directory.

use std::path::{Path, PathBuf};

use candle_core::Device;
use clap::Args;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::model::Activation;

/// Hyper-parameters and output locations of one training run
#[derive(Debug, Clone, PartialEq, Args, Serialize, Deserialize)]
pub struct RunConfig {
    /// Number of training epochs
    #[arg(long, default_value_t = 2000)]
    pub epochs: usize,

    /// Initial learning rate of the polynomial decay schedule
    #[arg(long, default_value_t = 1e-3)]
    pub init_lr: f64,

    /// Encoding dimension produced by the backbone
    #[arg(long, default_value_t = 128)]
    pub num_features: usize,

    /// Base filter count of the residual backbone
    #[arg(long, default_value_t = 32)]
    pub model_filters: usize,

    /// Backbone activation (selu, elu, relu, gelu, silu)
    #[arg(long, default_value = "selu")]
    pub activation_fn: Activation,

    /// Mini-batch size for training and evaluation
    #[arg(long, default_value_t = 64)]
    pub batch_size: usize,

    /// Number of gesture classes
    #[arg(long, default_value_t = 10)]
    pub num_classes: usize,

    /// Source-domain days used for training
    #[arg(long, default_value_t = 3)]
    pub train_source_days: usize,

    /// Source-domain days after the training days treated as unlabeled
    #[arg(long, default_value_t = 0)]
    pub train_source_unlabeled_days: usize,

    /// Server-domain days used for training
    #[arg(long, default_value_t = 1)]
    pub train_server_days: usize,

    /// Conference-domain days used for training
    #[arg(long, default_value_t = 0)]
    pub train_conference_days: usize,

    /// Save a checkpoint every N epochs (0 disables checkpointing)
    #[arg(long, default_value_t = 25)]
    pub save_freq: usize,

    /// Log confusion matrices every N epochs (0 disables them)
    #[arg(long, default_value_t = 25)]
    pub log_images_freq: usize,

    /// Checkpoint directory, relative to the run directory
    #[arg(long, default_value = "checkpoints")]
    pub checkpoint_path: PathBuf,

    /// Summary directory, relative to the run directory
    #[arg(long, default_value = "tensorboard_logs")]
    pub summary_writer_path: PathBuf,

    /// Margin reaches its full value after `epochs / anneal` epochs
    #[arg(long, default_value_t = 4)]
    pub anneal: usize,

    /// Logit scale
    #[arg(long, default_value_t = 10.0)]
    pub s: f64,

    /// Additive margin
    #[arg(long, default_value_t = 0.1)]
    pub m: f64,

    /// Weight decay of the classifier head; part of the run name only, the
    /// training objective does not include it
    #[arg(long, default_value_t = 1e-3)]
    pub ca: f64,

    /// Weight of the cutmix cross-entropy term
    #[arg(long, default_value_t = 1e-1)]
    pub cm_lambda: f64,

    /// Weight of the orthogonality term
    #[arg(long, default_value_t = 1e-1)]
    pub orth_lambda: f64,

    /// Log root, relative to the repository path
    #[arg(long, default_value = "logs/Baselines/AMCA_CM/")]
    pub log_dir: PathBuf,

    /// Free-form run notes
    #[arg(long, default_value = "AMCA_Orth_Server_Baseline")]
    pub notes: String,

    /// Repository root holding `data/` and the log root
    #[arg(long, env = "MMWAVE_PATH", default_value = ".")]
    pub repo_path: PathBuf,

    /// Seed for shuffling and cutmix sampling
    #[arg(long, default_value_t = 42)]
    pub seed: u64,

    /// Beta-distribution shape for cutmix
    #[arg(long, default_value_t = 1.0)]
    pub cutmix_alpha: f64,

    /// Compute device: cpu, cuda or metal
    #[arg(long, default_value = "cpu")]
    pub device: String,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            epochs: 2000,
            init_lr: 1e-3,
            num_features: 128,
            model_filters: 32,
            activation_fn: Activation::Selu,
            batch_size: 64,
            num_classes: 10,
            train_source_days: 3,
            train_source_unlabeled_days: 0,
            train_server_days: 1,
            train_conference_days: 0,
            save_freq: 25,
            log_images_freq: 25,
            checkpoint_path: PathBuf::from("checkpoints"),
            summary_writer_path: PathBuf::from("tensorboard_logs"),
            anneal: 4,
            s: 10.0,
            m: 0.1,
            ca: 1e-3,
            cm_lambda: 1e-1,
            orth_lambda: 1e-1,
            log_dir: PathBuf::from("logs/Baselines/AMCA_CM/"),
            notes: "AMCA_Orth_Server_Baseline".to_string(),
            repo_path: PathBuf::from("."),
            seed: 42,
            cutmix_alpha: 1.0,
            device: "cpu".to_string(),
        }
    }
}

impl RunConfig {
    /// Load a configuration snapshot from a YAML file
    pub fn from_yaml(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = serde_yaml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.epochs == 0 {
            return Err(Error::config("epochs must be > 0"));
        }
        if self.batch_size == 0 {
            return Err(Error::config("batch_size must be > 0"));
        }
        if self.anneal == 0 {
            return Err(Error::config("anneal must be > 0"));
        }
        if self.num_features == 0 || self.model_filters == 0 {
            return Err(Error::config("num_features and model_filters must be > 0"));
        }
        if self.num_classes < 2 {
            return Err(Error::config("num_classes must be at least 2"));
        }
        if self.init_lr <= 0.0 {
            return Err(Error::config("init_lr must be positive"));
        }
        if self.m < 0.0 || self.s <= 0.0 {
            return Err(Error::config("margin must be >= 0 and scale > 0"));
        }
        if self.cutmix_alpha <= 0.0 {
            return Err(Error::config("cutmix_alpha must be positive"));
        }
        Ok(())
    }

    /// Run identifier built from the hyper-parameters that define a run
    ///
    /// Bookkeeping fields (cadences, paths, unlabeled/conference days, seed,
    /// device) are left out so reruns with different logging land in the
    /// same directory.
    pub fn run_name(&self) -> String {
        let fields: Vec<(&str, String)> = vec![
            ("epochs", self.epochs.to_string()),
            ("init_lr", py_float(self.init_lr)),
            ("num_features", self.num_features.to_string()),
            ("model_filters", self.model_filters.to_string()),
            ("activation_fn", self.activation_fn.to_string()),
            ("batch_size", self.batch_size.to_string()),
            ("num_classes", self.num_classes.to_string()),
            ("train_source_days", self.train_source_days.to_string()),
            ("train_server_days", self.train_server_days.to_string()),
            ("anneal", self.anneal.to_string()),
            ("s", py_float(self.s)),
            ("m", py_float(self.m)),
            ("ca", py_float(self.ca)),
            ("cm_lambda", py_float(self.cm_lambda)),
            ("orth_lambda", py_float(self.orth_lambda)),
            ("notes", self.notes.clone()),
        ];

        fields
            .into_iter()
            .map(|(key, value)| format!("{}:{}", key, value.replace([' ', '\'', ','], "")))
            .collect::<Vec<_>>()
            .join("-")
    }

    /// Directory holding every artifact of this run
    pub fn run_dir(&self) -> PathBuf {
        self.repo_path.join(&self.log_dir).join(self.run_name())
    }

    /// Directory for scalar and image summaries
    pub fn summary_dir(&self) -> PathBuf {
        self.run_dir().join(&self.summary_writer_path)
    }

    /// Directory for model checkpoints
    pub fn checkpoint_dir(&self) -> PathBuf {
        self.run_dir().join(&self.checkpoint_path)
    }

    /// Directory holding the `.h5` domain files
    pub fn dataset_dir(&self) -> PathBuf {
        self.repo_path.join("data")
    }

    /// Resolve the compute device
    pub fn device(&self) -> Result<Device> {
        match self.device.to_lowercase().as_str() {
            "cpu" => Ok(Device::Cpu),
            "cuda" | "gpu" => Ok(Device::cuda_if_available(0)?),
            "metal" => Ok(Device::new_metal(0)?),
            other => Err(Error::config(format!("Unknown device: {}", other))),
        }
    }

    /// Write `config.yaml` into the run directory and return its path
    pub fn save_snapshot(&self) -> Result<PathBuf> {
        let run_dir = self.run_dir();
        std::fs::create_dir_all(&run_dir)?;

        let path = run_dir.join("config.yaml");
        std::fs::write(&path, serde_yaml::to_string(self)?)?;
        info!("Run configuration written to {}", path.display());
        debug!("Run name: {}", self.run_name());
        Ok(path)
    }
}

/// Float formatting matching Python's `repr` for the values used in run names
fn py_float(value: f64) -> String {
    if value.fract() == 0.0 && value.abs() < 1e16 {
        return format!("{:.1}", value);
    }
    if value != 0.0 && value.abs() < 1e-4 {
        let formatted = format!("{:e}", value);
        if let Some((mantissa, exponent)) = formatted.split_once('e') {
            let (sign, digits) = match exponent.strip_prefix('-') {
                Some(rest) => ("-", rest),
                None => ("+", exponent),
            };
            return format!("{}e{}{:0>2}", mantissa, sign, digits);
        }
    }
    value.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test]
    fn default_config_is_valid() {
        assert!(RunConfig::default().validate().is_ok());
    }

    #[test]
    fn run_name_matches_dict_rendering() {
        let name = RunConfig::default().run_name();
        assert!(name.starts_with("epochs:2000-init_lr:0.001-num_features:128-model_filters:32-activation_fn:selu"));
        assert!(name.contains("-s:10.0-m:0.1-ca:0.001-cm_lambda:0.1-orth_lambda:0.1-"));
        assert!(name.ends_with("notes:AMCA_Orth_Server_Baseline"));
        assert!(!name.contains("save_freq"));
        assert!(!name.contains("seed"));
    }

    #[test_case(1e-3, "0.001")]
    #[test_case(10.0, "10.0")]
    #[test_case(1e-5, "1e-05")]
    #[test_case(0.25, "0.25")]
    fn py_float_formatting(value: f64, expected: &str) {
        assert_eq!(py_float(value), expected);
    }

    #[test]
    fn zero_anneal_is_rejected() {
        let config = RunConfig { anneal: 0, ..RunConfig::default() };
        assert!(config.validate().is_err());
    }

    #[test]
    fn snapshot_round_trips_through_yaml() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let config = RunConfig {
            repo_path: dir.path().to_path_buf(),
            epochs: 7,
            ..RunConfig::default()
        };
        let path = config.save_snapshot()?;
        let loaded = RunConfig::from_yaml(&path)?;
        assert_eq!(loaded, config);
        Ok(())
    }
}

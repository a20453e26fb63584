use std::path::PathBuf;

use anyhow::{Context, Result};
use candle_core::DType;
use candle_nn::{VarBuilder, VarMap};
use clap::{ArgAction, Parser, Subcommand};
use mmwave_amca::logging::init_logging;
use mmwave_amca::training::DEFAULT_MAX_TO_KEEP;
use mmwave_amca::{
    CheckpointManager, DomainSets, Learner, LearnerConfig, ResNetAmca, ResNetAmcaConfig,
    RunConfig, SummaryWriter, Trainer, TrainerOptions,
};
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "mmwave-amca")]
#[command(about = "Domain-adaptive mmWave gesture classifier training", long_about = None)]
struct Cli {
    /// Increase log verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Train and evaluate a model
    Train {
        #[command(flatten)]
        config: Box<RunConfig>,

        /// Take every hyper-parameter from a config.yaml snapshot instead
        #[arg(long)]
        from_config: Option<PathBuf>,

        /// Resume from the latest checkpoint of the run
        #[arg(long)]
        restore: bool,
    },

    /// Validate a config.yaml snapshot and show where its run lives
    Config {
        /// Configuration file to validate
        #[arg(short, long)]
        file: PathBuf,
    },

    /// Show build information
    Info,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.json_logs)?;

    match cli.command {
        Commands::Train {
            config,
            from_config,
            restore,
        } => {
            let config = match from_config {
                Some(path) => RunConfig::from_yaml(&path)
                    .with_context(|| format!("Failed to load {}", path.display()))?,
                None => *config,
            };
            train(config, restore)?;
        }

        Commands::Config { file } => {
            validate_config(file)?;
        }

        Commands::Info => {
            show_system_info();
        }
    }

    Ok(())
}

fn train(config: RunConfig, restore: bool) -> Result<()> {
    config.validate().context("Invalid run configuration")?;
    let device = config.device().context("Failed to open compute device")?;
    info!("Run: {}", config.run_name());
    info!("Device: {:?}", device);

    config
        .save_snapshot()
        .context("Failed to write configuration snapshot")?;

    let data = DomainSets::load(&config, &device).with_context(|| {
        format!("Failed to load datasets from {}", config.dataset_dir().display())
    })?;
    let (channels, _, _) = data
        .input_shape()
        .context("Source training split is empty")?;

    let var_map = VarMap::new();
    let vb = VarBuilder::from_varmap(&var_map, DType::F32, &device);
    let model = ResNetAmca::new(
        ResNetAmcaConfig {
            in_channels: channels,
            num_classes: config.num_classes,
            num_features: config.num_features,
            num_filters: config.model_filters,
            activation: config.activation_fn,
        },
        vb,
    )
    .context("Failed to build model")?;
    info!("Model parameters: {}", parameter_count(&var_map));

    let learner = Learner::new(
        model,
        var_map,
        LearnerConfig::from_run_config(&config, data.source_train.len()),
    )?;
    let summary = SummaryWriter::new(config.summary_dir())
        .context("Failed to open summary directory")?;
    let checkpoints = CheckpointManager::new(config.checkpoint_dir(), DEFAULT_MAX_TO_KEEP)
        .context("Failed to open checkpoint directory")?;

    let mut trainer = Trainer::new(learner, data, TrainerOptions::from(&config), summary, checkpoints);
    if restore && trainer.resume(&device)?.is_none() {
        warn!("--restore given but no checkpoint found; training from scratch");
    }

    let history = trainer.run().context("Training failed")?;
    match history.last() {
        Some(last) => info!(
            "Finished after epoch {}: source test {:.3}, temporal test {:.3}, server test {:.3}",
            last.epoch + 1,
            last.scalar("source_test_acc").unwrap_or(0.0),
            last.scalar("temporal_test_acc").unwrap_or(0.0),
            last.scalar("server_test_acc").unwrap_or(0.0),
        ),
        None => info!("Nothing to train: run already covers {} epochs", config.epochs),
    }
    Ok(())
}

fn parameter_count(var_map: &VarMap) -> usize {
    var_map.all_vars().iter().map(|v| v.elem_count()).sum()
}

fn validate_config(config_path: PathBuf) -> Result<()> {
    info!("Validating configuration file: {}", config_path.display());

    let config = RunConfig::from_yaml(&config_path).context("Failed to load configuration file")?;

    info!("✅ Configuration is valid!");
    info!("Configuration summary:");
    info!("  - Run name: {}", config.run_name());
    info!("  - Run directory: {}", config.run_dir().display());
    info!("  - Data directory: {}", config.dataset_dir().display());
    info!(
        "  - Margin: m={} s={} (full after {} epochs)",
        config.m,
        config.s,
        config.epochs / config.anneal
    );
    info!(
        "  - Loss weights: cutmix {} orthogonality {}",
        config.cm_lambda, config.orth_lambda
    );

    Ok(())
}

fn show_system_info() {
    println!("mmwave-amca - domain-adaptive mmWave gesture classification");
    println!();
    println!("Version: {}", env!("CARGO_PKG_VERSION"));
    println!();
    println!("Hardware support:");

    #[cfg(feature = "cuda")]
    println!("  ✅ NVIDIA CUDA GPU acceleration");
    #[cfg(not(feature = "cuda"))]
    println!("  ❌ CUDA support (not compiled)");

    #[cfg(feature = "metal")]
    println!("  ✅ Apple Metal GPU acceleration");
    #[cfg(not(feature = "metal"))]
    println!("  ❌ Metal support (not compiled)");

    #[cfg(feature = "accelerate")]
    println!("  ✅ Apple Accelerate framework");
    #[cfg(not(feature = "accelerate"))]
    println!("  ❌ Accelerate support (not compiled)");

    println!("  ✅ CPU training");
    println!();
    println!("Usage:");
    println!("  mmwave-amca train --epochs 2000 --batch-size 64   # Train with CLI hyper-parameters");
    println!("  mmwave-amca train --from-config config.yaml       # Train from a snapshot");
    println!("  mmwave-amca train --restore                       # Resume the run's latest checkpoint");
    println!("  mmwave-amca config -f config.yaml                 # Validate a snapshot");
    println!("  mmwave-amca info                                  # Show this information");
    println!("Data is read from $MMWAVE_PATH/data/*.h5");
}

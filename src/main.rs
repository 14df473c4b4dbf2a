//! Shardtrain CLI
//!
//! # Usage
//!
//! ```bash
//! # Train from config
//! shardtrain train config.yaml
//!
//! # Resume a run, restoring the data iterators too
//! shardtrain train config.yaml \
//!     --load-checkpoint full::checkpoints/train_state.ckpt \
//!     --load-dataset-state checkpoints/dataset_state.json
//!
//! # Validate config
//! shardtrain validate config.yaml --check-paths
//!
//! # Inspect a checkpoint
//! shardtrain inspect checkpoints/train_state.ckpt --format json
//!
//! # Export parameters
//! shardtrain export checkpoints/train_state.ckpt --output model.safetensors
//! ```
//!
//! Logging goes through `tracing`; `RUST_LOG` takes precedence over
//! `--verbose` and `--quiet`.

use clap::Parser;
use shardtrain::checkpoint::StreamingCheckpointer;
use shardtrain::config::{
    apply_overrides, build_components, load_config, train_from_spec, validate_config,
    validate_paths, Cli, Command, ExportArgs, InspectArgs, OutputFormat, TrainArgs, ValidateArgs,
};
use shardtrain::io::save_safetensors;
use shardtrain::train::{StopHandle, Termination};
use std::collections::HashMap;
use std::process::ExitCode;
use tracing::{info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

fn main() -> ExitCode {
    let cli = Cli::parse();
    setup_logging(&cli);

    let result = match cli.command {
        Command::Train(args) => run_train(args),
        Command::Validate(args) => run_validate(args),
        Command::Inspect(args) => run_inspect(args),
        Command::Export(args) => run_export(args),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}

fn setup_logging(cli: &Cli) {
    let default_level = if cli.quiet {
        "error"
    } else if cli.verbose {
        "debug"
    } else {
        "info"
    };
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().with_target(false))
        .init();
}

fn run_train(args: TrainArgs) -> shardtrain::Result<()> {
    info!(config = %args.config.display(), "loading configuration");
    let mut spec = load_config(&args.config)?;
    apply_overrides(&mut spec, &args);

    if args.dry_run {
        validate_config(&spec)
            .map_err(|e| shardtrain::Error::ConfigError(format!("Invalid config: {e}")))?;
        let components = build_components(&spec)?;
        info!(
            optimizer = %spec.optimizer.name,
            lr = spec.optimizer.lr,
            mesh = %components.mesh,
            load_checkpoint = %components.config.load_checkpoint,
            total_steps = components.config.total_steps,
            "dry run: configuration is valid"
        );
        return Ok(());
    }

    let stop = StopHandle::new();
    let handler_stop = stop.clone();
    if let Err(e) = ctrlc::set_handler(move || handler_stop.request_stop()) {
        warn!(error = %e, "could not install the interrupt handler");
    }

    let outcome = train_from_spec(&spec, stop)?;
    match &outcome.termination {
        Termination::Completed => info!(step = outcome.final_step, "training completed"),
        Termination::DataExhausted { source_name } => {
            info!(step = outcome.final_step, source = %source_name, "training stopped: data exhausted")
        }
        Termination::Interrupted => info!(step = outcome.final_step, "training interrupted"),
    }
    for report in &outcome.checkpoints {
        info!(path = %report.path.display(), step = report.step, "checkpoint written");
    }
    Ok(())
}

fn run_validate(args: ValidateArgs) -> shardtrain::Result<()> {
    let spec = load_config(&args.config)?;
    if args.check_paths {
        validate_paths(&spec)
            .map_err(|e| shardtrain::Error::ConfigError(format!("Invalid config: {e}")))?;
    }
    build_components(&spec)?;
    println!("Configuration is valid: {}", args.config.display());
    println!("  Optimizer: {} (lr={})", spec.optimizer.name, spec.optimizer.lr);
    println!("  Partition rules: {}", spec.partition_rules.len());
    println!("  Total steps: {}", spec.run.total_steps);
    Ok(())
}

fn run_inspect(args: InspectArgs) -> shardtrain::Result<()> {
    let summary = StreamingCheckpointer::inspect(&args.checkpoint)?;

    match args.format {
        OutputFormat::Json => {
            let json = serde_json::to_string_pretty(&summary)
                .map_err(|e| shardtrain::Error::Serialization(e.to_string()))?;
            println!("{json}");
        }
        OutputFormat::Text => {
            println!("Checkpoint: {}", summary.path.display());
            println!("  Format version: {}", summary.version);
            println!("  Step: {}", summary.metadata.step);
            if let Some(saved_at) = summary.metadata.saved_at {
                println!("  Saved at: {saved_at}");
            }
            println!("  Optimizer state: {}", summary.has_optimizer_state());
            println!("  Size: {} bytes", summary.file_len);
            println!("  Leaves: {}", summary.leaves.len());
            for leaf in &summary.leaves {
                println!(
                    "    {} {} {:?} ({} bytes)",
                    leaf.path, leaf.shape.dtype, leaf.shape.shape, leaf.nbytes
                );
            }
        }
    }
    Ok(())
}

fn run_export(args: ExportArgs) -> shardtrain::Result<()> {
    let root = args.checkpoint.parent().unwrap_or(std::path::Path::new("."));
    let summary = StreamingCheckpointer::inspect(&args.checkpoint)?;
    let params = StreamingCheckpointer::new(root).load_params_only(&args.checkpoint)?;

    let metadata = HashMap::from([
        ("step".to_string(), summary.metadata.step.to_string()),
        ("model_config".to_string(), summary.metadata.model_config.to_string()),
    ]);
    save_safetensors(&params, &args.output, Some(metadata))?;
    info!(
        checkpoint = %args.checkpoint.display(),
        output = %args.output.display(),
        leaves = params.len(),
        "exported parameters"
    );
    Ok(())
}

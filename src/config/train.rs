//! Single-command training from YAML configuration

use super::builder::{build_components, build_data};
use super::schema::TrainSpec;
use super::validate::{validate_config, validate_paths};
use crate::error::{Error, Result};
use crate::train::{JsonlSink, MultiSink, StopHandle, TracingSink, TrainOutcome, Trainer};
use std::fs;
use std::path::Path;
use tracing::info;

/// Train from a YAML configuration file
///
/// Loads and validates the configuration, builds the components, opens
/// the data sources and runs the loop until it completes, runs out of
/// data or `stop` is triggered.
///
/// # Example
///
/// ```no_run
/// use shardtrain::config::train_from_yaml;
/// use shardtrain::train::StopHandle;
///
/// let outcome = train_from_yaml("config.yaml", StopHandle::new())?;
/// println!("final step {}", outcome.final_step);
/// # Ok::<(), shardtrain::Error>(())
/// ```
pub fn train_from_yaml<P: AsRef<Path>>(config_path: P, stop: StopHandle) -> Result<TrainOutcome> {
    let spec = load_config(config_path)?;
    train_from_spec(&spec, stop)
}

/// Run training for an already loaded specification
pub fn train_from_spec(spec: &TrainSpec, stop: StopHandle) -> Result<TrainOutcome> {
    validate_config(spec).map_err(|e| Error::ConfigError(format!("Invalid config: {e}")))?;
    validate_paths(spec).map_err(|e| Error::ConfigError(format!("Invalid config: {e}")))?;

    let components = build_components(spec)?;
    let mut data = build_data(&spec.data)?;

    let mut sink = MultiSink::new().with(TracingSink);
    if let Some(file) = &spec.run.metrics_file {
        if components.config.logs_metrics() {
            sink = sink.with(JsonlSink::create(spec.run.checkpoint_dir.join(file))?);
        }
    }

    info!(
        optimizer = %spec.optimizer.name,
        lr = spec.optimizer.lr,
        batch_size = spec.data.batch_size,
        seq_len = spec.data.seq_len,
        total_steps = spec.run.total_steps,
        "starting training"
    );

    let mut trainer = Trainer::new(
        components.model,
        components.optimizer,
        components.rules,
        components.mesh,
        components.checkpointer,
        components.config,
    )
    .with_sink(sink)
    .with_stop_handle(stop);

    trainer.run(&mut data)
}

/// Load training spec from YAML file (without running training)
pub fn load_config<P: AsRef<Path>>(config_path: P) -> Result<TrainSpec> {
    let yaml_content = fs::read_to_string(config_path.as_ref()).map_err(|e| {
        Error::ConfigError(format!(
            "Failed to read config file {}: {}",
            config_path.as_ref().display(),
            e
        ))
    })?;

    let spec: TrainSpec = serde_yaml::from_str(&yaml_content)
        .map_err(|e| Error::ConfigError(format!("Failed to parse YAML config: {e}")))?;

    validate_config(&spec).map_err(|e| Error::ConfigError(format!("Invalid config: {e}")))?;

    Ok(spec)
}

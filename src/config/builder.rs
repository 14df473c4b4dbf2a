//! Build training components from configuration

use super::schema::{DataConfig, MeshSpec, ModelSpec, OptimSpec, PartitionRuleSpec, RunParams, TrainSpec};
use crate::checkpoint::StreamingCheckpointer;
use crate::error::{Error, Result};
use crate::optim::{AdamW, Optimizer, WarmupCosine, WeightDecayMask, SGD};
use crate::sharding::{Mesh, PartitionRule};
use crate::train::{BigramModel, DataSources, JsonlBatchIterator, Model, TrainConfig};

fn param_f32(spec: &OptimSpec, key: &str, default: f64) -> f32 {
    spec.params
        .get(key)
        .and_then(|v| v.as_f64())
        .unwrap_or(default) as f32
}

/// Build optimizer from configuration
pub fn build_optimizer(spec: &OptimSpec) -> Result<Box<dyn Optimizer>> {
    let schedule = WarmupCosine::new(spec.lr, spec.end_lr, spec.warmup_steps, spec.decay_steps);

    match spec.name.to_lowercase().as_str() {
        "sgd" => {
            let momentum = param_f32(spec, "momentum", 0.0);
            Ok(Box::new(SGD::new(spec.lr, momentum).with_schedule(schedule)))
        }
        "adamw" => {
            let beta1 = param_f32(spec, "beta1", 0.9);
            let beta2 = param_f32(spec, "beta2", 0.999);
            let eps = param_f32(spec, "eps", 1e-8);
            let weight_decay = param_f32(spec, "weight_decay", 0.01);
            let mask = WeightDecayMask::new(&spec.weight_decay_exclusions)?;

            Ok(Box::new(
                AdamW::new(spec.lr, beta1, beta2, eps, weight_decay)
                    .with_schedule(schedule)
                    .with_weight_decay_mask(mask),
            ))
        }
        name => Err(Error::ConfigError(format!(
            "Unknown optimizer: {name}. Supported: sgd, adamw"
        ))),
    }
}

/// Build the model named by the configuration
pub fn build_model(spec: &ModelSpec) -> Result<Box<dyn Model>> {
    match spec {
        ModelSpec::Bigram(config) => Ok(Box::new(BigramModel::new(config.clone())?)),
    }
}

/// Compile the ordered partition rules
pub fn build_rules(specs: &[PartitionRuleSpec]) -> Result<Vec<PartitionRule>> {
    specs
        .iter()
        .map(|rule| PartitionRule::new(rule.pattern.clone(), rule.spec.clone()))
        .collect()
}

/// Build the device mesh; an empty shape means a single device
pub fn build_mesh(spec: &MeshSpec) -> Result<Mesh> {
    Mesh::parse(&spec.shape, spec.devices)
}

/// Translate run parameters into the loop configuration
pub fn build_train_config(run: &RunParams, optim: &OptimSpec) -> Result<TrainConfig> {
    let mut config = TrainConfig::new()
        .with_total_steps(run.total_steps)
        .with_logging(run.log_freq, run.eval_steps)
        .with_checkpoints(run.save_model_freq, run.save_milestone_freq)
        .with_pt_loss_weight(run.pt_loss_weight)
        .with_seed(run.seed)
        .with_load_checkpoint(run.load_checkpoint.parse()?)
        .with_process(run.process_index, run.log_all_workers);

    if let Some(max_norm) = optim.max_grad_norm {
        config = config.with_grad_clip(max_norm);
    }
    if let Some(path) = &run.load_dataset_state {
        config = config.with_dataset_state(path);
    }
    for (key, value) in &run.variant {
        config = config.with_variant(key.clone(), value.clone());
    }
    Ok(config)
}

/// Build the checkpointer writing under `run.checkpoint_dir`
pub fn build_checkpointer(run: &RunParams) -> StreamingCheckpointer {
    StreamingCheckpointer::new(&run.checkpoint_dir)
        .with_save_optimizer_state(run.save_optimizer_state)
        .with_max_retries(run.max_retries)
}

/// Open the JSONL data sources
pub fn build_data(spec: &DataConfig) -> Result<DataSources> {
    let open = |path| -> Result<JsonlBatchIterator> {
        Ok(JsonlBatchIterator::open(path, spec.batch_size, spec.seq_len)?.with_pad_token(spec.pad_token))
    };

    let mut data = DataSources::new(open(&spec.hf)?, open(&spec.pt)?);
    if let (Some(eval_hf), Some(eval_pt)) = (&spec.eval_hf, &spec.eval_pt) {
        data = data.with_eval(open(eval_hf)?, open(eval_pt)?);
    }
    Ok(data)
}

/// Everything a run needs, built from one specification
pub struct Components {
    pub model: Box<dyn Model>,
    pub optimizer: Box<dyn Optimizer>,
    pub rules: Vec<PartitionRule>,
    pub mesh: Mesh,
    pub checkpointer: StreamingCheckpointer,
    pub config: TrainConfig,
}

/// Build all components except the data sources
pub fn build_components(spec: &TrainSpec) -> Result<Components> {
    Ok(Components {
        model: build_model(&spec.model)?,
        optimizer: build_optimizer(&spec.optimizer)?,
        rules: build_rules(&spec.partition_rules)?,
        mesh: build_mesh(&spec.mesh)?,
        checkpointer: build_checkpointer(&spec.run),
        config: build_train_config(&spec.run, &spec.optimizer)?,
    })
}

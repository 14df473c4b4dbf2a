//! YAML schema definitions for declarative training configuration

use crate::sharding::PartitionSpec;
use crate::train::BigramConfig;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;

/// Complete training specification
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainSpec {
    /// Loop, checkpoint and restore settings
    #[serde(default)]
    pub run: RunParams,

    /// Device mesh
    #[serde(default)]
    pub mesh: MeshSpec,

    /// Ordered partition rules; the first matching pattern wins
    pub partition_rules: Vec<PartitionRuleSpec>,

    /// Optimizer configuration
    pub optimizer: OptimSpec,

    /// Model configuration
    pub model: ModelSpec,

    /// Data configuration
    pub data: DataConfig,
}

/// Training loop parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunParams {
    #[serde(default = "default_total_steps")]
    pub total_steps: u64,

    /// Log (and evaluate) every N steps
    #[serde(default = "default_log_freq")]
    pub log_freq: u64,

    /// Evaluation batches per log step
    #[serde(default)]
    pub eval_steps: usize,

    /// Rolling checkpoint interval (0 = off)
    #[serde(default)]
    pub save_model_freq: u64,

    /// Milestone checkpoint interval (0 = off)
    #[serde(default)]
    pub save_milestone_freq: u64,

    #[serde(default = "default_pt_loss_weight")]
    pub pt_loss_weight: f64,

    #[serde(default = "default_seed")]
    pub seed: u64,

    /// `scratch`, `params-only::<path>`, `full::<path>` or `pretrained::<path>`
    #[serde(default)]
    pub load_checkpoint: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub load_dataset_state: Option<PathBuf>,

    /// Output directory for checkpoints and metrics
    #[serde(default = "default_checkpoint_dir")]
    pub checkpoint_dir: PathBuf,

    #[serde(default = "default_true")]
    pub save_optimizer_state: bool,

    /// Retries of a checkpoint save after an I/O failure
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default)]
    pub process_index: usize,

    #[serde(default)]
    pub log_all_workers: bool,

    /// Metrics JSONL file, relative to `checkpoint_dir`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics_file: Option<PathBuf>,

    /// Free-form description stored in checkpoint metadata
    #[serde(default)]
    pub variant: BTreeMap<String, serde_json::Value>,
}

impl Default for RunParams {
    fn default() -> Self {
        Self {
            total_steps: default_total_steps(),
            log_freq: default_log_freq(),
            eval_steps: 0,
            save_model_freq: 0,
            save_milestone_freq: 0,
            pt_loss_weight: default_pt_loss_weight(),
            seed: default_seed(),
            load_checkpoint: String::new(),
            load_dataset_state: None,
            checkpoint_dir: default_checkpoint_dir(),
            save_optimizer_state: true,
            max_retries: default_max_retries(),
            process_index: 0,
            log_all_workers: false,
            metrics_file: None,
            variant: BTreeMap::new(),
        }
    }
}

/// Device mesh description
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeshSpec {
    /// Axis sizes, e.g. `dp=2,mp=4`; one axis may be `-1`
    #[serde(default)]
    pub shape: String,

    /// Number of devices the mesh covers
    #[serde(default = "default_devices")]
    pub devices: usize,
}

impl Default for MeshSpec {
    fn default() -> Self {
        Self {
            shape: String::new(),
            devices: default_devices(),
        }
    }
}

/// One `(pattern, spec)` partition rule
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartitionRuleSpec {
    /// Regex matched against the whole dotted leaf path
    pub pattern: String,

    /// Mesh axis name or `null` per tensor dimension
    pub spec: PartitionSpec,
}

/// Optimizer specification
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimSpec {
    /// Optimizer name: "adamw" | "sgd"
    pub name: String,

    /// Peak learning rate
    pub lr: f64,

    /// Learning rate at the end of the cosine decay
    #[serde(default)]
    pub end_lr: f64,

    #[serde(default)]
    pub warmup_steps: u64,

    /// Length of the cosine decay after warmup (0 = constant)
    #[serde(default)]
    pub decay_steps: u64,

    /// Global-norm gradient clipping threshold
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_grad_norm: Option<f64>,

    /// Regexes of parameter paths excluded from weight decay
    #[serde(default)]
    pub weight_decay_exclusions: Vec<String>,

    /// Optimizer-specific parameters (beta1, beta2, momentum, etc.)
    #[serde(flatten)]
    pub params: HashMap<String, serde_json::Value>,
}

/// Model selection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ModelSpec {
    Bigram(BigramConfig),
}

/// Data configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataConfig {
    /// Training examples of the primary objective (JSONL)
    pub hf: PathBuf,

    /// Training examples of the secondary objective (JSONL)
    pub pt: PathBuf,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eval_hf: Option<PathBuf>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eval_pt: Option<PathBuf>,

    pub batch_size: usize,

    pub seq_len: usize,

    #[serde(default)]
    pub pad_token: i32,
}

fn default_true() -> bool {
    true
}

fn default_total_steps() -> u64 {
    10_000
}

fn default_log_freq() -> u64 {
    50
}

fn default_pt_loss_weight() -> f64 {
    0.01
}

fn default_seed() -> u64 {
    42
}

fn default_max_retries() -> u32 {
    3
}

fn default_devices() -> usize {
    1
}

fn default_checkpoint_dir() -> PathBuf {
    PathBuf::from("./checkpoints")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deserialize_minimal_config() {
        let yaml = r#"
partition_rules:
  - pattern: '.*'
    spec: []

optimizer:
  name: sgd
  lr: 0.1

model:
  type: bigram
  vocab_size: 16

data:
  hf: hf.jsonl
  pt: pt.jsonl
  batch_size: 8
  seq_len: 32
"#;

        let spec: TrainSpec = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(spec.run.total_steps, 10_000);
        assert_eq!(spec.run.load_checkpoint, "");
        assert!(spec.run.save_optimizer_state);
        assert_eq!(spec.mesh.devices, 1);
        assert_eq!(spec.optimizer.name, "sgd");
        assert_eq!(spec.model, ModelSpec::Bigram(BigramConfig::new(16)));
        assert_eq!(spec.data.batch_size, 8);
    }

    #[test]
    fn test_deserialize_full_config() {
        let yaml = r#"
run:
  total_steps: 1000
  log_freq: 10
  eval_steps: 4
  save_model_freq: 100
  save_milestone_freq: 500
  pt_loss_weight: 0.5
  seed: 7
  load_checkpoint: "full::ckpt/train_state.ckpt"
  checkpoint_dir: ./out
  metrics_file: metrics.jsonl
  variant:
    experiment: coh

mesh:
  shape: "dp=-1,mp=2"
  devices: 8

partition_rules:
  - pattern: 'lm\.table'
    spec: [dp, mp]
  - pattern: '.*bias'
    spec: [null]

optimizer:
  name: adamw
  lr: 0.001
  end_lr: 0.00001
  warmup_steps: 100
  decay_steps: 900
  max_grad_norm: 1.0
  weight_decay_exclusions: ['bias$']
  beta1: 0.9
  weight_decay: 0.1

model:
  type: bigram
  vocab_size: 256
  bos_token: 1

data:
  hf: hf.jsonl
  pt: pt.jsonl
  eval_hf: hf_eval.jsonl
  eval_pt: pt_eval.jsonl
  batch_size: 4
  seq_len: 128
"#;

        let spec: TrainSpec = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(spec.run.save_milestone_freq, 500);
        assert_eq!(spec.run.variant["experiment"], "coh");
        assert_eq!(spec.mesh.shape, "dp=-1,mp=2");
        assert_eq!(spec.partition_rules.len(), 2);
        assert_eq!(spec.partition_rules[0].spec.to_string(), "[dp, mp]");
        assert_eq!(spec.partition_rules[1].spec.to_string(), "[_]");
        assert_eq!(spec.optimizer.max_grad_norm, Some(1.0));
        assert_eq!(spec.optimizer.params["weight_decay"], 0.1);
        assert!(!spec.optimizer.params.contains_key("lr"));
        let ModelSpec::Bigram(model) = &spec.model;
        assert_eq!(model.bos_token, 1);
        assert_eq!(spec.data.eval_pt, Some(PathBuf::from("pt_eval.jsonl")));
    }

    #[test]
    fn test_default_run_params() {
        let params = RunParams::default();
        assert_eq!(params.total_steps, 10_000);
        assert_eq!(params.max_retries, 3);
        assert_eq!(params.pt_loss_weight, 0.01);
        assert_eq!(params.checkpoint_dir, PathBuf::from("./checkpoints"));
    }
}

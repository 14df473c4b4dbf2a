//! Declarative YAML configuration
//!
//! A run is described by one YAML file: loop settings, the device mesh, the
//! ordered partition rules, the optimizer, the model and the data sources.
//!
//! # Example
//!
//! ```yaml
//! run:
//!   total_steps: 1000
//!   log_freq: 10
//!   save_model_freq: 100
//!   save_milestone_freq: 500
//!   load_checkpoint: "full::checkpoints/train_state.ckpt"
//!   checkpoint_dir: ./checkpoints
//!
//! mesh:
//!   shape: "dp=-1"
//!   devices: 4
//!
//! partition_rules:
//!   - pattern: 'lm\.table'
//!     spec: [dp, null]
//!   - pattern: '.*'
//!     spec: [null]
//!
//! optimizer:
//!   name: adamw
//!   lr: 3e-4
//!   warmup_steps: 100
//!   decay_steps: 900
//!   max_grad_norm: 1.0
//!
//! model:
//!   type: bigram
//!   vocab_size: 256
//!
//! data:
//!   hf: data/hf.jsonl
//!   pt: data/pt.jsonl
//!   batch_size: 8
//!   seq_len: 128
//! ```

mod builder;
mod cli;
mod schema;
mod train;
mod validate;



pub use builder::{
    build_checkpointer, build_components, build_data, build_mesh, build_model, build_optimizer,
    build_rules, build_train_config, Components,
};
pub use cli::{
    apply_overrides, parse_args, Cli, Command, ExportArgs, InspectArgs, OutputFormat, TrainArgs,
    ValidateArgs,
};
pub use schema::{
    DataConfig, MeshSpec, ModelSpec, OptimSpec, PartitionRuleSpec, RunParams, TrainSpec,
};
pub use train::{load_config, train_from_spec, train_from_yaml};
pub use validate::{validate_config, validate_paths, ValidationError};

//! Resumable sharded training loop
//!
//! This module provides:
//! - The model and data boundaries ([`Model`], [`DataIterator`])
//! - Train state creation from scratch, external weights or checkpoints
//! - The [`Trainer`], which combines an "hf" and a "pt" gradient per step
//! - Metrics sinks
//!
//! # Example
//!
//! ```no_run
//! use shardtrain::checkpoint::StreamingCheckpointer;
//! use shardtrain::optim::AdamW;
//! use shardtrain::sharding::{Mesh, PartitionRule, PartitionSpec};
//! use shardtrain::train::{BigramConfig, BigramModel, DataSources, TrainConfig, Trainer, VecBatchIterator};
//!
//! # fn main() -> shardtrain::Result<()> {
//! let model = BigramModel::new(BigramConfig::new(16))?;
//! let rules = vec![
//!     PartitionRule::new(r"lm\.table", PartitionSpec::from_axes([Some("dp"), None]))?,
//!     PartitionRule::new(r"lm\.bias", PartitionSpec::replicated(1))?,
//! ];
//! let config = TrainConfig::new().with_total_steps(100).with_checkpoints(50, 0);
//! let mut trainer = Trainer::new(
//!     Box::new(model),
//!     Box::new(AdamW::default_params(1e-3)),
//!     rules,
//!     Mesh::single(),
//!     StreamingCheckpointer::new("checkpoints"),
//!     config,
//! );
//! let mut data = DataSources::new(VecBatchIterator::new(vec![]), VecBatchIterator::new(vec![]));
//! let outcome = trainer.run(&mut data)?;
//! println!("stopped at step {}", outcome.final_step);
//! # Ok(())
//! # }
//! ```

mod batch;
mod bigram;
mod config;
mod metrics;
mod model;
mod state;
mod trainer;

#[cfg(test)]
mod tests;

pub use batch::{Batch, DataIterator, JsonlBatchIterator, VecBatchIterator};
pub use bigram::{BigramConfig, BigramModel};
pub use config::{LoadSource, TrainConfig};
pub use metrics::{
    average_metrics, prefixed, JsonlSink, MemorySink, Metrics, MetricsSink, MultiSink, TracingSink,
};
pub use model::{LossAccuracy, Model, StepOutput};
pub use state::{Restored, StateShardings, TrainState, TrainStateFactory};
pub use trainer::{
    combine_grads, load_dataset_state, DataSources, DatasetState, Phase, StopHandle, Termination,
    TrainOutcome, Trainer, DATASET_STATE_FILE,
};

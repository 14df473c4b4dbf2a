//! # Shardtrain: sharded training state with streaming checkpoints
//!
//! Shardtrain keeps the parameters and optimizer state of a language model
//! partitioned over a logical device mesh, runs a resumable training loop
//! that mixes two objectives per step, and streams the state to disk one
//! leaf at a time.
//!
//! ## Architecture
//!
//! - **tree**: Named tensor trees keyed by dotted paths
//! - **sharding**: Device mesh, partition rules and shard/gather functions
//! - **rng**: Splittable deterministic key stream
//! - **checkpoint**: Streaming checkpoint format and checkpointer
//! - **optim**: Functional optimizers (AdamW, SGD) with warmup-cosine schedules
//! - **train**: Model and data boundaries, train state lifecycle, the training loop
//! - **config**: Declarative YAML configuration and CLI
//! - **io**: SafeTensors import and export of plain parameter trees

pub mod checkpoint;
pub mod config;
pub mod io;
pub mod optim;
pub mod rng;
pub mod sharding;
pub mod train;
pub mod tree;

pub mod error;

// Re-export commonly used types
pub use error::{Error, Result};
pub use rng::{RngKey, RngStream};
pub use tree::{Leaf, ParameterTree, Tree, TreeShape};

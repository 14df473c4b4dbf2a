//! Optimizers over parameter trees
//!
//! Optimizers are pure functions of (gradients, state, parameters, step):
//! they never hold per-run mutable state themselves, so the same instance
//! can update every device's shard and a restored run continues exactly.

mod adamw;
mod optimizer;
mod scheduler;
mod sgd;

pub use adamw::AdamW;
pub use optimizer::{apply_updates, clip_factor, Optimizer, WeightDecayMask};
pub use scheduler::{LRScheduler, WarmupCosine};
pub use sgd::SGD;

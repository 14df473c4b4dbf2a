//! Checkpoint records, metadata and reports

use super::OPT_STATE_PREFIX;
use crate::rng::RngKey;
use crate::sharding::ShardedTree;
use crate::tree::LeafShape;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

/// Rolling checkpoints share one file that each save replaces. Milestones
/// get a step-stamped file that is never overwritten.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CheckpointKind {
    Rolling,
    Milestone,
}

impl fmt::Display for CheckpointKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CheckpointKind::Rolling => f.write_str("rolling"),
            CheckpointKind::Milestone => f.write_str("milestone"),
        }
    }
}

/// Trailing metadata record of a checkpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointMetadata {
    pub step: u64,
    /// Free-form run description (flags, dataset names, ...)
    #[serde(default)]
    pub variant: BTreeMap<String, serde_json::Value>,
    /// Snapshot of the model configuration
    #[serde(default)]
    pub model_config: serde_json::Value,
    /// Key of the training RNG stream at the time of the save
    #[serde(default)]
    pub rng: Option<RngKey>,
    /// Filled in by the checkpointer when the record is written
    #[serde(default)]
    pub saved_at: Option<DateTime<Utc>>,
}

impl CheckpointMetadata {
    pub fn new(step: u64) -> Self {
        Self {
            step,
            variant: BTreeMap::new(),
            model_config: serde_json::Value::Null,
            rng: None,
            saved_at: None,
        }
    }

    pub fn with_variant(mut self, variant: BTreeMap<String, serde_json::Value>) -> Self {
        self.variant = variant;
        self
    }

    pub fn with_model_config(mut self, model_config: serde_json::Value) -> Self {
        self.model_config = model_config;
        self
    }

    pub fn with_rng(mut self, rng: RngKey) -> Self {
        self.rng = Some(rng);
        self
    }
}

/// Counters describing one streaming pass over a checkpoint
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamStats {
    /// Leaf paths in the order they were processed
    pub order: Vec<String>,
    /// Leaf payload bytes written or read
    pub bytes: u64,
    /// Highest number of full host leaves alive at once
    pub peak_live_leaves: usize,
}

/// Outcome of a successful save
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SaveReport {
    pub path: PathBuf,
    pub kind: CheckpointKind,
    pub step: u64,
    pub attempts: u32,
    pub stats: StreamStats,
}

/// A loaded checkpoint
#[derive(Debug, Clone)]
pub struct CheckpointRecord {
    pub metadata: CheckpointMetadata,
    pub params: ShardedTree,
    /// Present only if the checkpoint was saved with optimizer state
    pub opt_state: Option<ShardedTree>,
    pub stats: StreamStats,
}

impl CheckpointRecord {
    pub fn step(&self) -> u64 {
        self.metadata.step
    }
}

/// One leaf record as listed by `inspect`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LeafEntry {
    pub path: String,
    #[serde(flatten)]
    pub shape: LeafShape,
    /// Byte offset of the record in the file
    pub offset: u64,
    pub nbytes: u64,
}

/// Table of contents of a checkpoint, read without materializing tensors
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CheckpointSummary {
    pub path: PathBuf,
    pub version: u32,
    pub leaves: Vec<LeafEntry>,
    pub metadata: CheckpointMetadata,
    /// Offset of the metadata record; everything before it is leaf data
    pub data_end_offset: u64,
    pub file_len: u64,
}

impl CheckpointSummary {
    pub fn has_optimizer_state(&self) -> bool {
        let prefix = format!("{OPT_STATE_PREFIX}.");
        self.leaves.iter().any(|l| l.path.starts_with(&prefix))
    }
}

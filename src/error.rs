//! Error types for shardtrain

use crate::tree::DType;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("No partition rule matches parameter '{path}'")]
    UnresolvedPartition { path: String },

    #[error("Partition spec for '{path}' has {spec_rank} axes, but the leaf has rank {leaf_rank}")]
    PartitionRankMismatch {
        path: String,
        spec_rank: usize,
        leaf_rank: usize,
    },

    #[error(
        "Dimension {dim} of '{path}' (size {size}) is not divisible by mesh axis '{mesh_axis}' (size {mesh_size})"
    )]
    ShardDivisibility {
        path: String,
        dim: usize,
        size: usize,
        mesh_axis: String,
        mesh_size: usize,
    },

    #[error("Partition spec for '{path}' references unknown mesh axis '{axis}'")]
    UnknownMeshAxis { path: String, axis: String },

    #[error("Shape mismatch for '{path}': expected {expected:?}, got {got:?}")]
    ShapeMismatch {
        path: String,
        expected: Vec<usize>,
        got: Vec<usize>,
    },

    #[error("Dtype mismatch for '{path}': expected {expected}, got {got}")]
    DTypeMismatch {
        path: String,
        expected: DType,
        got: DType,
    },

    #[error("Replicas of '{path}' disagree: device {device} differs from its primary replica")]
    ReplicaMismatch { path: String, device: usize },

    #[error("Truncated checkpoint {}: {reason}", path.display())]
    TruncatedCheckpoint { path: PathBuf, reason: String },

    #[error("Corrupt checkpoint {}: {reason}", path.display())]
    CorruptCheckpoint { path: PathBuf, reason: String },

    #[error("Milestone checkpoint already exists: {}", .0.display())]
    CheckpointExists(PathBuf),

    #[error("Checkpoint is missing leaf '{path}'")]
    MissingLeaf { path: String },

    #[error("Checkpoint contains unexpected leaf '{path}'")]
    UnexpectedLeaf { path: String },

    #[error("Saving checkpoint {} at step {step} failed: {source}", path.display())]
    CheckpointSave {
        path: PathBuf,
        step: u64,
        #[source]
        source: Box<Error>,
    },

    #[error("Data source '{source_name}' is exhausted")]
    DataExhausted { source_name: String },

    #[error("Invalid batch: {0}")]
    InvalidBatch(String),

    #[error("Model error: {0}")]
    Model(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Whether the training loop may end gracefully on this error
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Error::DataExhausted { .. })
    }

    /// Whether a checkpoint save should be retried after this error
    pub(crate) fn is_transient_io(&self) -> bool {
        matches!(self, Error::Io(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_data_exhaustion_is_recoverable() {
        let exhausted = Error::DataExhausted {
            source_name: "hf".to_string(),
        };
        assert!(exhausted.is_recoverable());

        let fatal = Error::UnresolvedPartition {
            path: "lm.table".to_string(),
        };
        assert!(!fatal.is_recoverable());
    }

    #[test]
    fn test_messages_name_the_path() {
        let err = Error::ShapeMismatch {
            path: "params.lm.table".to_string(),
            expected: vec![8, 4],
            got: vec![4, 4],
        };
        let msg = err.to_string();
        assert!(msg.contains("params.lm.table"));
        assert!(msg.contains("[8, 4]"));
    }

    #[test]
    fn test_save_context_wraps_source() {
        let inner = Error::Io(std::io::Error::other("disk full"));
        let err = Error::CheckpointSave {
            path: PathBuf::from("/ckpt/train_state.ckpt"),
            step: 20,
            source: Box::new(inner),
        };
        let msg = err.to_string();
        assert!(msg.contains("step 20"));
        assert!(msg.contains("disk full"));
    }
}

//! Streaming checkpoints of sharded train state
//!
//! Checkpoints are written leaf by leaf: each sharded leaf is gathered to a
//! full host tensor, appended to the output stream and dropped before the
//! next one is gathered. Loading mirrors this, sharding each leaf as soon as
//! it is read. Files are written to a temp file and renamed into place.

mod checkpointer;
mod format;
mod record;


/// Path prefix of parameter leaves inside a checkpoint
pub const PARAMS_PREFIX: &str = "params";
/// Path prefix of optimizer-state leaves inside a checkpoint
pub const OPT_STATE_PREFIX: &str = "opt_state";

pub use checkpointer::{milestone_file, StreamingCheckpointer, ROLLING_FILE};
pub use format::{CheckpointReader, CheckpointWriter, LeafHeader, Record, MAGIC, VERSION};
pub use record::{
    CheckpointKind, CheckpointMetadata, CheckpointRecord, CheckpointSummary, LeafEntry,
    SaveReport, StreamStats,
};

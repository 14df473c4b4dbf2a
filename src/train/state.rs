//! Train state and the ways to create it

use super::config::LoadSource;
use super::model::Model;
use crate::checkpoint::{CheckpointMetadata, StreamingCheckpointer, OPT_STATE_PREFIX, PARAMS_PREFIX};
use crate::error::{Error, Result};
use crate::io::load_safetensors;
use crate::optim::Optimizer;
use crate::rng::RngKey;
use crate::sharding::{resolve, resolve_mirrored, Mesh, PartitionRule, ShardGatherFns, ShardedTree};
use crate::tree::{ParameterTree, TreeShape};
use std::path::Path;
use tracing::info;

/// Step counter, parameters and optimizer state, all sharded
///
/// Train steps consume a state and return its successor; nothing keeps a
/// reference to the old one.
#[derive(Debug, Clone)]
pub struct TrainState {
    pub step: u64,
    pub params: ShardedTree,
    pub opt_state: ShardedTree,
}

/// Shard and gather functions for every part of the train state
///
/// Built once per run from the model skeleton, the optimizer and the rule
/// table; read-only afterwards.
#[derive(Debug, Clone)]
pub struct StateShardings {
    pub params: ShardGatherFns,
    pub opt_state: ShardGatherFns,
    checkpoint: ShardGatherFns,
}

impl StateShardings {
    pub fn build(
        model: &dyn Model,
        optimizer: &dyn Optimizer,
        rules: &[PartitionRule],
        mesh: &Mesh,
    ) -> Result<Self> {
        let param_shapes = model.param_shapes();
        let param_specs = resolve(rules, &param_shapes)?;
        let opt_shapes = optimizer.state_shapes(&param_shapes);
        let opt_specs = resolve_mirrored(rules, &opt_shapes, &param_specs)?;

        let params = ShardGatherFns::build(&param_specs, &param_shapes, mesh)?;
        let opt_state = ShardGatherFns::build(&opt_specs, &opt_shapes, mesh)?;
        let mut checkpoint = params.clone().prefixed(PARAMS_PREFIX);
        checkpoint.extend(opt_state.clone().prefixed(OPT_STATE_PREFIX));
        Ok(Self {
            params,
            opt_state,
            checkpoint,
        })
    }

    /// Functions keyed by `params.<path>` and `opt_state.<path>`
    pub fn checkpoint(&self) -> &ShardGatherFns {
        &self.checkpoint
    }

    pub fn param_shapes(&self) -> TreeShape {
        self.params.shapes()
    }
}

/// Result of restoring a train state
#[derive(Debug)]
pub struct Restored {
    pub state: TrainState,
    /// Metadata of the checkpoint the state came from, if any
    pub metadata: Option<CheckpointMetadata>,
}

/// Creates the run's initial train state
///
/// Exactly one constructor is used per run. Wrapping external parameters
/// after a checkpoint has been loaded is refused.
pub struct TrainStateFactory<'a> {
    model: &'a dyn Model,
    optimizer: &'a dyn Optimizer,
    shardings: &'a StateShardings,
    checkpointer: &'a StreamingCheckpointer,
    checkpoint_loaded: bool,
}

impl<'a> TrainStateFactory<'a> {
    pub fn new(
        model: &'a dyn Model,
        optimizer: &'a dyn Optimizer,
        shardings: &'a StateShardings,
        checkpointer: &'a StreamingCheckpointer,
    ) -> Self {
        Self {
            model,
            optimizer,
            shardings,
            checkpointer,
            checkpoint_loaded: false,
        }
    }

    fn fresh_opt_state(&self) -> Result<ShardedTree> {
        let zeros = self.optimizer.state_shapes(&self.shardings.param_shapes()).zeros();
        self.shardings.opt_state.shard_tree(&zeros)
    }

    /// Initialize parameters from `key` under the resolved partitioning
    pub fn from_scratch(&mut self, key: RngKey) -> Result<TrainState> {
        let shapes = self.model.param_shapes();
        let params = self.model.init(key)?;
        shapes.check_tree(&params)?;
        let state = TrainState {
            step: 0,
            params: self.shardings.params.shard_tree(&params)?,
            opt_state: self.fresh_opt_state()?,
        };
        info!(leaves = shapes.len(), "initialized train state from scratch");
        Ok(state)
    }

    /// Wrap externally supplied parameters with fresh optimizer state at step 0
    pub fn from_restored_params(&mut self, params: ParameterTree) -> Result<TrainState> {
        if self.checkpoint_loaded {
            return Err(Error::ConfigError(
                "cannot restore external parameters after a checkpoint was loaded".into(),
            ));
        }
        self.shardings.param_shapes().check_tree(&params)?;
        Ok(TrainState {
            step: 0,
            params: self.shardings.params.shard_tree(&params)?,
            opt_state: self.fresh_opt_state()?,
        })
    }

    /// Resume parameters, optimizer state and step from a checkpoint
    pub fn from_checkpoint(&mut self, path: impl AsRef<Path>) -> Result<Restored> {
        let path = path.as_ref();
        self.checkpoint_loaded = true;
        let fns = self.shardings.checkpoint();
        let record = self.checkpointer.load(path, &fns.shapes(), &fns.shard)?;
        let opt_state = record.opt_state.ok_or_else(|| {
            Error::ConfigError(format!(
                "checkpoint {} has no optimizer state; restore it with params-only::{}",
                path.display(),
                path.display()
            ))
        })?;
        Ok(Restored {
            state: TrainState {
                step: record.metadata.step,
                params: record.params,
                opt_state,
            },
            metadata: Some(record.metadata),
        })
    }

    /// Parameters from a checkpoint with fresh optimizer state at step 0
    pub fn from_checkpoint_params(&mut self, path: impl AsRef<Path>) -> Result<Restored> {
        self.checkpoint_loaded = true;
        let fns = self.shardings.checkpoint();
        let (params, metadata) = self.checkpointer.load_params(path, &fns.shapes(), &fns.shard)?;
        Ok(Restored {
            state: TrainState {
                step: 0,
                params,
                opt_state: self.fresh_opt_state()?,
            },
            metadata: Some(metadata),
        })
    }

    /// Dispatch on the configured load source
    ///
    /// `init_key` is only used when starting from scratch.
    pub fn restore(&mut self, source: &LoadSource, init_key: RngKey) -> Result<Restored> {
        match source {
            LoadSource::Scratch => Ok(Restored {
                state: self.from_scratch(init_key)?,
                metadata: None,
            }),
            LoadSource::ParamsOnly(path) => self.from_checkpoint_params(path),
            LoadSource::Full(path) => self.from_checkpoint(path),
            LoadSource::Pretrained(path) => {
                let params = load_safetensors(path)?;
                info!(path = %path.display(), leaves = params.len(), "loaded pretrained parameters");
                Ok(Restored {
                    state: self.from_restored_params(params)?,
                    metadata: None,
                })
            }
        }
    }
}

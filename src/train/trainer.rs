//! Resumable training loop over two data sources

use super::batch::{Batch, DataIterator};
use super::config::{LoadSource, TrainConfig};
use super::metrics::{average_metrics, prefixed, Metrics, MetricsSink, TracingSink};
use super::model::Model;
use super::state::{StateShardings, TrainState, TrainStateFactory};
use crate::checkpoint::{CheckpointKind, CheckpointMetadata, SaveReport, StreamingCheckpointer};
use crate::error::{Error, Result};
use crate::optim::{apply_updates, clip_factor, Optimizer};
use crate::rng::{RngKey, RngStream};
use crate::sharding::{Mesh, PartitionRule, ShardGatherFns, ShardedTree};
use crate::tree::ParameterTree;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// File holding the training iterators' state next to the checkpoints
pub const DATASET_STATE_FILE: &str = "dataset_state.json";

/// Orchestrator lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Init,
    Resolving,
    Restoring,
    Running,
    Checkpointing,
    Completed,
}

/// Why the loop stopped
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Termination {
    /// Reached `total_steps`
    Completed,
    /// A training iterator ran dry
    DataExhausted { source_name: String },
    /// A stop was requested between steps
    Interrupted,
}

/// Result of a training run
#[derive(Debug, Clone)]
pub struct TrainOutcome {
    /// Step counter of the final state
    pub final_step: u64,
    /// Steps executed by this run (excluding restored ones)
    pub steps_run: u64,
    pub termination: Termination,
    /// Every checkpoint written, in order
    pub checkpoints: Vec<SaveReport>,
    pub state: TrainState,
}

/// Cooperative stop flag, checked between steps
#[derive(Debug, Clone, Default)]
pub struct StopHandle(Arc<AtomicBool>);

impl StopHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request_stop(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_stop_requested(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Training and evaluation iterators
///
/// Evaluation runs only when both eval iterators are present.
pub struct DataSources {
    pub hf: Box<dyn DataIterator>,
    pub pt: Box<dyn DataIterator>,
    pub eval_hf: Option<Box<dyn DataIterator>>,
    pub eval_pt: Option<Box<dyn DataIterator>>,
}

impl DataSources {
    pub fn new(hf: impl DataIterator + 'static, pt: impl DataIterator + 'static) -> Self {
        Self {
            hf: Box::new(hf),
            pt: Box::new(pt),
            eval_hf: None,
            eval_pt: None,
        }
    }

    pub fn with_eval(
        mut self,
        hf: impl DataIterator + 'static,
        pt: impl DataIterator + 'static,
    ) -> Self {
        self.eval_hf = Some(Box::new(hf));
        self.eval_pt = Some(Box::new(pt));
        self
    }
}

/// State blobs of the training iterators at a checkpointed step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetState {
    pub step: u64,
    pub hf: serde_json::Value,
    pub pt: serde_json::Value,
}

/// Restore the training iterators from a `dataset_state.json`
///
/// Returns the step the state was written at.
pub fn load_dataset_state(path: impl AsRef<Path>, data: &mut DataSources) -> Result<u64> {
    let state: DatasetState = StreamingCheckpointer::load_json(path)?;
    data.hf.restore(&state.hf)?;
    data.pt.restore(&state.pt)?;
    Ok(state.step)
}

fn next_batch(source: &mut dyn DataIterator, name: &str) -> Result<Batch> {
    source.next_batch()?.ok_or_else(|| Error::DataExhausted {
        source_name: name.to_string(),
    })
}

/// `hf + weight * pt`, sharded
///
/// The pt gradient is scaled and added piece by piece, so the result is
/// bit-identical to sharding the combined host gradient.
pub fn combine_grads(
    fns: &ShardGatherFns,
    hf: &ParameterTree,
    pt: &ParameterTree,
    weight: f64,
) -> Result<ShardedTree> {
    let mut combined = fns.shard_tree(hf)?;
    let pt = fns.shard_tree(pt)?;
    for (path, leaf) in combined.iter_mut() {
        leaf.axpy(weight, pt.require(path)?)?;
    }
    Ok(combined)
}

/// Drives a train state from its restore point to `total_steps`
pub struct Trainer {
    model: Box<dyn Model>,
    optimizer: Box<dyn Optimizer>,
    rules: Vec<PartitionRule>,
    mesh: Mesh,
    checkpointer: StreamingCheckpointer,
    config: TrainConfig,
    sink: Box<dyn MetricsSink>,
    stop: StopHandle,
    phase: Phase,
}

impl Trainer {
    /// Create a trainer; non-primary processes get a disabled checkpointer
    pub fn new(
        model: Box<dyn Model>,
        optimizer: Box<dyn Optimizer>,
        rules: Vec<PartitionRule>,
        mesh: Mesh,
        checkpointer: StreamingCheckpointer,
        config: TrainConfig,
    ) -> Self {
        let checkpointer = if config.is_primary() {
            checkpointer
        } else {
            checkpointer.with_enabled(false)
        };
        Self {
            model,
            optimizer,
            rules,
            mesh,
            checkpointer,
            config,
            sink: Box::new(TracingSink),
            stop: StopHandle::new(),
            phase: Phase::Init,
        }
    }

    /// Replace the metrics sink (default: tracing events)
    pub fn with_sink(mut self, sink: impl MetricsSink + 'static) -> Self {
        self.sink = Box::new(sink);
        self
    }

    pub fn with_stop_handle(mut self, stop: StopHandle) -> Self {
        self.stop = stop;
        self
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn config(&self) -> &TrainConfig {
        &self.config
    }

    pub fn checkpointer(&self) -> &StreamingCheckpointer {
        &self.checkpointer
    }

    fn enter(&mut self, phase: Phase) {
        debug!(from = ?self.phase, to = ?phase, "phase transition");
        self.phase = phase;
    }

    /// Resolve partitioning and build the shard/gather functions
    pub fn shardings(&self) -> Result<StateShardings> {
        StateShardings::build(self.model.as_ref(), self.optimizer.as_ref(), &self.rules, &self.mesh)
    }

    /// One optimizer step on the combined gradient of both batches
    ///
    /// Consumes `state` and returns its successor with the step's metrics.
    pub fn train_step(
        &self,
        shardings: &StateShardings,
        state: TrainState,
        hf: &Batch,
        pt: &Batch,
        keys: [RngKey; 2],
    ) -> Result<(TrainState, Metrics)> {
        let weight = self.config.pt_loss_weight;
        let params = shardings.params.gather_tree(&state.params)?;
        let hf_out = self.model.loss_and_grad(&params, hf, keys[0])?;
        let pt_out = self.model.loss_and_grad(&params, pt, keys[1])?;
        drop(params);

        let mut grads = combine_grads(&shardings.params, &hf_out.grads, &pt_out.grads, weight)?;
        let gradient_norm = grads.global_norm();
        if let Some(factor) = self
            .config
            .max_grad_norm
            .and_then(|max| clip_factor(gradient_norm, max))
        {
            for (_, leaf) in grads.iter_mut() {
                leaf.scale(factor)?;
            }
        }

        let devices = state.params.device_count();
        let mut param_views = Vec::with_capacity(devices);
        let mut opt_views = Vec::with_capacity(devices);
        for device in 0..devices {
            let params = state.params.device_view(device);
            let (updates, opt_state) = self.optimizer.update(
                &grads.device_view(device),
                state.opt_state.device_view(device),
                &params,
                state.step,
            )?;
            param_views.push(apply_updates(params, &updates)?);
            opt_views.push(opt_state);
        }
        let next = TrainState {
            step: state.step + 1,
            params: ShardedTree::from_device_views(&shardings.params.layouts(), param_views)?,
            opt_state: ShardedTree::from_device_views(&shardings.opt_state.layouts(), opt_views)?,
        };

        let mut metrics = Metrics::new();
        metrics.insert("hf_loss".into(), hf_out.loss);
        metrics.insert("pt_loss".into(), pt_out.loss);
        metrics.insert("hf_accuracy".into(), hf_out.accuracy);
        metrics.insert("pt_accuracy".into(), pt_out.accuracy);
        metrics.insert("learning_rate".into(), self.optimizer.learning_rate(next.step));
        metrics.insert("gradient_norm".into(), gradient_norm);
        metrics.insert("param_norm".into(), next.params.global_norm());
        Ok((next, metrics))
    }

    /// Losses and accuracies of both batches without updating anything
    pub fn eval_step(
        &self,
        shardings: &StateShardings,
        state: &TrainState,
        hf: &Batch,
        pt: &Batch,
        keys: [RngKey; 2],
    ) -> Result<Metrics> {
        let params = shardings.params.gather_tree(&state.params)?;
        let hf_out = self.model.evaluate(&params, hf, keys[0])?;
        let pt_out = self.model.evaluate(&params, pt, keys[1])?;
        let mut metrics = Metrics::new();
        metrics.insert("hf_loss".into(), hf_out.loss);
        metrics.insert("pt_loss".into(), pt_out.loss);
        metrics.insert("hf_accuracy".into(), hf_out.accuracy);
        metrics.insert("pt_accuracy".into(), pt_out.accuracy);
        metrics.insert(
            "loss".into(),
            hf_out.loss + self.config.pt_loss_weight * pt_out.loss,
        );
        Ok(metrics)
    }

    fn evaluate(
        &self,
        shardings: &StateShardings,
        state: &TrainState,
        data: &mut DataSources,
        rng: &mut RngStream,
    ) -> Result<Metrics> {
        let (Some(eval_hf), Some(eval_pt)) = (data.eval_hf.as_mut(), data.eval_pt.as_mut()) else {
            return Ok(Metrics::new());
        };
        let mut records = Vec::with_capacity(self.config.eval_steps);
        for _ in 0..self.config.eval_steps {
            let batches = match eval_hf.next_batch()? {
                Some(hf) => eval_pt.next_batch()?.map(|pt| (hf, pt)),
                None => None,
            };
            let Some((hf, pt)) = batches else {
                warn!(
                    step = state.step,
                    completed = records.len(),
                    "evaluation data exhausted, averaging the completed eval steps"
                );
                break;
            };
            let (keys, next) = rng.clone().split_many(2);
            *rng = next;
            records.push(self.eval_step(shardings, state, &hf, &pt, [keys[0], keys[1]])?);
        }
        Ok(prefixed("eval_", &average_metrics(&records)))
    }

    fn save_checkpoint(
        &mut self,
        shardings: &StateShardings,
        state: &TrainState,
        rng: &RngStream,
        kind: CheckpointKind,
        data: &DataSources,
    ) -> Result<Option<SaveReport>> {
        self.enter(Phase::Checkpointing);
        let metadata = CheckpointMetadata::new(state.step)
            .with_variant(self.config.variant.clone())
            .with_model_config(self.model.config())
            .with_rng(rng.key());
        let result = self.checkpointer.save(
            &metadata,
            &state.params,
            Some(&state.opt_state),
            &shardings.checkpoint().gather,
            kind,
        );
        let report = match result {
            Ok(report) => report,
            Err(Error::CheckpointSave { path, source, .. })
                if matches!(*source, Error::CheckpointExists(_)) =>
            {
                warn!(path = %path.display(), step = state.step, "milestone checkpoint already exists, keeping it");
                None
            }
            Err(e) => return Err(e),
        };
        if report.is_some() {
            let dataset_state = DatasetState {
                step: state.step,
                hf: data.hf.state(),
                pt: data.pt.state(),
            };
            self.checkpointer.save_json(DATASET_STATE_FILE, &dataset_state)?;
        }
        self.enter(Phase::Running);
        Ok(report)
    }

    /// Run the loop to completion
    ///
    /// Data exhaustion and stop requests end the loop gracefully and still
    /// write the final checkpoint; any other error propagates immediately.
    pub fn run(&mut self, data: &mut DataSources) -> Result<TrainOutcome> {
        self.enter(Phase::Resolving);
        let shardings = self.shardings()?;
        info!(
            mesh = %self.mesh,
            params = shardings.params.len(),
            opt_state = shardings.opt_state.len(),
            "resolved partitioning"
        );

        self.enter(Phase::Restoring);
        let (init_key, seeded) = RngStream::new(self.config.seed).split();
        let restored = TrainStateFactory::new(
            self.model.as_ref(),
            self.optimizer.as_ref(),
            &shardings,
            &self.checkpointer,
        )
        .restore(&self.config.load_checkpoint, init_key)?;
        let persisted_key = restored.metadata.as_ref().and_then(|m| m.rng);
        let mut rng = match (&self.config.load_checkpoint, persisted_key) {
            (LoadSource::Full(_), Some(key)) => RngStream::from_key(key),
            _ => seeded,
        };
        let mut state = restored.state;
        if let Some(path) = self.config.load_dataset_state.clone() {
            let saved_step = load_dataset_state(&path, data)?;
            if saved_step != state.step {
                warn!(
                    dataset_step = saved_step,
                    state_step = state.step,
                    "dataset state and train state were saved at different steps"
                );
            }
        }
        let start_step = state.step;
        info!(
            source = %self.config.load_checkpoint,
            step = start_step,
            total_steps = self.config.total_steps,
            "restored train state"
        );

        self.enter(Phase::Running);
        let mut checkpoints = Vec::new();
        if self.config.save_model_freq > 0 {
            checkpoints.extend(self.save_checkpoint(&shardings, &state, &rng, CheckpointKind::Rolling, data)?);
        }

        let mut termination = Termination::Completed;
        for step in start_step..self.config.total_steps {
            if self.stop.is_stop_requested() {
                info!(step, "stop requested");
                termination = Termination::Interrupted;
                break;
            }
            let batches = next_batch(data.hf.as_mut(), "hf")
                .and_then(|hf| Ok((hf, next_batch(data.pt.as_mut(), "pt")?)));
            let (hf, pt) = match batches {
                Ok(batches) => batches,
                Err(Error::DataExhausted { source_name }) => {
                    warn!(step, source = %source_name, "training data exhausted, ending training");
                    termination = Termination::DataExhausted { source_name };
                    break;
                }
                Err(e) => return Err(e),
            };

            let (keys, next_rng) = rng.split_many(2);
            rng = next_rng;
            let (next_state, mut metrics) = self.train_step(&shardings, state, &hf, &pt, [keys[0], keys[1]])?;
            state = next_state;

            if self.config.log_freq > 0 && step % self.config.log_freq == 0 {
                if self.config.eval_steps > 0 {
                    metrics.extend(self.evaluate(&shardings, &state, data, &mut rng)?);
                }
                if self.config.logs_metrics() {
                    self.sink.log(step, &metrics)?;
                }
            }

            let milestone = self.config.save_milestone_freq;
            let rolling = self.config.save_model_freq;
            if milestone > 0 && (step + 1) % milestone == 0 {
                checkpoints.extend(self.save_checkpoint(&shardings, &state, &rng, CheckpointKind::Milestone, data)?);
            } else if rolling > 0 && (step + 1) % rolling == 0 {
                checkpoints.extend(self.save_checkpoint(&shardings, &state, &rng, CheckpointKind::Rolling, data)?);
            }
        }

        if self.config.save_model_freq > 0 {
            checkpoints.extend(self.save_checkpoint(&shardings, &state, &rng, CheckpointKind::Rolling, data)?);
        }
        self.sink.flush()?;
        self.enter(Phase::Completed);

        let steps_run = state.step - start_step;
        info!(final_step = state.step, steps_run, termination = ?termination, "training finished");
        Ok(TrainOutcome {
            final_step: state.step,
            steps_run,
            termination,
            checkpoints,
            state,
        })
    }
}

//! Configuration validation

use super::schema::{ModelSpec, TrainSpec};
use crate::train::LoadSource;

/// Validation error type
#[derive(Debug, thiserror::Error)]
pub enum ValidationError {
    #[error("Training data path does not exist: {0}")]
    TrainDataNotFound(String),

    #[error("Evaluation data path does not exist: {0}")]
    EvalDataNotFound(String),

    #[error("Checkpoint to load does not exist: {0}")]
    CheckpointNotFound(String),

    #[error("Invalid learning rate: {0} (must be > 0.0)")]
    InvalidLearningRate(f64),

    #[error("Invalid end learning rate: {0} (must be >= 0.0)")]
    InvalidEndLearningRate(f64),

    #[error("Invalid batch size: {0} (must be > 0)")]
    InvalidBatchSize(usize),

    #[error("Invalid sequence length: {0} (must be > 0)")]
    InvalidSeqLen(usize),

    #[error("Invalid total steps: {0} (must be > 0)")]
    InvalidTotalSteps(u64),

    #[error("Invalid optimizer: {0} (must be one of: adamw, sgd)")]
    InvalidOptimizer(String),

    #[error("Invalid gradient clip value: {0} (must be > 0.0)")]
    InvalidGradClip(f64),

    #[error("Invalid pt loss weight: {0} (must be finite and >= 0.0)")]
    InvalidLossWeight(f64),

    #[error("Invalid vocabulary size: {0} (must be > 0)")]
    InvalidVocabSize(usize),

    #[error("Invalid device count: {0} (must be > 0)")]
    InvalidDeviceCount(usize),

    #[error("At least one partition rule is required")]
    NoPartitionRules,

    #[error("Invalid partition pattern '{pattern}': {reason}")]
    InvalidPattern { pattern: String, reason: String },

    #[error("Invalid load_checkpoint: {0}")]
    InvalidLoadSource(String),

    #[error("eval_steps is {0} but data.eval_hf and data.eval_pt are not both set")]
    MissingEvalData(usize),
}

/// Validate a training specification
///
/// Checks numeric ranges, names and patterns. Paths are checked separately
/// by [`validate_paths`].
pub fn validate_config(spec: &TrainSpec) -> Result<(), ValidationError> {
    if spec.data.batch_size == 0 {
        return Err(ValidationError::InvalidBatchSize(spec.data.batch_size));
    }
    if spec.data.seq_len == 0 {
        return Err(ValidationError::InvalidSeqLen(spec.data.seq_len));
    }

    if spec.optimizer.lr <= 0.0 || !spec.optimizer.lr.is_finite() {
        return Err(ValidationError::InvalidLearningRate(spec.optimizer.lr));
    }
    if spec.optimizer.end_lr < 0.0 || !spec.optimizer.end_lr.is_finite() {
        return Err(ValidationError::InvalidEndLearningRate(spec.optimizer.end_lr));
    }

    let valid_optimizers = ["adamw", "sgd"];
    if !valid_optimizers.contains(&spec.optimizer.name.as_str()) {
        return Err(ValidationError::InvalidOptimizer(spec.optimizer.name.clone()));
    }

    if let Some(max_norm) = spec.optimizer.max_grad_norm {
        if max_norm <= 0.0 || !max_norm.is_finite() {
            return Err(ValidationError::InvalidGradClip(max_norm));
        }
    }

    if spec.run.total_steps == 0 {
        return Err(ValidationError::InvalidTotalSteps(spec.run.total_steps));
    }
    if spec.run.pt_loss_weight < 0.0 || !spec.run.pt_loss_weight.is_finite() {
        return Err(ValidationError::InvalidLossWeight(spec.run.pt_loss_weight));
    }
    if let Err(e) = spec.run.load_checkpoint.parse::<LoadSource>() {
        return Err(ValidationError::InvalidLoadSource(e.to_string()));
    }

    if spec.mesh.devices == 0 {
        return Err(ValidationError::InvalidDeviceCount(spec.mesh.devices));
    }

    if spec.partition_rules.is_empty() {
        return Err(ValidationError::NoPartitionRules);
    }
    for rule in &spec.partition_rules {
        if let Err(e) = regex::Regex::new(&rule.pattern) {
            return Err(ValidationError::InvalidPattern {
                pattern: rule.pattern.clone(),
                reason: e.to_string(),
            });
        }
    }

    match &spec.model {
        ModelSpec::Bigram(config) if config.vocab_size == 0 => {
            return Err(ValidationError::InvalidVocabSize(config.vocab_size));
        }
        ModelSpec::Bigram(_) => {}
    }

    if spec.run.eval_steps > 0 && (spec.data.eval_hf.is_none() || spec.data.eval_pt.is_none()) {
        return Err(ValidationError::MissingEvalData(spec.run.eval_steps));
    }

    Ok(())
}

/// Check that every input path named by the specification exists
pub fn validate_paths(spec: &TrainSpec) -> Result<(), ValidationError> {
    for path in [&spec.data.hf, &spec.data.pt] {
        if !path.exists() {
            return Err(ValidationError::TrainDataNotFound(path.display().to_string()));
        }
    }

    for path in [&spec.data.eval_hf, &spec.data.eval_pt].into_iter().flatten() {
        if !path.exists() {
            return Err(ValidationError::EvalDataNotFound(path.display().to_string()));
        }
    }

    if let Ok(source) = spec.run.load_checkpoint.parse::<LoadSource>() {
        let path = match &source {
            LoadSource::Scratch => None,
            LoadSource::ParamsOnly(p) | LoadSource::Full(p) | LoadSource::Pretrained(p) => Some(p),
        };
        if let Some(path) = path {
            if !path.exists() {
                return Err(ValidationError::CheckpointNotFound(path.display().to_string()));
            }
        }
    }

    Ok(())
}

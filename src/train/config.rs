//! Training loop configuration

use crate::error::{Error, Result};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

/// Where the initial train state comes from
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum LoadSource {
    /// Fresh initialization from the configured seed
    #[default]
    Scratch,
    /// Parameters from a checkpoint, fresh optimizer state, step 0
    ParamsOnly(PathBuf),
    /// Parameters, optimizer state and step from a checkpoint
    Full(PathBuf),
    /// Plain SafeTensors weights, fresh optimizer state, step 0
    Pretrained(PathBuf),
}

impl FromStr for LoadSource {
    type Err = Error;

    /// Parse `""`, `"scratch"`, `"params-only::<path>"`, `"full::<path>"`
    /// or `"pretrained::<path>"`
    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if s.is_empty() || s == "scratch" {
            return Ok(LoadSource::Scratch);
        }
        let (kind, path) = s.split_once("::").ok_or_else(|| {
            Error::ConfigError(format!(
                "invalid load source '{s}': expected scratch, params-only::<path>, full::<path> or pretrained::<path>"
            ))
        })?;
        if path.is_empty() {
            return Err(Error::ConfigError(format!("load source '{s}' has an empty path")));
        }
        let path = PathBuf::from(path);
        match kind {
            "params-only" => Ok(LoadSource::ParamsOnly(path)),
            "full" => Ok(LoadSource::Full(path)),
            "pretrained" => Ok(LoadSource::Pretrained(path)),
            other => Err(Error::ConfigError(format!(
                "unknown load source kind '{other}' in '{s}'"
            ))),
        }
    }
}

impl fmt::Display for LoadSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoadSource::Scratch => write!(f, "scratch"),
            LoadSource::ParamsOnly(p) => write!(f, "params-only::{}", p.display()),
            LoadSource::Full(p) => write!(f, "full::{}", p.display()),
            LoadSource::Pretrained(p) => write!(f, "pretrained::{}", p.display()),
        }
    }
}

/// Training loop configuration
#[derive(Clone, Debug)]
pub struct TrainConfig {
    /// Step count at which the loop stops
    pub total_steps: u64,

    /// Log (and evaluate) every N steps; 0 disables
    pub log_freq: u64,

    /// Evaluation batches per log step; 0 disables evaluation
    pub eval_steps: usize,

    /// Rolling checkpoint every N steps; 0 disables rolling checkpoints,
    /// including the initial and final ones
    pub save_model_freq: u64,

    /// Milestone checkpoint every N steps; 0 disables
    pub save_milestone_freq: u64,

    /// Weight of the pt gradient in `hf + w * pt`
    pub pt_loss_weight: f64,

    /// Global-norm gradient clipping threshold (None = no clipping)
    pub max_grad_norm: Option<f64>,

    /// Seed of the run's random stream
    pub seed: u64,

    pub load_checkpoint: LoadSource,

    /// `dataset_state.json` to restore the training iterators from
    pub load_dataset_state: Option<PathBuf>,

    /// Index of this process among the training hosts
    pub process_index: usize,

    /// Log metrics on every process instead of only the first
    pub log_all_workers: bool,

    /// Free-form run description stored in checkpoint metadata
    pub variant: BTreeMap<String, serde_json::Value>,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            total_steps: 10_000,
            log_freq: 50,
            eval_steps: 0,
            save_model_freq: 0,
            save_milestone_freq: 0,
            pt_loss_weight: 0.01,
            max_grad_norm: None,
            seed: 42,
            load_checkpoint: LoadSource::Scratch,
            load_dataset_state: None,
            process_index: 0,
            log_all_workers: false,
            variant: BTreeMap::new(),
        }
    }
}

impl TrainConfig {
    /// Create a new training configuration
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_total_steps(mut self, steps: u64) -> Self {
        self.total_steps = steps;
        self
    }

    /// Set logging interval and evaluation batches per log step
    pub fn with_logging(mut self, log_freq: u64, eval_steps: usize) -> Self {
        self.log_freq = log_freq;
        self.eval_steps = eval_steps;
        self
    }

    /// Set rolling and milestone checkpoint intervals
    pub fn with_checkpoints(mut self, save_model_freq: u64, save_milestone_freq: u64) -> Self {
        self.save_model_freq = save_model_freq;
        self.save_milestone_freq = save_milestone_freq;
        self
    }

    pub fn with_pt_loss_weight(mut self, weight: f64) -> Self {
        self.pt_loss_weight = weight;
        self
    }

    /// Set gradient clipping norm
    pub fn with_grad_clip(mut self, max_norm: f64) -> Self {
        self.max_grad_norm = Some(max_norm);
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_load_checkpoint(mut self, source: LoadSource) -> Self {
        self.load_checkpoint = source;
        self
    }

    pub fn with_dataset_state(mut self, path: impl Into<PathBuf>) -> Self {
        self.load_dataset_state = Some(path.into());
        self
    }

    pub fn with_process(mut self, process_index: usize, log_all_workers: bool) -> Self {
        self.process_index = process_index;
        self.log_all_workers = log_all_workers;
        self
    }

    pub fn with_variant(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.variant.insert(key.into(), value);
        self
    }

    pub fn is_primary(&self) -> bool {
        self.process_index == 0
    }

    /// Whether this process emits metrics records
    pub fn logs_metrics(&self) -> bool {
        self.is_primary() || self.log_all_workers
    }
}

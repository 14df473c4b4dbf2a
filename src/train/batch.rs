//! Batches and data iterators

use crate::error::{Error, Result};
use ndarray::Array2;
use serde::Deserialize;
use std::fs::File;
use std::io::{BufRead, BufReader, Lines};
use std::path::{Path, PathBuf};

/// One batch of token ids with a 0/1 loss mask of the same shape
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    /// Token ids, [batch, seq]
    pub tokens: Array2<i32>,
    /// Loss weights, [batch, seq], each 0.0 or 1.0
    pub loss_masks: Array2<f32>,
}

impl Batch {
    pub fn new(tokens: Array2<i32>, loss_masks: Array2<f32>) -> Result<Self> {
        if tokens.shape() != loss_masks.shape() {
            return Err(Error::InvalidBatch(format!(
                "tokens {:?} and loss_masks {:?} differ in shape",
                tokens.shape(),
                loss_masks.shape()
            )));
        }
        if loss_masks.iter().any(|&m| m != 0.0 && m != 1.0) {
            return Err(Error::InvalidBatch("loss_masks must be 0 or 1".into()));
        }
        Ok(Self { tokens, loss_masks })
    }

    /// Batch with every position weighted
    pub fn unmasked(tokens: Array2<i32>) -> Self {
        let loss_masks = Array2::ones(tokens.raw_dim());
        Self { tokens, loss_masks }
    }

    pub fn batch_size(&self) -> usize {
        self.tokens.nrows()
    }

    pub fn seq_len(&self) -> usize {
        self.tokens.ncols()
    }
}

/// Pull-based batch source
///
/// `Ok(None)` signals exhaustion. The state blob is opaque to the trainer;
/// it is persisted next to checkpoints and handed back to `restore` when a
/// run resumes.
pub trait DataIterator {
    fn next_batch(&mut self) -> Result<Option<Batch>>;

    fn state(&self) -> serde_json::Value;

    fn restore(&mut self, state: &serde_json::Value) -> Result<()>;
}

fn position_from(state: &serde_json::Value, key: &str) -> Result<u64> {
    state
        .get(key)
        .and_then(|v| v.as_u64())
        .ok_or_else(|| Error::ConfigError(format!("dataset state is missing '{key}': {state}")))
}

/// Iterator over batches held in memory
#[derive(Debug, Clone, Default)]
pub struct VecBatchIterator {
    batches: Vec<Batch>,
    position: usize,
}

impl VecBatchIterator {
    pub fn new(batches: Vec<Batch>) -> Self {
        Self {
            batches,
            position: 0,
        }
    }
}

impl DataIterator for VecBatchIterator {
    fn next_batch(&mut self) -> Result<Option<Batch>> {
        let batch = self.batches.get(self.position).cloned();
        if batch.is_some() {
            self.position += 1;
        }
        Ok(batch)
    }

    fn state(&self) -> serde_json::Value {
        serde_json::json!({ "position": self.position })
    }

    fn restore(&mut self, state: &serde_json::Value) -> Result<()> {
        let position = position_from(state, "position")? as usize;
        if position > self.batches.len() {
            return Err(Error::ConfigError(format!(
                "dataset state position {position} is past the {} available batches",
                self.batches.len()
            )));
        }
        self.position = position;
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct Example {
    tokens: Vec<i32>,
    #[serde(default)]
    loss_masks: Option<Vec<f32>>,
}

/// Batches pre-tokenized examples from a JSON-lines file
///
/// Each non-empty line is `{"tokens": [...], "loss_masks": [...]}`; a
/// missing mask weights every token. Examples are truncated or padded with
/// `pad_token` (mask 0) to `seq_len`. A trailing partial batch is dropped.
/// The state blob is the number of examples consumed.
pub struct JsonlBatchIterator {
    path: PathBuf,
    batch_size: usize,
    seq_len: usize,
    pad_token: i32,
    lines: Lines<BufReader<File>>,
    line_number: usize,
    consumed: u64,
}

impl JsonlBatchIterator {
    pub fn open(path: impl AsRef<Path>, batch_size: usize, seq_len: usize) -> Result<Self> {
        if batch_size == 0 || seq_len == 0 {
            return Err(Error::ConfigError(
                "batch_size and seq_len must be positive".into(),
            ));
        }
        let path = path.as_ref().to_path_buf();
        let lines = BufReader::new(File::open(&path)?).lines();
        Ok(Self {
            path,
            batch_size,
            seq_len,
            pad_token: 0,
            lines,
            line_number: 0,
            consumed: 0,
        })
    }

    pub fn with_pad_token(mut self, pad_token: i32) -> Self {
        self.pad_token = pad_token;
        self
    }

    pub fn consumed(&self) -> u64 {
        self.consumed
    }

    fn next_example(&mut self) -> Result<Option<Example>> {
        for line in self.lines.by_ref() {
            self.line_number += 1;
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let example: Example = serde_json::from_str(&line).map_err(|e| {
                Error::InvalidBatch(format!(
                    "{}:{}: {e}",
                    self.path.display(),
                    self.line_number
                ))
            })?;
            if let Some(masks) = &example.loss_masks {
                if masks.len() != example.tokens.len() {
                    return Err(Error::InvalidBatch(format!(
                        "{}:{}: {} tokens but {} loss_masks",
                        self.path.display(),
                        self.line_number,
                        example.tokens.len(),
                        masks.len()
                    )));
                }
            }
            return Ok(Some(example));
        }
        Ok(None)
    }
}

impl DataIterator for JsonlBatchIterator {
    fn next_batch(&mut self) -> Result<Option<Batch>> {
        let mut tokens = Array2::from_elem((self.batch_size, self.seq_len), self.pad_token);
        let mut masks = Array2::<f32>::zeros((self.batch_size, self.seq_len));
        for row in 0..self.batch_size {
            let Some(example) = self.next_example()? else {
                return Ok(None);
            };
            self.consumed += 1;
            for (col, &token) in example.tokens.iter().take(self.seq_len).enumerate() {
                tokens[[row, col]] = token;
                masks[[row, col]] = example.loss_masks.as_ref().map_or(1.0, |m| m[col]);
            }
        }
        Batch::new(tokens, masks).map(Some)
    }

    fn state(&self) -> serde_json::Value {
        serde_json::json!({ "consumed": self.consumed })
    }

    fn restore(&mut self, state: &serde_json::Value) -> Result<()> {
        let target = position_from(state, "consumed")?;
        self.lines = BufReader::new(File::open(&self.path)?).lines();
        self.line_number = 0;
        self.consumed = 0;
        while self.consumed < target {
            if self.next_example()?.is_none() {
                return Err(Error::ConfigError(format!(
                    "dataset state expects {target} examples but {} has {}",
                    self.path.display(),
                    self.consumed
                )));
            }
            self.consumed += 1;
        }
        Ok(())
    }
}

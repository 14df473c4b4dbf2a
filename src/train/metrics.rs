//! Metrics records and sinks

use crate::error::Result;
use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::info;

/// Flat metrics record, keyed by metric name
pub type Metrics = BTreeMap<String, f64>;

/// Mean of every key over a sequence of records
///
/// A key missing from some records is averaged over the records that have it.
pub fn average_metrics(records: &[Metrics]) -> Metrics {
    let mut sums: BTreeMap<String, (f64, usize)> = BTreeMap::new();
    for record in records {
        for (key, value) in record {
            let entry = sums.entry(key.clone()).or_insert((0.0, 0));
            entry.0 += value;
            entry.1 += 1;
        }
    }
    sums.into_iter()
        .map(|(key, (sum, count))| (key, sum / count as f64))
        .collect()
}

/// Copy of `metrics` with every key prefixed
pub fn prefixed(prefix: &str, metrics: &Metrics) -> Metrics {
    metrics
        .iter()
        .map(|(k, v)| (format!("{prefix}{k}"), *v))
        .collect()
}

/// Destination for per-step metrics records
pub trait MetricsSink {
    fn log(&mut self, step: u64, metrics: &Metrics) -> Result<()>;

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Emits each record as a `tracing` event
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl MetricsSink for TracingSink {
    fn log(&mut self, step: u64, metrics: &Metrics) -> Result<()> {
        let rendered = metrics
            .iter()
            .map(|(k, v)| format!("{k}={v:.6}"))
            .collect::<Vec<_>>()
            .join(" ");
        info!(target: "shardtrain::metrics", step, "{rendered}");
        Ok(())
    }
}

/// Appends one JSON object per record to a file
pub struct JsonlSink {
    writer: BufWriter<File>,
}

impl JsonlSink {
    pub fn create(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            writer: BufWriter::new(file),
        })
    }
}

impl MetricsSink for JsonlSink {
    fn log(&mut self, step: u64, metrics: &Metrics) -> Result<()> {
        let mut record = serde_json::Map::new();
        record.insert("step".into(), step.into());
        for (k, v) in metrics {
            record.insert(k.clone(), serde_json::Value::from(*v));
        }
        serde_json::to_writer(&mut self.writer, &record)
            .map_err(|e| crate::Error::Serialization(e.to_string()))?;
        self.writer.write_all(b"\n")?;
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.writer.flush()?;
        Ok(())
    }
}

/// Keeps records in memory; clones share the same buffer
#[derive(Debug, Default, Clone)]
pub struct MemorySink {
    records: Arc<Mutex<Vec<(u64, Metrics)>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<(u64, Metrics)> {
        self.records.lock().map(|r| r.clone()).unwrap_or_default()
    }
}

impl MetricsSink for MemorySink {
    fn log(&mut self, step: u64, metrics: &Metrics) -> Result<()> {
        if let Ok(mut records) = self.records.lock() {
            records.push((step, metrics.clone()));
        }
        Ok(())
    }
}

/// Fans every record out to several sinks
#[derive(Default)]
pub struct MultiSink {
    sinks: Vec<Box<dyn MetricsSink>>,
}

impl MultiSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, sink: impl MetricsSink + 'static) -> Self {
        self.sinks.push(Box::new(sink));
        self
    }

    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }
}

impl MetricsSink for MultiSink {
    fn log(&mut self, step: u64, metrics: &Metrics) -> Result<()> {
        for sink in &mut self.sinks {
            sink.log(step, metrics)?;
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        for sink in &mut self.sinks {
            sink.flush()?;
        }
        Ok(())
    }
}

//! Streaming save and restore of sharded train state

use super::format::{CheckpointReader, CheckpointWriter, LeafHeader, Record, VERSION};
use super::record::{
    CheckpointKind, CheckpointMetadata, CheckpointRecord, CheckpointSummary, LeafEntry,
    SaveReport, StreamStats,
};
use super::{OPT_STATE_PREFIX, PARAMS_PREFIX};
use crate::sharding::{GatherFn, ShardFn, ShardedTree};
use crate::tree::{join_path, ParameterTree, Tree, TreeShape};
use crate::{Error, Result};
use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::cell::Cell;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

/// File name of the rolling checkpoint
pub const ROLLING_FILE: &str = "train_state.ckpt";

/// File name of the milestone checkpoint for `step`
pub fn milestone_file(step: u64) -> String {
    format!("train_state_{step}.ckpt")
}

fn parse_milestone_step(name: &str) -> Option<u64> {
    name.strip_prefix("train_state_")?
        .strip_suffix(".ckpt")?
        .parse()
        .ok()
}

/// Counts full host leaves that are alive at the same time
#[derive(Default)]
struct LiveLeafGauge {
    live: Cell<usize>,
    peak: Cell<usize>,
}

struct LiveLeaf<'a>(&'a LiveLeafGauge);

impl LiveLeafGauge {
    fn enter(&self) -> LiveLeaf<'_> {
        let live = self.live.get() + 1;
        self.live.set(live);
        self.peak.set(self.peak.get().max(live));
        LiveLeaf(self)
    }

    fn peak(&self) -> usize {
        self.peak.get()
    }
}

impl Drop for LiveLeaf<'_> {
    fn drop(&mut self) {
        self.0.live.set(self.0.live.get() - 1);
    }
}

/// Sort key enforcing "all params, then all optimizer state, each by path"
fn enumeration_key(path: &str) -> (u8, &str) {
    let section = if path.starts_with(&format!("{PARAMS_PREFIX}.")) {
        0
    } else if path.starts_with(&format!("{OPT_STATE_PREFIX}.")) {
        1
    } else {
        2
    };
    (section, path)
}

/// Saves and restores train state one leaf at a time
///
/// A disabled checkpointer (for example on non-primary processes) turns
/// every save into a no-op but still loads.
#[derive(Debug, Clone)]
pub struct StreamingCheckpointer {
    root: PathBuf,
    enabled: bool,
    save_optimizer_state: bool,
    max_retries: u32,
    retry_backoff: Duration,
}

impl StreamingCheckpointer {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            enabled: true,
            save_optimizer_state: false,
            max_retries: 3,
            retry_backoff: Duration::from_millis(200),
        }
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn with_save_optimizer_state(mut self, save: bool) -> Self {
        self.save_optimizer_state = save;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_retry_backoff(mut self, backoff: Duration) -> Self {
        self.retry_backoff = backoff;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn saves_optimizer_state(&self) -> bool {
        self.save_optimizer_state
    }

    /// Where a checkpoint of `kind` taken at `step` is written
    pub fn path_for(&self, kind: CheckpointKind, step: u64) -> PathBuf {
        match kind {
            CheckpointKind::Rolling => self.root.join(ROLLING_FILE),
            CheckpointKind::Milestone => self.root.join(milestone_file(step)),
        }
    }

    /// Stream `params` (and optimizer state, if configured) to disk
    ///
    /// `gather_fns` is keyed by the prefixed paths (`params.<path>`,
    /// `opt_state.<path>`). Returns `None` when the checkpointer is
    /// disabled. Transient I/O failures are retried into a fresh temp file;
    /// the previous file at the target path is untouched until a complete
    /// checkpoint replaces it.
    pub fn save(
        &self,
        metadata: &CheckpointMetadata,
        params: &ShardedTree,
        opt_state: Option<&ShardedTree>,
        gather_fns: &Tree<GatherFn>,
        kind: CheckpointKind,
    ) -> Result<Option<SaveReport>> {
        if !self.enabled {
            debug!(step = metadata.step, %kind, "checkpointer disabled, skipping save");
            return Ok(None);
        }
        let step = metadata.step;
        let target = self.path_for(kind, step);
        let context = |source: Error| Error::CheckpointSave {
            path: target.clone(),
            step,
            source: Box::new(source),
        };

        if kind == CheckpointKind::Milestone && target.exists() {
            return Err(context(Error::CheckpointExists(target.clone())));
        }
        fs::create_dir_all(&self.root).map_err(|e| context(e.into()))?;

        let opt_state = if self.save_optimizer_state { opt_state } else { None };
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.write_once(&target, kind, metadata, params, opt_state, gather_fns) {
                Ok(stats) => {
                    info!(
                        path = %target.display(),
                        step,
                        %kind,
                        leaves = stats.order.len(),
                        bytes = stats.bytes,
                        "saved checkpoint"
                    );
                    return Ok(Some(SaveReport {
                        path: target.clone(),
                        kind,
                        step,
                        attempts: attempt,
                        stats,
                    }));
                }
                Err(e) if e.is_transient_io() && attempt <= self.max_retries => {
                    warn!(
                        path = %target.display(),
                        step,
                        attempt,
                        error = %e,
                        "checkpoint save failed, retrying"
                    );
                    std::thread::sleep(self.retry_backoff * attempt);
                }
                Err(e) => return Err(context(e)),
            }
        }
    }

    fn write_once(
        &self,
        target: &Path,
        kind: CheckpointKind,
        metadata: &CheckpointMetadata,
        params: &ShardedTree,
        opt_state: Option<&ShardedTree>,
        gather_fns: &Tree<GatherFn>,
    ) -> Result<StreamStats> {
        let tmp = tempfile::Builder::new()
            .prefix(".train_state.")
            .suffix(".tmp")
            .tempfile_in(&self.root)?;
        let mut writer = CheckpointWriter::new(BufWriter::new(tmp.as_file()))?;
        let gauge = LiveLeafGauge::default();
        let mut stats = StreamStats::default();

        let sections = [(PARAMS_PREFIX, Some(params)), (OPT_STATE_PREFIX, opt_state)];
        for (prefix, tree) in sections {
            let Some(tree) = tree else { continue };
            for (path, sharded) in tree.iter() {
                let full_path = join_path(prefix, path);
                let gather = gather_fns.require(&full_path)?;
                let _live = gauge.enter();
                let full = gather.apply(sharded)?;
                writer.write_leaf(&full_path, &full)?;
                stats.order.push(full_path);
            }
        }
        stats.bytes = writer.payload_bytes();

        let mut metadata = metadata.clone();
        metadata.saved_at = Some(Utc::now());
        writer.write_metadata(&metadata)?;
        let file = writer.finish()?.into_inner().map_err(|e| e.into_error())?;
        file.sync_all()?;

        match kind {
            CheckpointKind::Rolling => {
                tmp.persist(target).map_err(|e| Error::Io(e.error))?;
            }
            CheckpointKind::Milestone => {
                tmp.persist_noclobber(target).map_err(|e| {
                    if e.error.kind() == std::io::ErrorKind::AlreadyExists {
                        Error::CheckpointExists(target.to_path_buf())
                    } else {
                        Error::Io(e.error)
                    }
                })?;
            }
        }
        sync_dir(&self.root)?;
        stats.peak_live_leaves = gauge.peak();
        Ok(stats)
    }

    /// Walk every record of the checkpoint at `path`
    ///
    /// `on_leaf` must consume the payload of each leaf it is handed. Leaf
    /// order is checked against the enumeration order.
    fn stream<F>(path: &Path, mut on_leaf: F) -> Result<CheckpointMetadata>
    where
        F: FnMut(&LeafHeader, &mut CheckpointReader<BufReader<File>>) -> Result<()>,
    {
        let file = File::open(path)?;
        let file_len = file.metadata()?.len();
        let mut reader = CheckpointReader::new(BufReader::new(file), path, file_len)?;
        let mut previous: Option<String> = None;
        let mut metadata = None;
        loop {
            match reader.next_record()? {
                Record::Leaf(header) => {
                    if let Some(prev) = &previous {
                        if enumeration_key(&header.path) <= enumeration_key(prev) {
                            return Err(Error::CorruptCheckpoint {
                                path: path.to_path_buf(),
                                reason: format!("leaf '{}' is out of order after '{prev}'", header.path),
                            });
                        }
                    }
                    on_leaf(&header, &mut reader)?;
                    previous = Some(header.path);
                }
                Record::Metadata(m) => metadata = Some(m),
                Record::End => break,
            }
        }
        // The reader refuses an end record that is not preceded by metadata.
        metadata.ok_or_else(|| Error::TruncatedCheckpoint {
            path: path.to_path_buf(),
            reason: "missing metadata record".into(),
        })
    }

    /// Restore a full record, sharding each leaf as soon as it is read
    ///
    /// `target_shapes` and `shard_fns` are keyed by prefixed paths. Every
    /// parameter must be present; optimizer state is either complete or
    /// absent, in which case `opt_state` is `None`.
    pub fn load(
        &self,
        path: impl AsRef<Path>,
        target_shapes: &TreeShape,
        shard_fns: &Tree<ShardFn>,
    ) -> Result<CheckpointRecord> {
        self.load_sections(path.as_ref(), target_shapes, shard_fns, true)
    }

    /// Restore only the parameters, sharded; optimizer leaves are skipped
    pub fn load_params(
        &self,
        path: impl AsRef<Path>,
        target_shapes: &TreeShape,
        shard_fns: &Tree<ShardFn>,
    ) -> Result<(ShardedTree, CheckpointMetadata)> {
        let record = self.load_sections(path.as_ref(), target_shapes, shard_fns, false)?;
        Ok((record.params, record.metadata))
    }

    fn load_sections(
        &self,
        path: &Path,
        target_shapes: &TreeShape,
        shard_fns: &Tree<ShardFn>,
        with_opt_state: bool,
    ) -> Result<CheckpointRecord> {
        let params_prefix = format!("{PARAMS_PREFIX}.");
        let opt_prefix = format!("{OPT_STATE_PREFIX}.");
        let gauge = LiveLeafGauge::default();
        let mut stats = StreamStats::default();
        let mut loaded = ShardedTree::new();

        let metadata = Self::stream(path, |header, reader| {
            if !with_opt_state && header.path.starts_with(&opt_prefix) {
                return reader.skip_leaf(header);
            }
            let expected = target_shapes.get(&header.path).ok_or_else(|| Error::UnexpectedLeaf {
                path: header.path.clone(),
            })?;
            expected.check(&header.path, &header.shape)?;
            let shard = shard_fns.require(&header.path)?;
            let _live = gauge.enter();
            let full = reader.read_leaf(header)?;
            loaded.insert(header.path.clone(), shard.apply(&full)?);
            stats.order.push(header.path.clone());
            stats.bytes += header.nbytes;
            Ok(())
        })?;
        stats.peak_live_leaves = gauge.peak();

        let has_opt_state = loaded.paths().any(|p| p.starts_with(&opt_prefix));
        for expected in target_shapes.paths() {
            let required = expected.starts_with(&params_prefix)
                || (has_opt_state && expected.starts_with(&opt_prefix));
            if required && !loaded.contains(expected) {
                return Err(Error::MissingLeaf {
                    path: expected.to_string(),
                });
            }
        }

        let mut params = ShardedTree::new();
        let mut opt_state = ShardedTree::new();
        for (full_path, leaf) in loaded {
            if let Some(p) = full_path.strip_prefix(&params_prefix) {
                params.insert(p, leaf);
            } else if let Some(p) = full_path.strip_prefix(&opt_prefix) {
                opt_state.insert(p, leaf);
            }
        }
        info!(
            path = %path.display(),
            step = metadata.step,
            leaves = stats.order.len(),
            optimizer_state = has_opt_state,
            "loaded checkpoint"
        );
        Ok(CheckpointRecord {
            metadata,
            params,
            opt_state: has_opt_state.then_some(opt_state),
            stats,
        })
    }

    /// Restore the parameters as plain host tensors, without sharding
    ///
    /// Used for exporting weights and for restoring weights while
    /// reinitializing the optimizer.
    pub fn load_params_only(&self, path: impl AsRef<Path>) -> Result<ParameterTree> {
        let path = path.as_ref();
        let params_prefix = format!("{PARAMS_PREFIX}.");
        let mut params = ParameterTree::new();
        Self::stream(path, |header, reader| match header.path.strip_prefix(&params_prefix) {
            Some(p) => {
                params.insert(p, reader.read_leaf(header)?);
                Ok(())
            }
            None => reader.skip_leaf(header),
        })?;
        Ok(params)
    }

    /// List the records of a checkpoint without materializing tensors
    pub fn inspect(path: impl AsRef<Path>) -> Result<CheckpointSummary> {
        let path = path.as_ref();
        let mut leaves = Vec::new();
        let file = File::open(path)?;
        let file_len = file.metadata()?.len();
        let mut reader = CheckpointReader::new(BufReader::new(file), path, file_len)?;
        let mut metadata = None;
        loop {
            match reader.next_record()? {
                Record::Leaf(header) => {
                    reader.skip_leaf(&header)?;
                    leaves.push(LeafEntry {
                        path: header.path,
                        shape: header.shape,
                        offset: header.offset,
                        nbytes: header.nbytes,
                    });
                }
                Record::Metadata(m) => metadata = Some(m),
                Record::End => break,
            }
        }
        let data_end_offset = reader.metadata_offset().unwrap_or(file_len);
        let metadata = metadata.ok_or_else(|| Error::TruncatedCheckpoint {
            path: path.to_path_buf(),
            reason: "missing metadata record".into(),
        })?;
        Ok(CheckpointSummary {
            path: path.to_path_buf(),
            version: VERSION,
            leaves,
            metadata,
            data_end_offset,
            file_len,
        })
    }

    /// Most recent checkpoint under the root: the rolling file if present,
    /// otherwise the milestone with the highest step
    pub fn latest(&self) -> Result<Option<PathBuf>> {
        let rolling = self.root.join(ROLLING_FILE);
        if rolling.is_file() {
            return Ok(Some(rolling));
        }
        if !self.root.is_dir() {
            return Ok(None);
        }
        let mut best: Option<(u64, PathBuf)> = None;
        for entry in fs::read_dir(&self.root)? {
            let path = entry?.path();
            let Some(step) = path
                .file_name()
                .and_then(|n| n.to_str())
                .and_then(parse_milestone_step)
            else {
                continue;
            };
            match best {
                Some((best_step, _)) if step <= best_step => {}
                _ => best = Some((step, path)),
            }
        }
        Ok(best.map(|(_, path)| path))
    }

    /// Atomically write a JSON side file (such as dataset state) under the root
    pub fn save_json<T: Serialize>(&self, name: &str, value: &T) -> Result<Option<PathBuf>> {
        if !self.enabled {
            return Ok(None);
        }
        fs::create_dir_all(&self.root)?;
        let target = self.root.join(name);
        let mut tmp = tempfile::Builder::new()
            .prefix(".side.")
            .suffix(".tmp")
            .tempfile_in(&self.root)?;
        serde_json::to_writer_pretty(&mut tmp, value)
            .map_err(|e| Error::Serialization(format!("{name}: {e}")))?;
        tmp.flush()?;
        tmp.as_file().sync_all()?;
        tmp.persist(&target).map_err(|e| Error::Io(e.error))?;
        Ok(Some(target))
    }

    /// Read a JSON side file written by [`StreamingCheckpointer::save_json`]
    pub fn load_json<T: DeserializeOwned>(path: impl AsRef<Path>) -> Result<T> {
        let path = path.as_ref();
        let file = File::open(path)?;
        serde_json::from_reader(BufReader::new(file))
            .map_err(|e| Error::Serialization(format!("{}: {e}", path.display())))
    }
}

#[cfg(unix)]
fn sync_dir(dir: &Path) -> Result<()> {
    File::open(dir)?.sync_all()?;
    Ok(())
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) -> Result<()> {
    Ok(())
}

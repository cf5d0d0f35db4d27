// src/store.rs
//
// Durable append-only storage keyed by run id.
//
// Layout under the store root:
//
//   <run_id>/run.json                   run manifest (atomic replace)
//   <run_id>/episodes/<episode>.jsonl   trajectory stream per episode
//   <run_id>/telemetry.jsonl            telemetry records
//   <run_id>/verdicts/<episode>.json    latest replay verdict (atomic replace)
//
// Write model:
// - every record is one `write_all` of a complete JSON line
// - episode boundaries (and every record when fsync is forced) are followed by
//   `sync_data`
// - each log file has its own writer mutex, so appends to different episodes
//   never contend and appends to one file keep their order
// - a torn trailing line left by a crash is truncated the first time the file
//   is reopened for append, and ignored by readers

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, BufReader, Read, Seek, SeekFrom, Write};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::config::{RunConfig, Settings};
use crate::replay::ReplayVerdict;
use crate::telemetry::TelemetryRecord;
use crate::trajectory::{EpisodeSummary, TrajectoryEntry};
use crate::types::{now_ms, EpisodeId, RunId, TimestampMs};

/// Current manifest format version.
pub const MANIFEST_VERSION: u32 = 1;

const MANIFEST_FILE: &str = "run.json";
const EPISODES_DIR: &str = "episodes";
const VERDICTS_DIR: &str = "verdicts";
const TELEMETRY_FILE: &str = "telemetry.jsonl";

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("I/O error on '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to encode record: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("corrupt record in '{path}' at line {line}: {source}")]
    Corrupt {
        path: PathBuf,
        line: u64,
        #[source]
        source: serde_json::Error,
    },
    #[error("run '{0}' not found")]
    RunNotFound(RunId),
    #[error("run '{0}' already exists")]
    RunExists(RunId),
    #[error("episode {episode_id} of run '{run_id}' not found")]
    EpisodeNotFound { run_id: RunId, episode_id: EpisodeId },
    #[error("episode {episode_id} of run '{run_id}' has no episode_begin record")]
    MissingHeader { run_id: RunId, episode_id: EpisodeId },
}

fn io_err(path: &Path) -> impl FnOnce(io::Error) -> StoreError + '_ {
    move |source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Completed,
    Cancelled,
    /// Stopped by a store or recorder failure.
    Aborted,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Cancelled => "cancelled",
            RunStatus::Aborted => "aborted",
        }
    }
}

/// Counts of episode outcomes, filled in when a run stops.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EpisodeCounts {
    pub completed: u64,
    pub truncated: u64,
    pub failed: u64,
}

impl EpisodeCounts {
    pub fn total(&self) -> u64 {
        self.completed + self.truncated + self.failed
    }
}

/// Contents of `run.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunManifest {
    pub format_version: u32,
    pub run_id: RunId,
    pub config: RunConfig,
    pub status: RunStatus,
    pub created_at_ms: TimestampMs,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at_ms: Option<TimestampMs>,
    #[serde(default)]
    pub episodes: EpisodeCounts,
}

impl RunManifest {
    pub fn new(run_id: RunId, config: RunConfig, created_at_ms: TimestampMs) -> Self {
        Self {
            format_version: MANIFEST_VERSION,
            run_id,
            config,
            status: RunStatus::Running,
            created_at_ms,
            finished_at_ms: None,
            episodes: EpisodeCounts::default(),
        }
    }
}

/// Whether an append must reach stable storage before returning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Durability {
    /// Written to the OS; synced only when fsync is forced.
    Written,
    /// Followed by `sync_data`.
    Synced,
}

struct LogWriter {
    path: PathBuf,
    file: File,
}

impl LogWriter {
    fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(io_err(parent))?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(path)
            .map_err(io_err(path))?;
        let cut = truncate_torn_tail(&mut file).map_err(io_err(path))?;
        if cut > 0 {
            tracing::warn!(path = %path.display(), bytes = cut, "truncated torn trailing record");
        }
        Ok(Self {
            path: path.to_path_buf(),
            file,
        })
    }

    fn append(&mut self, line: &[u8], sync: bool) -> Result<(), StoreError> {
        self.file.write_all(line).map_err(io_err(&self.path))?;
        self.file.flush().map_err(io_err(&self.path))?;
        if sync {
            self.file.sync_data().map_err(io_err(&self.path))?;
        }
        Ok(())
    }
}

/// Cut everything after the last newline. Returns the number of bytes removed.
fn truncate_torn_tail(file: &mut File) -> io::Result<u64> {
    const BLOCK: u64 = 8192;

    let len = file.metadata()?.len();
    let mut end = len;
    let mut buf = vec![0u8; BLOCK as usize];
    let mut valid_len = 0;
    while end > 0 {
        let start = end.saturating_sub(BLOCK);
        let chunk = &mut buf[..(end - start) as usize];
        file.seek(SeekFrom::Start(start))?;
        file.read_exact(chunk)?;
        if let Some(pos) = chunk.iter().rposition(|&b| b == b'\n') {
            valid_len = start + pos as u64 + 1;
            break;
        }
        end = start;
    }

    if valid_len < len {
        file.set_len(valid_len)?;
        file.sync_data()?;
    }
    file.seek(SeekFrom::End(0))?;
    Ok(len - valid_len)
}

/// Streaming reader over a JSONL file, in write order.
///
/// A final line without its newline is a torn write and ends the stream.
pub struct JsonlReader<T> {
    path: PathBuf,
    reader: Option<BufReader<File>>,
    line_no: u64,
    buf: Vec<u8>,
    _marker: PhantomData<T>,
}

impl<T> JsonlReader<T> {
    fn open(path: &Path) -> Result<Self, StoreError> {
        let file = File::open(path).map_err(io_err(path))?;
        Ok(Self::from_file(path, Some(file)))
    }

    fn from_file(path: &Path, file: Option<File>) -> Self {
        Self {
            path: path.to_path_buf(),
            reader: file.map(BufReader::new),
            line_no: 0,
            buf: Vec::new(),
            _marker: PhantomData,
        }
    }

    fn empty(path: &Path) -> Self {
        Self::from_file(path, None)
    }
}

impl<T: DeserializeOwned> Iterator for JsonlReader<T> {
    type Item = Result<T, StoreError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let reader = self.reader.as_mut()?;
            self.buf.clear();
            let n = match reader.read_until(b'\n', &mut self.buf) {
                Ok(n) => n,
                Err(e) => {
                    self.reader = None;
                    return Some(Err(io_err(&self.path)(e)));
                }
            };
            if n == 0 || self.buf.last() != Some(&b'\n') {
                self.reader = None;
                return None;
            }
            self.line_no += 1;
            let line = &self.buf[..n - 1];
            if line.iter().all(u8::is_ascii_whitespace) {
                continue;
            }
            return Some(serde_json::from_slice(line).map_err(|source| StoreError::Corrupt {
                path: self.path.clone(),
                line: self.line_no,
                source,
            }));
        }
    }
}

/// Append-only store for runs, trajectories, telemetry and verdicts.
pub struct TelemetryStore {
    root: PathBuf,
    fsync_every_record: bool,
    writers: Mutex<HashMap<PathBuf, Arc<Mutex<LogWriter>>>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl TelemetryStore {
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(io_err(&root))?;
        Ok(Self {
            root,
            fsync_every_record: false,
            writers: Mutex::new(HashMap::new()),
        })
    }

    pub fn from_settings(settings: &Settings) -> Result<Self, StoreError> {
        Ok(Self::open(&settings.runs_dir)?.with_fsync(settings.fsync_every_record))
    }

    /// Force `sync_data` after every record.
    pub fn with_fsync(mut self, fsync_every_record: bool) -> Self {
        self.fsync_every_record = fsync_every_record;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn run_dir(&self, run_id: &RunId) -> PathBuf {
        self.root.join(run_id.as_str())
    }

    fn manifest_path(&self, run_id: &RunId) -> PathBuf {
        self.run_dir(run_id).join(MANIFEST_FILE)
    }

    pub fn episode_path(&self, run_id: &RunId, episode_id: EpisodeId) -> PathBuf {
        self.run_dir(run_id)
            .join(EPISODES_DIR)
            .join(format!("{:06}.jsonl", episode_id.0))
    }

    pub fn telemetry_path(&self, run_id: &RunId) -> PathBuf {
        self.run_dir(run_id).join(TELEMETRY_FILE)
    }

    fn verdict_path(&self, run_id: &RunId, episode_id: EpisodeId) -> PathBuf {
        self.run_dir(run_id)
            .join(VERDICTS_DIR)
            .join(format!("{:06}.json", episode_id.0))
    }

    pub fn episode_exists(&self, run_id: &RunId, episode_id: EpisodeId) -> bool {
        self.episode_path(run_id, episode_id).is_file()
    }

    pub fn run_exists(&self, run_id: &RunId) -> bool {
        self.manifest_path(run_id).is_file()
    }

    // ---------------------------------------------------------------------
    // Runs
    // ---------------------------------------------------------------------

    /// Create the run directory and its manifest. Fails if the run exists.
    pub fn create_run(&self, manifest: &RunManifest) -> Result<(), StoreError> {
        let dir = self.run_dir(&manifest.run_id);
        if self.run_exists(&manifest.run_id) {
            return Err(StoreError::RunExists(manifest.run_id.clone()));
        }
        for sub in [EPISODES_DIR, VERDICTS_DIR] {
            let path = dir.join(sub);
            fs::create_dir_all(&path).map_err(io_err(&path))?;
        }
        self.write_manifest(manifest)
    }

    /// Atomically replace `run.json`.
    pub fn write_manifest(&self, manifest: &RunManifest) -> Result<(), StoreError> {
        write_json_atomic(&self.manifest_path(&manifest.run_id), manifest)
    }

    pub fn load_manifest(&self, run_id: &RunId) -> Result<RunManifest, StoreError> {
        let path = self.manifest_path(run_id);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(StoreError::RunNotFound(run_id.clone()))
            }
            Err(e) => return Err(io_err(&path)(e)),
        };
        serde_json::from_slice(&bytes).map_err(|source| StoreError::Corrupt {
            path,
            line: 1,
            source,
        })
    }

    /// Overwrite a finished run's status, e.g. when a failure surfaces after
    /// the runner wrote its manifest.
    pub fn set_run_status(&self, run_id: &RunId, status: RunStatus) -> Result<RunManifest, StoreError> {
        let mut manifest = self.load_manifest(run_id)?;
        manifest.status = status;
        manifest.finished_at_ms.get_or_insert_with(now_ms);
        self.write_manifest(&manifest)?;
        Ok(manifest)
    }

    /// Run ids with a manifest, sorted.
    pub fn list_runs(&self) -> Result<Vec<RunId>, StoreError> {
        let mut runs = Vec::new();
        for entry in fs::read_dir(&self.root).map_err(io_err(&self.root))? {
            let entry = entry.map_err(io_err(&self.root))?;
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            if let Ok(run_id) = name.parse::<RunId>() {
                if self.run_exists(&run_id) {
                    runs.push(run_id);
                }
            }
        }
        runs.sort();
        Ok(runs)
    }

    /// Delete a run and everything recorded under it.
    pub fn remove_run(&self, run_id: &RunId) -> Result<(), StoreError> {
        let dir = self.run_dir(run_id);
        if !dir.is_dir() {
            return Err(StoreError::RunNotFound(run_id.clone()));
        }
        lock(&self.writers).retain(|path, _| !path.starts_with(&dir));
        fs::remove_dir_all(&dir).map_err(io_err(&dir))?;
        tracing::info!(run_id = %run_id, "removed run");
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Appends
    // ---------------------------------------------------------------------

    /// Drop the cached writer of a finished episode.
    pub fn close_episode(&self, run_id: &RunId, episode_id: EpisodeId) {
        lock(&self.writers).remove(&self.episode_path(run_id, episode_id));
    }

    fn writer(&self, path: PathBuf) -> Result<Arc<Mutex<LogWriter>>, StoreError> {
        let mut writers = lock(&self.writers);
        if let Some(w) = writers.get(&path) {
            return Ok(Arc::clone(w));
        }
        let w = Arc::new(Mutex::new(LogWriter::open(&path)?));
        writers.insert(path, Arc::clone(&w));
        Ok(w)
    }

    fn append_lines<T: Serialize>(
        &self,
        path: PathBuf,
        records: &[T],
        durability: Durability,
    ) -> Result<(), StoreError> {
        if records.is_empty() {
            return Ok(());
        }
        let mut buf = Vec::new();
        for record in records {
            serde_json::to_writer(&mut buf, record)?;
            buf.push(b'\n');
        }
        let sync = durability == Durability::Synced || self.fsync_every_record;
        let writer = self.writer(path)?;
        let mut writer = lock(&writer);
        writer.append(&buf, sync)
    }

    pub fn append_trajectory(
        &self,
        run_id: &RunId,
        episode_id: EpisodeId,
        entry: &TrajectoryEntry,
        durability: Durability,
    ) -> Result<(), StoreError> {
        self.append_lines(
            self.episode_path(run_id, episode_id),
            std::slice::from_ref(entry),
            durability,
        )
    }

    pub fn append_telemetry(
        &self,
        run_id: &RunId,
        records: &[TelemetryRecord],
    ) -> Result<(), StoreError> {
        self.append_lines(self.telemetry_path(run_id), records, Durability::Written)
    }

    // ---------------------------------------------------------------------
    // Reads
    // ---------------------------------------------------------------------

    /// Stream an episode's trajectory entries in write order.
    pub fn read_trajectory(
        &self,
        run_id: &RunId,
        episode_id: EpisodeId,
    ) -> Result<JsonlReader<TrajectoryEntry>, StoreError> {
        let path = self.episode_path(run_id, episode_id);
        if !path.is_file() {
            if !self.run_exists(run_id) {
                return Err(StoreError::RunNotFound(run_id.clone()));
            }
            return Err(StoreError::EpisodeNotFound {
                run_id: run_id.clone(),
                episode_id,
            });
        }
        JsonlReader::open(&path)
    }

    /// Stream a run's telemetry records in write order.
    pub fn read_telemetry(
        &self,
        run_id: &RunId,
    ) -> Result<JsonlReader<TelemetryRecord>, StoreError> {
        let path = self.telemetry_path(run_id);
        if path.is_file() {
            return JsonlReader::open(&path);
        }
        if !self.run_exists(run_id) {
            return Err(StoreError::RunNotFound(run_id.clone()));
        }
        Ok(JsonlReader::empty(&path))
    }

    /// Episode ids recorded for a run, sorted.
    pub fn list_episodes(&self, run_id: &RunId) -> Result<Vec<EpisodeId>, StoreError> {
        if !self.run_exists(run_id) {
            return Err(StoreError::RunNotFound(run_id.clone()));
        }
        let dir = self.run_dir(run_id).join(EPISODES_DIR);
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(io_err(&dir)(e)),
        };
        let mut episodes = Vec::new();
        for entry in entries {
            let entry = entry.map_err(io_err(&dir))?;
            let name = entry.file_name();
            let Some(stem) = name.to_str().and_then(|n| n.strip_suffix(".jsonl")) else {
                continue;
            };
            if let Ok(id) = stem.parse::<EpisodeId>() {
                episodes.push(id);
            }
        }
        episodes.sort();
        Ok(episodes)
    }

    /// Header, step count and end record of an episode, streaming past steps.
    pub fn episode_summary(
        &self,
        run_id: &RunId,
        episode_id: EpisodeId,
    ) -> Result<EpisodeSummary, StoreError> {
        let mut header = None;
        let mut steps_recorded = 0;
        let mut end = None;
        for entry in self.read_trajectory(run_id, episode_id)? {
            match entry? {
                TrajectoryEntry::EpisodeBegin(h) => header = Some(h),
                TrajectoryEntry::Step(_) => steps_recorded += 1,
                TrajectoryEntry::EpisodeEnd(e) => end = Some(e),
            }
        }
        let header = header.ok_or_else(|| StoreError::MissingHeader {
            run_id: run_id.clone(),
            episode_id,
        })?;
        Ok(EpisodeSummary {
            header,
            steps_recorded,
            end,
        })
    }

    // ---------------------------------------------------------------------
    // Verdicts
    // ---------------------------------------------------------------------

    /// Store the latest verdict for an episode, replacing any previous one.
    pub fn write_verdict(&self, verdict: &ReplayVerdict) -> Result<(), StoreError> {
        write_json_atomic(&self.verdict_path(&verdict.run_id, verdict.episode_id), verdict)
    }

    pub fn read_verdict(
        &self,
        run_id: &RunId,
        episode_id: EpisodeId,
    ) -> Result<Option<ReplayVerdict>, StoreError> {
        let path = self.verdict_path(run_id, episode_id);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(io_err(&path)(e)),
        };
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|source| StoreError::Corrupt {
                path,
                line: 1,
                source,
            })
    }
}

/// Write to a temp file in the target directory, sync, then rename over the
/// target.
fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<(), StoreError> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(dir).map_err(io_err(dir))?;
    let bytes = serde_json::to_vec_pretty(value)?;
    let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(io_err(dir))?;
    tmp.write_all(&bytes).map_err(io_err(path))?;
    tmp.as_file().sync_data().map_err(io_err(path))?;
    tmp.persist(path).map_err(|e| StoreError::Io {
        path: path.to_path_buf(),
        source: e.error,
    })?;
    Ok(())
}

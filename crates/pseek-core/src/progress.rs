//! Job status reporting and cooperative pause/cancel control
//!
//! Every long-running job writes `index_status.json` in the index directory
//! (atomic temp + rename) so out-of-process UIs can poll progress. A
//! companion `index_control.json` carrying `{ "pause": bool }` is re-read
//! between batches; cancellation is an in-process flag owned by the caller.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::store::{read_json_file, write_json_atomic};

/// Status file name inside an index directory.
pub const STATUS_FILE: &str = "index_status.json";

/// Control file name inside an index directory.
pub const CONTROL_FILE: &str = "index_control.json";

/// Initial sleep while paused; doubled up to [`MAX_PAUSE_BACKOFF`].
const PAUSE_BACKOFF_START: Duration = Duration::from_millis(50);

/// Longest sleep between pause re-checks.
const MAX_PAUSE_BACKOFF: Duration = Duration::from_millis(500);

/// Lifecycle state of the most recent job for an index directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Running,
    Paused,
    Complete,
    Cancelled,
    Error,
}

/// Which producer wrote the status file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobKind {
    Indexing,
    Ocr,
    Captions,
    Metadata,
    Hashes,
    Faces,
}

/// Contents of `index_status.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobStatus {
    pub job: JobKind,
    pub state: JobState,
    pub start: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end: Option<String>,
    /// Number of items the job was asked to cover.
    #[serde(default)]
    pub target: usize,
    /// Rows already present when the job started.
    #[serde(default)]
    pub existing: usize,
    #[serde(default)]
    pub updated_done: usize,
    #[serde(default)]
    pub updated_total: usize,
    #[serde(default)]
    pub insert_done: usize,
    #[serde(default)]
    pub insert_total: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl JobStatus {
    fn started(job: JobKind, target: usize, existing: usize) -> Self {
        Self {
            job,
            state: JobState::Running,
            start: utc_timestamp(),
            end: None,
            target,
            existing,
            updated_done: 0,
            updated_total: 0,
            insert_done: 0,
            insert_total: 0,
            error: None,
        }
    }
}

/// Contents of `index_control.json`.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct JobControl {
    #[serde(default)]
    pub pause: bool,
}

/// Caller-owned cancellation signal, checked between batches.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// Writes the status file for one job and polls the control file.
///
/// All writes are best-effort: a failure to record progress must never fail
/// the job itself.
pub struct JobTracker {
    status_path: PathBuf,
    control_path: PathBuf,
    cancel: CancelFlag,
    status: JobStatus,
}

impl JobTracker {
    /// Begin a job of the given kind, immediately publishing `running`.
    pub fn start(index_dir: &Path, job: JobKind, target: usize, existing: usize) -> Self {
        Self::with_cancel(index_dir, job, target, existing, CancelFlag::new())
    }

    /// Begin a job wired to an external cancel flag.
    pub fn with_cancel(
        index_dir: &Path,
        job: JobKind,
        target: usize,
        existing: usize,
        cancel: CancelFlag,
    ) -> Self {
        let tracker = Self {
            status_path: index_dir.join(STATUS_FILE),
            control_path: index_dir.join(CONTROL_FILE),
            cancel,
            status: JobStatus::started(job, target, existing),
        };
        tracker.flush();
        tracker
    }

    pub fn cancel_flag(&self) -> CancelFlag {
        self.cancel.clone()
    }

    /// Mutate counters and republish the status file.
    pub fn update(&mut self, f: impl FnOnce(&mut JobStatus)) {
        f(&mut self.status);
        self.flush();
    }

    /// Batch-boundary suspension point.
    ///
    /// Blocks while the control file requests a pause (sleeping with
    /// exponential backoff capped at 500 ms) and returns `false` once the
    /// cancel flag is observed; the caller stops and keeps partial progress.
    pub fn checkpoint(&mut self) -> bool {
        if self.cancel.is_cancelled() {
            self.finish(JobState::Cancelled, None);
            return false;
        }

        let mut backoff = PAUSE_BACKOFF_START;
        while self.pause_requested() {
            if self.status.state != JobState::Paused {
                self.status.state = JobState::Paused;
                self.flush();
            }
            std::thread::sleep(backoff);
            backoff = (backoff * 2).min(MAX_PAUSE_BACKOFF);
            if self.cancel.is_cancelled() {
                self.finish(JobState::Cancelled, None);
                return false;
            }
        }
        if self.status.state == JobState::Paused {
            self.status.state = JobState::Running;
            self.flush();
        }
        true
    }

    /// Publish a terminal `complete` state.
    pub fn complete(&mut self) {
        self.finish(JobState::Complete, None);
    }

    /// Publish a terminal `error` state with a human-readable message.
    pub fn fail(&mut self, message: impl Into<String>) {
        self.finish(JobState::Error, Some(message.into()));
    }

    fn finish(&mut self, state: JobState, error: Option<String>) {
        self.status.state = state;
        self.status.end = Some(utc_timestamp());
        self.status.error = error;
        self.flush();
    }

    fn pause_requested(&self) -> bool {
        match read_json_file::<JobControl>(&self.control_path) {
            Ok(Some(control)) => control.pause,
            Ok(None) => false,
            Err(e) => {
                tracing::debug!("unreadable control file, treating as not paused: {e}");
                false
            }
        }
    }

    fn flush(&self) {
        if let Err(e) = write_json_atomic(&self.status_path, &self.status) {
            tracing::warn!("failed to write job status: {e}");
        }
    }
}

/// Write the control file, requesting or clearing a pause.
pub fn request_pause(index_dir: &Path, pause: bool) -> Result<()> {
    write_json_atomic(&index_dir.join(CONTROL_FILE), &JobControl { pause })
}

/// Read the most recent job status, if any was ever written.
pub fn read_status(index_dir: &Path) -> Result<Option<JobStatus>> {
    read_json_file(&index_dir.join(STATUS_FILE))
}

/// RFC 3339 UTC timestamp with second precision.
pub fn utc_timestamp() -> String {
    chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string()
}

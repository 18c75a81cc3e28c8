//! Persistent cluster state on a shared filesystem
//!
//! All mutations go through read-modify-write under a single advisory file
//! lock. Writes replace the whole document atomically (temp file + rename),
//! so readers never observe a torn state. The cancellation flag is the one
//! piece of state deliberately outside the lock: its presence alone is the
//! signal, so workers can poll it cheaply.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};
use fs2::FileExt;
use tracing::{debug, warn};

use super::state::{ClusterState, JobResult};
use crate::output::OutputDir;

/// How long a submitter iteration will wait for the cluster lock.
const LOCK_TIMEOUT: Duration = Duration::from_secs(600);
const LOCK_RETRY_INTERVAL: Duration = Duration::from_millis(250);

/// Held advisory lock on the cluster state. Released on drop.
pub struct ClusterLock {
    file: File,
}

impl Drop for ClusterLock {
    fn drop(&mut self) {
        // Also released by the OS when the process exits.
        let _ = fs2::FileExt::unlock(&self.file);
    }
}

/// Handle to one run's persistent cluster state.
#[derive(Debug, Clone)]
pub struct ClusterStore {
    output: OutputDir,
}

impl ClusterStore {
    pub fn new(output: OutputDir) -> Self {
        Self { output }
    }

    pub fn output(&self) -> &OutputDir {
        &self.output
    }

    /// Create the output layout and the initial state document.
    pub fn initialize(&self, state: &ClusterState) -> Result<()> {
        self.output.ensure_layout()?;
        self.write_state(state)
    }

    /// Acquire the cluster lock, blocking up to ten minutes.
    ///
    /// A timeout usually means a previous holder died mid-iteration. There is
    /// no safe automatic recovery: if the holder was merely slow, stealing the
    /// lock would permit duplicate submission. The manual procedure is to
    /// verify no submitter is alive, delete the lock file, and run
    /// `jade try-submit`.
    pub fn lock(&self) -> Result<ClusterLock> {
        let lock_path = self.output.lock_path();
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(&lock_path)
            .with_context(|| format!("Failed to create lock file: {}", lock_path.display()))?;

        let start = Instant::now();
        loop {
            match file.try_lock_exclusive() {
                Ok(()) => {
                    debug!(path = %lock_path.display(), "acquired cluster lock");
                    return Ok(ClusterLock { file });
                }
                Err(_) if start.elapsed() < LOCK_TIMEOUT => {
                    std::thread::sleep(LOCK_RETRY_INTERVAL);
                }
                Err(err) => {
                    bail!(
                        "timed out waiting for cluster lock {} after {}s: {err}. \
                         If the previous holder is dead, delete the lock file and \
                         run `jade try-submit`.",
                        lock_path.display(),
                        LOCK_TIMEOUT.as_secs(),
                    );
                }
            }
        }
    }

    /// Read the state document. Only meaningful while holding the lock.
    pub fn read_state(&self) -> Result<ClusterState> {
        let path = self.output.state_path();
        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read cluster state: {}", path.display()))?;
        let state: ClusterState = serde_json::from_str(&content)
            .with_context(|| format!("Corrupt cluster state: {}", path.display()))?;
        Ok(state)
    }

    /// Replace the state document atomically, bumping its version.
    pub fn write_state(&self, state: &ClusterState) -> Result<()> {
        let mut state = state.clone();
        state.version += 1;

        let path = self.output.state_path();
        let content = serde_json::to_string_pretty(&state)
            .with_context(|| "Failed to serialize cluster state")?;

        let temp_path = path.with_extension("json.tmp");
        let mut temp_file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&temp_path)
            .with_context(|| format!("Failed to create temp file: {}", temp_path.display()))?;
        temp_file
            .write_all(content.as_bytes())
            .with_context(|| "Failed to write cluster state")?;
        temp_file
            .sync_all()
            .with_context(|| "Failed to sync cluster state")?;
        fs::rename(&temp_path, &path)
            .with_context(|| format!("Failed to rename cluster state: {}", path.display()))?;

        debug!(version = state.version, "wrote cluster state");
        Ok(())
    }

    /// Drain staged per-batch result CSVs into the state.
    ///
    /// Each new row is appended to `completed_results` and to the canonical
    /// `processed_results.csv`; a CSV file is deleted only after its rows are
    /// safely recorded, which makes the handoff restartable. Returns the
    /// number of newly recorded results.
    pub fn drain_batch_results(&self, state: &mut ClusterState) -> Result<usize> {
        let mut drained = 0;
        for path in self.output.list_batch_result_files()? {
            let mut reader = csv::Reader::from_path(&path)
                .with_context(|| format!("Failed to open batch results: {}", path.display()))?;

            let mut new_rows = Vec::new();
            for row in reader.deserialize() {
                let result: JobResult = row.with_context(|| {
                    format!("Malformed result row in {}", path.display())
                })?;
                if state.record_result(result.clone()) {
                    new_rows.push(result);
                }
            }

            self.append_processed_results(&new_rows)?;
            drained += new_rows.len();

            fs::remove_file(&path)
                .with_context(|| format!("Failed to remove drained CSV: {}", path.display()))?;
            debug!(path = %path.display(), rows = new_rows.len(), "drained batch results");
        }
        Ok(drained)
    }

    /// Append rows to the canonical results CSV, writing the header on first use.
    fn append_processed_results(&self, results: &[JobResult]) -> Result<()> {
        if results.is_empty() {
            return Ok(());
        }
        let path = self.output.processed_results_path();
        let write_header = !path.exists();
        let file = OpenOptions::new()
            .append(true)
            .create(true)
            .open(&path)
            .with_context(|| format!("Failed to open {}", path.display()))?;
        let mut writer = csv::WriterBuilder::new()
            .has_headers(write_header)
            .from_writer(file);
        for result in results {
            writer
                .serialize(result)
                .with_context(|| "Failed to append processed result")?;
        }
        writer.flush().with_context(|| "Failed to flush processed results")?;
        Ok(())
    }

    /// Read every row of `processed_results.csv`.
    pub fn read_processed_results(&self) -> Result<Vec<JobResult>> {
        let path = self.output.processed_results_path();
        if !path.exists() {
            return Ok(Vec::new());
        }
        let mut reader = csv::Reader::from_path(&path)
            .with_context(|| format!("Failed to open {}", path.display()))?;
        let mut results = Vec::new();
        for row in reader.deserialize() {
            let result: JobResult =
                row.with_context(|| format!("Malformed row in {}", path.display()))?;
            results.push(result);
        }
        Ok(results)
    }

    /// Request cancellation by creating the flag file.
    pub fn request_cancel(&self) -> Result<()> {
        let path = self.output.cancel_flag_path();
        fs::write(&path, b"")
            .with_context(|| format!("Failed to create cancellation flag: {}", path.display()))?;
        warn!("cancellation requested");
        Ok(())
    }

    /// Lock-free probe for the cancellation flag.
    pub fn is_cancel_requested(&self) -> bool {
        self.output.cancel_flag_path().exists()
    }

    /// Remove the cancellation flag (used when preparing a resubmission).
    pub fn clear_cancel_flag(&self) -> Result<()> {
        let path = self.output.cancel_flag_path();
        if path.exists() {
            fs::remove_file(&path)
                .with_context(|| format!("Failed to remove {}", path.display()))?;
        }
        Ok(())
    }
}

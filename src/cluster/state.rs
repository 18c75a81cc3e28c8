//! Cluster state document
//!
//! A single JSON document on the shared filesystem, rewritten whole under the
//! cluster lock. The document is small; whole-document replacement keeps the
//! coordination protocol trivial to reason about.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::Configuration;

/// Terminal state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// The job ran to completion (its exit code may still be non-zero)
    Finished,
    /// The enclosing allocation ended before the job reported a result
    Missing,
    /// The job was canceled before or during execution
    Canceled,
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobStatus::Finished => write!(f, "finished"),
            JobStatus::Missing => write!(f, "missing"),
            JobStatus::Canceled => write!(f, "canceled"),
        }
    }
}

/// One job's persisted outcome. Field order matches the result CSV schema.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobResult {
    pub name: String,
    pub job_id: u64,
    pub return_code: i32,
    pub status: JobStatus,
    pub exec_time_s: f64,
    pub completion_time: DateTime<Utc>,
    pub batch_id: u64,
    pub hpc_job_id: String,
    pub output_dir: PathBuf,
}

impl JobResult {
    pub fn is_success(&self) -> bool {
        self.status == JobStatus::Finished && self.return_code == 0
    }

    /// A row for a job that never ran (canceled or killed with its node).
    pub fn synthetic(
        name: String,
        job_id: u64,
        status: JobStatus,
        batch_id: u64,
        hpc_job_id: String,
        output_dir: PathBuf,
    ) -> Self {
        Self {
            name,
            job_id,
            return_code: -1,
            status,
            exec_time_s: 0.0,
            completion_time: Utc::now(),
            batch_id,
            hpc_job_id,
            output_dir,
        }
    }
}

/// Lifecycle of a batch while it owns an `active_batches` entry. A batch
/// whose jobs are all terminal is removed from the map outright rather than
/// kept in a retired state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchState {
    /// Handed to the scheduler, not yet running on a node
    Submitted,
    /// A node picked it up and is executing jobs
    InProgress,
}

/// A batch the scheduler currently owns.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActiveBatch {
    pub hpc_job_id: String,

    /// Compute nodes the batch landed on, once the runner reports in
    #[serde(default)]
    pub node_names: Vec<String>,

    pub submission_group: String,
    pub job_ids: Vec<u64>,
    pub state: BatchState,
}

/// The shared cluster state document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterState {
    /// Fingerprint of the configuration this run was created from
    pub config_id: String,

    /// Jobs placed into a successfully submitted batch
    pub submitted_jobs: BTreeSet<u64>,

    /// One entry per job that reached a terminal state
    pub completed_results: Vec<JobResult>,

    /// Batches submitted to the scheduler and not yet fully accounted for
    pub active_batches: BTreeMap<u64, ActiveBatch>,

    /// Next batch id to allocate; monotonic within an output directory
    pub next_batch_id: u64,

    /// Whether node scripts re-enter the submitter on exit
    pub distributed_submitter: bool,

    pub is_complete: bool,
    pub canceled: bool,

    /// Bumped on every write
    pub version: u64,
}

impl ClusterState {
    pub fn new(config: &Configuration) -> Self {
        Self {
            config_id: config.config_id(),
            submitted_jobs: BTreeSet::new(),
            completed_results: Vec::new(),
            active_batches: BTreeMap::new(),
            next_batch_id: 1,
            distributed_submitter: true,
            is_complete: false,
            canceled: false,
            version: 0,
        }
    }

    pub fn result_for(&self, job_id: u64) -> Option<&JobResult> {
        self.completed_results.iter().find(|r| r.job_id == job_id)
    }

    pub fn is_terminal(&self, job_id: u64) -> bool {
        self.result_for(job_id).is_some()
    }

    /// Whether every job in the configuration has a terminal result.
    pub fn all_terminal(&self, config: &Configuration) -> bool {
        config.jobs.iter().all(|j| self.is_terminal(j.job_id))
    }

    /// Record a result, keeping `submitted_jobs` a superset of completed jobs.
    ///
    /// Duplicate rows for a job (a drained CSV replayed after a crash) are
    /// dropped; the first result for a job id wins.
    pub fn record_result(&mut self, result: JobResult) -> bool {
        if self.is_terminal(result.job_id) {
            return false;
        }
        self.submitted_jobs.insert(result.job_id);
        self.completed_results.push(result);
        true
    }

    /// Count of results by (status, success).
    pub fn summary_counts(&self) -> StateSummary {
        let mut summary = StateSummary::default();
        for result in &self.completed_results {
            match result.status {
                JobStatus::Finished if result.return_code == 0 => summary.successful += 1,
                JobStatus::Finished => summary.failed += 1,
                JobStatus::Missing => summary.missing += 1,
                JobStatus::Canceled => summary.canceled += 1,
            }
        }
        summary
    }
}

/// Result totals for status displays and the final report.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct StateSummary {
    pub successful: usize,
    pub failed: usize,
    pub missing: usize,
    pub canceled: usize,
}

impl StateSummary {
    pub fn total(&self) -> usize {
        self.successful + self.failed + self.missing + self.canceled
    }

    pub fn all_successful(&self) -> bool {
        self.failed == 0 && self.missing == 0 && self.canceled == 0
    }
}

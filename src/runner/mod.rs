//! Per-node batch execution

mod pool;
mod process;
mod results;

pub use pool::{PoolSummary, run_pool};
pub use process::{JobExecution, execute_job, run_hook};
pub use results::BatchResultWriter;

use std::path::Path;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{error, info, warn};

use crate::cluster::{JobResult, JobStatus};
use crate::config::Configuration;
use crate::output::OutputDir;

/// SIGTERM-to-SIGKILL escalation window during cancellation.
const GRACE_PERIOD: Duration = Duration::from_secs(30);

/// Per-batch execution context shared by every worker.
pub struct RunContext {
    pub output: OutputDir,
    pub group_name: String,

    /// `user_data` from the configuration, pre-serialized for the environment
    pub user_data_json: Option<String>,

    /// Compute nodes in this allocation, when the scheduler announces them
    pub node_names: Option<Vec<String>>,

    pub batch_id: u64,
    pub hpc_job_id: String,
    pub poll_interval: Duration,
    pub grace_period: Duration,
}

impl RunContext {
    /// Check the cancel latch, falling back to a lock-free probe of the flag
    /// file. An observed flag is latched so every worker converges on the
    /// same answer.
    pub fn cancel_requested(&self, latch: &AtomicBool) -> bool {
        if latch.load(Ordering::Relaxed) {
            return true;
        }
        if self.output.cancel_flag_path().exists() {
            latch.store(true, Ordering::Relaxed);
            return true;
        }
        false
    }
}

/// Executes one batch on one node: setup hook, worker pool, teardown hook.
pub struct JobRunner {
    output: OutputDir,
    config: Configuration,
    batch_id: u64,
    hpc_job_id: String,
}

impl JobRunner {
    /// Load the runner from the filtered batch config the submitter wrote.
    pub fn from_batch_config(
        batch_config_path: &Path,
        output: OutputDir,
        batch_id: u64,
    ) -> Result<Self> {
        let config = Configuration::from_file(batch_config_path)?;
        let hpc_job_id = std::env::var("JADE_HPC_JOB_ID").unwrap_or_else(|_| "local".to_string());
        Ok(Self {
            output,
            config,
            batch_id,
            hpc_job_id,
        })
    }

    pub fn new(output: OutputDir, config: Configuration, batch_id: u64, hpc_job_id: String) -> Self {
        Self {
            output,
            config,
            batch_id,
            hpc_job_id,
        }
    }

    /// Nodes in the current allocation, as announced by the scheduler.
    fn discover_node_names() -> Option<Vec<String>> {
        std::env::var("SLURM_JOB_NODELIST")
            .ok()
            .map(|list| list.split(',').map(|s| s.trim().to_string()).collect())
    }

    /// Run the whole batch. Job-level failures are recorded, never returned;
    /// `Err` means the node could not perform the batch protocol itself.
    pub fn run(&self) -> Result<PoolSummary> {
        let group = match self.config.jobs.first() {
            Some(job) => self.config.group_for_job(job).clone(),
            None => {
                warn!(batch_id = self.batch_id, "batch config contains no jobs");
                return Ok(PoolSummary::default());
            }
        };
        let params = &group.submitter_params;

        self.output.ensure_layout()?;
        let node_names = Self::discover_node_names();
        let hpc_nodes = params
            .hpc_config
            .as_ref()
            .map(|settings| settings.nodes)
            .unwrap_or(1);
        let ctx = RunContext {
            output: self.output.clone(),
            group_name: group.name.clone(),
            user_data_json: self
                .config
                .user_data
                .as_ref()
                .map(|data| serde_json::to_string(data))
                .transpose()
                .with_context(|| "Failed to serialize user_data")?,
            node_names: node_names.filter(|names| hpc_nodes > 1 || names.len() > 1),
            batch_id: self.batch_id,
            hpc_job_id: self.hpc_job_id.clone(),
            poll_interval: Duration::from_secs(self.config.poll_interval_secs().max(1)),
            grace_period: GRACE_PERIOD,
        };

        let writer_path = self.output.batch_results_path(self.batch_id);
        let writer = Mutex::new(BatchResultWriter::create(&writer_path)?);

        info!(
            batch_id = self.batch_id,
            jobs = self.config.jobs.len(),
            group = %group.name,
            "running batch"
        );

        let summary = match self.run_node_setup(params.node_setup_command.as_deref()) {
            Ok(()) => run_pool(&self.config.jobs, params.parallelism(), &ctx, &writer)?,
            Err(setup_code) => self.fail_whole_batch(&ctx, &writer, setup_code)?,
        };

        if let Some(teardown) = params.node_teardown_command.as_deref() {
            match run_hook(teardown, "node teardown") {
                Ok(0) => {}
                Ok(code) => error!(code, "node teardown command failed"),
                Err(err) => error!(error = %err, "node teardown command failed to run"),
            }
        }

        info!(
            batch_id = self.batch_id,
            succeeded = summary.succeeded,
            failed = summary.failed,
            canceled = summary.canceled,
            "batch finished"
        );
        Ok(summary)
    }

    /// Run the setup hook; a non-zero exit aborts the batch.
    fn run_node_setup(&self, setup: Option<&[String]>) -> std::result::Result<(), i32> {
        let Some(argv) = setup else {
            return Ok(());
        };
        match run_hook(argv, "node setup") {
            Ok(0) => Ok(()),
            Ok(code) => {
                error!(code, "node setup command failed, failing batch");
                Err(code)
            }
            Err(err) => {
                error!(error = %err, "node setup command failed to run");
                Err(1)
            }
        }
    }

    /// Emit a failure row for every job when node setup fails.
    fn fail_whole_batch(
        &self,
        ctx: &RunContext,
        writer: &Mutex<BatchResultWriter>,
        setup_code: i32,
    ) -> Result<PoolSummary> {
        let mut summary = PoolSummary::default();
        let mut guard = writer.lock().unwrap_or_else(|e| e.into_inner());
        for job in &self.config.jobs {
            let mut row = JobResult::synthetic(
                job.name(),
                job.job_id,
                JobStatus::Finished,
                ctx.batch_id,
                ctx.hpc_job_id.clone(),
                ctx.output.root().to_path_buf(),
            );
            row.return_code = setup_code;
            guard.write(&row)?;
            summary.failed += 1;
        }
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{JobSpec, SubmissionGroup, SubmitterParams};

    fn runner_with(
        tmp: &tempfile::TempDir,
        jobs: Vec<JobSpec>,
        params: SubmitterParams,
    ) -> JobRunner {
        let output = OutputDir::new(tmp.path());
        output.ensure_layout().unwrap();
        let config = Configuration::new(
            jobs,
            vec![SubmissionGroup {
                name: "default".to_string(),
                submitter_params: params,
            }],
        );
        JobRunner::new(output, config, 1, "hpc-test".to_string())
    }

    fn read_rows(tmp: &tempfile::TempDir) -> Vec<JobResult> {
        let output = OutputDir::new(tmp.path());
        let mut reader = csv::Reader::from_path(output.batch_results_path(1)).unwrap();
        reader.deserialize().map(|r| r.unwrap()).collect()
    }

    #[test]
    fn test_run_writes_result_rows() {
        let tmp = tempfile::TempDir::new().unwrap();
        let runner = runner_with(
            &tmp,
            vec![JobSpec::new(1, "true"), JobSpec::new(2, "false")],
            SubmitterParams {
                num_parallel_processes_per_node: Some(2),
                ..SubmitterParams::default()
            },
        );

        let summary = runner.run().unwrap();
        assert_eq!(summary.succeeded, 1);
        assert_eq!(summary.failed, 1);

        let rows = read_rows(&tmp);
        assert_eq!(rows.len(), 2);
        assert!(rows.iter().all(|r| r.hpc_job_id == "hpc-test"));
        assert!(rows.iter().all(|r| r.batch_id == 1));
    }

    #[test]
    fn test_node_setup_failure_fails_every_job() {
        let tmp = tempfile::TempDir::new().unwrap();
        let marker = tmp.path().join("teardown-ran");
        let runner = runner_with(
            &tmp,
            vec![JobSpec::new(1, "true"), JobSpec::new(2, "true")],
            SubmitterParams {
                node_setup_command: Some(vec!["false".to_string()]),
                node_teardown_command: Some(vec![
                    "touch".to_string(),
                    marker.display().to_string(),
                ]),
                ..SubmitterParams::default()
            },
        );

        let summary = runner.run().unwrap();
        assert_eq!(summary.failed, 2);
        assert_eq!(summary.succeeded, 0);

        let rows = read_rows(&tmp);
        assert_eq!(rows.len(), 2);
        assert!(rows.iter().all(|r| r.return_code == 1));
        // Teardown runs regardless of job results.
        assert!(marker.exists());
    }

    #[test]
    fn test_node_teardown_runs_after_jobs() {
        let tmp = tempfile::TempDir::new().unwrap();
        let marker = tmp.path().join("teardown-ran");
        let runner = runner_with(
            &tmp,
            vec![JobSpec::new(1, "true")],
            SubmitterParams {
                node_teardown_command: Some(vec![
                    "touch".to_string(),
                    marker.display().to_string(),
                ]),
                ..SubmitterParams::default()
            },
        );

        runner.run().unwrap();
        assert!(marker.exists());
    }
}

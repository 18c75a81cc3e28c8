//! Batch submission to the scheduler

mod driver;

pub use driver::{RunOutcome, SubmitterLoop};

use std::time::Duration;

use anyhow::{Context, Result, bail};
use tracing::{info, warn};

use crate::batch::{BatchSpec, PlannedBatch};
use crate::cluster::{ActiveBatch, BatchState, ClusterState};
use crate::config::{Configuration, HpcConfig};
use crate::hpc::{HpcAdapter, ScriptContext, current_executable};
use crate::output::OutputDir;

// Retry policy for transient scheduler failures. One edit away from being
// configuration if a site ever needs different values.
const SUBMIT_ATTEMPTS: u32 = 3;
const SUBMIT_BACKOFF_BASE: Duration = Duration::from_secs(1);

/// Places formed batches with the scheduler and records them in the state.
pub struct HpcSubmitter<'a> {
    config: &'a Configuration,
    hpc_config: &'a HpcConfig,
    adapter: &'a dyn HpcAdapter,
    output: &'a OutputDir,
}

impl<'a> HpcSubmitter<'a> {
    pub fn new(
        config: &'a Configuration,
        hpc_config: &'a HpcConfig,
        adapter: &'a dyn HpcAdapter,
        output: &'a OutputDir,
    ) -> Self {
        Self {
            config,
            hpc_config,
            adapter,
            output,
        }
    }

    /// Submit one planned batch.
    ///
    /// On success the batch enters `active_batches` and its jobs enter
    /// `submitted_jobs`. On failure the state is untouched, so the jobs are
    /// recomputed (under a fresh batch id) by the next submitter iteration.
    pub fn submit_batch(&self, state: &mut ClusterState, planned: &PlannedBatch) -> Result<String> {
        let group = self
            .config
            .group(&planned.submission_group)
            .with_context(|| format!("unknown submission group '{}'", planned.submission_group))?;

        let config_path = self.output.batch_config_path(planned.batch_id);
        let filtered = self.config.filtered(&planned.job_ids);
        filtered.save_to_file(&config_path)?;

        let batch = BatchSpec {
            batch_id: planned.batch_id,
            job_ids: planned.job_ids.clone(),
            submission_group: planned.submission_group.clone(),
            config_file_path: config_path,
        };

        let settings = group
            .submitter_params
            .hpc_config
            .as_ref()
            .unwrap_or(&self.hpc_config.hpc);
        let ctx = ScriptContext {
            output: self.output,
            settings,
            job_name: format!("{}batch_{}", self.hpc_config.job_prefix, planned.batch_id),
            jade_executable: current_executable(),
            distributed_submitter: state.distributed_submitter,
        };
        let script = self.adapter.render_submit_script(&batch, &ctx);

        let script_path = self.output.batch_script_path(planned.batch_id);
        std::fs::write(&script_path, script)
            .with_context(|| format!("Failed to write script: {}", script_path.display()))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mut perms = std::fs::metadata(&script_path)?.permissions();
            perms.set_mode(0o755);
            std::fs::set_permissions(&script_path, perms)?;
        }

        let hpc_job_id = self.submit_with_retries(&script_path)?;
        info!(
            batch_id = planned.batch_id,
            hpc_job_id = %hpc_job_id,
            jobs = planned.job_ids.len(),
            "submitted batch"
        );

        state.active_batches.insert(
            planned.batch_id,
            ActiveBatch {
                hpc_job_id: hpc_job_id.clone(),
                node_names: Vec::new(),
                submission_group: planned.submission_group.clone(),
                job_ids: planned.job_ids.clone(),
                state: BatchState::Submitted,
            },
        );
        state.submitted_jobs.extend(planned.job_ids.iter().copied());

        Ok(hpc_job_id)
    }

    fn submit_with_retries(&self, script_path: &std::path::Path) -> Result<String> {
        let mut delay = SUBMIT_BACKOFF_BASE;
        for attempt in 1..=SUBMIT_ATTEMPTS {
            match self.adapter.submit(script_path) {
                Ok(id) => return Ok(id),
                Err(err) if attempt < SUBMIT_ATTEMPTS => {
                    warn!(
                        attempt,
                        error = %err,
                        "scheduler submission failed, retrying in {}s",
                        delay.as_secs()
                    );
                    std::thread::sleep(delay);
                    delay *= 2;
                }
                Err(err) => {
                    return Err(err.context(format!(
                        "scheduler submission failed after {SUBMIT_ATTEMPTS} attempts"
                    )));
                }
            }
        }
        bail!("unreachable: retry loop exhausted")
    }
}

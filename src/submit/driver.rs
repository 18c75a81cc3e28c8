//! The distributed submitter iteration
//!
//! Every process that can advance the run enters `run_once`: the login node
//! right after the initial submission, and every node runner on start and on
//! finish. Whoever holds the cluster lock for the duration of one iteration
//! is the acting submitter; releasing the lock frees the role. There is no
//! separate election.

use anyhow::Result;
use tracing::{error, info, warn};

use crate::batch::compute_batches;
use crate::cluster::{BatchState, ClusterState, ClusterStore, JobResult, JobStatus};
use crate::config::{Configuration, HpcConfig};
use crate::hpc::{HpcAdapter, HpcJobStatus};
use crate::results;
use crate::runner::run_hook;

use super::HpcSubmitter;

/// What one submitter iteration concluded about the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    InProgress,
    Complete,
    Canceled,
}

pub struct SubmitterLoop<'a> {
    store: &'a ClusterStore,
    config: &'a Configuration,
    hpc_config: &'a HpcConfig,
    adapter: &'a dyn HpcAdapter,
}

impl<'a> SubmitterLoop<'a> {
    pub fn new(
        store: &'a ClusterStore,
        config: &'a Configuration,
        hpc_config: &'a HpcConfig,
        adapter: &'a dyn HpcAdapter,
    ) -> Self {
        Self {
            store,
            config,
            hpc_config,
            adapter,
        }
    }

    /// Run one full submitter iteration under the cluster lock.
    pub fn run_once(&self) -> Result<RunOutcome> {
        let _lock = self.store.lock()?;
        let mut state = self.store.read_state()?;

        if state.is_complete {
            return Ok(if state.canceled {
                RunOutcome::Canceled
            } else {
                RunOutcome::Complete
            });
        }

        self.store.drain_batch_results(&mut state)?;

        if state.canceled {
            let outcome = self.wind_down_canceled(&mut state)?;
            self.store.write_state(&state)?;
            return Ok(outcome);
        }

        self.reconcile_active_batches(&mut state)?;

        let planned = compute_batches(
            self.config,
            self.hpc_config,
            &mut state,
            self.store.output().root(),
        )?;
        let submitter = HpcSubmitter::new(
            self.config,
            self.hpc_config,
            self.adapter,
            self.store.output(),
        );
        for batch in &planned {
            // A failed submission leaves its jobs unsubmitted; the next
            // iteration recomputes and retries them.
            if let Err(err) = submitter.submit_batch(&mut state, batch) {
                error!(batch_id = batch.batch_id, error = %err, "batch submission failed");
            }
        }

        let outcome = if state.all_terminal(self.config) {
            self.finalize(&mut state)?;
            RunOutcome::Complete
        } else {
            RunOutcome::InProgress
        };

        self.store.write_state(&state)?;
        Ok(outcome)
    }

    /// Record the nodes a batch landed on and mark it in progress. Called by
    /// the node runner, under the lock, before it starts executing jobs.
    pub fn record_batch_started(&self, batch_id: u64, node_names: Vec<String>) -> Result<()> {
        let _lock = self.store.lock()?;
        let mut state = self.store.read_state()?;
        if let Some(batch) = state.active_batches.get_mut(&batch_id) {
            batch.node_names = node_names;
            batch.state = BatchState::InProgress;
            self.store.write_state(&state)?;
        }
        Ok(())
    }

    /// Account for batches the scheduler no longer runs.
    ///
    /// A batch whose jobs are all terminal is simply retired. A batch the
    /// scheduler reports complete (or has lost track of) while some of its
    /// jobs never produced a row was killed mid-flight (walltime, node
    /// failure): the absentees are synthesized as `missing` so a later
    /// resubmission can recover them.
    fn reconcile_active_batches(&self, state: &mut ClusterState) -> Result<()> {
        let batch_ids: Vec<u64> = state.active_batches.keys().copied().collect();
        for batch_id in batch_ids {
            let batch = state.active_batches[&batch_id].clone();
            if batch.job_ids.iter().all(|id| state.is_terminal(*id)) {
                state.active_batches.remove(&batch_id);
                continue;
            }

            let status = match self.adapter.status(&batch.hpc_job_id) {
                Ok(status) => status,
                Err(err) => {
                    warn!(batch_id, error = %err, "scheduler status probe failed");
                    continue;
                }
            };
            match status {
                HpcJobStatus::Queued => {}
                HpcJobStatus::Running => {
                    if let Some(entry) = state.active_batches.get_mut(&batch_id) {
                        if entry.state == BatchState::Submitted {
                            entry.state = BatchState::InProgress;
                        }
                    }
                }
                HpcJobStatus::Complete | HpcJobStatus::Unknown => {
                    if status == HpcJobStatus::Unknown {
                        warn!(batch_id, hpc_job_id = %batch.hpc_job_id, "scheduler lost track of batch");
                    }
                    // The runner may have flushed rows between our drain and
                    // this probe; pick them up before declaring anyone missing.
                    self.store.drain_batch_results(state)?;
                    self.synthesize_absentees(state, &batch, JobStatus::Missing, batch_id);
                    state.active_batches.remove(&batch_id);
                }
            }
        }
        Ok(())
    }

    /// After cancellation: wait for live nodes to report their rows, then
    /// close out dead batches with `canceled` rows and finalize.
    fn wind_down_canceled(&self, state: &mut ClusterState) -> Result<RunOutcome> {
        let batch_ids: Vec<u64> = state.active_batches.keys().copied().collect();
        for batch_id in batch_ids {
            let batch = state.active_batches[&batch_id].clone();
            if batch.job_ids.iter().all(|id| state.is_terminal(*id)) {
                state.active_batches.remove(&batch_id);
                continue;
            }
            match self.adapter.status(&batch.hpc_job_id) {
                Ok(status @ (HpcJobStatus::Complete | HpcJobStatus::Unknown)) => {
                    if status == HpcJobStatus::Unknown {
                        warn!(batch_id, hpc_job_id = %batch.hpc_job_id, "scheduler lost track of batch");
                    }
                    self.store.drain_batch_results(state)?;
                    self.synthesize_absentees(state, &batch, JobStatus::Canceled, batch_id);
                    state.active_batches.remove(&batch_id);
                }
                Ok(HpcJobStatus::Queued | HpcJobStatus::Running) => {
                    // The allocation is still alive; its runner will notice
                    // the flag and report rows for a later iteration to drain.
                }
                Err(err) => warn!(batch_id, error = %err, "scheduler status probe failed"),
            }
        }

        // Jobs never placed into a batch will not run either.
        let unsubmitted: Vec<(u64, String)> = self
            .config
            .jobs
            .iter()
            .filter(|j| !state.submitted_jobs.contains(&j.job_id) && !state.is_terminal(j.job_id))
            .map(|j| (j.job_id, j.name()))
            .collect();
        for (job_id, name) in unsubmitted {
            state.record_result(JobResult::synthetic(
                name,
                job_id,
                JobStatus::Canceled,
                0,
                String::new(),
                self.store.output().root().to_path_buf(),
            ));
        }

        if state.active_batches.is_empty() && state.all_terminal(self.config) {
            self.finalize(state)?;
        }
        Ok(RunOutcome::Canceled)
    }

    /// Mark the run complete, write the reports and run the teardown hook.
    fn finalize(&self, state: &mut ClusterState) -> Result<()> {
        state.is_complete = true;
        info!("all jobs terminal, finalizing run");

        results::write_reports(self.store.output(), state)?;

        if let Some(teardown) = self.config.teardown_command.as_deref() {
            match run_hook(teardown, "run teardown") {
                Ok(0) => {}
                Ok(code) => error!(code, "run teardown command failed"),
                Err(err) => error!(error = %err, "run teardown command failed to run"),
            }
        }
        Ok(())
    }

    fn synthesize_absentees(
        &self,
        state: &mut ClusterState,
        batch: &crate::cluster::ActiveBatch,
        status: JobStatus,
        batch_id: u64,
    ) {
        for job_id in &batch.job_ids {
            if state.is_terminal(*job_id) {
                continue;
            }
            let name = self
                .config
                .job(*job_id)
                .map(|j| j.name())
                .unwrap_or_else(|| job_id.to_string());
            warn!(job_id, batch_id, status = %status, "job never reported a result");
            state.record_result(JobResult::synthetic(
                name,
                *job_id,
                status,
                batch_id,
                batch.hpc_job_id.clone(),
                self.store.output().root().to_path_buf(),
            ));
        }
    }
}

//! Run-jobs command implementation (per-node entry point)
//!
//! Invoked by the rendered submission script on every allocated node. The
//! runner participates in distributed submission: it enters the submitter
//! loop once on start (other nodes' results may be waiting) and once after
//! its batch finishes.

use std::path::Path;

use anyhow::Result;
use tracing::{info, warn};

use crate::output::OutputDir;
use crate::runner::JobRunner;
use crate::submit::SubmitterLoop;

use super::{EXIT_SUCCESS, load_run_env};

pub fn run_jobs_command(batch_config: &Path, output: &Path, batch_id: u64) -> Result<i32> {
    let env = load_run_env(output)?;
    let distributed = env.store.read_state()?.distributed_submitter;

    let runner = JobRunner::from_batch_config(batch_config, OutputDir::new(output), batch_id)?;
    let submitter = SubmitterLoop::new(
        &env.store,
        &env.config,
        &env.hpc_config,
        env.adapter.as_ref(),
    );

    submitter.record_batch_started(batch_id, node_names())?;
    if distributed {
        // Promote to submitter on start: results from other nodes may be
        // waiting, and capacity may have freed up.
        if let Err(err) = submitter.run_once() {
            warn!(error = %err, "submitter pass on start failed");
        }
    }

    let summary = runner.run()?;
    info!(
        batch_id,
        succeeded = summary.succeeded,
        failed = summary.failed,
        canceled = summary.canceled,
        "node finished batch"
    );

    if distributed {
        if let Err(err) = submitter.run_once() {
            warn!(error = %err, "submitter pass on finish failed");
        }
    }

    Ok(EXIT_SUCCESS)
}

/// Nodes in this allocation as the scheduler announces them, falling back to
/// this host's name for local execution.
fn node_names() -> Vec<String> {
    if let Ok(list) = std::env::var("SLURM_JOB_NODELIST") {
        return list.split(',').map(|s| s.trim().to_string()).collect();
    }
    std::env::var("HOSTNAME").map(|h| vec![h]).unwrap_or_default()
}

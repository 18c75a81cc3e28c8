//! Run cancellation
//!
//! Cancellation is a one-way filesystem signal: the flag file is created
//! first so every worker on every node notices without taking the cluster
//! lock, then the state is marked and active allocations are canceled
//! through the scheduler.

use anyhow::Result;
use tracing::{info, warn};

use crate::cluster::ClusterStore;
use crate::hpc::HpcAdapter;

/// Cancel a running workload.
///
/// In-flight jobs receive SIGTERM from their node runners; queued batches
/// are canceled at the scheduler; jobs that never started are accounted for
/// by the next submitter iteration.
pub fn cancel_run(store: &ClusterStore, adapter: &dyn HpcAdapter) -> Result<()> {
    store.request_cancel()?;

    let _lock = store.lock()?;
    let mut state = store.read_state()?;
    if state.is_complete {
        info!("run is already complete, nothing to cancel");
        return Ok(());
    }
    state.canceled = true;

    for (batch_id, batch) in &state.active_batches {
        info!(batch_id, hpc_job_id = %batch.hpc_job_id, "canceling batch at the scheduler");
        if let Err(err) = adapter.cancel(&batch.hpc_job_id) {
            warn!(batch_id, error = %err, "scheduler cancel failed");
        }
    }

    store.write_state(&state)?;
    Ok(())
}

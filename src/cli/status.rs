//! Status command implementation

use std::path::Path;

use anyhow::Result;

use super::{EXIT_SUCCESS, load_run_env};

/// Print run progress from the cluster state.
///
/// Reads without taking the lock: state writes are atomic whole-document
/// replacements, so a plain read never observes a torn document.
pub fn show_status_command(output: &Path) -> Result<i32> {
    let env = load_run_env(output)?;
    let state = env.store.read_state()?;
    let summary = state.summary_counts();
    let total = env.config.jobs.len();

    println!("Run: {}", output.display());
    println!("Config: {}", state.config_id);
    println!();
    println!(
        "Jobs: {total} total, {} submitted, {} terminal",
        state.submitted_jobs.len(),
        summary.total()
    );
    println!(
        "  successful: {}  failed: {}  missing: {}  canceled: {}",
        summary.successful, summary.failed, summary.missing, summary.canceled
    );
    println!();
    if state.is_complete {
        println!("State: complete");
    } else if state.canceled {
        println!("State: canceling");
    } else {
        println!("State: in progress (version {})", state.version);
    }

    if !state.active_batches.is_empty() {
        println!();
        println!(
            "{:<9} {:<12} {:<12} {:<6} {:<20}",
            "batch_id", "hpc_job_id", "state", "jobs", "nodes"
        );
        for (batch_id, batch) in &state.active_batches {
            println!(
                "{:<9} {:<12} {:<12} {:<6} {:<20}",
                batch_id,
                batch.hpc_job_id,
                format!("{:?}", batch.state).to_lowercase(),
                batch.job_ids.len(),
                batch.node_names.join(","),
            );
        }
    }

    Ok(EXIT_SUCCESS)
}

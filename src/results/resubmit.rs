//! Resubmission of failed and missing jobs
//!
//! A resubmission never re-executes a successful job: its result stays in the
//! state, so dependency edges pointing at it remain satisfied. Only the
//! selected jobs are reset back to the unsubmitted pool.

use anyhow::Result;
use tracing::info;

use crate::cluster::{ClusterStore, JobStatus};
use crate::config::Configuration;

/// Reset the selected jobs for another round of submission.
///
/// Selects results with `return_code != 0` when `include_failed`, and results
/// with `status = missing` when `include_missing`. Returns the ids that were
/// reset, in ascending order.
pub fn prepare_resubmit(
    store: &ClusterStore,
    config: &Configuration,
    include_failed: bool,
    include_missing: bool,
) -> Result<Vec<u64>> {
    let _lock = store.lock()?;
    let mut state = store.read_state()?;

    // Late rows from a crashed run must be accounted for before selecting.
    store.drain_batch_results(&mut state)?;

    let mut selected: Vec<u64> = state
        .completed_results
        .iter()
        .filter(|r| {
            let failed = r.status == JobStatus::Finished && r.return_code != 0;
            let missing = r.status == JobStatus::Missing;
            (include_failed && failed) || (include_missing && missing)
        })
        .map(|r| r.job_id)
        .collect();
    selected.sort_unstable();
    selected.dedup();

    if selected.is_empty() {
        info!("no jobs match the resubmission criteria");
        return Ok(selected);
    }

    state
        .completed_results
        .retain(|r| !selected.contains(&r.job_id));
    for job_id in &selected {
        state.submitted_jobs.remove(job_id);
    }
    for batch in state.active_batches.values_mut() {
        batch.job_ids.retain(|id| !selected.contains(id));
    }
    state.is_complete = false;
    state.canceled = false;
    store.clear_cancel_flag()?;

    // Sanity: every selected id must still exist in the configuration.
    for job_id in &selected {
        if config.job(*job_id).is_none() {
            anyhow::bail!("result references job {job_id} not present in the configuration");
        }
    }

    store.write_state(&state)?;
    info!(jobs = selected.len(), "reset jobs for resubmission");
    Ok(selected)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::{ClusterState, JobResult};
    use crate::config::{JobSpec, SubmissionGroup, SubmitterParams};
    use crate::output::OutputDir;
    use chrono::Utc;

    fn setup() -> (tempfile::TempDir, ClusterStore, Configuration) {
        let tmp = tempfile::TempDir::new().unwrap();
        let store = ClusterStore::new(OutputDir::new(tmp.path()));
        let config = Configuration::new(
            (1..=4).map(|i| JobSpec::new(i, "true")).collect(),
            vec![SubmissionGroup {
                name: "default".to_string(),
                submitter_params: SubmitterParams::default(),
            }],
        );
        let state = ClusterState::new(&config);
        store.initialize(&state).unwrap();
        (tmp, store, config)
    }

    fn result(job_id: u64, return_code: i32, status: JobStatus) -> JobResult {
        JobResult {
            name: format!("job{job_id}"),
            job_id,
            return_code,
            status,
            exec_time_s: 1.0,
            completion_time: Utc::now(),
            batch_id: 1,
            hpc_job_id: "1".to_string(),
            output_dir: std::path::PathBuf::from("/tmp/out"),
        }
    }

    #[test]
    fn test_resubmit_selects_failed_and_missing() {
        let (_tmp, store, config) = setup();
        let mut state = store.read_state().unwrap();
        state.record_result(result(1, 0, JobStatus::Finished));
        state.record_result(result(2, 7, JobStatus::Finished));
        state.record_result(result(3, -1, JobStatus::Missing));
        state.record_result(result(4, 0, JobStatus::Finished));
        state.is_complete = true;
        store.write_state(&state).unwrap();

        let selected = prepare_resubmit(&store, &config, true, true).unwrap();
        assert_eq!(selected, vec![2, 3]);

        let state = store.read_state().unwrap();
        assert!(!state.is_complete);
        assert!(state.is_terminal(1));
        assert!(state.is_terminal(4));
        assert!(!state.is_terminal(2));
        assert!(!state.is_terminal(3));
        assert!(!state.submitted_jobs.contains(&2));
        assert!(state.submitted_jobs.contains(&1));
    }

    #[test]
    fn test_resubmit_missing_only() {
        let (_tmp, store, config) = setup();
        let mut state = store.read_state().unwrap();
        state.record_result(result(1, 7, JobStatus::Finished));
        state.record_result(result(2, -1, JobStatus::Missing));
        store.write_state(&state).unwrap();

        let selected = prepare_resubmit(&store, &config, false, true).unwrap();
        assert_eq!(selected, vec![2]);

        let state = store.read_state().unwrap();
        // The failed job's result is untouched.
        assert!(state.is_terminal(1));
    }

    #[test]
    fn test_resubmit_with_nothing_to_do() {
        let (_tmp, store, config) = setup();
        let mut state = store.read_state().unwrap();
        for id in 1..=4 {
            state.record_result(result(id, 0, JobStatus::Finished));
        }
        store.write_state(&state).unwrap();

        let selected = prepare_resubmit(&store, &config, true, true).unwrap();
        assert!(selected.is_empty());
    }
}

//! Batch formation
//!
//! Turns the dependency DAG plus the current cluster state into node-sized
//! batches. Runs only under the cluster lock, inside a submitter iteration.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::cluster::{ClusterState, JobResult, JobStatus};
use crate::config::{Configuration, HpcConfig, JobSpec, SubmitterParams};

/// Minutes reserved below the walltime when packing by estimated runtime.
const TIME_BATCH_SAFETY_MARGIN_MINUTES: u64 = 5;

/// A batch as handed to the scheduler adapter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchSpec {
    pub batch_id: u64,
    pub job_ids: Vec<u64>,
    pub submission_group: String,
    pub config_file_path: PathBuf,
}

/// A batch the Batcher formed but the submitter has not yet placed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedBatch {
    pub batch_id: u64,
    pub submission_group: String,
    pub job_ids: Vec<u64>,
}

/// Compute the batches that can be submitted right now.
///
/// Mutates `state` in two ways: cascade cancellations are recorded as
/// synthetic `canceled` results, and `next_batch_id` advances for every
/// planned batch. Jobs only enter `submitted_jobs` once their batch is
/// actually placed, so a failed submission is retried (under a fresh id) by
/// the next iteration.
pub fn compute_batches(
    config: &Configuration,
    hpc: &HpcConfig,
    state: &mut ClusterState,
    output_root: &Path,
) -> Result<Vec<PlannedBatch>> {
    cascade_cancellations(config, state, output_root);

    // Every entry in active_batches still occupies a node: fully accounted
    // batches are removed from the map by the submitter iteration.
    let active = state.active_batches.len() as u64;
    let mut budget = config.max_nodes().saturating_sub(active);

    let mut group_names: Vec<&str> = config
        .submission_groups
        .iter()
        .map(|g| g.name.as_str())
        .collect();
    group_names.sort_unstable();

    let mut planned = Vec::new();
    let mut assigned: HashSet<u64> = HashSet::new();

    for name in group_names {
        if budget == 0 {
            break;
        }
        let group = config
            .group(name)
            .expect("group names come from the configuration");
        let params = &group.submitter_params;
        let walltime = params
            .hpc_config
            .as_ref()
            .unwrap_or(&hpc.hpc)
            .walltime_minutes()?;

        // Jobs of this group in insertion order, split into runnable
        // candidates and still-blocked stragglers.
        let mut ready: Vec<&JobSpec> = Vec::new();
        let mut blocked: Vec<&JobSpec> = Vec::new();
        for job in &config.jobs {
            if config.group_for_job(job).name != name
                || state.submitted_jobs.contains(&job.job_id)
                || assigned.contains(&job.job_id)
            {
                continue;
            }
            if job.blocked_by.iter().all(|b| state.is_terminal(*b)) {
                ready.push(job);
            } else {
                blocked.push(job);
            }
        }

        let mut ready = ready.into_iter().peekable();
        while ready.peek().is_some() && budget > 0 {
            let (mut job_ids, mut packed_minutes) = if params.time_based_batching {
                pack_by_time(&mut ready, walltime)
            } else {
                (pack_by_size(&mut ready, params), 0)
            };

            if params.try_add_blocked_jobs {
                fill_with_blocked(
                    &mut job_ids,
                    &mut packed_minutes,
                    &mut blocked,
                    params,
                    walltime,
                    state,
                );
            }

            let batch_id = state.next_batch_id;
            state.next_batch_id += 1;
            assigned.extend(job_ids.iter().copied());
            debug!(batch_id, group = name, jobs = job_ids.len(), "formed batch");
            planned.push(PlannedBatch {
                batch_id,
                submission_group: name.to_string(),
                job_ids,
            });
            budget -= 1;
        }
    }

    Ok(planned)
}

/// Pop the next `per_node_batch_size` candidates in insertion order.
fn pack_by_size<'a, I>(ready: &mut std::iter::Peekable<I>, params: &SubmitterParams) -> Vec<u64>
where
    I: Iterator<Item = &'a JobSpec>,
{
    let mut job_ids = Vec::new();
    while job_ids.len() < params.per_node_batch_size as usize {
        match ready.next() {
            Some(job) => job_ids.push(job.job_id),
            None => break,
        }
    }
    job_ids
}

/// Greedily pack candidates while the summed estimate stays under the
/// walltime minus the safety margin. A job without an estimate counts as the
/// walltime itself, so it always ends up alone in its batch; so does a first
/// job whose own estimate exceeds the budget.
fn pack_by_time<'a, I>(ready: &mut std::iter::Peekable<I>, walltime: u64) -> (Vec<u64>, u64)
where
    I: Iterator<Item = &'a JobSpec>,
{
    let capacity = walltime.saturating_sub(TIME_BATCH_SAFETY_MARGIN_MINUTES);
    let mut job_ids = Vec::new();
    let mut packed_minutes = 0u64;
    while let Some(job) = ready.peek() {
        let estimate = job.estimated_run_minutes.unwrap_or(walltime);
        if !job_ids.is_empty() && packed_minutes + estimate > capacity {
            break;
        }
        packed_minutes += estimate;
        job_ids.push(job.job_id);
        ready.next();
    }
    (job_ids, packed_minutes)
}

/// Top an under-full batch up with still-blocked jobs whose blockers are all
/// either terminal or already inside this batch. The node resolves the
/// in-batch edges locally.
fn fill_with_blocked(
    job_ids: &mut Vec<u64>,
    packed_minutes: &mut u64,
    blocked: &mut Vec<&JobSpec>,
    params: &SubmitterParams,
    walltime: u64,
    state: &ClusterState,
) {
    let capacity = walltime.saturating_sub(TIME_BATCH_SAFETY_MARGIN_MINUTES);
    loop {
        if !params.time_based_batching && job_ids.len() >= params.per_node_batch_size as usize {
            return;
        }
        let in_batch: HashSet<u64> = job_ids.iter().copied().collect();
        let position = blocked.iter().position(|job| {
            let unblocked = job
                .blocked_by
                .iter()
                .all(|b| in_batch.contains(b) || state.is_terminal(*b));
            if !unblocked {
                return false;
            }
            // For time-based groups only jobs with an estimate that still
            // fits are pulled in; estimate-less jobs stay behind.
            if params.time_based_batching {
                match job.estimated_run_minutes {
                    Some(estimate) => *packed_minutes + estimate <= capacity,
                    None => false,
                }
            } else {
                true
            }
        });
        let Some(position) = position else {
            return;
        };
        let job = blocked.remove(position);
        *packed_minutes += job.estimated_run_minutes.unwrap_or(0);
        job_ids.push(job.job_id);
    }
}

/// Record synthetic `canceled` results for jobs whose failed blockers demand
/// it, propagating transitively through the DAG. A blocker with
/// `cancel_on_blocking_job_failure = false` dependents leaves those
/// dependents runnable even when it failed.
fn cascade_cancellations(config: &Configuration, state: &mut ClusterState, output_root: &Path) {
    loop {
        let mut changed = false;
        for job in &config.jobs {
            if state.is_terminal(job.job_id) || !job.cancel_on_blocking_job_failure {
                continue;
            }
            let blocker_failed = job
                .blocked_by
                .iter()
                .any(|b| state.result_for(*b).is_some_and(|r| !r.is_success()));
            if blocker_failed {
                debug!(job_id = job.job_id, "canceled by blocking job failure");
                state.record_result(JobResult::synthetic(
                    job.name(),
                    job.job_id,
                    JobStatus::Canceled,
                    0,
                    String::new(),
                    output_root.to_path_buf(),
                ));
                changed = true;
            }
        }
        if !changed {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SubmissionGroup;

    fn group(params: SubmitterParams) -> SubmissionGroup {
        SubmissionGroup {
            name: "default".to_string(),
            submitter_params: params,
        }
    }

    fn plan(config: &Configuration, state: &mut ClusterState) -> Vec<PlannedBatch> {
        let hpc = HpcConfig::default();
        compute_batches(config, &hpc, state, Path::new("/tmp/out")).unwrap()
    }

    fn finished(job_id: u64, return_code: i32) -> JobResult {
        JobResult {
            name: job_id.to_string(),
            job_id,
            return_code,
            status: JobStatus::Finished,
            exec_time_s: 1.0,
            completion_time: chrono::Utc::now(),
            batch_id: 1,
            hpc_job_id: "1".to_string(),
            output_dir: PathBuf::from("/tmp/out"),
        }
    }

    #[test]
    fn test_size_based_chunks_in_insertion_order() {
        let jobs: Vec<JobSpec> = (1..=5).map(|i| JobSpec::new(i, "true")).collect();
        let config = Configuration::new(
            jobs,
            vec![group(SubmitterParams {
                per_node_batch_size: 2,
                max_nodes: 10,
                ..SubmitterParams::default()
            })],
        );
        let mut state = ClusterState::new(&config);

        let planned = plan(&config, &mut state);
        let ids: Vec<Vec<u64>> = planned.iter().map(|b| b.job_ids.clone()).collect();
        assert_eq!(ids, vec![vec![1, 2], vec![3, 4], vec![5]]);
        assert_eq!(planned[0].batch_id, 1);
        assert_eq!(planned[2].batch_id, 3);
        assert_eq!(state.next_batch_id, 4);
    }

    #[test]
    fn test_max_nodes_limits_planned_batches() {
        let jobs: Vec<JobSpec> = (1..=6).map(|i| JobSpec::new(i, "true")).collect();
        let config = Configuration::new(
            jobs,
            vec![group(SubmitterParams {
                per_node_batch_size: 2,
                max_nodes: 2,
                ..SubmitterParams::default()
            })],
        );
        let mut state = ClusterState::new(&config);

        let planned = plan(&config, &mut state);
        assert_eq!(planned.len(), 2);
        assert_eq!(planned[0].job_ids, vec![1, 2]);
        assert_eq!(planned[1].job_ids, vec![3, 4]);
    }

    #[test]
    fn test_blocked_jobs_stay_out_by_default() {
        let mut jobs = vec![JobSpec::new(1, "true"), JobSpec::new(2, "true")];
        jobs[1].blocked_by = vec![1];
        let config = Configuration::new(
            jobs,
            vec![group(SubmitterParams {
                per_node_batch_size: 10,
                max_nodes: 4,
                ..SubmitterParams::default()
            })],
        );
        let mut state = ClusterState::new(&config);

        let planned = plan(&config, &mut state);
        assert_eq!(planned.len(), 1);
        assert_eq!(planned[0].job_ids, vec![1]);
    }

    #[test]
    fn test_try_add_blocked_jobs_fills_batch() {
        let mut jobs = vec![
            JobSpec::new(1, "true"),
            JobSpec::new(2, "true"),
            JobSpec::new(3, "true"),
        ];
        jobs[1].blocked_by = vec![1];
        jobs[2].blocked_by = vec![2];
        let config = Configuration::new(
            jobs,
            vec![group(SubmitterParams {
                per_node_batch_size: 10,
                try_add_blocked_jobs: true,
                max_nodes: 4,
                ..SubmitterParams::default()
            })],
        );
        let mut state = ClusterState::new(&config);

        let planned = plan(&config, &mut state);
        assert_eq!(planned.len(), 1);
        // The whole chain lands in one batch; the node resolves it locally.
        assert_eq!(planned[0].job_ids, vec![1, 2, 3]);
    }

    #[test]
    fn test_failed_blocker_default_policy_keeps_dependent_runnable() {
        let mut jobs = vec![JobSpec::new(1, "true"), JobSpec::new(2, "true")];
        jobs[1].blocked_by = vec![1];
        let config = Configuration::new(
            jobs,
            vec![group(SubmitterParams {
                max_nodes: 4,
                ..SubmitterParams::default()
            })],
        );
        let mut state = ClusterState::new(&config);
        state.record_result(finished(1, 7));

        let planned = plan(&config, &mut state);
        assert_eq!(planned.len(), 1);
        assert_eq!(planned[0].job_ids, vec![2]);
    }

    #[test]
    fn test_failed_blocker_cascades_cancellation_transitively() {
        let mut jobs = vec![
            JobSpec::new(1, "true"),
            JobSpec::new(2, "true"),
            JobSpec::new(3, "true"),
        ];
        jobs[1].blocked_by = vec![1];
        jobs[1].cancel_on_blocking_job_failure = true;
        jobs[2].blocked_by = vec![2];
        jobs[2].cancel_on_blocking_job_failure = true;
        let config = Configuration::new(
            jobs,
            vec![group(SubmitterParams {
                max_nodes: 4,
                ..SubmitterParams::default()
            })],
        );
        let mut state = ClusterState::new(&config);
        state.record_result(finished(1, 7));

        let planned = plan(&config, &mut state);
        assert!(planned.is_empty());
        assert_eq!(state.result_for(2).unwrap().status, JobStatus::Canceled);
        assert_eq!(state.result_for(3).unwrap().status, JobStatus::Canceled);
    }

    #[test]
    fn test_time_based_batching_scenario() {
        // Walltime 240 min, margin 5: jobs estimated [10, 10, 30, 200, 240]
        // pack as [10, 10, 30], [200], [240].
        let estimates = [10u64, 10, 30, 200, 240];
        let jobs: Vec<JobSpec> = estimates
            .iter()
            .enumerate()
            .map(|(i, est)| {
                let mut job = JobSpec::new(i as u64 + 1, "true");
                job.estimated_run_minutes = Some(*est);
                job
            })
            .collect();
        let config = Configuration::new(
            jobs,
            vec![group(SubmitterParams {
                time_based_batching: true,
                num_parallel_processes_per_node: Some(2),
                max_nodes: 10,
                ..SubmitterParams::default()
            })],
        );
        let mut state = ClusterState::new(&config);

        let planned = plan(&config, &mut state);
        let ids: Vec<Vec<u64>> = planned.iter().map(|b| b.job_ids.clone()).collect();
        assert_eq!(ids, vec![vec![1, 2, 3], vec![4], vec![5]]);
    }

    #[test]
    fn test_time_based_job_without_estimate_gets_own_batch() {
        let mut jobs = vec![JobSpec::new(1, "true"), JobSpec::new(2, "true")];
        jobs[0].estimated_run_minutes = Some(10);
        // job 2 has no estimate
        let config = Configuration::new(
            jobs,
            vec![group(SubmitterParams {
                time_based_batching: true,
                max_nodes: 10,
                ..SubmitterParams::default()
            })],
        );
        let mut state = ClusterState::new(&config);

        let planned = plan(&config, &mut state);
        let ids: Vec<Vec<u64>> = planned.iter().map(|b| b.job_ids.clone()).collect();
        assert_eq!(ids, vec![vec![1], vec![2]]);
    }

    #[test]
    fn test_groups_processed_alphabetically() {
        let mut job_b = JobSpec::new(1, "true");
        job_b.submission_group = Some("beta".to_string());
        let mut job_a = JobSpec::new(2, "true");
        job_a.submission_group = Some("alpha".to_string());
        let config = Configuration::new(
            vec![job_b, job_a],
            vec![
                SubmissionGroup {
                    name: "beta".to_string(),
                    submitter_params: SubmitterParams {
                        max_nodes: 4,
                        ..SubmitterParams::default()
                    },
                },
                SubmissionGroup {
                    name: "alpha".to_string(),
                    submitter_params: SubmitterParams {
                        max_nodes: 4,
                        ..SubmitterParams::default()
                    },
                },
            ],
        );
        let mut state = ClusterState::new(&config);

        let planned = plan(&config, &mut state);
        assert_eq!(planned.len(), 2);
        assert_eq!(planned[0].submission_group, "alpha");
        assert_eq!(planned[0].job_ids, vec![2]);
        assert_eq!(planned[1].submission_group, "beta");
    }

    #[test]
    fn test_submitted_jobs_never_rebatched() {
        let jobs: Vec<JobSpec> = (1..=3).map(|i| JobSpec::new(i, "true")).collect();
        let config = Configuration::new(
            jobs,
            vec![group(SubmitterParams {
                max_nodes: 4,
                ..SubmitterParams::default()
            })],
        );
        let mut state = ClusterState::new(&config);
        state.submitted_jobs.insert(1);
        state.submitted_jobs.insert(2);

        let planned = plan(&config, &mut state);
        assert_eq!(planned.len(), 1);
        assert_eq!(planned[0].job_ids, vec![3]);
    }
}

//! Bounded worker pool
//!
//! P OS threads drain the batch's ready set. Coordination is one mutex over
//! the queue plus a condvar; each worker blocks on its child process for the
//! job's lifetime. Jobs that arrived still-blocked (try_add_blocked_jobs)
//! wait until their in-batch blockers resolve, which is the node-local
//! second submitter pass.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::AtomicBool;
use std::sync::{Condvar, Mutex};
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use tracing::{debug, info};

use crate::cluster::{JobResult, JobStatus};
use crate::config::JobSpec;

use super::process::execute_job;
use super::results::BatchResultWriter;
use super::RunContext;

/// Totals for one executed batch.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PoolSummary {
    pub succeeded: usize,
    pub failed: usize,
    pub canceled: usize,
}

struct Queue {
    ready: VecDeque<usize>,
    /// index -> unresolved in-batch blocker ids
    waiting: HashMap<usize, HashSet<u64>>,
    /// in-batch job ids that resolved unsuccessfully
    failed_ids: HashSet<u64>,
    done: usize,
    in_flight: usize,
    summary: PoolSummary,
}

struct Shared<'a> {
    jobs: &'a [JobSpec],
    queue: Mutex<Queue>,
    cond: Condvar,
    cancel: AtomicBool,
    write_error: Mutex<Option<anyhow::Error>>,
}

/// Run every job in the batch, writing one result row per job.
pub fn run_pool(
    jobs: &[JobSpec],
    parallelism: usize,
    ctx: &RunContext,
    writer: &Mutex<BatchResultWriter>,
) -> Result<PoolSummary> {
    let mut ready = VecDeque::new();
    let mut waiting = HashMap::new();
    for (idx, job) in jobs.iter().enumerate() {
        if job.blocked_by.is_empty() {
            ready.push_back(idx);
        } else {
            waiting.insert(idx, job.blocked_by.iter().copied().collect());
        }
    }

    let shared = Shared {
        jobs,
        queue: Mutex::new(Queue {
            ready,
            waiting,
            failed_ids: HashSet::new(),
            done: 0,
            in_flight: 0,
            summary: PoolSummary::default(),
        }),
        cond: Condvar::new(),
        cancel: AtomicBool::new(false),
        write_error: Mutex::new(None),
    };

    let workers = parallelism.clamp(1, jobs.len().max(1));
    info!(jobs = jobs.len(), workers, "starting worker pool");
    std::thread::scope(|scope| {
        for _ in 0..workers {
            scope.spawn(|| worker_loop(&shared, ctx, writer));
        }
    });

    if let Some(err) = shared.write_error.lock().unwrap_or_else(|e| e.into_inner()).take() {
        return Err(err);
    }
    let queue = shared.queue.lock().unwrap_or_else(|e| e.into_inner());
    Ok(queue.summary)
}

fn worker_loop(shared: &Shared<'_>, ctx: &RunContext, writer: &Mutex<BatchResultWriter>) {
    loop {
        let idx = {
            let mut queue = shared.queue.lock().unwrap_or_else(|e| e.into_inner());
            loop {
                if ctx.cancel_requested(&shared.cancel) {
                    drain_unstarted(&mut queue, shared, ctx, writer);
                }
                if let Some(idx) = queue.ready.pop_front() {
                    queue.in_flight += 1;
                    break idx;
                }
                if queue.done + queue.in_flight == shared.jobs.len() {
                    return;
                }
                let (guard, _timeout) = shared
                    .cond
                    .wait_timeout(queue, ctx.poll_interval.max(Duration::from_millis(50)))
                    .unwrap_or_else(|e| e.into_inner());
                queue = guard;
            }
        };

        let job = &shared.jobs[idx];
        let execution = execute_job(job, ctx, &shared.cancel);
        let result = JobResult {
            name: job.name(),
            job_id: job.job_id,
            return_code: execution.return_code,
            status: execution.status,
            exec_time_s: execution.exec_time_s,
            completion_time: Utc::now(),
            batch_id: ctx.batch_id,
            hpc_job_id: ctx.hpc_job_id.clone(),
            output_dir: ctx.output.root().to_path_buf(),
        };
        write_row(shared, writer, &result);
        debug!(job = %result.name, code = result.return_code, status = %result.status, "job finished");

        let mut queue = shared.queue.lock().unwrap_or_else(|e| e.into_inner());
        queue.in_flight -= 1;
        queue.done += 1;
        match result.status {
            JobStatus::Canceled => queue.summary.canceled += 1,
            _ if result.is_success() => queue.summary.succeeded += 1,
            _ => queue.summary.failed += 1,
        }
        if !result.is_success() {
            queue.failed_ids.insert(job.job_id);
        }
        resolve_waiting(&mut queue, job.job_id, shared, ctx, writer);
        shared.cond.notify_all();
    }
}

/// Remove a resolved blocker from waiting jobs, enqueueing the newly
/// runnable ones and cascade-canceling dependents of failed blockers.
fn resolve_waiting(
    queue: &mut Queue,
    resolved: u64,
    shared: &Shared<'_>,
    ctx: &RunContext,
    writer: &Mutex<BatchResultWriter>,
) {
    let mut newly_resolved = vec![resolved];
    while let Some(resolved) = newly_resolved.pop() {
        let mut unblocked = Vec::new();
        for (idx, blockers) in queue.waiting.iter_mut() {
            blockers.remove(&resolved);
            if blockers.is_empty() {
                unblocked.push(*idx);
            }
        }
        for idx in unblocked {
            queue.waiting.remove(&idx);
            let job = &shared.jobs[idx];
            let blocker_failed = job
                .blocked_by
                .iter()
                .any(|b| queue.failed_ids.contains(b));
            if blocker_failed && job.cancel_on_blocking_job_failure {
                let row = JobResult::synthetic(
                    job.name(),
                    job.job_id,
                    JobStatus::Canceled,
                    ctx.batch_id,
                    ctx.hpc_job_id.clone(),
                    ctx.output.root().to_path_buf(),
                );
                write_row(shared, writer, &row);
                queue.done += 1;
                queue.summary.canceled += 1;
                queue.failed_ids.insert(job.job_id);
                newly_resolved.push(job.job_id);
            } else {
                queue.ready.push_back(idx);
            }
        }
    }
}

/// On cancellation, everything not yet started gets a canceled row; in-flight
/// children are terminated by their own supervising worker.
fn drain_unstarted(
    queue: &mut Queue,
    shared: &Shared<'_>,
    ctx: &RunContext,
    writer: &Mutex<BatchResultWriter>,
) {
    let mut to_cancel: Vec<usize> = queue.ready.drain(..).collect();
    to_cancel.extend(queue.waiting.drain().map(|(idx, _)| idx));
    for idx in to_cancel {
        let job = &shared.jobs[idx];
        let row = JobResult::synthetic(
            job.name(),
            job.job_id,
            JobStatus::Canceled,
            ctx.batch_id,
            ctx.hpc_job_id.clone(),
            ctx.output.root().to_path_buf(),
        );
        write_row(shared, writer, &row);
        queue.done += 1;
        queue.summary.canceled += 1;
    }
}

fn write_row(shared: &Shared<'_>, writer: &Mutex<BatchResultWriter>, result: &JobResult) {
    let mut guard = writer.lock().unwrap_or_else(|e| e.into_inner());
    if let Err(err) = guard.write(result) {
        let mut slot = shared
            .write_error
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        if slot.is_none() {
            *slot = Some(err);
        }
    }
}

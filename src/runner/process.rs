//! Job subprocess supervision
//!
//! One worker thread blocks on one child for the job's whole lifetime. The
//! wait loop doubles as the cancellation poll: every `poll_interval` it
//! checks the shared cancel latch, escalating SIGTERM -> grace period ->
//! SIGKILL when the run is being torn down.

use std::fs::File;
use std::process::{Command, Stdio};
use std::sync::atomic::AtomicBool;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};
use tracing::{debug, warn};

use crate::cluster::JobStatus;
use crate::config::JobSpec;

use super::RunContext;

/// Exit code recorded when the child could not even be spawned.
const SPAWN_FAILURE_CODE: i32 = 127;

/// Outcome of one supervised child.
#[derive(Debug, Clone, Copy)]
pub struct JobExecution {
    pub return_code: i32,
    pub status: JobStatus,
    pub exec_time_s: f64,
}

#[cfg(unix)]
fn send_sigterm(pid: u32) {
    unsafe {
        libc::kill(pid as i32, libc::SIGTERM);
    }
}

#[cfg(not(unix))]
fn send_sigterm(_pid: u32) {}

fn exit_code(status: std::process::ExitStatus) -> i32 {
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        status.code().or_else(|| status.signal().map(|s| -s)).unwrap_or(-1)
    }
    #[cfg(not(unix))]
    {
        status.code().unwrap_or(-1)
    }
}

/// Run one job to completion, honoring the cancel latch.
///
/// Never returns `Err` for job-level failures; those are encoded in the
/// returned execution so the pool records them as result rows.
pub fn execute_job(job: &JobSpec, ctx: &RunContext, cancel: &AtomicBool) -> JobExecution {
    let started = Instant::now();
    match try_execute(job, ctx, cancel) {
        Ok(execution) => execution,
        Err(err) => {
            warn!(job = %job.name(), error = %err, "failed to launch job");
            JobExecution {
                return_code: SPAWN_FAILURE_CODE,
                status: JobStatus::Finished,
                exec_time_s: started.elapsed().as_secs_f64(),
            }
        }
    }
}

fn try_execute(job: &JobSpec, ctx: &RunContext, cancel: &AtomicBool) -> Result<JobExecution> {
    let name = job.name();
    let argv: Vec<&str> = job.command.split_whitespace().collect();
    if argv.is_empty() {
        bail!("job '{name}' has an empty command");
    }

    let stdout_path = ctx.output.job_stdout_path(&name);
    let stderr_path = ctx.output.job_stderr_path(&name);
    let stdout = File::create(&stdout_path)
        .with_context(|| format!("Failed to create {}", stdout_path.display()))?;
    let stderr = File::create(&stderr_path)
        .with_context(|| format!("Failed to create {}", stderr_path.display()))?;

    let mut command = Command::new(argv[0]);
    command
        .args(&argv[1..])
        .stdin(Stdio::null())
        .stdout(Stdio::from(stdout))
        .stderr(Stdio::from(stderr))
        .env("JADE_RUNTIME_OUTPUT", ctx.output.root())
        .env("JADE_JOB_NAME", &name)
        .env("JADE_SUBMISSION_GROUP", &ctx.group_name);
    if let Some(user_data) = &ctx.user_data_json {
        command.env("JADE_USER_DATA", user_data);
    }
    if let Some(node_names) = &ctx.node_names {
        command.env("JADE_COMPUTE_NODE_NAMES", node_names.join(" "));
        command.env("JADE_OUTPUT_DIR", ctx.output.root());
    }

    let started = Instant::now();
    let mut child = command
        .spawn()
        .with_context(|| format!("Failed to spawn '{}'", job.command))?;
    debug!(job = %name, pid = child.id(), "started job");

    let mut term_sent_at: Option<Instant> = None;
    let status = loop {
        if let Some(status) = child
            .try_wait()
            .with_context(|| format!("Failed to wait on '{name}'"))?
        {
            break status;
        }

        if ctx.cancel_requested(cancel) {
            match term_sent_at {
                None => {
                    debug!(job = %name, "sending SIGTERM");
                    send_sigterm(child.id());
                    term_sent_at = Some(Instant::now());
                }
                Some(sent) if sent.elapsed() >= ctx.grace_period => {
                    warn!(job = %name, "grace period expired, killing");
                    let _ = child.kill();
                }
                Some(_) => {}
            }
        }

        std::thread::sleep(ctx.poll_interval.min(Duration::from_millis(200)));
    };

    let exec_time_s = started.elapsed().as_secs_f64();
    let canceled = term_sent_at.is_some();
    Ok(JobExecution {
        return_code: exit_code(status),
        status: if canceled {
            JobStatus::Canceled
        } else {
            JobStatus::Finished
        },
        exec_time_s,
    })
}

/// Run a node setup/teardown hook synchronously, inheriting stdio.
pub fn run_hook(argv: &[String], what: &str) -> Result<i32> {
    let Some(program) = argv.first() else {
        bail!("{what} command is empty");
    };
    let status = Command::new(program)
        .args(&argv[1..])
        .status()
        .with_context(|| format!("Failed to run {what} command '{program}'"))?;
    Ok(exit_code(status))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::output::OutputDir;

    fn test_ctx(output: OutputDir) -> RunContext {
        RunContext {
            output,
            group_name: "default".to_string(),
            user_data_json: None,
            node_names: None,
            batch_id: 1,
            hpc_job_id: "0".to_string(),
            poll_interval: Duration::from_millis(50),
            grace_period: Duration::from_secs(30),
        }
    }

    #[test]
    fn test_successful_job_captures_stdout() {
        let tmp = tempfile::TempDir::new().unwrap();
        let output = OutputDir::new(tmp.path());
        output.ensure_layout().unwrap();
        let ctx = test_ctx(output.clone());

        let mut job = JobSpec::new(1, "echo hello-from-job");
        job.name = Some("hello".to_string());
        let cancel = AtomicBool::new(false);

        let execution = execute_job(&job, &ctx, &cancel);
        assert_eq!(execution.return_code, 0);
        assert_eq!(execution.status, JobStatus::Finished);

        let stdout = std::fs::read_to_string(output.job_stdout_path("hello")).unwrap();
        assert!(stdout.contains("hello-from-job"));
    }

    #[test]
    fn test_failing_job_reports_exit_code() {
        let tmp = tempfile::TempDir::new().unwrap();
        let output = OutputDir::new(tmp.path());
        output.ensure_layout().unwrap();
        let ctx = test_ctx(output);

        let job = JobSpec::new(1, "false");
        let cancel = AtomicBool::new(false);
        let execution = execute_job(&job, &ctx, &cancel);
        assert_eq!(execution.return_code, 1);
        assert_eq!(execution.status, JobStatus::Finished);
    }

    #[test]
    fn test_unknown_command_records_spawn_failure() {
        let tmp = tempfile::TempDir::new().unwrap();
        let output = OutputDir::new(tmp.path());
        output.ensure_layout().unwrap();
        let ctx = test_ctx(output);

        let job = JobSpec::new(1, "definitely-not-a-real-binary-name");
        let cancel = AtomicBool::new(false);
        let execution = execute_job(&job, &ctx, &cancel);
        assert_eq!(execution.return_code, SPAWN_FAILURE_CODE);
    }

    #[test]
    fn test_cancel_terminates_running_job() {
        let tmp = tempfile::TempDir::new().unwrap();
        let output = OutputDir::new(tmp.path());
        output.ensure_layout().unwrap();
        let ctx = test_ctx(output);

        let job = JobSpec::new(1, "sleep 30");
        let cancel = AtomicBool::new(true);

        let started = Instant::now();
        let execution = execute_job(&job, &ctx, &cancel);
        assert!(started.elapsed() < Duration::from_secs(10));
        assert_eq!(execution.status, JobStatus::Canceled);
    }

    #[test]
    fn test_run_hook_reports_exit_code() {
        assert_eq!(run_hook(&["true".to_string()], "setup").unwrap(), 0);
        assert_eq!(run_hook(&["false".to_string()], "setup").unwrap(), 1);
        assert!(run_hook(&[], "setup").is_err());
    }
}

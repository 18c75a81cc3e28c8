//! SLURM adapter
//!
//! Shells out to `sbatch`, `squeue` and `scancel`. Script rendering emits a
//! `#SBATCH` preamble from the profile settings followed by the
//! scheduler-independent runner stanza.

use std::fmt::Write as _;
use std::path::Path;
use std::process::Command;

use anyhow::{Context, Result, bail};
use tracing::debug;

use super::{HpcAdapter, HpcJobStatus, ScriptContext};
use crate::batch::BatchSpec;

pub struct SlurmHpc;

impl SlurmHpc {
    pub fn new() -> Self {
        Self
    }
}

impl Default for SlurmHpc {
    fn default() -> Self {
        Self::new()
    }
}

impl HpcAdapter for SlurmHpc {
    fn name(&self) -> &'static str {
        "slurm"
    }

    fn submit(&self, script_path: &Path) -> Result<String> {
        debug!(script = %script_path.display(), "submitting with sbatch");
        let output = Command::new("sbatch")
            .arg("--parsable")
            .arg(script_path)
            .output()
            .with_context(|| "Failed to spawn sbatch")?;

        if !output.status.success() {
            bail!(
                "sbatch failed with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }

        // --parsable prints "<jobid>" or "<jobid>;<cluster>".
        let stdout = String::from_utf8_lossy(&output.stdout);
        let job_id = stdout
            .trim()
            .split(';')
            .next()
            .unwrap_or("")
            .to_string();
        if job_id.is_empty() {
            bail!("sbatch produced no job id: {stdout:?}");
        }
        Ok(job_id)
    }

    fn status(&self, hpc_job_id: &str) -> Result<HpcJobStatus> {
        let output = Command::new("squeue")
            .args(["--job", hpc_job_id, "-h", "-o", "%T"])
            .output()
            .with_context(|| "Failed to spawn squeue")?;

        // squeue errors out ("Invalid job id") once the scheduler has purged
        // the job; that is indistinguishable from completion here.
        if !output.status.success() {
            return Ok(HpcJobStatus::Complete);
        }

        let state = String::from_utf8_lossy(&output.stdout).trim().to_uppercase();
        Ok(match state.as_str() {
            "" => HpcJobStatus::Complete,
            "PENDING" | "CONFIGURING" | "REQUEUED" => HpcJobStatus::Queued,
            "RUNNING" | "COMPLETING" => HpcJobStatus::Running,
            "COMPLETED" | "CANCELLED" | "FAILED" | "TIMEOUT" | "NODE_FAIL" | "PREEMPTED"
            | "OUT_OF_MEMORY" => HpcJobStatus::Complete,
            _ => HpcJobStatus::Unknown,
        })
    }

    fn cancel(&self, hpc_job_id: &str) -> Result<()> {
        let output = Command::new("scancel")
            .arg(hpc_job_id)
            .output()
            .with_context(|| "Failed to spawn scancel")?;
        if !output.status.success() {
            debug!(
                job = hpc_job_id,
                stderr = %String::from_utf8_lossy(&output.stderr).trim(),
                "scancel reported an error (job may already be gone)"
            );
        }
        Ok(())
    }

    fn list_active_ids(&self, prefix: &str) -> Result<Vec<String>> {
        let output = Command::new("squeue")
            .args(["-h", "-o", "%A %j"])
            .output()
            .with_context(|| "Failed to spawn squeue")?;
        if !output.status.success() {
            bail!(
                "squeue failed with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let mut ids = Vec::new();
        for line in stdout.lines() {
            let mut parts = line.split_whitespace();
            let (Some(id), Some(name)) = (parts.next(), parts.next()) else {
                continue;
            };
            if name.starts_with(prefix) {
                ids.push(id.to_string());
            }
        }
        Ok(ids)
    }

    fn render_submit_script(&self, batch: &BatchSpec, ctx: &ScriptContext<'_>) -> String {
        let settings = ctx.settings;
        let mut script = String::with_capacity(1024);
        script.push_str("#!/bin/bash\n");

        let _ = writeln!(script, "#SBATCH --job-name={}", ctx.job_name);
        let _ = writeln!(script, "#SBATCH --time={}", settings.walltime);
        let _ = writeln!(script, "#SBATCH --nodes={}", settings.nodes);
        if let Some(account) = &settings.account {
            let _ = writeln!(script, "#SBATCH --account={account}");
        }
        if let Some(partition) = &settings.partition {
            let _ = writeln!(script, "#SBATCH --partition={partition}");
        }
        if let Some(qos) = &settings.qos {
            let _ = writeln!(script, "#SBATCH --qos={qos}");
        }
        if let Some(mem) = &settings.mem {
            let _ = writeln!(script, "#SBATCH --mem={mem}");
        }
        if let Some(tmp) = &settings.tmp {
            let _ = writeln!(script, "#SBATCH --tmp={tmp}");
        }
        if let Some(ntasks) = settings.ntasks {
            let _ = writeln!(script, "#SBATCH --ntasks={ntasks}");
        }
        if let Some(ntasks_per_node) = settings.ntasks_per_node {
            let _ = writeln!(script, "#SBATCH --ntasks-per-node={ntasks_per_node}");
        }
        if let Some(gres) = &settings.gres {
            let _ = writeln!(script, "#SBATCH --gres={gres}");
        }
        let stdio = ctx.output.stdio_dir();
        let _ = writeln!(
            script,
            "#SBATCH --output={}/batch_{}_%j.o",
            stdio.display(),
            batch.batch_id
        );
        let _ = writeln!(
            script,
            "#SBATCH --error={}/batch_{}_%j.e",
            stdio.display(),
            batch.batch_id
        );

        script.push('\n');
        script.push_str("export JADE_HPC_JOB_ID=\"$SLURM_JOB_ID\"\n");
        script.push_str(&ctx.runner_stanza(batch));
        script
    }
}

//! Fake/local adapter
//!
//! Stands in for a real scheduler on a workstation: `submit` runs the script
//! immediately as a detached `bash` child and reports the child's pid as the
//! native job id. Liveness probes use `kill(pid, 0)` the same way the rest of
//! the codebase tracks external processes.

use std::collections::HashMap;
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::sync::Mutex;

use anyhow::{Context, Result};
use tracing::debug;

use super::{HpcAdapter, HpcJobStatus, ScriptContext};
use crate::batch::BatchSpec;

pub struct FakeHpc {
    /// Children spawned by this process, keyed by pid. Kept so completed
    /// children are reaped instead of lingering as zombies.
    children: Mutex<HashMap<u32, Child>>,
}

impl FakeHpc {
    pub fn new() -> Self {
        Self {
            children: Mutex::new(HashMap::new()),
        }
    }
}

impl Default for FakeHpc {
    fn default() -> Self {
        Self::new()
    }
}

fn pid_alive(pid: u32) -> bool {
    #[cfg(unix)]
    unsafe {
        libc::kill(pid as i32, 0) == 0
    }
    #[cfg(not(unix))]
    {
        let _ = pid;
        false
    }
}

impl HpcAdapter for FakeHpc {
    fn name(&self) -> &'static str {
        "fake"
    }

    fn submit(&self, script_path: &Path) -> Result<String> {
        let child = Command::new("bash")
            .arg(script_path)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .with_context(|| format!("Failed to run script: {}", script_path.display()))?;

        let pid = child.id();
        debug!(pid, script = %script_path.display(), "spawned local batch");
        let mut guard = self.children.lock().unwrap_or_else(|e| e.into_inner());
        guard.insert(pid, child);
        Ok(pid.to_string())
    }

    fn status(&self, hpc_job_id: &str) -> Result<HpcJobStatus> {
        let pid: u32 = match hpc_job_id.parse() {
            Ok(pid) => pid,
            Err(_) => return Ok(HpcJobStatus::Unknown),
        };

        let mut guard = self.children.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(child) = guard.get_mut(&pid) {
            return match child.try_wait() {
                Ok(Some(_)) => {
                    guard.remove(&pid);
                    Ok(HpcJobStatus::Complete)
                }
                Ok(None) => Ok(HpcJobStatus::Running),
                Err(_) => Ok(HpcJobStatus::Unknown),
            };
        }
        drop(guard);

        // A child from a different submitter process: probe the pid table.
        if pid_alive(pid) {
            Ok(HpcJobStatus::Running)
        } else {
            Ok(HpcJobStatus::Complete)
        }
    }

    fn cancel(&self, hpc_job_id: &str) -> Result<()> {
        let Ok(pid) = hpc_job_id.parse::<u32>() else {
            return Ok(());
        };
        #[cfg(unix)]
        unsafe {
            libc::kill(pid as i32, libc::SIGTERM);
        }
        Ok(())
    }

    fn list_active_ids(&self, _prefix: &str) -> Result<Vec<String>> {
        let mut guard = self.children.lock().unwrap_or_else(|e| e.into_inner());
        let mut active = Vec::new();
        let pids: Vec<u32> = guard.keys().copied().collect();
        for pid in pids {
            if let Some(child) = guard.get_mut(&pid) {
                match child.try_wait() {
                    Ok(Some(_)) => {
                        guard.remove(&pid);
                    }
                    Ok(None) => active.push(pid.to_string()),
                    Err(_) => {}
                }
            }
        }
        Ok(active)
    }

    fn render_submit_script(&self, batch: &BatchSpec, ctx: &ScriptContext<'_>) -> String {
        let mut script = String::with_capacity(256);
        script.push_str("#!/bin/bash\n");
        script.push_str("export JADE_HPC_JOB_ID=\"$$\"\n");
        script.push_str(&ctx.runner_stanza(batch));
        script
    }
}

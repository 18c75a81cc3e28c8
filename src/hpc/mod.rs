//! Scheduler adapters
//!
//! `HpcAdapter` is the capability seam between JADE and the queueing system:
//! submit a rendered script, poll a native job id, cancel, enumerate. The
//! SLURM adapter shells out to the scheduler CLI; the fake adapter runs
//! scripts immediately on the local host and exists for laptop runs and
//! tests.

mod fake;
mod slurm;

pub use fake::FakeHpc;
pub use slurm::SlurmHpc;

use std::path::{Path, PathBuf};

use anyhow::Result;

use crate::batch::BatchSpec;
use crate::config::{HpcConfig, HpcSettings, HpcType};
use crate::output::OutputDir;

/// Scheduler-side state of a submitted batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HpcJobStatus {
    Queued,
    Running,
    /// The allocation ended; the scheduler no longer tracks the job
    Complete,
    Unknown,
}

/// Everything a renderer needs besides the batch itself.
pub struct ScriptContext<'a> {
    pub output: &'a OutputDir,
    pub settings: &'a HpcSettings,

    /// Scheduler job name, `<job_prefix>batch_<id>`
    pub job_name: String,

    /// Absolute path of the jade executable to invoke on the node
    pub jade_executable: String,

    /// Whether the script re-enters the submitter when the runner exits
    pub distributed_submitter: bool,
}

impl ScriptContext<'_> {
    /// The runner invocation plus the optional try-submit trailer.
    ///
    /// This part of the script is scheduler-independent; adapters prepend
    /// their own preamble.
    pub fn runner_stanza(&self, batch: &BatchSpec) -> String {
        let mut stanza = format!(
            "{} run-jobs {} --output {} --batch-id {}\n",
            self.jade_executable,
            batch.config_file_path.display(),
            self.output.root().display(),
            batch.batch_id,
        );
        if self.distributed_submitter {
            stanza.push_str(&format!(
                "{} try-submit {}\n",
                self.jade_executable,
                self.output.root().display(),
            ));
        }
        stanza
    }
}

/// Capability interface over the queueing system.
pub trait HpcAdapter: Send + Sync {
    /// Adapter name for logs.
    fn name(&self) -> &'static str;

    /// Submit a script, returning the scheduler's job id.
    fn submit(&self, script_path: &Path) -> Result<String>;

    /// Poll one job id.
    fn status(&self, hpc_job_id: &str) -> Result<HpcJobStatus>;

    /// Cancel one job id. Cancelling an already-finished job is not an error.
    fn cancel(&self, hpc_job_id: &str) -> Result<()>;

    /// Scheduler job ids whose names start with `prefix`.
    fn list_active_ids(&self, prefix: &str) -> Result<Vec<String>>;

    /// Render the submission script for a batch.
    fn render_submit_script(&self, batch: &BatchSpec, ctx: &ScriptContext<'_>) -> String;
}

/// Build the adapter selected by the HPC profile.
pub fn create_adapter(config: &HpcConfig) -> Box<dyn HpcAdapter> {
    match config.hpc_type {
        HpcType::Slurm => Box::new(SlurmHpc::new()),
        HpcType::Fake | HpcType::Local => Box::new(FakeHpc::new()),
    }
}

/// Path of the currently running jade executable, for script rendering.
pub fn current_executable() -> String {
    std::env::current_exe()
        .map(|p: PathBuf| p.display().to_string())
        .unwrap_or_else(|_| "jade".to_string())
}

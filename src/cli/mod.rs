//! CLI command implementations

pub mod cancel;
pub mod logging;
pub mod resubmit;
pub mod run;
pub mod show_results;
pub mod status;
pub mod submit;
pub mod try_submit;

use std::path::Path;

use anyhow::{Context, Result};

use crate::cluster::{ClusterState, ClusterStore};
use crate::config::{Configuration, HpcConfig};
use crate::hpc::{HpcAdapter, create_adapter};
use crate::output::OutputDir;

/// Process exit codes of the CLI surface.
pub const EXIT_SUCCESS: i32 = 0;
pub const EXIT_JOB_FAILURE: i32 = 1;
pub const EXIT_SUBMISSION_ERROR: i32 = 2;
pub const EXIT_CANCELED: i32 = 3;

/// Everything an entry point needs to act on an existing run.
pub(crate) struct RunEnv {
    pub store: ClusterStore,
    pub config: Configuration,
    pub hpc_config: HpcConfig,
    pub adapter: Box<dyn HpcAdapter>,
}

/// Load a run from its output directory (the submitted configuration and HPC
/// profile are copied there at submit time).
pub(crate) fn load_run_env(output: &Path) -> Result<RunEnv> {
    let out = OutputDir::new(output);
    let config = Configuration::from_file(&out.config_path())
        .with_context(|| format!("No submitted run found in {}", output.display()))?;
    let hpc_config = HpcConfig::from_file(&out.hpc_config_path())?;
    let adapter = create_adapter(&hpc_config);
    Ok(RunEnv {
        store: ClusterStore::new(out),
        config,
        hpc_config,
        adapter,
    })
}

/// Exit code for a finished run per the documented CLI contract.
pub(crate) fn exit_code_for_state(state: &ClusterState) -> i32 {
    if state.canceled {
        return EXIT_CANCELED;
    }
    if state.summary_counts().all_successful() {
        EXIT_SUCCESS
    } else {
        EXIT_JOB_FAILURE
    }
}

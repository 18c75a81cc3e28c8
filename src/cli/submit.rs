//! Submit command implementation

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use tracing::{error, info};

use crate::cluster::{ClusterState, ClusterStore};
use crate::config::{Configuration, HpcConfig};
use crate::hpc::create_adapter;
use crate::output::OutputDir;
use crate::runner::run_hook;
use crate::submit::{RunOutcome, SubmitterLoop};

use super::{EXIT_SUCCESS, exit_code_for_state, load_run_env};

/// Validate the configuration, create the run and submit the first batches.
pub fn submit_jobs_command(
    config_path: &Path,
    output: &Path,
    hpc_config_path: Option<&PathBuf>,
    no_distributed_submitter: bool,
    wait: bool,
) -> Result<i32> {
    let config = Configuration::from_file(config_path)?;
    let hpc_config = match hpc_config_path {
        Some(path) => HpcConfig::from_file(path)?,
        None => HpcConfig::default(),
    };

    let out = OutputDir::new(output);
    if out.state_path().exists() {
        bail!(
            "{} already contains a run; use resubmit-jobs or choose a fresh output directory",
            output.display()
        );
    }
    out.ensure_layout()?;

    // Copy both documents into the run so compute nodes and later entry
    // points work from the exact submitted inputs.
    config.save_to_file(&out.config_path())?;
    hpc_config.save_to_file(&out.hpc_config_path())?;

    let mut state = ClusterState::new(&config);
    state.distributed_submitter = !no_distributed_submitter;
    let store = ClusterStore::new(out);
    store.initialize(&state)?;

    if let Some(setup) = config.setup_command.as_deref() {
        let code = run_hook(setup, "run setup")?;
        if code != 0 {
            bail!("run setup command failed with exit code {code}");
        }
    }

    let adapter = create_adapter(&hpc_config);
    let submitter = SubmitterLoop::new(&store, &config, &hpc_config, adapter.as_ref());
    let outcome = submitter.run_once()?;
    info!(
        config_id = %config.config_id(),
        jobs = config.jobs.len(),
        output = %output.display(),
        "run submitted"
    );

    if !wait {
        return Ok(EXIT_SUCCESS);
    }
    wait_for_completion(output, outcome, config.poll_interval_secs())
}

/// Poll the run with submitter iterations until it reaches a terminal state.
pub(crate) fn wait_for_completion(
    output: &Path,
    first_outcome: RunOutcome,
    poll_interval_secs: u64,
) -> Result<i32> {
    let mut outcome = first_outcome;
    while outcome == RunOutcome::InProgress {
        std::thread::sleep(Duration::from_secs(poll_interval_secs.max(1)));
        let env = load_run_env(output)?;
        let submitter = SubmitterLoop::new(
            &env.store,
            &env.config,
            &env.hpc_config,
            env.adapter.as_ref(),
        );
        outcome = submitter.run_once()?;
    }

    let env = load_run_env(output)?;
    let state = env
        .store
        .read_state()
        .with_context(|| "Failed to read final cluster state")?;
    let summary = state.summary_counts();
    if summary.all_successful() && !state.canceled {
        info!(successful = summary.successful, "run completed successfully");
    } else {
        error!(
            successful = summary.successful,
            failed = summary.failed,
            missing = summary.missing,
            canceled = summary.canceled,
            "run completed with problems"
        );
    }
    Ok(exit_code_for_state(&state))
}

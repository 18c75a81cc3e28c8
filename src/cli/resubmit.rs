//! Resubmit command implementation

use std::path::Path;

use anyhow::{Result, bail};
use tracing::info;

use crate::results::prepare_resubmit;
use crate::submit::SubmitterLoop;

use super::{EXIT_SUCCESS, load_run_env, submit::wait_for_completion};

pub fn resubmit_jobs_command(
    output: &Path,
    failed: bool,
    missing: bool,
    wait: bool,
) -> Result<i32> {
    if !failed && !missing {
        bail!("nothing selected; pass --failed and/or --missing");
    }

    let env = load_run_env(output)?;
    let selected = prepare_resubmit(&env.store, &env.config, failed, missing)?;
    if selected.is_empty() {
        println!("No jobs match the resubmission criteria.");
        return Ok(EXIT_SUCCESS);
    }
    info!(jobs = selected.len(), "resubmitting");

    let submitter = SubmitterLoop::new(
        &env.store,
        &env.config,
        &env.hpc_config,
        env.adapter.as_ref(),
    );
    let outcome = submitter.run_once()?;

    if !wait {
        return Ok(EXIT_SUCCESS);
    }
    wait_for_completion(output, outcome, env.config.poll_interval_secs())
}

//! Cancel command implementation

use std::path::Path;

use anyhow::Result;

use crate::cancel::cancel_run;

use super::{EXIT_SUCCESS, load_run_env};

pub fn cancel_jobs_command(output: &Path) -> Result<i32> {
    let env = load_run_env(output)?;
    cancel_run(&env.store, env.adapter.as_ref())?;
    println!(
        "Cancellation requested. Running jobs will be terminated; run `jade show-status {}` to follow progress.",
        output.display()
    );
    Ok(EXIT_SUCCESS)
}

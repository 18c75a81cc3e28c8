//! Try-submit command implementation
//!
//! One explicit submitter iteration. This is what rendered node scripts call
//! on exit, and what an operator runs after recovering an orphaned lock.

use std::path::Path;

use anyhow::Result;

use crate::submit::{RunOutcome, SubmitterLoop};

use super::{EXIT_CANCELED, EXIT_SUCCESS, exit_code_for_state, load_run_env};

pub fn try_submit_command(output: &Path) -> Result<i32> {
    let env = load_run_env(output)?;
    let submitter = SubmitterLoop::new(
        &env.store,
        &env.config,
        &env.hpc_config,
        env.adapter.as_ref(),
    );

    match submitter.run_once()? {
        RunOutcome::InProgress => Ok(EXIT_SUCCESS),
        RunOutcome::Canceled => Ok(EXIT_CANCELED),
        RunOutcome::Complete => {
            let state = env.store.read_state()?;
            Ok(exit_code_for_state(&state))
        }
    }
}

//! Show-results command implementation

use std::path::Path;

use anyhow::Result;

use crate::output::OutputDir;
use crate::results::render_results_table;

use super::{EXIT_SUCCESS, load_run_env};

/// Re-render the results summary from the canonical results file.
pub fn show_results_command(output: &Path) -> Result<i32> {
    let env = load_run_env(output)?;
    let mut results = env.store.read_processed_results()?;
    results.sort_by_key(|r| r.job_id);
    print!("{}", render_results_table(&OutputDir::new(output), &results));
    Ok(EXIT_SUCCESS)
}

//! Final report generation

mod resubmit;

pub use resubmit::prepare_resubmit;

use std::fmt::Write as _;
use std::fs;

use anyhow::{Context, Result};
use tracing::info;

use crate::cluster::{ClusterState, JobResult, JobStatus};
use crate::output::OutputDir;

/// Lines of stderr quoted per failed job in errors.txt.
const STDERR_TAIL_LINES: usize = 20;

/// Write `results.txt` and `errors.txt` for a finished run.
pub fn write_reports(output: &OutputDir, state: &ClusterState) -> Result<()> {
    let mut results = state.completed_results.clone();
    results.sort_by_key(|r| r.job_id);

    let results_path = output.results_txt_path();
    fs::write(&results_path, render_results_table(output, &results))
        .with_context(|| format!("Failed to write {}", results_path.display()))?;

    let errors_path = output.errors_txt_path();
    fs::write(&errors_path, render_errors(output, &results))
        .with_context(|| format!("Failed to write {}", errors_path.display()))?;

    info!(path = %results_path.display(), "wrote final reports");
    Ok(())
}

/// Render the tabular summary for `results.txt` and `show-results`.
pub fn render_results_table(output: &OutputDir, results: &[JobResult]) -> String {
    let mut successful = 0usize;
    let mut failed = 0usize;
    let mut missing = 0usize;
    let mut canceled = 0usize;
    for result in results {
        match result.status {
            JobStatus::Finished if result.return_code == 0 => successful += 1,
            JobStatus::Finished => failed += 1,
            JobStatus::Missing => missing += 1,
            JobStatus::Canceled => canceled += 1,
        }
    }

    let mut text = String::new();
    let _ = writeln!(text, "Results of jobs in {}", output.root().display());
    let _ = writeln!(text, "{}", "=".repeat(80));
    let _ = writeln!(text);
    let _ = writeln!(text, "Num successful: {successful}");
    let _ = writeln!(text, "Num failed:     {failed}");
    let _ = writeln!(text, "Num missing:    {missing}");
    let _ = writeln!(text, "Num canceled:   {canceled}");
    let _ = writeln!(text, "Total:          {}", results.len());
    let _ = writeln!(text);
    let _ = writeln!(
        text,
        "{:<6} {:<24} {:>11} {:<9} {:>12} {:<25} {:>8} {:<12}",
        "index", "name", "return_code", "status", "exec_time_s", "completion_time", "batch_id", "hpc_job_id"
    );
    let _ = writeln!(text, "{}", "-".repeat(116));
    for (index, result) in results.iter().enumerate() {
        let _ = writeln!(
            text,
            "{:<6} {:<24} {:>11} {:<9} {:>12.3} {:<25} {:>8} {:<12}",
            index + 1,
            result.name,
            result.return_code,
            result.status.to_string(),
            result.exec_time_s,
            result.completion_time.to_rfc3339(),
            result.batch_id,
            result.hpc_job_id,
        );
    }
    text
}

/// Render `errors.txt`: identifiers of every unsuccessful job plus the tail
/// of each failed job's captured stderr.
fn render_errors(output: &OutputDir, results: &[JobResult]) -> String {
    let mut text = String::new();

    let failed: Vec<&JobResult> = results
        .iter()
        .filter(|r| r.status == JobStatus::Finished && r.return_code != 0)
        .collect();
    let missing: Vec<&JobResult> = results
        .iter()
        .filter(|r| r.status == JobStatus::Missing)
        .collect();
    let canceled: Vec<&JobResult> = results
        .iter()
        .filter(|r| r.status == JobStatus::Canceled)
        .collect();

    if failed.is_empty() && missing.is_empty() && canceled.is_empty() {
        let _ = writeln!(text, "No errors detected.");
        return text;
    }

    for (label, subset) in [
        ("Failed jobs", &failed),
        ("Missing jobs", &missing),
        ("Canceled jobs", &canceled),
    ] {
        if subset.is_empty() {
            continue;
        }
        let _ = writeln!(text, "{label}:");
        for result in subset {
            let _ = writeln!(
                text,
                "  {} (job_id={}, batch_id={}, return_code={})",
                result.name, result.job_id, result.batch_id, result.return_code
            );
        }
        let _ = writeln!(text);
    }

    for result in &failed {
        let stderr_path = output.job_stderr_path(&result.name);
        let Ok(content) = fs::read_to_string(&stderr_path) else {
            continue;
        };
        if content.trim().is_empty() {
            continue;
        }
        let _ = writeln!(text, "--- stderr tail of {} ---", result.name);
        let lines: Vec<&str> = content.lines().collect();
        let start = lines.len().saturating_sub(STDERR_TAIL_LINES);
        for line in &lines[start..] {
            let _ = writeln!(text, "{line}");
        }
        let _ = writeln!(text);
    }

    text
}

//! Output directory layout
//!
//! Every run owns one output directory on a filesystem shared between the
//! login node and the compute nodes. All coordination state lives under it:
//!
//! ```text
//! cluster_config.json              cluster state document
//! cluster_config.json.lock         advisory file lock
//! cancellation_flag                empty file; presence means cancel
//! config.json                      copy of the submitted configuration
//! hpc_config.toml                  copy of the HPC profile
//! configs/config_batch_<N>.json    filtered configs handed to each node
//! configs/run_batch_<N>.sh         rendered submission scripts
//! results/results_batch_<N>.csv    per-batch staging results (ephemeral)
//! processed_results.csv            appended from drained batch CSVs
//! job-outputs/<job_name>/          user-owned output area
//! job-stdio/<job_name>.{o,e}       captured stdout/stderr
//! results.txt, errors.txt          final reports
//! submit_jobs.log, run_jobs.log    per-entry-point log files
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

/// Typed view of a run's output directory.
#[derive(Debug, Clone)]
pub struct OutputDir {
    root: PathBuf,
}

impl OutputDir {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Create the directory skeleton for a new run.
    pub fn ensure_layout(&self) -> Result<()> {
        for dir in [
            self.root.clone(),
            self.configs_dir(),
            self.results_dir(),
            self.stdio_dir(),
            self.job_outputs_dir(),
        ] {
            fs::create_dir_all(&dir)
                .with_context(|| format!("Failed to create output directory: {}", dir.display()))?;
        }
        Ok(())
    }

    pub fn state_path(&self) -> PathBuf {
        self.root.join("cluster_config.json")
    }

    pub fn lock_path(&self) -> PathBuf {
        self.root.join("cluster_config.json.lock")
    }

    pub fn cancel_flag_path(&self) -> PathBuf {
        self.root.join("cancellation_flag")
    }

    pub fn config_path(&self) -> PathBuf {
        self.root.join("config.json")
    }

    pub fn hpc_config_path(&self) -> PathBuf {
        self.root.join("hpc_config.toml")
    }

    pub fn configs_dir(&self) -> PathBuf {
        self.root.join("configs")
    }

    pub fn results_dir(&self) -> PathBuf {
        self.root.join("results")
    }

    pub fn stdio_dir(&self) -> PathBuf {
        self.root.join("job-stdio")
    }

    pub fn job_outputs_dir(&self) -> PathBuf {
        self.root.join("job-outputs")
    }

    pub fn batch_config_path(&self, batch_id: u64) -> PathBuf {
        self.configs_dir().join(format!("config_batch_{batch_id}.json"))
    }

    pub fn batch_script_path(&self, batch_id: u64) -> PathBuf {
        self.configs_dir().join(format!("run_batch_{batch_id}.sh"))
    }

    pub fn batch_results_path(&self, batch_id: u64) -> PathBuf {
        self.results_dir().join(format!("results_batch_{batch_id}.csv"))
    }

    pub fn processed_results_path(&self) -> PathBuf {
        self.root.join("processed_results.csv")
    }

    pub fn results_txt_path(&self) -> PathBuf {
        self.root.join("results.txt")
    }

    pub fn errors_txt_path(&self) -> PathBuf {
        self.root.join("errors.txt")
    }

    pub fn submit_log_path(&self) -> PathBuf {
        self.root.join("submit_jobs.log")
    }

    pub fn run_log_path(&self) -> PathBuf {
        self.root.join("run_jobs.log")
    }

    pub fn job_stdout_path(&self, job_name: &str) -> PathBuf {
        self.stdio_dir().join(format!("{job_name}.o"))
    }

    pub fn job_stderr_path(&self, job_name: &str) -> PathBuf {
        self.stdio_dir().join(format!("{job_name}.e"))
    }

    /// List the staged per-batch result files currently on disk.
    pub fn list_batch_result_files(&self) -> Result<Vec<PathBuf>> {
        let dir = self.results_dir();
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut files = Vec::new();
        for entry in fs::read_dir(&dir)
            .with_context(|| format!("Failed to read results directory: {}", dir.display()))?
        {
            let path = entry?.path();
            let name = path.file_name().and_then(|n| n.to_str()).unwrap_or("");
            if name.starts_with("results_batch_") && name.ends_with(".csv") {
                files.push(path);
            }
        }
        files.sort();
        Ok(files)
    }
}

//! CLI command definitions for jade.

use std::path::PathBuf;

use clap::Subcommand;

#[derive(Subcommand)]
pub enum Commands {
    /// Validate a configuration, create the output directory and submit the
    /// first round of batches
    SubmitJobs {
        /// Path to the job configuration (JSON)
        config: PathBuf,

        /// Output directory shared between login and compute nodes
        #[arg(short, long, default_value = "output")]
        output: PathBuf,

        /// Path to the HPC profile (TOML); defaults to a local-execution profile
        #[arg(long)]
        hpc_config: Option<PathBuf>,

        /// Disable submitter promotion on compute nodes; only explicit
        /// try-submit calls advance the run
        #[arg(long)]
        no_distributed_submitter: bool,

        /// Block until the run completes, polling the cluster state
        #[arg(long)]
        wait: bool,
    },

    /// Run one submitter iteration: drain results, detect dead batches,
    /// submit whatever became ready
    TrySubmit {
        /// Output directory of the run
        output: PathBuf,
    },

    /// Execute one batch on this node (invoked by rendered submission scripts)
    RunJobs {
        /// Filtered batch configuration written by the submitter
        config: PathBuf,

        /// Output directory of the run
        #[arg(short, long)]
        output: PathBuf,

        /// Batch id assigned at submission
        #[arg(long)]
        batch_id: u64,
    },

    /// Cancel a running workload
    CancelJobs {
        /// Output directory of the run
        output: PathBuf,
    },

    /// Resubmit failed and/or missing jobs from a previous run
    ResubmitJobs {
        /// Output directory of the run
        output: PathBuf,

        /// Resubmit jobs that finished with a non-zero return code
        #[arg(long)]
        failed: bool,

        /// Resubmit jobs whose allocation died before they reported a result
        #[arg(long)]
        missing: bool,

        /// Block until the resubmitted run completes
        #[arg(long)]
        wait: bool,
    },

    /// Show batch and job progress of a run
    ShowStatus {
        /// Output directory of the run
        output: PathBuf,
    },

    /// Re-render the results summary from the canonical results file
    ShowResults {
        /// Output directory of the run
        output: PathBuf,
    },
}

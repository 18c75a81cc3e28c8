use std::process::ExitCode;

use anyhow::Result;
use clap::Parser;

use jade::cli;
use jade::output::OutputDir;

mod commands;
use commands::Commands;

#[derive(Parser)]
#[command(name = "jade")]
#[command(about = "Workload automation over HPC batch schedulers")]
#[command(version)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let log_file = match &cli.command {
        Commands::SubmitJobs { output, .. }
        | Commands::TrySubmit { output }
        | Commands::ResubmitJobs { output, .. } => Some(OutputDir::new(output).submit_log_path()),
        Commands::RunJobs { output, .. } => Some(OutputDir::new(output).run_log_path()),
        _ => None,
    };
    if let Err(err) = cli::logging::init_logging(cli.verbose, log_file.as_deref()) {
        eprintln!("Error: {err:#}");
        return ExitCode::from(cli::EXIT_SUBMISSION_ERROR as u8);
    }

    match dispatch(cli.command) {
        Ok(code) => ExitCode::from(code as u8),
        Err(err) => {
            tracing::error!("{err:#}");
            ExitCode::from(cli::EXIT_SUBMISSION_ERROR as u8)
        }
    }
}

fn dispatch(command: Commands) -> Result<i32> {
    match command {
        Commands::SubmitJobs {
            config,
            output,
            hpc_config,
            no_distributed_submitter,
            wait,
        } => cli::submit::submit_jobs_command(
            &config,
            &output,
            hpc_config.as_ref(),
            no_distributed_submitter,
            wait,
        ),
        Commands::TrySubmit { output } => cli::try_submit::try_submit_command(&output),
        Commands::RunJobs {
            config,
            output,
            batch_id,
        } => cli::run::run_jobs_command(&config, &output, batch_id),
        Commands::CancelJobs { output } => cli::cancel::cancel_jobs_command(&output),
        Commands::ResubmitJobs {
            output,
            failed,
            missing,
            wait,
        } => cli::resubmit::resubmit_jobs_command(&output, failed, missing, wait),
        Commands::ShowStatus { output } => cli::status::show_status_command(&output),
        Commands::ShowResults { output } => cli::show_results::show_results_command(&output),
    }
}

//! JADE - workload automation over HPC batch schedulers
//!
//! JADE turns a DAG of executable jobs into node-sized batches, submits each
//! batch through a pluggable scheduler adapter, and runs a per-node worker
//! pool that executes the batch's jobs in parallel. Coordination between the
//! login node and compute nodes happens only through the shared output
//! directory and an advisory file lock, so any process that finishes work can
//! promote itself to submitter and advance the run.

pub mod batch;
pub mod cancel;
pub mod cli;
pub mod cluster;
pub mod config;
pub mod hpc;
pub mod output;
pub mod results;
pub mod runner;
pub mod submit;

pub use cluster::{ActiveBatch, BatchState, ClusterState, ClusterStore, JobResult, JobStatus};
pub use config::{Configuration, HpcConfig, JobSpec, SubmissionGroup, SubmitterParams};
pub use output::OutputDir;

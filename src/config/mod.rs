//! Configuration loading and validation

mod hpc;
mod io;

pub use hpc::{HpcConfig, HpcSettings, HpcType, walltime_minutes};

use std::collections::{BTreeMap, HashMap, HashSet};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Validation failures detected when a configuration is loaded.
///
/// These are fatal: no jobs are submitted when any of them fires.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("duplicate job_id {0}")]
    DuplicateJobId(u64),
    #[error("duplicate submission group '{0}'")]
    DuplicateGroup(String),
    #[error("job {job_id} references unknown submission group '{group}'")]
    UnknownGroup { job_id: u64, group: String },
    #[error("job {job_id} must name a submission group ({count} groups are defined)")]
    AmbiguousGroup { job_id: u64, count: usize },
    #[error("job {job_id} is blocked by unknown job {blocker}")]
    UnknownBlocker { job_id: u64, blocker: u64 },
    #[error("cycle detected in blocked_by graph involving job {0}")]
    DependencyCycle(u64),
    #[error("max_nodes differs across submission groups ({0} vs {1})")]
    InconsistentMaxNodes(u64, u64),
    #[error("poll_interval differs across submission groups ({0}s vs {1}s)")]
    InconsistentPollInterval(u64, u64),
    #[error("configuration contains no jobs")]
    NoJobs,
    #[error("configuration contains no submission groups")]
    NoGroups,
}

/// A single executable job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSpec {
    /// Unique id within the configuration (1-based)
    pub job_id: u64,

    /// Display name; defaults to the id. Used in paths and result rows.
    #[serde(default)]
    pub name: Option<String>,

    /// Command line; not shell-interpreted, argv comes from whitespace-splitting
    pub command: String,

    /// Ids of jobs that must reach a terminal state before this one runs
    #[serde(default)]
    pub blocked_by: Vec<u64>,

    /// Cancel this job (without running it) when a blocker fails
    #[serde(default)]
    pub cancel_on_blocking_job_failure: bool,

    /// Estimated runtime, used by time-based batching
    #[serde(default)]
    pub estimated_run_minutes: Option<u64>,

    /// Submission group name; optional when exactly one group is defined
    #[serde(default)]
    pub submission_group: Option<String>,

    /// Opaque key/value data passed through to pre/post hooks
    #[serde(default)]
    pub ext: HashMap<String, serde_json::Value>,
}

impl JobSpec {
    pub fn new(job_id: u64, command: impl Into<String>) -> Self {
        Self {
            job_id,
            name: None,
            command: command.into(),
            blocked_by: Vec::new(),
            cancel_on_blocking_job_failure: false,
            estimated_run_minutes: None,
            submission_group: None,
            ext: HashMap::new(),
        }
    }

    /// Display name, falling back to the job id.
    pub fn name(&self) -> String {
        self.name.clone().unwrap_or_else(|| self.job_id.to_string())
    }
}

fn default_per_node_batch_size() -> u64 {
    100
}

fn default_max_nodes() -> u64 {
    1
}

fn default_poll_interval() -> u64 {
    1
}

/// Batching and node policy for one submission group.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitterParams {
    /// Per-group HPC parameters; falls back to the profile's `[hpc]` table
    #[serde(default)]
    pub hpc_config: Option<HpcSettings>,

    /// Jobs per batch for size-based batching
    #[serde(default = "default_per_node_batch_size")]
    pub per_node_batch_size: u64,

    /// Pack batches by estimated runtime against the walltime instead of by count
    #[serde(default)]
    pub time_based_batching: bool,

    /// Worker-pool width on each node; defaults to the node's CPU count
    #[serde(default)]
    pub num_parallel_processes_per_node: Option<u64>,

    /// Pull still-blocked jobs into an under-full batch; the node resolves
    /// their dependencies locally once the blockers complete in the same batch
    #[serde(default)]
    pub try_add_blocked_jobs: bool,

    /// Run once per allocated node before any job starts; non-zero exit
    /// fails every job in the batch
    #[serde(default)]
    pub node_setup_command: Option<Vec<String>>,

    /// Run once per allocated node after the batch, regardless of job results
    #[serde(default)]
    pub node_teardown_command: Option<Vec<String>>,

    /// Ceiling on concurrently allocated nodes; must agree across groups
    #[serde(default = "default_max_nodes")]
    pub max_nodes: u64,

    /// Cancellation-flag poll cadence in seconds; must agree across groups
    #[serde(default = "default_poll_interval")]
    pub poll_interval: u64,
}

impl Default for SubmitterParams {
    fn default() -> Self {
        Self {
            hpc_config: None,
            per_node_batch_size: default_per_node_batch_size(),
            time_based_batching: false,
            num_parallel_processes_per_node: None,
            try_add_blocked_jobs: false,
            node_setup_command: None,
            node_teardown_command: None,
            max_nodes: default_max_nodes(),
            poll_interval: default_poll_interval(),
        }
    }
}

impl SubmitterParams {
    /// Effective worker-pool width.
    pub fn parallelism(&self) -> usize {
        self.num_parallel_processes_per_node
            .map(|n| n.max(1) as usize)
            .unwrap_or_else(num_cpus::get)
    }
}

/// A named batching/HPC policy jobs may reference.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmissionGroup {
    /// Unique group name
    pub name: String,

    /// Batching and node policy
    #[serde(default)]
    pub submitter_params: SubmitterParams,
}

/// Top-level job configuration document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Configuration {
    /// Ordered job list; insertion order is the batching tie-break
    pub jobs: Vec<JobSpec>,

    /// Submission groups; `max_nodes` and `poll_interval` must agree across them
    pub submission_groups: Vec<SubmissionGroup>,

    /// Run once on the submitter host before the first submission
    #[serde(default)]
    pub setup_command: Option<Vec<String>>,

    /// Run once on the submitter host after the run completes
    #[serde(default)]
    pub teardown_command: Option<Vec<String>>,

    /// Opaque data exposed to jobs through `JADE_USER_DATA`
    #[serde(default)]
    pub user_data: Option<serde_json::Value>,
}

impl Configuration {
    pub fn new(jobs: Vec<JobSpec>, submission_groups: Vec<SubmissionGroup>) -> Self {
        Self {
            jobs,
            submission_groups,
            setup_command: None,
            teardown_command: None,
            user_data: None,
        }
    }

    /// Stable fingerprint of the configuration document.
    ///
    /// Derived from the canonical JSON serialization, so logically equal
    /// configurations hash equal regardless of the file they came from.
    pub fn config_id(&self) -> String {
        let canonical = serde_json::to_vec(self).unwrap_or_default();
        let digest = Sha256::digest(&canonical);
        let mut hex = String::with_capacity(digest.len() * 2);
        for byte in digest {
            hex.push_str(&format!("{byte:02x}"));
        }
        hex
    }

    pub fn job(&self, job_id: u64) -> Option<&JobSpec> {
        self.jobs.iter().find(|j| j.job_id == job_id)
    }

    pub fn group(&self, name: &str) -> Option<&SubmissionGroup> {
        self.submission_groups.iter().find(|g| g.name == name)
    }

    /// Resolve the submission group a job belongs to.
    ///
    /// Only valid after `validate()`: jobs without an explicit group are
    /// legal only when exactly one group exists.
    pub fn group_for_job(&self, job: &JobSpec) -> &SubmissionGroup {
        match &job.submission_group {
            Some(name) => self
                .group(name)
                .expect("validated configuration references known groups"),
            None => &self.submission_groups[0],
        }
    }

    /// Shared `max_nodes` across groups (validated identical).
    pub fn max_nodes(&self) -> u64 {
        self.submission_groups
            .first()
            .map(|g| g.submitter_params.max_nodes)
            .unwrap_or(1)
    }

    /// Shared `poll_interval` across groups (validated identical).
    pub fn poll_interval_secs(&self) -> u64 {
        self.submission_groups
            .first()
            .map(|g| g.submitter_params.poll_interval)
            .unwrap_or(1)
    }

    /// Validate the whole document. All failures are fatal at load time.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.jobs.is_empty() {
            return Err(ConfigError::NoJobs);
        }
        if self.submission_groups.is_empty() {
            return Err(ConfigError::NoGroups);
        }

        let mut group_names = HashSet::new();
        for group in &self.submission_groups {
            if !group_names.insert(group.name.as_str()) {
                return Err(ConfigError::DuplicateGroup(group.name.clone()));
            }
        }

        let mut ids = HashSet::new();
        for job in &self.jobs {
            if !ids.insert(job.job_id) {
                return Err(ConfigError::DuplicateJobId(job.job_id));
            }
        }

        for job in &self.jobs {
            match &job.submission_group {
                Some(name) if !group_names.contains(name.as_str()) => {
                    return Err(ConfigError::UnknownGroup {
                        job_id: job.job_id,
                        group: name.clone(),
                    });
                }
                None if self.submission_groups.len() != 1 => {
                    return Err(ConfigError::AmbiguousGroup {
                        job_id: job.job_id,
                        count: self.submission_groups.len(),
                    });
                }
                _ => {}
            }
            for blocker in &job.blocked_by {
                if !ids.contains(blocker) {
                    return Err(ConfigError::UnknownBlocker {
                        job_id: job.job_id,
                        blocker: *blocker,
                    });
                }
            }
        }

        self.check_acyclic()?;

        let first = &self.submission_groups[0].submitter_params;
        for group in &self.submission_groups[1..] {
            let params = &group.submitter_params;
            if params.max_nodes != first.max_nodes {
                return Err(ConfigError::InconsistentMaxNodes(
                    first.max_nodes,
                    params.max_nodes,
                ));
            }
            if params.poll_interval != first.poll_interval {
                return Err(ConfigError::InconsistentPollInterval(
                    first.poll_interval,
                    params.poll_interval,
                ));
            }
        }

        Ok(())
    }

    /// Depth-first cycle check over `blocked_by`.
    fn check_acyclic(&self) -> Result<(), ConfigError> {
        let edges: BTreeMap<u64, &Vec<u64>> =
            self.jobs.iter().map(|j| (j.job_id, &j.blocked_by)).collect();

        // 0 = unvisited, 1 = on stack, 2 = done
        let mut marks: HashMap<u64, u8> = HashMap::new();
        for &start in edges.keys() {
            if marks.get(&start).copied().unwrap_or(0) != 0 {
                continue;
            }
            let mut stack = vec![(start, 0usize)];
            marks.insert(start, 1);
            while let Some(&mut (node, idx)) = stack.last_mut() {
                let blockers = edges[&node];
                if idx < blockers.len() {
                    stack.last_mut().expect("stack is non-empty").1 += 1;
                    let next = blockers[idx];
                    match marks.get(&next).copied().unwrap_or(0) {
                        0 => {
                            marks.insert(next, 1);
                            stack.push((next, 0));
                        }
                        1 => return Err(ConfigError::DependencyCycle(next)),
                        _ => {}
                    }
                } else {
                    marks.insert(node, 2);
                    stack.pop();
                }
            }
        }
        Ok(())
    }

    /// Build the reduced configuration handed to a single node.
    ///
    /// Only the batch's jobs are kept, and `blocked_by` edges are filtered to
    /// jobs inside the batch: any blocker outside it was already terminal (or
    /// treated as satisfied) when the batch was formed, so the node never has
    /// to consult global state for it.
    pub fn filtered(&self, job_ids: &[u64]) -> Configuration {
        let keep: HashSet<u64> = job_ids.iter().copied().collect();
        let jobs = self
            .jobs
            .iter()
            .filter(|j| keep.contains(&j.job_id))
            .map(|j| {
                let mut job = j.clone();
                job.blocked_by.retain(|b| keep.contains(b));
                job
            })
            .collect();

        Configuration {
            jobs,
            submission_groups: self.submission_groups.clone(),
            setup_command: None,
            teardown_command: None,
            user_data: self.user_data.clone(),
        }
    }
}

//! Shared test utilities for workload integration tests

#![allow(dead_code)]

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::Result;

use jade::batch::BatchSpec;
use jade::cluster::{ClusterState, ClusterStore};
use jade::config::{Configuration, HpcConfig, SubmissionGroup, SubmitterParams};
use jade::hpc::{HpcAdapter, HpcJobStatus, ScriptContext};
use jade::output::OutputDir;
use jade::runner::{JobRunner, PoolSummary};

/// Scriptable scheduler stand-in: submissions are recorded, nothing is
/// executed, and tests drive node behavior by running batches themselves.
pub struct StubHpc {
    next_id: AtomicU64,
    pub submitted: Mutex<Vec<(String, PathBuf)>>,
    pub canceled: Mutex<Vec<String>>,
    statuses: Mutex<HashMap<String, HpcJobStatus>>,
}

impl StubHpc {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1000),
            submitted: Mutex::new(Vec::new()),
            canceled: Mutex::new(Vec::new()),
            statuses: Mutex::new(HashMap::new()),
        }
    }

    pub fn set_status(&self, hpc_job_id: &str, status: HpcJobStatus) {
        self.statuses
            .lock()
            .unwrap()
            .insert(hpc_job_id.to_string(), status);
    }

    pub fn submission_count(&self) -> usize {
        self.submitted.lock().unwrap().len()
    }
}

impl HpcAdapter for StubHpc {
    fn name(&self) -> &'static str {
        "stub"
    }

    fn submit(&self, script_path: &Path) -> Result<String> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst).to_string();
        self.submitted
            .lock()
            .unwrap()
            .push((id.clone(), script_path.to_path_buf()));
        Ok(id)
    }

    fn status(&self, hpc_job_id: &str) -> Result<HpcJobStatus> {
        Ok(self
            .statuses
            .lock()
            .unwrap()
            .get(hpc_job_id)
            .copied()
            .unwrap_or(HpcJobStatus::Running))
    }

    fn cancel(&self, hpc_job_id: &str) -> Result<()> {
        self.canceled.lock().unwrap().push(hpc_job_id.to_string());
        Ok(())
    }

    fn list_active_ids(&self, _prefix: &str) -> Result<Vec<String>> {
        Ok(Vec::new())
    }

    fn render_submit_script(&self, batch: &BatchSpec, ctx: &ScriptContext<'_>) -> String {
        format!("#!/bin/bash\n{}", ctx.runner_stanza(batch))
    }
}

/// One submission group with the given parameters, named "default".
pub fn single_group(params: SubmitterParams) -> Vec<SubmissionGroup> {
    vec![SubmissionGroup {
        name: "default".to_string(),
        submitter_params: params,
    }]
}

/// Create and persist a fresh run in `output`.
pub fn init_run(output: &Path, config: &Configuration) -> ClusterStore {
    let out = OutputDir::new(output);
    out.ensure_layout().unwrap();
    config.save_to_file(&out.config_path()).unwrap();
    HpcConfig::default().save_to_file(&out.hpc_config_path()).unwrap();

    let store = ClusterStore::new(out);
    store.initialize(&ClusterState::new(config)).unwrap();
    store
}

/// Execute one submitted batch the way its node would, using the filtered
/// config the submitter wrote.
pub fn run_batch_on_node(output: &Path, batch_id: u64, hpc_job_id: &str) -> PoolSummary {
    let out = OutputDir::new(output);
    let config = Configuration::from_file(&out.batch_config_path(batch_id)).unwrap();
    let runner = JobRunner::new(out, config, batch_id, hpc_job_id.to_string());
    runner.run().unwrap()
}

/// A shell script in `dir` that exits with `code`, runnable through the
/// whitespace-split command syntax.
pub fn exit_script(dir: &Path, name: &str, code: i32) -> String {
    let path = dir.join(name);
    std::fs::write(&path, format!("#!/bin/bash\nexit {code}\n")).unwrap();
    format!("bash {}", path.display())
}

/// Simple deterministic generator for randomized-DAG tests.
pub struct Lcg(u64);

impl Lcg {
    pub fn new(seed: u64) -> Self {
        Self(seed.max(1))
    }

    pub fn next(&mut self, bound: u64) -> u64 {
        self.0 = self.0.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
        (self.0 >> 33) % bound.max(1)
    }
}

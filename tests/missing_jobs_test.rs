//! A node killed mid-batch: reported jobs stay finished, absentees become
//! missing, and a missing-only resubmission recovers exactly those.

mod common;

use common::{StubHpc, init_run, single_group};
use jade::cluster::{JobResult, JobStatus};
use jade::config::{Configuration, HpcConfig, JobSpec, SubmitterParams};
use jade::hpc::HpcJobStatus;
use jade::output::OutputDir;
use jade::results::prepare_resubmit;
use jade::runner::BatchResultWriter;
use jade::submit::SubmitterLoop;

#[test]
fn test_dead_node_synthesizes_missing_rows() {
    let tmp = tempfile::TempDir::new().unwrap();
    let output = tmp.path().join("run");

    let jobs: Vec<JobSpec> = (1..=5).map(|i| JobSpec::new(i, "true")).collect();
    let config = Configuration::new(
        jobs,
        single_group(SubmitterParams {
            per_node_batch_size: 10,
            max_nodes: 1,
            ..SubmitterParams::default()
        }),
    );

    let store = init_run(&output, &config);
    let hpc = StubHpc::new();
    let hpc_config = HpcConfig::default();
    let submitter = SubmitterLoop::new(&store, &config, &hpc_config, &hpc);

    submitter.run_once().unwrap();
    let state = store.read_state().unwrap();
    let hpc_id = state.active_batches[&1].hpc_job_id.clone();

    // The node completed jobs 1 and 2, then the allocation died.
    let out = OutputDir::new(&output);
    let mut writer = BatchResultWriter::create(&out.batch_results_path(1)).unwrap();
    for job_id in [1u64, 2] {
        writer
            .write(&JobResult {
                name: job_id.to_string(),
                job_id,
                return_code: 0,
                status: JobStatus::Finished,
                exec_time_s: 1.0,
                completion_time: chrono::Utc::now(),
                batch_id: 1,
                hpc_job_id: hpc_id.clone(),
                output_dir: output.clone(),
            })
            .unwrap();
    }
    drop(writer);
    hpc.set_status(&hpc_id, HpcJobStatus::Complete);

    submitter.run_once().unwrap();
    let state = store.read_state().unwrap();
    assert!(state.is_complete);

    let summary = state.summary_counts();
    assert_eq!(summary.successful, 2);
    assert_eq!(summary.missing, 3);
    for job_id in [3u64, 4, 5] {
        let row = state.result_for(job_id).unwrap();
        assert_eq!(row.status, JobStatus::Missing);
        assert_eq!(row.return_code, -1);
        assert_eq!(row.batch_id, 1);
    }

    // Resubmitting the missing subset selects exactly the absentees.
    let selected = prepare_resubmit(&store, &config, false, true).unwrap();
    assert_eq!(selected, vec![3, 4, 5]);

    let state = store.read_state().unwrap();
    assert!(!state.is_complete);
    assert!(state.is_terminal(1));
    assert!(state.is_terminal(2));

    // The next submitter pass re-batches only the recovered jobs.
    submitter.run_once().unwrap();
    let state = store.read_state().unwrap();
    let batch = state.active_batches.values().next().unwrap();
    assert_eq!(batch.job_ids, vec![3, 4, 5]);
}

#[test]
fn test_batch_lost_by_scheduler_synthesizes_missing_rows() {
    let tmp = tempfile::TempDir::new().unwrap();
    let output = tmp.path().join("run");

    let jobs: Vec<JobSpec> = (1..=3).map(|i| JobSpec::new(i, "true")).collect();
    let config = Configuration::new(
        jobs,
        single_group(SubmitterParams {
            per_node_batch_size: 10,
            max_nodes: 1,
            ..SubmitterParams::default()
        }),
    );

    let store = init_run(&output, &config);
    let hpc = StubHpc::new();
    let hpc_config = HpcConfig::default();
    let submitter = SubmitterLoop::new(&store, &config, &hpc_config, &hpc);

    submitter.run_once().unwrap();
    let state = store.read_state().unwrap();
    let hpc_id = state.active_batches[&1].hpc_job_id.clone();

    // The scheduler loses track of the allocation before any row lands.
    hpc.set_status(&hpc_id, HpcJobStatus::Unknown);

    submitter.run_once().unwrap();
    let state = store.read_state().unwrap();

    // The batch must not linger: absentees become missing and the run closes.
    assert!(state.active_batches.is_empty());
    assert!(state.is_complete);
    let summary = state.summary_counts();
    assert_eq!(summary.missing, 3);
    for job_id in 1..=3u64 {
        let row = state.result_for(job_id).unwrap();
        assert_eq!(row.status, JobStatus::Missing);
        assert_eq!(row.return_code, -1);
    }

    // The missing subset is recoverable the usual way.
    let selected = prepare_resubmit(&store, &config, false, true).unwrap();
    assert_eq!(selected, vec![1, 2, 3]);
}

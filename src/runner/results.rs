//! Per-batch result staging
//!
//! Each node streams one CSV row per completed job. Rows are flushed
//! immediately: a result must be durable before the worker moves on, because
//! the submitter treats the file as the authoritative handoff.

use std::fs::File;
use std::path::Path;

use anyhow::{Context, Result};

use crate::cluster::JobResult;

pub struct BatchResultWriter {
    writer: csv::Writer<File>,
}

impl BatchResultWriter {
    /// Create the staging file, truncating any stale leftover. The header row
    /// is emitted with the first result.
    pub fn create(path: &Path) -> Result<Self> {
        let writer = csv::Writer::from_path(path)
            .with_context(|| format!("Failed to create batch results: {}", path.display()))?;
        Ok(Self { writer })
    }

    /// Append one row and flush it to disk.
    pub fn write(&mut self, result: &JobResult) -> Result<()> {
        self.writer
            .serialize(result)
            .with_context(|| "Failed to write result row")?;
        self.writer
            .flush()
            .with_context(|| "Failed to flush result row")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::JobStatus;
    use chrono::Utc;
    use std::path::PathBuf;

    #[test]
    fn test_rows_round_trip_through_csv() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("results_batch_1.csv");

        let mut writer = BatchResultWriter::create(&path).unwrap();
        let result = JobResult {
            name: "job1".to_string(),
            job_id: 1,
            return_code: 0,
            status: JobStatus::Finished,
            exec_time_s: 2.25,
            completion_time: Utc::now(),
            batch_id: 1,
            hpc_job_id: "4242".to_string(),
            output_dir: PathBuf::from("/tmp/out"),
        };
        writer.write(&result).unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.starts_with(
            "name,job_id,return_code,status,exec_time_s,completion_time,batch_id,hpc_job_id,output_dir"
        ));

        let mut reader = csv::Reader::from_path(&path).unwrap();
        let rows: Vec<JobResult> = reader.deserialize().map(|r| r.unwrap()).collect();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].job_id, 1);
        assert_eq!(rows[0].status, JobStatus::Finished);
        assert_eq!(rows[0].exec_time_s, 2.25);
    }
}

//! Persistence boundary for finished jobs.

use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use crate::cost::CostRecord;
use crate::error::PersistError;
use crate::job::{Assessment, ExecutionResult, Job};

/// Everything known about a job once it is terminal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
    pub job: Job,
    pub execution: Option<ExecutionResult>,
    pub assessment: Option<Assessment>,
    pub cost: CostRecord,
}

#[async_trait]
pub trait ResultSink: Send + Sync {
    async fn persist(&self, record: &JobRecord) -> Result<(), PersistError>;
}

/// Keeps records in memory. Used by tests and one-shot CLI runs.
#[derive(Default)]
pub struct MemorySink {
    records: Mutex<Vec<JobRecord>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn records(&self) -> Vec<JobRecord> {
        self.records.lock().await.clone()
    }
}

#[async_trait]
impl ResultSink for MemorySink {
    async fn persist(&self, record: &JobRecord) -> Result<(), PersistError> {
        self.records.lock().await.push(record.clone());
        Ok(())
    }
}

/// Appends one JSON object per line.
pub struct JsonLinesSink {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonLinesSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &std::path::Path {
        &self.path
    }
}

#[async_trait]
impl ResultSink for JsonLinesSink {
    async fn persist(&self, record: &JobRecord) -> Result<(), PersistError> {
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');

        let _guard = self.write_lock.lock().await;
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(&line).await?;
        file.flush().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{JobRequest, Severity};
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;

    fn record() -> JobRecord {
        let job = Job::new(JobRequest {
            owner: "owner-1".to_string(),
            tool: "nmap".to_string(),
            target_description: "lab".to_string(),
            severity: Severity::High,
            attack_vectors: 2,
        });
        JobRecord {
            cost: CostRecord {
                job_id: job.id,
                committed: Decimal::ZERO,
                reserved: Decimal::ZERO,
                ceiling: dec!(0.01),
                entries: vec![],
            },
            job,
            execution: None,
            assessment: None,
        }
    }

    #[tokio::test]
    async fn test_jsonl_appends_lines() {
        let dir = tempfile::tempdir().unwrap();
        let sink = JsonLinesSink::new(dir.path().join("nested").join("results.jsonl"));

        let first = record();
        let second = record();
        sink.persist(&first).await.unwrap();
        sink.persist(&second).await.unwrap();

        let text = std::fs::read_to_string(sink.path()).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        let parsed: JobRecord = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(parsed.job.id, second.job.id);
        assert_eq!(parsed.cost.ceiling, dec!(0.01));
    }

    #[tokio::test]
    async fn test_memory_sink() {
        let sink = MemorySink::new();
        sink.persist(&record()).await.unwrap();
        assert_eq!(sink.records().await.len(), 1);
    }
}

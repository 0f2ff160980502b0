//! Persisted per-stage record of submitted task handles.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::core::{JobHandle, Stage, StageKey};
use crate::errors::Result;

const LEDGER_SUFFIX: &str = "handles.json";

/// Handles of a stage's tasks, kept as JSON next to the stage's job scripts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageLedger {
    /// Stage instance.
    pub stage: StageKey,
    /// Partition count fixed before the first task was submitted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub partition_count: Option<usize>,
    /// Recorded handles, unique by job id, in recording order.
    #[serde(default)]
    pub handles: Vec<JobHandle>,
    /// Last write.
    pub updated_at: DateTime<Utc>,
}

impl StageLedger {
    /// Creates an empty ledger.
    #[must_use]
    pub fn new(stage: StageKey) -> Self {
        Self {
            stage,
            partition_count: None,
            handles: Vec::new(),
            updated_at: Utc::now(),
        }
    }

    /// Path of the ledger file of `stage`.
    #[must_use]
    pub fn path_for(stage: &Stage) -> PathBuf {
        stage.job_dir().join(format!("{}.{LEDGER_SUFFIX}", stage.key()))
    }

    /// Loads the ledger of `stage`, or an empty one if none was written.
    pub async fn load(stage: &Stage) -> Result<Self> {
        let path = Self::path_for(stage);
        match tokio::fs::read_to_string(&path).await {
            Ok(text) => Ok(serde_json::from_str(&text)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::new(stage.key())),
            Err(e) => Err(e.into()),
        }
    }

    /// Adds a handle. Returns false if its job id was already recorded.
    pub fn record(&mut self, handle: JobHandle) -> bool {
        if self.handles.iter().any(|h| h.job_id == handle.job_id) {
            return false;
        }
        self.handles.push(handle);
        true
    }

    /// Writes the ledger to `path` through a temporary file and a rename.
    pub async fn save(&mut self, path: &Path) -> Result<()> {
        self.updated_at = Utc::now();
        if let Some(dir) = path.parent() {
            tokio::fs::create_dir_all(dir).await?;
        }
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, serde_json::to_string_pretty(self)?).await?;
        tokio::fs::rename(&tmp, path).await?;
        debug!(stage = %self.stage, handles = self.handles.len(), path = %path.display(), "Saved handle ledger");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{OutputPattern, PartitionScheme};

    fn stage(dir: &Path) -> Stage {
        Stage::new(
            "bcftools",
            "p1",
            PartitionScheme::from_ids(["1", "2"]).unwrap(),
            OutputPattern::new(dir.join("out"), "{partition}.vcf.gz", "{partition}.vcf.gz.tbi")
                .unwrap(),
            dir.join("shfiles/bcftools"),
        )
    }

    #[tokio::test]
    async fn test_missing_ledger_is_empty() {
        let tmp = tempfile::tempdir().unwrap();
        let ledger = StageLedger::load(&stage(tmp.path())).await.unwrap();
        assert!(ledger.handles.is_empty());
        assert_eq!(ledger.partition_count, None);
    }

    #[tokio::test]
    async fn test_record_dedupes_and_persists() {
        let tmp = tempfile::tempdir().unwrap();
        let stage = stage(tmp.path());
        let mut ledger = StageLedger::load(&stage).await.unwrap();
        assert!(ledger.record(JobHandle::submitted("11", "a")));
        assert!(!ledger.record(JobHandle::submitted("11", "a-again")));
        ledger.partition_count = Some(2);
        ledger.save(&StageLedger::path_for(&stage)).await.unwrap();

        let path = StageLedger::path_for(&stage);
        assert!(path.ends_with("shfiles/bcftools/p1-bcftools.handles.json"));
        assert!(!path.with_extension("json.tmp").exists());

        let back = StageLedger::load(&stage).await.unwrap();
        assert_eq!(back.handles.len(), 1);
        assert_eq!(back.handles[0].name, "a");
        assert_eq!(back.partition_count, Some(2));
    }
}

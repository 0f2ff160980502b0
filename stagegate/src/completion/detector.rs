//! Decides whether every partition of a stage has finished successfully.

use futures::future::join_all;
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use tracing::{debug, warn};

use crate::core::{JobHandle, JobId, OutputKind, PartitionId, Stage, StageKey, Task, TaskStatus};
use crate::errors::{ConfigMismatchError, IntegrityError, QueryError, Result};
use crate::scheduler::{JobFilter, JobSubmitter};

/// Outcome of one completion check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletionReport {
    /// The stage instance checked.
    pub stage: StageKey,
    /// Partitions of the fixed scheme.
    pub expected: BTreeSet<PartitionId>,
    /// Partitions with a non-empty artifact and a marker.
    pub valid: BTreeSet<PartitionId>,
    /// Siblings reported pending, running or unknown.
    pub active_siblings: Vec<JobHandle>,
    /// Siblings reported failed.
    pub failed_siblings: Vec<JobHandle>,
    /// False if outputs were missing and the scheduler was not consulted.
    pub siblings_checked: bool,
    /// One task per partition, with the recorded handle and the status last
    /// observed for it.
    pub tasks: Vec<Task>,
}

impl CompletionReport {
    /// True when every expected output is valid and no sibling is active or
    /// failed.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.siblings_checked
            && self.expected == self.valid
            && self.active_siblings.is_empty()
            && self.failed_siblings.is_empty()
    }

    /// Expected partitions without a valid output.
    #[must_use]
    pub fn missing(&self) -> Vec<&PartitionId> {
        self.expected.difference(&self.valid).collect()
    }

    /// Partitions whose recorded job was observed failed.
    #[must_use]
    pub fn failed_partitions(&self) -> Vec<&PartitionId> {
        self.tasks
            .iter()
            .filter(|t| t.status() == TaskStatus::Failed)
            .map(Task::partition)
            .collect()
    }
}

/// Sibling jobs of a stage as seen in one scheduler snapshot.
#[derive(Debug, Clone, Default)]
pub struct SiblingCensus {
    /// Siblings pending, running or unknown.
    pub active: Vec<JobHandle>,
    /// Siblings that failed.
    pub failed: Vec<JobHandle>,
    /// Partition tasks updated from the snapshot.
    pub tasks: Vec<Task>,
}

impl SiblingCensus {
    /// No sibling is active or failed.
    #[must_use]
    pub fn is_settled(&self) -> bool {
        self.active.is_empty() && self.failed.is_empty()
    }
}

/// Completion checks against the filesystem and the scheduler.
///
/// Every check is a function of the current filesystem state and one
/// scheduler snapshot; nothing is cached between calls.
pub struct CompletionDetector<'a, S: JobSubmitter + ?Sized> {
    submitter: &'a S,
    self_job: Option<JobId>,
}

impl<'a, S: JobSubmitter + ?Sized> CompletionDetector<'a, S> {
    /// Creates a detector that queries `submitter`.
    pub fn new(submitter: &'a S) -> Self {
        Self {
            submitter,
            self_job: None,
        }
    }

    /// Never counts `job` as an active sibling.
    #[must_use]
    pub fn excluding(mut self, job: Option<JobId>) -> Self {
        self.self_job = job;
        self
    }

    /// Partition ids of the fixed scheme.
    pub fn expected_partitions(&self, stage: &Stage) -> BTreeSet<PartitionId> {
        stage.scheme().ids()
    }

    /// Partitions whose artifact (non-empty) and marker both exist.
    ///
    /// Fails with an integrity error if the stage directory holds outputs of
    /// partitions outside the scheme.
    pub async fn valid_outputs(&self, stage: &Stage) -> Result<BTreeSet<PartitionId>> {
        let dir = stage.outputs().directory();
        let mut entries = match tokio::fs::read_dir(dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(BTreeSet::new()),
            Err(e) => return Err(e.into()),
        };

        let expected = self.expected_partitions(stage);
        let mut artifacts: BTreeMap<PartitionId, PathBuf> = BTreeMap::new();
        let mut markers: BTreeSet<PartitionId> = BTreeSet::new();
        let mut unexpected = Vec::new();

        while let Some(entry) = entries.next_entry().await? {
            let file_name = entry.file_name();
            let name = file_name.to_string_lossy();
            let Some((id, kind)) = stage.outputs().match_file(&name) else {
                continue;
            };
            if !expected.contains(&id) {
                unexpected.push(name.into_owned());
                continue;
            }
            match kind {
                OutputKind::Artifact => {
                    artifacts.insert(id, entry.path());
                }
                OutputKind::Marker => {
                    markers.insert(id);
                }
            }
        }

        if !unexpected.is_empty() {
            unexpected.sort();
            return Err(IntegrityError::new(stage.key().to_string(), dir, unexpected).into());
        }

        let candidates: Vec<(PartitionId, PathBuf)> = artifacts
            .into_iter()
            .filter(|(id, _)| markers.contains(id))
            .collect();
        let sizes = join_all(candidates.iter().map(|(_, path)| tokio::fs::metadata(path))).await;

        let valid = candidates
            .into_iter()
            .zip(sizes)
            .filter_map(|((id, path), meta)| match meta {
                Ok(meta) if meta.len() > 0 => Some(id),
                _ => {
                    debug!(path = %path.display(), "Ignoring empty or unreadable artifact");
                    None
                }
            })
            .collect();
        Ok(valid)
    }

    /// True if any sibling task, other than the invoking job, is pending,
    /// running or unknown.
    pub async fn siblings_still_active(
        &self,
        stage: &Stage,
        handles: &[JobHandle],
    ) -> std::result::Result<bool, QueryError> {
        Ok(!self.census(stage, handles).await?.active.is_empty())
    }

    /// The partition tasks of `stage`, each carrying its latest recorded
    /// handle.
    pub fn tracked_tasks(&self, stage: &Stage, handles: &[JobHandle]) -> Vec<Task> {
        let mut tasks = stage.tasks();
        for task in &mut tasks {
            let recorded = handles
                .iter()
                .rev()
                .find(|h| h.partition.as_ref() == Some(task.partition()));
            if let Some(handle) = recorded {
                task.mark_submitted(handle.clone());
            }
        }
        tasks
    }

    /// Queries the scheduler once and sorts the siblings of `stage` by
    /// status.
    pub async fn census(
        &self,
        stage: &Stage,
        handles: &[JobHandle],
    ) -> std::result::Result<SiblingCensus, QueryError> {
        let filter = JobFilter::new()
            .with_job_ids(handles.iter().map(|h| h.job_id.clone()))
            .with_name_fragment(stage.job_tag())
            .with_name_fragment(stage.pool())
            .excluding(self.self_job.clone());
        let snapshot = self.submitter.query(&filter).await?;

        let mut census = SiblingCensus {
            tasks: self.tracked_tasks(stage, handles),
            ..SiblingCensus::default()
        };
        for record in &snapshot {
            let status = record.status();
            let task = census
                .tasks
                .iter_mut()
                .find(|t| t.handle().is_some_and(|h| h.job_id == record.handle.job_id));
            if let Some(task) = task {
                if !task.observe(status) {
                    debug!(
                        partition = %task.partition(),
                        from = %task.status(),
                        to = %status,
                        "Ignoring out-of-order status"
                    );
                }
            }

            if status.blocks_completion() {
                census.active.push(record.handle.clone());
            } else if status == TaskStatus::Failed {
                warn!(
                    stage = %stage.key(),
                    job_id = %record.handle.job_id,
                    name = %record.handle.name,
                    "Sibling job failed"
                );
                census.failed.push(record.handle.clone());
            }
        }
        debug!(
            stage = %stage.key(),
            seen = snapshot.len(),
            active = census.active.len(),
            failed = census.failed.len(),
            "Sibling census"
        );
        Ok(census)
    }

    /// Full completion check.
    ///
    /// Fails with an invalid scheme if the stage has no partitions, with a
    /// config mismatch if the scheme disagrees with the declared count, with
    /// an integrity error on foreign outputs, and with `QueryUnknown` if the
    /// scheduler could not be queried. The scheduler is only consulted once
    /// every output is valid.
    pub async fn evaluate(&self, stage: &Stage, handles: &[JobHandle]) -> Result<CompletionReport> {
        stage.ensure_partitioned()?;
        let expected = self.expected_partitions(stage);
        if expected.len() != stage.declared_count() {
            return Err(ConfigMismatchError::new(
                stage.key().to_string(),
                stage.declared_count(),
                expected.len(),
            )
            .into());
        }

        let valid = self.valid_outputs(stage).await?;
        let mut report = CompletionReport {
            stage: stage.key(),
            expected,
            valid,
            active_siblings: Vec::new(),
            failed_siblings: Vec::new(),
            siblings_checked: false,
            tasks: Vec::new(),
        };
        if report.expected != report.valid {
            report.tasks = self.tracked_tasks(stage, handles);
            return Ok(report);
        }

        let census = self.census(stage, handles).await?;
        report.active_siblings = census.active;
        report.failed_siblings = census.failed;
        report.tasks = census.tasks;
        report.siblings_checked = true;
        Ok(report)
    }

    /// `expected == valid` and no sibling active or failed.
    pub async fn is_complete(&self, stage: &Stage, handles: &[JobHandle]) -> Result<bool> {
        Ok(self.evaluate(stage, handles).await?.is_complete())
    }
}

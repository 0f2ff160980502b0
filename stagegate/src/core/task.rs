//! Partition tasks and the scheduler handles that track them.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

use super::{PartitionId, StageKey, TaskStatus};

/// Opaque job identifier returned by the scheduler.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    /// Creates a new job id.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for JobId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for JobId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// A submitted job plus its last observed status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobHandle {
    /// Scheduler job id.
    pub job_id: JobId,
    /// Job name as known to the scheduler.
    #[serde(default)]
    pub name: String,
    /// Partition the job works on, if it is a partition task.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub partition: Option<PartitionId>,
    /// Last observed status.
    #[serde(default)]
    pub status: TaskStatus,
}

impl JobHandle {
    /// Creates a handle for a freshly submitted job.
    #[must_use]
    pub fn submitted(job_id: impl Into<JobId>, name: impl Into<String>) -> Self {
        Self {
            job_id: job_id.into(),
            name: name.into(),
            partition: None,
            status: TaskStatus::Submitted,
        }
    }

    /// Attaches the partition the job works on.
    #[must_use]
    pub fn for_partition(mut self, partition: impl Into<PartitionId>) -> Self {
        self.partition = Some(partition.into());
        self
    }

    /// Replaces the observed status.
    #[must_use]
    pub fn with_status(mut self, status: TaskStatus) -> Self {
        self.status = status;
        self
    }
}

/// One partition's unit of work within a stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Task {
    stage: StageKey,
    partition: PartitionId,
    artifact: PathBuf,
    marker: PathBuf,
    status: TaskStatus,
    handle: Option<JobHandle>,
}

impl Task {
    /// Creates a task in the `Defined` state.
    #[must_use]
    pub fn new(
        stage: StageKey,
        partition: PartitionId,
        artifact: impl Into<PathBuf>,
        marker: impl Into<PathBuf>,
    ) -> Self {
        Self {
            stage,
            partition,
            artifact: artifact.into(),
            marker: marker.into(),
            status: TaskStatus::Defined,
            handle: None,
        }
    }

    /// Stage this task belongs to.
    #[must_use]
    pub fn stage(&self) -> &StageKey {
        &self.stage
    }

    /// Partition id.
    #[must_use]
    pub fn partition(&self) -> &PartitionId {
        &self.partition
    }

    /// Primary output artifact path.
    #[must_use]
    pub fn artifact(&self) -> &Path {
        &self.artifact
    }

    /// Companion integrity-marker path.
    #[must_use]
    pub fn marker(&self) -> &Path {
        &self.marker
    }

    /// Last observed status.
    #[must_use]
    pub fn status(&self) -> TaskStatus {
        self.status
    }

    /// Scheduler handle, once submitted.
    #[must_use]
    pub fn handle(&self) -> Option<&JobHandle> {
        self.handle.as_ref()
    }

    /// Records the handle returned by the scheduler.
    pub fn mark_submitted(&mut self, handle: JobHandle) {
        self.status = TaskStatus::Submitted;
        self.handle = Some(handle);
    }

    /// Applies a status observed in a scheduler snapshot.
    ///
    /// Returns false (and leaves the task unchanged) if the observation is not
    /// a legal transition from the current status.
    pub fn observe(&mut self, status: TaskStatus) -> bool {
        if !self.status.can_transition_to(status) {
            return false;
        }
        self.status = status;
        if let Some(handle) = self.handle.as_mut() {
            handle.status = status;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task() -> Task {
        Task::new(
            StageKey::new("p1", "realign"),
            PartitionId::new("s1"),
            "/d/s1_realigned.bam",
            "/d/s1_realigned.bai",
        )
    }

    #[test]
    fn test_task_lifecycle() {
        let mut t = task();
        assert_eq!(t.status(), TaskStatus::Defined);
        assert!(!t.observe(TaskStatus::Running));

        t.mark_submitted(JobHandle::submitted("101", "p1-s1-realign").for_partition("s1"));
        assert_eq!(t.status(), TaskStatus::Submitted);
        assert!(t.observe(TaskStatus::Running));
        assert!(t.observe(TaskStatus::Completed));
        assert!(!t.observe(TaskStatus::Running));
        assert_eq!(t.handle().map(|h| h.status), Some(TaskStatus::Completed));
    }

    #[test]
    fn test_handle_serialization() {
        let handle = JobHandle::submitted("42", "p1-bcftools_bedfile_1").for_partition("1");
        let json = serde_json::to_value(&handle).unwrap();
        assert_eq!(json["job_id"], "42");
        assert_eq!(json["partition"], "1");
        assert_eq!(json["status"], "submitted");

        let back: JobHandle = serde_json::from_value(json).unwrap();
        assert_eq!(back, handle);
    }
}

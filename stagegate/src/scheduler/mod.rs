//! Interface to the external cluster scheduler.
//!
//! This module provides:
//! - The `JobSubmitter` seam (submit a descriptor, query job status)
//! - Structured job descriptors rendered to batch scripts
//! - A Slurm implementation and an in-memory implementation

mod descriptor;
mod memory;
mod slurm;

pub use descriptor::{Dependency, JobDescriptor, MailDirective, Resources};
pub use memory::InMemoryScheduler;
pub use slurm::{parse_sacct_output, parse_sbatch_output, parse_squeue_output, SlurmScheduler};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;

use crate::core::{JobHandle, JobId, TaskStatus};
use crate::errors::{QueryError, SubmissionError};

/// Selects the jobs a query reports on.
///
/// A job matches if its id is listed in `job_ids`, or if `name_contains` is
/// non-empty and the job name contains every fragment. `exclude` is never
/// reported.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobFilter {
    /// Jobs to report by id.
    pub job_ids: Vec<JobId>,
    /// Name fragments that must all appear in a job name.
    pub name_contains: Vec<String>,
    /// A job to leave out (the caller's own job).
    pub exclude: Option<JobId>,
}

impl JobFilter {
    /// Creates an empty filter.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds job ids.
    #[must_use]
    pub fn with_job_ids(mut self, ids: impl IntoIterator<Item = JobId>) -> Self {
        self.job_ids.extend(ids);
        self
    }

    /// Adds a name fragment.
    #[must_use]
    pub fn with_name_fragment(mut self, fragment: impl Into<String>) -> Self {
        self.name_contains.push(fragment.into());
        self
    }

    /// Excludes one job.
    #[must_use]
    pub fn excluding(mut self, id: Option<JobId>) -> Self {
        self.exclude = id;
        self
    }

    /// Returns true if the job belongs in the result.
    #[must_use]
    pub fn matches(&self, id: &JobId, name: &str) -> bool {
        if self.exclude.as_ref() == Some(id) {
            return false;
        }
        self.job_ids.contains(id)
            || (!self.name_contains.is_empty()
                && self.name_contains.iter().all(|f| name.contains(f.as_str())))
    }
}

/// One row of a status query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobRecord {
    /// The job with its observed status.
    pub handle: JobHandle,
}

impl JobRecord {
    /// Creates a record.
    #[must_use]
    pub fn new(job_id: impl Into<JobId>, name: impl Into<String>, status: TaskStatus) -> Self {
        Self {
            handle: JobHandle::submitted(job_id, name).with_status(status),
        }
    }

    /// Observed status.
    #[must_use]
    pub fn status(&self) -> TaskStatus {
        self.handle.status
    }
}

/// Point-in-time answer to a status query.
///
/// Iteration is finite and can be restarted; there is no cursor shared with
/// the scheduler, so every query call is independent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobSnapshot {
    records: Vec<JobRecord>,
    taken_at: DateTime<Utc>,
}

impl JobSnapshot {
    /// Creates a snapshot taken now.
    #[must_use]
    pub fn new(records: Vec<JobRecord>) -> Self {
        Self {
            records,
            taken_at: Utc::now(),
        }
    }

    /// When the snapshot was taken.
    #[must_use]
    pub fn taken_at(&self) -> DateTime<Utc> {
        self.taken_at
    }

    /// Iterates the records.
    pub fn iter(&self) -> impl Iterator<Item = &JobRecord> {
        self.records.iter()
    }

    /// Number of records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Returns true if no job matched.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Status of one job, if it was reported.
    #[must_use]
    pub fn status_of(&self, id: &JobId) -> Option<TaskStatus> {
        self.records
            .iter()
            .find(|r| &r.handle.job_id == id)
            .map(JobRecord::status)
    }
}

impl<'a> IntoIterator for &'a JobSnapshot {
    type Item = &'a JobRecord;
    type IntoIter = std::slice::Iter<'a, JobRecord>;

    fn into_iter(self) -> Self::IntoIter {
        self.records.iter()
    }
}

/// Thin interface to the external scheduler.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait JobSubmitter: Send + Sync {
    /// Submits a job and returns its handle.
    async fn submit(&self, descriptor: &JobDescriptor) -> Result<JobHandle, SubmissionError>;

    /// Reports the current status of the jobs selected by `filter`.
    async fn query(&self, filter: &JobFilter) -> Result<JobSnapshot, QueryError>;
}

#[async_trait]
impl<T: JobSubmitter + ?Sized> JobSubmitter for Arc<T> {
    async fn submit(&self, descriptor: &JobDescriptor) -> Result<JobHandle, SubmissionError> {
        (**self).submit(descriptor).await
    }

    async fn query(&self, filter: &JobFilter) -> Result<JobSnapshot, QueryError> {
        (**self).query(filter).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_by_id_and_name() {
        let filter = JobFilter::new()
            .with_job_ids([JobId::new("10")])
            .with_name_fragment("bcftools_bedfile")
            .with_name_fragment("p1")
            .excluding(Some(JobId::new("12")));

        assert!(filter.matches(&JobId::new("10"), "anything"));
        assert!(filter.matches(&JobId::new("11"), "p1-bcftools_bedfile_3"));
        assert!(!filter.matches(&JobId::new("11"), "p2-bcftools_bedfile_3"));
        assert!(!filter.matches(&JobId::new("12"), "p1-bcftools_bedfile_4"));
    }

    #[test]
    fn test_empty_name_filter_matches_only_ids() {
        let filter = JobFilter::new().with_job_ids([JobId::new("1")]);
        assert!(!filter.matches(&JobId::new("2"), "p1-x"));
    }

    #[test]
    fn test_snapshot_is_restartable() {
        let snapshot = JobSnapshot::new(vec![
            JobRecord::new("1", "a", TaskStatus::Running),
            JobRecord::new("2", "b", TaskStatus::Completed),
        ]);

        let first: Vec<_> = snapshot.iter().map(|r| r.handle.job_id.clone()).collect();
        let second: Vec<_> = (&snapshot).into_iter().map(|r| r.handle.job_id.clone()).collect();
        assert_eq!(first, second);
        assert_eq!(snapshot.status_of(&JobId::new("2")), Some(TaskStatus::Completed));
        assert_eq!(snapshot.status_of(&JobId::new("3")), None);
    }
}

//! In-memory scheduler for tests and local dry runs.

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{JobDescriptor, JobFilter, JobRecord, JobSnapshot, JobSubmitter};
use crate::core::{JobHandle, JobId, TaskStatus};
use crate::errors::{QueryError, SubmissionError};

#[derive(Debug)]
struct State {
    next_id: u64,
    jobs: Vec<JobRecord>,
    submitted: Vec<JobDescriptor>,
    failing_queries: usize,
    reject_submissions: bool,
}

/// A scheduler that keeps jobs in memory.
///
/// Submitted jobs start as `Pending`; tests move them along with
/// [`InMemoryScheduler::set_status`].
#[derive(Debug)]
pub struct InMemoryScheduler {
    state: Mutex<State>,
}

impl Default for InMemoryScheduler {
    fn default() -> Self {
        Self {
            state: Mutex::new(State {
                next_id: 1000,
                jobs: Vec::new(),
                submitted: Vec::new(),
                failing_queries: 0,
                reject_submissions: false,
            }),
        }
    }
}

impl InMemoryScheduler {
    /// Creates an empty scheduler.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a job that was submitted elsewhere.
    pub fn insert_job(&self, id: impl Into<JobId>, name: impl Into<String>, status: TaskStatus) {
        let record = JobRecord::new(id, name, status);
        let mut state = self.state.lock();
        state.jobs.retain(|r| r.handle.job_id != record.handle.job_id);
        state.jobs.push(record);
    }

    /// Changes the status of a known job. Returns false if the job is unknown.
    pub fn set_status(&self, id: &JobId, status: TaskStatus) -> bool {
        let mut state = self.state.lock();
        match state.jobs.iter_mut().find(|r| &r.handle.job_id == id) {
            Some(record) => {
                record.handle.status = status;
                true
            }
            None => false,
        }
    }

    /// Marks every known job as completed.
    pub fn complete_all(&self) {
        for record in &mut self.state.lock().jobs {
            record.handle.status = TaskStatus::Completed;
        }
    }

    /// Makes the next `n` queries fail.
    pub fn fail_next_queries(&self, n: usize) {
        self.state.lock().failing_queries = n;
    }

    /// Makes every submission fail.
    pub fn reject_submissions(&self, reject: bool) {
        self.state.lock().reject_submissions = reject;
    }

    /// Descriptors submitted so far, in order.
    #[must_use]
    pub fn submitted(&self) -> Vec<JobDescriptor> {
        self.state.lock().submitted.clone()
    }
}

#[async_trait]
impl JobSubmitter for InMemoryScheduler {
    async fn submit(&self, descriptor: &JobDescriptor) -> Result<JobHandle, SubmissionError> {
        let mut state = self.state.lock();
        if state.reject_submissions {
            return Err(SubmissionError::new(&descriptor.name, "submission rejected"));
        }

        let job_id = JobId::new(state.next_id.to_string());
        state.next_id += 1;
        state.submitted.push(descriptor.clone());
        state
            .jobs
            .push(JobRecord::new(job_id.clone(), &descriptor.name, TaskStatus::Pending));

        let mut handle = JobHandle::submitted(job_id, &descriptor.name);
        handle.partition = descriptor.partition.clone();
        Ok(handle)
    }

    async fn query(&self, filter: &JobFilter) -> Result<JobSnapshot, QueryError> {
        let mut state = self.state.lock();
        if state.failing_queries > 0 {
            state.failing_queries -= 1;
            return Err(QueryError::new("scheduler unavailable"));
        }

        let mut records: Vec<JobRecord> = state
            .jobs
            .iter()
            .filter(|r| filter.matches(&r.handle.job_id, &r.handle.name))
            .cloned()
            .collect();
        for id in &filter.job_ids {
            if filter.exclude.as_ref() != Some(id) && !records.iter().any(|r| &r.handle.job_id == id) {
                records.push(JobRecord::new(id.clone(), "", TaskStatus::Unknown));
            }
        }
        Ok(JobSnapshot::new(records))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_submit_assigns_sequential_ids() {
        let scheduler = InMemoryScheduler::new();
        let a = scheduler.submit(&JobDescriptor::new("a", "/tmp")).await.unwrap();
        let b = scheduler.submit(&JobDescriptor::new("b", "/tmp")).await.unwrap();
        assert_eq!(a.job_id.as_str(), "1000");
        assert_eq!(b.job_id.as_str(), "1001");
        assert_eq!(scheduler.submitted().len(), 2);
    }

    #[tokio::test]
    async fn test_query_reports_unknown_for_missing_ids() {
        let scheduler = InMemoryScheduler::new();
        scheduler.insert_job("1", "p1-x", TaskStatus::Running);
        let snapshot = scheduler
            .query(&JobFilter::new().with_job_ids([JobId::new("1"), JobId::new("2")]))
            .await
            .unwrap();
        assert_eq!(snapshot.status_of(&JobId::new("1")), Some(TaskStatus::Running));
        assert_eq!(snapshot.status_of(&JobId::new("2")), Some(TaskStatus::Unknown));
    }

    #[tokio::test]
    async fn test_failing_queries() {
        let scheduler = InMemoryScheduler::new();
        scheduler.fail_next_queries(1);
        assert!(scheduler.query(&JobFilter::new()).await.is_err());
        assert!(scheduler.query(&JobFilter::new()).await.is_ok());
    }

    #[tokio::test]
    async fn test_rejected_submission() {
        let scheduler = InMemoryScheduler::new();
        scheduler.reject_submissions(true);
        let err = scheduler.submit(&JobDescriptor::new("a", "/tmp")).await.unwrap_err();
        assert_eq!(err.job_name, "a");
        assert!(scheduler.submitted().is_empty());
    }
}

//! Slurm implementation of [`JobSubmitter`] via `sbatch`, `sacct` and `squeue`.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{debug, info};

use super::{JobDescriptor, JobFilter, JobRecord, JobSnapshot, JobSubmitter};
use crate::core::{JobHandle, JobId, TaskStatus};
use crate::errors::{QueryError, SubmissionError};

const SACCT_FORMAT: &str = "--format=JobID,State,JobName";
const SQUEUE_FORMAT: &str = "--format=%i|%T|%j";

/// Talks to Slurm through its command-line tools.
#[derive(Debug, Clone)]
pub struct SlurmScheduler {
    sbatch: String,
    sacct: String,
    squeue: String,
    user: Option<String>,
    query_timeout: Duration,
}

impl Default for SlurmScheduler {
    fn default() -> Self {
        Self {
            sbatch: "sbatch".to_string(),
            sacct: "sacct".to_string(),
            squeue: "squeue".to_string(),
            user: std::env::var("USER").ok(),
            query_timeout: Duration::from_secs(60),
        }
    }
}

impl SlurmScheduler {
    /// Creates a scheduler using the tools on `PATH`.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Restricts `squeue` listings to one user.
    #[must_use]
    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }

    /// Sets the timeout applied to each status command.
    #[must_use]
    pub fn with_query_timeout(mut self, query_timeout: Duration) -> Self {
        self.query_timeout = query_timeout;
        self
    }

    async fn run_query(&self, program: &str, args: &[String]) -> Result<String, QueryError> {
        debug!(program, ?args, "Running scheduler query");
        let output = timeout(self.query_timeout, Command::new(program).args(args).output())
            .await
            .map_err(|_| {
                QueryError::new(format!(
                    "{program} timed out after {:?}",
                    self.query_timeout
                ))
            })?
            .map_err(|e| QueryError::new(format!("failed to run {program}: {e}")))?;

        if !output.status.success() {
            return Err(QueryError::new(format!(
                "{program} exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[async_trait]
impl JobSubmitter for SlurmScheduler {
    async fn submit(&self, descriptor: &JobDescriptor) -> Result<JobHandle, SubmissionError> {
        let script = descriptor.script_path();
        let fail = |message: String| SubmissionError::new(&descriptor.name, message);

        tokio::fs::create_dir_all(descriptor.working_dir())
            .await
            .map_err(|e| fail(format!("cannot create {}: {e}", descriptor.working_dir().display())))?;
        tokio::fs::write(&script, descriptor.render())
            .await
            .map_err(|e| fail(format!("cannot write {}: {e}", script.display())))?;

        let output = Command::new(&self.sbatch)
            .arg("--parsable")
            .arg(&script)
            .current_dir(descriptor.working_dir())
            .output()
            .await
            .map_err(|e| fail(format!("failed to run {}: {e}", self.sbatch)))?;

        if !output.status.success() {
            return Err(fail(format!(
                "{} exited with {}: {}",
                self.sbatch,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        let job_id = parse_sbatch_output(&String::from_utf8_lossy(&output.stdout))
            .ok_or_else(|| {
                fail(format!(
                    "malformed sbatch response: {:?}",
                    String::from_utf8_lossy(&output.stdout)
                ))
            })?;

        info!(job_id = %job_id, script = %script.display(), "Submitted job");
        let mut handle = JobHandle::submitted(job_id, &descriptor.name);
        handle.partition = descriptor.partition.clone();
        Ok(handle)
    }

    async fn query(&self, filter: &JobFilter) -> Result<JobSnapshot, QueryError> {
        let mut rows: BTreeMap<JobId, JobRecord> = BTreeMap::new();

        if !filter.name_contains.is_empty() {
            let mut args = vec!["--noheader".to_string(), SQUEUE_FORMAT.to_string()];
            if let Some(user) = &self.user {
                args.push(format!("--user={user}"));
            }
            let text = self.run_query(&self.squeue, &args).await?;
            for record in parse_squeue_output(&text) {
                rows.insert(record.handle.job_id.clone(), record);
            }
        }

        if !filter.job_ids.is_empty() {
            let ids: Vec<&str> = filter.job_ids.iter().map(JobId::as_str).collect();
            let args = vec![
                "--noheader".to_string(),
                "--parsable2".to_string(),
                "--allocations".to_string(),
                SACCT_FORMAT.to_string(),
                format!("--jobs={}", ids.join(",")),
            ];
            let text = self.run_query(&self.sacct, &args).await?;
            // Accounting is authoritative for jobs that left the queue.
            for record in parse_sacct_output(&text) {
                rows.insert(record.handle.job_id.clone(), record);
            }
            for id in &filter.job_ids {
                rows.entry(id.clone())
                    .or_insert_with(|| JobRecord::new(id.clone(), "", TaskStatus::Unknown));
            }
        }

        let records = rows
            .into_values()
            .filter(|r| filter.matches(&r.handle.job_id, &r.handle.name))
            .collect();
        Ok(JobSnapshot::new(records))
    }
}

/// Extracts the job id from `sbatch --parsable` output (`id` or `id;cluster`).
#[must_use]
pub fn parse_sbatch_output(stdout: &str) -> Option<JobId> {
    let line = stdout.lines().map(str::trim).find(|l| !l.is_empty())?;
    let id = line.split(';').next()?.trim();
    if !id.is_empty() && id.chars().all(|c| c.is_ascii_digit() || c == '_') {
        Some(JobId::new(id))
    } else {
        None
    }
}

/// Parses `sacct --parsable2` rows of `JobID|State|JobName`.
#[must_use]
pub fn parse_sacct_output(stdout: &str) -> Vec<JobRecord> {
    parse_rows(stdout)
}

/// Parses `squeue` rows of `%i|%T|%j`.
#[must_use]
pub fn parse_squeue_output(stdout: &str) -> Vec<JobRecord> {
    parse_rows(stdout)
}

fn parse_rows(stdout: &str) -> Vec<JobRecord> {
    stdout
        .lines()
        .filter_map(|line| {
            let mut fields = line.trim().split('|');
            let id = fields.next()?.trim();
            let state = fields.next()?.trim();
            if id.is_empty() {
                return None;
            }
            let name = fields.next().unwrap_or_default().trim();
            Some(JobRecord::new(id, name, TaskStatus::from_scheduler_state(state)))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_parse_sbatch_output() {
        assert_eq!(parse_sbatch_output("4242\n"), Some(JobId::new("4242")));
        assert_eq!(parse_sbatch_output("4242;cedar\n"), Some(JobId::new("4242")));
        assert_eq!(parse_sbatch_output("\n  77  \n"), Some(JobId::new("77")));
        assert_eq!(parse_sbatch_output("sbatch: error: invalid partition"), None);
        assert_eq!(parse_sbatch_output(""), None);
    }

    #[test]
    fn test_parse_sacct_output() {
        let text = "\
101|COMPLETED|p1-bcftools_bedfile_1
102|RUNNING|p1-bcftools_bedfile_2
103|CANCELLED by 999|p1-bcftools_bedfile_3
";
        let records = parse_sacct_output(text);
        assert_eq!(records.len(), 3);
        assert_eq!(records[0].status(), TaskStatus::Completed);
        assert_eq!(records[0].handle.name, "p1-bcftools_bedfile_1");
        assert_eq!(records[1].status(), TaskStatus::Running);
        assert_eq!(records[2].status(), TaskStatus::Failed);
    }

    #[test]
    fn test_parse_squeue_skips_garbage() {
        let text = "\
555|PENDING|p1-s1-indelRealign
not a row

556|RUNNING|p1-s2-indelRealign
";
        let records = parse_squeue_output(text);
        let ids: Vec<&str> = records.iter().map(|r| r.handle.job_id.as_str()).collect();
        assert_eq!(ids, vec!["555", "556"]);
        assert_eq!(records[0].status(), TaskStatus::Pending);
    }

    #[tokio::test]
    async fn test_query_failure_is_query_error() {
        let scheduler = SlurmScheduler {
            sacct: "/nonexistent/stagegate-sacct".to_string(),
            ..SlurmScheduler::default()
        };
        let filter = JobFilter::new().with_job_ids([JobId::new("1")]);
        assert!(scheduler.query(&filter).await.is_err());
    }

    #[tokio::test]
    async fn test_submit_failure_is_submission_error() {
        let tmp = tempfile::tempdir().unwrap();
        let scheduler = SlurmScheduler {
            sbatch: "/nonexistent/stagegate-sbatch".to_string(),
            ..SlurmScheduler::default()
        };
        let desc = JobDescriptor::new("p1-combine-bcftools", tmp.path()).with_command("true");
        let err = scheduler.submit(&desc).await.unwrap_err();
        assert_eq!(err.job_name, "p1-combine-bcftools");
        // The script is still written for inspection.
        assert!(desc.script_path().exists());
    }
}

//! Builds the dependency chain from a finished stage to its aggregation job.

use tracing::{debug, info};

use super::StageLedger;
use crate::context::{JobTemplate, TemplateVars};
use crate::core::{JobHandle, Stage};
use crate::errors::{ConfigMismatchError, Result};
use crate::scheduler::{Dependency, JobDescriptor};

/// Records task handles per stage and turns them into `afterok` clauses.
///
/// Handles are only written by the process that fans a stage out, which
/// holds the upstream stage's reservation, so the ledger has one writer.
#[derive(Debug, Clone, Copy, Default)]
pub struct DependencyChainBuilder;

impl DependencyChainBuilder {
    /// Creates a builder.
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// Loads the ledger of `stage`.
    pub async fn load_ledger(&self, stage: &Stage) -> Result<StageLedger> {
        StageLedger::load(stage).await
    }

    /// Fixes the partition count of `stage` before any task is submitted.
    ///
    /// The scheme must not be empty, and a count already recorded must
    /// match it.
    pub async fn fix_partition_count(&self, stage: &Stage) -> Result<usize> {
        stage.ensure_partitioned()?;
        let mut ledger = self.load_ledger(stage).await?;
        let found = stage.scheme().len();
        match ledger.partition_count {
            Some(declared) if declared != found => {
                Err(ConfigMismatchError::new(stage.key().to_string(), declared, found).into())
            }
            Some(declared) => Ok(declared),
            None => {
                ledger.partition_count = Some(found);
                ledger.save(&StageLedger::path_for(stage)).await?;
                info!(stage = %stage.key(), partitions = found, "Fixed partition count");
                Ok(found)
            }
        }
    }

    /// Appends a task handle to the stage's ledger. Duplicate job ids are
    /// ignored; returns whether the handle was new.
    pub async fn record_task_handle(&self, stage: &Stage, handle: JobHandle) -> Result<bool> {
        let mut ledger = self.load_ledger(stage).await?;
        let job_id = handle.job_id.clone();
        if !ledger.record(handle) {
            debug!(stage = %stage.key(), job_id = %job_id, "Handle already recorded");
            return Ok(false);
        }
        ledger.save(&StageLedger::path_for(stage)).await?;
        Ok(true)
    }

    /// Handles recorded for `stage`, in recording order.
    pub async fn recorded_handles(&self, stage: &Stage) -> Result<Vec<JobHandle>> {
        Ok(self.load_ledger(stage).await?.handles)
    }

    /// Renders the aggregation job of `stage`, to run after every handle
    /// succeeds. Empty `handles` yield no dependency clause. Nothing is
    /// submitted.
    #[must_use]
    pub fn build_aggregation_descriptor(
        &self,
        stage: &Stage,
        handles: &[JobHandle],
        template: &JobTemplate,
        vars: &TemplateVars,
    ) -> JobDescriptor {
        let dependency = Dependency::after_ok(handles.iter().map(|h| h.job_id.clone()));
        template
            .render(stage.job_dir(), vars)
            .with_dependency(dependency)
    }
}

//! The stage-transition hook run at the tail of every task.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info, warn, Instrument};

use crate::chain::DependencyChainBuilder;
use crate::completion::{CompletionDetector, SiblingCensus};
use crate::context::{ConfigContext, JobTemplate, StageCatalog, TemplateVars, Transition};
use crate::core::{JobHandle, JobId, PartitionId, Stage, Task};
use crate::errors::{CoordinatorError, Result};
use crate::observability::stage_span;
use crate::reservation::{Acquisition, ReservationLock, DEFAULT_MAX_JITTER};
use crate::scheduler::{JobDescriptor, JobSubmitter, MailDirective};
use crate::utils::generate_uuid;

const RESERVATION_DIR: &str = "reservations";

/// Scheduler queries tried when re-checking siblings after the grant.
const REVERIFY_ATTEMPTS: u32 = 3;

/// Runtime options of one invocation.
#[derive(Debug, Clone)]
pub struct CoordinatorOptions {
    /// Id written to reservation files.
    pub owner_id: String,
    /// Scheduler job running this invocation, never counted as a sibling.
    pub self_job: Option<JobId>,
    /// Upper bound of the reservation jitter.
    pub max_jitter: Duration,
    /// Render descriptors instead of reserving and submitting.
    pub dry_run: bool,
    /// Command job scripts use to call back into the coordinator.
    pub coordinator_bin: String,
}

impl Default for CoordinatorOptions {
    fn default() -> Self {
        Self {
            owner_id: generate_uuid().to_string(),
            self_job: None,
            max_jitter: DEFAULT_MAX_JITTER,
            dry_run: false,
            coordinator_bin: "coordinator".to_string(),
        }
    }
}

impl CoordinatorOptions {
    /// Runs as scheduler job `job`, which also becomes the owner id.
    #[must_use]
    pub fn for_job(mut self, job: impl Into<JobId>) -> Self {
        let job = job.into();
        self.owner_id = job.to_string();
        self.self_job = Some(job);
        self
    }

    /// Sets the jitter bound.
    #[must_use]
    pub fn with_max_jitter(mut self, max_jitter: Duration) -> Self {
        self.max_jitter = max_jitter;
        self
    }

    /// Enables dry-run mode.
    #[must_use]
    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    /// Sets the callback command.
    #[must_use]
    pub fn with_coordinator_bin(mut self, bin: impl Into<String>) -> Self {
        self.coordinator_bin = bin.into();
        self
    }
}

/// What an invocation did. Every variant is a normal exit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Outputs are missing or siblings are still active.
    Incomplete {
        /// Expected partitions without a valid output.
        missing: usize,
        /// Siblings still pending, running or unknown.
        active: usize,
    },
    /// The scheduler could not be queried.
    NotVerified,
    /// Another task holds the reservation.
    LostRace {
        /// Owner id found in the reservation file.
        holder: Option<String>,
    },
    /// Siblings reappeared after the reservation was taken, or could not be
    /// re-checked. The reservation stays in place and must be removed by an
    /// operator.
    SiblingsRequeued {
        /// The reservation file.
        reservation: PathBuf,
    },
    /// A sibling job failed, so the stage must not advance. No reservation
    /// is taken unless the failure surfaced after the grant.
    SiblingsFailed {
        /// The failed jobs.
        failed: Vec<JobHandle>,
    },
    /// The stage is complete and has no transition.
    NothingToTrigger,
    /// Jobs were submitted.
    Submitted(Vec<JobHandle>),
    /// Jobs that would have been submitted.
    DryRun(Vec<JobDescriptor>),
}

/// Ties completion detection, reservation and submission together.
pub struct Coordinator<S: JobSubmitter> {
    ctx: ConfigContext,
    catalog: StageCatalog,
    submitter: S,
    options: CoordinatorOptions,
    chain: DependencyChainBuilder,
}

impl<S: JobSubmitter> Coordinator<S> {
    /// Creates a coordinator.
    pub fn new(
        ctx: ConfigContext,
        catalog: StageCatalog,
        submitter: S,
        options: CoordinatorOptions,
    ) -> Self {
        Self {
            ctx,
            catalog,
            submitter,
            options,
            chain: DependencyChainBuilder::new(),
        }
    }

    /// The scheduler in use.
    pub fn submitter(&self) -> &S {
        &self.submitter
    }

    /// The reservation lock of `pool`.
    #[must_use]
    pub fn reservation_lock(&self, pool: &str) -> ReservationLock {
        ReservationLock::new(self.ctx.shfiles_dir(pool).join(RESERVATION_DIR))
            .with_max_jitter(self.options.max_jitter)
    }

    /// Resolves a stage, with the partition count fixed in its ledger when
    /// one was recorded.
    pub async fn resolve_stage(&self, pool: &str, name: &str) -> Result<Stage> {
        let stage = self.catalog.resolve(&self.ctx, pool, name)?;
        Ok(match self.chain.load_ledger(&stage).await?.partition_count {
            Some(count) => stage.with_declared_count(count),
            None => stage,
        })
    }

    /// Runs the completion hook for one finished task of `stage_name`.
    pub async fn on_task_finished(&self, pool_or_sample: &str, stage_name: &str) -> Result<Outcome> {
        let pool = self.ctx.resolve_pool(pool_or_sample)?;
        let span = stage_span(&pool, stage_name);
        self.transition(&pool, stage_name).instrument(span).await
    }

    async fn transition(&self, pool: &str, stage_name: &str) -> Result<Outcome> {
        let def = self.catalog.get(stage_name)?;
        let stage = self.resolve_stage(pool, stage_name).await?;
        let handles = self.chain.recorded_handles(&stage).await?;
        let detector =
            CompletionDetector::new(&self.submitter).excluding(self.options.self_job.clone());

        let report = match detector.evaluate(&stage, &handles).await {
            Ok(report) => report,
            Err(CoordinatorError::QueryUnknown(e)) => {
                info!(error = %e, "Stage could not be verified, a later sibling will retry");
                return Ok(Outcome::NotVerified);
            }
            Err(e) => return Err(e),
        };

        if !report.failed_siblings.is_empty() {
            let partitions: Vec<&str> = report
                .failed_partitions()
                .into_iter()
                .map(PartitionId::as_str)
                .collect();
            warn!(
                failed = report.failed_siblings.len(),
                partitions = %partitions.join(","),
                "Sibling jobs failed, stage will not advance"
            );
            return Ok(Outcome::SiblingsFailed {
                failed: report.failed_siblings,
            });
        }
        if !report.is_complete() {
            info!(
                valid = report.valid.len(),
                expected = report.expected.len(),
                active = report.active_siblings.len(),
                "Stage not yet complete"
            );
            return Ok(Outcome::Incomplete {
                missing: report.missing().len(),
                active: report.active_siblings.len(),
            });
        }
        if def.on_complete == Transition::None {
            info!("Stage complete, nothing follows");
            return Ok(Outcome::NothingToTrigger);
        }
        if let Transition::Scatter { stage: next } = &def.on_complete {
            self.catalog
                .resolve(&self.ctx, pool, next)?
                .ensure_partitioned()?;
        }
        if self.options.dry_run {
            return Ok(Outcome::DryRun(self.plan(&stage, &def.on_complete, &handles)?));
        }

        let lock = self.reservation_lock(pool);
        let reservation = lock.path_for(&stage.key());
        if let Acquisition::AlreadyHeld { holder } =
            lock.try_acquire(&stage.key(), &self.options.owner_id).await?
        {
            return Ok(Outcome::LostRace { holder });
        }

        // A sibling can be requeued between the first check and the grant.
        let Some(census) = self.reverify(&detector, &stage, &handles).await else {
            info!(
                reservation = %reservation.display(),
                "Could not re-verify siblings after reservation, remove the reservation file to retry"
            );
            return Ok(Outcome::SiblingsRequeued { reservation });
        };
        if !census.failed.is_empty() {
            warn!(
                reservation = %reservation.display(),
                failed = census.failed.len(),
                "Sibling jobs failed after reservation, remove the reservation file to retry"
            );
            return Ok(Outcome::SiblingsFailed {
                failed: census.failed,
            });
        }
        if !census.active.is_empty() {
            warn!(
                reservation = %reservation.display(),
                "Siblings active again after reservation, remove the reservation file to retry"
            );
            return Ok(Outcome::SiblingsRequeued { reservation });
        }

        let (submitted, balanced_stage) = match &def.on_complete {
            Transition::Aggregate { job } => {
                let descriptor = self.aggregation_descriptor(&stage, job, &handles);
                let handle = self.submitter.submit(&descriptor).await?;
                info!(job_id = %handle.job_id, name = %handle.name, "Submitted aggregation job");
                (vec![handle], stage_name.to_string())
            }
            Transition::Scatter { stage: next } => {
                (self.scatter_stage(pool, next).await?, next.clone())
            }
            Transition::None => return Ok(Outcome::NothingToTrigger),
        };

        self.balance_queue(&balanced_stage).await;
        Ok(Outcome::Submitted(submitted))
    }

    /// Re-checks siblings after the grant, retrying failed queries. Returns
    /// `None` once every attempt failed.
    async fn reverify(
        &self,
        detector: &CompletionDetector<'_, S>,
        stage: &Stage,
        handles: &[JobHandle],
    ) -> Option<SiblingCensus> {
        for attempt in 1..=REVERIFY_ATTEMPTS {
            match detector.census(stage, handles).await {
                Ok(census) => return Some(census),
                Err(e) => {
                    info!(attempt, error = %e, "Sibling re-verify query failed");
                    if attempt < REVERIFY_ATTEMPTS {
                        tokio::time::sleep(self.options.max_jitter * attempt).await;
                    }
                }
            }
        }
        None
    }

    /// Fans out `stage_name` directly, one job per partition. Partitions that
    /// already have a recorded handle are skipped.
    pub async fn scatter(&self, pool_or_sample: &str, stage_name: &str) -> Result<Outcome> {
        let pool = self.ctx.resolve_pool(pool_or_sample)?;
        let span = stage_span(&pool, stage_name);
        self.fan_out(&pool, stage_name).instrument(span).await
    }

    async fn fan_out(&self, pool: &str, stage_name: &str) -> Result<Outcome> {
        if self.options.dry_run {
            let stage = self.catalog.resolve(&self.ctx, pool, stage_name)?;
            stage.ensure_partitioned()?;
            let descriptors = self
                .task_descriptors(&stage)?
                .into_iter()
                .map(|(_, descriptor)| descriptor)
                .collect();
            return Ok(Outcome::DryRun(descriptors));
        }
        let submitted = self.scatter_stage(pool, stage_name).await?;
        self.balance_queue(stage_name).await;
        Ok(Outcome::Submitted(submitted))
    }

    async fn scatter_stage(&self, pool: &str, stage_name: &str) -> Result<Vec<JobHandle>> {
        let stage = self.catalog.resolve(&self.ctx, pool, stage_name)?;
        self.chain.fix_partition_count(&stage).await?;

        let done: BTreeSet<PartitionId> = self
            .chain
            .recorded_handles(&stage)
            .await?
            .into_iter()
            .filter_map(|h| h.partition)
            .collect();

        let mut submitted = Vec::new();
        for (mut task, descriptor) in self.task_descriptors(&stage)? {
            if done.contains(task.partition()) {
                debug!(partition = %task.partition(), "Partition already submitted");
                continue;
            }
            let handle = self.submitter.submit(&descriptor).await?;
            self.chain.record_task_handle(&stage, handle.clone()).await?;
            task.mark_submitted(handle.clone());
            info!(
                stage = %task.stage(),
                partition = %task.partition(),
                job_id = %handle.job_id,
                "Submitted partition task"
            );
            submitted.push(handle);
        }
        Ok(submitted)
    }

    fn plan(
        &self,
        stage: &Stage,
        transition: &Transition,
        handles: &[JobHandle],
    ) -> Result<Vec<JobDescriptor>> {
        match transition {
            Transition::Aggregate { job } => {
                Ok(vec![self.aggregation_descriptor(stage, job, handles)])
            }
            Transition::Scatter { stage: next } => {
                let next = self.catalog.resolve(&self.ctx, stage.pool(), next)?;
                Ok(self
                    .task_descriptors(&next)?
                    .into_iter()
                    .map(|(_, descriptor)| descriptor)
                    .collect())
            }
            Transition::None => Ok(Vec::new()),
        }
    }

    fn base_vars(&self, stage: &Stage) -> TemplateVars {
        StageCatalog::stage_vars(&self.ctx, stage.pool(), stage.name())
            .with_path("output_dir", stage.outputs().directory())
            .with("coordinator", self.options.coordinator_bin.as_str())
    }

    fn aggregation_descriptor(
        &self,
        stage: &Stage,
        template: &JobTemplate,
        handles: &[JobHandle],
    ) -> JobDescriptor {
        let artifacts: Vec<String> = stage
            .tasks()
            .iter()
            .map(|t| t.artifact().display().to_string())
            .collect();
        let vars = self.base_vars(stage).with("artifacts", artifacts.join(" "));
        let descriptor = self
            .chain
            .build_aggregation_descriptor(stage, handles, template, &vars);
        self.with_mail(descriptor, stage.name())
    }

    fn task_descriptors(&self, stage: &Stage) -> Result<Vec<(Task, JobDescriptor)>> {
        let def = self.catalog.get(stage.name())?;
        let template = def.task.as_ref().ok_or_else(|| {
            CoordinatorError::InvalidTemplate(format!(
                "stage '{}' has no task template to scatter",
                stage.name()
            ))
        })?;

        let mut base = self.base_vars(stage);
        if let Some(upstream) = &def.upstream {
            let upstream = self.catalog.resolve(&self.ctx, stage.pool(), upstream)?;
            let inputs: Vec<String> = upstream
                .tasks()
                .iter()
                .map(|t| t.artifact().display().to_string())
                .collect();
            base.set("inputs", inputs.join(" "));
        }

        Ok(stage
            .tasks()
            .into_iter()
            .map(|task| {
                let vars = self.partition_vars(stage, &task, base.clone());
                let descriptor = template
                    .render(stage.job_dir(), &vars)
                    .with_partition(task.partition().clone())
                    .with_command(vars.render("source {bash_variables}"))
                    .with_command(vars.render("{coordinator} {parent_dir} {pool} --stage {stage}"));
                (task, self.with_mail(descriptor, stage.name()))
            })
            .collect())
    }

    fn partition_vars(&self, stage: &Stage, task: &Task, mut vars: TemplateVars) -> TemplateVars {
        let id = task.partition();
        vars.set("partition", id.as_str());
        vars.set("artifact", task.artifact().display().to_string());
        vars.set("marker", task.marker().display().to_string());
        if let Some(source) = stage.scheme().source_of(id) {
            vars.set("partition_path", source.display().to_string());
        }

        // Sample partitions also expose read-group and FASTQ metadata.
        if let Ok(rg) = self.ctx.read_group(id.as_str()) {
            vars.set("rglb", rg.rglb.as_str());
            vars.set("rgpl", rg.rgpl.as_str());
            vars.set("rgsm", rg.rgsm.as_str());
            if let Some(rgid) = &rg.rgid {
                vars.set("rgid", rgid.as_str());
            }
            if let Some(rgpu) = &rg.rgpu {
                vars.set("rgpu", rgpu.as_str());
            }
        }
        if let Ok(pairs) = self.ctx.input_pairs(stage.pool(), id.as_str()) {
            if let Some((r1, r2)) = pairs.first() {
                vars.set("r1", r1.display().to_string());
                vars.set("r2", r2.display().to_string());
            }
        }
        vars
    }

    fn with_mail(&self, descriptor: JobDescriptor, stage_name: &str) -> JobDescriptor {
        match self.ctx.email_for(stage_name) {
            Some(email) => descriptor.with_mail(MailDirective {
                user: email.address.clone(),
                mail_type: email.mail_type.clone(),
            }),
            None => descriptor,
        }
    }

    async fn balance_queue(&self, stage_name: &str) {
        let Some((program, args)) = self
            .catalog
            .queue_balancer
            .as_ref()
            .and_then(|cmd| cmd.split_first())
        else {
            return;
        };

        let status = tokio::process::Command::new(program)
            .args(args)
            .arg(stage_name)
            .arg(self.ctx.parent_dir())
            .status()
            .await;
        match status {
            Ok(status) if status.success() => debug!(program, "Queue balancer finished"),
            Ok(status) => warn!(program, %status, "Queue balancer exited unsuccessfully"),
            Err(e) => warn!(program, error = %e, "Queue balancer could not be started"),
        }
    }
}

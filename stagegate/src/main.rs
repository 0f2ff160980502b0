//! `coordinator <parentDir> <poolOrSampleId>`
//!
//! Appended to every partition job script. Exits 0 when the stage is not yet
//! complete, a sibling failed, the race was lost or the stage could not be
//! verified; exits non-zero only for fatal errors.

#![forbid(unsafe_code)]
#![cfg_attr(not(test), deny(clippy::expect_used, clippy::unwrap_used))]

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info, info_span, warn, Instrument};

use stagegate::context::{ConfigContext, StageCatalog};
use stagegate::coordinator::{Coordinator, CoordinatorOptions, Outcome};
use stagegate::errors::CoordinatorError;
use stagegate::observability::init_tracing;
use stagegate::scheduler::SlurmScheduler;

#[derive(Debug, Parser)]
#[command(name = "coordinator", version, about = "Stage transition hook for partitioned cluster jobs")]
struct Cli {
    /// Pipeline parent directory holding the config tables.
    parent_dir: PathBuf,

    /// Pool name, or a sample id resolved through the sample table.
    pool_or_sample: String,

    /// Stage whose task just finished.
    #[arg(long, env = "STAGEGATE_STAGE", default_value = "realign")]
    stage: String,

    /// Submit one job per partition of `--stage` instead of checking completion.
    #[arg(long)]
    scatter: bool,

    /// Scheduler job running this invocation.
    #[arg(long, env = "SLURM_JOB_ID")]
    job_id: Option<String>,

    /// Upper bound of the reservation jitter, in seconds.
    #[arg(long, env = "STAGEGATE_JITTER_SECS", default_value_t = 15)]
    jitter_secs: u64,

    /// Print the job scripts that would be submitted and exit.
    #[arg(long)]
    dry_run: bool,

    /// Command job scripts use to call back into the coordinator.
    #[arg(long, env = "STAGEGATE_COORDINATOR_BIN", default_value = "coordinator")]
    coordinator_bin: String,

    /// Emit logs as JSON lines.
    #[arg(long)]
    log_json: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    let span = info_span!(
        "coordinator",
        target = %cli.pool_or_sample,
        stage = %cli.stage,
        job_id = cli.job_id.as_deref().unwrap_or("-"),
    );
    match run(cli).instrument(span).await {
        Ok(outcome) => {
            report(&outcome);
            ExitCode::SUCCESS
        }
        Err(err) => match err.downcast_ref::<CoordinatorError>() {
            Some(e) if !e.is_fatal() => {
                info!(error = %e, "Nothing done");
                ExitCode::SUCCESS
            }
            Some(e) => {
                error!(error = %format!("{err:#}"), exit_code = e.exit_code(), "Coordinator failed");
                ExitCode::from(e.exit_code())
            }
            None => {
                error!(error = %format!("{err:#}"), "Coordinator failed");
                ExitCode::FAILURE
            }
        },
    }
}

async fn run(cli: Cli) -> Result<Outcome> {
    let ctx = ConfigContext::load(cli.parent_dir.clone()).with_context(|| {
        format!("loading config tables from {}", cli.parent_dir.display())
    })?;
    let catalog = StageCatalog::load(ctx.parent_dir())?;

    let mut options = CoordinatorOptions::default()
        .with_max_jitter(Duration::from_secs(cli.jitter_secs))
        .with_dry_run(cli.dry_run)
        .with_coordinator_bin(cli.coordinator_bin);
    if let Some(job) = cli.job_id {
        options = options.for_job(job);
    }

    let coordinator = Coordinator::new(ctx, catalog, SlurmScheduler::new(), options);
    let outcome = if cli.scatter {
        coordinator.scatter(&cli.pool_or_sample, &cli.stage).await?
    } else {
        coordinator
            .on_task_finished(&cli.pool_or_sample, &cli.stage)
            .await?
    };
    Ok(outcome)
}

fn report(outcome: &Outcome) {
    match outcome {
        Outcome::Incomplete { missing, active } => {
            info!(missing, active, "Stage not complete");
        }
        Outcome::NotVerified => info!("Stage not verified"),
        Outcome::LostRace { holder } => {
            info!(holder = holder.as_deref().unwrap_or("unknown"), "Another task triggered the stage");
        }
        Outcome::SiblingsRequeued { reservation } => {
            info!(reservation = %reservation.display(), "Transition held back");
        }
        Outcome::SiblingsFailed { failed } => {
            let ids: Vec<&str> = failed.iter().map(|h| h.job_id.as_str()).collect();
            warn!(count = failed.len(), job_ids = %ids.join(","), "Stage held back by failed jobs");
        }
        Outcome::NothingToTrigger => info!("Final stage complete"),
        Outcome::Submitted(handles) => {
            let ids: Vec<&str> = handles.iter().map(|h| h.job_id.as_str()).collect();
            info!(count = handles.len(), job_ids = %ids.join(","), "Submitted jobs");
        }
        Outcome::DryRun(descriptors) => {
            for descriptor in descriptors {
                println!("# {}", descriptor.script_path().display());
                println!("{}", descriptor.render());
            }
        }
    }
}

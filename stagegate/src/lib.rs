//! # Stagegate
//!
//! Fan-out/fan-in stage transitions for batch pipelines running on a cluster
//! scheduler.
//!
//! A stage is split into partitions (samples, genomic intervals), one job per
//! partition. There is no resident orchestrator: every job ends by calling
//! the coordinator, and the last job to finish triggers what comes next.
//!
//! - **Completion detection**: valid outputs on disk plus a scheduler census
//!   of sibling jobs
//! - **Reservation**: a create-exclusive file that lets exactly one finisher
//!   act
//! - **Dependency chains**: aggregation jobs submitted with an `afterok`
//!   clause over every recorded partition job
//! - **Scheduler abstraction**: Slurm in production, in-memory for tests
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use stagegate::prelude::*;
//!
//! let ctx = ConfigContext::load("/scratch/project")?;
//! let catalog = StageCatalog::load(ctx.parent_dir())?;
//! let options = CoordinatorOptions::default().for_job("4815162342");
//! let coordinator = Coordinator::new(ctx, catalog, SlurmScheduler::new(), options);
//!
//! match coordinator.on_task_finished("pool_1", "bcftools").await? {
//!     Outcome::Submitted(handles) => println!("submitted {}", handles.len()),
//!     other => println!("{other:?}"),
//! }
//! ```

#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    clippy::pedantic,
    missing_docs,
    rust_2018_idioms
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

pub mod chain;
pub mod completion;
pub mod context;
pub mod coordinator;
pub mod core;
pub mod errors;
pub mod observability;
pub mod reservation;
pub mod scheduler;
pub mod utils;

#[cfg(test)]
pub(crate) mod testing;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::chain::{DependencyChainBuilder, StageLedger};
    pub use crate::completion::{CompletionDetector, CompletionReport};
    pub use crate::context::{ConfigContext, StageCatalog, StageDefinition, TemplateVars};
    pub use crate::coordinator::{Coordinator, CoordinatorOptions, Outcome};
    pub use crate::core::{
        JobHandle, JobId, Partition, PartitionId, PartitionScheme, Stage, StageKey, Task,
        TaskStatus,
    };
    pub use crate::errors::{CoordinatorError, Result};
    pub use crate::reservation::{Acquisition, ReservationLock};
    pub use crate::scheduler::{
        InMemoryScheduler, JobDescriptor, JobFilter, JobSnapshot, JobSubmitter, SlurmScheduler,
    };
}

//! Core data model for stage coordination.
//!
//! This module contains:
//! - Partition ids and the fixed partition scheme
//! - Stages and their expected-output naming
//! - Tasks, job handles and the task status machine

mod partition;
mod stage;
mod status;
mod task;

pub use partition::{Partition, PartitionId, PartitionScheme};
pub use stage::{OutputKind, OutputPattern, Stage, StageKey, PARTITION_PLACEHOLDER};
pub use status::TaskStatus;
pub use task::{JobHandle, JobId, Task};

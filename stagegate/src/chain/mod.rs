//! Dependency chains between stages.
//!
//! This module provides:
//! - A persisted ledger of the job handles submitted for each stage
//! - Aggregation descriptors with an `afterok` clause over those handles

mod builder;
mod ledger;

pub use builder::DependencyChainBuilder;
pub use ledger::StageLedger;

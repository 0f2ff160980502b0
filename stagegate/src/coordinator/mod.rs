//! The completion hook run by every task of a stage.
//!
//! This module provides:
//! - Options for one coordinator invocation
//! - The stage transition: detect completion, reserve, submit
//! - A direct scatter entry point for starting a stage

mod runner;

pub use runner::{Coordinator, CoordinatorOptions, Outcome};

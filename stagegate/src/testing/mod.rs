//! Test utilities.
//!
//! This module provides:
//! - Temporary pipeline directories with config tables and stage outputs

mod fixtures;

pub use fixtures::PoolFixture;

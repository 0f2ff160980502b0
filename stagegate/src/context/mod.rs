//! Static pipeline configuration.
//!
//! This module provides:
//! - The read-only `ConfigContext` of pool, sample and reference tables
//! - The `StageCatalog` describing partitioning, outputs and transitions
//! - `{placeholder}` templates for job names and commands

mod catalog;
mod config;
mod template;

pub use catalog::{
    interval_dir, JobTemplate, PartitionSource, StageCatalog, StageDefinition, Transition,
    STAGE_CATALOG_FILE,
};
pub use config::{
    ConfigContext, EmailConfig, ReadGroup, BASH_VARIABLES, EMAIL_TABLE, INPUT_PAIRS_TABLE,
    POOL_REFERENCE_TABLE, POOL_SAMPLES_TABLE, READ_GROUP_TABLE, SAMPLE_POOL_TABLE,
};
pub use template::TemplateVars;

//! Stage definitions resolved for one pool.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

use super::{PartitionId, PartitionScheme, Task};
use crate::errors::{CoordinatorError, InvalidSchemeError, Result};

/// Placeholder that marks the partition id inside an output template.
pub const PARTITION_PLACEHOLDER: &str = "{partition}";

/// Key of one stage instance: `<pool>-<stage>`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StageKey(String);

impl StageKey {
    /// Builds the key of `stage` within `pool`.
    #[must_use]
    pub fn new(pool: &str, stage: &str) -> Self {
        Self(format!("{pool}-{stage}"))
    }

    /// Returns the key as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Which file of a partition's output pair a name refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputKind {
    /// The primary artifact.
    Artifact,
    /// The companion index/integrity marker.
    Marker,
}

/// Expected-output naming of a stage: artifact and marker templates that
/// embed the partition id, under one stage directory.
#[derive(Debug, Clone)]
pub struct OutputPattern {
    directory: PathBuf,
    artifact: String,
    marker: String,
    artifact_re: Regex,
    marker_re: Regex,
}

impl OutputPattern {
    /// Creates a pattern. Both templates must contain `{partition}` exactly once.
    pub fn new(
        directory: impl Into<PathBuf>,
        artifact: impl Into<String>,
        marker: impl Into<String>,
    ) -> Result<Self> {
        let artifact = artifact.into();
        let marker = marker.into();
        let artifact_re = compile_template(&artifact)?;
        let marker_re = compile_template(&marker)?;

        Ok(Self {
            directory: directory.into(),
            artifact,
            marker,
            artifact_re,
            marker_re,
        })
    }

    /// The stage output directory.
    #[must_use]
    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// Path of the artifact for `id`.
    #[must_use]
    pub fn artifact_path(&self, id: &PartitionId) -> PathBuf {
        self.directory
            .join(self.artifact.replace(PARTITION_PLACEHOLDER, id.as_str()))
    }

    /// Path of the marker for `id`.
    #[must_use]
    pub fn marker_path(&self, id: &PartitionId) -> PathBuf {
        self.directory
            .join(self.marker.replace(PARTITION_PLACEHOLDER, id.as_str()))
    }

    /// Recognizes a file name as an artifact or marker and extracts its partition.
    #[must_use]
    pub fn match_file(&self, file_name: &str) -> Option<(PartitionId, OutputKind)> {
        if let Some(caps) = self.artifact_re.captures(file_name) {
            return Some((PartitionId::new(&caps["partition"]), OutputKind::Artifact));
        }
        self.marker_re
            .captures(file_name)
            .map(|caps| (PartitionId::new(&caps["partition"]), OutputKind::Marker))
    }
}

fn compile_template(template: &str) -> Result<Regex> {
    let mut parts = template.split(PARTITION_PLACEHOLDER);
    let (Some(prefix), Some(suffix), None) = (parts.next(), parts.next(), parts.next()) else {
        return Err(CoordinatorError::InvalidTemplate(format!(
            "output template '{template}' must contain {PARTITION_PLACEHOLDER} exactly once"
        )));
    };
    let pattern = format!(
        "^{}(?P<partition>.+?){}$",
        regex::escape(prefix),
        regex::escape(suffix)
    );
    Regex::new(&pattern).map_err(|e| CoordinatorError::InvalidTemplate(e.to_string()))
}

/// One phase of the pipeline for one pool, fanned out over a fixed scheme.
#[derive(Debug, Clone)]
pub struct Stage {
    name: String,
    pool: String,
    scheme: PartitionScheme,
    declared_count: usize,
    outputs: OutputPattern,
    job_dir: PathBuf,
    job_tag: String,
}

impl Stage {
    /// Creates a stage whose declared count is the scheme size.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        pool: impl Into<String>,
        scheme: PartitionScheme,
        outputs: OutputPattern,
        job_dir: impl Into<PathBuf>,
    ) -> Self {
        let name = name.into();
        Self {
            job_tag: name.clone(),
            name,
            pool: pool.into(),
            declared_count: scheme.len(),
            scheme,
            outputs,
            job_dir: job_dir.into(),
        }
    }

    /// Overrides the partition count fixed at definition time.
    #[must_use]
    pub fn with_declared_count(mut self, count: usize) -> Self {
        self.declared_count = count;
        self
    }

    /// Sets the job-name fragment shared by this stage's tasks.
    #[must_use]
    pub fn with_job_tag(mut self, tag: impl Into<String>) -> Self {
        self.job_tag = tag.into();
        self
    }

    /// Stage name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Pool this stage instance belongs to.
    #[must_use]
    pub fn pool(&self) -> &str {
        &self.pool
    }

    /// Key of this stage instance.
    #[must_use]
    pub fn key(&self) -> StageKey {
        StageKey::new(&self.pool, &self.name)
    }

    /// The fixed partition scheme.
    #[must_use]
    pub fn scheme(&self) -> &PartitionScheme {
        &self.scheme
    }

    /// Fails if the scheme has no partitions.
    pub fn ensure_partitioned(&self) -> std::result::Result<(), InvalidSchemeError> {
        if self.scheme.is_empty() {
            return Err(InvalidSchemeError::new(
                self.key().to_string(),
                "stage has no partitions",
            ));
        }
        Ok(())
    }

    /// Partition count fixed at definition time.
    #[must_use]
    pub fn declared_count(&self) -> usize {
        self.declared_count
    }

    /// Expected-output naming.
    #[must_use]
    pub fn outputs(&self) -> &OutputPattern {
        &self.outputs
    }

    /// Directory holding this stage's job scripts and handle ledger.
    #[must_use]
    pub fn job_dir(&self) -> &Path {
        &self.job_dir
    }

    /// Job-name fragment used to find sibling jobs in the scheduler.
    #[must_use]
    pub fn job_tag(&self) -> &str {
        &self.job_tag
    }

    /// One task per partition, in scheme order.
    #[must_use]
    pub fn tasks(&self) -> Vec<Task> {
        self.scheme
            .iter()
            .map(|p| {
                Task::new(
                    self.key(),
                    p.id.clone(),
                    self.outputs.artifact_path(&p.id),
                    self.outputs.marker_path(&p.id),
                )
            })
            .collect()
    }
}

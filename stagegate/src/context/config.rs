//! Read-only pipeline metadata produced by upstream stages.
//!
//! The context is loaded once from JSON tables in the pipeline's parent
//! directory and handed to every component by reference. Nothing in this
//! crate writes these tables.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::errors::{ConfigLookupError, Result};

/// sample -> pool
pub const SAMPLE_POOL_TABLE: &str = "samp2pool.json";
/// pool -> reference fasta
pub const POOL_REFERENCE_TABLE: &str = "poolref.json";
/// pool -> samples
pub const POOL_SAMPLES_TABLE: &str = "poolsamps.json";
/// sample -> read-group metadata
pub const READ_GROUP_TABLE: &str = "rginfo.json";
/// sample -> (R1, R2) pairs, stored per pool
pub const INPUT_PAIRS_TABLE: &str = "samp2_r1r2out.json";
/// optional e-mail notification settings
pub const EMAIL_TABLE: &str = "email.json";
/// shell file sourced by job scripts before calling back into the coordinator
pub const BASH_VARIABLES: &str = "bash_variables";

/// Read-group metadata of one sample.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadGroup {
    /// Library.
    pub rglb: String,
    /// Platform.
    pub rgpl: String,
    /// Sample name.
    pub rgsm: String,
    /// Read-group id; derived from the FASTQ header when absent.
    #[serde(default)]
    pub rgid: Option<String>,
    /// Platform unit; derived from the id when absent.
    #[serde(default)]
    pub rgpu: Option<String>,
}

/// E-mail notification settings for job scripts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmailConfig {
    /// Recipient.
    pub address: String,
    /// Slurm `--mail-type` value.
    #[serde(default = "default_mail_type")]
    pub mail_type: String,
    /// Stages whose jobs notify; empty means every stage.
    #[serde(default)]
    pub stages: Vec<String>,
}

fn default_mail_type() -> String {
    "FAIL".to_string()
}

impl EmailConfig {
    /// Returns true if jobs of `stage` should send mail.
    #[must_use]
    pub fn applies_to(&self, stage: &str) -> bool {
        self.stages.is_empty() || self.stages.iter().any(|s| s == stage)
    }
}

/// Immutable lookup of static pipeline metadata.
#[derive(Debug, Clone, Default)]
pub struct ConfigContext {
    parent_dir: PathBuf,
    sample_pools: BTreeMap<String, String>,
    pool_references: BTreeMap<String, PathBuf>,
    pool_samples: BTreeMap<String, Vec<String>>,
    read_groups: BTreeMap<String, ReadGroup>,
    email: Option<EmailConfig>,
}

impl ConfigContext {
    /// Creates an empty context rooted at `parent_dir`.
    #[must_use]
    pub fn new(parent_dir: impl Into<PathBuf>) -> Self {
        Self {
            parent_dir: parent_dir.into(),
            ..Self::default()
        }
    }

    /// Loads every table found under `parent_dir`. Missing tables load as
    /// empty; lookups against them fail with [`ConfigLookupError`].
    pub fn load(parent_dir: impl Into<PathBuf>) -> Result<Self> {
        let parent_dir = parent_dir.into();
        let ctx = Self {
            sample_pools: read_table(&parent_dir.join(SAMPLE_POOL_TABLE))?.unwrap_or_default(),
            pool_references: read_table(&parent_dir.join(POOL_REFERENCE_TABLE))?
                .unwrap_or_default(),
            pool_samples: read_table(&parent_dir.join(POOL_SAMPLES_TABLE))?.unwrap_or_default(),
            read_groups: read_table(&parent_dir.join(READ_GROUP_TABLE))?.unwrap_or_default(),
            email: read_table(&parent_dir.join(EMAIL_TABLE))?,
            parent_dir,
        };
        debug!(
            parent_dir = %ctx.parent_dir.display(),
            pools = ctx.pool_samples.len(),
            samples = ctx.sample_pools.len(),
            "Loaded config context"
        );
        Ok(ctx)
    }

    /// Adds a pool with its reference and samples.
    #[must_use]
    pub fn with_pool(
        mut self,
        pool: impl Into<String>,
        reference: impl Into<PathBuf>,
        samples: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        let pool = pool.into();
        let samples: Vec<String> = samples.into_iter().map(Into::into).collect();
        for sample in &samples {
            self.sample_pools.insert(sample.clone(), pool.clone());
        }
        self.pool_references.insert(pool.clone(), reference.into());
        self.pool_samples.insert(pool, samples);
        self
    }

    /// Adds read-group metadata for a sample.
    #[must_use]
    pub fn with_read_group(mut self, sample: impl Into<String>, rg: ReadGroup) -> Self {
        self.read_groups.insert(sample.into(), rg);
        self
    }

    /// Sets the e-mail settings.
    #[must_use]
    pub fn with_email(mut self, email: EmailConfig) -> Self {
        self.email = Some(email);
        self
    }

    /// The pipeline parent directory.
    #[must_use]
    pub fn parent_dir(&self) -> &Path {
        &self.parent_dir
    }

    /// Directory of one pool.
    #[must_use]
    pub fn pool_dir(&self, pool: &str) -> PathBuf {
        self.parent_dir.join(pool)
    }

    /// Job-script root of one pool.
    #[must_use]
    pub fn shfiles_dir(&self, pool: &str) -> PathBuf {
        self.pool_dir(pool).join("shfiles")
    }

    /// Shell variables file sourced by job scripts.
    #[must_use]
    pub fn bash_variables(&self) -> PathBuf {
        self.parent_dir.join(BASH_VARIABLES)
    }

    /// Pool a sample belongs to.
    pub fn pool_of(&self, sample: &str) -> Result<&str> {
        self.sample_pools
            .get(sample)
            .map(String::as_str)
            .ok_or_else(|| ConfigLookupError::new(SAMPLE_POOL_TABLE, sample).into())
    }

    /// Resolves a CLI id that names either a pool or a sample.
    pub fn resolve_pool(&self, pool_or_sample: &str) -> Result<String> {
        if self.pool_samples.contains_key(pool_or_sample) {
            return Ok(pool_or_sample.to_string());
        }
        self.pool_of(pool_or_sample).map(str::to_string)
    }

    /// Reference fasta of a pool.
    pub fn reference(&self, pool: &str) -> Result<&Path> {
        self.pool_references
            .get(pool)
            .map(PathBuf::as_path)
            .ok_or_else(|| ConfigLookupError::new(POOL_REFERENCE_TABLE, pool).into())
    }

    /// Samples of a pool, in table order.
    pub fn samples(&self, pool: &str) -> Result<&[String]> {
        self.pool_samples
            .get(pool)
            .map(Vec::as_slice)
            .ok_or_else(|| ConfigLookupError::new(POOL_SAMPLES_TABLE, pool).into())
    }

    /// Read-group metadata of a sample.
    pub fn read_group(&self, sample: &str) -> Result<&ReadGroup> {
        self.read_groups
            .get(sample)
            .ok_or_else(|| ConfigLookupError::new(READ_GROUP_TABLE, sample).into())
    }

    /// Trimmed (R1, R2) input pairs of a sample, from the pool's own table.
    pub fn input_pairs(&self, pool: &str, sample: &str) -> Result<Vec<(PathBuf, PathBuf)>> {
        let path = self.pool_dir(pool).join(INPUT_PAIRS_TABLE);
        let table: BTreeMap<String, Vec<(PathBuf, PathBuf)>> =
            read_table(&path)?.unwrap_or_default();
        table
            .get(sample)
            .cloned()
            .ok_or_else(|| ConfigLookupError::new(path.display().to_string(), sample).into())
    }

    /// E-mail settings for jobs of `stage`, if any.
    #[must_use]
    pub fn email_for(&self, stage: &str) -> Option<&EmailConfig> {
        self.email.as_ref().filter(|e| e.applies_to(stage))
    }
}

fn read_table<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    match std::fs::read_to_string(path) {
        Ok(text) => Ok(Some(serde_json::from_str(&text)?)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

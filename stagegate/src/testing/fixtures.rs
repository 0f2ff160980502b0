//! On-disk pipeline layouts for tests.

use std::path::{Path, PathBuf};
use tempfile::TempDir;

use crate::context::{
    ConfigContext, EmailConfig, POOL_REFERENCE_TABLE, POOL_SAMPLES_TABLE, SAMPLE_POOL_TABLE,
};

/// A parent directory holding one pool with its config tables, a reference
/// and one interval file per interval id.
pub struct PoolFixture {
    dir: TempDir,
    pool: String,
    samples: Vec<String>,
    intervals: Vec<String>,
}

impl PoolFixture {
    /// Creates pool `p1` with the given samples and intervals.
    pub fn new(samples: &[&str], intervals: &[&str]) -> Self {
        let fixture = Self {
            dir: tempfile::tempdir().unwrap(),
            pool: "p1".to_string(),
            samples: samples.iter().map(ToString::to_string).collect(),
            intervals: intervals.iter().map(ToString::to_string).collect(),
        };
        fixture.write_tables();
        fixture.write_reference();
        fixture
    }

    fn write_tables(&self) {
        let root = self.parent();
        let samp2pool: serde_json::Map<String, serde_json::Value> = self
            .samples
            .iter()
            .map(|s| (s.clone(), serde_json::Value::from(self.pool.as_str())))
            .collect();
        write_json(root, SAMPLE_POOL_TABLE, &serde_json::Value::Object(samp2pool));
        let mut poolref = serde_json::Map::new();
        poolref.insert(
            self.pool.clone(),
            serde_json::Value::from(self.reference().display().to_string()),
        );
        write_json(root, POOL_REFERENCE_TABLE, &serde_json::Value::Object(poolref));
        let mut poolsamps = serde_json::Map::new();
        poolsamps.insert(self.pool.clone(), serde_json::Value::from(self.samples.clone()));
        write_json(root, POOL_SAMPLES_TABLE, &serde_json::Value::Object(poolsamps));
    }

    fn write_reference(&self) {
        let reference = self.reference();
        let beds = reference.parent().unwrap().join("bedfiles_ref");
        std::fs::create_dir_all(&beds).unwrap();
        std::fs::write(&reference, ">chr1\nACGT\n").unwrap();
        for id in &self.intervals {
            std::fs::write(beds.join(format!("ref_bedfile_{id}.bed")), "chr1\t0\t4\n").unwrap();
        }
    }

    /// The parent directory.
    pub fn parent(&self) -> &Path {
        self.dir.path()
    }

    /// The pool directory.
    pub fn pool_dir(&self) -> PathBuf {
        self.parent().join(&self.pool)
    }

    /// The reference fasta.
    pub fn reference(&self) -> PathBuf {
        self.parent().join("refs").join("ref.fasta")
    }

    /// Loads the config context from disk.
    pub fn ctx(&self) -> ConfigContext {
        ConfigContext::load(self.parent()).unwrap()
    }

    /// Loads the config context with e-mail notification for `stages`.
    pub fn ctx_with_email(&self, stages: &[&str]) -> ConfigContext {
        self.ctx().with_email(EmailConfig {
            address: "lab@example.org".to_string(),
            mail_type: "FAIL".to_string(),
            stages: stages.iter().map(ToString::to_string).collect(),
        })
    }

    /// Writes the realigned BAM and index of a sample.
    pub fn write_realigned(&self, sample: &str) {
        let dir = self.pool_dir().join("04_realign");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join(format!("{sample}_realigned.bam")), "BAM").unwrap();
        std::fs::write(dir.join(format!("{sample}_realigned.bai")), "BAI").unwrap();
    }

    /// Writes the called VCF and index of an interval.
    pub fn write_called(&self, interval: &str) {
        std::fs::create_dir_all(self.pool_dir().join("bcftools")).unwrap();
        std::fs::write(self.called_vcf(interval), "VCF").unwrap();
        std::fs::write(self.called_index(interval), "TBI").unwrap();
    }

    /// Path of the called VCF of an interval.
    pub fn called_vcf(&self, interval: &str) -> PathBuf {
        self.pool_dir()
            .join("bcftools")
            .join(format!("{}_bcftools_bedfile_{interval}.vcf.gz", self.pool))
    }

    /// Path of the index of an interval's VCF.
    pub fn called_index(&self, interval: &str) -> PathBuf {
        self.pool_dir()
            .join("bcftools")
            .join(format!("{}_bcftools_bedfile_{interval}.vcf.gz.tbi", self.pool))
    }
}

fn write_json(dir: &Path, name: &str, value: &serde_json::Value) {
    std::fs::write(dir.join(name), serde_json::to_string_pretty(value).unwrap()).unwrap();
}

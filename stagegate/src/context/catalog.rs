//! Stage catalog: how each stage is partitioned, where its outputs land and
//! what fires when it completes.
//!
//! The catalog is read from `stages.json` in the parent directory when that
//! file exists. Otherwise the built-in realign -> bcftools -> combine chain
//! is used.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::debug;

use super::{ConfigContext, TemplateVars};
use crate::core::{OutputPattern, Partition, PartitionId, PartitionScheme, Stage};
use crate::errors::{CoordinatorError, InvalidSchemeError, Result};
use crate::scheduler::{JobDescriptor, Resources};

/// File name of an optional catalog override.
pub const STAGE_CATALOG_FILE: &str = "stages.json";

/// Where a stage's partition scheme comes from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum PartitionSource {
    /// One partition per sample of the pool.
    PoolSamples,
    /// One partition per interval file next to the pool's reference, in
    /// `<ref dir>/bedfiles_<ref stem>/`. The id is the token after the last
    /// `_` of the file name.
    Intervals {
        /// File suffix of interval files.
        #[serde(default = "default_interval_suffix")]
        suffix: String,
    },
    /// A fixed list of ids.
    Explicit {
        /// The partition ids.
        ids: Vec<String>,
    },
}

fn default_interval_suffix() -> String {
    ".bed".to_string()
}

impl PartitionSource {
    /// Builds the partition scheme of `pool`.
    ///
    /// Fails if two samples or two interval files map to the same id.
    pub fn scheme(&self, ctx: &ConfigContext, pool: &str) -> Result<PartitionScheme> {
        match self {
            Self::PoolSamples => {
                PartitionScheme::from_ids(ctx.samples(pool)?.iter().map(String::as_str))
                    .map_err(|id| duplicate(pool, &id, "sample listed twice"))
            }
            Self::Intervals { suffix } => {
                let dir = interval_dir(ctx.reference(pool)?);
                let mut files: Vec<PathBuf> = std::fs::read_dir(&dir)?
                    .filter_map(|entry| entry.ok().map(|e| e.path()))
                    .filter(|p| {
                        p.file_name()
                            .and_then(|n| n.to_str())
                            .is_some_and(|n| n.ends_with(suffix.as_str()))
                    })
                    .collect();
                files.sort();
                debug!(dir = %dir.display(), count = files.len(), "Found interval files");

                let mut by_id: BTreeMap<String, &Path> = BTreeMap::new();
                let mut partitions = Vec::with_capacity(files.len());
                for path in &files {
                    let Some(id) = interval_id(path, suffix) else {
                        continue;
                    };
                    if let Some(first) = by_id.insert(id.clone(), path) {
                        return Err(InvalidSchemeError::new(
                            dir.display().to_string(),
                            format!(
                                "interval id '{id}' is named by both {} and {}",
                                file_label(first),
                                file_label(path)
                            ),
                        )
                        .into());
                    }
                    partitions.push(Partition::with_source(id, path.clone()));
                }
                PartitionScheme::new(partitions)
                    .map_err(|id| duplicate(&dir.display().to_string(), &id, "interval listed twice"))
            }
            Self::Explicit { ids } => PartitionScheme::from_ids(ids.iter().map(String::as_str))
                .map_err(|id| duplicate(pool, &id, "id listed twice")),
        }
    }
}

fn duplicate(scope: &str, id: &PartitionId, what: &str) -> CoordinatorError {
    InvalidSchemeError::new(scope, format!("{what}: '{id}'")).into()
}

fn file_label(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Directory of interval files for a reference: `<dir>/bedfiles_<stem>`,
/// where the stem is the file name up to the first `.fa`.
#[must_use]
pub fn interval_dir(reference: &Path) -> PathBuf {
    let name = reference
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let stem = name.split(".fa").next().unwrap_or_default();
    reference
        .parent()
        .unwrap_or_else(|| Path::new(""))
        .join(format!("bedfiles_{stem}"))
}

fn interval_id(path: &Path, suffix: &str) -> Option<String> {
    let name = path.file_name()?.to_str()?;
    let base = name.strip_suffix(suffix)?;
    let id = base.rsplit('_').next()?;
    (!id.is_empty()).then(|| id.to_string())
}

/// Job name, resources and commands, with `{placeholder}` templates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobTemplate {
    /// Job name template.
    pub name: String,
    /// Resource request.
    #[serde(default)]
    pub resources: Resources,
    /// Command templates, run in order.
    #[serde(default)]
    pub commands: Vec<String>,
}

impl JobTemplate {
    /// Creates a template with default resources.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            resources: Resources::default(),
            commands: Vec::new(),
        }
    }

    /// Sets the resource request.
    #[must_use]
    pub fn with_resources(mut self, resources: Resources) -> Self {
        self.resources = resources;
        self
    }

    /// Appends a command template.
    #[must_use]
    pub fn with_command(mut self, command: impl Into<String>) -> Self {
        self.commands.push(command.into());
        self
    }

    /// Renders a descriptor submitted from `working_dir`.
    #[must_use]
    pub fn render(&self, working_dir: &Path, vars: &TemplateVars) -> JobDescriptor {
        self.commands.iter().fold(
            JobDescriptor::new(vars.render(&self.name), working_dir)
                .with_resources(self.resources.clone()),
            |desc, command| desc.with_command(vars.render(command)),
        )
    }
}

/// What happens once every partition of a stage has completed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Transition {
    /// Submit one job that depends on every task of the completed stage.
    Aggregate {
        /// The aggregation job.
        job: JobTemplate,
    },
    /// Fan out the named stage, one job per partition.
    Scatter {
        /// The stage to fan out.
        stage: String,
    },
    /// Nothing follows this stage.
    #[default]
    None,
}

/// Static definition of one stage, resolved per pool by [`StageCatalog::resolve`].
///
/// Directory and file templates may use `{pool}`, `{stage}`, `{parent_dir}`
/// and `{pool_dir}`; artifact and marker templates must also contain
/// `{partition}` exactly once. Relative directories are taken from the pool
/// directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageDefinition {
    /// Stage name.
    pub name: String,
    /// Partition source.
    pub partitions: PartitionSource,
    /// Partition count fixed ahead of time. Defaults to the scheme size.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub declared_count: Option<usize>,
    /// Output directory.
    pub output_dir: String,
    /// Artifact file name template.
    pub artifact: String,
    /// Marker file name template.
    pub marker: String,
    /// Directory of job scripts, the handle ledger and scheduler logs.
    #[serde(default = "default_job_dir")]
    pub job_dir: String,
    /// Job-name fragment of the stage's tasks. Defaults to the stage name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_tag: Option<String>,
    /// Stage whose artifacts are this stage's inputs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upstream: Option<String>,
    /// Per-partition job, for stages this crate fans out.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task: Option<JobTemplate>,
    /// Transition fired on completion.
    #[serde(default)]
    pub on_complete: Transition,
}

fn default_job_dir() -> String {
    "shfiles/{stage}".to_string()
}

/// The ordered set of stage definitions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageCatalog {
    /// Command run after submissions as `<cmd...> <stage> <parent_dir>`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queue_balancer: Option<Vec<String>>,
    /// Stage definitions.
    pub stages: Vec<StageDefinition>,
}

impl StageCatalog {
    /// Loads `stages.json` from `parent_dir`, or the built-in catalog if absent.
    pub fn load(parent_dir: &Path) -> Result<Self> {
        let path = parent_dir.join(STAGE_CATALOG_FILE);
        match std::fs::read_to_string(&path) {
            Ok(text) => {
                let catalog: Self = serde_json::from_str(&text)?;
                debug!(path = %path.display(), stages = catalog.stages.len(), "Loaded stage catalog");
                Ok(catalog)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::builtin()),
            Err(e) => Err(e.into()),
        }
    }

    /// The realign -> bcftools -> combine chain.
    #[must_use]
    pub fn builtin() -> Self {
        let realign = StageDefinition {
            name: "realign".to_string(),
            partitions: PartitionSource::PoolSamples,
            declared_count: None,
            output_dir: "04_realign".to_string(),
            artifact: "{partition}_realigned.bam".to_string(),
            marker: "{partition}_realigned.bai".to_string(),
            job_dir: "shfiles/05_indelRealign_shfiles".to_string(),
            job_tag: Some("indelRealign".to_string()),
            upstream: None,
            task: None,
            on_complete: Transition::Scatter {
                stage: "bcftools".to_string(),
            },
        };

        let call = JobTemplate::new("{pool}-bcftools_bedfile_{partition}")
            .with_resources(Resources::new("7-00:00:00", "2000M"))
            .with_command("mkdir -p {output_dir}")
            .with_command(
                "for bam in {inputs}; do samtools view -b -L {partition_path} \"$bam\" \
                 > \"$SLURM_TMPDIR/$(basename \"$bam\" .bam)_{partition}.bam\"; done",
            )
            .with_command(
                "bcftools mpileup --min-MQ 30 --min-BQ 20 -B -f {ref} -a \"DP,AD\" \
                 $SLURM_TMPDIR/*_{partition}.bam | bcftools call -G - -Ov -mv -f GQ,GP \
                 > $SLURM_TMPDIR/{pool}_bcftools_bedfile_{partition}.vcf",
            )
            .with_command(
                "bcftools filter -i 'FORMAT/DP>=5 & MQ>=30 & FORMAT/GQ >=20 & AC >=5 & F_MISSING <0.25' \
                 -Oz -o {artifact} $SLURM_TMPDIR/{pool}_bcftools_bedfile_{partition}.vcf",
            )
            .with_command("bcftools index --tbi {artifact}");

        let combine = JobTemplate::new("{pool}-combine-bcftools")
            .with_resources(
                Resources::new("12:00:00", "20000M")
                    .with_nodes(1)
                    .with_cpus_per_task(48),
            )
            .with_command(
                "bcftools concat {artifacts} -O z -o {output_dir}/{pool}-bcftools_all_bedfiles.vcf.gz --threads 48",
            );

        let bcftools = StageDefinition {
            name: "bcftools".to_string(),
            partitions: PartitionSource::Intervals {
                suffix: default_interval_suffix(),
            },
            declared_count: None,
            output_dir: "bcftools".to_string(),
            artifact: "{pool}_bcftools_bedfile_{partition}.vcf.gz".to_string(),
            marker: "{pool}_bcftools_bedfile_{partition}.vcf.gz.tbi".to_string(),
            job_dir: "shfiles/bcftools".to_string(),
            job_tag: Some("bcftools_bedfile".to_string()),
            upstream: Some("realign".to_string()),
            task: Some(call),
            on_complete: Transition::Aggregate { job: combine },
        };

        Self {
            queue_balancer: None,
            stages: vec![realign, bcftools],
        }
    }

    /// Looks up a stage definition by name.
    pub fn get(&self, name: &str) -> Result<&StageDefinition> {
        self.stages
            .iter()
            .find(|s| s.name == name)
            .ok_or_else(|| CoordinatorError::UnknownStage(name.to_string()))
    }

    /// Variables shared by every template of `stage` in `pool`.
    ///
    /// `{ref}` is only set when the pool has a reference.
    #[must_use]
    pub fn stage_vars(ctx: &ConfigContext, pool: &str, stage: &str) -> TemplateVars {
        let mut vars = TemplateVars::new()
            .with("pool", pool)
            .with("stage", stage)
            .with_path("parent_dir", ctx.parent_dir())
            .with_path("pool_dir", &ctx.pool_dir(pool))
            .with_path("bash_variables", &ctx.bash_variables());
        if let Ok(reference) = ctx.reference(pool) {
            vars.set("ref", reference.display().to_string());
        }
        vars
    }

    /// Resolves `name` for `pool` into an immutable [`Stage`].
    pub fn resolve(&self, ctx: &ConfigContext, pool: &str, name: &str) -> Result<Stage> {
        let def = self.get(name)?;
        let vars = Self::stage_vars(ctx, pool, name);
        let pool_dir = ctx.pool_dir(pool);

        let scheme = def.partitions.scheme(ctx, pool)?;
        let outputs = OutputPattern::new(
            pool_dir.join(vars.render(&def.output_dir)),
            vars.render(&def.artifact),
            vars.render(&def.marker),
        )?;
        let mut stage = Stage::new(
            name,
            pool,
            scheme,
            outputs,
            pool_dir.join(vars.render(&def.job_dir)),
        );
        if let Some(count) = def.declared_count {
            stage = stage.with_declared_count(count);
        }
        if let Some(tag) = &def.job_tag {
            stage = stage.with_job_tag(tag);
        }
        Ok(stage)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_interval_dir() {
        assert_eq!(
            interval_dir(Path::new("/refs/pine/ref.fasta")),
            PathBuf::from("/refs/pine/bedfiles_ref")
        );
        assert_eq!(
            interval_dir(Path::new("/refs/genome.fa.gz")),
            PathBuf::from("/refs/bedfiles_genome")
        );
    }

    #[test]
    fn test_interval_scheme_from_bed_files() {
        let tmp = tempfile::tempdir().unwrap();
        let reference = tmp.path().join("ref.fasta");
        let beds = tmp.path().join("bedfiles_ref");
        std::fs::create_dir_all(&beds).unwrap();
        for name in ["ref_bedfile_2.bed", "ref_bedfile_1.bed", "notes.txt"] {
            std::fs::write(beds.join(name), "").unwrap();
        }

        let ctx = ConfigContext::new(tmp.path()).with_pool("p1", &reference, ["s1"]);
        let scheme = PartitionSource::Intervals {
            suffix: default_interval_suffix(),
        }
        .scheme(&ctx, "p1")
        .unwrap();

        let ids: Vec<&str> = scheme.iter().map(|p| p.id.as_str()).collect();
        assert_eq!(ids, vec!["1", "2"]);
        assert_eq!(
            scheme.source_of(&PartitionId::new("2")),
            Some(beds.join("ref_bedfile_2.bed").as_path())
        );
    }

    #[test]
    fn test_shared_interval_id_is_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let reference = tmp.path().join("ref.fasta");
        let beds = tmp.path().join("bedfiles_ref");
        std::fs::create_dir_all(&beds).unwrap();
        for name in ["a_1.bed", "b_1.bed", "a_2.bed"] {
            std::fs::write(beds.join(name), "").unwrap();
        }

        let ctx = ConfigContext::new(tmp.path()).with_pool("p1", &reference, ["s1"]);
        let err = PartitionSource::Intervals {
            suffix: default_interval_suffix(),
        }
        .scheme(&ctx, "p1")
        .unwrap_err();
        let scheme_err = match &err {
            CoordinatorError::InvalidScheme(e) => e,
            other => panic!("expected invalid scheme, got {other:?}"),
        };
        assert_eq!(
            scheme_err.reason,
            "interval id '1' is named by both a_1.bed and b_1.bed"
        );
        assert_eq!(err.exit_code(), 2);
    }

    #[test]
    fn test_duplicate_sample_is_rejected() {
        let ctx = ConfigContext::new("/data").with_pool("p1", "/ref/ref.fa", ["s1", "s2", "s1"]);
        let err = PartitionSource::PoolSamples.scheme(&ctx, "p1").unwrap_err();
        assert!(matches!(err, CoordinatorError::InvalidScheme(_)));
    }

    #[test]
    fn test_missing_interval_dir_is_io_error() {
        let ctx = ConfigContext::new("/nonexistent").with_pool("p1", "/nonexistent/ref.fa", ["s1"]);
        let err = PartitionSource::Intervals {
            suffix: default_interval_suffix(),
        }
        .scheme(&ctx, "p1")
        .unwrap_err();
        assert!(matches!(err, CoordinatorError::Io(_)));
    }

    #[test]
    fn test_resolve_builtin_realign() {
        let ctx = ConfigContext::new("/data").with_pool("p1", "/ref/ref.fa", ["s1", "s2", "s3"]);
        let stage = StageCatalog::builtin().resolve(&ctx, "p1", "realign").unwrap();

        assert_eq!(stage.declared_count(), 3);
        assert_eq!(stage.job_tag(), "indelRealign");
        assert_eq!(stage.outputs().directory(), Path::new("/data/p1/04_realign"));
        assert_eq!(
            stage.job_dir(),
            Path::new("/data/p1/shfiles/05_indelRealign_shfiles")
        );
        assert_eq!(
            stage.outputs().artifact_path(&PartitionId::new("s2")),
            PathBuf::from("/data/p1/04_realign/s2_realigned.bam")
        );
    }

    #[test]
    fn test_unknown_stage() {
        let err = StageCatalog::builtin().get("varscan").unwrap_err();
        assert!(matches!(err, CoordinatorError::UnknownStage(name) if name == "varscan"));
    }

    #[test]
    fn test_catalog_json_defaults() {
        let json = serde_json::json!({
            "stages": [{
                "name": "call",
                "partitions": {"source": "explicit", "ids": ["a", "b"]},
                "declared_count": 2,
                "output_dir": "calls",
                "artifact": "{pool}_{partition}.vcf.gz",
                "marker": "{pool}_{partition}.vcf.gz.tbi",
                "on_complete": {"kind": "aggregate", "job": {"name": "{pool}-merge", "commands": ["merge {artifacts}"]}}
            }]
        });
        let catalog: StageCatalog = serde_json::from_value(json).unwrap();
        let def = catalog.get("call").unwrap();
        assert_eq!(def.job_dir, "shfiles/{stage}");
        assert_eq!(def.task, None);

        let ctx = ConfigContext::new("/data");
        let stage = catalog.resolve(&ctx, "p1", "call").unwrap();
        assert_eq!(stage.job_dir(), Path::new("/data/p1/shfiles/call"));
        assert_eq!(stage.job_tag(), "call");
        assert_eq!(
            stage.outputs().marker_path(&PartitionId::new("b")),
            PathBuf::from("/data/p1/calls/p1_b.vcf.gz.tbi")
        );
    }

    #[test]
    fn test_load_falls_back_to_builtin() {
        let tmp = tempfile::tempdir().unwrap();
        assert_eq!(StageCatalog::load(tmp.path()).unwrap(), StageCatalog::builtin());
    }

    #[test]
    fn test_job_template_render() {
        let template = JobTemplate::new("{pool}-bcftools_bedfile_{partition}")
            .with_command("bcftools index --tbi {artifact}");
        let vars = TemplateVars::new()
            .with("pool", "p1")
            .with("partition", "4")
            .with("artifact", "/data/p1/bcftools/p1_bcftools_bedfile_4.vcf.gz");

        let desc = template.render(Path::new("/data/p1/shfiles/bcftools"), &vars);
        assert_eq!(desc.name, "p1-bcftools_bedfile_4");
        assert_eq!(
            desc.commands,
            vec!["bcftools index --tbi /data/p1/bcftools/p1_bcftools_bedfile_4.vcf.gz".to_string()]
        );
        assert!(desc.dependency.is_none());
    }
}

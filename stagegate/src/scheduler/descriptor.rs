//! Structured job descriptors, rendered to batch scripts only at submission.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use crate::core::{JobId, PartitionId};

/// Resource request of a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resources {
    /// Wall-time limit (`D-HH:MM:SS` or `HH:MM:SS`).
    #[serde(default = "default_time")]
    pub time: String,
    /// Memory request (e.g. `2000M`).
    #[serde(default = "default_mem")]
    pub mem: String,
    /// Node count.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nodes: Option<u32>,
    /// Task count.
    #[serde(default = "default_ntasks")]
    pub ntasks: u32,
    /// CPUs per task.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpus_per_task: Option<u32>,
}

fn default_time() -> String {
    "23:59:00".to_string()
}

fn default_mem() -> String {
    "2000M".to_string()
}

fn default_ntasks() -> u32 {
    1
}

impl Default for Resources {
    fn default() -> Self {
        Self {
            time: default_time(),
            mem: default_mem(),
            nodes: None,
            ntasks: default_ntasks(),
            cpus_per_task: None,
        }
    }
}

impl Resources {
    /// Creates a resource request.
    #[must_use]
    pub fn new(time: impl Into<String>, mem: impl Into<String>) -> Self {
        Self {
            time: time.into(),
            mem: mem.into(),
            ..Self::default()
        }
    }

    /// Sets the node count.
    #[must_use]
    pub fn with_nodes(mut self, nodes: u32) -> Self {
        self.nodes = Some(nodes);
        self
    }

    /// Sets the CPUs per task.
    #[must_use]
    pub fn with_cpus_per_task(mut self, cpus: u32) -> Self {
        self.cpus_per_task = Some(cpus);
        self
    }
}

/// "Run only after all of these jobs succeed".
///
/// Job ids are kept in canonical order without duplicates, so the clause
/// does not depend on the order handles were recorded in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dependency {
    after_ok: BTreeSet<JobId>,
}

impl Dependency {
    /// Builds an `afterok` dependency. Returns `None` for an empty set.
    #[must_use]
    pub fn after_ok(ids: impl IntoIterator<Item = JobId>) -> Option<Self> {
        let after_ok: BTreeSet<JobId> = ids.into_iter().collect();
        if after_ok.is_empty() {
            None
        } else {
            Some(Self { after_ok })
        }
    }

    /// The job ids named by the clause.
    pub fn job_ids(&self) -> impl Iterator<Item = &JobId> {
        self.after_ok.iter()
    }

    /// Number of job ids named by the clause.
    #[must_use]
    pub fn len(&self) -> usize {
        self.after_ok.len()
    }

    /// Always false; empty dependencies are never constructed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.after_ok.is_empty()
    }

    /// Scheduler syntax, e.g. `afterok:101:102`.
    #[must_use]
    pub fn clause(&self) -> String {
        let ids: Vec<&str> = self.after_ok.iter().map(JobId::as_str).collect();
        format!("afterok:{}", ids.join(":"))
    }
}

/// Mail notification directive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MailDirective {
    /// Recipient.
    pub user: String,
    /// Events that trigger mail.
    pub mail_type: String,
}

/// Everything the scheduler needs to run one job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobDescriptor {
    /// Job name.
    pub name: String,
    /// Directory the script is written to and submitted from.
    pub working_dir: PathBuf,
    /// Resource request.
    pub resources: Resources,
    /// Optional dependency clause.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dependency: Option<Dependency>,
    /// Optional mail directive.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mail: Option<MailDirective>,
    /// Partition this job works on, for per-partition tasks.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub partition: Option<PartitionId>,
    /// Shell commands, run in order.
    #[serde(default)]
    pub commands: Vec<String>,
}

impl JobDescriptor {
    /// Creates a descriptor with default resources and no commands.
    #[must_use]
    pub fn new(name: impl Into<String>, working_dir: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            working_dir: working_dir.into(),
            resources: Resources::default(),
            dependency: None,
            mail: None,
            partition: None,
            commands: Vec::new(),
        }
    }

    /// Sets the resource request.
    #[must_use]
    pub fn with_resources(mut self, resources: Resources) -> Self {
        self.resources = resources;
        self
    }

    /// Sets (or clears) the dependency clause.
    #[must_use]
    pub fn with_dependency(mut self, dependency: Option<Dependency>) -> Self {
        self.dependency = dependency;
        self
    }

    /// Sets the mail directive.
    #[must_use]
    pub fn with_mail(mut self, mail: MailDirective) -> Self {
        self.mail = Some(mail);
        self
    }

    /// Marks the partition this job works on.
    #[must_use]
    pub fn with_partition(mut self, partition: PartitionId) -> Self {
        self.partition = Some(partition);
        self
    }

    /// Appends a command.
    #[must_use]
    pub fn with_command(mut self, command: impl Into<String>) -> Self {
        self.commands.push(command.into());
        self
    }

    /// Path the rendered script is written to.
    #[must_use]
    pub fn script_path(&self) -> PathBuf {
        self.working_dir.join(format!("{}.sh", self.name))
    }

    /// Directory the script is submitted from.
    #[must_use]
    pub fn working_dir(&self) -> &Path {
        &self.working_dir
    }

    /// Renders an sbatch script.
    #[must_use]
    pub fn render(&self) -> String {
        let r = &self.resources;
        let mut text = String::from("#!/bin/bash\n");
        // Infallible: writing into a String.
        let _ = writeln!(text, "#SBATCH --job-name={}", self.name);
        let _ = writeln!(text, "#SBATCH --time={}", r.time);
        let _ = writeln!(text, "#SBATCH --mem={}", r.mem);
        if let Some(nodes) = r.nodes {
            let _ = writeln!(text, "#SBATCH --nodes={nodes}");
        }
        let _ = writeln!(text, "#SBATCH --ntasks={}", r.ntasks);
        if let Some(cpus) = r.cpus_per_task {
            let _ = writeln!(text, "#SBATCH --cpus-per-task={cpus}");
        }
        let _ = writeln!(text, "#SBATCH --output={}_%j.out", self.name);
        if let Some(dep) = &self.dependency {
            let _ = writeln!(text, "#SBATCH --dependency={}", dep.clause());
        }
        if let Some(mail) = &self.mail {
            let _ = writeln!(text, "#SBATCH --mail-user={}", mail.user);
            let _ = writeln!(text, "#SBATCH --mail-type={}", mail.mail_type);
        }
        text.push('\n');
        for command in &self.commands {
            text.push_str(command);
            text.push('\n');
        }
        text
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_dependency_is_order_independent() {
        let a = Dependency::after_ok(["103", "101", "102"].map(JobId::from)).unwrap();
        let b = Dependency::after_ok(["102", "103", "101"].map(JobId::from)).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.clause(), "afterok:101:102:103");
        assert_eq!(a.len(), 3);
    }

    #[test]
    fn test_empty_dependency_is_none() {
        assert!(Dependency::after_ok(Vec::new()).is_none());
    }

    #[test]
    fn test_render_script() {
        let desc = JobDescriptor::new("p1-combine-bcftools", "/data/p1/shfiles/bcftools")
            .with_resources(
                Resources::new("12:00:00", "20000M")
                    .with_nodes(1)
                    .with_cpus_per_task(48),
            )
            .with_dependency(Dependency::after_ok(["7", "8"].map(JobId::from)))
            .with_mail(MailDirective {
                user: "someone@example.org".to_string(),
                mail_type: "FAIL".to_string(),
            })
            .with_command("bcftools concat a.vcf.gz b.vcf.gz -O z -o all.vcf.gz");

        let expected = "\
#!/bin/bash
#SBATCH --job-name=p1-combine-bcftools
#SBATCH --time=12:00:00
#SBATCH --mem=20000M
#SBATCH --nodes=1
#SBATCH --ntasks=1
#SBATCH --cpus-per-task=48
#SBATCH --output=p1-combine-bcftools_%j.out
#SBATCH --dependency=afterok:7:8
#SBATCH --mail-user=someone@example.org
#SBATCH --mail-type=FAIL

bcftools concat a.vcf.gz b.vcf.gz -O z -o all.vcf.gz
";
        assert_eq!(desc.render(), expected);
        assert_eq!(
            desc.script_path(),
            PathBuf::from("/data/p1/shfiles/bcftools/p1-combine-bcftools.sh")
        );
    }

    #[test]
    fn test_render_without_dependency() {
        let desc = JobDescriptor::new("solo", "/tmp");
        assert!(!desc.render().contains("--dependency"));
    }
}

//! Partition identifiers and the fixed partition scheme of a stage.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};
use std::fmt;
use std::path::{Path, PathBuf};

/// Identifier of one disjoint slice of a stage's input domain.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PartitionId(String);

impl PartitionId {
    /// Creates a new partition id.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PartitionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PartitionId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for PartitionId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// One entry of a partition scheme.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Partition {
    /// The partition id.
    pub id: PartitionId,
    /// File describing the partition (e.g. an interval BED file), if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<PathBuf>,
}

impl Partition {
    /// Creates a partition without a source file.
    #[must_use]
    pub fn new(id: impl Into<PartitionId>) -> Self {
        Self {
            id: id.into(),
            source: None,
        }
    }

    /// Creates a partition backed by a source file.
    #[must_use]
    pub fn with_source(id: impl Into<PartitionId>, source: impl Into<PathBuf>) -> Self {
        Self {
            id: id.into(),
            source: Some(source.into()),
        }
    }
}

/// Ordered, duplicate-free set of partitions, fixed when the stage is defined.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionScheme {
    partitions: Vec<Partition>,
}

impl PartitionScheme {
    /// Builds a scheme in the given order. Fails with the offending id if
    /// two partitions share an id.
    pub fn new(partitions: impl IntoIterator<Item = Partition>) -> Result<Self, PartitionId> {
        let mut seen = HashSet::new();
        let mut kept = Vec::new();
        for partition in partitions {
            if !seen.insert(partition.id.clone()) {
                return Err(partition.id);
            }
            kept.push(partition);
        }
        Ok(Self { partitions: kept })
    }

    /// Builds a scheme from bare ids.
    pub fn from_ids<I, S>(ids: I) -> Result<Self, PartitionId>
    where
        I: IntoIterator<Item = S>,
        S: Into<PartitionId>,
    {
        Self::new(ids.into_iter().map(Partition::new))
    }

    /// Returns the number of partitions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.partitions.len()
    }

    /// Returns true if the scheme has no partitions.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.partitions.is_empty()
    }

    /// Iterates partitions in definition order.
    pub fn iter(&self) -> impl Iterator<Item = &Partition> {
        self.partitions.iter()
    }

    /// Returns the partition ids as a set.
    #[must_use]
    pub fn ids(&self) -> BTreeSet<PartitionId> {
        self.partitions.iter().map(|p| p.id.clone()).collect()
    }

    /// Returns true if the scheme contains `id`.
    #[must_use]
    pub fn contains(&self, id: &PartitionId) -> bool {
        self.partitions.iter().any(|p| &p.id == id)
    }

    /// Looks up the source file of a partition.
    #[must_use]
    pub fn source_of(&self, id: &PartitionId) -> Option<&Path> {
        self.partitions
            .iter()
            .find(|p| &p.id == id)
            .and_then(|p| p.source.as_deref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scheme_keeps_order() {
        let scheme = PartitionScheme::from_ids(["3", "1", "2"]).unwrap();
        assert_eq!(scheme.len(), 3);
        let order: Vec<&str> = scheme.iter().map(|p| p.id.as_str()).collect();
        assert_eq!(order, vec!["3", "1", "2"]);
    }

    #[test]
    fn test_duplicate_id_is_rejected() {
        let err = PartitionScheme::from_ids(["3", "1", "3", "2"]).unwrap_err();
        assert_eq!(err, PartitionId::new("3"));
    }

    #[test]
    fn test_scheme_source_lookup() {
        let scheme = PartitionScheme::new([
            Partition::with_source("1", "/ref/bedfiles_ref/ref_1.bed"),
            Partition::new("2"),
        ])
        .unwrap();
        assert_eq!(
            scheme.source_of(&PartitionId::new("1")),
            Some(Path::new("/ref/bedfiles_ref/ref_1.bed"))
        );
        assert_eq!(scheme.source_of(&PartitionId::new("2")), None);
        assert!(scheme.contains(&"2".into()));
        assert!(!scheme.contains(&"9".into()));
    }

    #[test]
    fn test_partition_id_serializes_transparently() {
        let json = serde_json::to_string(&PartitionId::new("samp1")).unwrap();
        assert_eq!(json, r#""samp1""#);
    }
}

//! Create-exclusive reservation files with a jittered re-read.

use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use crate::core::StageKey;
use crate::errors::Result;
use crate::utils::{format_timestamp, parse_timestamp};

/// Default upper bound of the random wait before the re-read.
pub const DEFAULT_MAX_JITTER: Duration = Duration::from_secs(15);

const RESERVATION_SUFFIX: &str = "reservation";

/// The durable claim on a stage transition.
///
/// Written once, never updated and never removed by the coordinator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReservationRecord {
    /// Stage instance the record claims.
    pub stage: StageKey,
    /// Owner id on the first line of the file.
    pub owner: String,
    /// Creation time on the second line, when readable.
    pub created_at: Option<DateTime<Utc>>,
}

impl ReservationRecord {
    fn payload(owner: &str, created_at: &DateTime<Utc>) -> String {
        format!("{owner}\n{}\n", format_timestamp(created_at))
    }

    fn parse(stage: StageKey, text: &str) -> Option<Self> {
        let mut lines = text.lines();
        let owner = lines.next()?.split_whitespace().next()?.to_string();
        Some(Self {
            stage,
            owner,
            created_at: lines.next().and_then(parse_timestamp),
        })
    }
}

/// Result of [`ReservationLock::try_acquire`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Acquisition {
    /// The caller owns the transition.
    Granted(ReservationRecord),
    /// Someone else does. `holder` is `None` if the file was unreadable.
    AlreadyHeld {
        /// Owner id found in the file.
        holder: Option<String>,
    },
}

impl Acquisition {
    /// Returns true if the reservation was granted.
    #[must_use]
    pub fn is_granted(&self) -> bool {
        matches!(self, Self::Granted(_))
    }
}

/// File-based mutual exclusion over stage transitions.
///
/// The file is created with `O_CREAT|O_EXCL`, so only its creator can be
/// granted. After a random wait of at most `max_jitter` the file is read back
/// and the owner id compared, which is the only check left on filesystems
/// where exclusive create is not atomic.
#[derive(Debug, Clone)]
pub struct ReservationLock {
    dir: PathBuf,
    max_jitter: Duration,
}

impl ReservationLock {
    /// Creates a lock keeping its files in `dir`.
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            max_jitter: DEFAULT_MAX_JITTER,
        }
    }

    /// Sets the jitter bound.
    #[must_use]
    pub fn with_max_jitter(mut self, max_jitter: Duration) -> Self {
        self.max_jitter = max_jitter;
        self
    }

    /// Directory holding the reservation files.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the reservation file for `key`.
    #[must_use]
    pub fn path_for(&self, key: &StageKey) -> PathBuf {
        self.dir.join(format!("{key}.{RESERVATION_SUFFIX}"))
    }

    /// Attempts to claim the transition of `key` for `owner`.
    pub async fn try_acquire(&self, key: &StageKey, owner: &str) -> Result<Acquisition> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let path = self.path_for(key);
        let created_at = Utc::now();

        let created = match tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await
        {
            Ok(mut file) => {
                file.write_all(ReservationRecord::payload(owner, &created_at).as_bytes())
                    .await?;
                file.sync_all().await?;
                true
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => false,
            Err(e) => return Err(e.into()),
        };

        let wait = self.max_jitter.mul_f64(rand::random::<f64>());
        debug!(stage = %key, owner, created, ?wait, "Waiting before re-read");
        tokio::time::sleep(wait).await;

        let current = self.current(key).await?;
        match current {
            Some(record) if created && record.owner == owner => {
                info!(stage = %key, owner, path = %path.display(), "Reservation granted");
                Ok(Acquisition::Granted(record))
            }
            other => {
                let holder = other.map(|r| r.owner);
                info!(stage = %key, owner, holder = ?holder, "Reservation already held");
                Ok(Acquisition::AlreadyHeld { holder })
            }
        }
    }

    /// Reads the current record of `key`, if any.
    pub async fn current(&self, key: &StageKey) -> Result<Option<ReservationRecord>> {
        match tokio::fs::read_to_string(self.path_for(key)).await {
            Ok(text) => Ok(ReservationRecord::parse(key.clone(), &text)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn lock(dir: &Path) -> ReservationLock {
        ReservationLock::new(dir.join("reservations")).with_max_jitter(Duration::from_millis(20))
    }

    #[tokio::test]
    async fn test_first_caller_is_granted() {
        let tmp = tempfile::tempdir().unwrap();
        let lock = lock(tmp.path());
        let key = StageKey::new("p1", "realign");

        let record = match lock.try_acquire(&key, "101").await.unwrap() {
            Acquisition::Granted(record) => record,
            other => panic!("expected grant, got {other:?}"),
        };
        assert_eq!(record.owner, "101");
        assert!(record.created_at.is_some());

        let second = lock.try_acquire(&key, "102").await.unwrap();
        assert_eq!(
            second,
            Acquisition::AlreadyHeld {
                holder: Some("101".to_string())
            }
        );
    }

    #[tokio::test]
    async fn test_same_owner_retry_is_not_granted_twice() {
        let tmp = tempfile::tempdir().unwrap();
        let lock = lock(tmp.path());
        let key = StageKey::new("p1", "realign");

        assert!(lock.try_acquire(&key, "101").await.unwrap().is_granted());
        assert!(!lock.try_acquire(&key, "101").await.unwrap().is_granted());
    }

    #[tokio::test]
    async fn test_overlapping_callers_see_one_owner() {
        let tmp = tempfile::tempdir().unwrap();
        let lock = Arc::new(lock(tmp.path()));
        let key = StageKey::new("p1", "bcftools");

        // Every caller writes before any caller has finished its jitter.
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let lock = Arc::clone(&lock);
                let key = key.clone();
                tokio::spawn(async move { lock.try_acquire(&key, &format!("job{i}")).await })
            })
            .collect();

        let mut granted = Vec::new();
        let mut holders = Vec::new();
        for handle in handles {
            match handle.await.unwrap().unwrap() {
                Acquisition::Granted(record) => granted.push(record.owner),
                Acquisition::AlreadyHeld { holder } => holders.push(holder),
            }
        }

        assert_eq!(granted.len(), 1);
        // A loser may read the file before the winner's write lands.
        assert!(holders
            .iter()
            .flatten()
            .all(|holder| holder == &granted[0]));
        let on_disk = lock.current(&key).await.unwrap().unwrap();
        assert_eq!(on_disk.owner, granted[0]);
    }

    #[tokio::test]
    async fn test_foreign_file_is_respected() {
        let tmp = tempfile::tempdir().unwrap();
        let lock = lock(tmp.path());
        let key = StageKey::new("p1", "realign");
        std::fs::create_dir_all(lock.dir()).unwrap();
        std::fs::write(lock.path_for(&key), "777 trailing words\n").unwrap();

        let result = lock.try_acquire(&key, "101").await.unwrap();
        assert_eq!(
            result,
            Acquisition::AlreadyHeld {
                holder: Some("777".to_string())
            }
        );
        assert_eq!(lock.current(&key).await.unwrap().unwrap().created_at, None);
    }

    #[tokio::test]
    async fn test_path_layout() {
        let lock = ReservationLock::new("/data/p1/shfiles/reservations");
        assert_eq!(
            lock.path_for(&StageKey::new("p1", "realign")),
            PathBuf::from("/data/p1/shfiles/reservations/p1-realign.reservation")
        );
    }
}

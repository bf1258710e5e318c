use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use chrono::Utc;
use thiserror::Error;
use tracing::{debug, warn};

use crate::ring::MemberState;

const SNAPSHOT_PREFIX: &str = "membership.";

/// Errors raised while persisting or restoring membership snapshots.
#[derive(Debug, Error)]
pub enum StoreError {
    /// No snapshot exists under the data directory.
    #[error("mem_state_file_not_found")]
    NotFound,
    /// A snapshot existed but could not be decoded.
    #[error("bad_mem_state_file: {0}")]
    Corrupt(String),
    /// Filesystem failure while reading or writing snapshots.
    #[error("snapshot i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// Durable snapshot store. Every save writes a fresh
/// `membership.<YYYYMMDDhhmmss>` file (UTC); the newest timestamp wins on
/// restore and older files accumulate.
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    dir: PathBuf,
}

impl SnapshotStore {
    /// Creates a store rooted at `dir`. The directory is created lazily on
    /// the first save.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Snapshot directory.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Persists `state`, returning the written path.
    pub async fn save(&self, state: &MemberState) -> Result<PathBuf, StoreError> {
        let encoded =
            bincode::serialize(state).map_err(|err| StoreError::Corrupt(err.to_string()))?;
        tokio::fs::create_dir_all(&self.dir).await?;
        let name = format!("{SNAPSHOT_PREFIX}{}", Utc::now().format("%Y%m%d%H%M%S"));
        let path = self.dir.join(name);
        tokio::fs::write(&path, encoded).await?;
        debug!(path = %path.display(), "membership snapshot written");
        Ok(path)
    }

    /// Restores the snapshot with the highest timestamp.
    pub async fn load_latest(&self) -> Result<MemberState, StoreError> {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => return Err(StoreError::NotFound),
            Err(err) => return Err(err.into()),
        };

        let mut newest: Option<(u64, PathBuf)> = None;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let Some(stamp) = name.to_str().and_then(parse_snapshot_stamp) else {
                continue;
            };
            if newest.as_ref().is_none_or(|(best, _)| stamp > *best) {
                newest = Some((stamp, entry.path()));
            }
        }

        let Some((_, path)) = newest else {
            return Err(StoreError::NotFound);
        };
        let bytes = tokio::fs::read(&path).await?;
        bincode::deserialize(&bytes).map_err(|err| {
            warn!(path = %path.display(), "snapshot failed to decode: {err}");
            StoreError::Corrupt(err.to_string())
        })
    }
}

fn parse_snapshot_stamp(name: &str) -> Option<u64> {
    let digits = name.strip_prefix(SNAPSHOT_PREFIX)?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MembershipConfig;
    use crate::ring::{NodeEntry, NodeId, OptionValue, Options};

    fn sample_state() -> MemberState {
        let config = MembershipConfig::default();
        let mut state = MemberState::new(config);
        state
            .ring
            .push(NodeEntry::with_hints(1, NodeId::from("n1"), vec!["p0".into()]));
        state.ring.push(NodeEntry::bare(2, NodeId::from("n2")));
        let mut options = Options::new();
        options.insert("zone".to_string(), OptionValue::Text("east".to_string()));
        state.ring.push(NodeEntry::new(3, NodeId::from("n3"), options));
        state.clock.tick(&NodeId::from("n1"));
        state
    }

    #[tokio::test]
    async fn save_then_load_round_trips() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = SnapshotStore::new(dir.path());
        let state = sample_state();

        store.save(&state).await.expect("save");
        let restored = store.load_latest().await.expect("load");
        assert_eq!(restored, state);
    }

    #[tokio::test]
    async fn newest_timestamp_wins() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = SnapshotStore::new(dir.path());

        let old = MemberState::new(MembershipConfig::default());
        let new = sample_state();
        let old_bytes = bincode::serialize(&old).expect("encode");
        let new_bytes = bincode::serialize(&new).expect("encode");
        tokio::fs::write(dir.path().join("membership.20240101000000"), old_bytes)
            .await
            .expect("write");
        tokio::fs::write(dir.path().join("membership.20250101000000"), new_bytes)
            .await
            .expect("write");

        let restored = store.load_latest().await.expect("load");
        assert_eq!(restored, new);
    }

    #[tokio::test]
    async fn missing_directory_reports_not_found() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = SnapshotStore::new(dir.path().join("absent"));
        assert!(matches!(
            store.load_latest().await,
            Err(StoreError::NotFound)
        ));
    }

    #[tokio::test]
    async fn undecodable_snapshot_reports_corrupt() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = SnapshotStore::new(dir.path());
        tokio::fs::write(dir.path().join("membership.20250101000000"), b"junk")
            .await
            .expect("write");
        assert!(matches!(
            store.load_latest().await,
            Err(StoreError::Corrupt(_))
        ));
    }

    #[test]
    fn stamp_parser_ignores_foreign_files() {
        assert_eq!(parse_snapshot_stamp("membership.20250101000000"), Some(20_250_101_000_000));
        assert_eq!(parse_snapshot_stamp("membership."), None);
        assert_eq!(parse_snapshot_stamp("membership.tmp"), None);
        assert_eq!(parse_snapshot_stamp("backup.20250101000000"), None);
    }
}

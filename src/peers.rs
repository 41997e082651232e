//! Peer-group shared state
//!
//! The replica group shares one versioned key/value document: the canonical
//! config blob, the credential-file blob and generated secrets, plus
//! unit-scoped departure flags and the unit roster. App-scoped entries are
//! single-writer (only the elected leader may publish), so cross-replica
//! write conflicts are impossible by construction. Followers watch the
//! document version and re-render locally when it moves.
//!
//! All cross-replica reads and writes go through [`PeerSynchronizer`];
//! nothing else touches the underlying store.

use std::collections::{BTreeMap, BTreeSet};
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::debug;

/// Canonical pooler config blob.
pub const CANONICAL_CONFIG_KEY: &str = "canonical_config";
/// Credential-file blob.
pub const AUTH_FILE_KEY: &str = "auth_file";
/// Password of the monitoring (stats) user.
pub const MONITORING_PASSWORD_KEY: &str = "monitoring_password";

#[derive(Debug, thiserror::Error)]
pub enum PeerError {
    /// Expected branch for follower replicas attempting an app-scoped
    /// write; callers must not treat this as a failure.
    #[error("unit is not the leader of the peer group")]
    NotLeader,

    #[error(transparent)]
    Io(#[from] io::Error),

    #[error("corrupt peer state document: {0}")]
    Corrupt(#[from] serde_json::Error),
}

/// The persisted shared-state document. Every field is explicit; there is no
/// ambient state surviving restarts outside this struct.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerState {
    /// Bumped once per successful app-scoped publish. Followers re-render
    /// when they observe a version newer than the one they last synced.
    pub version: u64,
    /// App-scoped entries (leader-written): canonical config, auth file,
    /// generated secrets.
    pub entries: BTreeMap<String, String>,
    /// Unit-scoped departure flags, keyed `{unit}/{relation_id}`.
    pub departing: BTreeSet<String>,
    /// Known peer units (each unit registers itself on startup).
    pub units: BTreeSet<String>,
}

/// Storage backing for the shared document.
#[async_trait]
pub trait PeerStore: Send + Sync {
    async fn load(&self) -> Result<PeerState, PeerError>;
    async fn save(&self, state: &PeerState) -> Result<(), PeerError>;
}

/// Group leadership oracle (external collaborator).
pub trait LeadershipOracle: Send + Sync {
    fn is_leader(&self) -> bool;
}

/// Shared JSON document on the replica-shared filesystem, written atomically
/// via a temp file and rename.
pub struct FilePeerStore {
    path: PathBuf,
}

impl FilePeerStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl PeerStore for FilePeerStore {
    async fn load(&self) -> Result<PeerState, PeerError> {
        match fs::read(&self.path).await {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(PeerState::default()),
            Err(e) => Err(e.into()),
        }
    }

    async fn save(&self, state: &PeerState) -> Result<(), PeerError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, serde_json::to_vec_pretty(state)?).await?;
        fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

/// In-memory store for tests and single-replica runs.
#[derive(Default)]
pub struct InMemoryPeerStore {
    state: Mutex<PeerState>,
}

#[async_trait]
impl PeerStore for InMemoryPeerStore {
    async fn load(&self) -> Result<PeerState, PeerError> {
        Ok(self.state.lock().expect("peer state lock").clone())
    }

    async fn save(&self, state: &PeerState) -> Result<(), PeerError> {
        *self.state.lock().expect("peer state lock") = state.clone();
        Ok(())
    }
}

/// Leadership read from a marker file naming the elected unit.
pub struct FileLeadership {
    path: PathBuf,
    unit: String,
}

impl FileLeadership {
    pub fn new(path: impl Into<PathBuf>, unit: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            unit: unit.into(),
        }
    }
}

impl LeadershipOracle for FileLeadership {
    fn is_leader(&self) -> bool {
        std::fs::read_to_string(&self.path)
            .map(|contents| contents.trim() == self.unit)
            .unwrap_or(false)
    }
}

/// Fixed leadership for tests.
pub struct StaticLeadership(pub bool);

impl LeadershipOracle for StaticLeadership {
    fn is_leader(&self) -> bool {
        self.0
    }
}

/// The one accessor for cross-replica state, wrapping the store with the
/// leader write guard.
#[derive(Clone)]
pub struct PeerSynchronizer {
    store: Arc<dyn PeerStore>,
    leadership: Arc<dyn LeadershipOracle>,
    unit: String,
}

impl PeerSynchronizer {
    pub fn new(
        store: Arc<dyn PeerStore>,
        leadership: Arc<dyn LeadershipOracle>,
        unit: impl Into<String>,
    ) -> Self {
        Self {
            store,
            leadership,
            unit: unit.into(),
        }
    }

    pub fn is_leader(&self) -> bool {
        self.leadership.is_leader()
    }

    pub fn unit(&self) -> &str {
        &self.unit
    }

    /// Consistent snapshot of the whole document. Handlers needing several
    /// reads (departure flags, unit roster) take one snapshot rather than
    /// issuing independent reads.
    pub async fn snapshot(&self) -> Result<PeerState, PeerError> {
        self.store.load().await
    }

    /// Publish an app-scoped entry. `None` clears the key. Leader-only;
    /// followers get [`PeerError::NotLeader`]. Skips the write (and the
    /// version bump) when the stored value already matches.
    pub async fn publish(&self, key: &str, value: Option<&str>) -> Result<(), PeerError> {
        if !self.is_leader() {
            return Err(PeerError::NotLeader);
        }
        let mut state = self.store.load().await?;
        let unchanged = match value {
            Some(v) => state.entries.get(key).map(String::as_str) == Some(v),
            None => !state.entries.contains_key(key),
        };
        if unchanged {
            return Ok(());
        }
        match value {
            Some(v) => {
                state.entries.insert(key.to_string(), v.to_string());
            }
            None => {
                state.entries.remove(key);
            }
        }
        state.version += 1;
        debug!(key, version = state.version, "published peer entry");
        self.store.save(&state).await
    }

    /// Read an app-scoped entry; `None` when nothing has been published.
    pub async fn fetch(&self, key: &str) -> Result<Option<String>, PeerError> {
        Ok(self.store.load().await?.entries.get(key).cloned())
    }

    /// Current document version.
    pub async fn version(&self) -> Result<u64, PeerError> {
        Ok(self.store.load().await?.version)
    }

    /// Register this unit in the peer roster (unit-scoped, not leader-gated).
    pub async fn register_unit(&self) -> Result<(), PeerError> {
        let mut state = self.store.load().await?;
        if state.units.insert(self.unit.clone()) {
            self.store.save(&state).await?;
        }
        Ok(())
    }

    /// Flag this unit as departing from `relation_id`. Unit-scoped: marks a
    /// scale-down of this replica, not a relation teardown, and does not
    /// bump the document version.
    pub async fn mark_departing(&self, relation_id: u32) -> Result<(), PeerError> {
        let mut state = self.store.load().await?;
        if state.departing.insert(departing_key(&self.unit, relation_id)) {
            self.store.save(&state).await?;
        }
        Ok(())
    }

    /// Whether this unit has flagged `relation_id` as departing.
    pub fn is_departing(state: &PeerState, unit: &str, relation_id: u32) -> bool {
        state.departing.contains(&departing_key(unit, relation_id))
    }
}

fn departing_key(unit: &str, relation_id: u32) -> String {
    format!("{unit}/{relation_id}")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn synchronizer(store: Arc<dyn PeerStore>, leader: bool, unit: &str) -> PeerSynchronizer {
        PeerSynchronizer::new(store, Arc::new(StaticLeadership(leader)), unit)
    }

    #[tokio::test]
    async fn test_non_leader_publish_never_mutates() {
        let store: Arc<dyn PeerStore> = Arc::new(InMemoryPeerStore::default());
        let follower = synchronizer(store.clone(), false, "pgbouncer/1");

        let err = follower
            .publish(CANONICAL_CONFIG_KEY, Some("cfg"))
            .await
            .unwrap_err();
        assert!(matches!(err, PeerError::NotLeader));
        assert_eq!(store.load().await.unwrap(), PeerState::default());
    }

    #[tokio::test]
    async fn test_leader_publish_bumps_version_once_per_change() {
        let store: Arc<dyn PeerStore> = Arc::new(InMemoryPeerStore::default());
        let leader = synchronizer(store.clone(), true, "pgbouncer/0");

        leader.publish(CANONICAL_CONFIG_KEY, Some("cfg")).await.unwrap();
        assert_eq!(leader.version().await.unwrap(), 1);
        // identical content is a no-op
        leader.publish(CANONICAL_CONFIG_KEY, Some("cfg")).await.unwrap();
        assert_eq!(leader.version().await.unwrap(), 1);

        leader.publish(CANONICAL_CONFIG_KEY, Some("cfg2")).await.unwrap();
        assert_eq!(leader.version().await.unwrap(), 2);
        assert_eq!(
            leader.fetch(CANONICAL_CONFIG_KEY).await.unwrap().as_deref(),
            Some("cfg2")
        );

        leader.publish(CANONICAL_CONFIG_KEY, None).await.unwrap();
        assert_eq!(leader.fetch(CANONICAL_CONFIG_KEY).await.unwrap(), None);
        assert_eq!(leader.version().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_leadership_handover_mid_sequence() {
        // Two units share one store; exactly the leader-at-the-time's writes
        // land, with no interleaving of a deposed leader's writes.
        let store: Arc<dyn PeerStore> = Arc::new(InMemoryPeerStore::default());
        let first = synchronizer(store.clone(), true, "pgbouncer/0");
        first.publish(AUTH_FILE_KEY, Some("v1")).await.unwrap();

        // handover: unit 0 deposed, unit 1 elected
        let deposed = synchronizer(store.clone(), false, "pgbouncer/0");
        let elected = synchronizer(store.clone(), true, "pgbouncer/1");

        assert!(matches!(
            deposed.publish(AUTH_FILE_KEY, Some("stale")).await,
            Err(PeerError::NotLeader)
        ));
        elected.publish(AUTH_FILE_KEY, Some("v2")).await.unwrap();

        assert_eq!(
            elected.fetch(AUTH_FILE_KEY).await.unwrap().as_deref(),
            Some("v2")
        );
        assert_eq!(elected.version().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_departing_flags_are_unit_scoped() {
        let store: Arc<dyn PeerStore> = Arc::new(InMemoryPeerStore::default());
        let follower = synchronizer(store.clone(), false, "pgbouncer/2");

        // followers may write their own flags
        follower.mark_departing(7).await.unwrap();
        let state = follower.snapshot().await.unwrap();
        assert!(PeerSynchronizer::is_departing(&state, "pgbouncer/2", 7));
        assert!(!PeerSynchronizer::is_departing(&state, "pgbouncer/0", 7));
        // flags do not move the replication version
        assert_eq!(state.version, 0);
    }

    #[tokio::test]
    async fn test_file_store_round_trip() {
        let tmp = tempfile::tempdir().unwrap();
        let store = FilePeerStore::new(tmp.path().join("state.json"));

        assert_eq!(store.load().await.unwrap(), PeerState::default());

        let mut state = PeerState::default();
        state.version = 4;
        state.entries.insert(AUTH_FILE_KEY.into(), "blob".into());
        state.units.insert("pgbouncer/0".into());
        store.save(&state).await.unwrap();
        assert_eq!(store.load().await.unwrap(), state);
    }

    #[test]
    fn test_file_leadership() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("leader");
        let oracle = FileLeadership::new(&path, "pgbouncer/0");
        assert!(!oracle.is_leader());

        std::fs::write(&path, "pgbouncer/0\n").unwrap();
        assert!(oracle.is_leader());

        std::fs::write(&path, "pgbouncer/1\n").unwrap();
        assert!(!oracle.is_leader());
    }
}

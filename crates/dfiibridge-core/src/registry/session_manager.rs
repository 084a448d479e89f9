//! Directory-backed registry of session descriptors.

use super::atomic::atomic_write;
use crate::channel::{Channel, ChannelClient};
use crate::config::{major_version, BridgeConfig};
use crate::session::{descriptor_file_name, Session};
use crate::{BridgeError, Result};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// Why a descriptor was deleted by the registry itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictionReason {
    /// The descriptor could not be parsed.
    Corrupt,
    /// The liveness probe could not reach the peer.
    Unreachable,
}

/// One self-healing deletion performed by the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Eviction {
    pub path: PathBuf,
    pub reason: EvictionReason,
}

/// File-backed registry of known sessions.
///
/// Each session is one descriptor file keyed by hostname and port. The
/// directory is shared by every local process; writes replace whole files and
/// the last writer wins.
#[derive(Debug)]
pub struct SessionManager {
    root: PathBuf,
    evictions: Mutex<Vec<Eviction>>,
}

impl SessionManager {
    /// Open the registry at the default location (`~/.dfiibridge`).
    pub fn open() -> Result<Self> {
        let root = crate::platform::bridge_root_dir()?;
        Self::open_at(root)
    }

    /// Open the registry rooted at `root`, creating the directory if needed.
    pub fn open_at(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        if !root.exists() {
            std::fs::create_dir_all(&root).map_err(|e| BridgeError::Io {
                message: format!("Failed to create registry directory: {}", root.display()),
                path: Some(root.clone()),
                source: Some(e),
            })?;
        }

        Ok(Self {
            root,
            evictions: Mutex::new(Vec::new()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path of the descriptor file for a host/port pair.
    pub fn descriptor_path(&self, hostname: &str, port: u16) -> PathBuf {
        self.root.join(descriptor_file_name(hostname, port))
    }

    /// Path of the log file conventionally associated with `session`.
    pub fn log_path(&self, session: &Session) -> PathBuf {
        self.root.join(session.log_file_name())
    }

    // ========================================
    // Descriptor CRUD
    // ========================================

    /// Persist `session`, replacing any existing descriptor.
    pub fn write(&self, session: &Session) -> Result<()> {
        if !session.is_valid() {
            return Err(BridgeError::InvalidSession(format!(
                "refusing to persist incomplete session {}",
                session
            )));
        }

        let path = self.descriptor_path(session.hostname(), session.port());
        atomic_write(&path, &session.to_json()?)?;
        debug!("Registered session {} at {}", session, path.display());
        Ok(())
    }

    /// Load one session.
    ///
    /// With `connection_check`, the peer must also answer a liveness probe;
    /// an unreachable peer is evicted and reported as `UnreachablePeer`.
    pub async fn get(&self, hostname: &str, port: u16, connection_check: bool) -> Result<Session> {
        let path = self.descriptor_path(hostname, port);
        let text = match std::fs::read_to_string(&path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(BridgeError::NotFound {
                    hostname: hostname.to_string(),
                    port,
                })
            }
            Err(e) => return Err(BridgeError::io_with_path(e, path)),
        };

        let session = Session::from_json(&text)?;
        check_version(&session)?;

        if connection_check && !self.ping(&session).await {
            return Err(BridgeError::UnreachablePeer {
                hostname: hostname.to_string(),
                port,
            });
        }

        Ok(session)
    }

    /// Load every compatible session in the registry.
    ///
    /// Descriptors with another major version are skipped. Descriptors that
    /// fail to parse are deleted. With `connection_check`, unreachable peers
    /// are excluded (and evicted by the probe).
    pub async fn find_all(&self, connection_check: bool) -> Result<Vec<Session>> {
        let mut sessions = Vec::new();

        for path in self.descriptor_files() {
            let text = match std::fs::read_to_string(&path) {
                Ok(text) => text,
                Err(e) => {
                    // Removed by another process between listing and reading
                    debug!("Skipping unreadable descriptor {}: {}", path.display(), e);
                    continue;
                }
            };

            let session = match Session::from_json(&text) {
                Ok(session) => session,
                Err(e) => {
                    warn!("Removing corrupt descriptor {}: {}", path.display(), e);
                    self.evict(&path, EvictionReason::Corrupt);
                    continue;
                }
            };

            if let Err(e) = check_version(&session) {
                debug!("Skipping {}: {}", path.display(), e);
                continue;
            }

            if connection_check && !self.ping(&session).await {
                continue;
            }

            sessions.push(session);
        }

        sessions.sort_by(|a, b| (a.hostname(), a.port()).cmp(&(b.hostname(), b.port())));
        Ok(sessions)
    }

    /// Like [`find_all`](Self::find_all), keeping only sessions whose
    /// userdata contains every `criteria` entry with the same value.
    pub async fn find_by_metadata(
        &self,
        criteria: &BTreeMap<String, String>,
        connection_check: bool,
    ) -> Result<Vec<Session>> {
        let sessions = self.find_all(connection_check).await?;
        Ok(sessions
            .into_iter()
            .filter(|session| session.matches_metadata(criteria))
            .collect())
    }

    /// Remove the descriptor for `session`.
    ///
    /// Returns `false` if there was nothing to remove.
    pub fn delete(&self, session: &Session) -> Result<bool> {
        let path = self.descriptor_path(session.hostname(), session.port());
        match std::fs::remove_file(&path) {
            Ok(()) => {
                debug!("Unregistered session {}", session);
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(BridgeError::io_with_path(e, path)),
        }
    }

    /// Remove several descriptors, returning how many existed.
    pub fn delete_all(&self, sessions: &[Session]) -> Result<usize> {
        let mut removed = 0;
        for session in sessions {
            if self.delete(session)? {
                removed += 1;
            }
        }
        Ok(removed)
    }

    // ========================================
    // Liveness
    // ========================================

    /// Probe `session` with a fresh connection.
    ///
    /// On failure the descriptor is deleted, since a registration nobody
    /// answers for is stale.
    pub async fn ping(&self, session: &Session) -> bool {
        let mut probe = ChannelClient::new();
        match probe
            .connect_endpoint(&session.address(), BridgeConfig::PROBE_CONNECT_ATTEMPTS)
            .await
        {
            Ok(()) => {
                probe.close();
                true
            }
            Err(e) => {
                info!("Session {} is unreachable: {}", session, e);
                let path = self.descriptor_path(session.hostname(), session.port());
                self.evict(&path, EvictionReason::Unreachable);
                false
            }
        }
    }

    /// Probe every compatible descriptor and return how many were evicted.
    pub async fn clean(&self) -> Result<usize> {
        let before = self.eviction_count();
        self.find_all(true).await?;
        Ok(self.eviction_count().saturating_sub(before))
    }

    /// Evictions performed by this manager, oldest first.
    pub fn evictions(&self) -> Vec<Eviction> {
        self.evictions
            .lock()
            .map(|log| log.clone())
            .unwrap_or_default()
    }

    pub fn eviction_count(&self) -> usize {
        self.evictions.lock().map(|log| log.len()).unwrap_or_default()
    }

    fn evict(&self, path: &Path, reason: EvictionReason) {
        match std::fs::remove_file(path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!("Failed to remove {}: {}", path.display(), e),
        }

        if let Ok(mut log) = self.evictions.lock() {
            log.push(Eviction {
                path: path.to_path_buf(),
                reason,
            });
        }
    }

    fn descriptor_files(&self) -> Vec<PathBuf> {
        WalkDir::new(&self.root)
            .min_depth(1)
            .max_depth(1)
            .into_iter()
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_type().is_file())
            .map(|entry| entry.into_path())
            .filter(|path| {
                path.extension()
                    .is_some_and(|ext| ext == BridgeConfig::DESCRIPTOR_EXTENSION)
            })
            .collect()
    }
}

fn check_version(session: &Session) -> Result<()> {
    let expected = major_version(BridgeConfig::PROTOCOL_VERSION);
    let actual = major_version(session.version());
    if expected != actual {
        return Err(BridgeError::VersionMismatch { expected, actual });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::ChannelServer;
    use tempfile::TempDir;

    fn create_test_manager() -> (SessionManager, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let manager = SessionManager::open_at(temp_dir.path().join("registry")).unwrap();
        (manager, temp_dir)
    }

    fn session(port: u16) -> Session {
        Session::new("127.0.0.1", port, "key", BridgeConfig::PROTOCOL_VERSION)
    }

    fn session_with(port: u16, role: &str) -> Session {
        let mut userdata = BTreeMap::new();
        userdata.insert("role".to_string(), role.to_string());
        session(port).with_userdata(userdata)
    }

    /// Bind a live channel and return it with a session pointing at it.
    async fn live_session(role: &str) -> (ChannelServer, Session) {
        let mut server = ChannelServer::new();
        server.bind("tcp://127.0.0.1:0").await.unwrap();
        let port = server.get_port().unwrap();
        (server, session_with(port, role))
    }

    /// A port that had a listener a moment ago and now has none.
    async fn dead_port() -> u16 {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    }

    #[test]
    fn test_open_at_creates_directory() {
        let (manager, _temp_dir) = create_test_manager();
        assert!(manager.root().is_dir());
    }

    #[tokio::test]
    async fn test_write_then_get() {
        let (manager, _temp_dir) = create_test_manager();
        let original = session_with(4000, "worker");

        manager.write(&original).unwrap();
        assert!(manager.descriptor_path("127.0.0.1", 4000).exists());

        let loaded = manager.get("127.0.0.1", 4000, false).await.unwrap();
        assert_eq!(loaded, original);
        assert_eq!(loaded.userdata().get("role").map(String::as_str), Some("worker"));
    }

    #[test]
    fn test_write_rejects_invalid_session() {
        let (manager, _temp_dir) = create_test_manager();
        let result = manager.write(&Session::new("127.0.0.1", 4000, "", "1.0.0"));
        assert!(matches!(result, Err(BridgeError::InvalidSession(_))));
    }

    #[tokio::test]
    async fn test_get_missing_is_not_found() {
        let (manager, _temp_dir) = create_test_manager();
        let result = manager.get("127.0.0.1", 4000, false).await;
        assert!(matches!(result, Err(BridgeError::NotFound { port: 4000, .. })));
    }

    #[tokio::test]
    async fn test_get_malformed_descriptor() {
        let (manager, _temp_dir) = create_test_manager();
        let path = manager.descriptor_path("127.0.0.1", 4000);
        std::fs::write(&path, r#"{"hostname": "127.0.0.1"}"#).unwrap();

        let result = manager.get("127.0.0.1", 4000, false).await;
        assert!(matches!(result, Err(BridgeError::MalformedSession(_))));
    }

    #[tokio::test]
    async fn test_get_version_mismatch() {
        let (manager, _temp_dir) = create_test_manager();
        manager
            .write(&Session::new("127.0.0.1", 4000, "key", "9999.0.0"))
            .unwrap();

        let result = manager.get("127.0.0.1", 4000, false).await;
        assert!(matches!(result, Err(BridgeError::VersionMismatch { .. })));
    }

    #[tokio::test]
    async fn test_get_with_connection_check_evicts_dead_peer() {
        let (manager, _temp_dir) = create_test_manager();
        let port = dead_port().await;
        manager.write(&session(port)).unwrap();

        let result = manager.get("127.0.0.1", port, true).await;
        assert!(matches!(result, Err(BridgeError::UnreachablePeer { .. })));
        assert!(!manager.descriptor_path("127.0.0.1", port).exists());
    }

    #[tokio::test]
    async fn test_get_with_connection_check_live_peer() {
        let (manager, _temp_dir) = create_test_manager();
        let (_server, live) = live_session("worker").await;
        manager.write(&live).unwrap();

        let loaded = manager.get("127.0.0.1", live.port(), true).await.unwrap();
        assert_eq!(loaded, live);
        assert_eq!(manager.eviction_count(), 0);
    }

    #[tokio::test]
    async fn test_find_all_skips_other_versions_and_removes_corrupt() {
        let (manager, _temp_dir) = create_test_manager();
        manager.write(&session(4001)).unwrap();
        manager.write(&session(4002)).unwrap();
        manager
            .write(&Session::new("127.0.0.1", 4003, "key", "9999.1.0"))
            .unwrap();
        let corrupt = manager.descriptor_path("127.0.0.1", 4004);
        std::fs::write(&corrupt, "{ not json").unwrap();
        std::fs::write(manager.root().join("notes.txt"), "ignored").unwrap();

        let found = manager.find_all(false).await.unwrap();
        let ports: Vec<u16> = found.iter().map(|s| s.port()).collect();
        assert_eq!(ports, vec![4001, 4002]);

        // Other-version descriptor stays, corrupt one is gone
        assert!(manager.descriptor_path("127.0.0.1", 4003).exists());
        assert!(!corrupt.exists());
        assert_eq!(
            manager.evictions(),
            vec![Eviction {
                path: corrupt,
                reason: EvictionReason::Corrupt,
            }]
        );
    }

    #[tokio::test]
    async fn test_find_all_with_connection_check_excludes_dead() {
        let (manager, _temp_dir) = create_test_manager();
        let (_server, live) = live_session("worker").await;
        let dead = session(dead_port().await);
        manager.write(&live).unwrap();
        manager.write(&dead).unwrap();

        let found = manager.find_all(true).await.unwrap();
        assert_eq!(found, vec![live]);
        assert!(!manager.descriptor_path("127.0.0.1", dead.port()).exists());
        assert_eq!(manager.evictions()[0].reason, EvictionReason::Unreachable);
    }

    #[tokio::test]
    async fn test_find_by_metadata() {
        let (manager, _temp_dir) = create_test_manager();
        manager.write(&session_with(4001, "worker")).unwrap();
        manager.write(&session_with(4002, "worker")).unwrap();
        manager.write(&session_with(4003, "coordinator")).unwrap();

        let mut criteria = BTreeMap::new();
        criteria.insert("role".to_string(), "worker".to_string());
        let workers = manager.find_by_metadata(&criteria, false).await.unwrap();
        assert_eq!(workers.len(), 2);

        criteria.insert("role".to_string(), "scheduler".to_string());
        let none = manager.find_by_metadata(&criteria, false).await.unwrap();
        assert!(none.is_empty());

        let everything = manager
            .find_by_metadata(&BTreeMap::new(), false)
            .await
            .unwrap();
        assert_eq!(everything.len(), 3);
    }

    #[tokio::test]
    async fn test_ping_dead_peer_deletes_stale_descriptor() {
        let (manager, _temp_dir) = create_test_manager();
        let stale = session(dead_port().await);
        manager.write(&stale).unwrap();

        assert!(!manager.ping(&stale).await);
        assert!(!manager.descriptor_path("127.0.0.1", stale.port()).exists());
        assert_eq!(manager.eviction_count(), 1);
    }

    #[tokio::test]
    async fn test_ping_live_peer() {
        let (manager, _temp_dir) = create_test_manager();
        let (_server, live) = live_session("worker").await;
        manager.write(&live).unwrap();

        assert!(manager.ping(&live).await);
        assert!(manager.descriptor_path("127.0.0.1", live.port()).exists());
    }

    #[tokio::test]
    async fn test_delete_tolerates_missing() {
        let (manager, _temp_dir) = create_test_manager();
        let a = session(4001);
        let b = session(4002);
        manager.write(&a).unwrap();

        assert!(manager.delete(&a).unwrap());
        assert!(!manager.delete(&a).unwrap());

        manager.write(&a).unwrap();
        manager.write(&b).unwrap();
        assert_eq!(manager.delete_all(&[a.clone(), b.clone(), a]).unwrap(), 2);
    }

    #[tokio::test]
    async fn test_clean_counts_evictions() {
        let (manager, _temp_dir) = create_test_manager();
        let (_server, live) = live_session("worker").await;
        manager.write(&live).unwrap();
        manager.write(&session(dead_port().await)).unwrap();

        assert_eq!(manager.clean().await.unwrap(), 1);
        assert_eq!(manager.find_all(false).await.unwrap(), vec![live]);
    }

    #[test]
    fn test_log_path_uses_descriptor_naming() {
        let (manager, _temp_dir) = create_test_manager();
        let path = manager.log_path(&session(4001));
        assert_eq!(path, manager.root().join("127.0.0.1_4001.log"));
    }
}

use crate::backends::ClusterConnection;
use crate::model::Credential;
use async_trait::async_trait;
use rand::rngs::OsRng;
use rand::RngCore;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::Mutex;
use tokio::time::Instant;

pub const SESSION_COOKIE: &str = "session_id";

const TOKEN_BYTES: usize = 32;

/// One successful login: the credential the brokers are re-queried with and
/// the cluster manager connections it opened. Immutable after creation.
///
/// The credential stays in process memory in plain text for the lifetime of
/// the session and is never written anywhere else.
#[derive(Debug)]
pub struct Session {
    pub token: String,
    pub credential: Credential,
    pub cluster_connections: Vec<ClusterConnection>,
    pub created_at: SystemTime,
}

impl Session {
    pub fn cluster_connection(&self, manager_id: &str) -> Option<&ClusterConnection> {
        self.cluster_connections
            .iter()
            .find(|c| c.manager_id == manager_id)
    }
}

#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn create(
        &self,
        credential: Credential,
        cluster_connections: Vec<ClusterConnection>,
    ) -> Arc<Session>;

    /// `None` for unknown tokens and for sessions idle past the timeout.
    async fn get(&self, token: &str) -> Option<Arc<Session>>;

    /// Removes idle sessions and hands them back so their connections can be closed.
    async fn evict_idle(&self) -> Vec<Arc<Session>>;

    async fn len(&self) -> usize;
}

struct Entry {
    session: Arc<Session>,
    last_seen: Instant,
}

pub struct InMemorySessionStore {
    idle_timeout: Option<Duration>,
    entries: Mutex<HashMap<String, Entry>>,
}

impl InMemorySessionStore {
    pub fn new(idle_timeout: Option<Duration>) -> Self {
        Self {
            idle_timeout,
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn is_idle(&self, entry: &Entry, now: Instant) -> bool {
        match self.idle_timeout {
            Some(timeout) => now.saturating_duration_since(entry.last_seen) > timeout,
            None => false,
        }
    }
}

/// 256 random bits from the OS, hex encoded.
pub fn generate_token() -> String {
    let mut buf = [0_u8; TOKEN_BYTES];
    OsRng.fill_bytes(&mut buf);
    hex::encode(buf)
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn create(
        &self,
        credential: Credential,
        cluster_connections: Vec<ClusterConnection>,
    ) -> Arc<Session> {
        let mut entries = self.entries.lock().await;
        let mut token = generate_token();
        while entries.contains_key(&token) {
            token = generate_token();
        }
        let session = Arc::new(Session {
            token: token.clone(),
            credential,
            cluster_connections,
            created_at: SystemTime::now(),
        });
        entries.insert(
            token,
            Entry {
                session: session.clone(),
                last_seen: Instant::now(),
            },
        );
        session
    }

    async fn get(&self, token: &str) -> Option<Arc<Session>> {
        let now = Instant::now();
        let mut entries = self.entries.lock().await;
        let entry = entries.get_mut(token)?;
        if self.is_idle(entry, now) {
            return None;
        }
        entry.last_seen = now;
        Some(entry.session.clone())
    }

    async fn evict_idle(&self) -> Vec<Arc<Session>> {
        let now = Instant::now();
        let mut entries = self.entries.lock().await;
        let idle: Vec<String> = entries
            .iter()
            .filter(|(_, entry)| self.is_idle(entry, now))
            .map(|(token, _)| token.clone())
            .collect();
        idle.into_iter()
            .filter_map(|token| entries.remove(&token))
            .map(|entry| entry.session)
            .collect()
    }

    async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn credential() -> Credential {
        Credential::new("CORP", "alice", "pw")
    }

    fn connections() -> Vec<ClusterConnection> {
        vec![
            ClusterConnection::new("vcenter1", "vc01.lab", "vCenter", "k1"),
            ClusterConnection::new("vcenter2", "vc02.lab", "vCenter", "k2"),
        ]
    }

    #[tokio::test]
    async fn tokens_unique_over_many_logins() {
        let store = InMemorySessionStore::new(None);
        let mut seen = HashSet::new();
        let mut previous = String::new();
        for _ in 0..1000 {
            let session = store.create(credential(), connections()).await;
            assert_eq!(session.token.len(), TOKEN_BYTES * 2);
            assert!(session.token.chars().all(|c| c.is_ascii_hexdigit()));
            if !previous.is_empty() {
                assert_ne!(&session.token[..8], &previous[..8]);
            }
            previous = session.token.clone();
            assert!(seen.insert(session.token.clone()));
        }
        assert_eq!(store.len().await, 1000);
    }

    #[tokio::test]
    async fn get_returns_the_created_session() {
        let store = InMemorySessionStore::new(None);
        let session = store.create(credential(), connections()).await;
        let found = store.get(&session.token).await.expect("сессия должна находиться");
        assert!(Arc::ptr_eq(&session, &found));
        assert_eq!(found.credential, credential());
        assert_eq!(
            found.cluster_connection("vcenter2").map(|c| c.host.as_str()),
            Some("vc02.lab")
        );
        assert!(found.cluster_connection("vcenter3").is_none());
    }

    #[tokio::test]
    async fn unknown_token_is_not_found() {
        let store = InMemorySessionStore::new(None);
        store.create(credential(), connections()).await;
        assert!(store.get("deadbeef").await.is_none());
        assert!(store.get("").await.is_none());
    }

    #[tokio::test]
    async fn concurrent_sessions_keep_their_own_connections() {
        let store = Arc::new(InMemorySessionStore::new(None));
        let mut handles = Vec::new();
        for i in 0..16 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                let conns = vec![ClusterConnection::new("vcenter1", "vc", "x", format!("k{i}"))];
                let session = store.create(credential(), conns).await;
                let found = store.get(&session.token).await.unwrap();
                found.cluster_connections[0].session_key.clone()
            }));
        }
        let mut keys = HashSet::new();
        for handle in handles {
            keys.insert(handle.await.unwrap());
        }
        assert_eq!(keys.len(), 16);
    }

    #[tokio::test(start_paused = true)]
    async fn idle_sessions_expire_and_are_evicted() {
        let store = InMemorySessionStore::new(Some(Duration::from_secs(60)));
        let idle = store.create(credential(), connections()).await;
        let active = store.create(credential(), connections()).await;

        tokio::time::advance(Duration::from_secs(45)).await;
        assert!(store.get(&active.token).await.is_some());

        tokio::time::advance(Duration::from_secs(30)).await;
        assert!(store.get(&idle.token).await.is_none());
        assert!(store.get(&active.token).await.is_some());

        let evicted = store.evict_idle().await;
        assert_eq!(evicted.len(), 1);
        assert_eq!(evicted[0].token, idle.token);
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn sessions_without_timeout_never_expire() {
        let store = InMemorySessionStore::new(None);
        let session = store.create(credential(), connections()).await;
        tokio::time::advance(Duration::from_secs(365 * 24 * 3600)).await;
        assert!(store.get(&session.token).await.is_some());
        assert!(store.evict_idle().await.is_empty());
    }
}

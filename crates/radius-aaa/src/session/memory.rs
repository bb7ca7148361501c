//! In-memory session storage

use super::{SessionError, SessionState, SessionStorage};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time;
use tracing::debug;

/// Upper bound on the interval between expiry sweeps
const MAX_CLEANUP_INTERVAL: Duration = Duration::from_secs(60);

/// Session storage kept in process memory
///
/// Suitable for single-server deployments and tests. State does not survive
/// a restart. With a TTL configured, entries that have not been written for
/// longer than the TTL read as missing and are purged by the background
/// sweep started with [`SessionStorage::spawn_cleanup`].
#[derive(Debug, Clone)]
pub struct MemoryStorage {
    store: Arc<RwLock<HashMap<String, StoredState>>>,
    ttl: Option<Duration>,
}

#[derive(Debug, Clone)]
struct StoredState {
    state: SessionState,
    written_at: Instant,
}

impl StoredState {
    fn is_expired(&self, ttl: Option<Duration>) -> bool {
        ttl.is_some_and(|ttl| self.written_at.elapsed() > ttl)
    }
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new(None)
    }
}

impl MemoryStorage {
    pub fn new(ttl: Option<Duration>) -> Self {
        Self {
            store: Arc::new(RwLock::new(HashMap::new())),
            ttl,
        }
    }

    /// Drop expired sessions
    pub async fn cleanup_expired(&self) -> usize {
        let mut store = self.store.write().await;
        let before = store.len();
        store.retain(|_, stored| !stored.is_expired(self.ttl));
        before - store.len()
    }

    /// Number of stored sessions, including expired ones not yet purged
    pub async fn len(&self) -> usize {
        self.store.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.store.read().await.is_empty()
    }
}

#[async_trait]
impl SessionStorage for MemoryStorage {
    async fn get(&self, session_id: &str) -> Result<SessionState, SessionError> {
        let store = self.store.read().await;
        match store.get(session_id) {
            Some(stored) if !stored.is_expired(self.ttl) => Ok(stored.state.clone()),
            _ => Err(SessionError::NotFound(session_id.to_string())),
        }
    }

    async fn set(&self, session_id: &str, state: SessionState) -> Result<(), SessionError> {
        let mut store = self.store.write().await;
        store.insert(
            session_id.to_string(),
            StoredState {
                state,
                written_at: Instant::now(),
            },
        );
        Ok(())
    }

    /// Sweep once per TTL, at most a minute apart; nothing to do without a TTL
    fn spawn_cleanup(&self) -> Option<JoinHandle<()>> {
        let interval = self.ttl?.min(MAX_CLEANUP_INTERVAL);
        let storage = self.clone();

        Some(tokio::spawn(async move {
            let mut ticker = time::interval(interval);
            ticker.set_missed_tick_behavior(time::MissedTickBehavior::Skip);

            loop {
                ticker.tick().await;
                let removed = storage.cleanup_expired().await;
                if removed > 0 {
                    let remaining = storage.len().await;
                    debug!(
                        removed = removed,
                        remaining = remaining,
                        "Session storage cleanup completed"
                    );
                }
            }
        }))
    }
}

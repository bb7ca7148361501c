//! Retransmission detection
//!
//! A NAS that does not hear back retransmits the same request with the same
//! identifier from the same source address. Every (address, identifier) pair
//! seen within the dedup window is remembered; repeats are dropped without a
//! reply. One cache is shared by all UDP listeners of a server.

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio::time;
use tracing::debug;

/// Upper bound on the interval between expiry sweeps
const MAX_CLEANUP_INTERVAL: Duration = Duration::from_secs(60);

/// Cache key for a request: `"<remote-addr>_<identifier>"`
pub fn dedup_key(remote_addr: &SocketAddr, identifier: u8) -> String {
    format!("{}_{}", remote_addr, identifier)
}

/// Presence-only set of recently seen request keys
#[derive(Debug, Clone)]
pub struct DedupCache {
    entries: Arc<DashMap<String, Instant>>,
    window: Duration,
}

impl DedupCache {
    pub fn new(window: Duration) -> Self {
        Self {
            entries: Arc::new(DashMap::new()),
            window,
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Record `key`, returning `true` when it was already present and
    /// unexpired
    ///
    /// The check and the insert happen under one shard lock, so of two
    /// concurrent calls with the same key exactly one returns `false`.
    pub fn check_and_insert(&self, key: String) -> bool {
        let now = Instant::now();
        match self.entries.entry(key) {
            Entry::Occupied(mut entry) => {
                if now.duration_since(*entry.get()) <= self.window {
                    true
                } else {
                    entry.insert(now);
                    false
                }
            }
            Entry::Vacant(entry) => {
                entry.insert(now);
                false
            }
        }
    }

    /// Drop every entry older than the window; returns how many were removed
    pub fn cleanup_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries
            .retain(|_, inserted_at| now.duration_since(*inserted_at) <= self.window);
        before.saturating_sub(self.entries.len())
    }

    /// Spawn the periodic expiry sweep
    ///
    /// Runs once a minute, or once per window when the window is shorter.
    /// The returned handle is aborted by the owner on shutdown.
    pub fn spawn_cleanup(&self) -> JoinHandle<()> {
        let cache = self.clone();
        let interval = self.window.min(MAX_CLEANUP_INTERVAL);

        tokio::spawn(async move {
            let mut ticker = time::interval(interval);
            ticker.set_missed_tick_behavior(time::MissedTickBehavior::Skip);

            loop {
                ticker.tick().await;
                let removed = cache.cleanup_expired();
                if removed > 0 {
                    debug!(
                        removed = removed,
                        remaining = cache.len(),
                        "Dedup cache cleanup completed"
                    );
                }
            }
        })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

//! Per-session state and session identifier resolution
//!
//! Every packet belonging to one accounting session maps to the same
//! session identifier. The identifier is the key under which the session's
//! [`SessionState`] lives in a [`SessionStorage`], and it doubles as the
//! correlation id in logs.
//!
//! Session state is created implicitly by whichever module first writes it;
//! reading an id that was never written yields [`SessionError::NotFound`].

pub mod memory;

pub use memory::MemoryStorage;

use crate::config::SessionStorageConfig;
use async_trait::async_trait;
use radius_proto::{AttributeType, Packet};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;

/// Shortest Acct-Session-Id accepted verbatim as a session identifier
pub const MIN_ACCT_SESSION_ID_LEN: usize = 7;

/// CoA identifiers cycle through 0..=254
const COA_IDENTIFIER_MODULUS: u16 = 255;

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Session not found: {0}")]
    NotFound(String),
    #[error("Session storage error: {0}")]
    Storage(String),
    #[error("Unsupported session storage type: {0}")]
    UnsupportedStorage(String),
}

/// Durable per-session record
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionState {
    /// Accounting correlation value assigned when the session is authorized
    pub correlation_id: u64,
    /// Acct-Session-Id reported by the NAS
    #[serde(default)]
    pub acct_session_id: String,
    /// Calling-Station-Id (subscriber MAC) reported by the NAS
    #[serde(default)]
    pub calling_station_id: String,
    /// Identifier the next CoA/Disconnect-Request for this session will use
    #[serde(default)]
    pub next_coa_identifier: u8,
}

impl SessionState {
    /// Hand out the current CoA identifier and advance the counter
    pub fn take_coa_identifier(&mut self) -> u8 {
        let identifier = self.next_coa_identifier;
        self.next_coa_identifier = next_coa_identifier(identifier);
        identifier
    }
}

/// `(current + 1) mod 255`
pub fn next_coa_identifier(current: u8) -> u8 {
    ((current as u16 + 1) % COA_IDENTIFIER_MODULUS) as u8
}

/// Storage of [`SessionState`] keyed by session identifier
///
/// Implementations must be safe for concurrent use; the server does not
/// serialize access on their behalf.
#[async_trait]
pub trait SessionStorage: Send + Sync {
    async fn get(&self, session_id: &str) -> Result<SessionState, SessionError>;

    async fn set(&self, session_id: &str, state: SessionState) -> Result<(), SessionError>;

    /// Spawn a periodic purge of expired sessions, for storages that need one
    ///
    /// The owner aborts the returned handle on shutdown.
    fn spawn_cleanup(&self) -> Option<JoinHandle<()>> {
        None
    }
}

/// Storage accessor bound to a single session identifier
#[derive(Clone)]
pub struct SessionStateApi {
    session_id: String,
    storage: Arc<dyn SessionStorage>,
}

impl std::fmt::Debug for SessionStateApi {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionStateApi")
            .field("session_id", &self.session_id)
            .finish()
    }
}

impl SessionStateApi {
    pub fn new(session_id: impl Into<String>, storage: Arc<dyn SessionStorage>) -> Self {
        Self {
            session_id: session_id.into(),
            storage,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub async fn get(&self) -> Result<SessionState, SessionError> {
        self.storage.get(&self.session_id).await
    }

    pub async fn set(&self, state: SessionState) -> Result<(), SessionError> {
        self.storage.set(&self.session_id, state).await
    }
}

/// Build the storage selected by configuration
pub fn new_storage(config: &SessionStorageConfig) -> Result<Arc<dyn SessionStorage>, SessionError> {
    match config.storage_type.as_str() {
        "memory" => Ok(Arc::new(MemoryStorage::new(
            config.ttl_secs.map(Duration::from_secs),
        ))),
        other => Err(SessionError::UnsupportedStorage(other.to_string())),
    }
}

/// Session identifier of a request
///
/// An Acct-Session-Id of at least [`MIN_ACCT_SESSION_ID_LEN`] bytes is used
/// as is, with invalid UTF-8 replaced; otherwise the id is derived from the
/// station ids.
pub fn session_id(packet: &Packet) -> String {
    match packet.find_attribute(AttributeType::AcctSessionId.as_u8()) {
        Some(attr) if attr.value.len() >= MIN_ACCT_SESSION_ID_LEN => {
            String::from_utf8_lossy(&attr.value).into_owned()
        }
        _ => generate_session_id(packet),
    }
}

/// Session identifier derived from Calling-Station-Id and Called-Station-Id
pub fn generate_session_id(packet: &Packet) -> String {
    let called = packet
        .string_attribute(AttributeType::CalledStationId)
        .unwrap_or_default();
    let calling = packet
        .string_attribute(AttributeType::CallingStationId)
        .unwrap_or_default();
    compose_session_id(&calling, &called)
}

pub fn compose_session_id(calling: &str, called: &str) -> String {
    format!("{}__{}", calling, called)
}

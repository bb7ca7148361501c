//! Transport listeners
//!
//! A listener accepts work from one transport and feeds it through the
//! server's filters and its own module chain:
//!
//! - `udp`: RADIUS datagrams from NAS devices
//! - `rpc`: synchronous CoA/Disconnect calls from the control plane
//! - `push`: CoA/Disconnect events streamed by the control plane when it
//!   cannot reach the NAS directly
//!
//! All three share a [`ListenerCore`] holding the handler, counters,
//! readiness and shutdown plumbing.

pub mod coa_event;
pub mod push;
pub mod rpc;
pub mod udp;

pub use push::PushListener;
pub use rpc::RpcListener;
pub use udp::UdpListener;

use crate::config::{Config, ConfigError, ListenerConfig};
use crate::filters::FilterError;
use crate::metrics::{Counters, ListenerCounters};
use crate::modules::{Middleware, ModuleError};
use crate::server::ServerContext;
use crate::session::SessionError;
use async_trait::async_trait;
use radius_proto::PacketError;
use std::net::SocketAddr;
use std::sync::atomic::AtomicU64;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

#[derive(Error, Debug)]
pub enum ListenerError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("Listener {0} is not initialized")]
    NotInitialized(String),
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Packet error: {0}")]
    Packet(#[from] PacketError),
    #[error("Session error: {0}")]
    Session(#[from] SessionError),
    #[error("Handler error: {0}")]
    Handler(#[from] ModuleError),
    #[error("Rejected by filter: {0}")]
    Filtered(#[from] FilterError),
    #[error("got nil response")]
    NilResponse,
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
    #[error("Invalid event: {0}")]
    InvalidEvent(String),
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("Shutdown did not complete within {0:?}")]
    ShutdownTimeout(Duration),
}

/// Lifecycle contract shared by every transport
#[async_trait]
pub trait Listener: Send + Sync {
    fn name(&self) -> &str;

    /// Read transport settings and attach the server; must not block
    fn init(
        &mut self,
        server: Arc<ServerContext>,
        config: &Config,
        listener_config: &ListenerConfig,
        counters: Arc<Counters>,
    ) -> Result<(), ListenerError>;

    /// Start serving in the background and return
    ///
    /// Readiness is reported exactly once on the channel returned by
    /// [`Listener::ready`]: `true` once serving, `false` if the transport
    /// could not be set up.
    async fn listen_and_serve(&self) -> Result<(), ListenerError>;

    /// Stop taking new work and wait, up to `timeout`, for the accept loop
    /// to wind down
    async fn shutdown(&self, timeout: Duration) -> Result<(), ListenerError>;

    /// One-shot readiness receiver; `None` once taken
    fn ready(&self) -> Option<oneshot::Receiver<bool>>;

    /// Counter of retransmissions dropped by this listener
    fn dup_dropped(&self) -> Arc<AtomicU64>;

    fn handler(&self) -> Option<Middleware>;

    fn set_handler(&mut self, handler: Middleware);

    /// Bound address, once serving on a socket
    fn local_addr(&self) -> Option<SocketAddr> {
        None
    }
}

/// Instantiate a listener by its configured type; `None` for unknown types
pub fn new_listener(listener_config: &ListenerConfig) -> Option<Box<dyn Listener>> {
    let name = listener_config.name.as_str();
    match listener_config.listener_type.as_str() {
        "udp" => Some(Box::new(UdpListener::new(name))),
        "rpc" => Some(Box::new(RpcListener::new(name))),
        "push" | "sse" => Some(Box::new(PushListener::new(name))),
        _ => None,
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// State common to all listeners
pub struct ListenerCore {
    name: String,
    server: Option<Arc<ServerContext>>,
    handler: Option<Middleware>,
    counters: Arc<ListenerCounters>,
    ready_tx: Mutex<Option<oneshot::Sender<bool>>>,
    ready_rx: Mutex<Option<oneshot::Receiver<bool>>>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for ListenerCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenerCore")
            .field("name", &self.name)
            .field("initialized", &self.server.is_some())
            .field("has_handler", &self.handler.is_some())
            .finish()
    }
}

impl ListenerCore {
    pub fn new(name: impl Into<String>) -> Self {
        let (ready_tx, ready_rx) = oneshot::channel();
        let (shutdown_tx, _) = watch::channel(false);

        Self {
            name: name.into(),
            server: None,
            handler: None,
            counters: Arc::new(ListenerCounters::default()),
            ready_tx: Mutex::new(Some(ready_tx)),
            ready_rx: Mutex::new(Some(ready_rx)),
            shutdown_tx,
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Attach the server and this listener's counters
    pub fn attach(&mut self, server: Arc<ServerContext>, counters: &Counters) {
        self.counters = counters.listener(&self.name);
        self.server = Some(server);
    }

    pub fn server(&self) -> Result<Arc<ServerContext>, ListenerError> {
        self.server
            .clone()
            .ok_or_else(|| ListenerError::NotInitialized(self.name.clone()))
    }

    pub fn handler(&self) -> Option<Middleware> {
        self.handler.clone()
    }

    /// Handler, or an error when the server never installed one
    pub fn require_handler(&self) -> Result<Middleware, ListenerError> {
        self.handler
            .clone()
            .ok_or_else(|| ListenerError::NotInitialized(self.name.clone()))
    }

    pub fn set_handler(&mut self, handler: Middleware) {
        self.handler = Some(handler);
    }

    pub fn counters(&self) -> Arc<ListenerCounters> {
        Arc::clone(&self.counters)
    }

    pub fn dup_dropped(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.counters.duplicates)
    }

    pub fn ready(&self) -> Option<oneshot::Receiver<bool>> {
        lock(&self.ready_rx).take()
    }

    /// Report readiness; later calls are ignored
    pub fn signal_ready(&self, ready: bool) {
        if let Some(tx) = lock(&self.ready_tx).take() {
            debug!(listener = %self.name, ready = ready, "Listener readiness");
            let _ = tx.send(ready);
        }
    }

    /// Receiver that flips to `true` when shutdown starts
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown_tx.borrow()
    }

    /// Keep track of a long-running task so shutdown can wait for it
    pub fn track(&self, task: JoinHandle<()>) {
        lock(&self.tasks).push(task);
    }

    pub async fn shutdown(&self, timeout: Duration) -> Result<(), ListenerError> {
        self.shutdown_tx.send_replace(true);

        let tasks: Vec<JoinHandle<()>> = lock(&self.tasks).drain(..).collect();
        let aborts: Vec<_> = tasks.iter().map(JoinHandle::abort_handle).collect();

        match tokio::time::timeout(timeout, futures::future::join_all(tasks)).await {
            Ok(_) => {
                debug!(listener = %self.name, "Listener stopped");
                Ok(())
            }
            Err(_) => {
                warn!(listener = %self.name, "Listener did not stop in time, aborting");
                aborts.iter().for_each(|abort| abort.abort());
                Err(ListenerError::ShutdownTimeout(timeout))
            }
        }
    }
}

/// Resolves once `signal` flips to `true` or its sender is gone
pub async fn wait_for_shutdown(signal: &mut watch::Receiver<bool>) {
    let _ = signal.wait_for(|stop| *stop).await;
}

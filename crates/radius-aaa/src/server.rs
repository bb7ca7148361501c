//! Server orchestration
//!
//! [`Server::new`] loads and initializes the configured filters, builds
//! every listener with its composed module chain and fails as a whole if any
//! filter or module cannot be loaded or initialized. [`Server::start`] runs
//! the listeners, reports readiness and then waits for [`Server::stop`].

use crate::config::{ClientTable, Config, ConfigError};
use crate::dedup::DedupCache;
use crate::filters::{Filter, FilterError};
use crate::listener::{self, Listener, ListenerError};
use crate::loader::{LoadError, Loader};
use crate::metrics::{self, Counters};
use crate::modules::{self, Module, ModuleError, RequestContext};
use crate::session::{self, SessionError, SessionState, SessionStateApi, SessionStorage};
use radius_proto::Packet;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// How long `stop` waits for each listener
const LISTENER_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Error, Debug)]
pub enum ServerError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("Failed to load filter {name}: {source}")]
    FilterLoad {
        name: String,
        #[source]
        source: LoadError,
    },
    #[error("Failed to initialize filter {name}: {source}")]
    FilterInit {
        name: String,
        #[source]
        source: FilterError,
    },
    #[error("Failed to load module {name}: {source}")]
    ModuleLoad {
        name: String,
        #[source]
        source: LoadError,
    },
    #[error("Failed to initialize module {name}: {source}")]
    ModuleInit {
        name: String,
        #[source]
        source: ModuleError,
    },
    #[error("Failed to initialize listener {name}: {source}")]
    ListenerInit {
        name: String,
        #[source]
        source: ListenerError,
    },
    #[error("Session storage error: {0}")]
    Session(#[from] SessionError),
}

/// Shared state every listener reaches through its `Arc`
pub struct ServerContext {
    config: Config,
    clients: ClientTable,
    filters: Vec<(String, Arc<dyn Filter>)>,
    dedup: DedupCache,
    storage: Arc<dyn SessionStorage>,
}

impl ServerContext {
    pub fn new(
        config: Config,
        filters: Vec<(String, Arc<dyn Filter>)>,
        storage: Arc<dyn SessionStorage>,
    ) -> Result<Self, ConfigError> {
        let clients = ClientTable::new(&config.clients)?;
        let dedup = DedupCache::new(config.dedup_window());
        Ok(Self {
            config,
            clients,
            filters,
            dedup,
            storage,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn dedup(&self) -> &DedupCache {
        &self.dedup
    }

    pub fn clients(&self) -> &ClientTable {
        &self.clients
    }

    /// Client-specific secret if one is configured, else the server secret
    pub fn secret_for_client(&self, source_ip: IpAddr) -> &[u8] {
        self.clients
            .find(source_ip)
            .and_then(|client| client.secret.as_deref())
            .unwrap_or(self.config.secret.as_str())
            .as_bytes()
    }

    pub fn storage(&self) -> Arc<dyn SessionStorage> {
        Arc::clone(&self.storage)
    }

    /// Context for a request that belongs to the packet's session
    pub fn session_context(&self, listener: &str, packet: &Packet) -> RequestContext {
        let api = SessionStateApi::new(session::session_id(packet), self.storage());
        RequestContext::new(listener, Some(api))
    }

    /// Run every filter in order, stopping at the first rejection
    pub async fn run_filters(
        &self,
        ctx: &RequestContext,
        listener: &str,
        request: &modules::Request,
    ) -> Result<(), FilterError> {
        for (name, filter) in &self.filters {
            if let Err(e) = filter.process(ctx, listener, request).await {
                debug!(filter = %name, error = %e, "Filter rejected request");
                return Err(e);
            }
        }
        Ok(())
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct Server {
    context: Arc<ServerContext>,
    listeners: Vec<Arc<dyn Listener>>,
    counters: Arc<Counters>,
    ready_tx: Mutex<Option<oneshot::Sender<bool>>>,
    ready_rx: Mutex<Option<oneshot::Receiver<bool>>>,
    terminate: watch::Sender<bool>,
    background: Mutex<Vec<JoinHandle<()>>>,
}

impl Server {
    /// Build the server from configuration
    ///
    /// Filters and modules are resolved through `loader`. A listener of an
    /// unknown type is logged and skipped; every other failure aborts.
    pub fn new(config: Config, loader: &dyn Loader) -> Result<Self, ServerError> {
        config.validate()?;
        if config.uses_default_secret() {
            warn!("Using the default shared secret; set `secret` in the configuration");
        }
        let counters = Arc::new(Counters::new());

        let mut filters: Vec<(String, Arc<dyn Filter>)> = Vec::with_capacity(config.filters.len());
        for name in &config.filters {
            let mut filter = loader
                .load_filter(name)
                .map_err(|source| ServerError::FilterLoad {
                    name: name.clone(),
                    source,
                })?;
            filter
                .init(&config)
                .map_err(|source| ServerError::FilterInit {
                    name: name.clone(),
                    source,
                })?;
            debug!(filter = %name, "Filter loaded");
            filters.push((name.clone(), Arc::from(filter)));
        }

        let storage = session::new_storage(&config.session_storage)?;
        let context = Arc::new(ServerContext::new(config.clone(), filters, storage)?);

        let mut listeners: Vec<Arc<dyn Listener>> = Vec::with_capacity(config.listeners.len());
        for listener_config in &config.listeners {
            let Some(mut listener) = listener::new_listener(listener_config) else {
                error!(
                    listener = %listener_config.name,
                    listener_type = %listener_config.listener_type,
                    "Unknown listener type, skipping"
                );
                continue;
            };

            let mut chain: Vec<(String, Arc<dyn Module>)> =
                Vec::with_capacity(listener_config.modules.len());
            for descriptor in &listener_config.modules {
                let mut module =
                    loader
                        .load_module(&descriptor.name)
                        .map_err(|source| ServerError::ModuleLoad {
                            name: descriptor.name.clone(),
                            source,
                        })?;
                module
                    .init(&descriptor.config)
                    .map_err(|source| ServerError::ModuleInit {
                        name: descriptor.name.clone(),
                        source,
                    })?;
                chain.push((descriptor.name.clone(), Arc::from(module)));
            }
            let handler = modules::compose_chain(&listener_config.name, chain, &counters);

            listener
                .init(
                    Arc::clone(&context),
                    &config,
                    listener_config,
                    Arc::clone(&counters),
                )
                .map_err(|source| ServerError::ListenerInit {
                    name: listener_config.name.clone(),
                    source,
                })?;
            listener.set_handler(handler);

            info!(
                listener = %listener_config.name,
                listener_type = %listener_config.listener_type,
                modules = listener_config.modules.len(),
                "Listener configured"
            );
            listeners.push(Arc::from(listener));
        }

        let (ready_tx, ready_rx) = oneshot::channel();
        let (terminate, _) = watch::channel(false);

        Ok(Self {
            context,
            listeners,
            counters,
            ready_tx: Mutex::new(Some(ready_tx)),
            ready_rx: Mutex::new(Some(ready_rx)),
            terminate,
            background: Mutex::new(Vec::new()),
        })
    }

    pub fn config(&self) -> &Config {
        self.context.config()
    }

    pub fn counters(&self) -> Arc<Counters> {
        Arc::clone(&self.counters)
    }

    pub fn listeners(&self) -> &[Arc<dyn Listener>] {
        &self.listeners
    }

    pub fn listener(&self, name: &str) -> Option<Arc<dyn Listener>> {
        self.listeners
            .iter()
            .find(|listener| listener.name() == name)
            .cloned()
    }

    /// Address a listener is bound to, once it serves
    pub fn local_addr(&self, name: &str) -> Option<SocketAddr> {
        self.listener(name).and_then(|listener| listener.local_addr())
    }

    /// One-shot server readiness; `None` once taken
    pub fn ready(&self) -> Option<oneshot::Receiver<bool>> {
        lock(&self.ready_rx).take()
    }

    /// Run every listener, report readiness, then wait for [`Server::stop`]
    ///
    /// Readiness is `false` if any listener failed to start; listeners that
    /// did start keep serving either way.
    pub async fn start(&self) {
        self.start_background().await;

        let starts: Vec<_> = self
            .listeners
            .iter()
            .map(|listener| {
                let listener = Arc::clone(listener);
                tokio::spawn(async move {
                    match listener.listen_and_serve().await {
                        Ok(()) => true,
                        Err(e) => {
                            error!(listener = %listener.name(), error = %e, "Listener failed to start");
                            false
                        }
                    }
                })
            })
            .collect();

        let mut ready = true;
        for start in starts {
            ready &= start.await.unwrap_or(false);
        }
        for listener in &self.listeners {
            let listener_ready = match listener.ready() {
                Some(rx) => rx.await.unwrap_or(false),
                None => false,
            };
            if !listener_ready {
                warn!(listener = %listener.name(), "Listener not ready");
            }
            ready &= listener_ready;
        }

        if ready {
            info!(listeners = self.listeners.len(), "Server ready");
        } else {
            error!("Server started with failed listeners");
        }
        if let Some(tx) = lock(&self.ready_tx).take() {
            let _ = tx.send(ready);
        }

        let mut terminate = self.terminate.subscribe();
        let _ = terminate.wait_for(|stop| *stop).await;
        info!("Server terminated");
    }

    /// Start in the background and return the readiness outcome
    pub async fn start_and_wait(self: &Arc<Self>) -> bool {
        let Some(ready) = self.ready() else {
            warn!("Server readiness already taken");
            return false;
        };

        let server = Arc::clone(self);
        tokio::spawn(async move { server.start().await });

        ready.await.unwrap_or(false)
    }

    async fn start_background(&self) {
        let mut background = Vec::new();
        background.push(self.context.dedup().spawn_cleanup());
        background.extend(self.context.storage().spawn_cleanup());

        match self.context.config().metrics_socket_addr() {
            Ok(Some(addr)) => match metrics::start_metrics_server(self.counters(), addr).await {
                Ok(handle) => background.push(handle),
                Err(e) => error!(address = %addr, error = %e, "Failed to start metrics server"),
            },
            Ok(None) => {}
            Err(e) => error!(error = %e, "Invalid metrics address"),
        }

        lock(&self.background).extend(background);
    }

    /// Shut down every listener and release [`Server::start`]
    pub async fn stop(&self) {
        for listener in &self.listeners {
            if let Err(e) = listener.shutdown(LISTENER_SHUTDOWN_TIMEOUT).await {
                warn!(listener = %listener.name(), error = %e, "Listener shutdown failed");
            }
        }

        for task in lock(&self.background).drain(..) {
            task.abort();
        }

        self.terminate.send_replace(true);
        info!("Server stopped");
    }

    /// Retransmissions dropped across all listeners
    pub fn dropped_count(&self) -> u64 {
        self.listeners
            .iter()
            .map(|listener| listener.dup_dropped().load(Ordering::Relaxed))
            .sum()
    }

    pub fn session_id(&self, packet: &Packet) -> String {
        session::session_id(packet)
    }

    pub fn generate_session_id(&self, packet: &Packet) -> String {
        session::generate_session_id(packet)
    }

    pub fn compose_session_id(&self, calling: &str, called: &str) -> String {
        session::compose_session_id(calling, called)
    }

    /// Stored state of `session_id`
    pub async fn session_state(&self, session_id: &str) -> Result<SessionState, SessionError> {
        self.context.storage().get(session_id).await
    }
}

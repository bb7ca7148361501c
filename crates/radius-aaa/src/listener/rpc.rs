//! Synchronous CoA/Disconnect over HTTP
//!
//! The control plane calls `POST /authorization/change` or
//! `POST /authorization/disconnect` with the target session. The listener
//! synthesizes the CoA/Disconnect-Request from the stored session state,
//! assigns it the session's next CoA identifier, runs the module chain and
//! answers with ACK or NAK. Failures are returned to the caller as errors.
//!
//! ```text
//! POST /authorization/change
//! {"ctx": {"session_id": "...", "mac_addr": "aa-bb-cc-dd-ee-ff"}}
//!
//! 200 {"coa_response_type": "ACK", "ctx": {...}}
//! 500 {"error": "got nil response"}
//! ```

use super::{Listener, ListenerCore, ListenerError, wait_for_shutdown};
use crate::config::{Config, ListenerConfig};
use crate::metrics::{Counters, ListenerCounters};
use crate::modules::{Middleware, Request, RequestContext};
use crate::server::ServerContext;
use crate::session::SessionStateApi;
use async_trait::async_trait;
use axum::{
    Json, Router,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::post,
};
use dashmap::DashMap;
use radius_proto::{Attribute, AttributeType, Code, Packet, calculate_request_authenticator};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::net::SocketAddr;
use std::sync::atomic::AtomicU64;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::sync::{Mutex, oneshot};
use tower_http::trace::TraceLayer;
use tracing::{Instrument, debug, info, warn};

/// Session the control plane wants to act on
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionContext {
    pub session_id: String,
    #[serde(default)]
    pub imsi: String,
    #[serde(default)]
    pub msisdn: String,
    /// Subscriber MAC, sent as Calling-Station-Id
    #[serde(default)]
    pub mac_addr: String,
    #[serde(default)]
    pub apn: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoaRequest {
    pub ctx: SessionContext,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum CoaResponseType {
    Ack,
    Nak,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoaResponse {
    pub coa_response_type: CoaResponseType,
    pub ctx: SessionContext,
}

type SessionLocks = DashMap<String, Arc<Mutex<()>>>;

/// Claim on one session's lock, removed from the map by its last holder
struct SessionLock<'a> {
    locks: &'a SessionLocks,
    session_id: &'a str,
    lock: Arc<Mutex<()>>,
}

impl<'a> SessionLock<'a> {
    fn new(locks: &'a SessionLocks, session_id: &'a str) -> Self {
        let lock = Arc::clone(locks.entry(session_id.to_string()).or_default().value());
        Self {
            locks,
            session_id,
            lock,
        }
    }
}

impl Drop for SessionLock<'_> {
    fn drop(&mut self) {
        // The map and this claim are the only references left
        self.locks.remove_if(self.session_id, |_, lock| {
            Arc::ptr_eq(lock, &self.lock) && Arc::strong_count(lock) == 2
        });
    }
}

/// Request synthesis and dispatch shared by the HTTP routes and direct calls
#[derive(Clone)]
struct CoaService {
    listener: String,
    server: Arc<ServerContext>,
    handler: Middleware,
    counters: Arc<ListenerCounters>,
    session_locks: Arc<SessionLocks>,
}

impl CoaService {
    async fn handle(&self, code: Code, request: CoaRequest) -> Result<CoaResponse, ListenerError> {
        ListenerCounters::incr(&self.counters.requests);

        let result = self.dispatch(code, &request.ctx).await;
        match &result {
            Ok(_) => ListenerCounters::incr(&self.counters.replies),
            Err(e) => {
                ListenerCounters::incr(&self.counters.no_reply);
                warn!(
                    listener = %self.listener,
                    session_id = %request.ctx.session_id,
                    code = ?code,
                    error = %e,
                    "CoA request failed"
                );
            }
        }

        result.map(|coa_response_type| CoaResponse {
            coa_response_type,
            ctx: request.ctx,
        })
    }

    async fn dispatch(
        &self,
        code: Code,
        session: &SessionContext,
    ) -> Result<CoaResponseType, ListenerError> {
        if session.session_id.is_empty() {
            return Err(ListenerError::InvalidRequest("missing session_id".to_string()));
        }

        // Identifier allocation and the state writes stay ordered per session
        let claim = SessionLock::new(&self.session_locks, &session.session_id);
        let _guard = claim.lock.lock().await;

        let api = SessionStateApi::new(&session.session_id, self.server.storage());
        let mut state = api.get().await?;

        let secret = self.server.config().secret.as_bytes().to_vec();
        let mut packet = Packet::new(code, state.take_coa_identifier(), [0u8; 16]);
        packet.set_attribute(Attribute::string(
            AttributeType::AcctSessionId.as_u8(),
            state.acct_session_id.as_str(),
        )?);
        if !session.mac_addr.is_empty() {
            packet.set_attribute(Attribute::string(
                AttributeType::CallingStationId.as_u8(),
                session.mac_addr.as_str(),
            )?);
        }
        packet.authenticator = calculate_request_authenticator(&packet, &secret)?;
        api.set(state.clone()).await?;

        let ctx = Arc::new(RequestContext::new(&self.listener, Some(api.clone())));
        let span = ctx.span.clone();
        let identifier = packet.identifier;
        let request = Request::new(packet, secret);

        let response = async {
            debug!(code = ?code, identifier = identifier, "Dispatching CoA request");
            self.server
                .run_filters(&ctx, &self.listener, &request)
                .await
                .inspect_err(|_| ListenerCounters::incr(&self.counters.filtered))?;
            Ok::<_, ListenerError>((self.handler)(ctx, request).await?)
        }
        .instrument(span)
        .await?
        .ok_or(ListenerError::NilResponse)?;

        let response_type = match response.code {
            Code::CoaAck | Code::DisconnectAck => CoaResponseType::Ack,
            _ => CoaResponseType::Nak,
        };

        api.set(state).await?;
        Ok(response_type)
    }
}

#[derive(Debug)]
pub struct RpcListener {
    core: ListenerCore,
    bind_addr: Option<SocketAddr>,
    local_addr: OnceLock<SocketAddr>,
    session_locks: Arc<SessionLocks>,
}

impl RpcListener {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            core: ListenerCore::new(name),
            bind_addr: None,
            local_addr: OnceLock::new(),
            session_locks: Arc::new(DashMap::new()),
        }
    }

    fn service(&self) -> Result<CoaService, ListenerError> {
        Ok(CoaService {
            listener: self.name().to_string(),
            server: self.core.server()?,
            handler: self.core.require_handler()?,
            counters: self.core.counters(),
            session_locks: Arc::clone(&self.session_locks),
        })
    }

    /// Sessions with a CoA call in flight
    pub fn active_session_locks(&self) -> usize {
        self.session_locks.len()
    }

    /// Send a CoA-Request for the session
    pub async fn change(&self, request: CoaRequest) -> Result<CoaResponse, ListenerError> {
        self.service()?.handle(Code::CoaRequest, request).await
    }

    /// Send a Disconnect-Request for the session
    pub async fn disconnect(&self, request: CoaRequest) -> Result<CoaResponse, ListenerError> {
        self.service()?.handle(Code::DisconnectRequest, request).await
    }
}

impl IntoResponse for ListenerError {
    fn into_response(self) -> Response {
        let status = match self {
            ListenerError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            ListenerError::Filtered(_) => StatusCode::FORBIDDEN,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

async fn change_handler(
    State(service): State<CoaService>,
    Json(request): Json<CoaRequest>,
) -> Result<Json<CoaResponse>, ListenerError> {
    service.handle(Code::CoaRequest, request).await.map(Json)
}

async fn disconnect_handler(
    State(service): State<CoaService>,
    Json(request): Json<CoaRequest>,
) -> Result<Json<CoaResponse>, ListenerError> {
    service.handle(Code::DisconnectRequest, request).await.map(Json)
}

fn router(service: CoaService) -> Router {
    Router::new()
        .route("/authorization/change", post(change_handler))
        .route("/authorization/disconnect", post(disconnect_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(service)
}

#[async_trait]
impl Listener for RpcListener {
    fn name(&self) -> &str {
        self.core.name()
    }

    fn init(
        &mut self,
        server: Arc<ServerContext>,
        _config: &Config,
        listener_config: &ListenerConfig,
        counters: Arc<Counters>,
    ) -> Result<(), ListenerError> {
        self.bind_addr = Some(listener_config.bind_addr()?);
        self.core.attach(server, &counters);
        Ok(())
    }

    async fn listen_and_serve(&self) -> Result<(), ListenerError> {
        let (service, bind_addr) = match (self.service(), self.bind_addr) {
            (Ok(service), Some(bind_addr)) => (service, bind_addr),
            _ => {
                self.core.signal_ready(false);
                return Err(ListenerError::NotInitialized(self.name().to_string()));
            }
        };

        let listener = match tokio::net::TcpListener::bind(bind_addr).await {
            Ok(listener) => listener,
            Err(source) => {
                self.core.signal_ready(false);
                return Err(ListenerError::Bind {
                    addr: bind_addr,
                    source,
                });
            }
        };
        let local_addr = listener.local_addr()?;
        let _ = self.local_addr.set(local_addr);
        info!(listener = %self.name(), address = %local_addr, "RPC listener serving");

        let name = self.name().to_string();
        let mut shutdown = self.core.shutdown_signal();
        let app = router(service);

        self.core.track(tokio::spawn(async move {
            let serve = axum::serve(listener, app)
                .with_graceful_shutdown(async move { wait_for_shutdown(&mut shutdown).await });
            if let Err(e) = serve.await {
                warn!(listener = %name, error = %e, "RPC server failed");
            }
            debug!(listener = %name, "RPC server stopped");
        }));

        self.core.signal_ready(true);
        Ok(())
    }

    async fn shutdown(&self, timeout: Duration) -> Result<(), ListenerError> {
        self.core.shutdown(timeout).await
    }

    fn ready(&self) -> Option<oneshot::Receiver<bool>> {
        self.core.ready()
    }

    fn dup_dropped(&self) -> Arc<AtomicU64> {
        self.core.dup_dropped()
    }

    fn handler(&self) -> Option<Middleware> {
        self.core.handler()
    }

    fn set_handler(&mut self, handler: Middleware) {
        self.core.set_handler(handler);
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr.get().copied()
    }
}

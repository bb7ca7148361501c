//! Request modules and chain composition
//!
//! A listener's modules form a middleware chain. Each module receives the
//! request together with a `next` continuation that runs the rest of the
//! chain; it may rewrite the request, answer on its own, delegate, or
//! post-process what `next` returned. The first configured module is the
//! outermost one and the chain ends in a terminal handler that answers
//! nothing.

pub mod loopback;
pub mod session_tracker;

pub use loopback::LoopbackModule;
pub use session_tracker::SessionTrackerModule;

use crate::config::ModuleConfig;
use crate::metrics::Counters;
use crate::session::{SessionError, SessionStateApi};
use async_trait::async_trait;
use radius_proto::{Attribute, Code, Packet, PacketError, calculate_response_authenticator};
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use thiserror::Error;
use tracing::{Instrument, Span, debug, warn};

#[derive(Error, Debug)]
pub enum ModuleError {
    #[error("Module configuration error: {0}")]
    Config(String),
    #[error("Session error: {0}")]
    Session(#[from] SessionError),
    #[error("Packet error: {0}")]
    Packet(#[from] PacketError),
    #[error("{0}")]
    Failed(String),
}

/// An inbound request as seen by filters and modules
#[derive(Debug, Clone)]
pub struct Request {
    pub packet: Packet,
    /// Shared secret the request was (or will be) authenticated with
    pub secret: Vec<u8>,
    /// Source of the datagram; `None` for requests synthesized by the
    /// control plane
    pub remote_addr: Option<SocketAddr>,
}

impl Request {
    pub fn new(packet: Packet, secret: impl Into<Vec<u8>>) -> Self {
        Self {
            packet,
            secret: secret.into(),
            remote_addr: None,
        }
    }

    pub fn with_remote_addr(mut self, remote_addr: SocketAddr) -> Self {
        self.remote_addr = Some(remote_addr);
        self
    }

    pub fn code(&self) -> Code {
        self.packet.code
    }

    pub fn identifier(&self) -> u8 {
        self.packet.identifier
    }
}

/// Reply produced by a module chain
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub code: Code,
    pub attributes: Vec<Attribute>,
}

impl Response {
    pub fn new(code: Code) -> Self {
        Self {
            code,
            attributes: Vec::new(),
        }
    }

    pub fn with_attribute(mut self, attribute: Attribute) -> Self {
        self.attributes.push(attribute);
        self
    }

    /// Reply packet with the request's identifier and a zero authenticator
    /// the transport fills in
    pub fn to_packet(&self, identifier: u8) -> Packet {
        let mut packet = Packet::new(self.code, identifier, [0u8; 16]);
        packet.attributes = self.attributes.clone();
        packet
    }

    /// Reply packet carrying the response authenticator for the request
    pub fn signed_packet(
        &self,
        identifier: u8,
        request_authenticator: &[u8; 16],
        secret: &[u8],
    ) -> Result<Packet, PacketError> {
        let mut packet = self.to_packet(identifier);
        packet.authenticator =
            calculate_response_authenticator(&packet, request_authenticator, secret)?;
        Ok(packet)
    }
}

/// Per-request context handed through filters and modules
#[derive(Debug)]
pub struct RequestContext {
    /// Correlation id, unique per request
    pub request_id: String,
    /// Span the request is processed in
    pub span: Span,
    /// Resolved session identifier; `None` when the transport has no
    /// session correlation
    pub session_id: Option<String>,
    /// Session storage bound to `session_id`
    pub session_storage: Option<SessionStateApi>,
}

impl RequestContext {
    pub fn new(listener: &str, session_storage: Option<SessionStateApi>) -> Self {
        let request_id = uuid::Uuid::new_v4().to_string();
        let session_id = session_storage
            .as_ref()
            .map(|api| api.session_id().to_string());
        let span = tracing::info_span!(
            "request",
            listener = %listener,
            request_id = %request_id,
            session_id = session_id.as_deref().unwrap_or(""),
        );

        Self {
            request_id,
            span,
            session_id,
            session_storage,
        }
    }

    /// Session accessor, or an error for contexts without session correlation
    pub fn session(&self) -> Result<&SessionStateApi, ModuleError> {
        self.session_storage
            .as_ref()
            .ok_or_else(|| ModuleError::Failed("request has no session context".to_string()))
    }
}

pub type HandlerResult = Result<Option<Response>, ModuleError>;

pub type HandlerFuture = Pin<Box<dyn Future<Output = HandlerResult> + Send>>;

/// A composed request handler: the rest of a module chain
pub type Middleware = Arc<dyn Fn(Arc<RequestContext>, Request) -> HandlerFuture + Send + Sync>;

/// One stage of a listener's request pipeline
#[async_trait]
pub trait Module: Send + Sync {
    /// Apply module configuration; called once before the server starts
    fn init(&mut self, config: &ModuleConfig) -> Result<(), ModuleError>;

    /// Process `request`, calling `next` to continue the chain
    async fn handle(
        &self,
        ctx: Arc<RequestContext>,
        request: Request,
        next: Middleware,
    ) -> HandlerResult;
}

/// End of every chain: answers nothing
pub fn terminal_handler() -> Middleware {
    Arc::new(|_ctx: Arc<RequestContext>, _request: Request| -> HandlerFuture {
        Box::pin(async { Ok(None) })
    })
}

/// Compose `modules` into a single handler
///
/// Modules are wrapped from last to first so that `modules[0]` runs first and
/// its `next` reaches `modules[1]`. Every wrap records the outcome of its
/// module under (`listener`, module name).
pub fn compose_chain(
    listener: &str,
    modules: Vec<(String, Arc<dyn Module>)>,
    counters: &Counters,
) -> Middleware {
    modules
        .into_iter()
        .rev()
        .fold(terminal_handler(), |next, (name, module)| {
            let module_counters = counters.module(listener, &name);
            let wrapped: Middleware = Arc::new(
                move |ctx: Arc<RequestContext>, request: Request| -> HandlerFuture {
                    let module = Arc::clone(&module);
                    let next = Arc::clone(&next);
                    let module_counters = Arc::clone(&module_counters);
                    let name = name.clone();
                    let span = ctx.span.clone();

                    Box::pin(
                        async move {
                            let result = module.handle(ctx, request, next).await;
                            match &result {
                                Ok(_) => {
                                    module_counters.record(true);
                                    debug!(module = %name, "Module completed");
                                }
                                Err(e) => {
                                    module_counters.record(false);
                                    warn!(module = %name, error = %e, "Module failed");
                                }
                            }
                            result
                        }
                        .instrument(span),
                    )
                },
            );
            wrapped
        })
}

//! RADIUS over UDP
//!
//! Every datagram is handled on its own task: decode, drop retransmissions,
//! resolve the session, run filters and the module chain, then answer the
//! sender with the chain's reply signed by the client's secret. Anything
//! that goes wrong on the way ends the request without a reply.

use super::{Listener, ListenerCore, ListenerError, wait_for_shutdown};
use crate::config::{Config, ListenerConfig};
use crate::dedup::dedup_key;
use crate::metrics::{Counters, ListenerCounters};
use crate::modules::{Middleware, Request};
use crate::server::ServerContext;
use async_trait::async_trait;
use radius_proto::Packet;
use std::net::SocketAddr;
use std::sync::atomic::AtomicU64;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::oneshot;
use tracing::{Instrument, debug, error, info, warn};

#[derive(Debug)]
pub struct UdpListener {
    core: ListenerCore,
    bind_addr: Option<SocketAddr>,
    local_addr: OnceLock<SocketAddr>,
}

impl UdpListener {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            core: ListenerCore::new(name),
            bind_addr: None,
            local_addr: OnceLock::new(),
        }
    }
}

/// Everything a datagram task needs
struct Worker {
    listener: String,
    server: Arc<ServerContext>,
    handler: Middleware,
    counters: Arc<ListenerCounters>,
    socket: Arc<UdpSocket>,
}

impl Worker {
    async fn handle_datagram(self: Arc<Self>, data: Vec<u8>, remote_addr: SocketAddr) {
        ListenerCounters::incr(&self.counters.requests);

        let packet = match Packet::decode(&data) {
            Ok(packet) => packet,
            Err(e) => {
                warn!(listener = %self.listener, client_addr = %remote_addr, error = %e, "Dropping malformed packet");
                return;
            }
        };

        let key = dedup_key(&remote_addr, packet.identifier);
        if self.server.dedup().check_and_insert(key) {
            ListenerCounters::incr(&self.counters.duplicates);
            debug!(
                listener = %self.listener,
                client_addr = %remote_addr,
                identifier = packet.identifier,
                "Dropping duplicate request"
            );
            return;
        }

        let secret = self.server.secret_for_client(remote_addr.ip()).to_vec();
        let ctx = Arc::new(self.server.session_context(&self.listener, &packet));
        let span = ctx.span.clone();

        async move {
            let identifier = packet.identifier;
            let request_authenticator = packet.authenticator;
            let request = Request::new(packet, secret.clone()).with_remote_addr(remote_addr);

            debug!(code = ?request.code(), client_addr = %remote_addr, "Received RADIUS packet");

            if let Err(e) = self
                .server
                .run_filters(&ctx, &self.listener, &request)
                .await
            {
                ListenerCounters::incr(&self.counters.filtered);
                warn!(error = %e, "Request rejected by filter");
                return;
            }

            let response = match (self.handler)(ctx, request).await {
                Ok(Some(response)) => response,
                Ok(None) => {
                    ListenerCounters::incr(&self.counters.no_reply);
                    warn!("Module chain returned no response");
                    return;
                }
                Err(e) => {
                    ListenerCounters::incr(&self.counters.no_reply);
                    warn!(error = %e, "Failed to handle request");
                    return;
                }
            };

            let reply = match response
                .signed_packet(identifier, &request_authenticator, &secret)
                .and_then(|reply| reply.encode())
            {
                Ok(reply) => reply,
                Err(e) => {
                    ListenerCounters::incr(&self.counters.no_reply);
                    error!(error = %e, "Failed to encode response");
                    return;
                }
            };

            match self.socket.send_to(&reply, remote_addr).await {
                Ok(_) => {
                    ListenerCounters::incr(&self.counters.replies);
                    debug!(code = ?response.code, client_addr = %remote_addr, "Sent RADIUS response");
                }
                Err(e) => warn!(error = %e, client_addr = %remote_addr, "Failed to send response"),
            }
        }
        .instrument(span)
        .await
    }
}

#[async_trait]
impl Listener for UdpListener {
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
        let (server, handler, bind_addr) =
            match (self.core.server(), self.core.require_handler(), self.bind_addr) {
                (Ok(server), Ok(handler), Some(bind_addr)) => (server, handler, bind_addr),
                _ => {
                    self.core.signal_ready(false);
                    return Err(ListenerError::NotInitialized(self.name().to_string()));
                }
            };

        let socket = match UdpSocket::bind(bind_addr).await {
            Ok(socket) => Arc::new(socket),
            Err(source) => {
                self.core.signal_ready(false);
                return Err(ListenerError::Bind {
                    addr: bind_addr,
                    source,
                });
            }
        };
        let local_addr = socket.local_addr()?;
        let _ = self.local_addr.set(local_addr);
        info!(listener = %self.name(), address = %local_addr, "UDP listener serving");

        let worker = Arc::new(Worker {
            listener: self.name().to_string(),
            server,
            handler,
            counters: self.core.counters(),
            socket: Arc::clone(&socket),
        });
        let mut shutdown = self.core.shutdown_signal();

        self.core.track(tokio::spawn(async move {
            let mut buf = vec![0u8; Packet::MAX_PACKET_SIZE];
            loop {
                tokio::select! {
                    _ = wait_for_shutdown(&mut shutdown) => break,
                    received = socket.recv_from(&mut buf) => match received {
                        Ok((len, remote_addr)) => {
                            let data = buf[..len].to_vec();
                            tokio::spawn(Arc::clone(&worker).handle_datagram(data, remote_addr));
                        }
                        Err(e) => warn!(listener = %worker.listener, error = %e, "UDP receive failed"),
                    },
                }
            }
            debug!(listener = %worker.listener, "UDP accept loop stopped");
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

//! Push-delivered CoA/Disconnect
//!
//! When the control plane cannot reach the NAS, it publishes CoA events on a
//! server-sent event stream. This listener subscribes to the stream,
//! identifying itself with the machine id, turns every event into a
//! CoA/Disconnect-Request for the module chain and posts the encoded reply
//! back to the response endpoint:
//!
//! ```text
//! POST <ResponseUrl>
//! radius-packet-encoding: application/json
//!
//! {"data": "<base64 encoded reply packet>"}
//! ```
//!
//! Events carry no session correlation. Failures are logged; the publisher
//! never hears about them. A dropped stream is re-subscribed after the
//! reconnect delay.

use super::coa_event::CoaEvent;
use super::{Listener, ListenerCore, ListenerError, wait_for_shutdown};
use crate::config::{Config, ConfigError, ListenerConfig};
use crate::metrics::{Counters, ListenerCounters};
use crate::modules::{Middleware, Request, RequestContext};
use crate::server::ServerContext;
use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use futures::StreamExt;
use radius_proto::calculate_request_authenticator;
use reqwest::header::ACCEPT;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use std::time::Duration;
use tokio::sync::{oneshot, watch};
use tracing::{Instrument, debug, info, warn};

pub const MACHINE_ID_HEADER: &str = "x-machine-id";
pub const PACKET_ENCODING_HEADER: &str = "radius-packet-encoding";
pub const PACKET_ENCODING: &str = "application/json";

const MACHINE_ID_PATH: &str = "/etc/machine-id";
const DEFAULT_RESPONSE_TIMEOUT_MS: u64 = 5000;
const DEFAULT_RECONNECT_DELAY_MS: u64 = 1000;

/// Longest line or event the subscriber buffers before dropping the stream
pub const MAX_EVENT_LEN: usize = 64 * 1024;

/// Body posted to the response endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushResponse {
    pub data: String,
}

#[derive(Debug, Clone)]
struct PushSettings {
    events_url: String,
    response_url: String,
    machine_id: String,
    response_timeout: Duration,
    reconnect_delay: Duration,
    secret: Vec<u8>,
}

impl PushSettings {
    fn from_config(config: &Config, listener_config: &ListenerConfig) -> Result<Self, ConfigError> {
        let required = |key: &str| -> Result<String, ConfigError> {
            listener_config
                .extra_str(key)?
                .map(str::to_string)
                .ok_or_else(|| {
                    ConfigError::Invalid(format!(
                        "listener {}: missing {}",
                        listener_config.name, key
                    ))
                })
        };

        let machine_id = match listener_config.extra_str("MachineId")? {
            Some(id) => id.to_string(),
            None => std::fs::read_to_string(MACHINE_ID_PATH)
                .map(|id| id.trim().to_string())
                .map_err(|e| {
                    ConfigError::Invalid(format!(
                        "listener {}: no MachineId configured and {} unreadable: {}",
                        listener_config.name, MACHINE_ID_PATH, e
                    ))
                })?,
        };

        Ok(Self {
            events_url: required("EventsUrl")?,
            response_url: required("ResponseUrl")?,
            machine_id,
            response_timeout: Duration::from_millis(
                listener_config
                    .extra_u64("ResponseTimeoutMs")?
                    .unwrap_or(DEFAULT_RESPONSE_TIMEOUT_MS),
            ),
            reconnect_delay: Duration::from_millis(
                listener_config
                    .extra_u64("ReconnectDelayMs")?
                    .unwrap_or(DEFAULT_RECONNECT_DELAY_MS),
            ),
            secret: config.secret.as_bytes().to_vec(),
        })
    }
}

/// Incremental parser for a `text/event-stream` body
///
/// Only `data` fields matter; they are joined with newlines and emitted when
/// a blank line ends the event. A line or an event longer than
/// [`MAX_EVENT_LEN`] is an error and the stream should be dropped.
#[derive(Debug, Default)]
pub struct SseParser {
    buffer: Vec<u8>,
    data: Vec<String>,
    data_len: usize,
}

impl SseParser {
    /// Feed a chunk; returns the data of every event it completed
    pub fn feed(&mut self, chunk: &[u8]) -> Result<Vec<String>, ListenerError> {
        self.buffer.extend_from_slice(chunk);

        let mut events = Vec::new();
        while let Some(end) = self.buffer.iter().position(|b| *b == b'\n') {
            if end > MAX_EVENT_LEN {
                return Err(too_long("line"));
            }
            let line: Vec<u8> = self.buffer.drain(..=end).collect();
            let line = String::from_utf8_lossy(&line);
            let line = line.trim_end_matches(['\r', '\n']);

            if line.is_empty() {
                if !self.data.is_empty() {
                    events.push(self.data.join("\n"));
                    self.data.clear();
                    self.data_len = 0;
                }
            } else if let Some(value) = line.strip_prefix("data:") {
                let value = value.strip_prefix(' ').unwrap_or(value);
                self.data_len += value.len();
                if self.data_len > MAX_EVENT_LEN {
                    return Err(too_long("event"));
                }
                self.data.push(value.to_string());
            }
        }

        if self.buffer.len() > MAX_EVENT_LEN {
            return Err(too_long("line"));
        }
        Ok(events)
    }
}

fn too_long(what: &str) -> ListenerError {
    ListenerError::InvalidEvent(format!("{} exceeds {} bytes", what, MAX_EVENT_LEN))
}

struct Worker {
    listener: String,
    server: Arc<ServerContext>,
    handler: Middleware,
    counters: Arc<ListenerCounters>,
    settings: PushSettings,
    http: reqwest::Client,
}

impl Worker {
    async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                _ = wait_for_shutdown(&mut shutdown) => break,
                result = Arc::clone(&self).subscribe() => match result {
                    Ok(()) => info!(listener = %self.listener, "Event stream closed"),
                    Err(e) => warn!(listener = %self.listener, error = %e, "Event stream failed"),
                },
            }

            tokio::select! {
                _ = wait_for_shutdown(&mut shutdown) => break,
                _ = tokio::time::sleep(self.settings.reconnect_delay) => {}
            }
        }
        debug!(listener = %self.listener, "Push subscriber stopped");
    }

    async fn subscribe(self: Arc<Self>) -> Result<(), ListenerError> {
        let response = self
            .http
            .get(&self.settings.events_url)
            .header(MACHINE_ID_HEADER, &self.settings.machine_id)
            .header(ACCEPT, "text/event-stream")
            .send()
            .await?
            .error_for_status()?;
        info!(
            listener = %self.listener,
            url = %self.settings.events_url,
            "Subscribed to CoA events"
        );

        let mut stream = response.bytes_stream();
        let mut parser = SseParser::default();
        while let Some(chunk) = stream.next().await {
            for data in parser.feed(&chunk?)? {
                tokio::spawn(Arc::clone(&self).handle_event(data));
            }
        }
        Ok(())
    }

    async fn handle_event(self: Arc<Self>, data: String) {
        ListenerCounters::incr(&self.counters.requests);
        match self.process(&data).await {
            Ok(()) => ListenerCounters::incr(&self.counters.replies),
            Err(e) => {
                ListenerCounters::incr(&self.counters.no_reply);
                warn!(listener = %self.listener, error = %e, "Dropping CoA event");
            }
        }
    }

    async fn process(&self, data: &str) -> Result<(), ListenerError> {
        let event = CoaEvent::parse(data)?;
        let mut packet = event.to_packet()?;
        let secret = self.settings.secret.clone();
        packet.authenticator = calculate_request_authenticator(&packet, &secret)?;

        let identifier = packet.identifier;
        let request_authenticator = packet.authenticator;
        let request = Request::new(packet, secret.clone());
        let ctx = Arc::new(RequestContext::new(&self.listener, None));
        let span = ctx.span.clone();

        async move {
            debug!(code = ?request.code(), identifier = identifier, "Received CoA event");

            self.server
                .run_filters(&ctx, &self.listener, &request)
                .await
                .inspect_err(|_| ListenerCounters::incr(&self.counters.filtered))?;

            let response = (self.handler)(ctx, request)
                .await?
                .ok_or(ListenerError::NilResponse)?;
            let reply = response
                .signed_packet(identifier, &request_authenticator, &secret)?
                .encode()?;

            self.post_response(&reply).await
        }
        .instrument(span)
        .await
    }

    async fn post_response(&self, reply: &[u8]) -> Result<(), ListenerError> {
        let body = PushResponse {
            data: STANDARD.encode(reply),
        };

        self.http
            .post(&self.settings.response_url)
            .header(PACKET_ENCODING_HEADER, PACKET_ENCODING)
            .timeout(self.settings.response_timeout)
            .json(&body)
            .send()
            .await?
            .error_for_status()?;

        debug!(url = %self.settings.response_url, "Posted CoA response");
        Ok(())
    }
}

#[derive(Debug)]
pub struct PushListener {
    core: ListenerCore,
    settings: Option<PushSettings>,
}

impl PushListener {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            core: ListenerCore::new(name),
            settings: None,
        }
    }
}

#[async_trait]
impl Listener for PushListener {
    fn name(&self) -> &str {
        self.core.name()
    }

    fn init(
        &mut self,
        server: Arc<ServerContext>,
        config: &Config,
        listener_config: &ListenerConfig,
        counters: Arc<Counters>,
    ) -> Result<(), ListenerError> {
        self.settings = Some(PushSettings::from_config(config, listener_config)?);
        self.core.attach(server, &counters);
        Ok(())
    }

    async fn listen_and_serve(&self) -> Result<(), ListenerError> {
        let (server, handler, settings) = match (
            self.core.server(),
            self.core.require_handler(),
            self.settings.clone(),
        ) {
            (Ok(server), Ok(handler), Some(settings)) => (server, handler, settings),
            _ => {
                self.core.signal_ready(false);
                return Err(ListenerError::NotInitialized(self.name().to_string()));
            }
        };

        let http = match reqwest::Client::builder().build() {
            Ok(http) => http,
            Err(e) => {
                self.core.signal_ready(false);
                return Err(e.into());
            }
        };

        let worker = Arc::new(Worker {
            listener: self.name().to_string(),
            server,
            handler,
            counters: self.core.counters(),
            settings,
            http,
        });
        self.core
            .track(tokio::spawn(worker.run(self.core.shutdown_signal())));

        // Ready means the subscriber runs. It keeps retrying an unreachable
        // control plane, so the first subscription is not awaited.
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
}

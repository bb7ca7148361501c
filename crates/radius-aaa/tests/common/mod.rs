//! Shared helpers for the integration tests
//!
//! Mock modules and filters count their invocations so tests can observe
//! what the pipeline did without a reply on the wire.

#![allow(dead_code)]

use async_trait::async_trait;
use radius_aaa::{
    Config, Filter, FilterError, HandlerResult, Middleware, Module, ModuleConfig, ModuleError,
    Request, RequestContext, Response, StaticLoader,
};
use radius_proto::{Attribute, Code, Packet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::net::UdpSocket;
use tokio::time::{Duration, timeout};

pub const SECRET: &[u8] = b"testing123";

/// Invocation counters shared between a test and the mocks it registers
#[derive(Debug, Default)]
pub struct Calls {
    pub init: AtomicUsize,
    pub handle: AtomicUsize,
    pub requests: Mutex<Vec<Packet>>,
}

impl Calls {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn handled(&self) -> usize {
        self.handle.load(Ordering::SeqCst)
    }

    pub fn initialized(&self) -> usize {
        self.init.load(Ordering::SeqCst)
    }

    pub fn identifiers(&self) -> Vec<u8> {
        self.requests().iter().map(|p| p.identifier).collect()
    }

    pub fn requests(&self) -> Vec<Packet> {
        self.requests.lock().unwrap().clone()
    }
}

/// Module that calls `next` and then answers with its own reply, if any
///
/// Setting `"fail_init": true` in its module config makes `init` fail;
/// `"fail_handle": true` makes every request fail.
pub struct MockModule {
    calls: Arc<Calls>,
    reply: Option<Response>,
    fail_handle: bool,
}

impl MockModule {
    pub fn new(calls: &Arc<Calls>, reply: Option<Response>) -> Self {
        Self {
            calls: Arc::clone(calls),
            reply,
            fail_handle: false,
        }
    }
}

#[async_trait]
impl Module for MockModule {
    fn init(&mut self, config: &ModuleConfig) -> Result<(), ModuleError> {
        self.calls.init.fetch_add(1, Ordering::SeqCst);
        if config.get("fail_init").and_then(|v| v.as_bool()) == Some(true) {
            return Err(ModuleError::Config("fail_init set".to_string()));
        }
        self.fail_handle = config.get("fail_handle").and_then(|v| v.as_bool()) == Some(true);
        Ok(())
    }

    async fn handle(
        &self,
        ctx: Arc<RequestContext>,
        request: Request,
        next: Middleware,
    ) -> HandlerResult {
        self.calls.handle.fetch_add(1, Ordering::SeqCst);
        self.calls
            .requests
            .lock()
            .unwrap()
            .push(request.packet.clone());
        if self.fail_handle {
            return Err(ModuleError::Failed("fail_handle set".to_string()));
        }

        let result = next(ctx, request).await?;
        Ok(self.reply.clone().or(result))
    }
}

/// Filter with a configurable init and process outcome
pub struct MockFilter {
    calls: Arc<Calls>,
    fail_init: bool,
    reject: bool,
}

impl MockFilter {
    pub fn new(calls: &Arc<Calls>, fail_init: bool, reject: bool) -> Self {
        Self {
            calls: Arc::clone(calls),
            fail_init,
            reject,
        }
    }
}

#[async_trait]
impl Filter for MockFilter {
    fn init(&mut self, _config: &Config) -> Result<(), FilterError> {
        self.calls.init.fetch_add(1, Ordering::SeqCst);
        if self.fail_init {
            return Err(FilterError::Config("mock init failure".to_string()));
        }
        Ok(())
    }

    async fn process(
        &self,
        _ctx: &RequestContext,
        _listener: &str,
        _request: &Request,
    ) -> Result<(), FilterError> {
        self.calls.handle.fetch_add(1, Ordering::SeqCst);
        if self.reject {
            return Err(FilterError::Rejected("mock rejection".to_string()));
        }
        Ok(())
    }
}

/// Loader with the built-ins plus a mock module under `name`
pub fn loader_with_module(
    name: &str,
    calls: &Arc<Calls>,
    reply: Option<Response>,
) -> StaticLoader {
    let calls = Arc::clone(calls);
    StaticLoader::with_builtins().register_module(name, move || -> Box<dyn Module> {
        Box::new(MockModule::new(&calls, reply.clone()))
    })
}

pub fn accept_with_reply_message(message: &str) -> Response {
    Response::new(Code::AccessAccept).with_attribute(Attribute::string(18, message).unwrap())
}

/// Send `packet` from `socket` and wait briefly for a reply
pub async fn exchange(socket: &UdpSocket, server: SocketAddr, packet: &Packet) -> Option<Packet> {
    socket.send_to(&packet.encode().unwrap(), server).await.unwrap();
    receive(socket, Duration::from_millis(500)).await
}

pub async fn receive(socket: &UdpSocket, wait: Duration) -> Option<Packet> {
    let mut buf = vec![0u8; Packet::MAX_PACKET_SIZE];
    match timeout(wait, socket.recv_from(&mut buf)).await {
        Ok(Ok((len, _))) => Some(Packet::decode(&buf[..len]).unwrap()),
        _ => None,
    }
}

pub async fn client_socket() -> UdpSocket {
    UdpSocket::bind("127.0.0.1:0").await.unwrap()
}

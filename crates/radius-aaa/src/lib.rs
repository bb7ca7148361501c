//! RADIUS AAA Server Core
//!
//! Authentication, authorization and accounting server for network access
//! gateways, built on the `radius-proto` codec.
//!
//! # Features
//!
//! - UDP listener for NAS traffic with retransmission suppression
//! - CoA/Disconnect driven by the control plane, either synchronously over
//!   HTTP or asynchronously over a server-sent event stream
//! - Ordered module middleware and pre-chain filters, resolved by name
//! - Per-session state keyed by a stable session identifier
//! - JSON configuration, `tracing` logs and Prometheus counters
//!
//! # Example
//!
//! ```rust,no_run
//! use radius_aaa::{Config, Server, StaticLoader};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::from_file("config.json")?;
//!     let server = Arc::new(Server::new(config, &StaticLoader::with_builtins())?);
//!
//!     if !server.start_and_wait().await {
//!         eprintln!("some listeners failed to start");
//!     }
//!
//!     tokio::signal::ctrl_c().await?;
//!     server.stop().await;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod dedup;
pub mod filters;
pub mod listener;
pub mod loader;
pub mod metrics;
pub mod modules;
pub mod server;
pub mod session;

pub use config::{
    Client, ClientTable, Config, ConfigError, ListenerConfig, ModuleConfig, ModuleDescriptor,
};
pub use dedup::{DedupCache, dedup_key};
pub use filters::{Filter, FilterError};
pub use listener::{Listener, ListenerCore, ListenerError};
pub use loader::{LoadError, Loader, StaticLoader};
pub use metrics::Counters;
pub use modules::{
    HandlerFuture, HandlerResult, Middleware, Module, ModuleError, Request, RequestContext,
    Response,
};
pub use server::{Server, ServerContext, ServerError};
pub use session::{
    MemoryStorage, SessionError, SessionState, SessionStateApi, SessionStorage,
    compose_session_id, generate_session_id, session_id,
};

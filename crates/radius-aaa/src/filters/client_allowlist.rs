//! Drop requests from unknown NAS clients
//!
//! Requests whose source address is outside every enabled client network of
//! the configuration are rejected. Requests without a source address were
//! synthesized by the control plane and pass unconditionally. An empty
//! client list accepts everyone.

use super::{Filter, FilterError};
use crate::config::{ClientTable, Config};
use crate::modules::{Request, RequestContext};
use async_trait::async_trait;
use tracing::{debug, warn};

#[derive(Debug, Default)]
pub struct ClientAllowlistFilter {
    clients: ClientTable,
}

impl ClientAllowlistFilter {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Filter for ClientAllowlistFilter {
    fn init(&mut self, config: &Config) -> Result<(), FilterError> {
        self.clients =
            ClientTable::new(&config.clients).map_err(|e| FilterError::Config(e.to_string()))?;

        debug!(clients = self.clients.len(), "Client allowlist loaded");
        Ok(())
    }

    async fn process(
        &self,
        _ctx: &RequestContext,
        listener: &str,
        request: &Request,
    ) -> Result<(), FilterError> {
        let Some(remote_addr) = request.remote_addr else {
            return Ok(());
        };
        if self.clients.is_empty() {
            return Ok(());
        }

        let source_ip = remote_addr.ip();
        if self.clients.find(source_ip).is_some() {
            Ok(())
        } else {
            warn!(listener = %listener, client = %source_ip, "Request from unknown client");
            Err(FilterError::Rejected(format!(
                "client {} is not allowed",
                source_ip
            )))
        }
    }
}

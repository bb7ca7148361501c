//! Pre-chain request filters
//!
//! Filters run in configured order before a listener's module chain. The
//! first filter to return an error aborts the request: no module runs and
//! nothing is sent back.

pub mod client_allowlist;

pub use client_allowlist::ClientAllowlistFilter;

use crate::config::Config;
use crate::modules::{Request, RequestContext};
use async_trait::async_trait;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum FilterError {
    #[error("Filter configuration error: {0}")]
    Config(String),
    #[error("Request rejected: {0}")]
    Rejected(String),
}

#[async_trait]
pub trait Filter: Send + Sync {
    /// Read whatever the filter needs from the server configuration
    fn init(&mut self, config: &Config) -> Result<(), FilterError>;

    async fn process(
        &self,
        ctx: &RequestContext,
        listener: &str,
        request: &Request,
    ) -> Result<(), FilterError>;
}

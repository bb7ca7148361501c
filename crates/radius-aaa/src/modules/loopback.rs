//! Echo module used for integration testing
//!
//! Answers every request itself with the matching positive reply code and a
//! copy of the request's attributes. The rest of the chain is not invoked.

use super::{HandlerResult, Middleware, Module, ModuleError, Request, RequestContext, Response};
use crate::config::ModuleConfig;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, Default)]
pub struct LoopbackModule;

impl LoopbackModule {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Module for LoopbackModule {
    fn init(&mut self, _config: &ModuleConfig) -> Result<(), ModuleError> {
        Ok(())
    }

    async fn handle(
        &self,
        _ctx: Arc<RequestContext>,
        request: Request,
        _next: Middleware,
    ) -> HandlerResult {
        let code = request.code().success_reply().ok_or_else(|| {
            ModuleError::Failed(format!("no reply defined for {:?}", request.code()))
        })?;

        debug!(
            request_code = ?request.code(),
            reply_code = ?code,
            attributes = request.packet.attributes.len(),
            "Echoing request"
        );

        Ok(Some(Response {
            code,
            attributes: request.packet.attributes,
        }))
    }
}

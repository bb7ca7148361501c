//! Session bookkeeping module
//!
//! An Access-Request establishes the session: its state is written with a
//! fresh correlation id and the station identifiers of the request.
//! Accounting-Requests update an established session. Accounting for an
//! unknown session is logged and passed on without creating state. Both
//! then continue the chain.

use super::{HandlerResult, Middleware, Module, ModuleError, Request, RequestContext};
use crate::config::ModuleConfig;
use crate::session::{SessionError, SessionState};
use async_trait::async_trait;
use radius_proto::{AcctStatusType, AttributeType, Code};
use rand::Rng;
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Debug, Default)]
pub struct SessionTrackerModule;

impl SessionTrackerModule {
    pub fn new() -> Self {
        Self
    }

    async fn authorize(&self, ctx: &RequestContext, request: &Request) -> Result<(), ModuleError> {
        let session = ctx.session()?;
        let mut state = match session.get().await {
            Ok(state) => state,
            Err(SessionError::NotFound(_)) => SessionState::default(),
            Err(e) => return Err(e.into()),
        };

        state.correlation_id = rand::rng().random_range(1..=u64::MAX);
        if let Some(acct_session_id) = request
            .packet
            .string_attribute(AttributeType::AcctSessionId)
        {
            state.acct_session_id = acct_session_id;
        }
        if let Some(calling) = request
            .packet
            .string_attribute(AttributeType::CallingStationId)
        {
            state.calling_station_id = calling;
        }

        debug!(correlation_id = state.correlation_id, "Session established");
        session.set(state).await?;
        Ok(())
    }

    async fn account(&self, ctx: &RequestContext, request: &Request) -> Result<(), ModuleError> {
        let session = ctx.session()?;
        let status = AcctStatusType::from_packet(&request.packet);
        let mut state = match session.get().await {
            Ok(state) => state,
            Err(SessionError::NotFound(_)) => {
                warn!(
                    session_id = session.session_id(),
                    status = ?status,
                    "Accounting for unknown session"
                );
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };

        if let Some(acct_session_id) = request
            .packet
            .string_attribute(AttributeType::AcctSessionId)
        {
            state.acct_session_id = acct_session_id;
        }

        info!(
            correlation_id = state.correlation_id,
            status = ?status,
            "Accounting for session"
        );
        session.set(state).await?;
        Ok(())
    }
}

#[async_trait]
impl Module for SessionTrackerModule {
    fn init(&mut self, _config: &ModuleConfig) -> Result<(), ModuleError> {
        Ok(())
    }

    async fn handle(
        &self,
        ctx: Arc<RequestContext>,
        request: Request,
        next: Middleware,
    ) -> HandlerResult {
        match request.code() {
            Code::AccessRequest => self.authorize(&ctx, &request).await?,
            Code::AccountingRequest => self.account(&ctx, &request).await?,
            _ => {}
        }
        next(ctx, request).await
    }
}

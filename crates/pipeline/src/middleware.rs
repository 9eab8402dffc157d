use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tracing::{info, info_span, warn, Instrument};

use rockbot_types::DispatchOutcome;

use crate::context::MessageContext;
use crate::registry::TypeRegistry;

/// One link in the dispatch chain of responsibility. A middleware may
/// inspect or mutate `ctx`, call `next.run(ctx)` to continue the chain, or
/// return its own outcome directly to short-circuit everything after it
/// (including the typed handler itself).
#[async_trait]
pub trait Middleware: Send + Sync {
    async fn handle(&self, ctx: &mut MessageContext, next: Next<'_>) -> Result<DispatchOutcome>;
}

/// The remaining portion of the chain, terminating in the type registry.
pub struct Next<'a> {
    pub(crate) middleware: &'a [Arc<dyn Middleware>],
    pub(crate) registry: &'a TypeRegistry,
}

impl<'a> Next<'a> {
    pub async fn run(self, ctx: &mut MessageContext) -> Result<DispatchOutcome> {
        match self.middleware.split_first() {
            Some((first, rest)) => {
                first.handle(ctx, Next { middleware: rest, registry: self.registry }).await
            }
            None => self.registry.dispatch(ctx).await,
        }
    }
}

/// Logs entry and outcome of every dispatch. Placed first so its span wraps
/// every other middleware and the handler itself.
pub struct LoggingMiddleware;

#[async_trait]
impl Middleware for LoggingMiddleware {
    async fn handle(&self, ctx: &mut MessageContext, next: Next<'_>) -> Result<DispatchOutcome> {
        let message_type = ctx.envelope.message_type.clone();
        let message_id = ctx.envelope.message_id;
        let span = info_span!("dispatch", %message_type, %message_id);
        async move {
            info!("dispatching");
            let result = next.run(ctx).await;
            match &result {
                Ok(outcome) => info!(?outcome, "dispatched"),
                Err(e) => warn!(error = %e, "dispatch cancelled or failed"),
            }
            result
        }
        .instrument(span)
        .await
    }
}

/// Downgrades a `Retry` outcome to `DeadLetter` once the envelope's
/// `rb-retry-count` header has reached `max_retries`. The header itself is
/// bumped by the transport binding on redelivery, not here — this middleware
/// only reads it and decides whether redelivery should continue.
pub struct RetryCountMiddleware {
    pub max_retries: u32,
}

impl RetryCountMiddleware {
    pub fn new(max_retries: u32) -> Self {
        Self { max_retries }
    }
}

#[async_trait]
impl Middleware for RetryCountMiddleware {
    async fn handle(&self, ctx: &mut MessageContext, next: Next<'_>) -> Result<DispatchOutcome> {
        let outcome = next.run(ctx).await?;
        if matches!(outcome, DispatchOutcome::Retry) && ctx.envelope.retry_count() >= self.max_retries
        {
            return Ok(DispatchOutcome::DeadLetter {
                reason: format!("exceeded max retries ({})", self.max_retries),
            });
        }
        Ok(outcome)
    }
}

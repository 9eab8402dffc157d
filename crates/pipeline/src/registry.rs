use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use tracing::{error, warn};

use rockbot_types::DispatchOutcome;

use crate::context::MessageContext;

/// Decodes the envelope body as `T` and runs the registered action.
#[async_trait]
pub trait Handler<T>: Send + Sync {
    async fn handle(&self, payload: T, ctx: &mut MessageContext) -> Result<()>;
}

#[async_trait]
impl<T, F, Fut> Handler<T> for F
where
    T: Send + 'static,
    F: Fn(T, &mut MessageContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<()>> + Send,
{
    async fn handle(&self, payload: T, ctx: &mut MessageContext) -> Result<()> {
        (self)(payload, ctx).await
    }
}

type ErasedEntry = Box<
    dyn for<'a> Fn(&'a mut MessageContext) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>>
        + Send
        + Sync,
>;

/// The "Type Registry": a `messageType` string maps to exactly one decoder +
/// typed handler pair. Dispatch for an unregistered type never falls through
/// to a default handler — it becomes a `DeadLetter` with a logged reason, per
/// the "never silent Ack" rule.
#[derive(Default)]
pub struct TypeRegistry {
    entries: HashMap<String, ErasedEntry>,
}

impl TypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the handler for `message_type`. Re-registering the same
    /// type replaces the previous entry.
    pub fn register<T, H>(&mut self, message_type: impl Into<String>, handler: H)
    where
        T: DeserializeOwned + Send + 'static,
        H: Handler<T> + 'static,
    {
        let handler = Arc::new(handler);
        let entry: ErasedEntry = Box::new(move |ctx: &mut MessageContext| {
            let handler = handler.clone();
            Box::pin(async move {
                let payload: T = serde_json::from_slice(&ctx.envelope.body)
                    .map_err(|e| anyhow!("failed to decode envelope body as registered type: {e}"))?;
                handler.handle(payload, ctx).await
            })
        });
        self.entries.insert(message_type.into(), entry);
    }

    pub fn is_registered(&self, message_type: &str) -> bool {
        self.entries.contains_key(message_type)
    }

    /// Innermost step of the middleware chain: looks up and invokes the
    /// handler for the envelope's `message_type`, translating the result into
    /// a dispatch outcome. A handler error becomes `Retry`; cancellation
    /// bubbles up as `Err` so the caller never reports an outcome for work it
    /// never finished.
    pub async fn dispatch(&self, ctx: &mut MessageContext) -> Result<DispatchOutcome> {
        let message_type = ctx.envelope.message_type.clone();
        let Some(entry) = self.entries.get(&message_type) else {
            warn!(message_type, "no handler registered for messageType");
            return Ok(DispatchOutcome::DeadLetter {
                reason: format!("unrecognized messageType: {message_type}"),
            });
        };

        match entry(ctx).await {
            Ok(()) => Ok(DispatchOutcome::Ack),
            Err(e) if ctx.cancellation.is_cancelled() => Err(e),
            Err(e) => {
                error!(message_type, error = %e, "handler failed, will retry");
                Ok(DispatchOutcome::Retry)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use serde::Deserialize;
    use tokio_util::sync::CancellationToken;

    use rockbot_types::{AgentIdentity, Envelope};

    use super::*;

    #[derive(Deserialize)]
    struct Ping {
        n: u32,
    }

    fn ctx(envelope: Envelope) -> MessageContext {
        MessageContext::new(envelope, AgentIdentity::new("rockbot"), CancellationToken::new())
    }

    #[tokio::test]
    async fn dispatches_to_registered_handler() {
        let mut registry = TypeRegistry::new();
        registry.register::<Ping, _>("Ping", |p: Ping, ctx: &mut MessageContext| async move {
            ctx.insert_service(p.n);
            Ok(())
        });

        let envelope = Envelope::builder("Ping", "test")
            .json_body(&Ping { n: 7 })
            .unwrap()
            .build();
        let mut context = ctx(envelope);
        let outcome = registry.dispatch(&mut context).await.unwrap();

        assert!(matches!(outcome, DispatchOutcome::Ack));
        assert_eq!(context.service::<u32>(), Some(&7));
    }

    #[tokio::test]
    async fn unregistered_type_dead_letters_with_reason() {
        let registry = TypeRegistry::new();
        let envelope = Envelope::builder("Unknown", "test").build();
        let mut context = ctx(envelope);
        let outcome = registry.dispatch(&mut context).await.unwrap();

        match outcome {
            DispatchOutcome::DeadLetter { reason } => assert!(reason.contains("Unknown")),
            _ => panic!("expected DeadLetter"),
        }
    }

    #[tokio::test]
    async fn handler_error_becomes_retry() {
        let mut registry = TypeRegistry::new();
        registry.register::<Ping, _>("Ping", |_p: Ping, _ctx: &mut MessageContext| async move {
            Err(anyhow!("boom"))
        });

        let envelope = Envelope::builder("Ping", "test")
            .json_body(&Ping { n: 1 })
            .unwrap()
            .build();
        let mut context = ctx(envelope);
        let outcome = registry.dispatch(&mut context).await.unwrap();

        assert!(matches!(outcome, DispatchOutcome::Retry));
    }
}

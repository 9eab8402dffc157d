//! The message pipeline (spec §4.1): an ordered middleware chain of
//! responsibility terminating in a type registry of decoders and typed
//! handlers. `Pipeline::dispatch` is the `DispatchAsync(envelope, ct) ->
//! {Ack, Retry, DeadLetter}` contract every transport binding calls into.
//!
//! Grounded on the in-process dispatch loop of `aigent-runtime::server`
//! (`run_unified_daemon`), generalized from its hard-coded retry/ack handling
//! into an explicit, composable middleware chain.

mod context;
mod middleware;
mod registry;
mod session_gate;

pub use context::MessageContext;
pub use middleware::{LoggingMiddleware, Middleware, Next, RetryCountMiddleware};
pub use registry::{Handler, TypeRegistry};
pub use session_gate::{extract_session_id, SessionGate};

use std::sync::Arc;

use anyhow::Result;
use tokio_util::sync::CancellationToken;

use rockbot_types::{AgentIdentity, DispatchOutcome, Envelope};

pub struct Pipeline {
    middleware: Vec<Arc<dyn Middleware>>,
    registry: TypeRegistry,
    session_gate: SessionGate,
}

impl Pipeline {
    pub fn builder() -> PipelineBuilder {
        PipelineBuilder::default()
    }

    /// Runs the chain for one envelope. If the envelope's body carries a
    /// `sessionId`, dispatch for that session is serialized against any
    /// other in-flight dispatch for the same id; other sessions proceed
    /// concurrently.
    pub async fn dispatch(
        &self,
        envelope: Envelope,
        identity: AgentIdentity,
        cancellation: CancellationToken,
    ) -> Result<DispatchOutcome> {
        let session_id = extract_session_id(&envelope.body);
        let _guard = match &session_id {
            Some(id) => Some(self.session_gate.acquire(id).await),
            None => None,
        };

        let mut ctx = MessageContext::new(envelope, identity, cancellation);
        let next = Next { middleware: &self.middleware, registry: &self.registry };
        next.run(&mut ctx).await
    }
}

#[derive(Default)]
pub struct PipelineBuilder {
    middleware: Vec<Arc<dyn Middleware>>,
    registry: TypeRegistry,
}

impl PipelineBuilder {
    pub fn with_middleware(mut self, middleware: impl Middleware + 'static) -> Self {
        self.middleware.push(Arc::new(middleware));
        self
    }

    pub fn with_handler<T, H>(mut self, message_type: impl Into<String>, handler: H) -> Self
    where
        T: serde::de::DeserializeOwned + Send + 'static,
        H: Handler<T> + 'static,
    {
        self.registry.register::<T, H>(message_type, handler);
        self
    }

    pub fn build(self) -> Pipeline {
        Pipeline { middleware: self.middleware, registry: self.registry, session_gate: SessionGate::new() }
    }
}

#[cfg(test)]
mod tests {
    use serde::Deserialize;

    use rockbot_types::AgentIdentity;

    use super::*;

    #[derive(Deserialize)]
    struct UserMessage {
        #[serde(rename = "sessionId")]
        session_id: String,
    }

    #[tokio::test]
    async fn full_chain_acks_on_success() {
        let pipeline = Pipeline::builder()
            .with_middleware(LoggingMiddleware)
            .with_middleware(RetryCountMiddleware::new(5))
            .with_handler::<UserMessage, _>("UserMessage", |_payload: UserMessage, _ctx: &mut MessageContext| async move {
                Ok(())
            })
            .build();

        let envelope = Envelope::builder("UserMessage", "cli")
            .json_body(&UserMessage { session_id: "s1".into() })
            .unwrap()
            .build();

        let outcome = pipeline
            .dispatch(envelope, AgentIdentity::new("rockbot"), CancellationToken::new())
            .await
            .unwrap();
        assert!(matches!(outcome, DispatchOutcome::Ack));
    }

    #[tokio::test]
    async fn unregistered_type_dead_letters_through_full_chain() {
        let pipeline = Pipeline::builder()
            .with_middleware(LoggingMiddleware)
            .with_middleware(RetryCountMiddleware::new(5))
            .build();

        let envelope = Envelope::builder("Mystery", "cli").build();
        let outcome = pipeline
            .dispatch(envelope, AgentIdentity::new("rockbot"), CancellationToken::new())
            .await
            .unwrap();
        assert!(matches!(outcome, DispatchOutcome::DeadLetter { .. }));
    }
}

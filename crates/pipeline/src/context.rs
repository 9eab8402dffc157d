use std::any::{Any, TypeId};
use std::collections::HashMap;

use tokio_util::sync::CancellationToken;

use rockbot_types::{AgentIdentity, Envelope};

/// Per-message state threaded through the middleware chain. `services` is a
/// small type-keyed map (the "scoped service lookup" of the dispatch
/// contract) so middleware and handlers can reach shared collaborators
/// (memory, LLM client, tool registry, ...) without every caller having to
/// enumerate them in a fixed struct.
pub struct MessageContext {
    pub envelope: Envelope,
    pub identity: AgentIdentity,
    pub cancellation: CancellationToken,
    services: HashMap<TypeId, Box<dyn Any + Send + Sync>>,
}

impl MessageContext {
    pub fn new(envelope: Envelope, identity: AgentIdentity, cancellation: CancellationToken) -> Self {
        Self { envelope, identity, cancellation, services: HashMap::new() }
    }

    pub fn insert_service<T: Send + Sync + 'static>(&mut self, value: T) {
        self.services.insert(TypeId::of::<T>(), Box::new(value));
    }

    pub fn service<T: Send + Sync + 'static>(&self) -> Option<&T> {
        self.services.get(&TypeId::of::<T>()).and_then(|boxed| boxed.downcast_ref::<T>())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn service_lookup_round_trips_by_type() {
        let mut ctx = MessageContext::new(
            Envelope::builder("UserMessage", "test").build(),
            AgentIdentity::new("rockbot"),
            CancellationToken::new(),
        );
        ctx.insert_service(42u32);
        ctx.insert_service("hello".to_string());

        assert_eq!(ctx.service::<u32>(), Some(&42));
        assert_eq!(ctx.service::<String>(), Some(&"hello".to_string()));
        assert_eq!(ctx.service::<i64>(), None);
    }
}

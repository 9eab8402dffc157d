//! Tool Registry (spec §4, component table; contract in §6): a dynamic
//! registry of tool descriptors and executors with live add/remove and a
//! copy-on-write snapshot for readers (spec §5: "Tool registry: copy-on-write;
//! readers snapshot a list reference").
//!
//! Individual tool backends (MCP servers, HTTP clients, script executors,
//! container runners) are external collaborators per spec §1 — this crate
//! only holds the registry and the invocation contract a backend must
//! satisfy. `rockbot-exec` wraps a registry with policy (timeouts,
//! allow/deny lists) and bridges to the transport for MCP-hosted tools.

use std::collections::HashSet;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// `{name, description, parametersSchema (JSON Schema text), source}` (spec
/// §6 Tool contract).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDescriptor {
    pub name: String,
    pub description: String,
    pub parameters_schema: String,
    pub source: String,
}

/// `{toolCallId, toolName, arguments (JSON text), sessionId?}` — what an
/// executor receives.
#[derive(Debug, Clone)]
pub struct ToolInvocation {
    pub tool_call_id: String,
    pub tool_name: String,
    pub arguments: String,
    pub session_id: Option<String>,
}

/// `{toolCallId, toolName, content, isError}` — what an executor returns.
/// Executors never raise: a failure becomes `is_error = true` with a
/// human-readable `content`, per §7's "Tool execution error → returned as
/// `isError=true` tool-result; the loop continues so the model can adapt."
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolInvocationResult {
    pub tool_call_id: String,
    pub tool_name: String,
    pub content: String,
    pub is_error: bool,
}

impl ToolInvocationResult {
    pub fn ok(invocation: &ToolInvocation, content: impl Into<String>) -> Self {
        Self {
            tool_call_id: invocation.tool_call_id.clone(),
            tool_name: invocation.tool_name.clone(),
            content: content.into(),
            is_error: false,
        }
    }

    pub fn error(invocation: &ToolInvocation, content: impl Into<String>) -> Self {
        Self {
            tool_call_id: invocation.tool_call_id.clone(),
            tool_name: invocation.tool_name.clone(),
            content: content.into(),
            is_error: true,
        }
    }
}

#[async_trait]
pub trait ToolExecutor: Send + Sync {
    async fn invoke(&self, invocation: ToolInvocation) -> ToolInvocationResult;
}

struct ToolEntry {
    descriptor: ToolDescriptor,
    executor: Arc<dyn ToolExecutor>,
}

/// Copy-on-write registry: every mutation (`register`/`unregister`) builds a
/// new snapshot vector and swaps it in; concurrent readers hold an `Arc`
/// clone of whatever snapshot was live when they called `snapshot()` or
/// `get()`, so a registration racing with an in-flight loop never blocks it
/// and never mutates the list out from under it.
#[derive(Default)]
pub struct ToolRegistry {
    entries: RwLock<Arc<Vec<ToolEntry>>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self { entries: RwLock::new(Arc::new(Vec::new())) }
    }

    /// Registers (or replaces, by name) a tool.
    pub fn register(&self, descriptor: ToolDescriptor, executor: Arc<dyn ToolExecutor>) {
        let mut guard = self.entries.write().expect("tool registry lock poisoned");
        let mut next: Vec<ToolEntry> = (**guard).iter().filter(|e| e.descriptor.name != descriptor.name).map(|e| ToolEntry {
            descriptor: e.descriptor.clone(),
            executor: e.executor.clone(),
        }).collect();
        next.push(ToolEntry { descriptor, executor });
        *guard = Arc::new(next);
    }

    /// Removes a tool by name. Returns `true` if it was present.
    pub fn unregister(&self, name: &str) -> bool {
        let mut guard = self.entries.write().expect("tool registry lock poisoned");
        let before = guard.len();
        let next: Vec<ToolEntry> = (**guard).iter().filter(|e| e.descriptor.name != name).map(|e| ToolEntry {
            descriptor: e.descriptor.clone(),
            executor: e.executor.clone(),
        }).collect();
        let removed = next.len() != before;
        *guard = Arc::new(next);
        removed
    }

    /// Descriptors for every currently-registered tool, for the loop
    /// runner's `ChatOptions` tool-set and the context builder.
    pub fn descriptors(&self) -> Vec<ToolDescriptor> {
        self.entries.read().expect("tool registry lock poisoned").iter().map(|e| e.descriptor.clone()).collect()
    }

    pub fn names(&self) -> HashSet<String> {
        self.entries.read().expect("tool registry lock poisoned").iter().map(|e| e.descriptor.name.clone()).collect()
    }

    /// Restricts the view to a named subset, for e.g. a subagent's
    /// restricted tool set (spec §4.11). Entries not present in the
    /// registry are silently dropped, not errors — callers that need a
    /// strict check should cross-reference `names()` first.
    pub fn restricted(&self, allowed: &HashSet<String>) -> Vec<ToolDescriptor> {
        self.entries
            .read()
            .expect("tool registry lock poisoned")
            .iter()
            .filter(|e| allowed.contains(&e.descriptor.name))
            .map(|e| e.descriptor.clone())
            .collect()
    }

    /// Looks up the live executor for `name`, for callers (e.g. the
    /// Subagent Manager, spec §4.11) that build a scoped registry by pulling
    /// selected entries out of a shared one.
    pub fn executor_for(&self, name: &str) -> Option<Arc<dyn ToolExecutor>> {
        self.entries.read().expect("tool registry lock poisoned").iter().find(|e| e.descriptor.name == name).map(|e| e.executor.clone())
    }

    /// Invokes the named tool. Returns an `is_error` result for an unknown
    /// tool rather than propagating an error — matches §7's rule that tool
    /// failures surface as tool-results, not handler-level failures.
    pub async fn invoke(&self, invocation: ToolInvocation) -> ToolInvocationResult {
        match self.executor_for(&invocation.tool_name) {
            Some(executor) => executor.invoke(invocation).await,
            None => ToolInvocationResult::error(&invocation, format!("unknown tool: {}", invocation.tool_name)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct EchoExecutor;

    #[async_trait]
    impl ToolExecutor for EchoExecutor {
        async fn invoke(&self, invocation: ToolInvocation) -> ToolInvocationResult {
            ToolInvocationResult::ok(&invocation, invocation.arguments.clone())
        }
    }

    fn descriptor(name: &str) -> ToolDescriptor {
        ToolDescriptor {
            name: name.to_string(),
            description: format!("{name} tool"),
            parameters_schema: "{}".to_string(),
            source: "test".to_string(),
        }
    }

    #[tokio::test]
    async fn register_then_invoke_round_trips() {
        let registry = ToolRegistry::new();
        registry.register(descriptor("echo"), Arc::new(EchoExecutor));

        let result = registry
            .invoke(ToolInvocation {
                tool_call_id: "c1".into(),
                tool_name: "echo".into(),
                arguments: "{\"x\":1}".into(),
                session_id: None,
            })
            .await;
        assert!(!result.is_error);
        assert_eq!(result.content, "{\"x\":1}");
    }

    #[tokio::test]
    async fn unknown_tool_is_error_result_not_panic() {
        let registry = ToolRegistry::new();
        let result = registry
            .invoke(ToolInvocation { tool_call_id: "c1".into(), tool_name: "missing".into(), arguments: "{}".into(), session_id: None })
            .await;
        assert!(result.is_error);
    }

    #[test]
    fn register_is_live_add_and_remove() {
        let registry = ToolRegistry::new();
        assert!(registry.names().is_empty());

        registry.register(descriptor("a"), Arc::new(EchoExecutor));
        registry.register(descriptor("b"), Arc::new(EchoExecutor));
        assert_eq!(registry.names().len(), 2);

        assert!(registry.unregister("a"));
        assert!(!registry.unregister("a"));
        assert_eq!(registry.names(), HashSet::from(["b".to_string()]));
    }

    #[test]
    fn re_registering_same_name_replaces_not_duplicates() {
        let registry = ToolRegistry::new();
        registry.register(descriptor("a"), Arc::new(EchoExecutor));
        registry.register(descriptor("a"), Arc::new(EchoExecutor));
        assert_eq!(registry.descriptors().len(), 1);
    }

    #[test]
    fn restricted_view_filters_to_allowed_set() {
        let registry = ToolRegistry::new();
        registry.register(descriptor("a"), Arc::new(EchoExecutor));
        registry.register(descriptor("b"), Arc::new(EchoExecutor));

        let allowed = HashSet::from(["a".to_string()]);
        let view = registry.restricted(&allowed);
        assert_eq!(view.len(), 1);
        assert_eq!(view[0].name, "a");
    }
}

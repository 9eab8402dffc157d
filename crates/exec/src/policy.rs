//! Capability gate (spec §7): every tool invocation passes through a
//! `PolicyGate` before it reaches the registry. Generalized from the
//! teacher's `ExecutionPolicy` (allow/deny lists, an `approval_mode` enum) —
//! the interactive approval channel and the native-tool capability matrix
//! are dropped since they have no counterpart once concrete tool backends
//! are external collaborators (spec §1).

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use rockbot_tools::{ToolInvocation, ToolInvocationResult, ToolRegistry};

/// How much latitude the agent has to act without a human in the loop.
/// Mirrors `rockbot-config::SafetyConfig::approval_mode`'s string values so
/// the two crates agree on vocabulary without either depending on the other.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ApprovalMode {
    /// No gating beyond allow/deny lists; every allowed tool runs immediately.
    #[default]
    Autonomous,
    /// Allow/deny lists plus a shorter default timeout — the middle ground a
    /// long-running unattended agent runs under day to day.
    Balanced,
    /// Tightest default timeout; intended to be paired with an allowlist at
    /// the deployment layer rather than a denylist.
    Safer,
}

impl std::str::FromStr for ApprovalMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "autonomous" => Ok(ApprovalMode::Autonomous),
            "balanced" => Ok(ApprovalMode::Balanced),
            "safer" => Ok(ApprovalMode::Safer),
            other => Err(format!("unknown approval mode: {other}")),
        }
    }
}

/// Allow/deny lists plus the default per-invocation timeout for a mode.
#[derive(Debug, Clone)]
pub struct ExecutionPolicy {
    pub approval_mode: ApprovalMode,
    /// Empty means "no restriction" — every registered tool is reachable.
    pub tool_allowlist: HashSet<String>,
    pub tool_denylist: HashSet<String>,
    pub default_timeout_ms: u64,
}

impl ExecutionPolicy {
    pub fn new(approval_mode: ApprovalMode) -> Self {
        let default_timeout_ms = match approval_mode {
            ApprovalMode::Autonomous => 120_000,
            ApprovalMode::Balanced => 60_000,
            ApprovalMode::Safer => 20_000,
        };
        Self {
            approval_mode,
            tool_allowlist: HashSet::new(),
            tool_denylist: HashSet::new(),
            default_timeout_ms,
        }
    }

    pub fn with_allowlist(mut self, names: impl IntoIterator<Item = String>) -> Self {
        self.tool_allowlist = names.into_iter().collect();
        self
    }

    pub fn with_denylist(mut self, names: impl IntoIterator<Item = String>) -> Self {
        self.tool_denylist = names.into_iter().collect();
        self
    }

    fn permits(&self, tool_name: &str) -> bool {
        if self.tool_denylist.contains(tool_name) {
            return false;
        }
        self.tool_allowlist.is_empty() || self.tool_allowlist.contains(tool_name)
    }
}

/// Wraps a `ToolRegistry` so every invocation is capability-checked and
/// timeout-bounded before it reaches an executor. A denied or timed-out call
/// still returns a normal `ToolInvocationResult` with `is_error = true`
/// rather than an `Err` — per §7, tool failures are tool-results, not
/// handler-level failures, so the loop can feed the rejection back to the
/// model and continue.
pub struct PolicyGate {
    registry: Arc<ToolRegistry>,
    policy: ExecutionPolicy,
}

impl PolicyGate {
    pub fn new(registry: Arc<ToolRegistry>, policy: ExecutionPolicy) -> Self {
        Self { registry, policy }
    }

    pub fn policy(&self) -> &ExecutionPolicy {
        &self.policy
    }

    /// Tool descriptors the caller is currently permitted to see, for the
    /// loop runner's tool-set offered to the model.
    pub fn visible_descriptors(&self) -> Vec<rockbot_tools::ToolDescriptor> {
        self.registry
            .descriptors()
            .into_iter()
            .filter(|d| self.policy.permits(&d.name))
            .collect()
    }

    pub async fn invoke(&self, invocation: ToolInvocation) -> ToolInvocationResult {
        if !self.policy.permits(&invocation.tool_name) {
            return ToolInvocationResult::error(
                &invocation,
                format!("tool '{}' is not permitted under the current policy", invocation.tool_name),
            );
        }

        let timeout = Duration::from_millis(self.policy.default_timeout_ms);
        match tokio::time::timeout(timeout, self.registry.invoke(invocation.clone())).await {
            Ok(result) => result,
            Err(_) => ToolInvocationResult::error(
                &invocation,
                format!("tool '{}' timed out after {}ms", invocation.tool_name, timeout.as_millis()),
            ),
        }
    }
}

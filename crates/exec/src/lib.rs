//! Tool execution policy: the capability gate every tool invocation passes
//! through, plus the MCP bridge that lets the Tool Registry
//! (`rockbot-tools`) host tools backed by an external MCP server reached
//! over the bus (spec §6 topics `tool.invoke.mcp` / `tool.result.{agent}` /
//! `tool.meta.mcp.{agent}`).
//!
//! Individual tool backends remain external collaborators per spec §1; this
//! crate only supplies the policy wrapper and the wire bridge to a remote
//! executor, generalized from the teacher's `aigent-exec::ExecutionPolicy`
//! (capability gates, allow/deny lists) minus the concrete native tool
//! implementations, the git-auto-commit/sandbox/WASM machinery, and the
//! interactive approval UI — none of which have a spec counterpart in a
//! UI-less core (spec §1 lists user-facing surfaces as out of scope; §9
//! treats attribute-driven/WASM tool loading as a pattern that doesn't
//! translate, replaced by explicit registration).

mod mcp;
mod policy;

pub use mcp::McpToolExecutor;
pub use policy::{ApprovalMode, ExecutionPolicy, PolicyGate};

//! The agent runtime: everything that sits between the transport/pipeline
//! layer and the LLM/tool stack (spec §4.2, §4.8-§4.15). Each submodule
//! corresponds to one named component in the spec's component table.

pub mod a2a;
pub mod activity;
pub mod context_builder;
pub mod discovery;
pub mod dream;
pub mod loop_runner;
pub mod messages;
pub mod primary_turn;
pub mod scheduler;
pub mod subagent;
pub mod work_serializer;

pub use a2a::{A2ACoordinator, AgentTaskHandler, InboundTaskServer, InvokeAgentTool};
pub use activity::UserActivityMonitor;
pub use context_builder::{ContextBuilder, ContextBuilderConfig};
pub use discovery::{Discovery, SharedDiscovery};
pub use dream::{DreamConfig, DreamDriver, DreamOutcome};
pub use loop_runner::{run_loop, LoopConfig, LoopOutcome};
pub use primary_turn::RuntimeHandles;
pub use scheduler::{handle_scheduled_task, Scheduler};
pub use subagent::{handle_subagent_progress, handle_subagent_result, SpawnSubagentTool, SubagentManager, SubagentRuntime};
pub use work_serializer::{SlotHandle, WorkSerializer};

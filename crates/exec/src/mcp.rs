//! Bridges a `rockbot_tools::ToolExecutor` to a remote MCP server reached
//! over the bus, using the topic conventions from spec §6:
//! `tool.invoke.mcp` carries the request, `tool.result.{agent}` carries the
//! reply correlated by `tool_call_id`. Grounded on the
//! request/reply-over-bus shape of `aigent-runtime::server::connection`
//! (request/response framed over a single connection, correlated by id) and
//! on the `CancellationToken`-scoped subscription pattern in
//! `rockbot-transport::InProcessBus`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{oneshot, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use rockbot_tools::{ToolExecutor, ToolInvocation, ToolInvocationResult};
use rockbot_transport::Transport;
use rockbot_types::{reserved, Envelope};

const TOPIC_INVOKE_MCP: &str = "tool.invoke.mcp";

fn result_topic(agent: &str) -> String {
    format!("tool.result.{agent}")
}

/// Wire body published on `tool.invoke.mcp`.
#[derive(Debug, Serialize, Deserialize)]
struct McpInvokeRequest {
    tool_call_id: String,
    tool_name: String,
    arguments: String,
    session_id: Option<String>,
}

/// Wire body expected back on `tool.result.{agent}`.
#[derive(Debug, Serialize, Deserialize)]
struct McpInvokeReply {
    tool_call_id: String,
    content: String,
    is_error: bool,
}

/// Routes tool invocations to a remote MCP server over the transport and
/// waits for the correlated reply. One instance serves every tool a given
/// MCP server advertises; the registry holds one entry per advertised tool
/// name, all backed by the same executor.
pub struct McpToolExecutor {
    transport: Arc<dyn Transport>,
    agent_name: String,
    default_timeout: Duration,
    pending: Arc<Mutex<HashMap<String, oneshot::Sender<McpInvokeReply>>>>,
    _subscription_shutdown: CancellationToken,
}

impl McpToolExecutor {
    /// Subscribes to this agent's result topic and returns an executor ready
    /// to bridge invocations. `agent_name` is this process's identity — the
    /// topic a reply must land on to be routed back here.
    pub async fn connect(
        transport: Arc<dyn Transport>,
        agent_name: impl Into<String>,
        default_timeout: Duration,
    ) -> anyhow::Result<Self> {
        let agent_name = agent_name.into();
        let pending: Arc<Mutex<HashMap<String, oneshot::Sender<McpInvokeReply>>>> =
            Arc::new(Mutex::new(HashMap::new()));
        let shutdown = CancellationToken::new();

        let pending_for_handler = pending.clone();
        let handler: rockbot_transport::DispatchFn = Arc::new(move |envelope: Envelope, _ct| {
            let pending = pending_for_handler.clone();
            Box::pin(async move {
                match envelope.body_as::<McpInvokeReply>() {
                    Ok(reply) => {
                        if let Some(tx) = pending.lock().await.remove(&reply.tool_call_id) {
                            let _ = tx.send(reply);
                        }
                        rockbot_types::DispatchOutcome::Ack
                    }
                    Err(error) => {
                        warn!(%error, "malformed mcp tool result envelope");
                        rockbot_types::DispatchOutcome::DeadLetter { reason: error.to_string() }
                    }
                }
            })
        });

        transport
            .subscribe(
                &result_topic(&agent_name),
                &format!("mcp-bridge-{agent_name}"),
                64,
                handler,
                shutdown.clone(),
            )
            .await?;

        Ok(Self { transport, agent_name, default_timeout, pending, _subscription_shutdown: shutdown })
    }
}

#[async_trait]
impl ToolExecutor for McpToolExecutor {
    async fn invoke(&self, invocation: ToolInvocation) -> ToolInvocationResult {
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(invocation.tool_call_id.clone(), tx);

        let request = McpInvokeRequest {
            tool_call_id: invocation.tool_call_id.clone(),
            tool_name: invocation.tool_name.clone(),
            arguments: invocation.arguments.clone(),
            session_id: invocation.session_id.clone(),
        };

        let envelope = match Envelope::builder("ToolInvokeMcp", &self.agent_name)
            .reply_to(result_topic(&self.agent_name))
            .header(reserved::CONTENT_TRUST, rockbot_types::ContentTrust::ToolRequest.to_string())
            .header(reserved::TIMEOUT_MS, self.default_timeout.as_millis().to_string())
            .json_body(&request)
        {
            Ok(builder) => builder.build(),
            Err(error) => {
                self.pending.lock().await.remove(&invocation.tool_call_id);
                return ToolInvocationResult::error(&invocation, format!("failed to encode mcp request: {error}"));
            }
        };

        if let Err(error) = self.transport.publish(TOPIC_INVOKE_MCP, envelope).await {
            self.pending.lock().await.remove(&invocation.tool_call_id);
            return ToolInvocationResult::error(&invocation, format!("failed to publish mcp invocation: {error}"));
        }

        match tokio::time::timeout(self.default_timeout, rx).await {
            Ok(Ok(reply)) => ToolInvocationResult {
                tool_call_id: invocation.tool_call_id,
                tool_name: invocation.tool_name,
                content: reply.content,
                is_error: reply.is_error,
            },
            Ok(Err(_)) => ToolInvocationResult::error(&invocation, "mcp bridge dropped before a reply arrived"),
            Err(_) => {
                self.pending.lock().await.remove(&invocation.tool_call_id);
                ToolInvocationResult::error(&invocation, "mcp tool invocation timed out")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use rockbot_transport::InProcessBus;

    use super::*;

    #[tokio::test]
    async fn round_trips_through_result_topic() {
        let bus: Arc<dyn Transport> = Arc::new(InProcessBus::new());
        let executor = McpToolExecutor::connect(bus.clone(), "agent-a", Duration::from_secs(2)).await.unwrap();

        let responder_bus = bus.clone();
        let shutdown = CancellationToken::new();
        let handler: rockbot_transport::DispatchFn = Arc::new(move |envelope: Envelope, _ct| {
            let bus = responder_bus.clone();
            Box::pin(async move {
                let request: McpInvokeRequest = envelope.body_as().unwrap();
                let reply = McpInvokeReply {
                    tool_call_id: request.tool_call_id,
                    content: "42".to_string(),
                    is_error: false,
                };
                let reply_envelope = Envelope::builder("ToolResultMcp", "mcp-server")
                    .json_body(&reply)
                    .unwrap()
                    .build();
                bus.publish(&result_topic("agent-a"), reply_envelope).await.unwrap();
                rockbot_types::DispatchOutcome::Ack
            })
        });
        bus.subscribe(TOPIC_INVOKE_MCP, "mcp-server", 8, handler, shutdown.clone()).await.unwrap();

        let result = executor
            .invoke(ToolInvocation {
                tool_call_id: "call-1".into(),
                tool_name: "lookup".into(),
                arguments: "{}".into(),
                session_id: None,
            })
            .await;

        assert!(!result.is_error);
        assert_eq!(result.content, "42");
        shutdown.cancel();
    }

    #[tokio::test]
    async fn times_out_when_no_reply_arrives() {
        let bus: Arc<dyn Transport> = Arc::new(InProcessBus::new());
        let executor = McpToolExecutor::connect(bus, "agent-b", Duration::from_millis(10)).await.unwrap();

        let result = executor
            .invoke(ToolInvocation {
                tool_call_id: "call-2".into(),
                tool_name: "lookup".into(),
                arguments: "{}".into(),
                session_id: None,
            })
            .await;

        assert!(result.is_error);
        assert!(result.content.contains("timed out"));
    }
}

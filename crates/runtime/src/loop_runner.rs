//! Agent Loop Runner (spec §4.2): drives an LLM tool-calling session to a
//! terminal assistant message. Generalizes the teacher's `tool_loop.rs`
//! (native tool-call round-trip, parallel tool execution) and `agent_loop.rs`
//! (step accounting), replacing the fixed `MAX_TOOL_ROUNDS` constant with a
//! configured step cap, the bespoke `ToolExecutor::execute` call with
//! `rockbot_exec::PolicyGate::invoke`, and adding the chunking policy and
//! cancellation the distilled spec requires that the teacher's single-process
//! TUI loop never needed.

use std::time::Duration;

use anyhow::Result;
use rockbot_exec::PolicyGate;
use rockbot_llm::{ChatMessage, ChatResponse, LlmRouter, Provider, ToolCall};
use rockbot_memory::{FeedbackLog, FeedbackSignalType, WorkingMemory};
use rockbot_tools::{ToolDescriptor, ToolInvocation};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

/// Tunables for one loop invocation (spec §4.2's `ChatOptions` plus the
/// retry/backoff and chunking knobs named in §4.0/§4.2).
#[derive(Debug, Clone)]
pub struct LoopConfig {
    pub max_steps: u32,
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub tool_result_chunk_threshold: usize,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            max_steps: 12,
            max_retries: 3,
            initial_backoff: Duration::from_millis(250),
            max_backoff: Duration::from_secs(8),
            tool_result_chunk_threshold: 10_000,
        }
    }
}

/// Where the loop landed when it returned.
#[derive(Debug, Clone)]
pub struct LoopOutcome {
    pub provider: Provider,
    pub content: String,
    pub steps_taken: u32,
    /// Set when `maxSteps` was exhausted and the synthesized terminal
    /// message looks like it was cut off mid-plan (spec §4.2 step 5).
    pub incomplete: bool,
}

/// Returns the final assistant text, or `Err` if cancelled or if an LLM call
/// fails after exhausting retries. Messages are appended to in place so the
/// caller retains the full transcript (including tool-call/tool-result
/// turns) for memory/consolidation purposes.
#[allow(clippy::too_many_arguments)]
#[instrument(skip(llm, messages, tool_gate, working_memory, feedback, config, cancellation), fields(session_id = feedback_session))]
pub async fn run_loop(
    llm: &LlmRouter,
    primary: Provider,
    ollama_model: &str,
    openrouter_model: &str,
    messages: &mut Vec<ChatMessage>,
    tool_gate: &PolicyGate,
    working_memory: &WorkingMemory,
    namespace: &str,
    feedback: &FeedbackLog,
    feedback_session: &str,
    config: &LoopConfig,
    cancellation: CancellationToken,
) -> Result<LoopOutcome> {
    let descriptors = tool_gate.visible_descriptors();
    let tools_json = tools_to_openai_json(&descriptors);
    let tools_arg = if descriptors.is_empty() { None } else { Some(&tools_json) };

    let mut steps = 0u32;
    loop {
        if cancellation.is_cancelled() {
            anyhow::bail!("loop cancelled");
        }
        if steps >= config.max_steps {
            let partial = messages
                .iter()
                .rev()
                .find(|m| matches!(m.role, rockbot_llm::ChatRole::Assistant) && m.content.is_some())
                .and_then(|m| m.content.clone())
                .unwrap_or_else(|| "Reached the step limit before finishing.".to_string());
            return Ok(LoopOutcome {
                provider: primary,
                incomplete: looks_incomplete(&partial),
                content: partial,
                steps_taken: steps,
            });
        }

        let response = call_with_retry(llm, primary, ollama_model, openrouter_model, messages, tools_arg, config, &cancellation).await?;

        if response.tool_calls.is_empty() {
            return Ok(LoopOutcome {
                provider: response.provider,
                incomplete: looks_incomplete(&response.content),
                content: response.content,
                steps_taken: steps + 1,
            });
        }

        messages.push(ChatMessage::assistant_tool_calls(response.tool_calls.clone()));

        for call in &response.tool_calls {
            if cancellation.is_cancelled() {
                anyhow::bail!("loop cancelled mid tool-call batch");
            }
            let result_text = invoke_and_chunk(
                tool_gate,
                working_memory,
                namespace,
                feedback,
                feedback_session,
                call,
                config.tool_result_chunk_threshold,
            )
            .await?;
            messages.push(ChatMessage::tool_result(&call.id, result_text));
        }

        steps += 1;
    }
}

async fn invoke_and_chunk(
    tool_gate: &PolicyGate,
    working_memory: &WorkingMemory,
    namespace: &str,
    feedback: &FeedbackLog,
    feedback_session: &str,
    call: &ToolCall,
    chunk_threshold: usize,
) -> Result<String> {
    let invocation = ToolInvocation {
        tool_call_id: call.id.clone(),
        tool_name: call.function.name.clone(),
        arguments: call.function.arguments.to_string(),
        session_id: Some(feedback_session.to_string()),
    };
    let tool_name = invocation.tool_name.clone();
    let result = tool_gate.invoke(invocation).await;
    if result.is_error {
        if let Err(err) = feedback.record(feedback_session, FeedbackSignalType::ToolFailure, format!("{tool_name}: {}", result.content)).await {
            warn!(error = %err, tool = %tool_name, "failed to record tool-failure feedback");
        }
    }
    let rendered = if result.is_error { format!("error: {}", result.content) } else { result.content };
    chunk_if_needed(working_memory, namespace, &call.id, rendered, chunk_threshold).await
}

/// Chunks a tool result into working memory when it exceeds the configured
/// threshold, returning the text that should actually be appended as the
/// tool-result message (spec §4.2 step 4).
async fn chunk_if_needed(
    working_memory: &WorkingMemory,
    namespace: &str,
    call_id: &str,
    content: String,
    threshold: usize,
) -> Result<String> {
    if content.len() <= threshold {
        return Ok(content);
    }
    let key = rockbot_memory::chunked_tool_result_key(namespace, call_id);
    working_memory
        .set(key.clone(), content, None, Some("tool-result".to_string()), vec!["tool-result".to_string()])
        .await?;
    Ok(format!("Result too large to inline; stored in working memory under key `{key}`. Read it if you need the detail."))
}

async fn call_with_retry(
    llm: &LlmRouter,
    primary: Provider,
    ollama_model: &str,
    openrouter_model: &str,
    messages: &[ChatMessage],
    tools: Option<&serde_json::Value>,
    config: &LoopConfig,
    cancellation: &CancellationToken,
) -> Result<ChatResponse> {
    let mut backoff = config.initial_backoff;
    let mut attempt = 0u32;
    loop {
        if cancellation.is_cancelled() {
            anyhow::bail!("loop cancelled before LLM call");
        }
        match llm.chat_messages(primary, ollama_model, openrouter_model, messages, tools).await {
            Ok(response) => return Ok(response),
            Err(error) if attempt < config.max_retries => {
                warn!(attempt, %error, "transient LLM error, backing off");
                tokio::select! {
                    _ = tokio::time::sleep(backoff) => {}
                    _ = cancellation.cancelled() => anyhow::bail!("loop cancelled during backoff"),
                }
                backoff = (backoff * 2).min(config.max_backoff);
                attempt += 1;
            }
            Err(error) => return Err(error),
        }
    }
}

/// Detects a terminal message that reads like it was cut off mid-plan: a
/// trailing colon, or a forward-looking phrase like "Now let me" with
/// nothing after it (spec §4.2 step 5).
pub fn looks_incomplete(text: &str) -> bool {
    let trimmed = text.trim_end();
    if trimmed.is_empty() {
        return true;
    }
    if trimmed.ends_with(':') {
        return true;
    }
    const FORWARD_LOOKING: &[&str] = &["now let me", "next, i will", "let me now", "i'll now"];
    let lower = trimmed.to_lowercase();
    FORWARD_LOOKING.iter().any(|phrase| lower.ends_with(phrase))
}

fn tools_to_openai_json(descriptors: &[ToolDescriptor]) -> serde_json::Value {
    serde_json::Value::Array(
        descriptors
            .iter()
            .map(|d| {
                let parameters: serde_json::Value =
                    serde_json::from_str(&d.parameters_schema).unwrap_or_else(|_| serde_json::json!({"type": "object", "properties": {}}));
                serde_json::json!({
                    "type": "function",
                    "function": {
                        "name": d.name,
                        "description": d.description,
                        "parameters": parameters,
                    }
                })
            })
            .collect(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_trailing_colon_as_incomplete() {
        assert!(looks_incomplete("Here is what I'll do:"));
    }

    #[test]
    fn detects_now_let_me_as_incomplete() {
        assert!(looks_incomplete("I checked the logs. Now let me"));
    }

    #[test]
    fn complete_sentence_is_not_flagged() {
        assert!(!looks_incomplete("The deployment finished successfully."));
    }

    #[test]
    fn empty_text_is_incomplete() {
        assert!(looks_incomplete("   "));
    }

    #[test]
    fn tools_to_openai_json_shapes_function_schema() {
        let descriptors = vec![ToolDescriptor {
            name: "search".into(),
            description: "search the web".into(),
            parameters_schema: r#"{"type":"object","properties":{"query":{"type":"string"}}}"#.into(),
            source: "test".into(),
        }];
        let json = tools_to_openai_json(&descriptors);
        let arr = json.as_array().unwrap();
        assert_eq!(arr.len(), 1);
        assert_eq!(arr[0]["function"]["name"], "search");
        assert_eq!(arr[0]["function"]["parameters"]["type"], "object");
    }
}

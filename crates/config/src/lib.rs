//! Configuration loading: profile base, LLM provider wiring, memory/context
//! tunables, transport and safety defaults, telemetry. Same shape as the
//! teacher's `AppConfig` — a tree of `#[serde(default)]` structs loaded from
//! TOML with env-var overrides, generalized to RockBot's wider knob set.

use std::env;
use std::fs;
use std::path::Path;

use anyhow::Result;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub name: String,
    /// Directory containing `soul.md`, `directives.md`, and the rest of the
    /// file layout in spec §6 (`memory/`, `working-memory/`, `skills/`, ...).
    pub profile_base: String,
    pub workspace_path: String,
    pub thinking_level: String,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            name: "RockBot".to_string(),
            profile_base: "agent".to_string(),
            workspace_path: ".".to_string(),
            thinking_level: "balanced".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    pub provider: String,
    pub model: String,
    pub base_url: String,
    /// Name of the environment variable holding the API key; the key itself
    /// is never stored in config (secret stores are out of scope).
    pub api_key_env: String,
    pub request_timeout_secs: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: "openai-compatible".to_string(),
            model: "gpt-4o-mini".to_string(),
            base_url: "http://localhost:11434/v1".to_string(),
            api_key_env: "ROCKBOT_LLM_API_KEY".to_string(),
            request_timeout_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    pub prefetch: usize,
    pub max_redeliveries: u32,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self { prefetch: 32, max_redeliveries: 5 }
    }
}

/// Tunables the Agent Context Builder consults for K and score floors
/// (spec §4.8's "loop runner's configured `modelBehavior`"), plus the
/// conversation/working/long-term memory knobs named throughout §3-§4.7.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    pub max_turns_per_session: usize,
    pub session_idle_timeout_secs: u64,

    pub working_memory_default_ttl_secs: u64,
    pub working_memory_max_entries_per_namespace: usize,

    pub long_term_max_results: usize,
    pub bm25_k1: f32,
    pub bm25_b: f32,

    pub context_recall_top_k: usize,
    pub context_recall_score_floor: f32,
    pub context_skill_top_k: usize,
    pub context_skill_score_floor: f32,

    /// Tool-result text longer than this many chars is chunked into working
    /// memory instead of appended inline (spec §4.2 chunking policy).
    pub tool_result_chunk_threshold: usize,

    pub auto_sleep_minutes: u64,
    pub night_sleep_start_hour: u8,
    pub night_sleep_end_hour: u8,
    pub core_rewrite_requires_approval: bool,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            max_turns_per_session: 40,
            session_idle_timeout_secs: 3600,

            working_memory_default_ttl_secs: 900,
            working_memory_max_entries_per_namespace: 200,

            long_term_max_results: 20,
            bm25_k1: 1.5,
            bm25_b: 0.75,

            context_recall_top_k: 5,
            context_recall_score_floor: 0.1,
            context_skill_top_k: 3,
            context_skill_score_floor: 0.1,

            tool_result_chunk_threshold: 10_000,

            auto_sleep_minutes: 120,
            night_sleep_start_hour: 22,
            night_sleep_end_hour: 6,
            core_rewrite_requires_approval: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub timezone: String,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self { timezone: "UTC".to_string() }
    }
}

/// Concurrency/timeout knobs for the Subagent Manager (spec §4.11) and the
/// A2A Coordinator (spec §4.12).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinationConfig {
    pub max_concurrent_subagents: usize,
    pub subagent_default_timeout_minutes: u64,
    pub a2a_default_timeout_minutes: u64,
}

impl Default for CoordinationConfig {
    fn default() -> Self {
        Self { max_concurrent_subagents: 3, subagent_default_timeout_minutes: 15, a2a_default_timeout_minutes: 5 }
    }
}

/// One statically-known peer to seed the Discovery directory with at
/// startup (spec §4.13: "optional well-known agents seeded from config are
/// marked persistent and never removed").
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct WellKnownAgent {
    pub agent_name: String,
    pub skills: Vec<String>,
    pub description: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct DiscoveryConfig {
    pub well_known_agents: Vec<WellKnownAgent>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SafetyConfig {
    /// One of `autonomous`, `balanced`, `safer` — see `rockbot-exec::ApprovalMode`.
    pub approval_mode: String,
    pub allow_shell: bool,
}

impl Default for SafetyConfig {
    fn default() -> Self {
        Self { approval_mode: "balanced".to_string(), allow_shell: false }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    pub log_level: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self { log_level: "info".to_string() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub agent: AgentConfig,
    pub llm: LlmConfig,
    pub transport: TransportConfig,
    pub memory: MemoryConfig,
    pub scheduler: SchedulerConfig,
    pub coordination: CoordinationConfig,
    pub discovery: DiscoveryConfig,
    pub safety: SafetyConfig,
    pub telemetry: TelemetryConfig,
}

impl AppConfig {
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let mut config = Self::default();
        if let Ok(raw) = fs::read_to_string(path) {
            config = toml::from_str(&raw)?;
        }

        if let Ok(value) = env::var("ROCKBOT_LLM_BASE_URL") {
            if !value.is_empty() {
                config.llm.base_url = value;
            }
        }
        if let Ok(value) = env::var("ROCKBOT_LLM_MODEL") {
            if !value.is_empty() {
                config.llm.model = value;
            }
        }

        Ok(config)
    }

    pub fn save_to(&self, path: impl AsRef<Path>) -> Result<()> {
        if let Some(parent) = path.as_ref().parent() {
            fs::create_dir_all(parent)?;
        }

        let rendered = toml::to_string_pretty(self)?;
        fs::write(path, rendered)?;
        Ok(())
    }

    pub fn profile_base(&self) -> &Path {
        Path::new(&self.agent.profile_base)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_round_trips_through_toml() {
        let config = AppConfig::default();
        let rendered = toml::to_string_pretty(&config).unwrap();
        let reparsed: AppConfig = toml::from_str(&rendered).unwrap();
        assert_eq!(reparsed.agent.name, config.agent.name);
        assert_eq!(reparsed.memory.bm25_k1, config.memory.bm25_k1);
    }

    #[test]
    fn load_from_missing_path_falls_back_to_defaults() {
        let config = AppConfig::load_from("/nonexistent/rockbot.toml").unwrap();
        assert_eq!(config.agent.name, "RockBot");
    }

    #[test]
    fn save_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rockbot.toml");
        let mut config = AppConfig::default();
        config.agent.name = "Patrol".to_string();
        config.save_to(&path).unwrap();

        let reloaded = AppConfig::load_from(&path).unwrap();
        assert_eq!(reloaded.agent.name, "Patrol");
    }
}

//! Agent Profile & Prompt Composer (spec §3, component table). Loads the
//! ordered personality documents under a profile base directory and composes
//! them into the system prompt consumed by the Agent Context Builder.
//!
//! Grounded on the teacher's `aigent-memory::vault` `## Heading` Obsidian
//! export convention for document structure, and on `runtime/prompt_builder.rs`'s
//! block-assembly style for the composition itself.

mod document;

pub use document::ProfileDocument;

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProfileError {
    #[error("required profile document missing: {0}")]
    MissingDocument(String),
    #[error("failed to read {path}: {source}")]
    Io { path: PathBuf, #[source] source: std::io::Error },
}

/// The ordered documents that make up an agent's personality: `soul` and
/// `directives` are required, `style` and `memory-rules` are optional.
pub struct AgentProfile {
    pub soul: ProfileDocument,
    pub directives: ProfileDocument,
    pub style: Option<ProfileDocument>,
    pub memory_rules: Option<ProfileDocument>,
}

impl AgentProfile {
    /// Reads `soul.md`, `directives.md`, and, if present, `style.md` and
    /// `memory-rules.md` from `base`.
    pub fn load_from(base: &Path) -> Result<Self, ProfileError> {
        let soul = read_required(base, "soul.md")?;
        let directives = read_required(base, "directives.md")?;
        let style = read_optional(base, "style.md")?;
        let memory_rules = read_optional(base, "memory-rules.md")?;

        Ok(Self {
            soul: ProfileDocument::parse(&soul),
            directives: ProfileDocument::parse(&directives),
            style: style.as_deref().map(ProfileDocument::parse),
            memory_rules: memory_rules.as_deref().map(ProfileDocument::parse),
        })
    }

    /// `"You are {name}.\n\n{soul}\n\n{directives}\n\n{memoryRules?}\n\n{style?}"`,
    /// with a trailing `Current time` line splicing in `time`/`timezone`.
    pub fn compose_system_prompt(&self, name: &str, time: DateTime<Utc>, timezone: Tz) -> String {
        let mut parts = vec![format!("You are {name}."), self.soul.full_text(), self.directives.full_text()];
        if let Some(memory_rules) = &self.memory_rules {
            parts.push(memory_rules.full_text());
        }
        if let Some(style) = &self.style {
            parts.push(style.full_text());
        }

        let local_time = time.with_timezone(&timezone);
        parts.push(format!(
            "Current time: {} ({timezone}).",
            local_time.format("%Y-%m-%d %H:%M:%S")
        ));

        parts.into_iter().filter(|p| !p.is_empty()).collect::<Vec<_>>().join("\n\n")
    }

    /// Each section of `directives` as a standalone bullet, for the Agent
    /// Context Builder's "active rules" system message (spec §4.8 item 2).
    pub fn directive_bullets(&self) -> Vec<String> {
        self.directives
            .sections
            .iter()
            .map(|(heading, body)| format!("- {heading}: {body}"))
            .collect()
    }
}

fn read_required(base: &Path, filename: &str) -> Result<String, ProfileError> {
    let path = base.join(filename);
    fs::read_to_string(&path).map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            ProfileError::MissingDocument(filename.to_string())
        } else {
            ProfileError::Io { path, source: e }
        }
    })
}

fn read_optional(base: &Path, filename: &str) -> Result<Option<String>, ProfileError> {
    let path = base.join(filename);
    match fs::read_to_string(&path) {
        Ok(contents) => Ok(Some(contents)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(ProfileError::Io { path, source: e }),
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use tempfile::tempdir;

    use super::*;

    fn write(dir: &Path, name: &str, contents: &str) {
        fs::write(dir.join(name), contents).unwrap();
    }

    #[test]
    fn loads_required_and_optional_documents() {
        let dir = tempdir().unwrap();
        write(dir.path(), "soul.md", "Warm and curious.");
        write(dir.path(), "directives.md", "## Safety\nNever give medical advice.");
        write(dir.path(), "style.md", "Short sentences.");

        let profile = AgentProfile::load_from(dir.path()).unwrap();
        assert_eq!(profile.soul.preamble, "Warm and curious.");
        assert!(profile.style.is_some());
        assert!(profile.memory_rules.is_none());
    }

    #[test]
    fn missing_required_document_errors() {
        let dir = tempdir().unwrap();
        write(dir.path(), "soul.md", "Warm.");
        let err = AgentProfile::load_from(dir.path()).unwrap_err();
        assert!(matches!(err, ProfileError::MissingDocument(name) if name == "directives.md"));
    }

    #[test]
    fn composes_system_prompt_in_spec_order() {
        let dir = tempdir().unwrap();
        write(dir.path(), "soul.md", "Soul text.");
        write(dir.path(), "directives.md", "Directive text.");
        write(dir.path(), "memory-rules.md", "Memory rule text.");

        let profile = AgentProfile::load_from(dir.path()).unwrap();
        let time = Utc.with_ymd_and_hms(2026, 7, 29, 12, 0, 0).unwrap();
        let prompt = profile.compose_system_prompt("RockBot", time, chrono_tz::UTC);

        let soul_pos = prompt.find("Soul text.").unwrap();
        let directives_pos = prompt.find("Directive text.").unwrap();
        let rules_pos = prompt.find("Memory rule text.").unwrap();
        assert!(prompt.starts_with("You are RockBot."));
        assert!(soul_pos < directives_pos);
        assert!(directives_pos < rules_pos);
        assert!(prompt.contains("Current time: 2026-07-29 12:00:00"));
    }

    #[test]
    fn directive_sections_become_bullets() {
        let dir = tempdir().unwrap();
        write(dir.path(), "soul.md", "Soul.");
        write(
            dir.path(),
            "directives.md",
            "## Safety\nNever give medical advice.\n\n## Tone\nStay upbeat.",
        );

        let profile = AgentProfile::load_from(dir.path()).unwrap();
        let bullets = profile.directive_bullets();
        assert_eq!(bullets.len(), 2);
        assert!(bullets[0].starts_with("- Safety:"));
    }
}

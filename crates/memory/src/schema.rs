//! Wire types for the three memory tiers plus the feedback/skill records
//! named in spec §3. Grounded on the shape of the teacher's `MemoryEntry`,
//! trimmed of the `MemoryTier`/embedding fields that had no spec counterpart
//! (category-prefix search replaces tier-based ranking) and extended with
//! the category/tag/TTL fields the spec actually requires.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// `{role, content, timestamp}` — one turn of a session's conversation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConversationTurn {
    pub role: ConversationRole,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ConversationRole {
    User,
    Assistant,
    System,
}

/// `{id, content, category?, tags[], createdAt, updatedAt?, metadata?}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LongTermEntry {
    pub id: Uuid,
    pub content: String,
    pub category: Option<String>,
    pub tags: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
    pub metadata: Option<serde_json::Value>,
    /// SHA-256 of `content`, recorded for provenance/dedup the way the
    /// teacher's `IndexedEntry` hashes entry content.
    pub provenance_hash: String,
}

/// `{key, value, storedAt, expiresAt, category?, tags?}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkingMemoryEntry {
    pub key: String,
    pub value: String,
    pub stored_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub category: Option<String>,
    pub tags: Vec<String>,
}

impl WorkingMemoryEntry {
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at
    }
}

/// `{name, summary, content, createdAt, updatedAt}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Skill {
    pub name: String,
    /// May be empty immediately after save; backfilled by a background job.
    pub summary: String,
    pub content: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FeedbackSignalType {
    Correction,
    ThumbsUp,
    ThumbsDown,
    ToolFailure,
    SessionSummary,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedbackEntry {
    pub session_id: String,
    pub signal_type: FeedbackSignalType,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

/// `{name, cronExpression, description, createdAt, lastFiredAt?}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduledTask {
    pub name: String,
    pub cron_expression: String,
    pub description: String,
    pub created_at: DateTime<Utc>,
    pub last_fired_at: Option<DateTime<Utc>>,
}

pub fn provenance_hash(content: &str) -> String {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Sanitizes a slash-separated category path: alphanumeric / `-` / `_` / `/`
/// only, no `..`, no leading `/`. Returns `None` if nothing survives.
pub fn sanitize_category(raw: &str) -> Option<String> {
    let trimmed = raw.trim().trim_start_matches('/');
    if trimmed.is_empty() || trimmed.contains("..") {
        return None;
    }
    let ok = trimmed
        .chars()
        .all(|c| c.is_alphanumeric() || c == '-' || c == '_' || c == '/');
    if !ok {
        return None;
    }
    Some(trimmed.to_string())
}

pub fn normalize_tags(tags: Vec<String>) -> Vec<String> {
    tags.into_iter().map(|t| t.trim().to_lowercase()).filter(|t| !t.is_empty()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_category_rejects_traversal_and_leading_slash() {
        assert_eq!(sanitize_category("user-preferences/pets"), Some("user-preferences/pets".to_string()));
        assert_eq!(sanitize_category("/leading"), Some("leading".to_string()));
        assert_eq!(sanitize_category("../escape"), None);
        assert_eq!(sanitize_category("bad char!"), None);
    }

    #[test]
    fn normalize_tags_lowercases_and_drops_blank() {
        assert_eq!(normalize_tags(vec!["Pets".into(), " ".into(), "Home".into()]), vec!["pets", "home"]);
    }
}

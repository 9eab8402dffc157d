//! The three memory tiers and skill store named in spec §3-§4: a volatile
//! per-session conversation window, a TTL-scoped working memory, a durable
//! long-term memory, and a durable skill store — all BM25-ranked over the
//! same tokenizer and ranking function (`bm25`).

pub mod bm25;
pub mod conversation;
pub mod event_log;
pub mod feedback;
pub mod index;
pub mod long_term;
pub mod schema;
pub mod skills;
pub mod working;

pub use bm25::{tokenize, score_corpus, Bm25Params};
pub use conversation::ConversationMemory;
pub use event_log::EventLog;
pub use feedback::FeedbackLog;
pub use index::{IndexCacheStats, IndexedMeta, MemoryIndex};
pub use long_term::{LongTermMemory, SearchCriteria};
pub use schema::{
    normalize_tags, provenance_hash, sanitize_category, ConversationRole, ConversationTurn,
    FeedbackEntry, FeedbackSignalType, LongTermEntry, ScheduledTask, Skill, WorkingMemoryEntry,
};
pub use skills::{RecallSessionTracker, SkillSessionTracker, SkillStore};
pub use working::{chunked_tool_result_key, WorkingMemory, WorkingSearchCriteria};

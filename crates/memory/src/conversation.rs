//! Conversation Memory (spec §4.4): a volatile, per-session sliding window
//! of turns. Oldest-first eviction once `maxTurnsPerSession` is exceeded;
//! idle sessions are discarded after `sessionIdleTimeout`.

use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use crate::schema::ConversationTurn;

struct SessionState {
    turns: VecDeque<ConversationTurn>,
    last_active: DateTime<Utc>,
}

pub struct ConversationMemory {
    max_turns_per_session: usize,
    session_idle_timeout: chrono::Duration,
    sessions: Mutex<HashMap<String, SessionState>>,
}

impl ConversationMemory {
    pub fn new(max_turns_per_session: usize, session_idle_timeout_secs: u64) -> Self {
        Self {
            max_turns_per_session,
            session_idle_timeout: chrono::Duration::seconds(session_idle_timeout_secs as i64),
            sessions: Mutex::new(HashMap::new()),
        }
    }

    pub async fn append(&self, session_id: &str, turn: ConversationTurn) {
        let mut sessions = self.sessions.lock().await;
        let session = sessions.entry(session_id.to_string()).or_insert_with(|| SessionState {
            turns: VecDeque::new(),
            last_active: turn.timestamp,
        });
        session.last_active = turn.timestamp;
        session.turns.push_back(turn);
        while session.turns.len() > self.max_turns_per_session {
            session.turns.pop_front();
        }
    }

    pub async fn turns(&self, session_id: &str) -> Vec<ConversationTurn> {
        self.sessions
            .lock()
            .await
            .get(session_id)
            .map(|s| s.turns.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub async fn has_session(&self, session_id: &str) -> bool {
        self.sessions.lock().await.contains_key(session_id)
    }

    /// Discards sessions whose last activity is older than the idle
    /// timeout. Returns how many were discarded.
    pub async fn sweep_idle(&self, now: DateTime<Utc>) -> usize {
        let mut sessions = self.sessions.lock().await;
        let before = sessions.len();
        sessions.retain(|_, state| now - state.last_active < self.session_idle_timeout);
        before - sessions.len()
    }
}

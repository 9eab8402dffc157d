use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, OwnedMutexGuard};

/// Serializes dispatch per session id so a single session's messages are
/// always handled in order, while distinct sessions still run concurrently.
/// Sessions are identified by peeking the envelope body for a `sessionId`
/// JSON field rather than requiring every registered type to expose one
/// through the type system.
#[derive(Default)]
pub struct SessionGate {
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl SessionGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn acquire(&self, session_id: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().await;
            locks.entry(session_id.to_string()).or_insert_with(|| Arc::new(Mutex::new(()))).clone()
        };
        lock.lock_owned().await
    }
}

/// Best-effort extraction of a `sessionId` string field from a JSON body.
/// Returns `None` for non-JSON bodies or payloads without the field, in
/// which case dispatch proceeds without session-level serialization.
pub fn extract_session_id(body: &[u8]) -> Option<String> {
    let value: serde_json::Value = serde_json::from_slice(body).ok()?;
    value.get("sessionId")?.as_str().map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_session_id_from_json_body() {
        let body = br#"{"sessionId":"abc-123","text":"hi"}"#;
        assert_eq!(extract_session_id(body), Some("abc-123".to_string()));
    }

    #[test]
    fn missing_field_or_non_json_returns_none() {
        assert_eq!(extract_session_id(br#"{"text":"hi"}"#), None);
        assert_eq!(extract_session_id(b"not json"), None);
    }

    #[tokio::test]
    async fn same_session_serializes_distinct_sessions_do_not_block() {
        let gate = Arc::new(SessionGate::new());
        let order = Arc::new(Mutex::new(Vec::new()));

        let g1 = gate.clone();
        let o1 = order.clone();
        let t1 = tokio::spawn(async move {
            let _guard = g1.acquire("s1").await;
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            o1.lock().await.push("s1-a");
        });
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let g2 = gate.clone();
        let o2 = order.clone();
        let t2 = tokio::spawn(async move {
            let _guard = g2.acquire("s1").await;
            o2.lock().await.push("s1-b");
        });

        t1.await.unwrap();
        t2.await.unwrap();
        assert_eq!(*order.lock().await, vec!["s1-a", "s1-b"]);
    }
}

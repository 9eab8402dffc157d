use std::collections::BTreeMap;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The immutable message record exchanged on the bus (spec §3).
///
/// `headers` is a `BTreeMap` rather than a `HashMap` so reserved `rb-*` keys
/// sort predictably in `{:?}` output and log fields — the same reason the
/// teacher's config structs keep deterministic serialization.
///
/// Bodies travel as opaque bytes (typically JSON); the envelope itself never
/// mutates after construction, so retries resend exactly the same bytes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub message_id: Uuid,
    pub message_type: String,
    pub correlation_id: Option<Uuid>,
    pub reply_to: Option<String>,
    pub source: String,
    pub destination: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub headers: BTreeMap<String, String>,
    pub body: Vec<u8>,
}

impl Envelope {
    pub fn builder(message_type: impl Into<String>, source: impl Into<String>) -> EnvelopeBuilder {
        EnvelopeBuilder::new(message_type, source)
    }

    /// Deserialize `body` as JSON into `T`.
    pub fn body_as<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_slice(&self.body)?)
    }

    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers.get(key).map(|s| s.as_str())
    }

    /// Returns a clone of `self` with `rb-retry-count` incremented (absent
    /// counts as zero). Used by `RetryCountMiddleware` — the envelope body
    /// and identity fields are unchanged, only the header map differs.
    pub fn with_incremented_retry_count(&self) -> Envelope {
        let mut next = self.clone();
        let current: u32 = next
            .headers
            .get(crate::reserved::RETRY_COUNT)
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
        next.headers
            .insert(crate::reserved::RETRY_COUNT.to_string(), (current + 1).to_string());
        next
    }

    pub fn retry_count(&self) -> u32 {
        self.headers
            .get(crate::reserved::RETRY_COUNT)
            .and_then(|v| v.parse().ok())
            .unwrap_or(0)
    }
}

pub struct EnvelopeBuilder {
    message_type: String,
    source: String,
    correlation_id: Option<Uuid>,
    reply_to: Option<String>,
    destination: Option<String>,
    headers: BTreeMap<String, String>,
    body: Vec<u8>,
}

impl EnvelopeBuilder {
    fn new(message_type: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            message_type: message_type.into(),
            source: source.into(),
            correlation_id: None,
            reply_to: None,
            destination: None,
            headers: BTreeMap::new(),
            body: Vec::new(),
        }
    }

    pub fn correlation_id(mut self, id: Uuid) -> Self {
        self.correlation_id = Some(id);
        self
    }

    pub fn reply_to(mut self, topic: impl Into<String>) -> Self {
        self.reply_to = Some(topic.into());
        self
    }

    pub fn destination(mut self, agent: impl Into<String>) -> Self {
        self.destination = Some(agent.into());
        self
    }

    pub fn header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    pub fn json_body<T: Serialize>(mut self, body: &T) -> Result<Self> {
        self.body = serde_json::to_vec(body)?;
        Ok(self)
    }

    pub fn raw_body(mut self, body: Vec<u8>) -> Self {
        self.body = body;
        self
    }

    pub fn build(self) -> Envelope {
        Envelope {
            message_id: Uuid::new_v4(),
            message_type: self.message_type,
            correlation_id: self.correlation_id,
            reply_to: self.reply_to,
            source: self.source,
            destination: self.destination,
            timestamp: Utc::now(),
            headers: self.headers,
            body: self.body,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Serialize, Deserialize, PartialEq, Debug)]
    struct Payload {
        text: String,
    }

    #[test]
    fn builder_round_trips_json_body() {
        let envelope = Envelope::builder("UserMessage", "cli")
            .json_body(&Payload { text: "hi".into() })
            .unwrap()
            .build();
        let decoded: Payload = envelope.body_as().unwrap();
        assert_eq!(decoded.text, "hi");
    }

    #[test]
    fn retry_count_starts_at_zero_and_increments() {
        let envelope = Envelope::builder("UserMessage", "cli").build();
        assert_eq!(envelope.retry_count(), 0);
        let once = envelope.with_incremented_retry_count();
        assert_eq!(once.retry_count(), 1);
        let twice = once.with_incremented_retry_count();
        assert_eq!(twice.retry_count(), 2);
    }

    #[test]
    fn round_trip_preserves_identity_fields() {
        let correlation = Uuid::new_v4();
        let envelope = Envelope::builder("AgentTaskRequest", "bot-a")
            .correlation_id(correlation)
            .reply_to("agent.response.bot-a")
            .build();
        let retried = envelope.with_incremented_retry_count();
        assert_eq!(retried.message_id, envelope.message_id);
        assert_eq!(retried.correlation_id, Some(correlation));
        assert_eq!(retried.source, envelope.source);
        assert_eq!(retried.reply_to, envelope.reply_to);
    }
}

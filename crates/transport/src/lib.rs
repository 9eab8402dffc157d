//! The transport contract (spec §6) and an in-process binding good enough to
//! drive the end-to-end scenarios in the testable-properties section without
//! a real broker. Grounded on the client/server framing in
//! `aigent-runtime::server` (in-process daemon dispatch) and on the
//! `CancellationToken`/`broadcast`/`mpsc` shape of the agenticlaw queue sketch
//! in the retrieval pack's `other_examples`.

mod inprocess;
mod topic;

pub use inprocess::InProcessBus;
pub use topic::topic_matches;

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use rockbot_types::{DispatchOutcome, Envelope};

/// A handler invoked once per delivered envelope. Returns the outcome the
/// binding should act on: acknowledge, redeliver, or dead-letter.
pub type DispatchFn = Arc<
    dyn Fn(Envelope, CancellationToken) -> Pin<Box<dyn Future<Output = DispatchOutcome> + Send>>
        + Send
        + Sync,
>;

/// A live subscription. Dropping or cancelling `shutdown` tears it down.
pub struct Subscription {
    pub queue_name: String,
    shutdown: CancellationToken,
}

impl Subscription {
    pub fn unsubscribe(&self) {
        self.shutdown.cancel();
    }
}

/// What the core requires of any bus binding (spec §6).
///
/// `subscribe` takes wildcard `topicPattern`s over dot-separated topics:
/// `*` matches exactly one segment, `#` matches the remainder (zero or more
/// segments). Manual acknowledgment: `Retry` redelivers, `DeadLetter` routes
/// to a DLQ topic of the same base name (`{topic}.dlq`). Headers are
/// preserved verbatim across the transport — the in-process binding achieves
/// this for free since it never re-serializes the envelope.
#[async_trait]
pub trait Transport: Send + Sync {
    /// At-least-once publish.
    async fn publish(&self, topic: &str, envelope: Envelope) -> Result<()>;

    /// `prefetch` bounds how many unacknowledged envelopes this subscription
    /// will buffer before `publish` callers start waiting — the backpressure
    /// mechanism named in spec §5 ("unacknowledged messages accumulate [in
    /// the transport], not in the process").
    async fn subscribe(
        &self,
        topic_pattern: &str,
        queue_name: &str,
        prefetch: usize,
        handler: DispatchFn,
        shutdown: CancellationToken,
    ) -> Result<Subscription>;

    /// Snapshot of envelopes currently sitting in a dead-letter queue, for
    /// tests and operational inspection. Not part of the abstract contract,
    /// but every binding this workspace ships provides it.
    async fn dead_letters(&self, topic: &str) -> Vec<Envelope>;
}

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use rockbot_types::{DispatchOutcome, Envelope};

use crate::topic::topic_matches;
use crate::{DispatchFn, Subscription, Transport};

/// Envelopes that fail more than this many times are routed to the DLQ
/// rather than redelivered forever.
const MAX_REDELIVERIES: u32 = 5;

struct Queue {
    pattern: String,
    tx: mpsc::Sender<Envelope>,
}

/// A tokio-native binding of the transport contract: fan-out to every
/// matching subscription, each backed by its own bounded `mpsc` queue (the
/// bound *is* the prefetch limit — `publish` awaits capacity exactly like a
/// real broker applies backpressure to a slow consumer). Good enough to
/// drive the §8 scenarios without a real broker; a durable binding is a
/// `Transport` impl point left to deployment glue.
#[derive(Default, Clone)]
pub struct InProcessBus {
    queues: Arc<Mutex<HashMap<String, Queue>>>,
    dlq: Arc<Mutex<HashMap<String, Vec<Envelope>>>>,
}

impl InProcessBus {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Transport for InProcessBus {
    async fn publish(&self, topic: &str, envelope: Envelope) -> Result<()> {
        let queues = self.queues.lock().await;
        let mut delivered = 0;
        for queue in queues.values() {
            if topic_matches(&queue.pattern, topic) {
                delivered += 1;
                // Backpressure: awaits capacity, exactly the prefetch bound.
                if queue.tx.send(envelope.clone()).await.is_err() {
                    warn!(topic, "subscriber queue closed, dropping delivery");
                }
            }
        }
        debug!(topic, delivered, "published envelope");
        Ok(())
    }

    async fn subscribe(
        &self,
        topic_pattern: &str,
        queue_name: &str,
        prefetch: usize,
        handler: DispatchFn,
        shutdown: CancellationToken,
    ) -> Result<Subscription> {
        let (tx, mut rx) = mpsc::channel::<Envelope>(prefetch.max(1));
        self.queues.lock().await.insert(
            queue_name.to_string(),
            Queue { pattern: topic_pattern.to_string(), tx: tx.clone() },
        );

        let requeue_tx = tx.clone();
        let dlq = self.dlq.clone();
        let queue_name_owned = queue_name.to_string();
        let task_shutdown = shutdown.clone();

        tokio::spawn(async move {
            loop {
                let envelope = tokio::select! {
                    _ = task_shutdown.cancelled() => break,
                    received = rx.recv() => match received {
                        Some(envelope) => envelope,
                        None => break,
                    },
                };

                let message_token = task_shutdown.child_token();
                let outcome = handler(envelope.clone(), message_token).await;
                match outcome {
                    DispatchOutcome::Ack => {}
                    DispatchOutcome::Retry => {
                        let retried = envelope.with_incremented_retry_count();
                        if retried.retry_count() > MAX_REDELIVERIES {
                            dlq.lock()
                                .await
                                .entry(queue_name_owned.clone())
                                .or_default()
                                .push(retried);
                        } else if requeue_tx.send(retried).await.is_err() {
                            break;
                        }
                    }
                    DispatchOutcome::DeadLetter { reason } => {
                        warn!(queue = %queue_name_owned, reason, "dead-lettering envelope");
                        dlq.lock()
                            .await
                            .entry(queue_name_owned.clone())
                            .or_default()
                            .push(envelope);
                    }
                }
            }
        });

        Ok(Subscription { queue_name: queue_name.to_string(), shutdown })
    }

    async fn dead_letters(&self, topic: &str) -> Vec<Envelope> {
        self.dlq.lock().await.get(topic).cloned().unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use rockbot_types::Envelope;

    use super::*;

    fn envelope(message_type: &str) -> Envelope {
        Envelope::builder(message_type, "test").build()
    }

    #[tokio::test]
    async fn delivers_to_matching_subscription_and_acks() {
        let bus = InProcessBus::new();
        let received = Arc::new(AtomicUsize::new(0));
        let received_clone = received.clone();

        let handler: DispatchFn = Arc::new(move |_envelope, _ct| {
            let counter = received_clone.clone();
            Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
                DispatchOutcome::Ack
            })
        });

        let shutdown = CancellationToken::new();
        bus.subscribe("agent.task", "q1", 8, handler, shutdown.clone())
            .await
            .unwrap();

        bus.publish("agent.task", envelope("UserMessage")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(received.load(Ordering::SeqCst), 1);
        shutdown.cancel();
    }

    #[tokio::test]
    async fn retry_exceeding_max_lands_in_dead_letter_queue() {
        let bus = InProcessBus::new();
        let handler: DispatchFn =
            Arc::new(|_envelope, _ct| Box::pin(async move { DispatchOutcome::Retry }));

        let shutdown = CancellationToken::new();
        bus.subscribe("agent.task", "q-retry", 8, handler, shutdown.clone())
            .await
            .unwrap();

        bus.publish("agent.task", envelope("UserMessage")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let dead = bus.dead_letters("q-retry").await;
        assert_eq!(dead.len(), 1);
        assert!(dead[0].retry_count() > MAX_REDELIVERIES);
        shutdown.cancel();
    }

    #[tokio::test]
    async fn unmatched_topic_is_not_delivered() {
        let bus = InProcessBus::new();
        let received = Arc::new(AtomicUsize::new(0));
        let received_clone = received.clone();
        let handler: DispatchFn = Arc::new(move |_e, _ct| {
            let counter = received_clone.clone();
            Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
                DispatchOutcome::Ack
            })
        });

        let shutdown = CancellationToken::new();
        bus.subscribe("agent.task", "q2", 4, handler, shutdown.clone())
            .await
            .unwrap();
        bus.publish("discovery.announce", envelope("AgentCard")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(received.load(Ordering::SeqCst), 0);
        shutdown.cancel();
    }
}

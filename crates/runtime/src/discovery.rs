//! Discovery (spec §4.13): a directory of known agents built from
//! `AgentCard` broadcasts on a well-known topic. Grounded on the teacher's
//! `server.rs` startup-announce pattern, generalized from its single
//! hard-coded peer into an open directory keyed by agent name.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use rockbot_transport::Transport;
use rockbot_types::Envelope;
use tokio::sync::RwLock;
use tracing::info;

use crate::messages::AgentCard;

pub const TOPIC_DISCOVERY_ANNOUNCE: &str = "discovery.announce";

#[derive(Debug, Clone)]
struct DirectoryEntry {
    card: AgentCard,
    /// Well-known agents seeded from config are never evicted.
    persistent: bool,
}

/// The live directory of agents this host has heard from (or was configured
/// to know about up front).
#[derive(Default)]
pub struct Discovery {
    directory: RwLock<HashMap<String, DirectoryEntry>>,
}

impl Discovery {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds well-known agents from config. These entries are never removed
    /// by subsequent directory churn (there is none today — upserts only add
    /// or refresh — but this marks intent per spec §4.13).
    pub async fn seed_well_known(&self, cards: Vec<AgentCard>) {
        let mut directory = self.directory.write().await;
        for card in cards {
            directory.insert(card.agent_name.clone(), DirectoryEntry { card, persistent: true });
        }
    }

    /// Publishes our own card once on `discovery.announce`, if configured.
    pub async fn announce(&self, transport: &dyn Transport, source: &str, card: &AgentCard) -> Result<()> {
        let envelope = Envelope::builder("AgentCard", source).json_body(card)?.build();
        transport.publish(TOPIC_DISCOVERY_ANNOUNCE, envelope).await
    }

    /// Upserts an inbound card into the directory.
    pub async fn upsert(&self, card: AgentCard) {
        let mut directory = self.directory.write().await;
        let persistent = directory.get(&card.agent_name).map(|e| e.persistent).unwrap_or(false);
        info!(agent = %card.agent_name, "discovered agent card");
        directory.insert(card.agent_name.clone(), DirectoryEntry { card, persistent });
    }

    pub async fn get(&self, agent_name: &str) -> Option<AgentCard> {
        self.directory.read().await.get(agent_name).map(|e| e.card.clone())
    }

    pub async fn list(&self) -> Vec<AgentCard> {
        let mut cards: Vec<_> = self.directory.read().await.values().map(|e| e.card.clone()).collect();
        cards.sort_by(|a, b| a.agent_name.cmp(&b.agent_name));
        cards
    }
}

pub type SharedDiscovery = Arc<Discovery>;

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use rockbot_transport::{DispatchFn, Subscription};
    use tokio_util::sync::CancellationToken;

    use super::*;

    struct NullTransport;

    #[async_trait]
    impl Transport for NullTransport {
        async fn publish(&self, _topic: &str, _envelope: Envelope) -> Result<()> {
            Ok(())
        }
        async fn subscribe(
            &self,
            _topic_pattern: &str,
            queue_name: &str,
            _prefetch: usize,
            _handler: DispatchFn,
            shutdown: CancellationToken,
        ) -> Result<Subscription> {
            Ok(Subscription { queue_name: queue_name.to_string(), shutdown })
        }
        async fn dead_letters(&self, _topic: &str) -> Vec<Envelope> {
            Vec::new()
        }
    }

    fn card(name: &str) -> AgentCard {
        AgentCard { agent_name: name.to_string(), skills: vec!["chat".into()], description: "a bot".into() }
    }

    #[tokio::test]
    async fn upsert_inserts_and_refreshes_by_name() {
        let discovery = Discovery::new();
        discovery.upsert(card("bot-a")).await;
        assert!(discovery.get("bot-a").await.is_some());

        let mut refreshed = card("bot-a");
        refreshed.description = "an updated bot".to_string();
        discovery.upsert(refreshed).await;
        assert_eq!(discovery.get("bot-a").await.unwrap().description, "an updated bot");
        assert_eq!(discovery.list().await.len(), 1);
    }

    #[tokio::test]
    async fn well_known_seed_is_marked_persistent() {
        let discovery = Discovery::new();
        discovery.seed_well_known(vec![card("bot-b")]).await;
        assert!(discovery.directory.read().await.get("bot-b").unwrap().persistent);
    }

    #[tokio::test]
    async fn announce_publishes_agent_card_envelope() {
        let discovery = Discovery::new();
        discovery.announce(&NullTransport, "rockbot", &card("rockbot")).await.unwrap();
    }
}

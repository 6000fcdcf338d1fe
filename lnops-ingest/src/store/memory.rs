use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use log::*;
use time::OffsetDateTime;

use super::{Error, Store};
use crate::model::{
    ChannelId, ChannelPolicyKey, ChannelSettings, ForwardEvent, HtlcEvent, HtlcEventKey,
    NodeAnnouncement, NodeId, NodeKey, OnChainTransaction, RoutingPolicy, Versioned,
};

#[derive(Default)]
struct State {
    forwards: BTreeMap<(OffsetDateTime, u64), ForwardEvent>,
    htlc_keys: HashSet<HtlcEventKey>,
    htlc_events: Vec<HtlcEvent>,
    transactions: BTreeMap<(i64, String), OnChainTransaction>,
    routing_policies: HashMap<ChannelPolicyKey, Vec<Versioned<RoutingPolicy>>>,
    node_announcements: HashMap<NodeId, Vec<Versioned<NodeAnnouncement>>>,
    nodes: HashMap<NodeKey, NodeId>,
    channels: BTreeMap<ChannelId, ChannelSettings>,
    failing_writes: usize,
}

impl State {
    // consumes one injected failure, if any
    fn check_write(&mut self) -> Result<(), Error> {
        if self.failing_writes > 0 {
            self.failing_writes -= 1;
            return Err(Error::Unavailable("injected write failure".to_string()));
        }
        Ok(())
    }
}

/// A store keeping everything in memory.
///
/// Rows are kept in the same shape as the database tables, including the
/// change logs, so tests can inspect what would have been written.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Make the next `count` write operations fail with [`Error::Unavailable`].
    pub fn fail_next_writes(&self, count: usize) {
        self.state().failing_writes = count;
    }

    /// Register a channel, as the channel management layer would.
    pub fn insert_channel(&self, settings: ChannelSettings) {
        self.state().channels.insert(settings.channel_id, settings);
    }

    pub fn forwards(&self) -> Vec<ForwardEvent> {
        self.state().forwards.values().cloned().collect()
    }

    pub fn htlc_events(&self) -> Vec<HtlcEvent> {
        self.state().htlc_events.clone()
    }

    pub fn transactions(&self) -> Vec<OnChainTransaction> {
        self.state().transactions.values().cloned().collect()
    }

    /// The routing policy change log of a channel direction, in insertion order.
    pub fn routing_policies(&self, key: &ChannelPolicyKey) -> Vec<Versioned<RoutingPolicy>> {
        self.state().routing_policies.get(key).cloned().unwrap_or_default()
    }

    /// The announcement change log of a node, in insertion order.
    pub fn node_announcements(&self, node: NodeId) -> Vec<Versioned<NodeAnnouncement>> {
        self.state().node_announcements.get(&node).cloned().unwrap_or_default()
    }
}

// The most recent row by event time, the later insert wins a tie.
fn latest<T: Clone>(rows: Option<&Vec<Versioned<T>>>) -> Option<Versioned<T>> {
    rows?.iter().max_by_key(|row| row.event_time).cloned()
}

#[async_trait]
impl Store for MemoryStore {
    async fn last_forward_time_ns(&self) -> Result<Option<u64>, Error> {
        Ok(self.state().forwards.values().map(|forward| forward.time_ns).max())
    }

    async fn store_forwards(&self, forwards: &[ForwardEvent]) -> Result<usize, Error> {
        let mut state = self.state();
        state.check_write()?;
        let mut inserted = 0;
        for forward in forwards {
            let key = forward.natural_key();
            if !state.forwards.contains_key(&key) {
                state.forwards.insert(key, forward.clone());
                inserted += 1;
            }
        }
        debug!("stored {} of {} forwards", inserted, forwards.len());
        Ok(inserted)
    }

    async fn store_htlc_event(&self, event: &HtlcEvent) -> Result<bool, Error> {
        let key = match event.natural_key() {
            Some(key) => key,
            None => return Ok(false),
        };
        let mut state = self.state();
        state.check_write()?;
        if !state.htlc_keys.insert(key) {
            return Ok(false);
        }
        state.htlc_events.push(event.clone());
        Ok(true)
    }

    async fn last_transaction_height(&self) -> Result<Option<u32>, Error> {
        Ok(self.state().transactions.values().map(|tx| tx.block_height).max())
    }

    async fn store_transactions(
        &self,
        transactions: &[OnChainTransaction],
    ) -> Result<usize, Error> {
        let mut state = self.state();
        state.check_write()?;
        let mut inserted = 0;
        for transaction in transactions {
            let key = transaction.natural_key();
            if !state.transactions.contains_key(&key) {
                state.transactions.insert(key, transaction.clone());
                inserted += 1;
            }
        }
        Ok(inserted)
    }

    async fn store_transaction(&self, transaction: &OnChainTransaction) -> Result<bool, Error> {
        let mut state = self.state();
        state.check_write()?;
        let key = transaction.natural_key();
        if state.transactions.contains_key(&key) {
            return Ok(false);
        }
        state.transactions.insert(key, transaction.clone());
        Ok(true)
    }

    async fn latest_routing_policy(
        &self,
        key: &ChannelPolicyKey,
    ) -> Result<Option<Versioned<RoutingPolicy>>, Error> {
        Ok(latest(self.state().routing_policies.get(key)))
    }

    async fn insert_routing_policy(
        &self,
        key: &ChannelPolicyKey,
        policy: &Versioned<RoutingPolicy>,
    ) -> Result<(), Error> {
        let mut state = self.state();
        state.check_write()?;
        state.routing_policies.entry(*key).or_default().push(policy.clone());
        Ok(())
    }

    async fn latest_node_announcement(
        &self,
        node: NodeId,
    ) -> Result<Option<Versioned<NodeAnnouncement>>, Error> {
        Ok(latest(self.state().node_announcements.get(&node)))
    }

    async fn insert_node_announcement(
        &self,
        node: NodeId,
        announcement: &Versioned<NodeAnnouncement>,
    ) -> Result<(), Error> {
        let mut state = self.state();
        state.check_write()?;
        state.node_announcements.entry(node).or_default().push(announcement.clone());
        Ok(())
    }

    async fn add_node_when_new(&self, key: &NodeKey) -> Result<NodeId, Error> {
        let mut state = self.state();
        if let Some(node_id) = state.nodes.get(key) {
            return Ok(*node_id);
        }
        state.check_write()?;
        let node_id = NodeId(state.nodes.len() as i32 + 1);
        state.nodes.insert(key.clone(), node_id);
        Ok(node_id)
    }

    async fn channels(&self) -> Result<Vec<ChannelSettings>, Error> {
        Ok(self.state().channels.values().cloned().collect())
    }

    async fn nodes(&self) -> Result<Vec<(NodeKey, NodeId)>, Error> {
        Ok(self.state().nodes.iter().map(|(key, id)| (key.clone(), *id)).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Chain, Network};
    use crate::testing::{forward, transaction};
    use crate::util::time_from_secs;
    use test_log::test;

    #[test(tokio::test)]
    async fn forwards_are_stored_once_test() {
        let store = MemoryStore::new();
        assert_eq!(store.last_forward_time_ns().await.unwrap(), None);
        let page = vec![forward(100), forward(100), forward(150)];
        assert_eq!(store.store_forwards(&page).await.unwrap(), 2);
        assert_eq!(store.store_forwards(&page).await.unwrap(), 0);
        assert_eq!(store.forwards().len(), 2);
        assert_eq!(store.last_forward_time_ns().await.unwrap(), Some(150));
    }

    #[test(tokio::test)]
    async fn failed_batch_is_not_applied_test() {
        let store = MemoryStore::new();
        store.fail_next_writes(1);
        assert!(store.store_forwards(&[forward(1), forward(2)]).await.is_err());
        assert!(store.forwards().is_empty());
        assert_eq!(store.store_forwards(&[forward(1), forward(2)]).await.unwrap(), 2);
    }

    #[test(tokio::test)]
    async fn transactions_test() {
        let store = MemoryStore::new();
        assert_eq!(store.last_transaction_height().await.unwrap(), None);
        assert!(store.store_transaction(&transaction("aa", 10)).await.unwrap());
        assert!(!store.store_transaction(&transaction("aa", 10)).await.unwrap());
        let page = vec![transaction("aa", 10), transaction("bb", 12)];
        assert_eq!(store.store_transactions(&page).await.unwrap(), 1);
        assert_eq!(store.last_transaction_height().await.unwrap(), Some(12));
    }

    #[test(tokio::test)]
    async fn latest_routing_policy_test() {
        let store = MemoryStore::new();
        let key = ChannelPolicyKey {
            channel_id: ChannelId(1),
            announcing_node_id: NodeId(2),
            connecting_node_id: NodeId(3),
        };
        assert!(store.latest_routing_policy(&key).await.unwrap().is_none());
        let older = Versioned::new(
            time_from_secs(10),
            NodeId(1),
            RoutingPolicy { fee_base_msat: 1, ..Default::default() },
        );
        let newer = Versioned::new(
            time_from_secs(20),
            NodeId(1),
            RoutingPolicy { fee_base_msat: 2, ..Default::default() },
        );
        store.insert_routing_policy(&key, &newer).await.unwrap();
        store.insert_routing_policy(&key, &older).await.unwrap();
        assert_eq!(store.latest_routing_policy(&key).await.unwrap(), Some(newer));
    }

    #[test(tokio::test)]
    async fn add_node_when_new_test() {
        let store = MemoryStore::new();
        let alice = NodeKey::new("02aa", Chain::Bitcoin, Network::RegTest);
        let bob = NodeKey::new("02bb", Chain::Bitcoin, Network::RegTest);
        let alice_id = store.add_node_when_new(&alice).await.unwrap();
        let bob_id = store.add_node_when_new(&bob).await.unwrap();
        assert_ne!(alice_id, bob_id);
        assert_eq!(store.add_node_when_new(&alice).await.unwrap(), alice_id);
        assert_eq!(store.nodes().await.unwrap().len(), 2);
    }
}

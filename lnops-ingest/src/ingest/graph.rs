use std::sync::Arc;

use async_trait::async_trait;
use log::*;
use time::OffsetDateTime;
use tonic::Status;

use crate::backend::{
    BackendStream, ChannelEdgeUpdate, GraphTopologyUpdate, NodeBackend, NodeUpdate,
};
use crate::cache::IdentifierCache;
use crate::detector::ChangeDetector;
use crate::model::{ChannelPolicyKey, NodeId, NodeSettings, Versioned};
use crate::store::Store;
use crate::subscription::{FailurePolicy, StreamHandler};
use crate::util::convert_lnd_short_channel_id;
use crate::Error;

/// Keeps the change logs of node announcements and routing policies.
///
/// Announcements are recorded only for nodes the cache already knows.
/// Policies are recorded only for channels which are active in the cache;
/// unknown peers of such channels are created on the way.
pub struct ChannelGraph {
    backend: Arc<dyn NodeBackend>,
    store: Arc<dyn Store>,
    cache: IdentifierCache,
    detector: ChangeDetector,
    settings: NodeSettings,
    name: String,
}

impl ChannelGraph {
    pub fn new(
        backend: Arc<dyn NodeBackend>,
        store: Arc<dyn Store>,
        cache: IdentifierCache,
        detector: ChangeDetector,
        settings: NodeSettings,
    ) -> Self {
        let name = format!("{} channel graph", backend.log_prefix());
        ChannelGraph { backend, store, cache, detector, settings, name }
    }

    async fn record_node(&self, update: NodeUpdate) -> Result<(), Error> {
        let key = self.settings.node_key(&update.identity_key);
        let node_id = match self.cache.node_id(&key).await? {
            Some(node_id) => node_id,
            None => {
                trace!("{}: not tracking node {}", self.name, update.identity_key);
                return Ok(());
            }
        };
        let snapshot =
            Versioned::new(OffsetDateTime::now_utc(), self.settings.node_id, update.announcement);
        self.detector.observe(node_id, snapshot).await?;
        Ok(())
    }

    async fn record_policy(&self, update: ChannelEdgeUpdate) -> Result<(), Error> {
        let policy = match update.routing_policy {
            Some(policy) => policy,
            None => {
                let short_channel_id = convert_lnd_short_channel_id(update.chan_id);
                debug!("{}: no routing policy for {}", self.name, short_channel_id);
                return Ok(());
            }
        };
        let outpoint = &update.funding_outpoint;
        let channel_id = match self.cache.active_channel_id_by_funding_outpoint(outpoint).await? {
            Some(channel_id) => channel_id,
            None => {
                let short_channel_id = convert_lnd_short_channel_id(update.chan_id);
                trace!("{}: not tracking channel {} ({})", self.name, short_channel_id, outpoint);
                return Ok(());
            }
        };
        let key = ChannelPolicyKey {
            channel_id,
            announcing_node_id: self.resolve_node(&update.advertising_node).await?,
            connecting_node_id: self.resolve_node(&update.connecting_node).await?,
        };
        let snapshot = Versioned::new(OffsetDateTime::now_utc(), self.settings.node_id, policy);
        self.detector.observe(key, snapshot).await?;
        Ok(())
    }

    async fn resolve_node(&self, public_key: &str) -> Result<NodeId, Error> {
        let key = self.settings.node_key(public_key);
        if let Some(node_id) = self.cache.node_id(&key).await? {
            return Ok(node_id);
        }
        let node_id = self.store.add_node_when_new(&key).await?;
        self.cache.set_node(key, node_id).await?;
        info!("{}: new node {} as {}", self.name, public_key, node_id);
        Ok(node_id)
    }
}

#[async_trait]
impl StreamHandler for ChannelGraph {
    type Item = GraphTopologyUpdate;

    fn name(&self) -> &str {
        &self.name
    }

    async fn subscribe(&self) -> Result<BackendStream<GraphTopologyUpdate>, Status> {
        self.backend.subscribe_channel_graph().await
    }

    // The rest of a batch is dropped after the first failure.
    async fn handle(&self, update: GraphTopologyUpdate) -> Result<(), Error> {
        for node_update in update.node_updates {
            self.record_node(node_update).await?;
        }
        for channel_update in update.channel_updates {
            self.record_policy(channel_update).await?;
        }
        Ok(())
    }

    fn on_failure(&self) -> FailurePolicy {
        FailurePolicy::Skip
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{EventBus, IngestEvent};
    use crate::model::{
        Chain, ChannelId, ChannelSettings, ChannelStatus, FundingOutpoint, Network,
        NodeAnnouncement, NodeKey, RoutingPolicy,
    };
    use crate::store::MemoryStore;
    use crate::testing::MockBackend;
    use test_log::test;
    use tokio::sync::broadcast::{self, error::TryRecvError};

    const LOCAL: &str = "02local";
    const PEER: &str = "03peer";

    struct Fixture {
        store: Arc<MemoryStore>,
        cache: IdentifierCache,
        graph: ChannelGraph,
        events: broadcast::Receiver<IngestEvent>,
        _trigger: triggered::Trigger,
    }

    async fn fixture() -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let (trigger, listener) = triggered::trigger();
        let (cache, _handle) = IdentifierCache::start(16, listener);
        let bus = EventBus::new(16);
        let events = bus.subscribe();
        let settings =
            NodeSettings { node_id: NodeId(1), chain: Chain::Bitcoin, network: Network::RegTest };
        let local_key = settings.node_key(LOCAL);
        let local_id = store.add_node_when_new(&local_key).await.unwrap();
        cache.set_node(local_key, local_id).await.unwrap();
        cache
            .set_channel(ChannelSettings {
                channel_id: ChannelId(10),
                short_channel_id: None,
                funding_outpoint: FundingOutpoint::new("aa", 1),
                status: ChannelStatus::Open,
            })
            .await
            .unwrap();
        let graph = ChannelGraph::new(
            Arc::new(MockBackend::new()),
            store.clone(),
            cache.clone(),
            ChangeDetector::new(store.clone(), bus),
            settings,
        );
        Fixture { store, cache, graph, events, _trigger: trigger }
    }

    fn edge(outpoint: FundingOutpoint, fee_base_msat: Option<i64>) -> ChannelEdgeUpdate {
        ChannelEdgeUpdate {
            chan_id: 700_000 << 40,
            funding_outpoint: outpoint,
            routing_policy: fee_base_msat.map(|fee_base_msat| RoutingPolicy {
                time_lock_delta: 80,
                min_htlc: 1,
                fee_base_msat,
                fee_rate_milli_msat: 100,
                disabled: false,
                max_htlc_msat: 990_000_000,
            }),
            advertising_node: PEER.to_string(),
            connecting_node: LOCAL.to_string(),
        }
    }

    fn channel_update(update: ChannelEdgeUpdate) -> GraphTopologyUpdate {
        GraphTopologyUpdate { node_updates: vec![], channel_updates: vec![update] }
    }

    #[test(tokio::test)]
    async fn policy_of_active_channel_test() {
        let mut fixture = fixture().await;
        let update = edge(FundingOutpoint::new("aa", 1), Some(1_000));
        fixture.graph.handle(channel_update(update.clone())).await.unwrap();

        let peer_key = NodeKey::new(PEER, Chain::Bitcoin, Network::RegTest);
        let peer_id = fixture.cache.node_id(&peer_key).await.unwrap().expect("peer created");
        let local_key = NodeKey::new(LOCAL, Chain::Bitcoin, Network::RegTest);
        let local_id = fixture.cache.node_id(&local_key).await.unwrap().unwrap();
        let key = ChannelPolicyKey {
            channel_id: ChannelId(10),
            announcing_node_id: peer_id,
            connecting_node_id: local_id,
        };
        assert_eq!(fixture.store.routing_policies(&key).len(), 1);
        match fixture.events.try_recv().unwrap() {
            IngestEvent::ChannelPolicy(change) => {
                assert_eq!(change.key, key);
                assert_eq!(change.current.node_id, NodeId(1));
                assert!(change.previous.is_none());
            }
            other => panic!("unexpected event {:?}", other),
        }

        // the same policy again is not a change
        fixture.graph.handle(channel_update(update)).await.unwrap();
        assert_eq!(fixture.store.routing_policies(&key).len(), 1);
        assert_eq!(fixture.events.try_recv(), Err(TryRecvError::Empty));

        let changed = edge(FundingOutpoint::new("aa", 1), Some(2_000));
        fixture.graph.handle(channel_update(changed)).await.unwrap();
        assert_eq!(fixture.store.routing_policies(&key).len(), 2);
        match fixture.events.try_recv().unwrap() {
            IngestEvent::ChannelPolicy(change) => {
                assert_eq!(change.previous.unwrap().value.fee_base_msat, 1_000);
                assert_eq!(change.current.value.fee_base_msat, 2_000);
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test(tokio::test)]
    async fn ignores_untracked_updates_test() {
        let mut fixture = fixture().await;
        let unknown_channel = edge(FundingOutpoint::new("bb", 0), Some(1_000));
        let without_policy = edge(FundingOutpoint::new("aa", 1), None);
        let unknown_node = NodeUpdate {
            identity_key: "03stranger".to_string(),
            announcement: NodeAnnouncement { alias: "stranger".to_string(), ..Default::default() },
        };
        let update = GraphTopologyUpdate {
            node_updates: vec![unknown_node],
            channel_updates: vec![unknown_channel, without_policy],
        };
        fixture.graph.handle(update).await.unwrap();
        assert_eq!(fixture.events.try_recv(), Err(TryRecvError::Empty));
        assert_eq!(fixture.store.nodes().await.unwrap().len(), 1);
    }

    #[test(tokio::test)]
    async fn closed_channel_is_ignored_test() {
        let mut fixture = fixture().await;
        let status = ChannelStatus::RemoteForceClosed;
        fixture.cache.set_channel_status(ChannelId(10), status).await.unwrap();
        let update = edge(FundingOutpoint::new("aa", 1), Some(1_000));
        fixture.graph.handle(channel_update(update)).await.unwrap();
        assert_eq!(fixture.events.try_recv(), Err(TryRecvError::Empty));
    }

    #[test(tokio::test)]
    async fn announcement_of_known_node_test() {
        let mut fixture = fixture().await;
        let announcement = NodeAnnouncement {
            alias: "local".to_string(),
            color: "#ff9900".to_string(),
            ..Default::default()
        };
        let update = GraphTopologyUpdate {
            node_updates: vec![NodeUpdate {
                identity_key: LOCAL.to_string(),
                announcement: announcement.clone(),
            }],
            channel_updates: vec![],
        };
        fixture.graph.handle(update.clone()).await.unwrap();
        fixture.graph.handle(update).await.unwrap();
        match fixture.events.try_recv().unwrap() {
            IngestEvent::NodeAnnouncement(change) => {
                assert_eq!(change.current.value, announcement);
                assert!(change.previous.is_none());
            }
            other => panic!("unexpected event {:?}", other),
        }
        assert_eq!(fixture.events.try_recv(), Err(TryRecvError::Empty));
    }
}

use std::fmt::Debug;
use std::sync::Arc;

use async_trait::async_trait;
use log::*;

use crate::bus::{ChangeEvent, EventBus, IngestEvent};
use crate::model::{ChannelPolicyKey, NodeAnnouncement, NodeId, RoutingPolicy, Versioned};
use crate::store::{self, Store};

/// A snapshot type whose history is kept as a change log.
///
/// Equality of two snapshots is equality of every tracked field.
#[async_trait]
pub trait Tracked: Clone + Debug + PartialEq + Send + Sync + 'static {
    type Key: Clone + Debug + Send + Sync + 'static;

    async fn latest(
        store: &dyn Store,
        key: &Self::Key,
    ) -> Result<Option<Versioned<Self>>, store::Error>;

    async fn insert(
        store: &dyn Store,
        key: &Self::Key,
        row: &Versioned<Self>,
    ) -> Result<(), store::Error>;

    fn into_event(change: ChangeEvent<Self::Key, Self>) -> IngestEvent;
}

#[async_trait]
impl Tracked for RoutingPolicy {
    type Key = ChannelPolicyKey;

    async fn latest(
        store: &dyn Store,
        key: &ChannelPolicyKey,
    ) -> Result<Option<Versioned<Self>>, store::Error> {
        store.latest_routing_policy(key).await
    }

    async fn insert(
        store: &dyn Store,
        key: &ChannelPolicyKey,
        row: &Versioned<Self>,
    ) -> Result<(), store::Error> {
        store.insert_routing_policy(key, row).await
    }

    fn into_event(change: ChangeEvent<ChannelPolicyKey, Self>) -> IngestEvent {
        IngestEvent::ChannelPolicy(change)
    }
}

#[async_trait]
impl Tracked for NodeAnnouncement {
    type Key = NodeId;

    async fn latest(
        store: &dyn Store,
        key: &NodeId,
    ) -> Result<Option<Versioned<Self>>, store::Error> {
        store.latest_node_announcement(*key).await
    }

    async fn insert(
        store: &dyn Store,
        key: &NodeId,
        row: &Versioned<Self>,
    ) -> Result<(), store::Error> {
        store.insert_node_announcement(*key, row).await
    }

    fn into_event(change: ChangeEvent<NodeId, Self>) -> IngestEvent {
        IngestEvent::NodeAnnouncement(change)
    }
}

/// Records a snapshot only when it differs from the most recent stored one,
/// and announces each recorded change on the bus.
#[derive(Clone)]
pub struct ChangeDetector {
    store: Arc<dyn Store>,
    bus: EventBus,
}

impl ChangeDetector {
    pub fn new(store: Arc<dyn Store>, bus: EventBus) -> Self {
        ChangeDetector { store, bus }
    }

    /// Returns whether the snapshot was recorded.
    ///
    /// The comparison is against the most recent row for the key, whichever
    /// local node observed it.
    pub async fn observe<T: Tracked>(
        &self,
        key: T::Key,
        current: Versioned<T>,
    ) -> Result<bool, store::Error> {
        let previous = T::latest(self.store.as_ref(), &key).await?;
        if let Some(previous) = &previous {
            if previous.value == current.value {
                trace!("unchanged {:?}", key);
                return Ok(false);
            }
        }
        T::insert(self.store.as_ref(), &key, &current).await?;
        debug!("recorded change of {:?}", key);
        self.bus.publish(T::into_event(ChangeEvent { key, current, previous }));
        Ok(true)
    }
}

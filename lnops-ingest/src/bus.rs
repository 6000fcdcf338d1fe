use log::*;
use tokio::sync::broadcast;

use crate::model::{
    ChannelPolicyKey, NodeAnnouncement, NodeId, OnChainTransaction, RoutingPolicy, Versioned,
};

/// A detected change of a change-logged entity.
#[derive(Clone, Debug, PartialEq)]
pub struct ChangeEvent<K, T> {
    pub key: K,
    pub current: Versioned<T>,
    /// The prior stored snapshot, if there was one
    pub previous: Option<Versioned<T>>,
}

/// A wallet transaction seen for the first time.
#[derive(Clone, Debug, PartialEq)]
pub struct TransactionEvent {
    pub node_id: NodeId,
    pub transaction: OnChainTransaction,
}

#[derive(Clone, Debug, PartialEq)]
pub enum IngestEvent {
    ChannelPolicy(ChangeEvent<ChannelPolicyKey, RoutingPolicy>),
    NodeAnnouncement(ChangeEvent<NodeId, NodeAnnouncement>),
    Transaction(TransactionEvent),
}

/// In-process fan-out of ingestion events.
///
/// Publishing never blocks. Subscribers that fall behind by more than the
/// capacity lose the oldest events.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<IngestEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        EventBus { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<IngestEvent> {
        self.sender.subscribe()
    }

    /// Returns the number of subscribers the event reached.
    pub fn publish(&self, event: IngestEvent) -> usize {
        match self.sender.send(event) {
            Ok(receivers) => receivers,
            Err(_) => {
                trace!("no bus subscribers");
                0
            }
        }
    }
}

use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;
use tonic::Status;

use crate::model::{
    ForwardEvent, FundingOutpoint, HtlcEvent, NodeAnnouncement, OnChainTransaction, RoutingPolicy,
};

/// A server-pushed stream of backend events.
///
/// Dropping the stream closes the underlying subscription.
pub type BackendStream<T> = Pin<Box<dyn Stream<Item = Result<T, Status>> + Send + 'static>>;

/// A request for one page of historical records.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PageRequest {
    /// Inclusive lower bound: seconds for forwards, block height for transactions
    pub start: u64,
    /// Number of matching records to skip
    pub index_offset: u32,
    pub max_records: u32,
}

/// One page of historical records.
#[derive(Clone, Debug, PartialEq)]
pub struct Page<T> {
    pub records: Vec<T>,
    /// Offset to request the following page with
    pub last_index_offset: u32,
}

/// A node announcement observed in the channel graph.
#[derive(Clone, Debug, PartialEq)]
pub struct NodeUpdate {
    pub identity_key: String,
    pub announcement: NodeAnnouncement,
}

/// A routing policy announcement for one direction of a channel.
#[derive(Clone, Debug, PartialEq)]
pub struct ChannelEdgeUpdate {
    /// Packed short channel id
    pub chan_id: u64,
    pub funding_outpoint: FundingOutpoint,
    pub routing_policy: Option<RoutingPolicy>,
    pub advertising_node: String,
    pub connecting_node: String,
}

/// A batch of channel graph changes.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct GraphTopologyUpdate {
    pub node_updates: Vec<NodeUpdate>,
    pub channel_updates: Vec<ChannelEdgeUpdate>,
}

/// A Lightning node backend, reached over a streaming RPC.
///
/// Errors are gRPC statuses. All of them are treated as transient.
#[async_trait]
pub trait NodeBackend: Send + Sync {
    /// Used as a prefix in log messages
    fn log_prefix(&self) -> String;

    async fn subscribe_htlc_events(&self) -> Result<BackendStream<HtlcEvent>, Status>;

    async fn subscribe_transactions(&self) -> Result<BackendStream<OnChainTransaction>, Status>;

    async fn subscribe_channel_graph(&self) -> Result<BackendStream<GraphTopologyUpdate>, Status>;

    /// Forwards completed at or after `request.start` seconds.
    async fn forwarding_history(&self, request: PageRequest) -> Result<Page<ForwardEvent>, Status>;

    /// Wallet transactions at or above block height `request.start`.
    async fn transactions(&self, request: PageRequest) -> Result<Page<OnChainTransaction>, Status>;
}

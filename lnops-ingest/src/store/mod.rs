pub mod memory;
#[cfg(feature = "postgres")]
pub mod postgres;

pub use memory::MemoryStore;

use async_trait::async_trait;
use thiserror::Error;

use crate::model::{
    ChannelPolicyKey, ChannelSettings, ForwardEvent, HtlcEvent, NodeAnnouncement, NodeId, NodeKey,
    OnChainTransaction, RoutingPolicy, Versioned,
};

/// Persistence errors
#[derive(Debug, Error)]
pub enum Error {
    #[cfg(feature = "postgres")]
    #[error("database error: {0}")]
    Postgres(#[from] postgres::PgError),
    #[cfg(feature = "postgres")]
    #[error("connection pool error: {0}")]
    Pool(#[from] postgres::PoolError),
    #[cfg(feature = "postgres")]
    #[error("connection pool setup error: {0}")]
    CreatePool(#[from] postgres::CreatePoolError),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    /// a stored row could not be mapped back to the model
    #[error("corrupt row: {0}")]
    Corrupt(String),
    /// the store cannot be reached
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// The persistence gateway.
///
/// Every insert is guarded by the natural key of the record. Inserting a
/// record whose key already exists is a successful no-op, reported as
/// `false` (or not counted for batches). Batches are applied atomically.
#[async_trait]
pub trait Store: Send + Sync {
    /// The largest stored forward `time_ns`, `None` if there are no forwards.
    async fn last_forward_time_ns(&self) -> Result<Option<u64>, Error>;

    /// Atomically store a page of forwards, returning the number of new rows.
    async fn store_forwards(&self, forwards: &[ForwardEvent]) -> Result<usize, Error>;

    /// Store one HTLC event. Events of kinds which are not recorded are ignored.
    async fn store_htlc_event(&self, event: &HtlcEvent) -> Result<bool, Error>;

    /// The largest stored transaction block height, `None` if there are no transactions.
    async fn last_transaction_height(&self) -> Result<Option<u32>, Error>;

    /// Atomically store a page of transactions, returning the number of new rows.
    async fn store_transactions(&self, transactions: &[OnChainTransaction])
        -> Result<usize, Error>;

    async fn store_transaction(&self, transaction: &OnChainTransaction) -> Result<bool, Error>;

    /// The most recent routing policy row for the channel direction.
    async fn latest_routing_policy(
        &self,
        key: &ChannelPolicyKey,
    ) -> Result<Option<Versioned<RoutingPolicy>>, Error>;

    async fn insert_routing_policy(
        &self,
        key: &ChannelPolicyKey,
        policy: &Versioned<RoutingPolicy>,
    ) -> Result<(), Error>;

    /// The most recent announcement row for the node.
    async fn latest_node_announcement(
        &self,
        node: NodeId,
    ) -> Result<Option<Versioned<NodeAnnouncement>>, Error>;

    async fn insert_node_announcement(
        &self,
        node: NodeId,
        announcement: &Versioned<NodeAnnouncement>,
    ) -> Result<(), Error>;

    /// Look up the node, creating it first if it was never seen.
    async fn add_node_when_new(&self, key: &NodeKey) -> Result<NodeId, Error>;

    /// All known channels, used to seed the identifier cache.
    async fn channels(&self) -> Result<Vec<ChannelSettings>, Error>;

    /// All known nodes, used to seed the identifier cache.
    async fn nodes(&self) -> Result<Vec<(NodeKey, NodeId)>, Error>;
}

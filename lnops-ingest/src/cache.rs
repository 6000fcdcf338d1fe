//! The identifier cache.
//!
//! Maps the external identities reported by node backends (short channel
//! ids, funding outpoints, node public keys) to the internal ids assigned by
//! the store. The tables are owned by a single task; every read and write is
//! a message to that task, so concurrent callers observe the effects of
//! writes in the order the owner received them.

use std::collections::HashMap;

use log::*;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use triggered::Listener;

use crate::model::{
    ChannelId, ChannelSettings, ChannelStatus, FundingOutpoint, NodeId, NodeKey, ShortChannelId,
};
use crate::store::Store;

#[derive(Debug, Error, PartialEq)]
pub enum CacheError {
    #[error("rejected channel write: channel id {0}, funding outpoint {1}")]
    InvalidChannel(ChannelId, FundingOutpoint),
    #[error("rejected node write: node id {0}")]
    InvalidNode(NodeId),
    #[error("identifier cache stopped")]
    Stopped,
}

type WriteReply = oneshot::Sender<Result<(), CacheError>>;

enum CacheRequest {
    ReadActiveByShortChannelId {
        short_channel_id: ShortChannelId,
        reply_tx: oneshot::Sender<Option<ChannelId>>,
    },
    ReadByShortChannelId {
        short_channel_id: ShortChannelId,
        reply_tx: oneshot::Sender<Option<ChannelId>>,
    },
    ReadActiveByOutpoint {
        outpoint: FundingOutpoint,
        reply_tx: oneshot::Sender<Option<ChannelId>>,
    },
    ReadByOutpoint {
        outpoint: FundingOutpoint,
        reply_tx: oneshot::Sender<Option<ChannelId>>,
    },
    ReadStatus {
        channel_id: ChannelId,
        reply_tx: oneshot::Sender<Option<ChannelStatus>>,
    },
    ReadSettings {
        channel_id: ChannelId,
        reply_tx: oneshot::Sender<Option<ChannelSettings>>,
    },
    WriteChannel {
        settings: ChannelSettings,
        reply_tx: WriteReply,
    },
    WriteStatus {
        channel_id: ChannelId,
        status: ChannelStatus,
        reply_tx: WriteReply,
    },
    ReadNode {
        key: NodeKey,
        reply_tx: oneshot::Sender<Option<NodeId>>,
    },
    WriteNode {
        key: NodeKey,
        node_id: NodeId,
        reply_tx: WriteReply,
    },
}

/// A handle to the identifier cache.
///
/// Cheap to clone. The owner task stops when shutdown is signalled or when
/// the last handle is dropped, after which every call returns
/// [`CacheError::Stopped`].
#[derive(Clone)]
pub struct IdentifierCache {
    sender: mpsc::Sender<CacheRequest>,
}

impl IdentifierCache {
    /// Spawn the owner task with a mailbox of `capacity` requests.
    pub fn start(capacity: usize, shutdown_signal: Listener) -> (Self, JoinHandle<()>) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        let handle = tokio::spawn(Tables::default().run(receiver, shutdown_signal));
        (IdentifierCache { sender }, handle)
    }

    async fn request<T>(
        &self,
        make_request: impl FnOnce(oneshot::Sender<T>) -> CacheRequest,
    ) -> Result<T, CacheError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.sender.send(make_request(reply_tx)).await.map_err(|_| CacheError::Stopped)?;
        reply_rx.await.map_err(|_| CacheError::Stopped)
    }

    /// The channel currently using the short channel id, if it is not closed.
    pub async fn active_channel_id_by_short_channel_id(
        &self,
        short_channel_id: &ShortChannelId,
    ) -> Result<Option<ChannelId>, CacheError> {
        let short_channel_id = short_channel_id.clone();
        self.request(|reply_tx| CacheRequest::ReadActiveByShortChannelId {
            short_channel_id,
            reply_tx,
        })
        .await
    }

    pub async fn channel_id_by_short_channel_id(
        &self,
        short_channel_id: &ShortChannelId,
    ) -> Result<Option<ChannelId>, CacheError> {
        let short_channel_id = short_channel_id.clone();
        self.request(|reply_tx| CacheRequest::ReadByShortChannelId { short_channel_id, reply_tx })
            .await
    }

    /// The channel funded by the outpoint, if it is not closed.
    pub async fn active_channel_id_by_funding_outpoint(
        &self,
        outpoint: &FundingOutpoint,
    ) -> Result<Option<ChannelId>, CacheError> {
        let outpoint = outpoint.clone();
        self.request(|reply_tx| CacheRequest::ReadActiveByOutpoint { outpoint, reply_tx }).await
    }

    pub async fn channel_id_by_funding_outpoint(
        &self,
        outpoint: &FundingOutpoint,
    ) -> Result<Option<ChannelId>, CacheError> {
        let outpoint = outpoint.clone();
        self.request(|reply_tx| CacheRequest::ReadByOutpoint { outpoint, reply_tx }).await
    }

    pub async fn channel_status(
        &self,
        channel_id: ChannelId,
    ) -> Result<Option<ChannelStatus>, CacheError> {
        self.request(|reply_tx| CacheRequest::ReadStatus { channel_id, reply_tx }).await
    }

    pub async fn channel_settings(
        &self,
        channel_id: ChannelId,
    ) -> Result<Option<ChannelSettings>, CacheError> {
        self.request(|reply_tx| CacheRequest::ReadSettings { channel_id, reply_tx }).await
    }

    /// Record a channel.
    ///
    /// Rejected if the id or the funding transaction is empty. A closed
    /// channel is recorded without entries in the active indexes.
    pub async fn set_channel(&self, settings: ChannelSettings) -> Result<(), CacheError> {
        self.request(|reply_tx| CacheRequest::WriteChannel { settings, reply_tx }).await?
    }

    /// Record a status change. A closed status drops the channel from the active indexes.
    pub async fn set_channel_status(
        &self,
        channel_id: ChannelId,
        status: ChannelStatus,
    ) -> Result<(), CacheError> {
        self.request(|reply_tx| CacheRequest::WriteStatus { channel_id, status, reply_tx }).await?
    }

    pub async fn node_id(&self, key: &NodeKey) -> Result<Option<NodeId>, CacheError> {
        let key = key.clone();
        self.request(|reply_tx| CacheRequest::ReadNode { key, reply_tx }).await
    }

    pub async fn set_node(&self, key: NodeKey, node_id: NodeId) -> Result<(), CacheError> {
        self.request(|reply_tx| CacheRequest::WriteNode { key, node_id, reply_tx }).await?
    }
}

#[derive(Default)]
struct Tables {
    active_by_short_channel_id: HashMap<ShortChannelId, ChannelId>,
    by_short_channel_id: HashMap<ShortChannelId, ChannelId>,
    active_by_outpoint: HashMap<FundingOutpoint, ChannelId>,
    by_outpoint: HashMap<FundingOutpoint, ChannelId>,
    status: HashMap<ChannelId, ChannelStatus>,
    settings: HashMap<ChannelId, ChannelSettings>,
    nodes: HashMap<NodeKey, NodeId>,
}

impl Tables {
    async fn run(mut self, mut receiver: mpsc::Receiver<CacheRequest>, shutdown_signal: Listener) {
        info!("identifier cache started");
        loop {
            tokio::select! {
                biased;
                _ = shutdown_signal.clone() => {
                    info!("identifier cache got shutdown_signal");
                    break;
                }
                request = receiver.recv() => {
                    match request {
                        Some(request) => self.process(request),
                        None => {
                            info!("identifier cache handles dropped");
                            break;
                        }
                    }
                }
            }
        }
        info!("identifier cache stopped");
    }

    // a failed reply send means the caller went away
    fn process(&mut self, request: CacheRequest) {
        match request {
            CacheRequest::ReadActiveByShortChannelId { short_channel_id, reply_tx } => {
                let channel_id = self.active_by_short_channel_id.get(&short_channel_id);
                let _ = reply_tx.send(channel_id.copied());
            }
            CacheRequest::ReadByShortChannelId { short_channel_id, reply_tx } => {
                let _ = reply_tx.send(self.by_short_channel_id.get(&short_channel_id).copied());
            }
            CacheRequest::ReadActiveByOutpoint { outpoint, reply_tx } => {
                let _ = reply_tx.send(self.active_by_outpoint.get(&outpoint).copied());
            }
            CacheRequest::ReadByOutpoint { outpoint, reply_tx } => {
                let _ = reply_tx.send(self.by_outpoint.get(&outpoint).copied());
            }
            CacheRequest::ReadStatus { channel_id, reply_tx } => {
                let _ = reply_tx.send(self.status.get(&channel_id).copied());
            }
            CacheRequest::ReadSettings { channel_id, reply_tx } => {
                let _ = reply_tx.send(self.settings.get(&channel_id).cloned());
            }
            CacheRequest::WriteChannel { settings, reply_tx } => {
                let _ = reply_tx.send(self.write_channel(settings));
            }
            CacheRequest::WriteStatus { channel_id, status, reply_tx } => {
                let _ = reply_tx.send(self.write_status(channel_id, status));
            }
            CacheRequest::ReadNode { key, reply_tx } => {
                let _ = reply_tx.send(self.nodes.get(&key).copied());
            }
            CacheRequest::WriteNode { key, node_id, reply_tx } => {
                let result = if node_id.is_empty() {
                    warn!("rejected node write for {}: empty node id", key.public_key);
                    Err(CacheError::InvalidNode(node_id))
                } else {
                    self.nodes.insert(key, node_id);
                    Ok(())
                };
                let _ = reply_tx.send(result);
            }
        }
    }

    fn write_channel(&mut self, settings: ChannelSettings) -> Result<(), CacheError> {
        let channel_id = settings.channel_id;
        if channel_id.is_empty() || settings.funding_outpoint.is_empty() {
            warn!(
                "rejected channel write: channel id {}, funding outpoint {}",
                channel_id, settings.funding_outpoint
            );
            return Err(CacheError::InvalidChannel(channel_id, settings.funding_outpoint));
        }
        if settings.status.is_closed() {
            self.remove_active(channel_id);
        } else {
            if let Some(short_channel_id) = &settings.short_channel_id {
                self.active_by_short_channel_id.insert(short_channel_id.clone(), channel_id);
            }
            self.active_by_outpoint.insert(settings.funding_outpoint.clone(), channel_id);
        }
        if let Some(short_channel_id) = &settings.short_channel_id {
            self.by_short_channel_id.insert(short_channel_id.clone(), channel_id);
        }
        self.by_outpoint.insert(settings.funding_outpoint.clone(), channel_id);
        self.status.insert(channel_id, settings.status);
        debug!("cached channel {} with status {:?}", channel_id, settings.status);
        self.settings.insert(channel_id, settings);
        Ok(())
    }

    fn write_status(
        &mut self,
        channel_id: ChannelId,
        status: ChannelStatus,
    ) -> Result<(), CacheError> {
        if channel_id.is_empty() {
            warn!("rejected status write: empty channel id");
            return Err(CacheError::InvalidChannel(channel_id, FundingOutpoint::new("", 0)));
        }
        self.status.insert(channel_id, status);
        if let Some(settings) = self.settings.get_mut(&channel_id) {
            settings.status = status;
        }
        if status.is_closed() {
            self.remove_active(channel_id);
        }
        Ok(())
    }

    // Reverse lookup, the active indexes are keyed by external identity.
    fn remove_active(&mut self, channel_id: ChannelId) {
        self.active_by_short_channel_id.retain(|_, id| *id != channel_id);
        self.active_by_outpoint.retain(|_, id| *id != channel_id);
    }
}

/// Seed the cache with every channel and node the store knows about.
///
/// Channels the cache rejects are logged and skipped.
pub async fn bootstrap(cache: &IdentifierCache, store: &dyn Store) -> Result<(), crate::Error> {
    let channels = store.channels().await?;
    let channel_count = channels.len();
    for settings in channels {
        match cache.set_channel(settings).await {
            Ok(()) => {}
            Err(CacheError::Stopped) => return Err(CacheError::Stopped.into()),
            Err(e) => warn!("skipping stored channel: {}", e),
        }
    }
    let nodes = store.nodes().await?;
    let node_count = nodes.len();
    for (key, node_id) in nodes {
        match cache.set_node(key, node_id).await {
            Ok(()) => {}
            Err(CacheError::Stopped) => return Err(CacheError::Stopped.into()),
            Err(e) => warn!("skipping stored node: {}", e),
        }
    }
    info!("identifier cache seeded with {} channels and {} nodes", channel_count, node_count);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Chain, Network};
    use crate::store::MemoryStore;
    use test_log::test;

    fn channel(id: i32, scid: &str, txid: &str, status: ChannelStatus) -> ChannelSettings {
        ChannelSettings {
            channel_id: ChannelId(id),
            short_channel_id: ShortChannelId::new(scid),
            funding_outpoint: FundingOutpoint::new(txid, 0),
            status,
        }
    }

    fn scid(s: &str) -> ShortChannelId {
        ShortChannelId::new(s).unwrap()
    }

    fn start_cache() -> (IdentifierCache, JoinHandle<()>, triggered::Trigger) {
        let (trigger, listener) = triggered::trigger();
        let (cache, handle) = IdentifierCache::start(16, listener);
        (cache, handle, trigger)
    }

    #[test(tokio::test)]
    async fn unknown_keys_test() {
        let (cache, _handle, _trigger) = start_cache();
        assert_eq!(cache.channel_id_by_short_channel_id(&scid("1x1x1")).await.unwrap(), None);
        assert_eq!(
            cache.active_channel_id_by_funding_outpoint(&FundingOutpoint::new("aa", 0)).await,
            Ok(None)
        );
        assert_eq!(cache.channel_status(ChannelId(1)).await, Ok(None));
        assert_eq!(cache.channel_settings(ChannelId(1)).await, Ok(None));
    }

    #[test(tokio::test)]
    async fn write_channel_test() {
        let (cache, _handle, _trigger) = start_cache();
        let open = channel(1, "700x1x0", "aa", ChannelStatus::Open);
        cache.set_channel(open.clone()).await.unwrap();
        let outpoint = FundingOutpoint::new("aa", 0);
        assert_eq!(
            cache.active_channel_id_by_short_channel_id(&scid("700x1x0")).await,
            Ok(Some(ChannelId(1)))
        );
        assert_eq!(
            cache.active_channel_id_by_funding_outpoint(&outpoint).await,
            Ok(Some(ChannelId(1)))
        );
        assert_eq!(cache.channel_status(ChannelId(1)).await, Ok(Some(ChannelStatus::Open)));
        assert_eq!(cache.channel_settings(ChannelId(1)).await, Ok(Some(open)));
    }

    #[test(tokio::test)]
    async fn closed_channel_write_is_not_active_test() {
        let (cache, _handle, _trigger) = start_cache();
        cache.set_channel(channel(2, "700x2x0", "bb", ChannelStatus::BreachClosed)).await.unwrap();
        assert_eq!(cache.active_channel_id_by_short_channel_id(&scid("700x2x0")).await, Ok(None));
        assert_eq!(
            cache.channel_id_by_short_channel_id(&scid("700x2x0")).await,
            Ok(Some(ChannelId(2)))
        );
        assert_eq!(
            cache.channel_id_by_funding_outpoint(&FundingOutpoint::new("bb", 0)).await,
            Ok(Some(ChannelId(2)))
        );
    }

    #[test(tokio::test)]
    async fn rejects_invalid_channel_test() {
        let (cache, _handle, _trigger) = start_cache();
        let result = cache.set_channel(channel(0, "700x1x0", "aa", ChannelStatus::Open)).await;
        assert!(matches!(result, Err(CacheError::InvalidChannel(ChannelId(0), _))));
        let result = cache.set_channel(channel(3, "700x1x0", "", ChannelStatus::Open)).await;
        assert!(matches!(result, Err(CacheError::InvalidChannel(ChannelId(3), _))));
        assert_eq!(cache.channel_id_by_short_channel_id(&scid("700x1x0")).await, Ok(None));
        assert!(cache.set_channel_status(ChannelId(0), ChannelStatus::Open).await.is_err());
    }

    #[test(tokio::test)]
    async fn force_close_removes_active_entries_test() {
        let (cache, _handle, _trigger) = start_cache();
        cache.set_channel(channel(5, "700x5x1", "cc", ChannelStatus::Open)).await.unwrap();
        cache.set_channel_status(ChannelId(5), ChannelStatus::LocalForceClosed).await.unwrap();
        let outpoint = FundingOutpoint::new("cc", 0);
        assert_eq!(cache.active_channel_id_by_short_channel_id(&scid("700x5x1")).await, Ok(None));
        assert_eq!(cache.active_channel_id_by_funding_outpoint(&outpoint).await, Ok(None));
        assert_eq!(
            cache.channel_id_by_short_channel_id(&scid("700x5x1")).await,
            Ok(Some(ChannelId(5)))
        );
        assert_eq!(cache.channel_id_by_funding_outpoint(&outpoint).await, Ok(Some(ChannelId(5))));
        assert_eq!(
            cache.channel_status(ChannelId(5)).await,
            Ok(Some(ChannelStatus::LocalForceClosed))
        );
        let settings = cache.channel_settings(ChannelId(5)).await.unwrap().unwrap();
        assert_eq!(settings.status, ChannelStatus::LocalForceClosed);
    }

    #[test(tokio::test)]
    async fn non_closing_status_keeps_active_entries_test() {
        let (cache, _handle, _trigger) = start_cache();
        cache.set_channel(channel(6, "700x6x0", "dd", ChannelStatus::Open)).await.unwrap();
        cache.set_channel_status(ChannelId(6), ChannelStatus::Closing).await.unwrap();
        assert_eq!(
            cache.active_channel_id_by_short_channel_id(&scid("700x6x0")).await,
            Ok(Some(ChannelId(6)))
        );
    }

    #[test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
    async fn concurrent_writes_are_serialized_test() {
        let (cache, _handle, _trigger) = start_cache();
        let mut handles = Vec::new();
        for task in 0..8 {
            let cache = cache.clone();
            handles.push(tokio::spawn(async move {
                for i in 0..25 {
                    let id = task * 100 + i + 1;
                    let scid = format!("{}x{}x0", task + 1, i);
                    let txid = format!("{:064x}", id);
                    let settings = channel(id, &scid, &txid, ChannelStatus::Open);
                    cache.set_channel(settings).await.unwrap();
                    if i % 2 == 0 {
                        cache
                            .set_channel_status(ChannelId(id), ChannelStatus::CooperativeClosed)
                            .await
                            .unwrap();
                    }
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        for task in 0..8 {
            for i in 0..25 {
                let id = ChannelId(task * 100 + i + 1);
                let scid = scid(&format!("{}x{}x0", task + 1, i));
                let active = cache.active_channel_id_by_short_channel_id(&scid).await.unwrap();
                if i % 2 == 0 {
                    assert_eq!(active, None);
                    assert_eq!(
                        cache.channel_status(id).await.unwrap(),
                        Some(ChannelStatus::CooperativeClosed)
                    );
                } else {
                    assert_eq!(active, Some(id));
                }
                assert_eq!(cache.channel_id_by_short_channel_id(&scid).await.unwrap(), Some(id));
            }
        }
    }

    #[test(tokio::test)]
    async fn nodes_test() {
        let (cache, _handle, _trigger) = start_cache();
        let key = NodeKey::new("02aa", Chain::Bitcoin, Network::MainNet);
        assert_eq!(cache.node_id(&key).await, Ok(None));
        cache.set_node(key.clone(), NodeId(7)).await.unwrap();
        assert_eq!(cache.node_id(&key).await, Ok(Some(NodeId(7))));
        let other_network = NodeKey::new("02aa", Chain::Bitcoin, Network::TestNet);
        assert_eq!(cache.node_id(&other_network).await, Ok(None));
        assert_eq!(
            cache.set_node(other_network, NodeId(0)).await,
            Err(CacheError::InvalidNode(NodeId(0)))
        );
    }

    #[test(tokio::test)]
    async fn stops_on_shutdown_test() {
        let (cache, handle, trigger) = start_cache();
        trigger.trigger();
        handle.await.unwrap();
        assert_eq!(cache.channel_status(ChannelId(1)).await, Err(CacheError::Stopped));
        assert_eq!(
            cache.set_channel(channel(1, "1x1x1", "aa", ChannelStatus::Open)).await,
            Err(CacheError::Stopped)
        );
    }

    #[test(tokio::test)]
    async fn stops_when_handles_dropped_test() {
        let (cache, handle, _trigger) = start_cache();
        drop(cache);
        handle.await.unwrap();
    }

    #[test(tokio::test)]
    async fn bootstrap_test() {
        let store = MemoryStore::new();
        store.insert_channel(channel(1, "700x1x0", "aa", ChannelStatus::Open));
        store.insert_channel(channel(2, "700x2x0", "bb", ChannelStatus::CooperativeClosed));
        store.insert_channel(channel(-1, "700x3x0", "cc", ChannelStatus::Open));
        let key = NodeKey::new("02aa", Chain::Bitcoin, Network::MainNet);
        let node_id = store.add_node_when_new(&key).await.unwrap();

        let (cache, _handle, _trigger) = start_cache();
        bootstrap(&cache, &store).await.unwrap();
        assert_eq!(
            cache.active_channel_id_by_short_channel_id(&scid("700x1x0")).await,
            Ok(Some(ChannelId(1)))
        );
        assert_eq!(cache.active_channel_id_by_short_channel_id(&scid("700x2x0")).await, Ok(None));
        assert_eq!(cache.channel_id_by_short_channel_id(&scid("700x3x0")).await, Ok(None));
        assert_eq!(cache.node_id(&key).await, Ok(Some(node_id)));
    }
}

use std::sync::Arc;

use async_trait::async_trait;
use log::*;
use tonic::Status;
use triggered::Listener;

use crate::backend::{BackendStream, NodeBackend, Page, PageRequest};
use crate::backfill::{backfill, HistorySource};
use crate::bus::{EventBus, IngestEvent, TransactionEvent};
use crate::limiter::AdmissionLimiter;
use crate::model::{NodeId, OnChainTransaction};
use crate::store::{self, Store};
use crate::subscription::{FailurePolicy, StreamHandler};
use crate::Error;

/// The wallet transaction history of a node, paged by block height.
pub struct TransactionHistory {
    backend: Arc<dyn NodeBackend>,
    store: Arc<dyn Store>,
    name: String,
}

impl TransactionHistory {
    pub fn new(backend: Arc<dyn NodeBackend>, store: Arc<dyn Store>) -> Self {
        let name = format!("{} transactions", backend.log_prefix());
        TransactionHistory { backend, store, name }
    }
}

#[async_trait]
impl HistorySource for TransactionHistory {
    type Record = OnChainTransaction;

    fn name(&self) -> &str {
        &self.name
    }

    async fn watermark(&self) -> Result<Option<u64>, store::Error> {
        Ok(self.store.last_transaction_height().await?.map(u64::from))
    }

    // The watermark block is fetched again, it may have been stored partially.
    fn start_from(&self, watermark: Option<u64>) -> u64 {
        watermark.unwrap_or(0)
    }

    async fn fetch_page(&self, request: PageRequest) -> Result<Page<OnChainTransaction>, Status> {
        self.backend.transactions(request).await
    }

    async fn store_page(&self, records: &[OnChainTransaction]) -> Result<usize, store::Error> {
        self.store.store_transactions(records).await
    }
}

/// Records the wallet transactions of a node and announces new ones.
///
/// The live subscription is opened before the history is paged, so a
/// transaction arriving meanwhile is delivered by the subscription.
pub struct Transactions {
    history: TransactionHistory,
    store: Arc<dyn Store>,
    bus: EventBus,
    node_id: NodeId,
    page_size: u32,
}

impl Transactions {
    pub fn new(
        backend: Arc<dyn NodeBackend>,
        store: Arc<dyn Store>,
        bus: EventBus,
        node_id: NodeId,
        page_size: u32,
    ) -> Self {
        let history = TransactionHistory::new(backend, store.clone());
        Transactions { history, store, bus, node_id, page_size }
    }
}

#[async_trait]
impl StreamHandler for Transactions {
    type Item = OnChainTransaction;

    fn name(&self) -> &str {
        self.history.name()
    }

    async fn subscribe(&self) -> Result<BackendStream<OnChainTransaction>, Status> {
        self.history.backend.subscribe_transactions().await
    }

    async fn catch_up(&self, limiter: &mut AdmissionLimiter, shutdown_signal: &Listener) {
        backfill(&self.history, self.page_size, limiter, shutdown_signal).await;
    }

    async fn handle(&self, transaction: OnChainTransaction) -> Result<(), Error> {
        if self.store.store_transaction(&transaction).await? {
            info!("{}: new transaction {}", self.name(), transaction.tx_hash);
            self.bus.publish(IngestEvent::Transaction(TransactionEvent {
                node_id: self.node_id,
                transaction,
            }));
        } else {
            debug!("{}: duplicate transaction {}", self.name(), transaction.tx_hash);
        }
        Ok(())
    }

    fn on_failure(&self) -> FailurePolicy {
        FailurePolicy::Pause
    }
}

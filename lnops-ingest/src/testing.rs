//! Scripted backend and sample records for tests.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use tokio::time::Instant;
use tonic::Status;

use crate::backend::{BackendStream, GraphTopologyUpdate, NodeBackend, Page, PageRequest};
use crate::model::{
    ForwardEvent, HtlcEvent, HtlcEventKind, HtlcEventOrigin, HtlcInfo, OnChainTransaction,
};

/// The scripted outcome of one subscription attempt.
pub struct Subscription<T> {
    outcome: Result<Vec<Result<T, Status>>, Status>,
    close: bool,
}

impl<T: Send + 'static> Subscription<T> {
    /// A subscription delivering `items`, then staying open without further items.
    pub fn items(items: Vec<Result<T, Status>>) -> Self {
        Subscription { outcome: Ok(items), close: false }
    }

    /// A subscription attempt which fails.
    pub fn fail(status: Status) -> Self {
        Subscription { outcome: Err(status), close: false }
    }

    /// End the stream after the items instead of staying open.
    pub fn then_close(mut self) -> Self {
        self.close = true;
        self
    }

    pub fn open(self) -> Result<BackendStream<T>, Status> {
        let items = stream::iter(self.outcome?);
        if self.close {
            Ok(Box::pin(items))
        } else {
            Ok(Box::pin(items.chain(stream::pending())))
        }
    }
}

impl<T> Default for Subscription<T> {
    fn default() -> Self {
        Subscription { outcome: Ok(Vec::new()), close: false }
    }
}

/// A node backend replaying scripted subscriptions and a fixed history.
///
/// Once the scripted subscriptions of a category run out, further
/// subscriptions stay open without delivering anything.
#[derive(Default)]
pub struct MockBackend {
    htlc_subscriptions: Mutex<VecDeque<Subscription<HtlcEvent>>>,
    transaction_subscriptions: Mutex<VecDeque<Subscription<OnChainTransaction>>>,
    graph_subscriptions: Mutex<VecDeque<Subscription<GraphTopologyUpdate>>>,
    forward_history: Mutex<Vec<ForwardEvent>>,
    transaction_history: Mutex<Vec<OnChainTransaction>>,
    forward_requests: Mutex<Vec<PageRequest>>,
    transaction_requests: Mutex<Vec<PageRequest>>,
    subscribed: Mutex<Vec<(&'static str, Instant)>>,
    failing_history: Mutex<usize>,
}

impl MockBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_htlc_subscription(&self, subscription: Subscription<HtlcEvent>) {
        self.htlc_subscriptions.lock().unwrap().push_back(subscription);
    }

    pub fn push_transaction_subscription(&self, subscription: Subscription<OnChainTransaction>) {
        self.transaction_subscriptions.lock().unwrap().push_back(subscription);
    }

    pub fn push_graph_subscription(&self, subscription: Subscription<GraphTopologyUpdate>) {
        self.graph_subscriptions.lock().unwrap().push_back(subscription);
    }

    pub fn add_forwards(&self, forwards: Vec<ForwardEvent>) {
        self.forward_history.lock().unwrap().extend(forwards);
    }

    pub fn add_transactions(&self, transactions: Vec<OnChainTransaction>) {
        self.transaction_history.lock().unwrap().extend(transactions);
    }

    /// Make the next `count` history requests fail.
    pub fn fail_next_history(&self, count: usize) {
        *self.failing_history.lock().unwrap() = count;
    }

    pub fn forward_requests(&self) -> Vec<PageRequest> {
        self.forward_requests.lock().unwrap().clone()
    }

    pub fn transaction_requests(&self) -> Vec<PageRequest> {
        self.transaction_requests.lock().unwrap().clone()
    }

    /// When each subscription of the category was attempted.
    pub fn subscribed(&self, category: &str) -> Vec<Instant> {
        let subscribed = self.subscribed.lock().unwrap();
        subscribed.iter().filter(|(c, _)| *c == category).map(|(_, at)| *at).collect()
    }

    fn record_subscription(&self, category: &'static str) {
        self.subscribed.lock().unwrap().push((category, Instant::now()));
    }

    fn check_history(&self) -> Result<(), Status> {
        let mut failing = self.failing_history.lock().unwrap();
        if *failing > 0 {
            *failing -= 1;
            return Err(Status::unavailable("history unavailable"));
        }
        Ok(())
    }
}

fn next<T: Send + 'static>(
    subscriptions: &Mutex<VecDeque<Subscription<T>>>,
) -> Result<BackendStream<T>, Status> {
    subscriptions.lock().unwrap().pop_front().unwrap_or_default().open()
}

fn page<T: Clone>(matching: Vec<&T>, request: PageRequest) -> Page<T> {
    let records: Vec<T> = matching
        .into_iter()
        .skip(request.index_offset as usize)
        .take(request.max_records as usize)
        .cloned()
        .collect();
    let last_index_offset = request.index_offset + records.len() as u32;
    Page { records, last_index_offset }
}

#[async_trait]
impl NodeBackend for MockBackend {
    fn log_prefix(&self) -> String {
        "mock".to_string()
    }

    async fn subscribe_htlc_events(&self) -> Result<BackendStream<HtlcEvent>, Status> {
        self.record_subscription("htlc");
        next(&self.htlc_subscriptions)
    }

    async fn subscribe_transactions(&self) -> Result<BackendStream<OnChainTransaction>, Status> {
        self.record_subscription("transactions");
        next(&self.transaction_subscriptions)
    }

    async fn subscribe_channel_graph(&self) -> Result<BackendStream<GraphTopologyUpdate>, Status> {
        self.record_subscription("graph");
        next(&self.graph_subscriptions)
    }

    async fn forwarding_history(&self, request: PageRequest) -> Result<Page<ForwardEvent>, Status> {
        self.forward_requests.lock().unwrap().push(request);
        self.check_history()?;
        let history = self.forward_history.lock().unwrap();
        let matching =
            history.iter().filter(|f| f.time_ns / 1_000_000_000 >= request.start).collect();
        Ok(page(matching, request))
    }

    async fn transactions(&self, request: PageRequest) -> Result<Page<OnChainTransaction>, Status> {
        self.transaction_requests.lock().unwrap().push(request);
        self.check_history()?;
        let history = self.transaction_history.lock().unwrap();
        let matching =
            history.iter().filter(|tx| u64::from(tx.block_height) >= request.start).collect();
        Ok(page(matching, request))
    }
}

pub fn forward(time_ns: u64) -> ForwardEvent {
    ForwardEvent {
        time_ns,
        incoming_channel: 700_000 << 40 | 1 << 16,
        outgoing_channel: 700_001 << 40 | 2 << 16 | 1,
        fee_msat: 1_000,
        amount_in_msat: 101_000,
        amount_out_msat: 100_000,
    }
}

pub fn transaction(tx_hash: &str, block_height: u32) -> OnChainTransaction {
    OnChainTransaction {
        timestamp: 1_600_000_000 + i64::from(block_height) * 600,
        tx_hash: tx_hash.to_string(),
        amount: 50_000,
        num_confirmations: 1,
        block_hash: format!("{:064x}", block_height),
        block_height,
        total_fees: 250,
        dest_addresses: vec!["bcrt1qexampleaddress".to_string()],
        raw_tx_hex: "0200".to_string(),
        label: String::new(),
    }
}

pub fn htlc_forward(timestamp_ns: u64, incoming_htlc_id: u64) -> HtlcEvent {
    HtlcEvent {
        timestamp_ns,
        origin: HtlcEventOrigin::Forward,
        incoming_channel_id: 700_000 << 40 | 1 << 16,
        outgoing_channel_id: 700_001 << 40 | 2 << 16 | 1,
        incoming_htlc_id,
        outgoing_htlc_id: incoming_htlc_id + 1,
        kind: HtlcEventKind::Forward(HtlcInfo {
            incoming_timelock: 800_040,
            outgoing_timelock: 800_000,
            incoming_amt_msat: 101_000,
            outgoing_amt_msat: 100_000,
        }),
    }
}

/// Poll `condition` until it holds, advancing (possibly paused) time in small steps.
pub async fn wait_until<F: FnMut() -> bool>(mut condition: F) {
    for _ in 0..10_000 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached");
}

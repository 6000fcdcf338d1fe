//! The ingestion workers of one node backend.

pub mod forwards;
pub mod graph;
pub mod htlc;
pub mod transactions;

use std::sync::Arc;

use log::*;
use tokio::task::{self, JoinHandle};
use triggered::Listener;

use crate::backend::NodeBackend;
use crate::bus::EventBus;
use crate::cache::{bootstrap, IdentifierCache};
use crate::config::IngestConfig;
use crate::detector::ChangeDetector;
use crate::limiter::AdmissionLimiter;
use crate::store::Store;
use crate::subscription::{run_poll, run_stream};
use crate::Error;

use self::forwards::ForwardHistory;
use self::graph::ChannelGraph;
use self::htlc::HtlcEvents;
use self::transactions::Transactions;

/// Runs the enabled workers against a backend.
///
/// Each worker has its own reconnect limiter. All of them share the store,
/// the identifier cache and the bus.
pub struct Ingestor {
    backend: Arc<dyn NodeBackend>,
    store: Arc<dyn Store>,
    cache: IdentifierCache,
    bus: EventBus,
    config: IngestConfig,
}

impl Ingestor {
    pub fn new(
        backend: Arc<dyn NodeBackend>,
        store: Arc<dyn Store>,
        cache: IdentifierCache,
        bus: EventBus,
        config: IngestConfig,
    ) -> Self {
        Ingestor { backend, store, cache, bus, config }
    }

    /// Start an identifier cache and create a bus, both sized by `config`.
    ///
    /// The cache is seeded from the store. Returns the ingestor and the
    /// handle of the cache owner task, which stops with `shutdown_signal`.
    pub async fn from_config(
        backend: Arc<dyn NodeBackend>,
        store: Arc<dyn Store>,
        config: IngestConfig,
        shutdown_signal: Listener,
    ) -> Result<(Self, JoinHandle<()>), Error> {
        config.validate()?;
        let (cache, cache_handle) =
            IdentifierCache::start(config.cache_mailbox_capacity, shutdown_signal);
        bootstrap(&cache, store.as_ref()).await?;
        let bus = EventBus::new(config.bus_capacity);
        Ok((Ingestor::new(backend, store, cache, bus, config), cache_handle))
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn cache(&self) -> &IdentifierCache {
        &self.cache
    }

    /// Spawn the workers. They stop once `shutdown_signal` fires.
    pub fn start(&self, shutdown_signal: Listener) -> Vec<JoinHandle<()>> {
        let config = &self.config;
        let reconnect_interval = config.reconnect_interval();
        let mut handles = Vec::new();

        if config.forwards {
            let history = ForwardHistory::new(self.backend.clone(), self.store.clone());
            let poll_interval = config.forward_poll_interval();
            let page_size = config.forward_page_size();
            let shutdown_signal = shutdown_signal.clone();
            handles.push(task::spawn(async move {
                let limiter = AdmissionLimiter::new(reconnect_interval);
                run_poll(&history, poll_interval, page_size, limiter, shutdown_signal).await;
            }));
        }

        if config.htlc_events {
            let handler = HtlcEvents::new(self.backend.clone(), self.store.clone());
            let shutdown_signal = shutdown_signal.clone();
            handles.push(task::spawn(async move {
                let limiter = AdmissionLimiter::new(reconnect_interval);
                run_stream(&handler, limiter, shutdown_signal).await;
            }));
        }

        if config.transactions {
            let handler = Transactions::new(
                self.backend.clone(),
                self.store.clone(),
                self.bus.clone(),
                config.node_settings().node_id,
                config.transaction_page_size(),
            );
            let shutdown_signal = shutdown_signal.clone();
            handles.push(task::spawn(async move {
                let limiter = AdmissionLimiter::new(reconnect_interval);
                run_stream(&handler, limiter, shutdown_signal).await;
            }));
        }

        if config.channel_graph {
            let handler = ChannelGraph::new(
                self.backend.clone(),
                self.store.clone(),
                self.cache.clone(),
                ChangeDetector::new(self.store.clone(), self.bus.clone()),
                config.node_settings(),
            );
            let shutdown_signal = shutdown_signal.clone();
            handles.push(task::spawn(async move {
                let limiter = AdmissionLimiter::new(reconnect_interval);
                run_stream(&handler, limiter, shutdown_signal).await;
            }));
        }

        info!("{}: started {} workers", self.backend.log_prefix(), handles.len());
        handles
    }
}

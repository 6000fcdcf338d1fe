use std::sync::Arc;

use async_trait::async_trait;
use tonic::Status;

use crate::backend::{NodeBackend, Page, PageRequest};
use crate::backfill::HistorySource;
use crate::model::ForwardEvent;
use crate::store::{self, Store};

const NANOS_PER_SEC: u64 = 1_000_000_000;

/// The forwarding history of a node.
///
/// The backend filters history by whole seconds, so each pass starts at the
/// second of the newest stored forward and fetches that second again.
pub struct ForwardHistory {
    backend: Arc<dyn NodeBackend>,
    store: Arc<dyn Store>,
    name: String,
}

impl ForwardHistory {
    pub fn new(backend: Arc<dyn NodeBackend>, store: Arc<dyn Store>) -> Self {
        let name = format!("{} forwards", backend.log_prefix());
        ForwardHistory { backend, store, name }
    }
}

#[async_trait]
impl HistorySource for ForwardHistory {
    type Record = ForwardEvent;

    fn name(&self) -> &str {
        &self.name
    }

    async fn watermark(&self) -> Result<Option<u64>, store::Error> {
        self.store.last_forward_time_ns().await
    }

    fn start_from(&self, watermark: Option<u64>) -> u64 {
        watermark.map(|time_ns| time_ns / NANOS_PER_SEC).unwrap_or(0)
    }

    async fn fetch_page(&self, request: PageRequest) -> Result<Page<ForwardEvent>, Status> {
        self.backend.forwarding_history(request).await
    }

    async fn store_page(&self, records: &[ForwardEvent]) -> Result<usize, store::Error> {
        self.store.store_forwards(records).await
    }
}

use std::sync::Arc;

use async_trait::async_trait;
use log::*;
use tonic::Status;

use crate::backend::{BackendStream, NodeBackend};
use crate::model::HtlcEvent;
use crate::store::Store;
use crate::subscription::{FailurePolicy, StreamHandler};
use crate::Error;

/// Records the HTLC events of a node.
pub struct HtlcEvents {
    backend: Arc<dyn NodeBackend>,
    store: Arc<dyn Store>,
    name: String,
}

impl HtlcEvents {
    pub fn new(backend: Arc<dyn NodeBackend>, store: Arc<dyn Store>) -> Self {
        let name = format!("{} htlc events", backend.log_prefix());
        HtlcEvents { backend, store, name }
    }
}

#[async_trait]
impl StreamHandler for HtlcEvents {
    type Item = HtlcEvent;

    fn name(&self) -> &str {
        &self.name
    }

    async fn subscribe(&self) -> Result<BackendStream<HtlcEvent>, Status> {
        self.backend.subscribe_htlc_events().await
    }

    async fn handle(&self, event: HtlcEvent) -> Result<(), Error> {
        if event.event_type().is_none() {
            debug!("{}: ignoring {:?}", self.name, event.kind);
            return Ok(());
        }
        if !self.store.store_htlc_event(&event).await? {
            debug!("{}: duplicate event at {}", self.name, event.timestamp_ns);
        }
        Ok(())
    }

    fn on_failure(&self) -> FailurePolicy {
        FailurePolicy::Pause
    }
}

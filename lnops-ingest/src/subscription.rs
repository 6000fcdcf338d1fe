//! The resilient subscription shared by every streamed event category.
//!
//! A worker subscribes, optionally catches up on history, then handles
//! items in arrival order. Any receive error or end of stream drops the
//! subscription and opens a new one, at most one attempt per limiter slot,
//! until it succeeds or shutdown is signalled.

use std::fmt::{self, Display, Formatter};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use log::*;
use tokio::time::{self, MissedTickBehavior};
use tonic::Status;
use triggered::Listener;

use crate::backend::BackendStream;
use crate::backfill::{page_forward, HistorySource};
use crate::limiter::AdmissionLimiter;
use crate::Error;

/// What a worker does after failing to handle an item.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FailurePolicy {
    /// Wait for the next limiter slot before the next item
    Pause,
    /// Continue with the next item at once
    Skip,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WorkerState {
    Connecting,
    Streaming,
    Reconnecting,
    Cancelled,
}

impl Display for WorkerState {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match self {
            WorkerState::Connecting => write!(f, "connecting"),
            WorkerState::Streaming => write!(f, "streaming"),
            WorkerState::Reconnecting => write!(f, "reconnecting"),
            WorkerState::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// One streamed event category.
#[async_trait]
pub trait StreamHandler: Send + Sync {
    type Item: Send + 'static;

    /// Category name, used as a log prefix
    fn name(&self) -> &str;

    /// Open a new subscription.
    async fn subscribe(&self) -> Result<BackendStream<Self::Item>, Status>;

    /// Runs once, after the first subscription is open and before its first item.
    async fn catch_up(&self, _limiter: &mut AdmissionLimiter, _shutdown_signal: &Listener) {}

    async fn handle(&self, item: Self::Item) -> Result<(), Error>;

    fn on_failure(&self) -> FailurePolicy {
        FailurePolicy::Skip
    }
}

// Returns None on shutdown.
async fn subscribe<H: StreamHandler + ?Sized>(
    handler: &H,
    limiter: &mut AdmissionLimiter,
    shutdown_signal: &Listener,
) -> Option<BackendStream<H::Item>> {
    loop {
        if !limiter.admit(shutdown_signal).await {
            return None;
        }
        let result = tokio::select! {
            biased;
            _ = shutdown_signal.clone() => return None,
            result = handler.subscribe() => result,
        };
        match result {
            Ok(stream) => return Some(stream),
            Err(status) => error!("{}: subscribe failed: {}", handler.name(), status),
        }
    }
}

/// Run a stream worker until shutdown is signalled.
pub async fn run_stream<H: StreamHandler + ?Sized>(
    handler: &H,
    mut limiter: AdmissionLimiter,
    shutdown_signal: Listener,
) {
    let name = handler.name().to_string();
    let mut state = WorkerState::Connecting;
    let mut stream: Option<BackendStream<H::Item>> = None;
    let mut caught_up = false;
    loop {
        match state {
            WorkerState::Connecting | WorkerState::Reconnecting => {
                // close the failed subscription first
                drop(stream.take());
                info!("{}: {}", name, state);
                match subscribe(handler, &mut limiter, &shutdown_signal).await {
                    Some(subscription) => {
                        stream = Some(subscription);
                        info!("{}: subscribed", name);
                        if !caught_up {
                            handler.catch_up(&mut limiter, &shutdown_signal).await;
                            caught_up = true;
                        }
                        state = WorkerState::Streaming;
                    }
                    None => state = WorkerState::Cancelled,
                }
            }
            WorkerState::Streaming => {
                let active = match stream.as_mut() {
                    Some(active) => active,
                    None => {
                        state = WorkerState::Reconnecting;
                        continue;
                    }
                };
                let next = tokio::select! {
                    biased;
                    _ = shutdown_signal.clone() => {
                        state = WorkerState::Cancelled;
                        continue;
                    }
                    next = active.next() => next,
                };
                match next {
                    Some(Ok(item)) => {
                        if let Err(e) = handler.handle(item).await {
                            error!("{}: {}", name, e);
                            if handler.on_failure() == FailurePolicy::Pause
                                && !limiter.admit(&shutdown_signal).await
                            {
                                state = WorkerState::Cancelled;
                            }
                        }
                    }
                    Some(Err(status)) => {
                        error!("{}: receive failed: {}", name, status);
                        state = WorkerState::Reconnecting;
                    }
                    None => {
                        error!("{}: stream closed by backend", name);
                        state = WorkerState::Reconnecting;
                    }
                }
            }
            WorkerState::Cancelled => break,
        }
    }
    drop(stream);
    info!("{}: {}", name, WorkerState::Cancelled);
}

/// Run a polling worker until shutdown is signalled.
///
/// Every tick pages forward from the durable watermark until a short page.
/// The first tick is immediate.
pub async fn run_poll<S: HistorySource + ?Sized>(
    source: &S,
    poll_interval: Duration,
    page_size: u32,
    mut limiter: AdmissionLimiter,
    shutdown_signal: Listener,
) {
    let mut interval = time::interval(poll_interval.max(Duration::from_millis(1)));
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    info!("{}: polling every {:?}", source.name(), poll_interval);
    loop {
        tokio::select! {
            biased;
            _ = shutdown_signal.clone() => break,
            _ = interval.tick() => {}
        }
        match page_forward(source, page_size, &mut limiter, &shutdown_signal).await {
            Ok(progress) if progress.cancelled => break,
            Ok(progress) => {
                if progress.stored > 0 {
                    info!("{}: stored {} new records", source.name(), progress.stored);
                }
            }
            Err(e) => error!("{}: poll failed, retrying from watermark: {}", source.name(), e),
        }
    }
    info!("{}: {}", source.name(), WorkerState::Cancelled);
}

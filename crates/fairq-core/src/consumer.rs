use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam_channel::RecvTimeoutError;
use tracing::{debug, error, info, warn};

use crate::engine::FairQueue;
use crate::error::SpawnError;
use crate::item::{CompletionStatus, Delivery};

/// What the handler wants done with a delivery.
pub enum HandlerOutcome {
    /// Effects applied; complete the item.
    Success,
    /// Transient failure; leave the claim unacknowledged so the visibility
    /// timeout redelivers it.
    Retry,
    /// Terminal failure; discard the item with the given reason.
    Drop(String),
}

/// Business logic invoked once per claimed item. Runs on a consumer thread
/// and may block arbitrarily long; the visibility timeout is the only bound
/// on a stalled invocation.
pub trait Handler: Send + Sync + 'static {
    fn handle(&self, delivery: &Delivery) -> HandlerOutcome;
}

/// A fixed set of polling consumer threads driving one handler.
///
/// Each thread loops claim / handle / acknowledge, sleeping the poll interval
/// when no work is claimable and backing off exponentially on storage errors.
/// Shutdown wakes all sleepers; in-progress handler invocations finish first.
pub struct ConsumerPool {
    shutdown_tx: Option<crossbeam_channel::Sender<()>>,
    workers: Vec<thread::JoinHandle<()>>,
}

impl ConsumerPool {
    /// Spawn the configured number of consumer threads.
    pub fn start(engine: Arc<FairQueue>, handler: Arc<dyn Handler>) -> Result<Self, SpawnError> {
        let (shutdown_tx, shutdown_rx) = crossbeam_channel::bounded::<()>(0);
        let count = engine.config().consumer.consumer_count;

        let mut workers = Vec::with_capacity(count);
        for i in 0..count {
            let engine = Arc::clone(&engine);
            let handler = Arc::clone(&handler);
            let shutdown_rx = shutdown_rx.clone();
            let handle = thread::Builder::new()
                .name(format!("fairq-consumer-{i}"))
                .spawn(move || run_consumer(engine, handler, i, shutdown_rx))
                .map_err(|source| SpawnError::Thread {
                    name: "consumer",
                    source,
                })?;
            workers.push(handle);
        }
        info!(consumers = count, "consumer pool started");
        Ok(Self {
            shutdown_tx: Some(shutdown_tx),
            workers,
        })
    }

    /// Stop all consumers and wait for in-progress handlers to finish.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        // Dropping the sender wakes every worker's recv.
        self.shutdown_tx.take();
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
    }
}

impl Drop for ConsumerPool {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_consumer(
    engine: Arc<FairQueue>,
    handler: Arc<dyn Handler>,
    index: usize,
    shutdown_rx: crossbeam_channel::Receiver<()>,
) {
    let consumer_id = format!("consumer-{index}");
    let poll_interval = Duration::from_millis(engine.config().consumer.poll_interval_ms);
    let max_backoff = Duration::from_millis(engine.config().consumer.error_backoff_max_ms);
    let mut backoff = poll_interval;

    loop {
        let sleep = match engine.claim(&consumer_id) {
            Ok(Some(delivery)) => {
                backoff = poll_interval;
                process(&engine, handler.as_ref(), &delivery);
                // Drain eagerly; only pause between claims on shutdown check.
                Duration::ZERO
            }
            Ok(None) => {
                backoff = poll_interval;
                poll_interval
            }
            Err(e) => {
                error!(consumer = %consumer_id, error = %e, "claim failed, backing off");
                let sleep = backoff;
                backoff = (backoff * 2).min(max_backoff);
                sleep
            }
        };

        match shutdown_rx.recv_timeout(sleep) {
            Err(RecvTimeoutError::Timeout) => {}
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                debug!(consumer = %consumer_id, "consumer stopping");
                return;
            }
        }
    }
}

fn process(engine: &FairQueue, handler: &dyn Handler, delivery: &Delivery) {
    // A redelivered item whose effects already landed is acknowledged without
    // invoking the handler again.
    match engine.is_complete(delivery.tenant_id(), delivery.item_id()) {
        Ok(true) => {
            debug!(
                tenant = %delivery.tenant_id(),
                item = %delivery.item_id(),
                "redelivery of a completed item, acknowledging without handler"
            );
            acknowledge(engine, delivery);
            return;
        }
        Ok(false) => {}
        Err(e) => {
            warn!(error = %e, "completion lookup failed, invoking handler anyway");
        }
    }

    match handler.handle(delivery) {
        HandlerOutcome::Success => acknowledge(engine, delivery),
        HandlerOutcome::Retry => {
            debug!(
                tenant = %delivery.tenant_id(),
                item = %delivery.item_id(),
                attempt = delivery.item.attempt,
                "handler asked for retry, leaving claim for reclaim"
            );
        }
        HandlerOutcome::Drop(reason) => {
            if let Err(e) = engine.drop_item(&delivery.handle, &reason) {
                warn!(
                    tenant = %delivery.tenant_id(),
                    item = %delivery.item_id(),
                    error = %e,
                    "drop failed"
                );
            }
        }
    }
}

fn acknowledge(engine: &FairQueue, delivery: &Delivery) {
    match engine.complete(&delivery.handle) {
        Ok(CompletionStatus::FirstTime) => {}
        Ok(CompletionStatus::AlreadySeen) => {
            debug!(
                tenant = %delivery.tenant_id(),
                item = %delivery.item_id(),
                "acknowledged a redelivered item"
            );
        }
        Err(e) => {
            // The reclaim loop beat us to the claim; the marker (if any) is
            // already recorded, so the redelivered copy will short-circuit.
            warn!(
                tenant = %delivery.tenant_id(),
                item = %delivery.item_id(),
                error = %e,
                "completion raced with reclaim"
            );
        }
    }
}

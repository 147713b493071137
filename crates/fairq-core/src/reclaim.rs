use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam_channel::RecvTimeoutError;
use tracing::{debug, error, info};

use crate::engine::FairQueue;
use crate::error::{SpawnError, StorageResult};
use crate::visibility::VisibilityManager;

/// Background loop returning expired claims to their tenant queues.
///
/// One instance per process. Each tick scans the expiry index and reclaims a
/// bounded batch; every reclaimed item gets its attempt counter bumped and
/// its token released in the same atomic step. After several consecutive
/// empty scans the tick interval doubles up to a ceiling, dropping back to
/// the base interval as soon as a scan finds work.
pub struct ReclaimLoop {
    shutdown_tx: Option<crossbeam_channel::Sender<()>>,
    thread: Option<thread::JoinHandle<()>>,
}

impl ReclaimLoop {
    pub fn start(engine: Arc<FairQueue>) -> Result<Self, SpawnError> {
        let (shutdown_tx, shutdown_rx) = crossbeam_channel::bounded::<()>(0);
        let thread = thread::Builder::new()
            .name("fairq-reclaim".to_string())
            .spawn(move || run(engine, shutdown_rx))
            .map_err(|source| SpawnError::Thread {
                name: "reclaim",
                source,
            })?;
        info!("reclaim loop started");
        Ok(Self {
            shutdown_tx: Some(shutdown_tx),
            thread: Some(thread),
        })
    }

    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        self.shutdown_tx.take();
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for ReclaimLoop {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run(engine: Arc<FairQueue>, shutdown_rx: crossbeam_channel::Receiver<()>) {
    let visibility = engine.config().visibility.clone();
    let base = Duration::from_millis(visibility.reclaim_interval_ms);
    let max = Duration::from_millis(visibility.reclaim_cooloff_max_interval_ms);
    let mut interval = base;
    let mut empty_scans = 0u32;

    loop {
        match shutdown_rx.recv_timeout(interval) {
            Err(RecvTimeoutError::Timeout) => {}
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                debug!("reclaim loop stopping");
                return;
            }
        }

        match scan_once(&engine, visibility.reclaim_batch) {
            Ok(0) => {
                empty_scans += 1;
                interval = next_interval(
                    interval,
                    base,
                    max,
                    empty_scans,
                    visibility.reclaim_cooloff_after,
                );
            }
            Ok(reclaimed) => {
                debug!(reclaimed, "expired claims returned to their queues");
                empty_scans = 0;
                interval = base;
            }
            Err(e) => {
                error!(error = %e, "reclaim scan failed");
            }
        }
    }
}

/// Scan the expiry index once and reclaim each expired claim individually.
/// Per-item reclaim re-checks expiry, so claims completed or extended since
/// the scan are skipped, not stolen.
pub fn scan_once(engine: &FairQueue, batch: usize) -> StorageResult<usize> {
    let now = VisibilityManager::now_ms();
    let expired = engine.visibility().expired(now, batch)?;
    let mut reclaimed = 0;
    for claim in expired {
        if engine
            .visibility()
            .reclaim(&claim.tenant_id, &claim.item_id, now)?
        {
            info!(
                tenant = %claim.tenant_id,
                item = %claim.item_id,
                consumer = %claim.consumer_id,
                expired_at = claim.expired_at,
                "expired claim reclaimed"
            );
            reclaimed += 1;
        }
    }
    Ok(reclaimed)
}

/// Cooloff schedule: once `cooloff_after` consecutive scans come back empty,
/// double the interval per further empty scan, capped at `max`.
fn next_interval(
    current: Duration,
    base: Duration,
    max: Duration,
    empty_scans: u32,
    cooloff_after: u32,
) -> Duration {
    if empty_scans < cooloff_after {
        base
    } else {
        (current * 2).min(max)
    }
}

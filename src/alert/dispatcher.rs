use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::{Context, Result};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use serde::Serialize;

use super::{Alert, AlertSink};

const WORKER_POLL: Duration = Duration::from_millis(100);
const MAX_PUSH_ATTEMPTS: usize = 3;

/// Sizing of the delivery pool.
#[derive(Clone, Debug)]
pub struct DispatchConfig {
    /// Number of delivery threads.
    pub workers: usize,
    /// Alerts waiting for a free worker. Beyond this the oldest is dropped.
    pub queue_capacity: usize,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            queue_capacity: 256,
        }
    }
}

/// Delivery counters shared by the queue handles and the workers.
#[derive(Debug, Default)]
pub struct DispatchStats {
    queued: AtomicU64,
    delivered: AtomicU64,
    failed: AtomicU64,
    dropped: AtomicU64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct DispatchStatsSnapshot {
    pub queued: u64,
    pub delivered: u64,
    pub failed: u64,
    pub dropped: u64,
}

impl DispatchStats {
    pub fn snapshot(&self) -> DispatchStatsSnapshot {
        DispatchStatsSnapshot {
            queued: self.queued.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }
}

/// Producer handle given to pipelines. Cloning is cheap.
#[derive(Clone)]
pub struct AlertQueue {
    tx: Sender<Alert>,
    // Held so a full queue can evict its oldest entry.
    rx: Receiver<Alert>,
    stats: Arc<DispatchStats>,
}

impl AlertQueue {
    pub(crate) fn bounded(capacity: usize) -> Self {
        let (tx, rx) = bounded(capacity.max(1));
        Self {
            tx,
            rx,
            stats: Arc::new(DispatchStats::default()),
        }
    }

    /// Enqueue without blocking.
    ///
    /// A full queue drops its oldest alert to make room; the drop is counted and logged.
    pub fn push(&self, alert: Alert) {
        let mut pending = alert;
        for _ in 0..MAX_PUSH_ATTEMPTS {
            match self.tx.try_send(pending) {
                Ok(()) => {
                    self.stats.queued.fetch_add(1, Ordering::Relaxed);
                    return;
                }
                Err(TrySendError::Full(returned)) => {
                    if let Ok(oldest) = self.rx.try_recv() {
                        self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                        log::warn!(
                            "alert queue full, dropped oldest alert for camera {}",
                            oldest.camera_id
                        );
                    }
                    pending = returned;
                }
                Err(TrySendError::Disconnected(returned)) => {
                    self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                    log::warn!(
                        "alert queue closed, dropped alert for camera {}",
                        returned.camera_id
                    );
                    return;
                }
            }
        }
        self.stats.dropped.fetch_add(1, Ordering::Relaxed);
        log::warn!(
            "alert queue saturated, dropped alert for camera {}",
            pending.camera_id
        );
    }

    pub fn stats(&self) -> DispatchStatsSnapshot {
        self.stats.snapshot()
    }

    pub fn len(&self) -> usize {
        self.tx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tx.is_empty()
    }
}

/// Fixed pool of delivery threads draining an `AlertQueue`.
pub struct Dispatcher {
    queue: AlertQueue,
    shutdown: Arc<AtomicBool>,
    workers: Vec<JoinHandle<()>>,
}

impl Dispatcher {
    pub fn spawn(sink: Arc<dyn AlertSink>, config: DispatchConfig) -> Result<Self> {
        let queue = AlertQueue::bounded(config.queue_capacity);
        let shutdown = Arc::new(AtomicBool::new(false));

        let workers = (0..config.workers.max(1))
            .map(|index| {
                let rx = queue.rx.clone();
                let sink = sink.clone();
                let stats = queue.stats.clone();
                let shutdown = shutdown.clone();
                std::thread::Builder::new()
                    .name(format!("alert-dispatch-{}", index))
                    .spawn(move || dispatch_worker(rx, sink, stats, shutdown))
            })
            .collect::<std::io::Result<Vec<_>>>()
            .context("spawn alert dispatch worker")?;

        Ok(Self {
            queue,
            shutdown,
            workers,
        })
    }

    pub fn queue(&self) -> AlertQueue {
        self.queue.clone()
    }

    pub fn stats(&self) -> DispatchStatsSnapshot {
        self.queue.stats()
    }

    /// Deliver whatever is already queued, then stop the workers.
    pub fn shutdown(mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        for worker in self.workers.drain(..) {
            if worker.join().is_err() {
                log::error!("alert dispatch worker panicked");
            }
        }
        let stats = self.queue.stats();
        log::info!(
            "alert dispatcher stopped: delivered={} failed={} dropped={}",
            stats.delivered,
            stats.failed,
            stats.dropped
        );
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }
}

fn dispatch_worker(
    rx: Receiver<Alert>,
    sink: Arc<dyn AlertSink>,
    stats: Arc<DispatchStats>,
    shutdown: Arc<AtomicBool>,
) {
    loop {
        match rx.recv_timeout(WORKER_POLL) {
            Ok(alert) => match sink.deliver(&alert) {
                Ok(()) => {
                    stats.delivered.fetch_add(1, Ordering::Relaxed);
                }
                Err(err) => {
                    stats.failed.fetch_add(1, Ordering::Relaxed);
                    log::warn!(
                        "alert for camera {} not delivered: {:#}",
                        alert.camera_id,
                        err
                    );
                }
            },
            Err(RecvTimeoutError::Timeout) => {
                if shutdown.load(Ordering::SeqCst) {
                    break;
                }
            }
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
}

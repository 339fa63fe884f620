//! Supervised reconciliation queue
//!
//! The webhook handler answers before reconciliation runs, so every accepted
//! job is handed to a dispatcher task that owns it until it finishes.
//! [`ReconciliationQueue`] is the cheap sending half held by request handlers;
//! [`QueueSupervisor`] owns the dispatcher and is shut down last, after the
//! HTTP server stopped accepting requests.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot, Semaphore};
use tokio::task::{JoinError, JoinHandle, JoinSet};

use crate::error::{BillingError, BillingResult};
use crate::executor::{UpgradeExecutor, UpgradeRequest, UpgradeResult};

/// Unit of background work
#[async_trait]
pub trait ReconciliationHandler: Send + Sync {
    async fn handle(&self, request: UpgradeRequest) -> UpgradeResult;
}

#[async_trait]
impl ReconciliationHandler for UpgradeExecutor {
    async fn handle(&self, request: UpgradeRequest) -> UpgradeResult {
        self.process(&request).await
    }
}

#[derive(Debug, Clone, Copy)]
pub struct QueueConfig {
    /// Jobs buffered before `enqueue` reports the queue as full
    pub capacity: usize,
    /// Jobs running at the same time
    pub max_concurrency: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            capacity: 1024,
            max_concurrency: 8,
        }
    }
}

#[derive(Debug, Default)]
struct QueueCounters {
    enqueued: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    in_flight: AtomicU64,
}

/// Point-in-time copy of the queue counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub enqueued: u64,
    pub completed: u64,
    /// Jobs that returned `success: false` or panicked
    pub failed: u64,
    /// Accepted by the dispatcher and not yet finished
    pub in_flight: u64,
}

impl QueueCounters {
    fn snapshot(&self) -> QueueStats {
        QueueStats {
            enqueued: self.enqueued.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            in_flight: self.in_flight.load(Ordering::Relaxed),
        }
    }
}

/// Sending half of the queue
#[derive(Clone)]
pub struct ReconciliationQueue {
    tx: mpsc::Sender<UpgradeRequest>,
    counters: Arc<QueueCounters>,
}

impl ReconciliationQueue {
    /// Submit a job without waiting
    pub fn enqueue(&self, request: UpgradeRequest) -> BillingResult<()> {
        match self.tx.try_send(request) {
            Ok(()) => {
                self.counters.enqueued.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(mpsc::error::TrySendError::Full(request)) => {
                tracing::error!(
                    membership_id = %request.membership_id,
                    "Reconciliation queue full, dropping job"
                );
                Err(BillingError::QueueFull)
            }
            Err(mpsc::error::TrySendError::Closed(request)) => {
                tracing::error!(
                    membership_id = %request.membership_id,
                    "Reconciliation queue closed, dropping job"
                );
                Err(BillingError::QueueClosed)
            }
        }
    }

    pub fn stats(&self) -> QueueStats {
        self.counters.snapshot()
    }
}

/// Owner of the dispatcher task
pub struct QueueSupervisor {
    queue: ReconciliationQueue,
    shutdown_tx: oneshot::Sender<()>,
    dispatcher: JoinHandle<()>,
}

impl QueueSupervisor {
    /// Spawn the dispatcher on the current runtime
    pub fn start(handler: Arc<dyn ReconciliationHandler>, config: QueueConfig) -> Self {
        let (tx, rx) = mpsc::channel(config.capacity.max(1));
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let counters = Arc::new(QueueCounters::default());

        let dispatcher = Dispatcher {
            handler,
            permits: Arc::new(Semaphore::new(config.max_concurrency.max(1))),
            counters: counters.clone(),
            tasks: JoinSet::new(),
        };
        let dispatcher = tokio::spawn(dispatcher.run(rx, shutdown_rx));

        tracing::info!(
            capacity = config.capacity,
            max_concurrency = config.max_concurrency,
            "Reconciliation queue started"
        );

        Self {
            queue: ReconciliationQueue { tx, counters },
            shutdown_tx,
            dispatcher,
        }
    }

    pub fn queue(&self) -> ReconciliationQueue {
        self.queue.clone()
    }

    /// Stop intake and wait for every accepted job, at most `grace`
    pub async fn shutdown(self, grace: Duration) -> QueueStats {
        let pending = self.queue.stats();
        tracing::info!(
            in_flight = pending.in_flight,
            "Shutting down reconciliation queue, draining accepted jobs"
        );

        let _ = self.shutdown_tx.send(());

        match tokio::time::timeout(grace, self.dispatcher).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracing::error!(error = %e, "Reconciliation dispatcher terminated abnormally");
            }
            Err(_) => {
                tracing::warn!(
                    grace_secs = grace.as_secs(),
                    "Reconciliation queue did not drain within the grace period"
                );
            }
        }

        let stats = self.queue.stats();
        tracing::info!(
            enqueued = stats.enqueued,
            completed = stats.completed,
            failed = stats.failed,
            in_flight = stats.in_flight,
            "Reconciliation queue stopped"
        );
        stats
    }
}

struct Dispatcher {
    handler: Arc<dyn ReconciliationHandler>,
    permits: Arc<Semaphore>,
    counters: Arc<QueueCounters>,
    tasks: JoinSet<UpgradeOutcome>,
}

struct UpgradeOutcome {
    membership_id: String,
    result: UpgradeResult,
}

impl Dispatcher {
    async fn run(
        mut self,
        mut rx: mpsc::Receiver<UpgradeRequest>,
        mut shutdown_rx: oneshot::Receiver<()>,
    ) {
        loop {
            tokio::select! {
                _ = &mut shutdown_rx => {
                    rx.close();
                    break;
                }
                next = rx.recv() => match next {
                    Some(request) => self.spawn(request),
                    None => break,
                },
                Some(joined) = self.tasks.join_next(), if !self.tasks.is_empty() => {
                    self.finish(joined);
                }
            }
        }

        // Intake is closed; buffered jobs were already accepted
        while let Some(request) = rx.recv().await {
            self.spawn(request);
        }

        while let Some(joined) = self.tasks.join_next().await {
            self.finish(joined);
        }
    }

    fn spawn(&mut self, request: UpgradeRequest) {
        self.counters.in_flight.fetch_add(1, Ordering::Relaxed);

        let handler = self.handler.clone();
        let permits = self.permits.clone();
        self.tasks.spawn(async move {
            // The semaphore is never closed
            let _permit = permits.acquire_owned().await.ok();
            let membership_id = request.membership_id.clone();
            let result = handler.handle(request).await;
            UpgradeOutcome {
                membership_id,
                result,
            }
        });
    }

    fn finish(&self, joined: Result<UpgradeOutcome, JoinError>) {
        self.counters.in_flight.fetch_sub(1, Ordering::Relaxed);

        match joined {
            Ok(outcome) if outcome.result.success => {
                self.counters.completed.fetch_add(1, Ordering::Relaxed);
            }
            Ok(outcome) => {
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
                tracing::error!(
                    membership_id = %outcome.membership_id,
                    error = ?outcome.result.error,
                    "Reconciliation job failed"
                );
            }
            Err(e) => {
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
                tracing::error!(error = %e, "Reconciliation job panicked");
            }
        }
    }
}

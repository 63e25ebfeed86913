//! Sync orchestrator.
//!
//! Drains the sale queue to the POS backend whenever the server is
//! reachable. Records are submitted one at a time in creation order; each
//! gets up to `max_retries` attempts with exponential backoff between them,
//! always under the same idempotency key. A record that exhausts its budget
//! is parked as FAILED and picked up again by the next cycle.
//!
//! Cycles are triggered by the reachability monitor (transition to
//! reachable), a periodic timer while reachable, or `sync_now`.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::api::{SubmitRequest, TransactionGateway};
use crate::config::EngineConfig;
use crate::error::{Result, SyncError};
use crate::events::{EventBus, Subscription, SyncEvent};
use crate::models::{PendingSale, PendingSaleUpdate, SalePayload, SaleStatus, ServerReceipt};
use crate::queue::QueueStore;
use crate::reachability::ReachabilityMonitor;

// ---------------------------------------------------------------------------
// Retry policy
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total submission attempts per record per cycle.
    pub max_retries: u32,
    pub base_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_backoff: Duration::from_millis(1_000),
        }
    }
}

impl RetryPolicy {
    /// Wait before the next attempt, given how many attempts have failed:
    /// `base * 2^(failed - 1)`.
    pub fn delay_after(&self, failed_attempts: u32) -> Duration {
        let exponent = failed_attempts.saturating_sub(1).min(16);
        self.base_backoff.saturating_mul(1u32 << exponent)
    }
}

// ---------------------------------------------------------------------------
// Snapshots
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SyncProgress {
    pub synced: usize,
    pub failed: usize,
    pub total: usize,
}

/// Point-in-time view for status badges.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyncStatus {
    pub online: bool,
    pub actionable: usize,
    pub failed: usize,
    pub syncing: bool,
    pub progress: Option<SyncProgress>,
    pub last_sync_at: Option<DateTime<Utc>>,
    /// False when running on the volatile fallback store.
    pub durable: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CycleOutcome {
    Offline,
    AlreadyRunning,
    Empty,
    Completed(SyncProgress),
    /// Shutdown arrived mid-batch; unfinished records stay queued.
    Interrupted(SyncProgress),
}

#[derive(Debug, Clone, PartialEq)]
pub enum CheckoutOutcome {
    /// The server recorded the sale directly.
    Confirmed(ServerReceipt),
    /// The sale is in the queue and will be synced later.
    Queued(PendingSale),
}

enum RecordOutcome {
    Synced,
    Failed,
    /// Removed from the queue after the cycle fetched it.
    Skipped,
    Interrupted,
}

/// Clears the in-progress flag however the cycle ends.
struct CycleGuard<'a>(&'a AtomicBool);

impl Drop for CycleGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

pub struct SyncEngine {
    store: QueueStore,
    gateway: Arc<dyn TransactionGateway>,
    monitor: Arc<ReachabilityMonitor>,
    policy: RetryPolicy,
    sync_interval: Duration,
    events: EventBus<SyncEvent>,
    in_progress: AtomicBool,
    progress: Mutex<Option<SyncProgress>>,
    last_sync_at: Mutex<Option<DateTime<Utc>>>,
    network_subscription: Mutex<Option<Subscription>>,
    shutdown: CancellationToken,
}

impl SyncEngine {
    pub fn new(
        store: QueueStore,
        gateway: Arc<dyn TransactionGateway>,
        monitor: Arc<ReachabilityMonitor>,
        config: &EngineConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            gateway,
            monitor,
            policy: config.retry_policy(),
            sync_interval: config.sync_interval(),
            events: EventBus::new("sync"),
            in_progress: AtomicBool::new(false),
            progress: Mutex::new(None),
            last_sync_at: Mutex::new(None),
            network_subscription: Mutex::new(None),
            shutdown: CancellationToken::new(),
        })
    }

    pub fn store(&self) -> &QueueStore {
        &self.store
    }

    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&SyncEvent) + Send + Sync + 'static,
    {
        self.events.subscribe(listener)
    }

    pub fn is_syncing(&self) -> bool {
        self.in_progress.load(Ordering::SeqCst)
    }

    /// Requeue sales stranded by a crash, hook the reachability monitor and
    /// launch the periodic sync loop. The first tick fires immediately.
    pub fn start(self: &Arc<Self>) -> Result<JoinHandle<()>> {
        self.store.recover_interrupted()?;

        let weak: Weak<Self> = Arc::downgrade(self);
        let subscription = self.monitor.subscribe(move |online| {
            if !*online {
                return;
            }
            let Some(engine) = weak.upgrade() else { return };
            match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    handle.spawn(async move { engine.run_logged("network_restored").await });
                }
                Err(_) => warn!("No runtime available; sync deferred to next interval"),
            }
        });
        if let Ok(mut slot) = self.network_subscription.lock() {
            *slot = Some(subscription);
        }

        let weak: Weak<Self> = Arc::downgrade(self);
        let token = self.shutdown.clone();
        let interval = self.sync_interval;

        Ok(tokio::spawn(async move {
            info!(interval_secs = interval.as_secs(), "Sync loop started");
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let Some(engine) = weak.upgrade() else { break };
                if engine.monitor.get_status() {
                    engine.run_logged("interval").await;
                }
            }
            info!("Sync loop stopped");
        }))
    }

    /// Stop the periodic loop, abandon pending backoff waits and drop all
    /// listeners. An in-flight submission is allowed to finish.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
        let subscription = self
            .network_subscription
            .lock()
            .ok()
            .and_then(|mut slot| slot.take());
        if let Some(subscription) = subscription {
            subscription.unsubscribe();
        }
        self.events.clear();
        info!("Sync engine shut down");
    }

    async fn run_logged(&self, trigger: &str) {
        match self.sync_now().await {
            Ok(CycleOutcome::Completed(p)) => {
                info!(trigger, synced = p.synced, failed = p.failed, "Sync cycle complete");
            }
            Ok(outcome) => debug!(trigger, ?outcome, "Sync cycle skipped"),
            Err(e) => warn!(trigger, error = %e, "Sync cycle failed"),
        }
    }

    /// Run one sync cycle over every actionable record.
    pub async fn sync_now(&self) -> Result<CycleOutcome> {
        if self.shutdown.is_cancelled() {
            return Ok(CycleOutcome::Interrupted(SyncProgress::default()));
        }
        if !self.monitor.get_status() {
            debug!("Server unreachable; keeping queue pending");
            return Ok(CycleOutcome::Offline);
        }
        let Some(_guard) = self.try_begin() else {
            debug!("Sync already in progress");
            return Ok(CycleOutcome::AlreadyRunning);
        };

        let records = self.store.get_actionable()?;
        if records.is_empty() {
            return Ok(CycleOutcome::Empty);
        }

        let mut progress = SyncProgress {
            total: records.len(),
            ..SyncProgress::default()
        };
        info!(count = progress.total, "Syncing queued sales");
        self.set_progress(progress);
        self.events.emit(&SyncEvent::SyncStarted {
            count: progress.total,
        });

        let mut interrupted = false;
        for record in &records {
            match self.sync_one(record).await {
                RecordOutcome::Synced => progress.synced += 1,
                RecordOutcome::Failed => progress.failed += 1,
                RecordOutcome::Skipped => {}
                RecordOutcome::Interrupted => {
                    interrupted = true;
                    break;
                }
            }
            self.set_progress(progress);
        }

        if let Ok(mut last) = self.last_sync_at.lock() {
            *last = Some(Utc::now());
        }
        if interrupted {
            info!(synced = progress.synced, "Sync cycle interrupted by shutdown");
            return Ok(CycleOutcome::Interrupted(progress));
        }

        let done = if progress.failed == 0 {
            SyncEvent::SyncCompleted {
                synced: progress.synced,
                failed: progress.failed,
            }
        } else {
            SyncEvent::SyncFailed {
                synced: progress.synced,
                failed: progress.failed,
            }
        };
        self.events.emit(&done);
        Ok(CycleOutcome::Completed(progress))
    }

    fn try_begin(&self) -> Option<CycleGuard<'_>> {
        self.in_progress
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()
            .map(|_| CycleGuard(&self.in_progress))
    }

    fn set_progress(&self, progress: SyncProgress) {
        if let Ok(mut slot) = self.progress.lock() {
            *slot = Some(progress);
        }
    }

    /// Submit one record, retrying with backoff until it lands or the
    /// attempt budget runs out.
    async fn sync_one(&self, record: &PendingSale) -> RecordOutcome {
        let local_id = record.local_id.as_str();

        match self
            .store
            .update(local_id, &PendingSaleUpdate::status(SaleStatus::Syncing))
        {
            Ok(_) => {}
            Err(SyncError::RecordNotFound(_)) => {
                debug!(local_id, "Sale deleted before submission; skipping");
                return RecordOutcome::Skipped;
            }
            Err(e) => {
                warn!(local_id, error = %e, "Could not mark sale as syncing; skipping");
                self.emit_failed(record, &e, 0);
                return RecordOutcome::Failed;
            }
        }

        let request = SubmitRequest::for_sale(record);
        let max_attempts = self.policy.max_retries.max(1);
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            let error = match self.gateway.submit(&request).await {
                Ok(receipt) => {
                    self.finish_synced(record, receipt, attempt);
                    return RecordOutcome::Synced;
                }
                Err(e) => e,
            };

            warn!(
                local_id,
                receipt = %record.offline_receipt_number,
                attempt,
                max_attempts,
                rejected = error.is_rejection(),
                error = %error,
                "Sale submission failed"
            );

            if attempt >= max_attempts {
                self.finish_failed(record, error, attempt);
                return RecordOutcome::Failed;
            }

            let progress = PendingSaleUpdate {
                retry_count: Some(attempt),
                ..PendingSaleUpdate::default()
            };
            if let Err(e) = self.store.update(local_id, &progress) {
                warn!(local_id, error = %e, "Could not persist retry count");
            }

            let delay = self.policy.delay_after(attempt);
            debug!(local_id, delay_ms = delay.as_millis() as u64, "Backing off");
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    let requeue = PendingSaleUpdate::status(SaleStatus::Pending);
                    if let Err(e) = self.store.update(local_id, &requeue) {
                        warn!(local_id, error = %e, "Could not requeue interrupted sale");
                    }
                    return RecordOutcome::Interrupted;
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    fn finish_synced(&self, record: &PendingSale, receipt: ServerReceipt, attempts: u32) {
        let local_id = record.local_id.as_str();
        // On failure the row stays SYNCING until the next start requeues it;
        // the server deduplicates the resubmission on the idempotency key.
        if let Err(e) = self.store.complete(local_id, &receipt) {
            warn!(local_id, error = %e, "Could not remove synced sale");
        }

        info!(
            local_id,
            offline_receipt = %record.offline_receipt_number,
            server_receipt = %receipt.receipt_number,
            attempts,
            "Sale synced"
        );
        self.events.emit(&SyncEvent::TransactionSynced {
            local_id: record.local_id.clone(),
            offline_receipt: record.offline_receipt_number.clone(),
            server_transaction_id: receipt.transaction_id,
            server_receipt_number: receipt.receipt_number,
            attempts,
        });
    }

    fn finish_failed(&self, record: &PendingSale, error: SyncError, attempts: u32) {
        let local_id = record.local_id.as_str();
        let exhausted = SyncError::RetryBudgetExhausted {
            local_id: record.local_id.clone(),
            attempts,
            last_error: error.to_string(),
        };
        let update = PendingSaleUpdate {
            status: Some(SaleStatus::Failed),
            retry_count: Some(attempts),
            last_error: Some(error.to_string()),
            ..PendingSaleUpdate::default()
        };
        if let Err(e) = self.store.update(local_id, &update) {
            warn!(local_id, error = %e, "Could not mark sale as failed");
        }

        warn!(local_id, error = %exhausted, "Sale parked until next sync cycle");
        self.emit_failed(record, &error, attempts);
    }

    fn emit_failed(&self, record: &PendingSale, error: &SyncError, attempts: u32) {
        self.events.emit(&SyncEvent::TransactionFailed {
            local_id: record.local_id.clone(),
            offline_receipt: record.offline_receipt_number.clone(),
            error: error.to_string(),
            attempts,
        });
    }

    // -----------------------------------------------------------------------
    // Sale capture
    // -----------------------------------------------------------------------

    /// Queue a confirmed sale for later submission.
    pub fn queue_sale(&self, payload: SalePayload) -> Result<PendingSale> {
        let record = self.store.enqueue(payload)?;
        info!(
            local_id = %record.local_id,
            receipt = %record.offline_receipt_number,
            "Sale queued for sync"
        );
        Ok(record)
    }

    /// Record a sale, online first. When the server is reachable and no sync
    /// cycle is running the sale is submitted once directly; otherwise, or if
    /// that attempt fails, it is queued under the same idempotency key so a lost response cannot
    /// produce a second server transaction.
    pub async fn checkout(&self, payload: SalePayload) -> Result<CheckoutOutcome> {
        payload.validate()?;
        let offline_receipt_number = self.store.next_offline_receipt_number()?;
        let idempotency_key = Uuid::new_v4().to_string();

        // Direct submission only when reachable and no cycle is running, so
        // at most one submission is ever in flight.
        let guard = if self.monitor.get_status() {
            self.try_begin()
        } else {
            None
        };
        if let Some(_guard) = guard {
            let request = SubmitRequest {
                payload: payload.clone(),
                idempotency_key: idempotency_key.clone(),
                offline_receipt_number: offline_receipt_number.clone(),
            };
            match self.gateway.submit(&request).await {
                Ok(receipt) => {
                    info!(server_receipt = %receipt.receipt_number, "Sale recorded online");
                    return Ok(CheckoutOutcome::Confirmed(receipt));
                }
                Err(e) => {
                    warn!(error = %e, receipt = %offline_receipt_number, "Direct submission failed; queueing sale");
                }
            }
        }

        let record =
            self.store
                .enqueue_with_key(payload, idempotency_key, offline_receipt_number)?;
        info!(
            local_id = %record.local_id,
            receipt = %record.offline_receipt_number,
            "Sale queued for sync"
        );
        Ok(CheckoutOutcome::Queued(record))
    }

    // -----------------------------------------------------------------------
    // Inspection
    // -----------------------------------------------------------------------

    pub fn status(&self) -> Result<SyncStatus> {
        Ok(SyncStatus {
            online: self.monitor.get_status(),
            actionable: self.store.count_actionable()?,
            failed: self.store.count_failed()?,
            syncing: self.is_syncing(),
            progress: self.progress.lock().ok().and_then(|p| *p),
            last_sync_at: self.last_sync_at.lock().ok().and_then(|t| *t),
            durable: self.store.is_durable(),
        })
    }

    pub fn list_records(&self) -> Result<Vec<PendingSale>> {
        self.store.get_all()
    }

    pub fn delete_record(&self, local_id: &str) -> Result<bool> {
        let removed = self.store.remove(local_id)?;
        if removed {
            info!(local_id, "Deleted queued sale");
        }
        Ok(removed)
    }

    pub fn clear_queue(&self) -> Result<usize> {
        self.store.clear()
    }
}

//! Offline-first sale sync for the cybercafe POS.
//!
//! Confirmed sales are written to a durable SQLite queue, a reachability
//! monitor decides when the backend can take work, and the sync engine
//! drains the queue with bounded, idempotent retries. Progress is published
//! to in-process subscribers.

pub mod api;
pub mod config;
pub mod db;
pub mod error;
pub mod events;
pub mod logging;
pub mod models;
pub mod queue;
pub mod reachability;
pub mod sync;

#[cfg(test)]
mod testing;

pub use api::{HealthProbe, HttpHealthProbe, HttpTransactionGateway, SubmitRequest, TransactionGateway};
pub use config::EngineConfig;
pub use error::{Result, SyncError};
pub use events::{EventBus, Subscription, SyncEvent};
pub use models::{PaymentMethod, PendingSale, SaleItem, SalePayload, SaleStatus, ServerReceipt};
pub use queue::QueueStore;
pub use reachability::{MonitorSettings, ReachabilityMonitor};
pub use sync::{CheckoutOutcome, CycleOutcome, RetryPolicy, SyncEngine, SyncProgress, SyncStatus};

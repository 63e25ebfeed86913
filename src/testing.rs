//! Scripted fakes for the network seams, shared by unit tests.

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;

use crate::api::{HealthProbe, SubmitRequest, TransactionGateway};
use crate::error::{Result, SyncError};
use crate::models::ServerReceipt;

pub(crate) struct ScriptedProbe {
    script: Mutex<VecDeque<bool>>,
    fallback: AtomicBool,
    hang: bool,
    pub calls: AtomicUsize,
}

impl ScriptedProbe {
    pub fn new(script: Vec<bool>, fallback: bool) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into()),
            fallback: AtomicBool::new(fallback),
            hang: false,
            calls: AtomicUsize::new(0),
        })
    }

    pub fn hanging() -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(VecDeque::new()),
            fallback: AtomicBool::new(true),
            hang: true,
            calls: AtomicUsize::new(0),
        })
    }

    pub fn set_fallback(&self, healthy: bool) {
        self.fallback.store(healthy, Ordering::SeqCst);
    }
}

#[async_trait]
impl HealthProbe for ScriptedProbe {
    async fn check(&self) -> bool {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.hang {
            return std::future::pending::<bool>().await;
        }
        let next = self.script.lock().unwrap().pop_front();
        next.unwrap_or_else(|| self.fallback.load(Ordering::SeqCst))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Outcome {
    Accept,
    NetworkError,
    Reject,
    /// Server commits the sale but the client never sees the response.
    AcceptButLoseResponse,
}

/// In-memory stand-in for the idempotent transaction endpoint.
pub(crate) struct FakeGateway {
    script: Mutex<VecDeque<Outcome>>,
    fallback: Mutex<Outcome>,
    latency: Duration,
    committed: Mutex<HashMap<String, ServerReceipt>>,
    next_number: AtomicU64,
    in_flight: AtomicUsize,
    pub max_in_flight: AtomicUsize,
    pub submissions: Mutex<Vec<(SubmitRequest, Instant)>>,
}

impl FakeGateway {
    pub fn new(fallback: Outcome) -> Arc<Self> {
        Self::scripted(Vec::new(), fallback, Duration::ZERO)
    }

    pub fn scripted(script: Vec<Outcome>, fallback: Outcome, latency: Duration) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into()),
            fallback: Mutex::new(fallback),
            latency,
            committed: Mutex::new(HashMap::new()),
            next_number: AtomicU64::new(1000),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            submissions: Mutex::new(Vec::new()),
        })
    }

    pub fn set_fallback(&self, outcome: Outcome) {
        *self.fallback.lock().unwrap() = outcome;
    }

    pub fn submitted_receipts(&self) -> Vec<String> {
        self.submissions
            .lock()
            .unwrap()
            .iter()
            .map(|(req, _)| req.offline_receipt_number.clone())
            .collect()
    }

    pub fn submission_times(&self) -> Vec<Instant> {
        self.submissions
            .lock()
            .unwrap()
            .iter()
            .map(|(_, at)| *at)
            .collect()
    }

    pub fn submission_count(&self) -> usize {
        self.submissions.lock().unwrap().len()
    }

    /// Distinct server transactions created.
    pub fn committed_count(&self) -> usize {
        self.committed.lock().unwrap().len()
    }

    pub fn committed_receipt(&self, key: &str) -> Option<ServerReceipt> {
        self.committed.lock().unwrap().get(key).cloned()
    }

    fn commit(&self, key: &str) -> ServerReceipt {
        let mut committed = self.committed.lock().unwrap();
        committed
            .entry(key.to_string())
            .or_insert_with(|| {
                let number = self.next_number.fetch_add(1, Ordering::SeqCst);
                ServerReceipt {
                    transaction_id: format!("txn-{number}"),
                    receipt_number: number.to_string(),
                }
            })
            .clone()
    }
}

#[async_trait]
impl TransactionGateway for FakeGateway {
    async fn submit(&self, request: &SubmitRequest) -> Result<ServerReceipt> {
        let now_in_flight = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now_in_flight, Ordering::SeqCst);
        self.submissions
            .lock()
            .unwrap()
            .push((request.clone(), Instant::now()));

        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        let outcome = {
            let next = self.script.lock().unwrap().pop_front();
            next.unwrap_or_else(|| *self.fallback.lock().unwrap())
        };
        let result = match outcome {
            Outcome::Accept => Ok(self.commit(&request.idempotency_key)),
            Outcome::NetworkError => Err(SyncError::NetworkFailure(
                "Connection to http://localhost:8000 timed out".into(),
            )),
            Outcome::Reject => Err(SyncError::RemoteRejection {
                status: 400,
                message: "No open shift found. Please open a shift first.".into(),
            }),
            Outcome::AcceptButLoseResponse => {
                self.commit(&request.idempotency_key);
                Err(SyncError::NetworkFailure("connection reset".into()))
            }
        };

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

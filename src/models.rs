//! Sale payload and queue record types.

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::SyncError;

const MAX_DESCRIPTION_LEN: usize = 500;
const MAX_MPESA_CODE_LEN: usize = 50;

// ---------------------------------------------------------------------------
// Sale payload
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaymentMethod {
    Cash,
    Mpesa,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SaleItem {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<Uuid>,
    pub description: String,
    pub quantity: f64,
    pub unit_price: f64,
}

/// Immutable content of a confirmed sale.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SalePayload {
    pub items: Vec<SaleItem>,
    pub payment_method: PaymentMethod,
    /// M-Pesa confirmation code for mobile money payments.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mpesa_code: Option<String>,
    /// Registered customer the sale is attributed to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub customer_id: Option<Uuid>,
    #[serde(default)]
    pub discount_amount: f64,
}

impl SalePayload {
    pub fn subtotal(&self) -> f64 {
        self.items
            .iter()
            .map(|item| item.quantity * item.unit_price)
            .sum()
    }

    pub fn total(&self) -> f64 {
        self.subtotal() - self.discount_amount
    }

    /// Reject payloads the transaction endpoint can never accept, before they
    /// reach the queue.
    pub fn validate(&self) -> Result<(), SyncError> {
        if self.items.is_empty() {
            return Err(SyncError::InvalidPayload("sale has no items".into()));
        }
        for (idx, item) in self.items.iter().enumerate() {
            let description = item.description.trim();
            if description.is_empty() || description.chars().count() > MAX_DESCRIPTION_LEN {
                return Err(SyncError::InvalidPayload(format!(
                    "item {idx}: description must be 1-{MAX_DESCRIPTION_LEN} characters"
                )));
            }
            if !(item.quantity > 0.0) {
                return Err(SyncError::InvalidPayload(format!(
                    "item {idx}: quantity must be positive"
                )));
            }
            if !(item.unit_price >= 0.0) {
                return Err(SyncError::InvalidPayload(format!(
                    "item {idx}: unit price must not be negative"
                )));
            }
        }
        if !(self.discount_amount >= 0.0) {
            return Err(SyncError::InvalidPayload(
                "discount must not be negative".into(),
            ));
        }

        if let Some(code) = self.mpesa_code.as_deref() {
            if code.chars().count() > MAX_MPESA_CODE_LEN {
                return Err(SyncError::InvalidPayload(format!(
                    "M-Pesa code exceeds {MAX_MPESA_CODE_LEN} characters"
                )));
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Queue record
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SaleStatus {
    Pending,
    Syncing,
    /// Transient: a synced record is deleted right after the update, so this
    /// is only ever seen through events.
    Synced,
    Failed,
}

impl SaleStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            SaleStatus::Pending => "pending",
            SaleStatus::Syncing => "syncing",
            SaleStatus::Synced => "synced",
            SaleStatus::Failed => "failed",
        }
    }

    /// Eligible for the next sync cycle.
    pub fn is_actionable(self) -> bool {
        matches!(self, SaleStatus::Pending | SaleStatus::Failed)
    }
}

impl fmt::Display for SaleStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SaleStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(SaleStatus::Pending),
            "syncing" => Ok(SaleStatus::Syncing),
            "synced" => Ok(SaleStatus::Synced),
            "failed" => Ok(SaleStatus::Failed),
            other => Err(format!("unknown sale status: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingSale {
    pub local_id: String,
    pub idempotency_key: String,
    pub offline_receipt_number: String,
    pub payload: SalePayload,
    pub created_at: DateTime<Utc>,
    pub status: SaleStatus,
    pub retry_count: u32,
    pub last_error: Option<String>,
    pub server_transaction_id: Option<String>,
    pub server_receipt_number: Option<String>,
}

impl PendingSale {
    /// Build a fresh PENDING record with newly generated identities.
    pub fn new(payload: SalePayload, offline_receipt_number: String) -> Self {
        Self::with_idempotency_key(payload, offline_receipt_number, Uuid::new_v4().to_string())
    }

    /// Build a PENDING record reusing a key that may already have been sent
    /// to the server (online checkout falling back to the queue).
    pub fn with_idempotency_key(
        payload: SalePayload,
        offline_receipt_number: String,
        idempotency_key: String,
    ) -> Self {
        Self {
            local_id: Uuid::new_v4().to_string(),
            idempotency_key,
            offline_receipt_number,
            payload,
            // Stored with microsecond precision.
            created_at: Utc::now().trunc_subsecs(6),
            status: SaleStatus::Pending,
            retry_count: 0,
            last_error: None,
            server_transaction_id: None,
            server_receipt_number: None,
        }
    }
}

/// Partial update merged into an existing record. Carries no payload:
/// corrections go through a new compensating record.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PendingSaleUpdate {
    pub status: Option<SaleStatus>,
    pub retry_count: Option<u32>,
    pub last_error: Option<String>,
    pub server_transaction_id: Option<String>,
    pub server_receipt_number: Option<String>,
}

impl PendingSaleUpdate {
    pub fn status(status: SaleStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    /// Apply onto `record`. `retry_count` never decreases and `last_error`
    /// only survives on FAILED records.
    pub fn apply_to(&self, record: &mut PendingSale) {
        if let Some(status) = self.status {
            record.status = status;
        }
        if let Some(count) = self.retry_count {
            record.retry_count = record.retry_count.max(count);
        }
        if let Some(error) = &self.last_error {
            record.last_error = Some(error.clone());
        }
        if let Some(id) = &self.server_transaction_id {
            record.server_transaction_id = Some(id.clone());
        }
        if let Some(number) = &self.server_receipt_number {
            record.server_receipt_number = Some(number.clone());
        }
        if record.status != SaleStatus::Failed {
            record.last_error = None;
        }
    }
}

/// Authoritative identity assigned by the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerReceipt {
    pub transaction_id: String,
    pub receipt_number: String,
}

#[cfg(test)]
pub(crate) fn sample_payload() -> SalePayload {
    SalePayload {
        items: vec![SaleItem {
            service_id: None,
            session_id: None,
            description: "Printing (B/W)".into(),
            quantity: 10.0,
            unit_price: 5.0,
        }],
        payment_method: PaymentMethod::Cash,
        mpesa_code: None,
        customer_id: None,
        discount_amount: 0.0,
    }
}

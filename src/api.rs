//! POS backend API client.
//!
//! Two seams the engine depends on: `TransactionGateway` (idempotent sale
//! submission) and `HealthProbe` (reachability check). The HTTP
//! implementations talk to the FastAPI backend; tests substitute fakes.

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::error::{Result, SyncError};
use crate::models::{PendingSale, SaleItem, SalePayload, ServerReceipt};

// ---------------------------------------------------------------------------
// Seams
// ---------------------------------------------------------------------------

/// Remote transaction endpoint. Implementations must be idempotent on
/// `idempotency_key`: a repeat returns the original receipt.
#[async_trait]
pub trait TransactionGateway: Send + Sync {
    async fn submit(&self, request: &SubmitRequest) -> Result<ServerReceipt>;
}

/// Lightweight "can the server take work right now" check.
#[async_trait]
pub trait HealthProbe: Send + Sync {
    async fn check(&self) -> bool;
}

/// Everything sent for one submission attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct SubmitRequest {
    pub payload: SalePayload,
    pub idempotency_key: String,
    pub offline_receipt_number: String,
}

impl SubmitRequest {
    pub fn for_sale(sale: &PendingSale) -> Self {
        Self {
            payload: sale.payload.clone(),
            idempotency_key: sale.idempotency_key.clone(),
            offline_receipt_number: sale.offline_receipt_number.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// Wire format
// ---------------------------------------------------------------------------

/// Body of `POST /transactions/`. The server deduplicates on
/// `client_generated_id`.
#[derive(Debug, Serialize)]
struct TransactionCreateBody<'a> {
    items: &'a [SaleItem],
    payment_method: crate::models::PaymentMethod,
    #[serde(skip_serializing_if = "Option::is_none")]
    mpesa_code: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    customer_id: Option<uuid::Uuid>,
    discount_amount: f64,
    client_generated_id: &'a str,
    offline_receipt_number: &'a str,
}

impl<'a> From<&'a SubmitRequest> for TransactionCreateBody<'a> {
    fn from(req: &'a SubmitRequest) -> Self {
        Self {
            items: &req.payload.items,
            payment_method: req.payload.payment_method,
            mpesa_code: req.payload.mpesa_code.as_deref(),
            customer_id: req.payload.customer_id,
            discount_amount: req.payload.discount_amount,
            client_generated_id: &req.idempotency_key,
            offline_receipt_number: &req.offline_receipt_number,
        }
    }
}

#[derive(Debug, Deserialize)]
struct TransactionCreated {
    id: Value,
    transaction_number: Value,
}

impl TransactionCreated {
    fn into_receipt(self) -> Result<ServerReceipt> {
        let transaction_id = scalar_to_string(&self.id)
            .ok_or_else(|| SyncError::NetworkFailure("response missing transaction id".into()))?;
        let receipt_number = scalar_to_string(&self.transaction_number).ok_or_else(|| {
            SyncError::NetworkFailure("response missing transaction number".into())
        })?;
        Ok(ServerReceipt {
            transaction_id,
            receipt_number,
        })
    }
}

fn scalar_to_string(v: &Value) -> Option<String> {
    match v {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// URL normalisation
// ---------------------------------------------------------------------------

/// Normalise the backend base URL:
/// - ensure a scheme is present (https, or http for localhost)
/// - strip trailing slashes
pub fn normalize_base_url(url: &str) -> String {
    let mut url = url.trim().to_string();

    if !url.starts_with("http://") && !url.starts_with("https://") {
        if url.starts_with("localhost") || url.starts_with("127.0.0.1") {
            url = format!("http://{url}");
        } else {
            url = format!("https://{url}");
        }
    }

    while url.ends_with('/') {
        url.pop();
    }

    url
}

fn join_url(base: &str, path: &str) -> String {
    if path.starts_with('/') {
        format!("{base}{path}")
    } else {
        format!("{base}/{path}")
    }
}

// ---------------------------------------------------------------------------
// Error mapping
// ---------------------------------------------------------------------------

/// Convert a `reqwest::Error` into a user-friendly message.
fn friendly_error(url: &str, err: &reqwest::Error) -> String {
    if err.is_connect() {
        return format!("Cannot reach POS server at {url}");
    }
    if err.is_timeout() {
        return format!("Connection to {url} timed out");
    }
    if err.is_builder() {
        return format!("Invalid POS server URL: {url}");
    }
    format!("Network error communicating with {url}: {err}")
}

/// Convert an HTTP status code into a user-friendly message.
fn status_error(status: StatusCode) -> String {
    match status.as_u16() {
        401 => "Session expired or API token invalid".to_string(),
        403 => "Not permitted to record this sale".to_string(),
        404 => "Transaction endpoint not found".to_string(),
        409 => "Conflicting transaction on server".to_string(),
        s if s >= 500 => format!("POS server error (HTTP {s})"),
        s => format!("Unexpected response from POS server (HTTP {s})"),
    }
}

/// Pull FastAPI's `detail` (string or validation list) out of an error body.
fn rejection_message(status: StatusCode, body_text: &str) -> String {
    let trimmed = body_text.trim();
    match serde_json::from_str::<Value>(trimmed) {
        Ok(json) => match json.get("detail").or_else(|| json.get("message")) {
            Some(Value::String(s)) => s.clone(),
            Some(other) => format!("{}: {other}", status_error(status)),
            None => status_error(status),
        },
        Err(_) if !trimmed.is_empty() => format!("{}: {trimmed}", status_error(status)),
        Err(_) => status_error(status),
    }
}

// ---------------------------------------------------------------------------
// HTTP gateway
// ---------------------------------------------------------------------------

pub struct HttpTransactionGateway {
    client: Client,
    endpoint: String,
    base: String,
    api_token: Option<String>,
}

impl HttpTransactionGateway {
    pub fn new(config: &EngineConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.submit_timeout())
            .build()
            .map_err(|e| SyncError::NetworkFailure(format!("Failed to create HTTP client: {e}")))?;
        let base = normalize_base_url(&config.api_base_url);
        Ok(Self {
            client,
            endpoint: join_url(&base, &config.transactions_path),
            base,
            api_token: config.api_token.clone(),
        })
    }
}

#[async_trait]
impl TransactionGateway for HttpTransactionGateway {
    async fn submit(&self, request: &SubmitRequest) -> Result<ServerReceipt> {
        let body = TransactionCreateBody::from(request);
        let mut req = self
            .client
            .post(&self.endpoint)
            .header("Idempotency-Key", &request.idempotency_key)
            .json(&body);
        if let Some(token) = &self.api_token {
            req = req.bearer_auth(token);
        }

        let resp = req
            .send()
            .await
            .map_err(|e| SyncError::NetworkFailure(friendly_error(&self.base, &e)))?;
        let status = resp.status();
        let body_text = resp
            .text()
            .await
            .map_err(|e| SyncError::NetworkFailure(friendly_error(&self.base, &e)))?;

        if !status.is_success() {
            let message = rejection_message(status, &body_text);
            debug!(
                status = status.as_u16(),
                receipt = %request.offline_receipt_number,
                "Transaction submission rejected"
            );
            return Err(SyncError::RemoteRejection {
                status: status.as_u16(),
                message,
            });
        }

        let created: TransactionCreated = serde_json::from_str(&body_text).map_err(|e| {
            SyncError::NetworkFailure(format!("Invalid JSON from POS server: {e}"))
        })?;
        created.into_receipt()
    }
}

// ---------------------------------------------------------------------------
// Health probe
// ---------------------------------------------------------------------------

pub struct HttpHealthProbe {
    client: Client,
    health_url: String,
}

impl HttpHealthProbe {
    pub fn new(config: &EngineConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.probe_timeout())
            .build()
            .map_err(|e| SyncError::NetworkFailure(format!("Failed to create HTTP client: {e}")))?;
        let base = normalize_base_url(&config.api_base_url);
        Ok(Self {
            client,
            health_url: join_url(&base, &config.health_path),
        })
    }
}

#[async_trait]
impl HealthProbe for HttpHealthProbe {
    async fn check(&self) -> bool {
        let start = Instant::now();
        match self.client.get(&self.health_url).send().await {
            Ok(resp) if resp.status().is_success() => {
                debug!(
                    latency_ms = start.elapsed().as_millis() as u64,
                    "Health probe passed"
                );
                true
            }
            Ok(resp) => {
                info!(status = resp.status().as_u16(), "Health probe returned non-success");
                false
            }
            Err(e) => {
                warn!(error = %friendly_error(&self.health_url, &e), "Health probe failed");
                false
            }
        }
    }
}

/// Run `probe` with a hard deadline; a timeout counts as unreachable.
pub(crate) async fn bounded_check(probe: &dyn HealthProbe, timeout: Duration) -> bool {
    tokio::time::timeout(timeout, probe.check())
        .await
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{sample_payload, PaymentMethod};

    #[test]
    fn test_normalize_base_url() {
        assert_eq!(normalize_base_url("pos.example.com/"), "https://pos.example.com");
        assert_eq!(normalize_base_url("localhost:8000//"), "http://localhost:8000");
        assert_eq!(
            normalize_base_url(" http://10.0.0.5:8000 "),
            "http://10.0.0.5:8000"
        );
    }

    #[test]
    fn test_join_url_handles_slashes() {
        assert_eq!(join_url("http://h", "/health"), "http://h/health");
        assert_eq!(join_url("http://h", "transactions/"), "http://h/transactions/");
    }

    #[test]
    fn test_create_body_carries_idempotency_fields() {
        let mut payload = sample_payload();
        payload.payment_method = PaymentMethod::Mpesa;
        payload.mpesa_code = Some("QWE123RTY".into());
        let request = SubmitRequest {
            payload,
            idempotency_key: "key-1".into(),
            offline_receipt_number: "OFF-20260212-0001".into(),
        };

        let json = serde_json::to_value(TransactionCreateBody::from(&request)).unwrap();
        assert_eq!(json["client_generated_id"], "key-1");
        assert_eq!(json["offline_receipt_number"], "OFF-20260212-0001");
        assert_eq!(json["payment_method"], "mpesa");
        assert_eq!(json["mpesa_code"], "QWE123RTY");
        assert_eq!(json["items"][0]["description"], "Printing (B/W)");
        assert!(json.get("customer_id").is_none());
    }

    #[test]
    fn test_created_response_accepts_numeric_receipt() {
        let created: TransactionCreated = serde_json::from_str(
            r#"{"id": "8d1f1c4e-0000-4000-8000-000000000001", "transaction_number": 42, "status": "completed"}"#,
        )
        .unwrap();
        let receipt = created.into_receipt().unwrap();
        assert_eq!(receipt.transaction_id, "8d1f1c4e-0000-4000-8000-000000000001");
        assert_eq!(receipt.receipt_number, "42");
    }

    #[test]
    fn test_rejection_message_prefers_detail() {
        assert_eq!(
            rejection_message(
                StatusCode::BAD_REQUEST,
                r#"{"detail": "No open shift found. Please open a shift first."}"#
            ),
            "No open shift found. Please open a shift first."
        );
        assert_eq!(
            rejection_message(StatusCode::BAD_GATEWAY, ""),
            "POS server error (HTTP 502)"
        );
        assert!(rejection_message(StatusCode::UNPROCESSABLE_ENTITY, r#"{"detail": [{"loc": ["body"]}]}"#)
            .starts_with("Unexpected response from POS server (HTTP 422)"));
    }

    struct NeverAnswers;

    #[async_trait]
    impl HealthProbe for NeverAnswers {
        async fn check(&self) -> bool {
            std::future::pending::<bool>().await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_bounded_check_times_out_as_unreachable() {
        assert!(!bounded_check(&NeverAnswers, Duration::from_secs(5)).await);
    }
}

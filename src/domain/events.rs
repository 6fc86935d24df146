//! Wire contracts exchanged with the antifraud scorer over the bus.

use crate::domain::invoice::{Invoice, Verdict};
use crate::domain::money::cents_to_amount;
use crate::error::Result;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const PENDING_TRANSACTION_EVENT: &str = "pending_transaction";
pub const PENDING_TRANSACTION_SCHEMA_VERSION: u32 = 2;

pub const REASON_INVALID_PAYLOAD: &str = "invalid_payload";
pub const REASON_MISSING_EVENT_ID: &str = "missing_event_id";
pub const REASON_DEDUP_CHECK_FAILED: &str = "dedup_check_failed";

/// Review request published for every invoice held as pending.
#[derive(Debug, Serialize, Deserialize, PartialEq, Clone)]
pub struct PendingTransaction {
    pub schema_version: u32,
    pub event_id: Uuid,
    pub account_id: Uuid,
    pub invoice_id: Uuid,
    /// Major units, emitted as a JSON number for older consumers.
    #[serde(with = "rust_decimal::serde::float")]
    pub amount: Decimal,
    pub amount_cents: i64,
    pub occurred_at: DateTime<Utc>,
}

impl PendingTransaction {
    pub fn for_invoice(invoice: &Invoice) -> Self {
        Self {
            schema_version: PENDING_TRANSACTION_SCHEMA_VERSION,
            event_id: Uuid::new_v4(),
            account_id: invoice.account_id,
            invoice_id: invoice.id,
            amount: cents_to_amount(invoice.amount_cents),
            amount_cents: invoice.amount_cents,
            occurred_at: Utc::now(),
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }
}

/// Antifraud verdict for a pending invoice.
///
/// `event_id` defaults to empty so a missing id is reported as such rather
/// than as a generic decoding failure.
#[derive(Debug, Serialize, Deserialize, PartialEq, Clone)]
pub struct TransactionResult {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema_version: Option<u32>,
    #[serde(default)]
    pub event_id: String,
    pub invoice_id: Uuid,
    pub status: Verdict,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub occurred_at: Option<DateTime<Utc>>,
}

impl TransactionResult {
    pub fn new(invoice_id: Uuid, status: Verdict) -> Self {
        Self {
            schema_version: Some(PENDING_TRANSACTION_SCHEMA_VERSION),
            event_id: Uuid::new_v4().to_string(),
            invoice_id,
            status,
            occurred_at: Some(Utc::now()),
        }
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }
}

/// Envelope written to the dead-letter topic. `payload` holds the original
/// message verbatim so a replay republishes exactly what was received.
#[derive(Debug, Serialize, Deserialize, PartialEq, Clone)]
pub struct DeadLetter {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub event_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub invoice_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub status: String,
    #[serde(default)]
    pub error: String,
    pub payload: String,
    #[serde(default)]
    pub failed_at: Option<DateTime<Utc>>,
}

impl DeadLetter {
    pub fn new(original: &[u8], reason: impl Into<String>) -> Self {
        Self {
            event_id: String::new(),
            invoice_id: String::new(),
            status: String::new(),
            error: reason.into(),
            payload: String::from_utf8_lossy(original).into_owned(),
            failed_at: Some(Utc::now()),
        }
    }

    pub fn for_result(original: &[u8], result: &TransactionResult, reason: impl Into<String>) -> Self {
        Self {
            event_id: result.event_id.clone(),
            invoice_id: result.invoice_id.to_string(),
            status: result.status.to_string(),
            ..Self::new(original, reason)
        }
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }
}

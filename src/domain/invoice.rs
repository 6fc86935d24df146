use crate::domain::money::CENTS_FACTOR;
use crate::error::{GatewayError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Invoices strictly above this amount are held for antifraud review.
pub const REVIEW_THRESHOLD_CENTS: i64 = 10_000 * CENTS_FACTOR;

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Hash, Clone, Copy)]
#[serde(rename_all = "lowercase")]
pub enum InvoiceStatus {
    Pending,
    Approved,
    Rejected,
}

impl InvoiceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending)
    }
}

impl fmt::Display for InvoiceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for InvoiceStatus {
    type Err = GatewayError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(Self::Pending),
            "approved" => Ok(Self::Approved),
            "rejected" => Ok(Self::Rejected),
            other => Err(GatewayError::ValidationError(format!(
                "Unknown invoice status: {other}"
            ))),
        }
    }
}

/// A terminal antifraud decision. Only these two statuses can be applied by
/// settlement.
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone, Copy)]
#[serde(rename_all = "lowercase")]
pub enum Verdict {
    Approved,
    Rejected,
}

impl From<Verdict> for InvoiceStatus {
    fn from(verdict: Verdict) -> Self {
        match verdict {
            Verdict::Approved => InvoiceStatus::Approved,
            Verdict::Rejected => InvoiceStatus::Rejected,
        }
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        InvoiceStatus::from(*self).fmt(f)
    }
}

/// Result of a settlement attempt that did not conflict.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum SettlementOutcome {
    /// The invoice moved out of pending in this transaction.
    Applied {
        from: InvoiceStatus,
        to: InvoiceStatus,
        /// Cents credited to the owning account, if any.
        balance_applied: Option<i64>,
    },
    /// The invoice already carried the requested status; nothing changed.
    AlreadyApplied(InvoiceStatus),
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone, Copy)]
#[serde(rename_all = "snake_case")]
pub enum PaymentType {
    CreditCard,
    Boleto,
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Clone)]
pub struct Invoice {
    pub id: Uuid,
    pub account_id: Uuid,
    pub amount_cents: i64,
    pub status: InvoiceStatus,
    pub description: String,
    pub payment_type: PaymentType,
    pub card_last_digits: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Invoice {
    /// Builds a pending invoice. Only the last four card digits are kept.
    pub fn new(
        account_id: Uuid,
        amount_cents: i64,
        description: impl Into<String>,
        payment_type: PaymentType,
        card_number: Option<&str>,
    ) -> Result<Self> {
        if amount_cents <= 0 {
            return Err(GatewayError::ValidationError(
                "Amount must be positive".to_string(),
            ));
        }

        let card_last_digits = match (payment_type, card_number) {
            (PaymentType::CreditCard, Some(number)) if number.chars().count() >= 4 => {
                let skip = number.chars().count() - 4;
                number.chars().skip(skip).collect()
            }
            (PaymentType::CreditCard, _) => {
                return Err(GatewayError::ValidationError(
                    "Invalid card number".to_string(),
                ));
            }
            (PaymentType::Boleto, _) => String::new(),
        };

        let now = Utc::now();
        Ok(Self {
            id: Uuid::new_v4(),
            account_id,
            amount_cents,
            status: InvoiceStatus::Pending,
            description: description.into(),
            payment_type,
            card_last_digits,
            created_at: now,
            updated_at: now,
        })
    }

    pub fn requires_review(&self, threshold_cents: i64) -> bool {
        self.amount_cents > threshold_cents
    }

    /// Decides invoices that do not need review on the spot. Invoices above
    /// the threshold stay pending.
    pub fn triage(&mut self, threshold_cents: i64) {
        if !self.requires_review(threshold_cents) {
            self.status = InvoiceStatus::Approved;
            self.updated_at = Utc::now();
        }
    }
}

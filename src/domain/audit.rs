//! Append-only audit records: invoice lifecycle events and DLQ replay runs.

use crate::domain::invoice::{Invoice, InvoiceStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone, Copy)]
#[serde(rename_all = "snake_case")]
pub enum InvoiceEventType {
    Created,
    PendingPublished,
    Approved,
    Rejected,
    BalanceApplied,
}

impl From<InvoiceStatus> for InvoiceEventType {
    fn from(status: InvoiceStatus) -> Self {
        match status {
            InvoiceStatus::Pending => Self::Created,
            InvoiceStatus::Approved => Self::Approved,
            InvoiceStatus::Rejected => Self::Rejected,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Clone)]
pub struct InvoiceEvent {
    pub id: Uuid,
    pub invoice_id: Uuid,
    pub event_type: InvoiceEventType,
    pub from_status: Option<InvoiceStatus>,
    pub to_status: Option<InvoiceStatus>,
    pub metadata: Option<serde_json::Value>,
    pub correlation_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl InvoiceEvent {
    pub fn new(
        invoice_id: Uuid,
        event_type: InvoiceEventType,
        from_status: Option<InvoiceStatus>,
        to_status: Option<InvoiceStatus>,
        correlation_id: Option<&str>,
    ) -> Self {
        Self {
            // v7 keeps events of one invoice sortable by creation time.
            id: Uuid::now_v7(),
            invoice_id,
            event_type,
            from_status,
            to_status,
            metadata: None,
            correlation_id: correlation_id.filter(|c| !c.is_empty()).map(str::to_string),
            created_at: Utc::now(),
        }
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = Some(metadata);
        self
    }

    pub fn created(invoice: &Invoice, correlation_id: Option<&str>) -> Self {
        Self::new(
            invoice.id,
            InvoiceEventType::Created,
            None,
            Some(invoice.status),
            correlation_id,
        )
    }

    pub fn pending_published(invoice: &Invoice, correlation_id: Option<&str>) -> Self {
        Self::new(
            invoice.id,
            InvoiceEventType::PendingPublished,
            Some(invoice.status),
            Some(invoice.status),
            correlation_id,
        )
    }

    pub fn transition(
        invoice_id: Uuid,
        from: Option<InvoiceStatus>,
        to: InvoiceStatus,
        correlation_id: Option<&str>,
    ) -> Self {
        Self::new(invoice_id, to.into(), from, Some(to), correlation_id)
    }

    pub fn balance_applied(invoice: &Invoice, correlation_id: Option<&str>) -> Self {
        Self::new(
            invoice.id,
            InvoiceEventType::BalanceApplied,
            Some(InvoiceStatus::Approved),
            Some(InvoiceStatus::Approved),
            correlation_id,
        )
        .with_metadata(serde_json::json!({
            "amount_cents": invoice.amount_cents,
            "account_id": invoice.account_id,
        }))
    }

    /// Trail of an invoice persisted already decided.
    pub fn creation_trail(invoice: &Invoice, correlation_id: Option<&str>) -> Vec<Self> {
        let mut events = vec![Self::created(invoice, correlation_id)];
        if invoice.status.is_terminal() {
            events.push(Self::transition(invoice.id, None, invoice.status, correlation_id));
        }
        if invoice.status == InvoiceStatus::Approved {
            events.push(Self::balance_applied(invoice, correlation_id));
        }
        events
    }

    /// Trail of a pending invoice reaching `to` through settlement.
    pub fn settlement_trail(
        invoice: &Invoice,
        to: InvoiceStatus,
        correlation_id: Option<&str>,
    ) -> Vec<Self> {
        let mut events = vec![Self::transition(
            invoice.id,
            Some(invoice.status),
            to,
            correlation_id,
        )];
        if to == InvoiceStatus::Approved {
            events.push(Self::balance_applied(invoice, correlation_id));
        }
        events
    }
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone, Copy)]
#[serde(rename_all = "snake_case")]
pub enum ReplayMode {
    DryRun,
    Execute,
}

impl ReplayMode {
    pub fn from_dry_run(dry_run: bool) -> Self {
        if dry_run { Self::DryRun } else { Self::Execute }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DryRun => "dry_run",
            Self::Execute => "execute",
        }
    }
}

impl fmt::Display for ReplayMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One operator action taken on a dead-lettered message.
#[derive(Debug, Serialize, Deserialize, PartialEq, Clone)]
pub struct DlqReplayAudit {
    pub id: Uuid,
    pub event_id: String,
    pub invoice_id: Option<Uuid>,
    pub status: String,
    pub reason: String,
    pub mode: ReplayMode,
    pub operator: String,
    pub success: bool,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl DlqReplayAudit {
    pub fn new(
        event_id: impl Into<String>,
        invoice_id: Option<Uuid>,
        status: impl Into<String>,
        reason: impl Into<String>,
        mode: ReplayMode,
        operator: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::now_v7(),
            event_id: event_id.into(),
            invoice_id,
            status: status.into(),
            reason: reason.into(),
            mode,
            operator: operator.into(),
            success: true,
            error: None,
            created_at: Utc::now(),
        }
    }

    pub fn failed(mut self, error: impl Into<String>) -> Self {
        self.success = false;
        self.error = Some(error.into());
        self
    }
}

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone, Copy)]
#[serde(rename_all = "lowercase")]
pub enum OutboxStatus {
    Pending,
    Processing,
    Sent,
    Failed,
    /// Gave up after the configured attempt ceiling; needs an operator.
    Exhausted,
}

impl OutboxStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Sent => "sent",
            Self::Failed => "failed",
            Self::Exhausted => "exhausted",
        }
    }
}

impl fmt::Display for OutboxStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An event staged for publication in the same transaction as the invoice
/// it describes.
#[derive(Debug, Serialize, Deserialize, PartialEq, Clone)]
pub struct OutboxEvent {
    /// Time-ordered so storage order matches creation order.
    pub id: Uuid,
    pub aggregate_id: Uuid,
    pub event_type: String,
    pub payload: Vec<u8>,
    pub status: OutboxStatus,
    pub attempts: u32,
    /// Earliest retry time for failed rows; lease expiry for processing rows.
    pub next_attempt_at: DateTime<Utc>,
    pub correlation_id: Option<String>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl OutboxEvent {
    pub fn new(
        aggregate_id: Uuid,
        event_type: impl Into<String>,
        payload: Vec<u8>,
        correlation_id: Option<&str>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::now_v7(),
            aggregate_id,
            event_type: event_type.into(),
            payload,
            status: OutboxStatus::Pending,
            attempts: 0,
            next_attempt_at: now,
            correlation_id: correlation_id.filter(|c| !c.is_empty()).map(str::to_string),
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Whether a relay may claim this row at `now`. A processing row is
    /// claimable again once its lease has run out.
    pub fn is_claimable(&self, now: DateTime<Utc>) -> bool {
        match self.status {
            OutboxStatus::Pending | OutboxStatus::Failed | OutboxStatus::Processing => {
                self.next_attempt_at <= now
            }
            OutboxStatus::Sent | OutboxStatus::Exhausted => false,
        }
    }

    /// Whether the row can ever be claimed again.
    pub fn is_open(&self) -> bool {
        !matches!(self.status, OutboxStatus::Sent | OutboxStatus::Exhausted)
    }

    pub fn claim(&mut self, now: DateTime<Utc>, lease_until: DateTime<Utc>) {
        self.status = OutboxStatus::Processing;
        self.attempts += 1;
        self.next_attempt_at = lease_until;
        self.updated_at = now;
    }

    pub fn mark_sent(&mut self, now: DateTime<Utc>) {
        self.status = OutboxStatus::Sent;
        self.last_error = None;
        self.updated_at = now;
    }

    pub fn mark_failed(&mut self, now: DateTime<Utc>, next_attempt_at: DateTime<Utc>, error: &str) {
        self.status = OutboxStatus::Failed;
        self.next_attempt_at = next_attempt_at;
        self.last_error = Some(error.to_string());
        self.updated_at = now;
    }

    pub fn mark_exhausted(&mut self, now: DateTime<Utc>, error: &str) {
        self.status = OutboxStatus::Exhausted;
        self.last_error = Some(error.to_string());
        self.updated_at = now;
    }
}

/// Row counts per status, for monitoring stuck or exhausted events.
#[derive(Debug, Default, PartialEq, Eq, Clone, Copy, Serialize)]
pub struct OutboxStatusCounts {
    pub pending: u64,
    pub processing: u64,
    pub sent: u64,
    pub failed: u64,
    pub exhausted: u64,
}

impl OutboxStatusCounts {
    pub fn record(&mut self, status: OutboxStatus) {
        match status {
            OutboxStatus::Pending => self.pending += 1,
            OutboxStatus::Processing => self.processing += 1,
            OutboxStatus::Sent => self.sent += 1,
            OutboxStatus::Failed => self.failed += 1,
            OutboxStatus::Exhausted => self.exhausted += 1,
        }
    }
}

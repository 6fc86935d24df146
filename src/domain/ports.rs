use super::account::Account;
use super::audit::{DlqReplayAudit, InvoiceEvent};
use super::idempotency::IdempotencyRecord;
use super::invoice::{Invoice, SettlementOutcome, Verdict};
use super::message::{BusMessage, Delivery};
use super::outbox::{OutboxEvent, OutboxStatusCounts};
use crate::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Accounts, invoices and their audit trail. Every method that writes more
/// than one row does so atomically.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    async fn create_account(&self, account: Account) -> Result<()>;
    async fn find_account(&self, id: Uuid) -> Result<Option<Account>>;
    async fn find_account_by_api_key(&self, hash: &str, version: &str) -> Result<Option<Account>>;
    /// Atomically increments the balance. Fails with not-found for an
    /// unknown account.
    async fn add_balance(&self, account_id: Uuid, amount_cents: i64) -> Result<Account>;

    /// Persists an invoice that was decided on creation, together with its
    /// `created` event and, for an approved invoice, the balance credit.
    async fn create(&self, invoice: Invoice, correlation_id: Option<&str>) -> Result<()>;

    /// Persists a pending invoice and stages its review event for
    /// publication in one transaction.
    async fn create_with_outbox(
        &self,
        invoice: Invoice,
        event_type: &str,
        payload: Vec<u8>,
        correlation_id: Option<&str>,
    ) -> Result<OutboxEvent>;

    /// Applies an antifraud verdict exactly once. Replaying the same verdict
    /// is a no-op; a different verdict on a decided invoice is a conflict.
    async fn apply_result(
        &self,
        invoice_id: Uuid,
        verdict: Verdict,
        correlation_id: Option<&str>,
    ) -> Result<SettlementOutcome>;

    async fn find_invoice(&self, id: Uuid) -> Result<Option<Invoice>>;
    /// Audit trail of one invoice in the order it was written.
    async fn list_invoice_events(&self, invoice_id: Uuid) -> Result<Vec<InvoiceEvent>>;
}

#[async_trait]
pub trait OutboxStore: Send + Sync {
    /// Leases up to `limit` claimable rows, oldest first. A claimed row is
    /// not handed to anyone else until `lease` elapses.
    async fn claim_pending(&self, limit: usize, lease: Duration) -> Result<Vec<OutboxEvent>>;
    async fn mark_sent(&self, id: Uuid) -> Result<()>;
    async fn mark_failed(&self, id: Uuid, next_attempt_at: DateTime<Utc>, error: &str) -> Result<()>;
    async fn mark_exhausted(&self, id: Uuid, error: &str) -> Result<()>;
    async fn get(&self, id: Uuid) -> Result<Option<OutboxEvent>>;
    async fn list_for_aggregate(&self, aggregate_id: Uuid) -> Result<Vec<OutboxEvent>>;
    async fn status_counts(&self) -> Result<OutboxStatusCounts>;
}

/// Markers of bus events already applied.
#[async_trait]
pub trait ProcessedEventStore: Send + Sync {
    async fn exists(&self, event_id: &str) -> Result<bool>;
    /// Saving an existing marker succeeds without change.
    async fn save(&self, event_id: &str, invoice_id: Uuid) -> Result<()>;
}

#[async_trait]
pub trait IdempotencyStore: Send + Sync {
    async fn get(&self, key: &str, endpoint: &str) -> Result<Option<IdempotencyRecord>>;
    /// Inserts the record unless one exists for its (key, endpoint).
    /// Returns whether this call won the reservation.
    async fn create_processing(&self, record: IdempotencyRecord) -> Result<bool>;
    async fn complete(&self, key: &str, endpoint: &str, status_code: u16, body: Vec<u8>) -> Result<()>;
    async fn delete(&self, key: &str, endpoint: &str) -> Result<()>;
    /// Removes expired rows, returning how many went.
    async fn delete_expired(&self, now: DateTime<Utc>) -> Result<u64>;
}

#[async_trait]
pub trait ReplayAuditStore: Send + Sync {
    async fn save(&self, audit: DlqReplayAudit) -> Result<()>;
    async fn list(&self) -> Result<Vec<DlqReplayAudit>>;
}

#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(&self, topic: &str, message: BusMessage) -> Result<()>;
}

/// A consumer-group cursor over one topic. Deliveries past the committed
/// position are handed out again after a resubscribe.
#[async_trait]
pub trait Subscription: Send {
    /// Next delivery, or `None` when nothing arrived within the poll window.
    async fn fetch(&mut self) -> Result<Option<Delivery>>;
    async fn commit(&mut self, delivery: &Delivery) -> Result<()>;
}

#[async_trait]
pub trait Broker: Publisher {
    async fn subscribe(&self, topic: &str, group: &str) -> Result<Box<dyn Subscription>>;
}

pub type LedgerStoreRef = Arc<dyn LedgerStore>;
pub type OutboxStoreRef = Arc<dyn OutboxStore>;
pub type ProcessedEventStoreRef = Arc<dyn ProcessedEventStore>;
pub type IdempotencyStoreRef = Arc<dyn IdempotencyStore>;
pub type ReplayAuditStoreRef = Arc<dyn ReplayAuditStore>;
pub type PublisherRef = Arc<dyn Publisher>;
pub type BrokerRef = Arc<dyn Broker>;


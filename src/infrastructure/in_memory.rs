use crate::domain::account::Account;
use crate::domain::audit::{DlqReplayAudit, InvoiceEvent};
use crate::domain::idempotency::IdempotencyRecord;
use crate::domain::invoice::{Invoice, InvoiceStatus, SettlementOutcome, Verdict};
use crate::domain::outbox::{OutboxEvent, OutboxStatusCounts};
use crate::domain::ports::{
    IdempotencyStore, LedgerStore, OutboxStore, ProcessedEventStore, ReplayAuditStore,
};
use crate::error::{GatewayError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::instrument;
use uuid::Uuid;

#[derive(Debug, Clone)]
struct ProcessedEvent {
    invoice_id: Uuid,
    processed_at: DateTime<Utc>,
}

#[derive(Default)]
struct Tables {
    accounts: HashMap<Uuid, Account>,
    invoices: HashMap<Uuid, Invoice>,
    invoice_events: HashMap<Uuid, Vec<InvoiceEvent>>,
    /// Keyed by v7 id, so iteration follows creation order.
    outbox: BTreeMap<Uuid, OutboxEvent>,
    processed_events: HashMap<String, ProcessedEvent>,
    idempotency_keys: HashMap<(String, String), IdempotencyRecord>,
    replay_audits: Vec<DlqReplayAudit>,
}

impl Tables {
    fn append_events(&mut self, events: Vec<InvoiceEvent>) {
        for event in events {
            self.invoice_events.entry(event.invoice_id).or_default().push(event);
        }
    }

    fn insert_invoice(&mut self, invoice: &Invoice) -> Result<()> {
        if !self.accounts.contains_key(&invoice.account_id) {
            return Err(GatewayError::not_found("account", invoice.account_id));
        }
        if self.invoices.contains_key(&invoice.id) {
            return Err(GatewayError::StoreError(format!(
                "Invoice {} already exists",
                invoice.id
            )));
        }
        self.invoices.insert(invoice.id, invoice.clone());
        Ok(())
    }

    /// The account as it would be after the credit, without storing it.
    fn credited(&self, account_id: Uuid, amount_cents: i64) -> Result<Account> {
        let mut account = self
            .accounts
            .get(&account_id)
            .cloned()
            .ok_or_else(|| GatewayError::not_found("account", account_id))?;
        account.credit(amount_cents)?;
        Ok(account)
    }

    fn outbox_event(&mut self, id: Uuid) -> Result<&mut OutboxEvent> {
        self.outbox
            .get_mut(&id)
            .ok_or_else(|| GatewayError::not_found("outbox event", id))
    }
}

/// A thread-safe in-memory backend for every store port.
///
/// All tables live behind one `Arc<RwLock<..>>`. Each multi-row operation
/// holds the write lock for its whole duration, which makes it atomic and
/// serializes settlements the way a row lock would.
#[derive(Default, Clone)]
pub struct InMemoryStore {
    tables: Arc<RwLock<Tables>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// When `event_id` was marked processed, if it was.
    pub async fn processed_at(&self, event_id: &str) -> Option<(Uuid, DateTime<Utc>)> {
        let tables = self.tables.read().await;
        tables
            .processed_events
            .get(event_id)
            .map(|p| (p.invoice_id, p.processed_at))
    }
}

#[async_trait]
impl LedgerStore for InMemoryStore {
    async fn create_account(&self, account: Account) -> Result<()> {
        let mut tables = self.tables.write().await;
        if tables
            .accounts
            .values()
            .any(|a| a.api_key_hash == account.api_key_hash)
        {
            return Err(GatewayError::StoreError("API key hash already in use".to_string()));
        }
        tables.accounts.insert(account.id, account);
        Ok(())
    }

    async fn find_account(&self, id: Uuid) -> Result<Option<Account>> {
        let tables = self.tables.read().await;
        Ok(tables.accounts.get(&id).cloned())
    }

    async fn find_account_by_api_key(&self, hash: &str, version: &str) -> Result<Option<Account>> {
        let tables = self.tables.read().await;
        Ok(tables
            .accounts
            .values()
            .find(|a| a.matches_credential(hash, version))
            .cloned())
    }

    async fn add_balance(&self, account_id: Uuid, amount_cents: i64) -> Result<Account> {
        let mut tables = self.tables.write().await;
        let account = tables
            .accounts
            .get_mut(&account_id)
            .ok_or_else(|| GatewayError::not_found("account", account_id))?;
        account.credit(amount_cents)?;
        Ok(account.clone())
    }

    async fn create(&self, invoice: Invoice, correlation_id: Option<&str>) -> Result<()> {
        let mut tables = self.tables.write().await;
        let credited = match invoice.status {
            InvoiceStatus::Approved => Some(tables.credited(invoice.account_id, invoice.amount_cents)?),
            _ => None,
        };
        tables.insert_invoice(&invoice)?;
        if let Some(account) = credited {
            tables.accounts.insert(account.id, account);
        }
        tables.append_events(InvoiceEvent::creation_trail(&invoice, correlation_id));
        Ok(())
    }

    async fn create_with_outbox(
        &self,
        invoice: Invoice,
        event_type: &str,
        payload: Vec<u8>,
        correlation_id: Option<&str>,
    ) -> Result<OutboxEvent> {
        let mut tables = self.tables.write().await;
        tables.insert_invoice(&invoice)?;

        let event = OutboxEvent::new(invoice.id, event_type, payload, correlation_id);
        tables.outbox.insert(event.id, event.clone());
        tables.append_events(vec![
            InvoiceEvent::created(&invoice, correlation_id),
            InvoiceEvent::pending_published(&invoice, correlation_id),
        ]);
        Ok(event)
    }

    #[instrument(skip(self), fields(backend = "in_memory"))]
    async fn apply_result(
        &self,
        invoice_id: Uuid,
        verdict: Verdict,
        correlation_id: Option<&str>,
    ) -> Result<SettlementOutcome> {
        let target = InvoiceStatus::from(verdict);
        let mut tables = self.tables.write().await;

        let invoice = tables
            .invoices
            .get(&invoice_id)
            .cloned()
            .ok_or_else(|| GatewayError::not_found("invoice", invoice_id))?;

        if invoice.status.is_terminal() {
            if invoice.status == target {
                return Ok(SettlementOutcome::AlreadyApplied(target));
            }
            return Err(GatewayError::InvalidStateTransition {
                from: invoice.status,
                to: target,
            });
        }

        // Everything fallible runs before the first write.
        let credited = match target {
            InvoiceStatus::Approved => Some(tables.credited(invoice.account_id, invoice.amount_cents)?),
            _ => None,
        };

        let trail = InvoiceEvent::settlement_trail(&invoice, target, correlation_id);
        let balance_applied = credited.map(|account| {
            tables.accounts.insert(account.id, account);
            invoice.amount_cents
        });

        if let Some(stored) = tables.invoices.get_mut(&invoice_id) {
            stored.status = target;
            stored.updated_at = Utc::now();
        }
        tables.append_events(trail);

        Ok(SettlementOutcome::Applied {
            from: invoice.status,
            to: target,
            balance_applied,
        })
    }

    async fn find_invoice(&self, id: Uuid) -> Result<Option<Invoice>> {
        let tables = self.tables.read().await;
        Ok(tables.invoices.get(&id).cloned())
    }

    async fn list_invoice_events(&self, invoice_id: Uuid) -> Result<Vec<InvoiceEvent>> {
        let tables = self.tables.read().await;
        Ok(tables
            .invoice_events
            .get(&invoice_id)
            .cloned()
            .unwrap_or_default())
    }
}

#[async_trait]
impl OutboxStore for InMemoryStore {
    async fn claim_pending(&self, limit: usize, lease: Duration) -> Result<Vec<OutboxEvent>> {
        let now = Utc::now();
        let lease_until = now
            + chrono::Duration::from_std(lease)
                .map_err(|e| GatewayError::ConfigError(format!("Invalid claim lease: {e}")))?;

        let mut tables = self.tables.write().await;
        let claimed = tables
            .outbox
            .values_mut()
            .filter(|event| event.is_claimable(now))
            .take(limit)
            .map(|event| {
                event.claim(now, lease_until);
                event.clone()
            })
            .collect();
        Ok(claimed)
    }

    async fn mark_sent(&self, id: Uuid) -> Result<()> {
        let mut tables = self.tables.write().await;
        tables.outbox_event(id)?.mark_sent(Utc::now());
        Ok(())
    }

    async fn mark_failed(&self, id: Uuid, next_attempt_at: DateTime<Utc>, error: &str) -> Result<()> {
        let mut tables = self.tables.write().await;
        tables
            .outbox_event(id)?
            .mark_failed(Utc::now(), next_attempt_at, error);
        Ok(())
    }

    async fn mark_exhausted(&self, id: Uuid, error: &str) -> Result<()> {
        let mut tables = self.tables.write().await;
        tables.outbox_event(id)?.mark_exhausted(Utc::now(), error);
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<OutboxEvent>> {
        let tables = self.tables.read().await;
        Ok(tables.outbox.get(&id).cloned())
    }

    async fn list_for_aggregate(&self, aggregate_id: Uuid) -> Result<Vec<OutboxEvent>> {
        let tables = self.tables.read().await;
        Ok(tables
            .outbox
            .values()
            .filter(|event| event.aggregate_id == aggregate_id)
            .cloned()
            .collect())
    }

    async fn status_counts(&self) -> Result<OutboxStatusCounts> {
        let tables = self.tables.read().await;
        let mut counts = OutboxStatusCounts::default();
        for event in tables.outbox.values() {
            counts.record(event.status);
        }
        Ok(counts)
    }
}

#[async_trait]
impl ProcessedEventStore for InMemoryStore {
    async fn exists(&self, event_id: &str) -> Result<bool> {
        let tables = self.tables.read().await;
        Ok(tables.processed_events.contains_key(event_id))
    }

    async fn save(&self, event_id: &str, invoice_id: Uuid) -> Result<()> {
        let mut tables = self.tables.write().await;
        tables
            .processed_events
            .entry(event_id.to_string())
            .or_insert_with(|| ProcessedEvent {
                invoice_id,
                processed_at: Utc::now(),
            });
        Ok(())
    }
}

#[async_trait]
impl IdempotencyStore for InMemoryStore {
    async fn get(&self, key: &str, endpoint: &str) -> Result<Option<IdempotencyRecord>> {
        let tables = self.tables.read().await;
        Ok(tables
            .idempotency_keys
            .get(&(key.to_string(), endpoint.to_string()))
            .cloned())
    }

    async fn create_processing(&self, record: IdempotencyRecord) -> Result<bool> {
        let mut tables = self.tables.write().await;
        let id = (record.key.clone(), record.endpoint.clone());
        if tables.idempotency_keys.contains_key(&id) {
            return Ok(false);
        }
        tables.idempotency_keys.insert(id, record);
        Ok(true)
    }

    async fn complete(&self, key: &str, endpoint: &str, status_code: u16, body: Vec<u8>) -> Result<()> {
        let mut tables = self.tables.write().await;
        let record = tables
            .idempotency_keys
            .get_mut(&(key.to_string(), endpoint.to_string()))
            .ok_or_else(|| GatewayError::not_found("idempotency key", key))?;
        record.complete(status_code, body);
        Ok(())
    }

    async fn delete(&self, key: &str, endpoint: &str) -> Result<()> {
        let mut tables = self.tables.write().await;
        tables
            .idempotency_keys
            .remove(&(key.to_string(), endpoint.to_string()));
        Ok(())
    }

    async fn delete_expired(&self, now: DateTime<Utc>) -> Result<u64> {
        let mut tables = self.tables.write().await;
        let before = tables.idempotency_keys.len();
        tables.idempotency_keys.retain(|_, record| !record.is_expired(now));
        Ok((before - tables.idempotency_keys.len()) as u64)
    }
}

#[async_trait]
impl ReplayAuditStore for InMemoryStore {
    async fn save(&self, audit: DlqReplayAudit) -> Result<()> {
        let mut tables = self.tables.write().await;
        tables.replay_audits.push(audit);
        Ok(())
    }

    async fn list(&self) -> Result<Vec<DlqReplayAudit>> {
        let tables = self.tables.read().await;
        Ok(tables.replay_audits.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::audit::InvoiceEventType;
    use crate::domain::credentials::HashedApiKey;
    use crate::domain::invoice::PaymentType;
    use crate::domain::outbox::OutboxStatus;

    async fn seeded() -> (InMemoryStore, Account) {
        let store = InMemoryStore::new();
        let account = Account::new(
            "Shop",
            "shop@example.com",
            HashedApiKey {
                hash: "h".into(),
                version: "v1".into(),
            },
        );
        store.create_account(account.clone()).await.unwrap();
        (store, account)
    }

    #[tokio::test]
    async fn test_create_with_outbox_stages_event() {
        let (store, account) = seeded().await;
        let invoice = Invoice::new(account.id, 1_500_000, "tv", PaymentType::Boleto, None).unwrap();

        let staged = store
            .create_with_outbox(invoice.clone(), "pending_transaction", b"{}".to_vec(), Some("req-1"))
            .await
            .unwrap();

        assert_eq!(staged.status, OutboxStatus::Pending);
        assert_eq!(staged.attempts, 0);
        assert_eq!(store.list_for_aggregate(invoice.id).await.unwrap().len(), 1);

        let events = store.list_invoice_events(invoice.id).await.unwrap();
        let kinds: Vec<_> = events.iter().map(|e| e.event_type).collect();
        assert_eq!(kinds, vec![InvoiceEventType::Created, InvoiceEventType::PendingPublished]);
    }

    #[tokio::test]
    async fn test_create_with_outbox_for_unknown_account_writes_nothing() {
        let store = InMemoryStore::new();
        let invoice = Invoice::new(Uuid::new_v4(), 1_500_000, "tv", PaymentType::Boleto, None).unwrap();

        let result = store
            .create_with_outbox(invoice.clone(), "pending_transaction", vec![], None)
            .await;

        assert!(matches!(result, Err(GatewayError::NotFoundError { entity: "account", .. })));
        assert!(store.find_invoice(invoice.id).await.unwrap().is_none());
        assert_eq!(store.status_counts().await.unwrap(), OutboxStatusCounts::default());
    }

    #[tokio::test]
    async fn test_claim_respects_lease_and_limit() {
        let (store, account) = seeded().await;
        for _ in 0..3 {
            let invoice = Invoice::new(account.id, 2_000_000, "x", PaymentType::Boleto, None).unwrap();
            store
                .create_with_outbox(invoice, "pending_transaction", vec![], None)
                .await
                .unwrap();
        }

        let first = store.claim_pending(2, Duration::from_secs(30)).await.unwrap();
        assert_eq!(first.len(), 2);
        assert!(first.iter().all(|e| e.status == OutboxStatus::Processing && e.attempts == 1));

        let second = store.claim_pending(10, Duration::from_secs(30)).await.unwrap();
        assert_eq!(second.len(), 1);
        assert!(second.iter().all(|e| first.iter().all(|f| f.id != e.id)));

        assert!(store.claim_pending(10, Duration::from_secs(30)).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_expired_lease_is_reclaimed() {
        let (store, account) = seeded().await;
        let invoice = Invoice::new(account.id, 2_000_000, "x", PaymentType::Boleto, None).unwrap();
        store
            .create_with_outbox(invoice, "pending_transaction", vec![], None)
            .await
            .unwrap();

        let claimed = store.claim_pending(10, Duration::ZERO).await.unwrap();
        let reclaimed = store.claim_pending(10, Duration::from_secs(30)).await.unwrap();
        assert_eq!(reclaimed.len(), 1);
        assert_eq!(reclaimed[0].id, claimed[0].id);
        assert_eq!(reclaimed[0].attempts, 2);
    }

    #[tokio::test]
    async fn test_processed_marker_is_idempotent() {
        let store = InMemoryStore::new();
        let invoice_id = Uuid::new_v4();
        ProcessedEventStore::save(&store, "evt-1", invoice_id).await.unwrap();
        let (_, first_at) = store.processed_at("evt-1").await.unwrap();
        ProcessedEventStore::save(&store, "evt-1", invoice_id).await.unwrap();

        assert!(store.exists("evt-1").await.unwrap());
        assert_eq!(store.processed_at("evt-1").await.unwrap(), (invoice_id, first_at));
        assert!(!store.exists("evt-2").await.unwrap());
    }

    #[tokio::test]
    async fn test_create_processing_has_one_winner() {
        let store = InMemoryStore::new();
        let record = IdempotencyRecord::processing("k", "POST:/invoice", "h", chrono::Duration::hours(1));
        assert!(store.create_processing(record.clone()).await.unwrap());
        assert!(!store.create_processing(record).await.unwrap());
    }
}

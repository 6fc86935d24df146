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
use rocksdb::{
    ColumnFamily, ColumnFamilyDescriptor, Direction, ErrorKind, IteratorMode, Options,
    Transaction, TransactionDB, TransactionDBOptions, TransactionOptions, WriteOptions,
};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument};
use uuid::Uuid;

pub const CF_ACCOUNTS: &str = "accounts";
/// `version:hash` to account id.
pub const CF_ACCOUNT_API_KEYS: &str = "account_api_keys";
pub const CF_INVOICES: &str = "invoices";
/// Keyed by invoice id followed by the v7 event id.
pub const CF_INVOICE_EVENTS: &str = "invoice_events";
pub const CF_OUTBOX: &str = "outbox_events";
pub const CF_PROCESSED_EVENTS: &str = "processed_events";
/// Keyed by `endpoint\0key`.
pub const CF_IDEMPOTENCY_KEYS: &str = "idempotency_keys";
pub const CF_DLQ_REPLAY_AUDITS: &str = "dlq_replay_audits";

const COLUMN_FAMILIES: [&str; 8] = [
    CF_ACCOUNTS,
    CF_ACCOUNT_API_KEYS,
    CF_INVOICES,
    CF_INVOICE_EVENTS,
    CF_OUTBOX,
    CF_PROCESSED_EVENTS,
    CF_IDEMPOTENCY_KEYS,
    CF_DLQ_REPLAY_AUDITS,
];

#[derive(Debug, Serialize, Deserialize)]
struct ProcessedEvent {
    invoice_id: Uuid,
    processed_at: DateTime<Utc>,
}

/// A persistent backend for every store port on a RocksDB `TransactionDB`.
///
/// Multi-row writes run in pessimistic transactions. Settlement takes an
/// exclusive lock on the invoice row with `get_for_update`, so concurrent
/// settlements of one invoice serialize while other invoices proceed. The
/// outbox claim uses a zero lock timeout and skips rows another relay holds.
///
/// `Clone` shares the underlying `Arc<TransactionDB>`.
#[derive(Clone)]
pub struct RocksDBStore {
    db: Arc<TransactionDB>,
}

impl RocksDBStore {
    /// Opens or creates a database at `path` with all column families.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        let descriptors = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Options::default()));
        let db = TransactionDB::open_cf_descriptors(
            &opts,
            &TransactionDBOptions::default(),
            path,
            descriptors,
        )?;

        Ok(Self { db: Arc::new(db) })
    }

    fn cf(&self, name: &str) -> Result<&ColumnFamily> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| GatewayError::StoreError(format!("Column family {name} not found")))
    }

    fn read<T: DeserializeOwned>(&self, cf: &str, key: impl AsRef<[u8]>) -> Result<Option<T>> {
        match self.db.get_cf(self.cf(cf)?, key)? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    fn scan<T: DeserializeOwned>(&self, cf: &str, prefix: &[u8]) -> Result<Vec<T>> {
        let mode = if prefix.is_empty() {
            IteratorMode::Start
        } else {
            IteratorMode::From(prefix, Direction::Forward)
        };
        let mut rows = Vec::new();
        for item in self.db.iterator_cf(self.cf(cf)?, mode) {
            let (key, value) = item?;
            if !key.starts_with(prefix) {
                break;
            }
            rows.push(serde_json::from_slice(&value)?);
        }
        Ok(rows)
    }

    /// A transaction whose row locks fail at once instead of waiting.
    fn skip_locked_transaction(&self) -> Transaction<'_, TransactionDB> {
        let mut txn_opts = TransactionOptions::default();
        txn_opts.set_lock_timeout(0);
        self.db.transaction_opt(&WriteOptions::default(), &txn_opts)
    }

    fn put_events(&self, txn: &Transaction<'_, TransactionDB>, events: &[InvoiceEvent]) -> Result<()> {
        let cf = self.cf(CF_INVOICE_EVENTS)?;
        for event in events {
            txn.put_cf(cf, event_key(event.invoice_id, event.id), serde_json::to_vec(event)?)?;
        }
        Ok(())
    }

    /// Reads the account under an exclusive row lock held until the
    /// transaction ends. Every writer touching an account locks it here, and
    /// only once.
    fn lock_account(&self, txn: &Transaction<'_, TransactionDB>, account_id: Uuid) -> Result<Account> {
        let bytes = txn
            .get_for_update_cf(self.cf(CF_ACCOUNTS)?, account_id.as_bytes(), true)?
            .ok_or_else(|| GatewayError::not_found("account", account_id))?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    fn put_account(&self, txn: &Transaction<'_, TransactionDB>, account: &Account) -> Result<()> {
        txn.put_cf(self.cf(CF_ACCOUNTS)?, account.id.as_bytes(), serde_json::to_vec(account)?)?;
        Ok(())
    }

    /// Writes a new invoice. The caller holds the owning account's lock.
    fn insert_invoice(&self, txn: &Transaction<'_, TransactionDB>, invoice: &Invoice) -> Result<()> {
        let invoices = self.cf(CF_INVOICES)?;
        if txn
            .get_for_update_cf(invoices, invoice.id.as_bytes(), true)?
            .is_some()
        {
            return Err(GatewayError::StoreError(format!(
                "Invoice {} already exists",
                invoice.id
            )));
        }
        txn.put_cf(invoices, invoice.id.as_bytes(), serde_json::to_vec(invoice)?)?;
        Ok(())
    }

    fn update_outbox(&self, id: Uuid, apply: impl FnOnce(&mut OutboxEvent)) -> Result<()> {
        let cf = self.cf(CF_OUTBOX)?;
        let txn = self.db.transaction();
        let bytes = txn
            .get_for_update_cf(cf, id.as_bytes(), true)?
            .ok_or_else(|| GatewayError::not_found("outbox event", id))?;
        let mut event: OutboxEvent = serde_json::from_slice(&bytes)?;
        apply(&mut event);
        txn.put_cf(cf, id.as_bytes(), serde_json::to_vec(&event)?)?;
        txn.commit()?;
        Ok(())
    }
}

fn event_key(invoice_id: Uuid, event_id: Uuid) -> Vec<u8> {
    let mut key = Vec::with_capacity(32);
    key.extend_from_slice(invoice_id.as_bytes());
    key.extend_from_slice(event_id.as_bytes());
    key
}

fn api_key_index(hash: &str, version: &str) -> Vec<u8> {
    format!("{version}:{hash}").into_bytes()
}

fn idempotency_key(key: &str, endpoint: &str) -> Vec<u8> {
    let mut id = Vec::with_capacity(endpoint.len() + key.len() + 1);
    id.extend_from_slice(endpoint.as_bytes());
    id.push(0);
    id.extend_from_slice(key.as_bytes());
    id
}

fn is_lock_conflict(e: &rocksdb::Error) -> bool {
    matches!(e.kind(), ErrorKind::Busy | ErrorKind::TimedOut)
}

#[async_trait]
impl LedgerStore for RocksDBStore {
    async fn create_account(&self, account: Account) -> Result<()> {
        let index = self.cf(CF_ACCOUNT_API_KEYS)?;
        let index_key = api_key_index(&account.api_key_hash, &account.api_key_version);
        let txn = self.db.transaction();
        if txn.get_for_update_cf(index, &index_key, true)?.is_some() {
            return Err(GatewayError::StoreError("API key hash already in use".to_string()));
        }
        txn.put_cf(index, &index_key, account.id.as_bytes())?;
        txn.put_cf(self.cf(CF_ACCOUNTS)?, account.id.as_bytes(), serde_json::to_vec(&account)?)?;
        txn.commit()?;
        Ok(())
    }

    async fn find_account(&self, id: Uuid) -> Result<Option<Account>> {
        self.read(CF_ACCOUNTS, id.as_bytes())
    }

    async fn find_account_by_api_key(&self, hash: &str, version: &str) -> Result<Option<Account>> {
        let Some(id) = self
            .db
            .get_cf(self.cf(CF_ACCOUNT_API_KEYS)?, api_key_index(hash, version))?
        else {
            return Ok(None);
        };
        self.read(CF_ACCOUNTS, id)
    }

    async fn add_balance(&self, account_id: Uuid, amount_cents: i64) -> Result<Account> {
        let txn = self.db.transaction();
        let mut account = self.lock_account(&txn, account_id)?;
        account.credit(amount_cents)?;
        self.put_account(&txn, &account)?;
        txn.commit()?;
        Ok(account)
    }

    async fn create(&self, invoice: Invoice, correlation_id: Option<&str>) -> Result<()> {
        let txn = self.db.transaction();
        let mut account = self.lock_account(&txn, invoice.account_id)?;
        self.insert_invoice(&txn, &invoice)?;
        if invoice.status == InvoiceStatus::Approved {
            account.credit(invoice.amount_cents)?;
            self.put_account(&txn, &account)?;
        }
        self.put_events(&txn, &InvoiceEvent::creation_trail(&invoice, correlation_id))?;
        txn.commit()?;
        Ok(())
    }

    async fn create_with_outbox(
        &self,
        invoice: Invoice,
        event_type: &str,
        payload: Vec<u8>,
        correlation_id: Option<&str>,
    ) -> Result<OutboxEvent> {
        let event = OutboxEvent::new(invoice.id, event_type, payload, correlation_id);
        let txn = self.db.transaction();
        self.lock_account(&txn, invoice.account_id)?;
        self.insert_invoice(&txn, &invoice)?;
        txn.put_cf(self.cf(CF_OUTBOX)?, event.id.as_bytes(), serde_json::to_vec(&event)?)?;
        self.put_events(
            &txn,
            &[
                InvoiceEvent::created(&invoice, correlation_id),
                InvoiceEvent::pending_published(&invoice, correlation_id),
            ],
        )?;
        txn.commit()?;
        Ok(event)
    }

    #[instrument(skip(self), fields(backend = "rocksdb"))]
    async fn apply_result(
        &self,
        invoice_id: Uuid,
        verdict: Verdict,
        correlation_id: Option<&str>,
    ) -> Result<SettlementOutcome> {
        let target = InvoiceStatus::from(verdict);
        let invoices = self.cf(CF_INVOICES)?;
        // Dropping the transaction without commit rolls it back.
        let txn = self.db.transaction();

        let bytes = txn
            .get_for_update_cf(invoices, invoice_id.as_bytes(), true)?
            .ok_or_else(|| GatewayError::not_found("invoice", invoice_id))?;
        let mut invoice: Invoice = serde_json::from_slice(&bytes)?;

        if invoice.status.is_terminal() {
            if invoice.status == target {
                txn.commit()?;
                return Ok(SettlementOutcome::AlreadyApplied(target));
            }
            return Err(GatewayError::InvalidStateTransition {
                from: invoice.status,
                to: target,
            });
        }

        let from = invoice.status;
        let trail = InvoiceEvent::settlement_trail(&invoice, target, correlation_id);
        let balance_applied = if target == InvoiceStatus::Approved {
            let mut account = self.lock_account(&txn, invoice.account_id)?;
            account.credit(invoice.amount_cents)?;
            self.put_account(&txn, &account)?;
            Some(invoice.amount_cents)
        } else {
            None
        };

        invoice.status = target;
        invoice.updated_at = Utc::now();
        txn.put_cf(invoices, invoice_id.as_bytes(), serde_json::to_vec(&invoice)?)?;
        self.put_events(&txn, &trail)?;
        txn.commit()?;

        Ok(SettlementOutcome::Applied {
            from,
            to: target,
            balance_applied,
        })
    }

    async fn find_invoice(&self, id: Uuid) -> Result<Option<Invoice>> {
        self.read(CF_INVOICES, id.as_bytes())
    }

    async fn list_invoice_events(&self, invoice_id: Uuid) -> Result<Vec<InvoiceEvent>> {
        self.scan(CF_INVOICE_EVENTS, invoice_id.as_bytes())
    }
}

#[async_trait]
impl OutboxStore for RocksDBStore {
    async fn claim_pending(&self, limit: usize, lease: Duration) -> Result<Vec<OutboxEvent>> {
        let now = Utc::now();
        let lease_until = now
            + chrono::Duration::from_std(lease)
                .map_err(|e| GatewayError::ConfigError(format!("Invalid claim lease: {e}")))?;
        let cf = self.cf(CF_OUTBOX)?;

        let txn = self.skip_locked_transaction();

        let mut claimed = Vec::new();
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            if claimed.len() >= limit {
                break;
            }
            let (key, value) = item?;
            let candidate: OutboxEvent = serde_json::from_slice(&value)?;
            if !candidate.is_claimable(now) {
                continue;
            }

            let current = match txn.get_for_update_cf(cf, &key, true) {
                Ok(Some(bytes)) => bytes,
                Ok(None) => continue,
                Err(e) if is_lock_conflict(&e) => {
                    debug!(outbox_id = %candidate.id, "outbox row locked elsewhere, skipped");
                    continue;
                }
                Err(e) => return Err(e.into()),
            };
            let mut event: OutboxEvent = serde_json::from_slice(&current)?;
            if !event.is_claimable(now) {
                continue;
            }
            event.claim(now, lease_until);
            txn.put_cf(cf, &key, serde_json::to_vec(&event)?)?;
            claimed.push(event);
        }

        txn.commit()?;
        Ok(claimed)
    }

    async fn mark_sent(&self, id: Uuid) -> Result<()> {
        self.update_outbox(id, |event| event.mark_sent(Utc::now()))
    }

    async fn mark_failed(&self, id: Uuid, next_attempt_at: DateTime<Utc>, error: &str) -> Result<()> {
        self.update_outbox(id, |event| event.mark_failed(Utc::now(), next_attempt_at, error))
    }

    async fn mark_exhausted(&self, id: Uuid, error: &str) -> Result<()> {
        self.update_outbox(id, |event| event.mark_exhausted(Utc::now(), error))
    }

    async fn get(&self, id: Uuid) -> Result<Option<OutboxEvent>> {
        self.read(CF_OUTBOX, id.as_bytes())
    }

    async fn list_for_aggregate(&self, aggregate_id: Uuid) -> Result<Vec<OutboxEvent>> {
        let events: Vec<OutboxEvent> = self.scan(CF_OUTBOX, &[])?;
        Ok(events
            .into_iter()
            .filter(|event| event.aggregate_id == aggregate_id)
            .collect())
    }

    async fn status_counts(&self) -> Result<OutboxStatusCounts> {
        let events: Vec<OutboxEvent> = self.scan(CF_OUTBOX, &[])?;
        let mut counts = OutboxStatusCounts::default();
        for event in events {
            counts.record(event.status);
        }
        Ok(counts)
    }
}

#[async_trait]
impl ProcessedEventStore for RocksDBStore {
    async fn exists(&self, event_id: &str) -> Result<bool> {
        Ok(self
            .db
            .get_cf(self.cf(CF_PROCESSED_EVENTS)?, event_id.as_bytes())?
            .is_some())
    }

    async fn save(&self, event_id: &str, invoice_id: Uuid) -> Result<()> {
        let cf = self.cf(CF_PROCESSED_EVENTS)?;
        let txn = self.db.transaction();
        if txn.get_for_update_cf(cf, event_id.as_bytes(), true)?.is_none() {
            let marker = ProcessedEvent {
                invoice_id,
                processed_at: Utc::now(),
            };
            txn.put_cf(cf, event_id.as_bytes(), serde_json::to_vec(&marker)?)?;
        }
        txn.commit()?;
        Ok(())
    }
}

#[async_trait]
impl IdempotencyStore for RocksDBStore {
    async fn get(&self, key: &str, endpoint: &str) -> Result<Option<IdempotencyRecord>> {
        self.read(CF_IDEMPOTENCY_KEYS, idempotency_key(key, endpoint))
    }

    async fn create_processing(&self, record: IdempotencyRecord) -> Result<bool> {
        let cf = self.cf(CF_IDEMPOTENCY_KEYS)?;
        let id = idempotency_key(&record.key, &record.endpoint);
        let txn = self.db.transaction();
        if txn.get_for_update_cf(cf, &id, true)?.is_some() {
            return Ok(false);
        }
        txn.put_cf(cf, &id, serde_json::to_vec(&record)?)?;
        txn.commit()?;
        Ok(true)
    }

    async fn complete(&self, key: &str, endpoint: &str, status_code: u16, body: Vec<u8>) -> Result<()> {
        let cf = self.cf(CF_IDEMPOTENCY_KEYS)?;
        let id = idempotency_key(key, endpoint);
        let txn = self.db.transaction();
        let bytes = txn
            .get_for_update_cf(cf, &id, true)?
            .ok_or_else(|| GatewayError::not_found("idempotency key", key))?;
        let mut record: IdempotencyRecord = serde_json::from_slice(&bytes)?;
        record.complete(status_code, body);
        txn.put_cf(cf, &id, serde_json::to_vec(&record)?)?;
        txn.commit()?;
        Ok(())
    }

    async fn delete(&self, key: &str, endpoint: &str) -> Result<()> {
        self.db
            .delete_cf(self.cf(CF_IDEMPOTENCY_KEYS)?, idempotency_key(key, endpoint))?;
        Ok(())
    }

    async fn delete_expired(&self, now: DateTime<Utc>) -> Result<u64> {
        let cf = self.cf(CF_IDEMPOTENCY_KEYS)?;
        let txn = self.skip_locked_transaction();
        let mut purged = 0;
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (key, value) = item?;
            let candidate: IdempotencyRecord = serde_json::from_slice(&value)?;
            if !candidate.is_expired(now) {
                continue;
            }

            // Re-read under the lock: the key may have been reclaimed since the scan.
            let current = match txn.get_for_update_cf(cf, &key, true) {
                Ok(Some(bytes)) => bytes,
                Ok(None) => continue,
                Err(e) if is_lock_conflict(&e) => continue,
                Err(e) => return Err(e.into()),
            };
            let record: IdempotencyRecord = serde_json::from_slice(&current)?;
            if record.is_expired(now) {
                txn.delete_cf(cf, &key)?;
                purged += 1;
            }
        }
        txn.commit()?;
        Ok(purged)
    }
}

#[async_trait]
impl ReplayAuditStore for RocksDBStore {
    async fn save(&self, audit: DlqReplayAudit) -> Result<()> {
        self.db.put_cf(
            self.cf(CF_DLQ_REPLAY_AUDITS)?,
            audit.id.as_bytes(),
            serde_json::to_vec(&audit)?,
        )?;
        Ok(())
    }

    async fn list(&self) -> Result<Vec<DlqReplayAudit>> {
        self.scan(CF_DLQ_REPLAY_AUDITS, &[])
    }
}

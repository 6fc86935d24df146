#![allow(dead_code)]

use paygate::application::accounts::AccountService;
use paygate::application::consumer::{ConsumerConfig, VerdictConsumer};
use paygate::application::invoices::{CreateInvoiceInput, InvoiceService};
use paygate::application::retry::{Backoff, RetryPolicy};
use paygate::domain::account::Account;
use paygate::domain::credentials::ApiKeyHasher;
use paygate::domain::events::{PENDING_TRANSACTION_EVENT, PendingTransaction, TransactionResult};
use paygate::domain::invoice::{Invoice, PaymentType, Verdict};
use paygate::domain::message::{BusMessage, Delivery};
use paygate::infrastructure::Stores;
use paygate::infrastructure::bus::InMemoryBroker;
use paygate::infrastructure::in_memory::InMemoryStore;
use rust_decimal::Decimal;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

pub const VERDICT_TOPIC: &str = "transactions_result";
pub const DLQ_TOPIC: &str = "transactions_result_dlq";

pub fn hasher() -> Arc<ApiKeyHasher> {
    let secrets = BTreeMap::from([("v1".to_string(), "test-secret".to_string())]);
    Arc::new(ApiKeyHasher::new("v1", secrets).unwrap())
}

/// Retries quickly so failure paths do not slow the suite down.
pub fn fast_retry() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 3,
        backoff: Backoff::new(Duration::from_millis(1), 2, Duration::from_millis(5)),
    }
}

pub fn consumer_config() -> ConsumerConfig {
    ConsumerConfig {
        retry: fast_retry(),
        redeliver_delay: Duration::from_millis(10),
        ..ConsumerConfig::default()
    }
}

/// One in-memory backend with the services wired over it.
pub struct Harness {
    pub store: Arc<InMemoryStore>,
    pub stores: Stores,
    pub broker: InMemoryBroker,
    pub accounts: AccountService,
    pub invoices: InvoiceService,
}

impl Harness {
    pub fn new() -> Self {
        let store = Arc::new(InMemoryStore::new());
        let stores = Stores::from_backend(store.clone());
        let accounts = AccountService::new(stores.ledger.clone(), hasher());
        let invoices = InvoiceService::new(stores.ledger.clone(), accounts.clone());
        Self {
            store,
            stores,
            broker: InMemoryBroker::with_poll_timeout(Duration::from_millis(20)),
            accounts,
            invoices,
        }
    }

    pub async fn account(&self) -> (Account, String) {
        self.accounts.register("Acme Store", "billing@acme.test").await.unwrap()
    }

    /// Stores a pending invoice with its review request staged in the outbox.
    pub async fn pending_invoice(&self, account: &Account, amount_cents: i64) -> Invoice {
        let invoice = Invoice::new(account.id, amount_cents, "big order", PaymentType::Boleto, None).unwrap();
        let payload = PendingTransaction::for_invoice(&invoice).encode().unwrap();
        self.stores
            .ledger
            .create_with_outbox(invoice.clone(), PENDING_TRANSACTION_EVENT, payload, Some("req-1"))
            .await
            .unwrap();
        invoice
    }

    pub fn consumer(&self, config: ConsumerConfig) -> VerdictConsumer {
        VerdictConsumer::new(
            self.stores.ledger.clone(),
            self.stores.processed.clone(),
            Arc::new(self.broker.clone()),
            config,
        )
    }

    pub async fn balance(&self, account_id: Uuid) -> i64 {
        self.stores
            .ledger
            .find_account(account_id)
            .await
            .unwrap()
            .unwrap()
            .balance_cents
    }
}

pub fn verdict(invoice_id: Uuid, status: Verdict, event_id: &str) -> BusMessage {
    let mut result = TransactionResult::new(invoice_id, status);
    result.event_id = event_id.to_string();
    BusMessage::new(result.encode().unwrap()).with_key(invoice_id.to_string())
}

pub fn delivery(message: BusMessage, offset: i64) -> Delivery {
    Delivery {
        topic: VERDICT_TOPIC.to_string(),
        partition: 0,
        offset,
        message,
    }
}

pub fn boleto_input(amount: Decimal) -> CreateInvoiceInput {
    CreateInvoiceInput {
        amount,
        description: "order #42".into(),
        payment_type: "boleto".into(),
        ..CreateInvoiceInput::default()
    }
}

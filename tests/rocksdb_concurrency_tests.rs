#![cfg(feature = "storage-rocksdb")]

mod common;

use common::hasher;
use paygate::application::accounts::AccountService;
use paygate::application::relay::{OutboxRelay, RelayConfig};
use paygate::domain::account::Account;
use paygate::domain::events::{PENDING_TRANSACTION_EVENT, PendingTransaction};
use paygate::domain::invoice::{Invoice, PaymentType, REVIEW_THRESHOLD_CENTS, SettlementOutcome, Verdict};
use paygate::infrastructure::Stores;
use paygate::infrastructure::bus::InMemoryBroker;
use std::sync::Arc;
use tempfile::{TempDir, tempdir};

const TOPIC: &str = "pending_transactions";

async fn open() -> (TempDir, Stores, Account) {
    let dir = tempdir().unwrap();
    let stores = Stores::open(Some(dir.path())).unwrap();
    let accounts = AccountService::new(stores.ledger.clone(), hasher());
    let (account, _) = accounts.register("Acme Store", "billing@acme.test").await.unwrap();
    (dir, stores, account)
}

async fn pending_invoice(stores: &Stores, account: &Account) -> Invoice {
    let invoice = Invoice::new(account.id, 1_500_000, "big order", PaymentType::Boleto, None).unwrap();
    let payload = PendingTransaction::for_invoice(&invoice).encode().unwrap();
    stores
        .ledger
        .create_with_outbox(invoice.clone(), PENDING_TRANSACTION_EVENT, payload, None)
        .await
        .unwrap();
    invoice
}

async fn balance(stores: &Stores, account: &Account) -> i64 {
    stores
        .ledger
        .find_account(account.id)
        .await
        .unwrap()
        .unwrap()
        .balance_cents
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_approved_creates_on_one_account() {
    let (_dir, stores, account) = open().await;

    let mut handles = Vec::new();
    for _ in 0..16 {
        let ledger = stores.ledger.clone();
        let account_id = account.id;
        handles.push(tokio::spawn(async move {
            let mut invoice = Invoice::new(account_id, 2_500, "coffee", PaymentType::Boleto, None).unwrap();
            invoice.triage(REVIEW_THRESHOLD_CENTS);
            ledger.create(invoice, None).await
        }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    assert_eq!(balance(&stores, &account).await, 16 * 2_500);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_settlements_apply_once() {
    let (_dir, stores, account) = open().await;
    let invoice_id = pending_invoice(&stores, &account).await.id;

    let mut handles = Vec::new();
    for _ in 0..16 {
        let ledger = stores.ledger.clone();
        handles.push(tokio::spawn(async move {
            ledger.apply_result(invoice_id, Verdict::Approved, None).await
        }));
    }

    let mut applied = 0;
    for handle in handles {
        match handle.await.unwrap().unwrap() {
            SettlementOutcome::Applied { .. } => applied += 1,
            SettlementOutcome::AlreadyApplied(_) => {}
        }
    }

    assert_eq!(applied, 1);
    assert_eq!(balance(&stores, &account).await, 1_500_000);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_settlements_and_creates_share_an_account() {
    let (_dir, stores, account) = open().await;
    let mut pending = Vec::new();
    for _ in 0..6 {
        pending.push(pending_invoice(&stores, &account).await.id);
    }

    let mut handles = Vec::new();
    for invoice_id in pending {
        let ledger = stores.ledger.clone();
        handles.push(tokio::spawn(async move {
            ledger.apply_result(invoice_id, Verdict::Approved, None).await.map(|_| ())
        }));
    }
    for _ in 0..6 {
        let ledger = stores.ledger.clone();
        let account_id = account.id;
        handles.push(tokio::spawn(async move {
            let mut invoice = Invoice::new(account_id, 1_000, "tea", PaymentType::Boleto, None).unwrap();
            invoice.triage(REVIEW_THRESHOLD_CENTS);
            ledger.create(invoice, None).await
        }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    assert_eq!(balance(&stores, &account).await, 6 * 1_500_000 + 6 * 1_000);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_competing_relays_never_double_publish() {
    let (_dir, stores, account) = open().await;
    for _ in 0..20 {
        pending_invoice(&stores, &account).await;
    }
    let broker = InMemoryBroker::new();

    let mut handles = Vec::new();
    for _ in 0..4 {
        let relay = OutboxRelay::new(
            stores.outbox.clone(),
            Arc::new(broker.clone()),
            RelayConfig {
                batch_size: 3,
                ..RelayConfig::default()
            },
        );
        handles.push(tokio::spawn(async move {
            let mut sent = 0;
            for _ in 0..10 {
                sent += relay.run_once().await.unwrap().sent;
            }
            sent
        }));
    }

    let mut total = 0;
    for handle in handles {
        total += handle.await.unwrap();
    }
    // A relay that skipped every locked row may leave some for a later cycle.
    let sweeper = OutboxRelay::new(stores.outbox.clone(), Arc::new(broker.clone()), RelayConfig::default());
    for _ in 0..5 {
        total += sweeper.run_once().await.unwrap().sent;
    }

    assert_eq!(total, 20);
    assert_eq!(broker.messages(TOPIC).len(), 20);
}

mod common;

use common::{DLQ_TOPIC, Harness, VERDICT_TOPIC, consumer_config, delivery, verdict};
use paygate::application::consumer::ConsumeOutcome;
use paygate::application::replay::{DlqReplayer, ReplayConfig};
use paygate::domain::audit::ReplayMode;
use paygate::domain::events::{DeadLetter, REASON_INVALID_PAYLOAD, TransactionResult};
use paygate::domain::invoice::{InvoiceStatus, Verdict};
use paygate::domain::message::{BusMessage, HEADER_REPLAYED};
use paygate::domain::ports::Publisher;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use uuid::Uuid;

fn replay_config(mode: ReplayMode) -> ReplayConfig {
    ReplayConfig {
        mode,
        operator: "alice".into(),
        idle_timeout: Some(Duration::from_millis(50)),
        ..ReplayConfig::default()
    }
}

fn replayer(h: &Harness, config: ReplayConfig) -> DlqReplayer {
    DlqReplayer::new(Arc::new(h.broker.clone()), h.stores.audits.clone(), config)
}

fn running() -> (watch::Sender<bool>, watch::Receiver<bool>) {
    watch::channel(false)
}

async fn dead_letter_for(h: &Harness, invoice_id: Uuid, event_id: &str) -> Vec<u8> {
    let original = verdict(invoice_id, Verdict::Approved, event_id);
    let result = TransactionResult::decode(&original.payload).unwrap();
    let letter = DeadLetter::for_result(&original.payload, &result, "invoice not found");
    let bytes = letter.encode().unwrap();
    h.broker
        .publish(DLQ_TOPIC, BusMessage::new(bytes).with_key(invoice_id.to_string()))
        .await
        .unwrap();
    original.payload
}

#[tokio::test]
async fn test_replay_republishes_original_bytes() {
    let h = Harness::new();
    let (_shutdown, rx) = running();
    let invoice_id = Uuid::new_v4();
    let original = dead_letter_for(&h, invoice_id, "evt-1").await;

    let summary = replayer(&h, replay_config(ReplayMode::Execute))
        .run(rx.clone())
        .await
        .unwrap();

    assert_eq!(summary.processed, 1);
    assert_eq!(summary.failed, 0);
    assert!(!summary.dry_run);

    let replayed = h.broker.messages(VERDICT_TOPIC);
    assert_eq!(replayed.len(), 1);
    assert_eq!(replayed[0].payload, original);
    assert_eq!(replayed[0].headers.get_str(HEADER_REPLAYED), Some("true"));
    assert_eq!(replayed[0].key.as_deref(), Some(invoice_id.to_string().as_bytes()));

    let audits = h.stores.audits.list().await.unwrap();
    assert_eq!(audits.len(), 1);
    assert_eq!(audits[0].operator, "alice");
    assert_eq!(audits[0].event_id, "evt-1");
    assert_eq!(audits[0].invoice_id, Some(invoice_id));
    assert_eq!(audits[0].reason, "invoice not found");
    assert!(audits[0].success);
    assert_eq!(h.broker.committed_offset("dlq-replay", DLQ_TOPIC), 1);
}

#[tokio::test]
async fn test_dry_run_audits_without_publishing() {
    let h = Harness::new();
    let (_shutdown, rx) = running();
    dead_letter_for(&h, Uuid::new_v4(), "evt-1").await;
    dead_letter_for(&h, Uuid::new_v4(), "evt-2").await;

    let summary = replayer(&h, replay_config(ReplayMode::DryRun))
        .run(rx.clone())
        .await
        .unwrap();

    assert_eq!(summary.processed, 2);
    assert!(summary.dry_run);
    assert!(h.broker.messages(VERDICT_TOPIC).is_empty());
    let audits = h.stores.audits.list().await.unwrap();
    assert!(audits.iter().all(|a| a.mode == ReplayMode::DryRun));
}

#[tokio::test]
async fn test_malformed_dlq_message_is_audited_and_committed() {
    let h = Harness::new();
    let (_shutdown, rx) = running();
    h.broker.publish(DLQ_TOPIC, BusMessage::new("%%%")).await.unwrap();

    let summary = replayer(&h, replay_config(ReplayMode::Execute))
        .run(rx.clone())
        .await
        .unwrap();

    assert_eq!(summary.processed, 0);
    assert_eq!(summary.failed, 1);
    let audits = h.stores.audits.list().await.unwrap();
    assert_eq!(audits[0].reason, REASON_INVALID_PAYLOAD);
    assert!(!audits[0].success);
    assert_eq!(h.broker.committed_offset("dlq-replay", DLQ_TOPIC), 1);
}

#[tokio::test]
async fn test_publish_failure_is_retried_next_run() {
    let h = Harness::new();
    let (_shutdown, rx) = running();
    dead_letter_for(&h, Uuid::new_v4(), "evt-1").await;
    h.broker.fail_publishes(VERDICT_TOPIC, 1);

    let first = replayer(&h, replay_config(ReplayMode::Execute))
        .run(rx.clone())
        .await
        .unwrap();
    assert_eq!(first.failed, 1);
    assert!(!first.audits[0].success);
    assert_eq!(h.broker.committed_offset("dlq-replay", DLQ_TOPIC), 0);

    let second = replayer(&h, replay_config(ReplayMode::Execute))
        .run(rx.clone())
        .await
        .unwrap();
    assert_eq!(second.processed, 1);
    assert_eq!(h.broker.messages(VERDICT_TOPIC).len(), 1);
    assert_eq!(h.stores.audits.list().await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_max_stops_early() {
    let h = Harness::new();
    let (_shutdown, rx) = running();
    for i in 0..3 {
        dead_letter_for(&h, Uuid::new_v4(), &format!("evt-{i}")).await;
    }

    let summary = replayer(
        &h,
        ReplayConfig {
            max: 2,
            ..replay_config(ReplayMode::Execute)
        },
    )
    .run(rx.clone())
    .await
    .unwrap();

    assert_eq!(summary.processed, 2);
    assert_eq!(h.broker.committed_offset("dlq-replay", DLQ_TOPIC), 2);
}

#[tokio::test]
async fn test_shutdown_ends_run() {
    let h = Harness::new();
    let replayer = replayer(
        &h,
        ReplayConfig {
            idle_timeout: None,
            ..replay_config(ReplayMode::Execute)
        },
    );
    let (tx, rx) = watch::channel(false);
    let task = tokio::spawn(async move { replayer.run(rx).await });

    tokio::time::sleep(Duration::from_millis(30)).await;
    tx.send(true).unwrap();
    let summary = tokio::time::timeout(Duration::from_secs(1), task)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(summary.processed, 0);
}

#[tokio::test]
async fn test_replayed_verdict_settles_after_fix() {
    let h = Harness::new();
    let (_shutdown, rx) = running();
    let (account, _) = h.account().await;
    let invoice = h.pending_invoice(&account, 1_500_000).await;
    dead_letter_for(&h, invoice.id, "evt-7").await;

    replayer(&h, replay_config(ReplayMode::Execute))
        .run(rx.clone())
        .await
        .unwrap();

    let replayed = h.broker.messages(VERDICT_TOPIC).remove(0);
    let outcome = h.consumer(consumer_config()).handle(&delivery(replayed, 0)).await;

    assert!(matches!(outcome, ConsumeOutcome::Applied(_)));
    let stored = h.stores.ledger.find_invoice(invoice.id).await.unwrap().unwrap();
    assert_eq!(stored.status, InvoiceStatus::Approved);
    assert_eq!(h.balance(account.id).await, 1_500_000);
}

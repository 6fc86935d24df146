use crate::domain::audit::{DlqReplayAudit, ReplayMode};
use crate::domain::events::{DeadLetter, REASON_INVALID_PAYLOAD};
use crate::domain::message::{BusMessage, Delivery, HEADER_REPLAYED};
use crate::domain::ports::{BrokerRef, ReplayAuditStoreRef, Subscription};
use crate::error::Result;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{error, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq)]
pub struct ReplayConfig {
    pub dlq_topic: String,
    pub target_topic: String,
    pub group_id: String,
    pub operator: String,
    pub mode: ReplayMode,
    /// Stop after this many replayed messages; 0 means no limit.
    pub max: usize,
    /// Stop once the DLQ has been empty this long; `None` waits for shutdown.
    pub idle_timeout: Option<Duration>,
}

impl Default for ReplayConfig {
    fn default() -> Self {
        Self {
            dlq_topic: "transactions_result_dlq".to_string(),
            target_topic: "transactions_result".to_string(),
            group_id: "dlq-replay".to_string(),
            operator: "local".to_string(),
            mode: ReplayMode::Execute,
            max: 0,
            idle_timeout: None,
        }
    }
}

#[derive(Debug, Default, Clone, PartialEq)]
pub struct ReplaySummary {
    pub processed: usize,
    pub failed: usize,
    pub dry_run: bool,
    /// Audit rows written during this run, in order.
    pub audits: Vec<DlqReplayAudit>,
}

/// Re-drives dead-lettered verdicts onto the verdict topic.
pub struct DlqReplayer {
    broker: BrokerRef,
    audits: ReplayAuditStoreRef,
    config: ReplayConfig,
}

enum Step {
    Replayed,
    Rejected,
    /// Publish failed; the delivery stays uncommitted and the run ends.
    Halted,
}

impl DlqReplayer {
    pub fn new(broker: BrokerRef, audits: ReplayAuditStoreRef, config: ReplayConfig) -> Self {
        Self {
            broker,
            audits,
            config,
        }
    }

    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<ReplaySummary> {
        let mut subscription = self
            .broker
            .subscribe(&self.config.dlq_topic, &self.config.group_id)
            .await?;
        let mut summary = ReplaySummary {
            dry_run: self.config.mode == ReplayMode::DryRun,
            ..ReplaySummary::default()
        };
        let mut idle_since = Instant::now();
        info!(
            dlq_topic = %self.config.dlq_topic,
            group_id = %self.config.group_id,
            operator = %self.config.operator,
            mode = %self.config.mode,
            "dlq replay started"
        );

        while !*shutdown.borrow() {
            if self.config.max > 0 && summary.processed >= self.config.max {
                break;
            }

            let fetched = tokio::select! {
                fetched = subscription.fetch() => fetched,
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    continue;
                }
            };

            let delivery = match fetched {
                Ok(Some(delivery)) => delivery,
                Ok(None) => {
                    if self.config.idle_timeout.is_some_and(|idle| idle_since.elapsed() >= idle) {
                        info!("dlq drained");
                        break;
                    }
                    continue;
                }
                Err(e) => {
                    error!(error = %e, "dlq replay: fetch message failed");
                    tokio::time::sleep(Duration::from_millis(500)).await;
                    continue;
                }
            };
            idle_since = Instant::now();

            match self.replay_one(subscription.as_mut(), &delivery, &mut summary).await {
                Step::Replayed => summary.processed += 1,
                Step::Rejected => summary.failed += 1,
                Step::Halted => {
                    summary.failed += 1;
                    warn!(offset = delivery.offset, "stopping replay; message left for the next run");
                    break;
                }
            }
        }

        info!(
            processed = summary.processed,
            failed = summary.failed,
            dry_run = summary.dry_run,
            "dlq replay finished"
        );
        Ok(summary)
    }

    async fn replay_one(
        &self,
        subscription: &mut dyn Subscription,
        delivery: &Delivery,
        summary: &mut ReplaySummary,
    ) -> Step {
        let letter = match DeadLetter::decode(&delivery.message.payload) {
            Ok(letter) => letter,
            Err(e) => {
                error!(error = %e, "dlq replay: invalid payload");
                let audit = self.audit("", None, "", REASON_INVALID_PAYLOAD).failed(e.to_string());
                self.record(audit, summary).await;
                self.commit(subscription, delivery).await;
                return Step::Rejected;
            }
        };

        let invoice_id = Uuid::parse_str(&letter.invoice_id).ok();
        let audit = self.audit(&letter.event_id, invoice_id, &letter.status, &letter.error);

        if self.config.mode == ReplayMode::DryRun {
            info!(event_id = %letter.event_id, invoice_id = %letter.invoice_id, reason = %letter.error, "dlq replay dry-run");
            self.record(audit, summary).await;
            self.commit(subscription, delivery).await;
            return Step::Replayed;
        }

        let mut message = BusMessage::new(letter.payload.into_bytes()).with_header(HEADER_REPLAYED, "true");
        if let Some(invoice_id) = invoice_id {
            message = message.with_key(invoice_id.to_string());
        }

        match self.broker.publish(&self.config.target_topic, message).await {
            Ok(()) => {
                info!(event_id = %letter.event_id, invoice_id = %letter.invoice_id, "dlq message replayed");
                self.record(audit, summary).await;
                self.commit(subscription, delivery).await;
                Step::Replayed
            }
            Err(e) => {
                error!(error = %e, event_id = %letter.event_id, "dlq replay: publish failed");
                self.record(audit.failed(e.to_string()), summary).await;
                Step::Halted
            }
        }
    }

    fn audit(&self, event_id: &str, invoice_id: Option<Uuid>, status: &str, reason: &str) -> DlqReplayAudit {
        DlqReplayAudit::new(
            event_id,
            invoice_id,
            status,
            reason,
            self.config.mode,
            self.config.operator.as_str(),
        )
    }

    async fn record(&self, audit: DlqReplayAudit, summary: &mut ReplaySummary) {
        if let Err(e) = self.audits.save(audit.clone()).await {
            error!(error = %e, event_id = %audit.event_id, "dlq replay: audit not saved");
        }
        summary.audits.push(audit);
    }

    async fn commit(&self, subscription: &mut dyn Subscription, delivery: &Delivery) {
        if let Err(e) = subscription.commit(delivery).await {
            error!(error = %e, offset = delivery.offset, "dlq replay: commit failed");
        }
    }
}

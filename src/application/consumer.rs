use crate::application::retry::{RetryPolicy, retry};
use crate::domain::events::{
    DeadLetter, REASON_DEDUP_CHECK_FAILED, REASON_INVALID_PAYLOAD, REASON_MISSING_EVENT_ID,
    TransactionResult,
};
use crate::domain::invoice::SettlementOutcome;
use crate::domain::message::{BusMessage, Delivery, HEADER_REQUEST_ID};
use crate::domain::ports::{BrokerRef, LedgerStoreRef, ProcessedEventStoreRef, Subscription};
use crate::error::{GatewayError, Result};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, instrument, warn};

#[derive(Debug, Clone, PartialEq)]
pub struct ConsumerConfig {
    pub topic: String,
    pub group_id: String,
    pub dlq_topic: String,
    pub retry: RetryPolicy,
    /// Pause before re-reading a message that could not be committed.
    pub redeliver_delay: Duration,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            topic: "transactions_result".to_string(),
            group_id: "gateway-group".to_string(),
            dlq_topic: "transactions_result_dlq".to_string(),
            retry: RetryPolicy::default(),
            redeliver_delay: Duration::from_millis(500),
        }
    }
}

/// How a delivery was disposed of.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsumeOutcome {
    Applied(SettlementOutcome),
    /// Already settled under this event id.
    Duplicate,
    /// Written to the DLQ with the given reason.
    DeadLettered(String),
    /// Left uncommitted so the bus hands it out again.
    Uncommitted,
}

impl ConsumeOutcome {
    pub fn commits(&self) -> bool {
        !matches!(self, Self::Uncommitted)
    }
}

/// Applies antifraud verdicts from the bus to the ledger, once per event id.
pub struct VerdictConsumer {
    ledger: LedgerStoreRef,
    processed: ProcessedEventStoreRef,
    broker: BrokerRef,
    config: ConsumerConfig,
}

impl VerdictConsumer {
    pub fn new(
        ledger: LedgerStoreRef,
        processed: ProcessedEventStoreRef,
        broker: BrokerRef,
        config: ConsumerConfig,
    ) -> Self {
        Self {
            ledger,
            processed,
            broker,
            config,
        }
    }

    /// Consumes until `shutdown` flips to true. The message being handled
    /// when the signal arrives is finished first.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let mut subscription = self.subscribe().await?;
        info!(topic = %self.config.topic, group_id = %self.config.group_id, "verdict consumer started");

        while !*shutdown.borrow() {
            let fetched = tokio::select! {
                fetched = subscription.fetch() => fetched,
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    continue;
                }
            };

            match fetched {
                Ok(Some(delivery)) => {
                    if self.process(subscription.as_mut(), &delivery).await.commits() {
                        continue;
                    }
                    tokio::time::sleep(self.config.redeliver_delay).await;
                    drop(subscription);
                    subscription = self.subscribe().await?;
                }
                Ok(None) => {}
                Err(e) => {
                    error!(error = %e, topic = %self.config.topic, "fetch failed");
                    tokio::time::sleep(self.config.redeliver_delay).await;
                }
            }
        }

        info!("verdict consumer stopped");
        Ok(())
    }

    async fn subscribe(&self) -> Result<Box<dyn Subscription>> {
        self.broker
            .subscribe(&self.config.topic, &self.config.group_id)
            .await
    }

    /// Handles one delivery and commits it unless it must be redelivered.
    pub async fn process(&self, subscription: &mut dyn Subscription, delivery: &Delivery) -> ConsumeOutcome {
        let outcome = self.handle(delivery).await;
        if outcome.commits()
            && let Err(e) = subscription.commit(delivery).await
        {
            error!(error = %e, offset = delivery.offset, "offset commit failed");
        }
        outcome
    }

    /// Decides what to do with one delivery without committing it.
    #[instrument(skip_all, fields(partition = delivery.partition, offset = delivery.offset))]
    pub async fn handle(&self, delivery: &Delivery) -> ConsumeOutcome {
        let payload = &delivery.message.payload;

        let result = match TransactionResult::decode(payload) {
            Ok(result) => result,
            Err(e) => {
                warn!(error = %e, "undecodable verdict");
                return self
                    .dead_letter(DeadLetter::new(payload, REASON_INVALID_PAYLOAD))
                    .await;
            }
        };

        if result.event_id.trim().is_empty() {
            warn!(invoice_id = %result.invoice_id, "verdict without event id");
            return self
                .dead_letter(DeadLetter::for_result(payload, &result, REASON_MISSING_EVENT_ID))
                .await;
        }

        match self.processed.exists(&result.event_id).await {
            Ok(true) => {
                info!(event_id = %result.event_id, invoice_id = %result.invoice_id, "duplicate verdict skipped");
                return ConsumeOutcome::Duplicate;
            }
            Ok(false) => {}
            Err(e) => {
                error!(error = %e, event_id = %result.event_id, "dedup check failed");
                return self
                    .dead_letter(DeadLetter::for_result(payload, &result, REASON_DEDUP_CHECK_FAILED))
                    .await;
            }
        }

        let request_id = delivery.message.headers.get_str(HEADER_REQUEST_ID);
        info!(
            event_id = %result.event_id,
            invoice_id = %result.invoice_id,
            status = %result.status,
            request_id = request_id.unwrap_or_default(),
            "verdict received"
        );

        let applied = retry(
            &self.config.retry,
            |_| self.ledger.apply_result(result.invoice_id, result.status, request_id),
            GatewayError::is_retryable,
        )
        .await;

        let settlement = match applied {
            Ok(settlement) => settlement,
            Err(failure) => {
                error!(
                    error = %failure.error,
                    attempts = failure.attempts,
                    event_id = %result.event_id,
                    invoice_id = %result.invoice_id,
                    "verdict could not be applied"
                );
                return self
                    .dead_letter(DeadLetter::for_result(payload, &result, failure.error.to_string()))
                    .await;
            }
        };

        if let Err(e) = self.processed.save(&result.event_id, result.invoice_id).await {
            error!(error = %e, event_id = %result.event_id, "processed marker not saved");
            return ConsumeOutcome::Uncommitted;
        }

        info!(
            event_id = %result.event_id,
            invoice_id = %result.invoice_id,
            outcome = ?settlement,
            "verdict applied"
        );
        ConsumeOutcome::Applied(settlement)
    }

    async fn dead_letter(&self, letter: DeadLetter) -> ConsumeOutcome {
        let message = match letter.encode() {
            Ok(bytes) => BusMessage::new(bytes),
            Err(e) => {
                error!(error = %e, "dead letter not encodable");
                return ConsumeOutcome::Uncommitted;
            }
        };
        let message = match letter.invoice_id.as_str() {
            "" => message,
            invoice_id => message.with_key(invoice_id),
        };

        match self.broker.publish(&self.config.dlq_topic, message).await {
            Ok(()) => {
                warn!(reason = %letter.error, dlq_topic = %self.config.dlq_topic, "verdict dead-lettered");
                ConsumeOutcome::DeadLettered(letter.error)
            }
            Err(e) => {
                error!(error = %e, dlq_topic = %self.config.dlq_topic, "dead letter publish failed");
                ConsumeOutcome::Uncommitted
            }
        }
    }
}

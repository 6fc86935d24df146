use crate::application::retry::Backoff;
use crate::domain::message::{BusMessage, HEADER_REQUEST_ID};
use crate::domain::outbox::OutboxEvent;
use crate::domain::ports::{OutboxStoreRef, PublisherRef};
use crate::error::{GatewayError, Result};
use chrono::{DateTime, Utc};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, instrument, warn};

#[derive(Debug, Clone, PartialEq)]
pub struct RelayConfig {
    pub topic: String,
    pub poll_interval: Duration,
    pub batch_size: usize,
    /// How long a claimed row stays invisible to other relays.
    pub claim_lease: Duration,
    /// Delay before attempt `n + 1` is `backoff.delay(n)`.
    pub backoff: Backoff,
    /// `None` retries forever.
    pub max_attempts: Option<u32>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            topic: "pending_transactions".to_string(),
            poll_interval: Duration::from_millis(500),
            batch_size: 10,
            claim_lease: Duration::from_secs(30),
            backoff: Backoff::new(Duration::from_secs(1), 2, Duration::from_secs(30)),
            max_attempts: None,
        }
    }
}

/// What one relay cycle did.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RelayReport {
    pub claimed: usize,
    pub sent: usize,
    pub failed: usize,
    pub exhausted: usize,
    /// Rows whose new state could not be written. They come back once the
    /// lease runs out.
    pub store_errors: usize,
}

/// Publishes staged outbox events to the bus.
///
/// Several relays may run against the same store: rows are leased on claim,
/// so each row is in flight on at most one relay at a time.
pub struct OutboxRelay {
    outbox: OutboxStoreRef,
    publisher: PublisherRef,
    config: RelayConfig,
}

impl OutboxRelay {
    pub fn new(outbox: OutboxStoreRef, publisher: PublisherRef, config: RelayConfig) -> Self {
        Self {
            outbox,
            publisher,
            config,
        }
    }

    /// Polls until `shutdown` flips to true or its sender goes away. A cycle
    /// in progress always completes.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let mut ticker = tokio::time::interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(topic = %self.config.topic, batch_size = self.config.batch_size, "outbox relay started");

        while !*shutdown.borrow() {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.run_once().await {
                        error!(error = %e, "outbox claim failed");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!("outbox relay stopped");
        Ok(())
    }

    /// Claims one batch and publishes it.
    #[instrument(skip(self), fields(topic = %self.config.topic))]
    pub async fn run_once(&self) -> Result<RelayReport> {
        let events = self
            .outbox
            .claim_pending(self.config.batch_size, self.config.claim_lease)
            .await?;
        let mut report = RelayReport {
            claimed: events.len(),
            ..RelayReport::default()
        };

        for event in events {
            let outbox_id = event.id;
            if let Err(e) = self.relay_event(event, &mut report).await {
                error!(%outbox_id, error = %e, "outbox row not updated");
                report.store_errors += 1;
            }
        }

        if report.claimed > 0 {
            info!(
                claimed = report.claimed,
                sent = report.sent,
                failed = report.failed,
                exhausted = report.exhausted,
                store_errors = report.store_errors,
                "outbox cycle finished"
            );
        }
        Ok(report)
    }

    async fn relay_event(&self, event: OutboxEvent, report: &mut RelayReport) -> Result<()> {
        match self.publisher.publish(&self.config.topic, message_for(&event)).await {
            Ok(()) => {
                self.outbox.mark_sent(event.id).await?;
                debug!(outbox_id = %event.id, aggregate_id = %event.aggregate_id, "outbox event sent");
                report.sent += 1;
            }
            Err(e) => {
                let reason = e.to_string();
                if self.config.max_attempts.is_some_and(|max| event.attempts >= max) {
                    self.outbox.mark_exhausted(event.id, &reason).await?;
                    error!(outbox_id = %event.id, attempts = event.attempts, error = %reason, "outbox event exhausted");
                    report.exhausted += 1;
                } else {
                    let next_attempt_at = self.next_attempt_at(event.attempts)?;
                    self.outbox.mark_failed(event.id, next_attempt_at, &reason).await?;
                    warn!(
                        outbox_id = %event.id,
                        attempts = event.attempts,
                        %next_attempt_at,
                        error = %reason,
                        "outbox publish failed"
                    );
                    report.failed += 1;
                }
            }
        }
        Ok(())
    }

    fn next_attempt_at(&self, attempts: u32) -> Result<DateTime<Utc>> {
        let delay = chrono::Duration::from_std(self.config.backoff.delay(attempts))
            .map_err(|e| GatewayError::ConfigError(format!("Invalid relay backoff: {e}")))?;
        Ok(Utc::now() + delay)
    }
}

fn message_for(event: &OutboxEvent) -> BusMessage {
    let message = BusMessage::new(event.payload.clone()).with_key(event.aggregate_id.to_string());
    match &event.correlation_id {
        Some(correlation_id) => message.with_header(HEADER_REQUEST_ID, correlation_id.as_str()),
        None => message,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn test_message_carries_key_and_correlation() {
        let aggregate_id = Uuid::new_v4();
        let event = OutboxEvent::new(aggregate_id, "pending_transaction", b"{}".to_vec(), Some("req-1"));
        let message = message_for(&event);

        assert_eq!(message.key, Some(aggregate_id.to_string().into_bytes()));
        assert_eq!(message.headers.get_str(HEADER_REQUEST_ID), Some("req-1"));
        assert_eq!(message.payload, b"{}");
    }

    #[test]
    fn test_message_without_correlation_has_no_headers() {
        let event = OutboxEvent::new(Uuid::new_v4(), "pending_transaction", vec![], None);
        assert!(message_for(&event).headers.is_empty());
    }
}

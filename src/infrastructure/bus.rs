use crate::domain::message::{BusMessage, Delivery};
use crate::domain::ports::{Broker, Publisher, Subscription};
use crate::error::{GatewayError, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

#[derive(Default)]
struct BrokerState {
    topics: HashMap<String, Vec<BusMessage>>,
    /// Next offset to read, per (group, topic).
    committed: HashMap<(String, String), i64>,
    /// Publishes still to be refused, per topic.
    failures: HashMap<String, usize>,
}

struct Inner {
    state: Mutex<BrokerState>,
    notify: Notify,
    poll_timeout: Duration,
}

/// A single-partition, in-process message bus with consumer-group offsets.
///
/// A subscription starts at its group's committed offset, so anything
/// fetched but not committed is delivered again to the next subscription of
/// that group.
#[derive(Clone)]
pub struct InMemoryBroker {
    inner: Arc<Inner>,
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::with_poll_timeout(Duration::from_millis(100))
    }

    /// `poll_timeout` bounds how long `fetch` waits before returning `None`.
    pub fn with_poll_timeout(poll_timeout: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(BrokerState::default()),
                notify: Notify::new(),
                poll_timeout,
            }),
        }
    }

    /// Makes the next `count` publishes to `topic` fail with a transport
    /// error.
    pub fn fail_publishes(&self, topic: &str, count: usize) {
        let mut state = self.inner.state.lock();
        state.failures.insert(topic.to_string(), count);
    }

    /// Everything published to `topic` so far.
    pub fn messages(&self, topic: &str) -> Vec<BusMessage> {
        let state = self.inner.state.lock();
        state.topics.get(topic).cloned().unwrap_or_default()
    }

    pub fn committed_offset(&self, group: &str, topic: &str) -> i64 {
        let state = self.inner.state.lock();
        state
            .committed
            .get(&(group.to_string(), topic.to_string()))
            .copied()
            .unwrap_or(0)
    }
}

#[async_trait]
impl Publisher for InMemoryBroker {
    async fn publish(&self, topic: &str, message: BusMessage) -> Result<()> {
        {
            let mut state = self.inner.state.lock();
            if let Some(remaining) = state.failures.get_mut(topic)
                && *remaining > 0
            {
                *remaining -= 1;
                return Err(GatewayError::TransportError(format!(
                    "Publish to {topic} refused"
                )));
            }
            state.topics.entry(topic.to_string()).or_default().push(message);
        }
        self.inner.notify.notify_waiters();
        Ok(())
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    async fn subscribe(&self, topic: &str, group: &str) -> Result<Box<dyn Subscription>> {
        let position = self.committed_offset(group, topic);
        Ok(Box::new(InMemorySubscription {
            inner: Arc::clone(&self.inner),
            topic: topic.to_string(),
            group: group.to_string(),
            position,
        }))
    }
}

struct InMemorySubscription {
    inner: Arc<Inner>,
    topic: String,
    group: String,
    position: i64,
}

impl InMemorySubscription {
    fn next_delivery(&mut self) -> Option<Delivery> {
        let state = self.inner.state.lock();
        let message = state
            .topics
            .get(&self.topic)
            .and_then(|messages| usize::try_from(self.position).ok().and_then(|i| messages.get(i)))?
            .clone();
        let delivery = Delivery {
            topic: self.topic.clone(),
            partition: 0,
            offset: self.position,
            message,
        };
        drop(state);
        self.position += 1;
        Some(delivery)
    }
}

#[async_trait]
impl Subscription for InMemorySubscription {
    async fn fetch(&mut self) -> Result<Option<Delivery>> {
        let inner = Arc::clone(&self.inner);
        let notified = inner.notify.notified();
        tokio::pin!(notified);
        // Register interest before looking so a publish in between is not missed.
        notified.as_mut().enable();

        if let Some(delivery) = self.next_delivery() {
            return Ok(Some(delivery));
        }
        if tokio::time::timeout(inner.poll_timeout, notified).await.is_err() {
            return Ok(None);
        }
        Ok(self.next_delivery())
    }

    async fn commit(&mut self, delivery: &Delivery) -> Result<()> {
        let mut state = self.inner.state.lock();
        let next = state
            .committed
            .entry((self.group.clone(), self.topic.clone()))
            .or_insert(0);
        *next = (*next).max(delivery.offset + 1);
        Ok(())
    }
}

//! Event Sources
//!
//! Event states block until a named event arrives or their timeout elapses.
//! Where events come from is up to the host: a message broker, a webhook, a
//! test. [`ChannelEventSource`] is the in-process implementation: events are
//! published by name and consumed in publication order.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use log::debug;
use serde_json::Value;
use tokio::sync::Notify;

use crate::error::EventSourceError;

/// What an event wait ended with.
#[derive(Debug, Clone, PartialEq)]
pub enum EventOutcome {
    Received(Value),
    TimedOut,
}

#[async_trait]
pub trait EventSource: Send + Sync {
    /// Waits for the next event with the given name. `None` waits forever.
    async fn await_event(
        &self,
        event: &str,
        timeout: Option<Duration>,
    ) -> Result<EventOutcome, EventSourceError>;
}

/// In-process event queue, one FIFO per event name.
#[derive(Debug, Default)]
pub struct ChannelEventSource {
    queues: Mutex<HashMap<String, VecDeque<Value>>>,
    published: Notify,
}

impl ChannelEventSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publishes an event, waking any state waiting for it.
    pub fn publish(&self, event: &str, payload: Value) {
        debug!("Event '{}' published", event);
        self.queues
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .entry(event.to_string())
            .or_default()
            .push_back(payload);
        self.published.notify_waiters();
    }

    /// Number of published events not yet consumed.
    pub fn pending(&self, event: &str) -> usize {
        self.queues
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(event)
            .map_or(0, VecDeque::len)
    }

    fn take(&self, event: &str) -> Option<Value> {
        self.queues
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get_mut(event)?
            .pop_front()
    }

    async fn next(&self, event: &str) -> Value {
        loop {
            // Register interest before checking, so a publish in between is not missed.
            let notified = self.published.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(payload) = self.take(event) {
                return payload;
            }
            notified.await;
        }
    }
}

#[async_trait]
impl EventSource for ChannelEventSource {
    async fn await_event(
        &self,
        event: &str,
        timeout: Option<Duration>,
    ) -> Result<EventOutcome, EventSourceError> {
        let outcome = match timeout {
            Some(limit) => match tokio::time::timeout(limit, self.next(event)).await {
                Ok(payload) => EventOutcome::Received(payload),
                // A zero timeout still delivers an event that is already queued.
                Err(_) => match self.take(event) {
                    Some(payload) => EventOutcome::Received(payload),
                    None => EventOutcome::TimedOut,
                },
            },
            None => EventOutcome::Received(self.next(event).await),
        };
        Ok(outcome)
    }
}

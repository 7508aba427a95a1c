// =============================================================================
// Retry queue — exponential backoff for failed durable-store writes
//
// The store is fire-and-forget: a write failure never propagates back to
// the caller that triggered it (a position close, an event publish). It
// lands here instead, retried with `base * 2^attempts` backoff up to a
// fixed attempt cap, then dropped with an ERROR event rather than
// retried forever.
// =============================================================================

use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::error;

use crate::event_bus::{EventBus, SystemEvent};
use crate::types::Severity;

const BASE_BACKOFF: Duration = Duration::from_secs(2);
const MAX_ATTEMPTS: u32 = 3;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryItem {
    pub operation: String,
    pub name: String,
    pub data: Value,
    pub attempts: u32,
}

struct QueuedItem {
    item: RetryItem,
    not_before: Instant,
}

pub struct RetryQueue {
    items: Mutex<Vec<QueuedItem>>,
    events: std::sync::Arc<EventBus>,
}

impl RetryQueue {
    pub fn new(events: std::sync::Arc<EventBus>) -> Self {
        Self {
            items: Mutex::new(Vec::new()),
            events,
        }
    }

    pub fn push(&self, operation: impl Into<String>, name: impl Into<String>, data: Value) {
        let item = RetryItem {
            operation: operation.into(),
            name: name.into(),
            data,
            attempts: 0,
        };
        self.items.lock().push(QueuedItem {
            item,
            not_before: Instant::now(),
        });
    }

    /// Pop every item whose backoff has elapsed, for the caller to retry.
    /// Items that are retried again go back in via `requeue_failed`.
    pub fn drain_due(&self) -> Vec<RetryItem> {
        let now = Instant::now();
        let mut items = self.items.lock();
        let mut due = Vec::new();
        items.retain(|q| {
            if q.not_before <= now {
                due.push(q.item.clone());
                false
            } else {
                true
            }
        });
        due
    }

    /// Re-queue an item that failed again, or drop it with an ERROR event
    /// once it has exhausted its attempt budget.
    pub fn requeue_failed(&self, mut item: RetryItem) {
        item.attempts += 1;
        if item.attempts >= MAX_ATTEMPTS {
            error!(
                operation = %item.operation,
                name = %item.name,
                attempts = item.attempts,
                "retry queue exhausted, dropping write"
            );
            self.events.publish(SystemEvent::RetryQueueExhausted {
                operation: format!("{}:{}", item.operation, item.name),
            });
            self.events.publish(SystemEvent::Log {
                severity: Severity::Error,
                message: format!(
                    "dropped durable write after {} attempts: {} {}",
                    item.attempts, item.operation, item.name
                ),
            });
            return;
        }
        let backoff = BASE_BACKOFF * 2u32.pow(item.attempts);
        self.items.lock().push(QueuedItem {
            item,
            not_before: Instant::now() + backoff,
        });
    }

    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queue() -> RetryQueue {
        RetryQueue::new(std::sync::Arc::new(EventBus::new()))
    }

    #[test]
    fn pushed_item_is_immediately_due() {
        let q = queue();
        q.push("insert_trade", "BTCUSDT", serde_json::json!({}));
        assert_eq!(q.drain_due().len(), 1);
        assert!(q.is_empty());
    }

    #[test]
    fn requeue_backs_off_before_becoming_due_again() {
        let q = queue();
        q.push("insert_trade", "BTCUSDT", serde_json::json!({}));
        let item = q.drain_due().remove(0);
        q.requeue_failed(item);
        assert!(q.drain_due().is_empty());
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn item_dropped_after_max_attempts() {
        let q = queue();
        q.push("insert_trade", "BTCUSDT", serde_json::json!({}));
        let mut item = q.drain_due().remove(0);
        item.attempts = MAX_ATTEMPTS - 1;
        q.requeue_failed(item);
        assert!(q.is_empty());
    }
}

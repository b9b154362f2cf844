//! In-process event bus.
//!
//! Every significant scheduler transition is published as a [`SchedulerEvent`]
//! on a `tokio::sync::broadcast` channel. Publishing never blocks: with no
//! subscribers the event is dropped, and a slow subscriber lags rather than
//! stalling the store.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::broadcast;
use tracing::{debug, warn};

/// Default number of buffered events per subscriber.
pub const DEFAULT_CAPACITY: usize = 1024;

/// Kinds of transitions published on the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    #[serde(rename = "task.created")]
    TaskCreated,
    #[serde(rename = "task.claimed")]
    TaskClaimed,
    #[serde(rename = "task.unblocked")]
    TaskUnblocked,
    #[serde(rename = "task.completed")]
    TaskCompleted,
    #[serde(rename = "task.failed")]
    TaskFailed,
    #[serde(rename = "task.rejected")]
    TaskRejected,
    #[serde(rename = "task.reassigned")]
    TaskReassigned,
    #[serde(rename = "instance.status_changed")]
    InstanceStatusChanged,
    #[serde(rename = "escalation.created")]
    EscalationCreated,
    #[serde(rename = "escalation.resolved")]
    EscalationResolved,
    #[serde(rename = "budget.threshold")]
    BudgetThreshold,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::TaskCreated => "task.created",
            EventKind::TaskClaimed => "task.claimed",
            EventKind::TaskUnblocked => "task.unblocked",
            EventKind::TaskCompleted => "task.completed",
            EventKind::TaskFailed => "task.failed",
            EventKind::TaskRejected => "task.rejected",
            EventKind::TaskReassigned => "task.reassigned",
            EventKind::InstanceStatusChanged => "instance.status_changed",
            EventKind::EscalationCreated => "escalation.created",
            EventKind::EscalationResolved => "escalation.resolved",
            EventKind::BudgetThreshold => "budget.threshold",
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A published transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerEvent {
    pub kind: EventKind,
    pub payload: Map<String, Value>,
    /// Unix milliseconds.
    pub timestamp: i64,
}

impl SchedulerEvent {
    pub fn new(kind: EventKind, timestamp: i64) -> Self {
        Self {
            kind,
            payload: Map::new(),
            timestamp,
        }
    }

    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.payload.insert(key.to_string(), value.into());
        self
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.payload.get(key).and_then(Value::as_str)
    }
}

/// Broadcast bus shared by the store, monitors and delivery.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<SchedulerEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish without waiting for subscribers.
    pub fn publish(&self, event: SchedulerEvent) {
        debug!(kind = %event.kind, "Publishing event");
        if self.sender.send(event).is_err() {
            debug!("No subscribers listening to event");
        }
    }

    pub fn subscribe(&self) -> EventReceiver {
        EventReceiver {
            receiver: self.sender.subscribe(),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("subscribers", &self.sender.receiver_count())
            .finish()
    }
}

/// Subscriber handle.
pub struct EventReceiver {
    receiver: broadcast::Receiver<SchedulerEvent>,
}

impl EventReceiver {
    /// Next event, skipping over any lagged gap. `None` once the bus is gone.
    pub async fn recv(&mut self) -> Option<SchedulerEvent> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(skipped = n, "Event receiver lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Non-blocking receive; `None` when nothing is queued.
    pub fn try_recv(&mut self) -> Option<SchedulerEvent> {
        loop {
            match self.receiver.try_recv() {
                Ok(event) => return Some(event),
                Err(broadcast::error::TryRecvError::Lagged(n)) => {
                    warn!(skipped = n, "Event receiver lagged");
                }
                Err(_) => return None,
            }
        }
    }

    /// Drain everything currently queued.
    pub fn drain(&mut self) -> Vec<SchedulerEvent> {
        std::iter::from_fn(|| self.try_recv()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn publish_without_subscribers_is_a_no_op() {
        let bus = EventBus::new(4);
        bus.publish(SchedulerEvent::new(EventKind::TaskCreated, 1));
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn subscribers_see_events_in_order() {
        let bus = EventBus::new(8);
        let mut rx = bus.subscribe();
        bus.publish(SchedulerEvent::new(EventKind::TaskClaimed, 1).with("task_id", "CD-001"));
        bus.publish(SchedulerEvent::new(EventKind::TaskCompleted, 2).with("task_id", "CD-001"));

        let events = rx.drain();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].kind, EventKind::TaskClaimed);
        assert_eq!(events[1].get_str("task_id"), Some("CD-001"));
    }

    #[test]
    fn lagging_subscriber_keeps_newest_events() {
        let bus = EventBus::new(2);
        let mut rx = bus.subscribe();
        for i in 0..5 {
            bus.publish(SchedulerEvent::new(EventKind::TaskCreated, i));
        }
        let events = rx.drain();
        assert_eq!(events.last().map(|e| e.timestamp), Some(4));
        assert!(events.len() <= 2);
    }

    #[test]
    fn kind_serializes_with_dotted_name() {
        let json = serde_json::to_value(EventKind::BudgetThreshold).unwrap();
        assert_eq!(json, "budget.threshold");
        assert_eq!(EventKind::BudgetThreshold.as_str(), "budget.threshold");
    }
}

//! Fan-out of live updates to WebSocket subscribers.
//!
//! Every subscriber owns a bounded queue. Publishing pushes into the queues and
//! wakes consumers; it never waits on a slow one. A full queue drops its oldest
//! message, and the subscriber is told how many it lost before its next item.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crewtrace_core::{Run, Status, Step};
use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::Notify;
use tracing::{debug, warn};

/// A message pushed to live subscribers.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LiveMessage {
    AgentUpdate {
        run_id: String,
        agent_id: String,
        agent_name: String,
        status: Status,
        latency_ms: u64,
        cost_usd: f64,
        parent_step_id: Option<String>,
    },
    RunsChanged {
        run_id: String,
        status: Status,
        revision: u64,
    },
    DebateProgress {
        status: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        run_id: Option<String>,
    },
    /// The subscriber lost `dropped` messages and should re-pull state.
    Resync { dropped: u64 },
}

impl LiveMessage {
    pub fn agent_update(step: &Step) -> Self {
        LiveMessage::AgentUpdate {
            run_id: step.run_id.clone(),
            agent_id: step.id.clone(),
            agent_name: step.agent_name.clone(),
            status: step.status,
            latency_ms: step.duration_ms,
            cost_usd: step.cost_usd,
            parent_step_id: step.parent_ref.clone(),
        }
    }

    pub fn runs_changed(run: &Run) -> Self {
        LiveMessage::RunsChanged {
            run_id: run.id.clone(),
            status: run.status,
            revision: run.revision,
        }
    }
}

#[derive(Default)]
struct Queue {
    items: VecDeque<LiveMessage>,
    dropped: u64,
}

struct Subscriber {
    /// `None` subscribes to every run.
    run_id: Option<String>,
    queue: Mutex<Queue>,
    notify: Notify,
}

impl Subscriber {
    fn push(&self, message: LiveMessage, capacity: usize) {
        let Ok(mut queue) = self.queue.lock() else {
            warn!("Subscriber queue lock poisoned");
            return;
        };
        if queue.items.len() >= capacity {
            queue.items.pop_front();
            queue.dropped += 1;
        }
        queue.items.push_back(message);
        drop(queue);
        self.notify.notify_one();
    }
}

type Registry = DashMap<u64, Arc<Subscriber>>;

/// Registry of live subscribers.
pub struct Broadcaster {
    capacity: usize,
    next_id: AtomicU64,
    subscribers: Arc<Registry>,
}

impl Broadcaster {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            next_id: AtomicU64::new(1),
            subscribers: Arc::new(DashMap::new()),
        }
    }

    /// Subscribes to one run, or to every run when `run_id` is `None`.
    pub fn subscribe(&self, run_id: Option<String>) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let inner = Arc::new(Subscriber {
            run_id,
            queue: Mutex::new(Queue::default()),
            notify: Notify::new(),
        });
        self.subscribers.insert(id, inner.clone());
        debug!(subscriber = id, run_id = ?inner.run_id, "Live subscriber added");
        Subscription {
            id,
            inner,
            registry: self.subscribers.clone(),
        }
    }

    /// Delivers to global subscribers and, with `run_id`, to that run's subscribers.
    pub fn publish(&self, run_id: Option<&str>, message: LiveMessage) {
        for entry in self.subscribers.iter() {
            let wants = match (&entry.run_id, run_id) {
                (None, _) => true,
                (Some(subscribed), Some(run)) => subscribed == run,
                (Some(_), None) => false,
            };
            if wants {
                entry.push(message.clone(), self.capacity);
            }
        }
    }

    /// Delivers only to subscribers of every run.
    pub fn publish_global(&self, message: LiveMessage) {
        self.publish(None, message);
    }

    /// Publishes the updates that follow a stored step change.
    pub fn step_changed(&self, step: &Step, run: &Run) {
        self.publish(Some(&step.run_id), LiveMessage::agent_update(step));
        self.publish_global(LiveMessage::runs_changed(run));
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }
}

/// A live subscription. Dropping it unsubscribes.
pub struct Subscription {
    id: u64,
    inner: Arc<Subscriber>,
    registry: Arc<Registry>,
}

impl Subscription {
    /// The next queued message without waiting. A pending loss is reported
    /// as [`LiveMessage::Resync`] before any further item.
    pub fn try_next(&self) -> Option<LiveMessage> {
        let Ok(mut queue) = self.inner.queue.lock() else {
            return None;
        };
        if queue.dropped > 0 {
            let dropped = std::mem::take(&mut queue.dropped);
            return Some(LiveMessage::Resync { dropped });
        }
        queue.items.pop_front()
    }

    /// Waits for the next message.
    pub async fn next(&self) -> LiveMessage {
        loop {
            if let Some(message) = self.try_next() {
                return message;
            }
            self.inner.notify.notified().await;
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.registry.remove(&self.id);
        debug!(subscriber = self.id, "Live subscriber removed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn progress(status: &str) -> LiveMessage {
        LiveMessage::DebateProgress {
            status: status.into(),
            run_id: None,
        }
    }

    #[test]
    fn test_overflow_drops_oldest_and_reports_resync() {
        let broadcaster = Broadcaster::new(2);
        let sub = broadcaster.subscribe(None);
        for s in ["a", "b", "c", "d"] {
            broadcaster.publish_global(progress(s));
        }

        assert_eq!(sub.try_next(), Some(LiveMessage::Resync { dropped: 2 }));
        assert_eq!(sub.try_next(), Some(progress("c")));
        assert_eq!(sub.try_next(), Some(progress("d")));
        assert_eq!(sub.try_next(), None);
    }

    #[test]
    fn test_run_subscribers_only_see_their_run() {
        let broadcaster = Broadcaster::new(8);
        let global = broadcaster.subscribe(None);
        let run_a = broadcaster.subscribe(Some("a".into()));

        let mut step = Step::new("s1", "b", "writer");
        step.status = Status::Success;
        let mut run = Run::new("b", 0);
        run.revision = 3;
        broadcaster.step_changed(&step, &run);

        assert!(run_a.try_next().is_none());
        assert!(matches!(global.try_next(), Some(LiveMessage::AgentUpdate { .. })));
        assert_eq!(
            global.try_next(),
            Some(LiveMessage::RunsChanged {
                run_id: "b".into(),
                status: Status::Running,
                revision: 3
            })
        );
    }

    #[test]
    fn test_dropping_subscription_unregisters() {
        let broadcaster = Broadcaster::new(4);
        let sub = broadcaster.subscribe(None);
        assert_eq!(broadcaster.subscriber_count(), 1);
        drop(sub);
        assert_eq!(broadcaster.subscriber_count(), 0);
        broadcaster.publish_global(progress("x"));
    }

    #[test]
    fn test_message_wire_shape() {
        let json = serde_json::to_value(LiveMessage::Resync { dropped: 4 }).unwrap();
        assert_eq!(json, serde_json::json!({"type": "resync", "dropped": 4}));
    }

    #[tokio::test]
    async fn test_next_wakes_on_publish() {
        let broadcaster = Arc::new(Broadcaster::new(4));
        let sub = broadcaster.subscribe(None);

        let publisher = broadcaster.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            publisher.publish_global(progress("started"));
        });

        let message = tokio::time::timeout(Duration::from_secs(2), sub.next()).await.unwrap();
        assert_eq!(message, progress("started"));
    }
}

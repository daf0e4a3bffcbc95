//! Subscriber registry: per-task fan-out of push events.
//!
//! Each subscriber owns a bounded queue. Publication never blocks: a sink
//! whose queue is full is dropped and closed, so a stalled client can slow
//! neither the pipeline nor its peers.

use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use dubflow_core::task::StageRunStatus;
use dubflow_core::{Stage, TaskId};

/// Bound of each subscriber queue.
pub const SINK_CAPACITY: usize = 64;

/// Event pushed to task subscribers.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskEvent {
    ProgressUpdate {
        task_id: TaskId,
        language: String,
        stage: Stage,
        status: StageRunStatus,
        progress: u8,
        message: Option<String>,
    },
    BatchState {
        state: String,
        task_id: Option<TaskId>,
        language: Option<String>,
        stage: Option<Stage>,
        completed_stages: usize,
        total_stages: usize,
        error: Option<String>,
    },
}

struct Sink {
    id: u64,
    tx: mpsc::Sender<TaskEvent>,
}

type SinkMap = Arc<Mutex<HashMap<TaskId, Vec<Sink>>>>;

/// Tracks live push subscribers per task.
pub struct SubscriberRegistry {
    sinks: SinkMap,
    next_id: AtomicU64,
}

impl SubscriberRegistry {
    pub fn new() -> Self {
        Self {
            sinks: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(0),
        }
    }

    /// Register a subscriber for one task. The subscription unsubscribes on
    /// drop.
    pub fn subscribe(&self, task_id: TaskId) -> Subscription {
        let (tx, rx) = mpsc::channel(SINK_CAPACITY);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.sinks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(task_id)
            .or_default()
            .push(Sink { id, tx });
        debug!(%task_id, subscriber = id, "subscriber registered");
        Subscription {
            sinks: self.sinks.clone(),
            task_id,
            id,
            rx,
        }
    }

    /// Enqueue an event to every subscriber of `task_id`, non-blockingly.
    /// Full or closed sinks are removed.
    pub fn broadcast(&self, task_id: TaskId, event: &TaskEvent) {
        let mut sinks = self.sinks.lock().unwrap_or_else(|e| e.into_inner());
        let Some(list) = sinks.get_mut(&task_id) else {
            return;
        };
        list.retain(|sink| match sink.tx.try_send(event.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(%task_id, subscriber = sink.id, "slow subscriber dropped");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });
        if list.is_empty() {
            sinks.remove(&task_id);
        }
    }

    /// Disconnect every subscriber of a task. Used on task delete.
    pub fn drop_all(&self, task_id: TaskId) {
        self.sinks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&task_id);
    }

    pub fn subscriber_count(&self, task_id: TaskId) -> usize {
        self.sinks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&task_id)
            .map(Vec::len)
            .unwrap_or(0)
    }
}

impl Default for SubscriberRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// One live subscriber. Receives events in publication order until dropped,
/// disconnected for being slow, or the task is deleted.
pub struct Subscription {
    sinks: SinkMap,
    task_id: TaskId,
    id: u64,
    rx: mpsc::Receiver<TaskEvent>,
}

impl Subscription {
    /// Next event; `None` once the sink is closed.
    pub async fn recv(&mut self) -> Option<TaskEvent> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<TaskEvent> {
        self.rx.try_recv().ok()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        let mut sinks = self.sinks.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(list) = sinks.get_mut(&self.task_id) {
            list.retain(|sink| sink.id != self.id);
            if list.is_empty() {
                sinks.remove(&self.task_id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn progress_event(task_id: TaskId, progress: u8) -> TaskEvent {
        TaskEvent::ProgressUpdate {
            task_id,
            language: "en".to_string(),
            stage: Stage::Translation,
            status: StageRunStatus::Processing,
            progress,
            message: None,
        }
    }

    #[tokio::test]
    async fn events_arrive_in_publication_order() {
        let registry = Arc::new(SubscriberRegistry::new());
        let task = TaskId::new();
        let mut sub = registry.subscribe(task);

        for progress in [10, 20, 30] {
            registry.broadcast(task, &progress_event(task, progress));
        }
        for expected in [10, 20, 30] {
            match sub.recv().await.unwrap() {
                TaskEvent::ProgressUpdate { progress, .. } => assert_eq!(progress, expected),
                other => panic!("unexpected event {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn broadcasts_are_scoped_to_the_task() {
        let registry = Arc::new(SubscriberRegistry::new());
        let task_a = TaskId::new();
        let task_b = TaskId::new();
        let mut sub_b = registry.subscribe(task_b);

        registry.broadcast(task_a, &progress_event(task_a, 50));
        assert!(sub_b.try_recv().is_none());
    }

    #[tokio::test]
    async fn slow_subscriber_is_dropped_without_stalling_others() {
        let registry = Arc::new(SubscriberRegistry::new());
        let task = TaskId::new();
        let mut fast = registry.subscribe(task);
        let slow = registry.subscribe(task);

        // The slow subscriber never reads; overflow its queue.
        for i in 0..(SINK_CAPACITY + 1) {
            registry.broadcast(task, &progress_event(task, (i % 100) as u8));
            // Keep the fast queue drained.
            while fast.try_recv().is_some() {}
        }

        assert_eq!(registry.subscriber_count(task), 1);
        registry.broadcast(task, &progress_event(task, 99));
        assert!(fast.try_recv().is_some());
        drop(slow);
    }

    #[tokio::test]
    async fn drop_all_closes_subscribers() {
        let registry = Arc::new(SubscriberRegistry::new());
        let task = TaskId::new();
        let mut sub = registry.subscribe(task);

        registry.drop_all(task);
        assert_eq!(registry.subscriber_count(task), 0);
        assert!(sub.recv().await.is_none());
    }

    #[tokio::test]
    async fn unsubscribe_on_drop() {
        let registry = Arc::new(SubscriberRegistry::new());
        let task = TaskId::new();
        let sub = registry.subscribe(task);
        assert_eq!(registry.subscriber_count(task), 1);
        drop(sub);
        assert_eq!(registry.subscriber_count(task), 0);
    }
}

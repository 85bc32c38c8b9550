//! Per-task progress streams.
//!
//! Each task gets a `watch` channel holding its most recent event, so a late
//! subscriber starts from the current value and slow subscribers skip stale
//! intermediate events instead of queueing them. Every accepted event is also
//! sent to a lossy broadcast firehose for job-wide consumers.
//!
//! Finished tasks are kept for a retention window and then evicted, along
//! with slots that were subscribed to but never published. Eviction ends any
//! open subscription.

use crate::model::TaskStatus;
use chrono::{DateTime, Utc};
use futures::stream::{BoxStream, StreamExt};
use meshforge_abstraction::GenerationOutput;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, watch};
use tokio_stream::wrappers::BroadcastStream;
use tracing::debug;

const FIREHOSE_CAPACITY: usize = 1024;

/// How long a finished task's progress stays queryable by default.
pub const DEFAULT_RETENTION: Duration = Duration::from_secs(600);

/// One progress update for a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressEvent {
    pub task_id: String,
    /// 0 to 100.
    pub percent: u8,
    pub message: String,
    pub status: TaskStatus,
    /// Present on the terminal event of a successful task.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_ref: Option<GenerationOutput>,
    pub timestamp: DateTime<Utc>,
}

impl ProgressEvent {
    /// Creates an event stamped with the current time.
    pub fn new(task_id: &str, status: TaskStatus, percent: u8, message: &str) -> Self {
        Self {
            task_id: task_id.to_string(),
            percent: percent.min(100),
            message: message.to_string(),
            status,
            result_ref: None,
            timestamp: Utc::now(),
        }
    }

    /// Attaches the generated result.
    #[must_use]
    pub fn with_result(mut self, output: GenerationOutput) -> Self {
        self.result_ref = Some(output);
        self
    }

    /// Whether this is the last event of its task.
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

struct Slot {
    sender: watch::Sender<Option<ProgressEvent>>,
    created: Instant,
    finished: Option<Instant>,
}

impl Slot {
    fn new() -> Self {
        Self { sender: watch::channel(None).0, created: Instant::now(), finished: None }
    }

    /// When the slot became evictable: on its terminal event, or at creation
    /// if nothing was ever published.
    fn idle_since(&self) -> Option<Instant> {
        self.finished.or_else(|| self.sender.borrow().is_none().then_some(self.created))
    }
}

/// Fan-out hub for task progress.
pub struct ProgressPublisher {
    tasks: Mutex<HashMap<String, Slot>>,
    firehose: broadcast::Sender<ProgressEvent>,
    retention: Duration,
}

impl Default for ProgressPublisher {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ProgressPublisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let tracked = self.tasks.lock().unwrap_or_else(PoisonError::into_inner).len();
        f.debug_struct("ProgressPublisher")
            .field("tracked_tasks", &tracked)
            .field("retention", &self.retention)
            .finish()
    }
}

impl ProgressPublisher {
    /// Creates a publisher with no tracked tasks.
    #[must_use]
    pub fn new() -> Self {
        Self::with_retention(DEFAULT_RETENTION)
    }

    /// Creates a publisher evicting finished tasks after `retention`.
    #[must_use]
    pub fn with_retention(retention: Duration) -> Self {
        let (firehose, _) = broadcast::channel(FIREHOSE_CAPACITY);
        Self { tasks: Mutex::new(HashMap::new()), firehose, retention }
    }

    fn sender(&self, task_id: &str) -> watch::Sender<Option<ProgressEvent>> {
        let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        tasks.entry(task_id.to_string()).or_insert_with(Slot::new).sender.clone()
    }

    /// Marks a task finished and evicts every slot idle past the retention window.
    fn finish_and_sweep(&self, task_id: &str) {
        let now = Instant::now();
        let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(slot) = tasks.get_mut(task_id) {
            slot.finished.get_or_insert(now);
        }
        let before = tasks.len();
        tasks.retain(|id, slot| {
            id == task_id
                || slot.idle_since().is_none_or(|since| now.duration_since(since) < self.retention)
        });
        let evicted = before - tasks.len();
        if evicted > 0 {
            debug!(evicted, tracked = tasks.len(), "Evicted idle progress slots");
        }
    }

    /// Publishes a progress update, keeping the task's last known status.
    pub fn publish(&self, task_id: &str, percent: u8, message: &str) -> bool {
        let status = self.latest(task_id).map_or(TaskStatus::Processing, |e| e.status);
        self.publish_event(ProgressEvent::new(task_id, status, percent, message))
    }

    /// Publishes a progress update carrying an explicit status.
    pub fn publish_status(
        &self,
        task_id: &str,
        status: TaskStatus,
        percent: u8,
        message: &str,
    ) -> bool {
        self.publish_event(ProgressEvent::new(task_id, status, percent, message))
    }

    /// Publishes an event.
    ///
    /// Returns `false` when the event was dropped: anything after a terminal
    /// event, or a non-terminal event whose percent is below the last one. A
    /// terminal event is always accepted, raised to the last percent if lower.
    pub fn publish_event(&self, mut event: ProgressEvent) -> bool {
        let sender = self.sender(&event.task_id);
        let accepted = sender.send_if_modified(|current| {
            let keep = match current.as_ref() {
                Some(previous) if previous.is_terminal() => false,
                Some(previous) if event.is_terminal() => {
                    event.percent = event.percent.max(previous.percent);
                    true
                }
                Some(previous) => event.percent >= previous.percent,
                None => true,
            };
            if keep {
                *current = Some(event.clone());
            }
            keep
        });

        if accepted {
            let terminal = event.is_terminal().then(|| event.task_id.clone());
            // No firehose subscribers is fine.
            let _ = self.firehose.send(event);
            if let Some(task_id) = terminal {
                self.finish_and_sweep(&task_id);
            }
        } else {
            debug!(task_id = %event.task_id, percent = event.percent, "Dropped stale progress event");
        }
        accepted
    }

    /// Streams a task's events, starting from its most recent one.
    ///
    /// The stream ends right after the terminal event, or without one if the
    /// task is evicted first. Intermediate events may be skipped when the
    /// consumer is slower than the producer.
    pub fn subscribe(&self, task_id: &str) -> BoxStream<'static, ProgressEvent> {
        let rx = self.sender(task_id).subscribe();
        futures::stream::unfold((rx, true, false), |(mut rx, first, finished)| async move {
            if finished {
                return None;
            }
            if first {
                let current = rx.borrow_and_update().clone();
                if let Some(event) = current {
                    let done = event.is_terminal();
                    return Some((event, (rx, false, done)));
                }
            }
            loop {
                if rx.changed().await.is_err() {
                    return None;
                }
                let current = rx.borrow_and_update().clone();
                if let Some(event) = current {
                    let done = event.is_terminal();
                    return Some((event, (rx, false, done)));
                }
            }
        })
        .boxed()
    }

    /// Receiver for every accepted event of every task. Lossy under lag.
    pub fn subscribe_all(&self) -> broadcast::Receiver<ProgressEvent> {
        self.firehose.subscribe()
    }

    /// [`subscribe_all`](Self::subscribe_all) as a stream that skips over lag.
    pub fn subscribe_all_stream(&self) -> BoxStream<'static, ProgressEvent> {
        BroadcastStream::new(self.firehose.subscribe())
            .filter_map(|item| async move { item.ok() })
            .boxed()
    }

    /// The most recent accepted event of a task.
    pub fn latest(&self, task_id: &str) -> Option<ProgressEvent> {
        let tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        tasks.get(task_id).and_then(|slot| slot.sender.borrow().clone())
    }

    /// Drops a task's state. Open subscriptions end.
    pub fn forget(&self, task_id: &str) {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner).remove(task_id);
    }
}

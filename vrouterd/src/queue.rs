use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::debug;
use tokio::sync::Notify;

/// Discriminated queue entries: the worker dispatches on the variant, the
/// payload is the object's `namespace/name` key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum WorkItem {
    Pod(String),
    VirtualRouter(String),
}

impl WorkItem {
    pub fn key(&self) -> &str {
        match self {
            WorkItem::Pod(key) | WorkItem::VirtualRouter(key) => key,
        }
    }
}

impl std::fmt::Display for WorkItem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkItem::Pod(key) => write!(f, "pod/{key}"),
            WorkItem::VirtualRouter(key) => write!(f, "virtualrouter/{key}"),
        }
    }
}

#[derive(Default)]
struct QueueState {
    queue: VecDeque<WorkItem>,
    /// Items waiting or re-added while in flight; duplicates collapse here.
    dirty: HashSet<WorkItem>,
    /// Items currently held by a worker; at most one per item.
    processing: HashSet<WorkItem>,
    failures: HashMap<WorkItem, u32>,
    shutting_down: bool,
}

/// Rate-limited work queue with per-item serialization: an item is never
/// handed to two workers at once, and a duplicate of an in-flight item is
/// parked until `done` releases it.
pub struct WorkQueue {
    state: Mutex<QueueState>,
    notify: Notify,
    base_delay: Duration,
    max_delay: Duration,
}

impl Default for WorkQueue {
    fn default() -> Self {
        Self::new(Duration::from_millis(200), Duration::from_secs(60))
    }
}

impl WorkQueue {
    pub fn new(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
            base_delay,
            max_delay,
        }
    }

    pub fn add(&self, item: WorkItem) {
        let mut st = self.state.lock().unwrap();
        if st.shutting_down || st.dirty.contains(&item) {
            return;
        }
        st.dirty.insert(item.clone());
        if st.processing.contains(&item) {
            // parked; done() moves it back onto the queue
            return;
        }
        st.queue.push_back(item);
        drop(st);
        self.notify.notify_one();
    }

    /// Blocks until an item is available. Returns `None` once the queue is
    /// shut down; items already in flight still complete.
    pub async fn get(&self) -> Option<WorkItem> {
        loop {
            {
                let mut st = self.state.lock().unwrap();
                if st.shutting_down {
                    return None;
                }
                if let Some(item) = st.queue.pop_front() {
                    st.dirty.remove(&item);
                    st.processing.insert(item.clone());
                    return Some(item);
                }
            }
            self.notify.notified().await;
        }
    }

    /// Releases an item a worker finished with. An add that arrived while
    /// the item was in flight re-queues it now.
    pub fn done(&self, item: &WorkItem) {
        let mut st = self.state.lock().unwrap();
        st.processing.remove(item);
        if st.dirty.contains(item) && !st.shutting_down {
            st.queue.push_back(item.clone());
            drop(st);
            self.notify.notify_one();
        }
    }

    /// Re-queues a failed item after an exponential per-item backoff.
    pub fn add_rate_limited(self: &Arc<Self>, item: WorkItem) {
        let delay = {
            let mut st = self.state.lock().unwrap();
            if st.shutting_down {
                return;
            }
            let failures = st.failures.entry(item.clone()).or_insert(0);
            *failures += 1;
            let exp = failures.saturating_sub(1).min(16);
            self.base_delay
                .saturating_mul(1u32 << exp)
                .min(self.max_delay)
        };
        debug!("requeueing {item} after {delay:?}");
        let queue = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.add(item);
        });
    }

    /// Clears the failure history of an item that synced cleanly.
    pub fn forget(&self, item: &WorkItem) {
        self.state.lock().unwrap().failures.remove(item);
    }

    pub fn shut_down(&self) {
        self.state.lock().unwrap().shutting_down = true;
        self.notify.notify_waiters();
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.state.lock().unwrap().queue.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_duplicate_adds_collapse() {
        let queue = WorkQueue::default();
        queue.add(WorkItem::Pod("default/p1".into()));
        queue.add(WorkItem::Pod("default/p1".into()));
        queue.add(WorkItem::VirtualRouter("default/p1".into()));
        assert_eq!(queue.len(), 2);

        let first = queue.get().await.unwrap();
        assert_eq!(first, WorkItem::Pod("default/p1".into()));
    }

    #[tokio::test]
    async fn test_in_flight_item_is_parked_until_done() {
        let queue = WorkQueue::default();
        let item = WorkItem::Pod("default/p1".into());

        queue.add(item.clone());
        let in_flight = queue.get().await.unwrap();
        assert_eq!(in_flight, item);

        // a second event for the same key must not be dequeued concurrently
        queue.add(item.clone());
        assert_eq!(queue.len(), 0);

        queue.done(&item);
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.get().await.unwrap(), item);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limited_backoff_grows() {
        let queue = Arc::new(WorkQueue::new(
            Duration::from_millis(100),
            Duration::from_secs(1),
        ));
        let item = WorkItem::VirtualRouter("default/r1".into());

        queue.add_rate_limited(item.clone());
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(queue.len(), 1);

        let got = queue.get().await.unwrap();
        queue.done(&got);

        // second failure doubles the delay
        queue.add_rate_limited(item.clone());
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(queue.len(), 0);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(queue.len(), 1);

        // a clean sync resets the counter
        let got = queue.get().await.unwrap();
        queue.forget(&got);
        queue.done(&got);
        queue.add_rate_limited(item.clone());
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test]
    async fn test_shutdown_stops_dequeue() {
        let queue = WorkQueue::default();
        queue.add(WorkItem::Pod("default/p1".into()));
        queue.shut_down();
        assert!(queue.get().await.is_none());
    }
}

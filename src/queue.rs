//! In-memory priority queue shared by both worker pools.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::Notify;
use uuid::Uuid;

/// One sidecar translation unit: a source file and a single target language.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TranslationTask {
    pub path: PathBuf,
    pub lang: String,
    /// 0 = high, 1 = normal.
    pub priority: u8,
    /// Correlation id for log lines only.
    pub task_id: Uuid,
}

impl TranslationTask {
    pub fn new(path: PathBuf, lang: String, priority: u8) -> Self {
        Self {
            path,
            lang,
            priority: priority.min(1),
            task_id: Uuid::new_v4(),
        }
    }
}

struct Entry<T> {
    priority: u8,
    seq: u64,
    item: T,
}

impl<T> PartialEq for Entry<T> {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl<T> Eq for Entry<T> {}

impl<T> Ord for Entry<T> {
    // BinaryHeap is a max-heap; invert so that lower priority values and
    // lower sequence numbers pop first.
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .priority
            .cmp(&self.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl<T> PartialOrd for Entry<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

struct Inner<T> {
    heap: BinaryHeap<Entry<T>>,
    counter: u64,
}

/// Thread-safe queue ordered by `(priority asc, insertion order asc)`.
///
/// A monotonic counter guarantees FIFO ordering within a priority level.
pub struct PriorityQueue<T> {
    inner: Mutex<Inner<T>>,
    notify: Notify,
}

impl<T> Default for PriorityQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> PriorityQueue<T> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                heap: BinaryHeap::new(),
                counter: 0,
            }),
            notify: Notify::new(),
        }
    }

    /// Enqueues `item` at `priority` (clamped to `{0, 1}`).
    pub fn push(&self, priority: u8, item: T) {
        {
            let mut inner = self.inner.lock().unwrap();
            let seq = inner.counter;
            inner.counter += 1;
            inner.heap.push(Entry {
                priority: priority.min(1),
                seq,
                item,
            });
        }
        self.notify.notify_one();
    }

    /// Pops the highest-priority item without waiting.
    pub fn try_pop(&self) -> Option<T> {
        self.inner.lock().unwrap().heap.pop().map(|entry| entry.item)
    }

    /// Pops with a bounded wait, returning `None` on timeout.
    pub async fn pop_timeout(&self, timeout: Duration) -> Option<T> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(item) = self.try_pop() {
                return Some(item);
            }
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return self.try_pop();
            }
            let _ = tokio::time::timeout(remaining, self.notify.notified()).await;
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().unwrap().heap.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fifo_within_priority() {
        let queue = PriorityQueue::new();
        queue.push(1, "a");
        queue.push(1, "b");
        queue.push(1, "c");
        assert_eq!(queue.try_pop(), Some("a"));
        assert_eq!(queue.try_pop(), Some("b"));
        assert_eq!(queue.try_pop(), Some("c"));
        assert_eq!(queue.try_pop(), None);
    }

    #[test]
    fn high_priority_jumps_ahead() {
        let queue = PriorityQueue::new();
        queue.push(1, "normal-1");
        queue.push(1, "normal-2");
        queue.push(0, "urgent");
        assert_eq!(queue.try_pop(), Some("urgent"));
        assert_eq!(queue.try_pop(), Some("normal-1"));
        assert_eq!(queue.try_pop(), Some("normal-2"));
    }

    #[test]
    fn out_of_range_priorities_clamp_to_normal() {
        let queue = PriorityQueue::new();
        queue.push(7, "weird");
        queue.push(0, "urgent");
        assert_eq!(queue.try_pop(), Some("urgent"));
        assert_eq!(queue.try_pop(), Some("weird"));
    }

    #[tokio::test]
    async fn pop_timeout_returns_none_when_empty() {
        let queue: PriorityQueue<u32> = PriorityQueue::new();
        assert_eq!(queue.pop_timeout(Duration::from_millis(20)).await, None);
    }

    #[tokio::test]
    async fn pop_timeout_wakes_on_push() {
        let queue = std::sync::Arc::new(PriorityQueue::new());
        let popper = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.pop_timeout(Duration::from_secs(5)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.push(0, 42u32);
        assert_eq!(popper.await.unwrap(), Some(42));
    }
}

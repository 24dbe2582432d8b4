//! In-memory priority job queue.
//!
//! A binary heap keyed by (priority, arrival sequence): lower priority
//! numbers dispatch first, and the sequence counter keeps the heap stable
//! enough that old work is not starved within a priority band. Consumers
//! park on a `Notify` instead of spinning.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::Notify;

use crate::store::TaskType;

/// Urgent: deletes jump the line.
pub const PRIORITY_URGENT: u8 = 0;
/// High: startup resumes and downstream fan-outs.
pub const PRIORITY_HIGH: u8 = 1;
/// Normal: watcher-detected work.
pub const PRIORITY_NORMAL: u8 = 2;

/// One dispatchable unit of work.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Job {
    pub priority: u8,
    pub task_type: TaskType,
    pub path: String,
}

struct Entry {
    seq: u64,
    job: Job,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.job.priority == other.job.priority && self.seq == other.seq
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap; invert so the smallest (priority, seq)
        // pops first
        (other.job.priority, other.seq).cmp(&(self.job.priority, self.seq))
    }
}

/// Thread-safe priority queue with async blocking pop.
pub struct JobQueue {
    heap: Mutex<BinaryHeap<Entry>>,
    seq: AtomicU64,
    notify: Notify,
}

impl JobQueue {
    pub fn new() -> Self {
        Self {
            heap: Mutex::new(BinaryHeap::new()),
            seq: AtomicU64::new(0),
            notify: Notify::new(),
        }
    }

    pub fn push(&self, job: Job) {
        let seq = self.seq.fetch_add(1, AtomicOrdering::Relaxed);
        self.heap
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(Entry { seq, job });
        self.notify.notify_one();
    }

    fn try_pop(&self) -> Option<Job> {
        self.heap
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .pop()
            .map(|entry| entry.job)
    }

    /// Pop the highest-priority job, waiting up to `timeout` for one to
    /// arrive.
    pub async fn pop_timeout(&self, timeout: Duration) -> Option<Job> {
        if let Some(job) = self.try_pop() {
            return Some(job);
        }
        // One wait, one re-check: a notify can race the first try_pop
        match tokio::time::timeout(timeout, self.notify.notified()).await {
            Ok(()) => self.try_pop(),
            Err(_) => None,
        }
    }

    pub fn len(&self) -> usize {
        self.heap.lock().unwrap_or_else(|p| p.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for JobQueue {
    fn default() -> Self {
        Self::new()
    }
}

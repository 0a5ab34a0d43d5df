use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use tracing::error;

use crate::domain::market::candle::{Candle, VisibleRange};
use crate::domain::market::timeframe::Timeframe;

/// What a queued task asks the worker to do.
///
/// `Stop` is a shutdown sentinel: it carries no payload and jumps the
/// queue so a blocked worker wakes up even when the queue is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskKind {
    FullAnalyze,
    IncrementalUpdate,
    Stop,
}

impl TaskKind {
    /// Scheduling priority. Lower runs first.
    pub fn priority(self) -> u8 {
        match self {
            TaskKind::Stop => 0,
            TaskKind::IncrementalUpdate => 3,
            TaskKind::FullAnalyze => 5,
        }
    }
}

/// A unit of work for the background worker.
#[derive(Debug, Clone)]
pub struct AnalysisTask {
    pub kind: TaskKind,
    pub range: VisibleRange,
    pub symbol: String,
    pub timeframe: Timeframe,
    /// Freshly ingested candles, only meaningful for `IncrementalUpdate`.
    pub new_candles: Vec<Candle>,
    pub created_at: Instant,
}

impl AnalysisTask {
    pub fn full(range: VisibleRange, symbol: &str, timeframe: Timeframe) -> Self {
        Self {
            kind: TaskKind::FullAnalyze,
            range,
            symbol: symbol.to_string(),
            timeframe,
            new_candles: Vec::new(),
            created_at: Instant::now(),
        }
    }

    pub fn incremental(
        range: VisibleRange,
        symbol: &str,
        timeframe: Timeframe,
        new_candles: Vec<Candle>,
    ) -> Self {
        Self {
            kind: TaskKind::IncrementalUpdate,
            range,
            symbol: symbol.to_string(),
            timeframe,
            new_candles,
            created_at: Instant::now(),
        }
    }

    pub fn stop() -> Self {
        Self {
            kind: TaskKind::Stop,
            range: VisibleRange::new(0, 0),
            symbol: String::new(),
            timeframe: Timeframe::OneMin,
            new_candles: Vec::new(),
            created_at: Instant::now(),
        }
    }

    pub fn priority(&self) -> u8 {
        self.kind.priority()
    }
}

/// Heap entry. Orders by ascending (priority, seq) so the max-heap pops
/// the lowest priority number first and ties resolve FIFO.
struct QueuedTask {
    priority: u8,
    seq: u64,
    task: AnalysisTask,
}

impl PartialEq for QueuedTask {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl Eq for QueuedTask {}

impl PartialOrd for QueuedTask {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedTask {
    fn cmp(&self, other: &Self) -> Ordering {
        (other.priority, other.seq).cmp(&(self.priority, self.seq))
    }
}

struct QueueState {
    heap: BinaryHeap<QueuedTask>,
    next_seq: u64,
}

/// Bounded priority queue between submitters and the worker thread.
///
/// `try_push` never blocks; a full queue rejects everything except the
/// `Stop` sentinel, which is always admitted so shutdown cannot be
/// starved by backpressure.
pub struct TaskQueue {
    state: Mutex<QueueState>,
    available: Condvar,
    max_size: usize,
}

impl TaskQueue {
    pub fn new(max_size: usize) -> Self {
        Self {
            state: Mutex::new(QueueState {
                heap: BinaryHeap::new(),
                next_seq: 0,
            }),
            available: Condvar::new(),
            max_size: max_size.max(1),
        }
    }

    /// Enqueue a task, returning false when the queue is full.
    pub fn try_push(&self, task: AnalysisTask) -> bool {
        let mut state = self.lock_state();
        if task.kind != TaskKind::Stop && state.heap.len() >= self.max_size {
            return false;
        }
        let seq = state.next_seq;
        state.next_seq += 1;
        state.heap.push(QueuedTask {
            priority: task.priority(),
            seq,
            task,
        });
        drop(state);
        self.available.notify_one();
        true
    }

    /// Pop the highest-priority task, waiting up to `timeout` for one
    /// to arrive. Returns None on timeout.
    pub fn pop_timeout(&self, timeout: Duration) -> Option<AnalysisTask> {
        let deadline = Instant::now() + timeout;
        let mut state = self.lock_state();
        loop {
            if let Some(entry) = state.heap.pop() {
                return Some(entry.task);
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return None;
            }
            state = match self.available.wait_timeout(state, remaining) {
                Ok((guard, _)) => guard,
                Err(poisoned) => {
                    error!("TaskQueue: Lock poisoned, recovering");
                    poisoned.into_inner().0
                }
            };
        }
    }

    /// Discard all queued tasks. Used after the worker has exited so a
    /// stale `Stop` sentinel cannot kill a restarted worker.
    pub fn clear(&self) {
        self.lock_state().heap.clear();
    }

    pub fn len(&self) -> usize {
        self.lock_state().heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock_state(&self) -> MutexGuard<'_, QueueState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                error!("TaskQueue: Lock poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }
}

//! Bounded output buffer that evicts the oldest line when full.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::types::OutputLine;

pub const DEFAULT_OUTPUT_CAPACITY: usize = 1_000;

#[derive(Debug)]
struct QueueState {
    lines: VecDeque<OutputLine>,
    capacity: usize,
    closed: bool,
    evicted: u64,
}

#[derive(Debug)]
struct Shared {
    state: Mutex<QueueState>,
    ready: Condvar,
}

/// Multi-producer, multi-consumer line queue.
///
/// `push` never blocks: once `capacity` lines are buffered the oldest one is
/// discarded to make room. Consumers drain remaining lines after `close`.
#[derive(Debug, Clone)]
pub struct OutputQueue {
    shared: Arc<Shared>,
}

impl OutputQueue {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(QueueState {
                    lines: VecDeque::with_capacity(capacity),
                    capacity,
                    closed: false,
                    evicted: 0,
                }),
                ready: Condvar::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.shared
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Returns true when an older line had to be evicted.
    pub fn push(&self, line: OutputLine) -> bool {
        let mut state = self.lock();
        if state.closed {
            return false;
        }
        let mut evicted = false;
        if state.lines.len() >= state.capacity {
            state.lines.pop_front();
            state.evicted += 1;
            evicted = true;
        }
        state.lines.push_back(line);
        self.shared.ready.notify_one();
        evicted
    }

    /// Block until a line is available, or `None` once closed and drained.
    pub fn recv(&self) -> Option<OutputLine> {
        let mut state = self.lock();
        loop {
            if let Some(line) = state.lines.pop_front() {
                return Some(line);
            }
            if state.closed {
                return None;
            }
            state = self
                .shared
                .ready
                .wait(state)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
        }
    }

    /// Like `recv`, but gives up after `timeout`.
    pub fn recv_timeout(&self, timeout: Duration) -> Option<OutputLine> {
        let deadline = Instant::now() + timeout;
        let mut state = self.lock();
        loop {
            if let Some(line) = state.lines.pop_front() {
                return Some(line);
            }
            let now = Instant::now();
            if state.closed || now >= deadline {
                return None;
            }
            let (guard, _) = self
                .shared
                .ready
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            state = guard;
        }
    }

    pub fn try_recv(&self) -> Option<OutputLine> {
        self.lock().lines.pop_front()
    }

    /// Close the queue. Returns true only for the call that closed it.
    pub fn close(&self) -> bool {
        let mut state = self.lock();
        if state.closed {
            return false;
        }
        state.closed = true;
        self.shared.ready.notify_all();
        true
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Closed with nothing left to read.
    pub fn is_finished(&self) -> bool {
        let state = self.lock();
        state.closed && state.lines.is_empty()
    }

    pub fn len(&self) -> usize {
        self.lock().lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total lines discarded because the buffer was full.
    pub fn evicted(&self) -> u64 {
        self.lock().evicted
    }

    pub fn iter(&self) -> OutputIter {
        OutputIter {
            queue: self.clone(),
        }
    }
}

impl Default for OutputQueue {
    fn default() -> Self {
        Self::new(DEFAULT_OUTPUT_CAPACITY)
    }
}

/// Blocking iterator that ends when the queue is closed and drained.
pub struct OutputIter {
    queue: OutputQueue,
}

impl Iterator for OutputIter {
    type Item = OutputLine;

    fn next(&mut self) -> Option<Self::Item> {
        self.queue.recv()
    }
}

//! Priority-ordered, bounded-concurrency test queue.
//!
//! The queue hands out at most `concurrency` tests at a time. Retries are
//! pushed with [`RETRY_PRIORITY`], which is dequeued ahead of
//! [`FIRST_RUN_PRIORITY`], so backlog retries run before unseen work once
//! failures start to accumulate. Within a priority, items are FIFO.
//!
//! The queue does not run anything itself. The runner pulls ready tests with
//! [`next_ready`](TestQueue::next_ready), reports completions with
//! [`complete`](TestQueue::complete), and checks
//! [`is_drained`](TestQueue::is_drained) only after a completion has been
//! fully handled, so a pending retry can never be mistaken for an empty
//! queue.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use crate::test::TestId;

pub const FIRST_RUN_PRIORITY: u8 = 1;
pub const RETRY_PRIORITY: u8 = 2;

#[derive(Debug, PartialEq, Eq)]
struct QueueItem {
    priority: u8,
    seq: u64,
    test: TestId,
}

impl Ord for QueueItem {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for QueueItem {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// The run's work queue plus its passed and failed lists.
#[derive(Debug)]
pub struct TestQueue {
    heap: BinaryHeap<QueueItem>,
    concurrency: usize,
    in_flight: usize,
    seq: u64,
    paused: bool,
    terminated: bool,
    passed: Vec<TestId>,
    failed: Vec<TestId>,
}

impl TestQueue {
    /// Creates a paused queue holding every test at first-run priority.
    pub fn new(tests: impl IntoIterator<Item = TestId>, concurrency: usize) -> Self {
        let mut queue = Self {
            heap: BinaryHeap::new(),
            concurrency: concurrency.max(1),
            in_flight: 0,
            seq: 0,
            paused: true,
            terminated: false,
            passed: Vec::new(),
            failed: Vec::new(),
        };
        for test in tests {
            queue.enqueue(test, FIRST_RUN_PRIORITY);
        }
        queue
    }

    pub fn enqueue(&mut self, test: TestId, priority: u8) {
        if self.terminated {
            return;
        }
        self.seq += 1;
        self.heap.push(QueueItem {
            priority,
            seq: self.seq,
            test,
        });
    }

    /// Starts handing out tests.
    pub fn proceed(&mut self) {
        self.paused = false;
    }

    /// Pops the next test if the queue is running and below its concurrency.
    pub fn next_ready(&mut self) -> Option<TestId> {
        if self.paused || self.terminated || self.in_flight >= self.concurrency {
            return None;
        }
        let item = self.heap.pop()?;
        self.in_flight += 1;
        Some(item.test)
    }

    /// Marks one handed-out test as finished.
    pub fn complete(&mut self) {
        self.in_flight = self.in_flight.saturating_sub(1);
    }

    /// Drops every queued test and stops handing out new ones.
    ///
    /// In-flight tests are not touched; they finish through their own
    /// cancellation path. Returns how many queued tests were dropped.
    pub fn early_terminate(&mut self) -> usize {
        self.terminated = true;
        let dropped = self.heap.len();
        self.heap.clear();
        dropped
    }

    /// Nothing queued and nothing running.
    pub fn is_idle(&self) -> bool {
        self.heap.is_empty() && self.in_flight == 0
    }

    /// The drain condition: running (or terminated) and idle.
    pub fn is_drained(&self) -> bool {
        (!self.paused || self.terminated) && self.is_idle()
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight
    }

    pub fn queued(&self) -> usize {
        self.heap.len()
    }

    pub fn record_pass(&mut self, test: TestId) {
        self.failed.retain(|t| *t != test);
        if !self.passed.contains(&test) {
            self.passed.push(test);
        }
    }

    pub fn record_fail(&mut self, test: TestId) {
        if !self.failed.contains(&test) {
            self.failed.push(test);
        }
    }

    pub fn failed_tests(&self) -> &[TestId] {
        &self.failed
    }

    pub fn passed_tests(&self) -> &[TestId] {
        &self.passed
    }
}

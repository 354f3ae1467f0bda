// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Deadline queue for retransmission jitter.
//!
//! A binary heap of deadlines feeding the poll timeout. Events are plain
//! values; a fired event whose target no longer exists is silently ignored
//! by the dispatcher, so nothing here needs cancellation.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::net::IpAddr;
use std::time::{Duration, Instant};

/// A due retransmission for one in-flight message of one server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerEvent {
    pub addr: IpAddr,
    pub transmission: u64,
}

#[derive(Debug, Default)]
pub struct TimerQueue {
    heap: BinaryHeap<Reverse<(Instant, u64)>>,
    entries: std::collections::HashMap<u64, TimerEvent>,
    next_id: u64,
}

impl TimerQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn schedule(&mut self, delay: Duration, event: TimerEvent) {
        let id = self.next_id;
        self.next_id += 1;
        self.entries.insert(id, event);
        self.heap.push(Reverse((Instant::now() + delay, id)));
    }

    /// Time until the earliest deadline; `None` when the queue is empty.
    pub fn next_timeout(&self, now: Instant) -> Option<Duration> {
        self.heap
            .peek()
            .map(|Reverse((deadline, _))| deadline.saturating_duration_since(now))
    }

    /// Pop one event whose deadline has passed.
    pub fn pop_due(&mut self, now: Instant) -> Option<TimerEvent> {
        loop {
            let Reverse((deadline, _)) = self.heap.peek()?;
            if *deadline > now {
                return None;
            }
            let Reverse((_, id)) = self.heap.pop()?;
            if let Some(event) = self.entries.remove(&id) {
                return Some(event);
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(transmission: u64) -> TimerEvent {
        TimerEvent {
            addr: "10.0.0.1".parse().unwrap(),
            transmission,
        }
    }

    #[test]
    fn pops_in_deadline_order() {
        let mut queue = TimerQueue::new();
        queue.schedule(Duration::from_millis(20), event(2));
        queue.schedule(Duration::from_millis(10), event(1));

        let later = Instant::now() + Duration::from_millis(50);
        assert_eq!(queue.pop_due(later), Some(event(1)));
        assert_eq!(queue.pop_due(later), Some(event(2)));
        assert_eq!(queue.pop_due(later), None);
        assert!(queue.is_empty());
    }

    #[test]
    fn future_deadlines_do_not_fire() {
        let mut queue = TimerQueue::new();
        queue.schedule(Duration::from_secs(60), event(1));
        assert_eq!(queue.pop_due(Instant::now()), None);
        assert!(queue.next_timeout(Instant::now()).unwrap() > Duration::from_secs(1));
        assert!(!queue.is_empty());
    }

    #[test]
    fn empty_queue_has_no_timeout() {
        let queue = TimerQueue::new();
        assert_eq!(queue.next_timeout(Instant::now()), None);
    }
}

//! Min-heap of due deadlines.
//!
//! Retry wake-ups, delay resumes, step timeouts, and run deadlines are all
//! polled deadlines. The queue orders them by due time so each dispatcher
//! tick only touches runs with something due. Rescheduling or cancelling a
//! key leaves its old heap entry in place; stale entries are dropped when
//! popped.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};

use chrono::{DateTime, Utc};
use uuid::Uuid;

/// What a deadline is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TimerKind {
    StepRetry,
    DelayResume,
    StepTimeout,
    RunDeadline,
}

/// Identity of a deadline. Scheduling the same key again replaces it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerKey {
    pub run_id: Uuid,
    pub kind: TimerKind,
    pub step_id: Option<String>,
}

impl TimerKey {
    pub fn step(run_id: Uuid, kind: TimerKind, step_id: impl Into<String>) -> Self {
        Self {
            run_id,
            kind,
            step_id: Some(step_id.into()),
        }
    }

    pub fn run_deadline(run_id: Uuid) -> Self {
        Self {
            run_id,
            kind: TimerKind::RunDeadline,
            step_id: None,
        }
    }
}

#[derive(Debug, Default)]
pub struct TimerQueue {
    heap: BinaryHeap<Reverse<(DateTime<Utc>, TimerKey)>>,
    live: HashMap<TimerKey, DateTime<Utc>>,
}

impl TimerQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedule `key` at `due`, replacing any earlier schedule for it.
    pub fn schedule(&mut self, key: TimerKey, due: DateTime<Utc>) {
        if self.live.get(&key) == Some(&due) {
            return;
        }
        self.live.insert(key.clone(), due);
        self.heap.push(Reverse((due, key)));
    }

    pub fn cancel(&mut self, key: &TimerKey) {
        self.live.remove(key);
    }

    /// Drop every deadline belonging to a run.
    pub fn cancel_run(&mut self, run_id: Uuid) {
        self.live.retain(|key, _| key.run_id != run_id);
    }

    /// Remove and return every live deadline due at or before `now`, in due
    /// order.
    pub fn pop_due(&mut self, now: DateTime<Utc>) -> Vec<TimerKey> {
        let mut due = Vec::new();
        while let Some(Reverse((at, _))) = self.heap.peek() {
            if *at > now {
                break;
            }
            let Some(Reverse((at, key))) = self.heap.pop() else {
                break;
            };
            if self.live.get(&key) == Some(&at) {
                self.live.remove(&key);
                due.push(key);
            }
        }
        due
    }

    /// Earliest live deadline, if any.
    pub fn next_due(&mut self) -> Option<DateTime<Utc>> {
        while let Some(Reverse((at, key))) = self.heap.peek() {
            if self.live.get(key) == Some(at) {
                return Some(*at);
            }
            self.heap.pop();
        }
        None
    }

    pub fn len(&self) -> usize {
        self.live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.live.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_pops_in_due_order() {
        let mut queue = TimerQueue::new();
        let now = Utc::now();
        let (a, b, c) = (Uuid::now_v7(), Uuid::now_v7(), Uuid::now_v7());

        queue.schedule(TimerKey::run_deadline(a), now + Duration::seconds(3));
        queue.schedule(TimerKey::step(b, TimerKind::StepRetry, "x"), now + Duration::seconds(1));
        queue.schedule(TimerKey::step(c, TimerKind::DelayResume, "y"), now + Duration::seconds(2));

        assert!(queue.pop_due(now).is_empty());
        let due: Vec<Uuid> = queue
            .pop_due(now + Duration::seconds(5))
            .into_iter()
            .map(|k| k.run_id)
            .collect();
        assert_eq!(due, vec![b, c, a]);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_reschedule_replaces_earlier_entry() {
        let mut queue = TimerQueue::new();
        let now = Utc::now();
        let key = TimerKey::step(Uuid::now_v7(), TimerKind::StepRetry, "charge");

        queue.schedule(key.clone(), now + Duration::seconds(1));
        queue.schedule(key.clone(), now + Duration::seconds(10));
        assert_eq!(queue.len(), 1);

        assert!(queue.pop_due(now + Duration::seconds(2)).is_empty());
        assert_eq!(queue.next_due(), Some(now + Duration::seconds(10)));
        assert_eq!(queue.pop_due(now + Duration::seconds(10)), vec![key]);
    }

    #[test]
    fn test_cancelled_entries_never_fire() {
        let mut queue = TimerQueue::new();
        let now = Utc::now();
        let run = Uuid::now_v7();
        let other = Uuid::now_v7();

        queue.schedule(TimerKey::run_deadline(run), now);
        queue.schedule(TimerKey::step(run, TimerKind::StepTimeout, "a"), now);
        queue.schedule(TimerKey::run_deadline(other), now);
        queue.cancel_run(run);

        let due = queue.pop_due(now);
        assert_eq!(due, vec![TimerKey::run_deadline(other)]);
        assert_eq!(queue.next_due(), None);
    }
}

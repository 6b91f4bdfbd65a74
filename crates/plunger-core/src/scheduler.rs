//! Timer queue
//!
//! Entries are ordered by (due time, insertion sequence), so timers due at the
//! same millisecond fire in the order they were scheduled. The queue itself
//! never runs anything: the machine pops due entries one at a time and runs
//! them with full access to itself, then hands them back through `finish`.

use crate::time::Time;
use crate::{NodeId, Result, TimerId};
use std::collections::{BTreeMap, HashMap};

/// Timer body, run with the scheduler's owner
pub type TimerCallback<C> = Box<dyn FnMut(&mut C) -> Result<()>>;

struct Entry<C> {
    id: TimerId,
    label: String,
    repeat: Option<Time>,
    owner: Option<NodeId>,
    callback: TimerCallback<C>,
}

/// An entry taken off the queue to be run
pub struct Due<C> {
    pub id: TimerId,
    pub at: Time,
    pub label: String,
    repeat: Option<Time>,
    owner: Option<NodeId>,
    callback: TimerCallback<C>,
}

impl<C> Due<C> {
    /// Run the timer body
    pub fn run(&mut self, ctx: &mut C) -> Result<()> {
        (self.callback)(ctx)
    }
}

/// Ordered queue of pending timers
pub struct Scheduler<C> {
    queue: BTreeMap<(Time, u64), Entry<C>>,
    index: HashMap<TimerId, (Time, u64)>,
    next_seq: u64,
    firing: Option<TimerId>,
    firing_cancelled: bool,
}

impl<C> Scheduler<C> {
    pub fn new() -> Self {
        Self {
            queue: BTreeMap::new(),
            index: HashMap::new(),
            next_seq: 0,
            firing: None,
            firing_cancelled: false,
        }
    }

    /// Queue a callback at absolute time `at`
    ///
    /// With `repeat`, the entry is re-queued at `at + interval` after each run
    /// until cancelled. `owner` ties the timer to a node's lifetime.
    pub fn schedule(
        &mut self,
        at: Time,
        label: impl Into<String>,
        repeat: Option<Time>,
        owner: Option<NodeId>,
        callback: TimerCallback<C>,
    ) -> TimerId {
        self.next_seq += 1;
        let id = TimerId(self.next_seq);
        self.insert(
            at,
            Entry {
                id,
                label: label.into(),
                repeat,
                owner,
                callback,
            },
        );
        id
    }

    fn insert(&mut self, at: Time, entry: Entry<C>) {
        self.next_seq += 1;
        let key = (at, self.next_seq);
        self.index.insert(entry.id, key);
        self.queue.insert(key, entry);
    }

    /// Cancel a timer. Cancelling one that already fired (or was cancelled) is a no-op.
    pub fn cancel(&mut self, id: TimerId) -> bool {
        if self.firing == Some(id) {
            self.firing_cancelled = true;
            return true;
        }
        match self.index.remove(&id) {
            Some(key) => self.queue.remove(&key).is_some(),
            None => false,
        }
    }

    /// Cancel every timer owned by `node`
    pub fn cancel_owned_by(&mut self, node: NodeId) -> usize {
        let owned: Vec<TimerId> = self
            .queue
            .values()
            .filter(|e| e.owner == Some(node))
            .map(|e| e.id)
            .collect();
        let count = owned.len();
        for id in owned {
            self.cancel(id);
        }
        count
    }

    pub fn is_pending(&self, id: TimerId) -> bool {
        self.index.contains_key(&id)
    }

    /// Due time of the earliest entry
    pub fn next_due(&self) -> Option<Time> {
        self.queue.keys().next().map(|(at, _)| *at)
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Take the earliest entry if it is due at or before `until`
    pub fn pop_due(&mut self, until: Time) -> Option<Due<C>> {
        let key = *self.queue.keys().next()?;
        if key.0 > until {
            return None;
        }
        let entry = self.queue.remove(&key)?;
        self.index.remove(&entry.id);
        self.firing = Some(entry.id);
        self.firing_cancelled = false;
        Some(Due {
            id: entry.id,
            at: key.0,
            label: entry.label,
            repeat: entry.repeat,
            owner: entry.owner,
            callback: entry.callback,
        })
    }

    /// Hand back an entry after it ran; repeating entries are re-queued
    pub fn finish(&mut self, due: Due<C>) {
        let cancelled = self.firing_cancelled;
        self.firing = None;
        self.firing_cancelled = false;
        if let (Some(interval), false) = (due.repeat, cancelled) {
            self.insert(
                due.at + interval.max(1),
                Entry {
                    id: due.id,
                    label: due.label,
                    repeat: due.repeat,
                    owner: due.owner,
                    callback: due.callback,
                },
            );
        }
    }
}

impl<C> Default for Scheduler<C> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    type Log = Vec<&'static str>;

    fn push(tag: &'static str) -> TimerCallback<Log> {
        Box::new(move |log: &mut Log| {
            log.push(tag);
            Ok(())
        })
    }

    fn drain(sched: &mut Scheduler<Log>, log: &mut Log, until: Time) {
        while let Some(mut due) = sched.pop_due(until) {
            due.run(log).unwrap();
            sched.finish(due);
        }
    }

    #[test]
    fn test_orders_by_time_then_insertion() {
        let mut sched = Scheduler::new();
        let mut log = Log::new();
        sched.schedule(10, "b", None, None, push("b"));
        sched.schedule(5, "a", None, None, push("a"));
        sched.schedule(10, "c", None, None, push("c"));
        assert_eq!(sched.next_due(), Some(5));

        drain(&mut sched, &mut log, 7);
        assert_eq!(log, vec!["a"]);
        drain(&mut sched, &mut log, 10);
        assert_eq!(log, vec!["a", "b", "c"]);
        assert!(sched.is_empty());
    }

    #[test]
    fn test_cancel() {
        let mut sched = Scheduler::new();
        let mut log = Log::new();
        let id = sched.schedule(5, "a", None, None, push("a"));
        assert!(sched.is_pending(id));
        assert!(sched.cancel(id));
        assert!(!sched.cancel(id));
        drain(&mut sched, &mut log, 10);
        assert!(log.is_empty());
    }

    #[test]
    fn test_repeat_until_cancelled_while_firing() {
        let mut sched = Scheduler::new();
        let mut log = Log::new();
        let id = sched.schedule(10, "tick", Some(10), None, push("tick"));

        drain(&mut sched, &mut log, 35);
        assert_eq!(log.len(), 3);
        assert_eq!(sched.next_due(), Some(40));

        let mut due = sched.pop_due(40).unwrap();
        due.run(&mut log).unwrap();
        assert!(sched.cancel(id));
        sched.finish(due);
        assert!(sched.is_empty());
    }

    #[test]
    fn test_cancel_owned_by() {
        let mut sched = Scheduler::new();
        sched.schedule(5, "a", None, Some(NodeId(1)), push("a"));
        sched.schedule(6, "b", None, Some(NodeId(2)), push("b"));
        sched.schedule(7, "c", Some(5), Some(NodeId(1)), push("c"));
        assert_eq!(sched.cancel_owned_by(NodeId(1)), 2);
        assert_eq!(sched.len(), 1);
    }
}

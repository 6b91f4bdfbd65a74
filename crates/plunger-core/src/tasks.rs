//! Cooperative tasks
//!
//! Everything that suspends (waiting for an event, a timer or a device reply)
//! runs as a task on the runtime's single-threaded pool. Tasks never hold the
//! machine across a suspension point: they reach it through a `MachineHandle`
//! and only between awaits.

use crate::bus::Flow;
use crate::event::Event;
use crate::machine::Machine;
use crate::time::Time;
use crate::{Error, NodeId, Result};
use futures::channel::oneshot;
use futures::executor::LocalSpawner;
use futures::future::{FutureExt, LocalBoxFuture};
use futures::task::LocalSpawnExt;
use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::rc::{Rc, Weak};
use tracing::{debug, trace};

/// Bounded registry of in-flight tasks
pub struct TaskRegistry {
    spawner: LocalSpawner,
    pending: Rc<Cell<usize>>,
    limit: usize,
}

impl TaskRegistry {
    pub(crate) fn new(spawner: LocalSpawner, limit: usize) -> Self {
        Self {
            spawner,
            pending: Rc::new(Cell::new(0)),
            limit,
        }
    }

    /// Tasks spawned and not yet finished
    pub fn pending(&self) -> usize {
        self.pending.get()
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Queue a task on the pool; it first runs when the runtime settles
    pub fn spawn(&self, label: String, task: LocalBoxFuture<'static, ()>) -> Result<()> {
        if self.pending.get() >= self.limit {
            return Err(Error::TooManyTasks(self.limit));
        }
        self.pending.set(self.pending.get() + 1);
        let counter = self.pending.clone();
        let name = label.clone();
        self.spawner
            .spawn_local(async move {
                task.await;
                counter.set(counter.get().saturating_sub(1));
                trace!(task = %name, "task finished");
            })
            .map_err(|e| {
                self.pending.set(self.pending.get().saturating_sub(1));
                Error::Handler(format!("spawn {}: {}", label, e))
            })
    }
}

/// Weak access to the machine from inside a task
#[derive(Clone)]
pub struct MachineHandle(pub(crate) Weak<RefCell<Machine>>);

impl MachineHandle {
    /// Run `f` with the machine
    ///
    /// Fails when the runtime is gone or the machine is already borrowed
    /// (a task may not re-enter a running handler).
    pub fn with<R>(&self, f: impl FnOnce(&mut Machine) -> R) -> Result<R> {
        let machine = self.0.upgrade().ok_or(Error::MachineUnavailable)?;
        let mut guard = machine.try_borrow_mut().map_err(|_| Error::MachineUnavailable)?;
        Ok(f(&mut guard))
    }
}

/// Exclusive turn granted by `wait_turn`; the next waiter is served once dropped
#[derive(Debug)]
pub struct Turn {
    priority: i64,
    busy: Rc<Cell<bool>>,
}

impl Turn {
    pub fn priority(&self) -> i64 {
        self.priority
    }
}

impl Drop for Turn {
    fn drop(&mut self) {
        self.busy.set(false);
    }
}

/// Waiters for a turn, served lowest priority first
#[derive(Default)]
pub(crate) struct TurnQueue {
    waiting: BTreeMap<i64, oneshot::Sender<Turn>>,
    busy: Rc<Cell<bool>>,
}

impl TurnQueue {
    pub(crate) fn is_waiting(&self, priority: i64) -> bool {
        self.waiting.contains_key(&priority)
    }

    /// Hand out the next turn if none is held; returns true if one was granted
    pub(crate) fn grant(&mut self) -> bool {
        while !self.busy.get() {
            let Some((priority, sender)) = self.waiting.pop_first() else {
                return false;
            };
            self.busy.set(true);
            let turn = Turn {
                priority,
                busy: self.busy.clone(),
            };
            match sender.send(turn) {
                Ok(()) => {
                    trace!(priority, "turn granted");
                    return true;
                }
                // dropping the returned turn clears `busy`
                Err(_) => trace!(priority, "turn waiter gone"),
            }
        }
        false
    }
}

fn cancelled<T>(what: &'static str) -> impl FnOnce(std::result::Result<T, oneshot::Canceled>) -> Result<T> {
    move |r| r.map_err(|_| Error::Cancelled(what.into()))
}

/// Listener sending the first matching event into `tx`
///
/// The predicate also matches once the receiver is gone, so a dropped waiter
/// is removed by the next publish instead of lingering.
fn forward_once(
    tx: oneshot::Sender<Event>,
    predicate: impl Fn(&Event) -> bool + 'static,
) -> (
    impl Fn(&Event) -> bool + 'static,
    impl Fn(&mut Machine, &Event) -> Result<Flow> + 'static,
) {
    let slot = Rc::new(RefCell::new(Some(tx)));
    let watched = slot.clone();
    let matches = move |event: &Event| {
        let gone = watched.borrow().as_ref().map_or(true, |tx| tx.is_canceled());
        gone || predicate(event)
    };
    let deliver = move |_: &mut Machine, event: &Event| -> Result<Flow> {
        if let Some(tx) = slot.borrow_mut().take() {
            if tx.send(event.clone()).is_err() {
                trace!("waiter dropped");
            }
        }
        Ok(Flow::Remove)
    };
    (matches, deliver)
}

impl Machine {
    /// Queue a task on the runtime pool; failures are logged
    pub fn spawn_task(&mut self, label: impl Into<String>, task: LocalBoxFuture<'static, ()>) {
        let label = label.into();
        if let Err(e) = self.tasks.spawn(label.clone(), task) {
            tracing::error!(task = %label, error = %e, "task not spawned");
        }
    }

    pub fn tasks(&self) -> &TaskRegistry {
        &self.tasks
    }

    /// Resolve with the next published event matching `predicate`
    ///
    /// Dropping the future unsubscribes on the next publish.
    pub fn wait_for(
        &mut self,
        predicate: impl Fn(&Event) -> bool + 'static,
    ) -> LocalBoxFuture<'static, Result<Event>> {
        let (tx, rx) = oneshot::channel();
        let (predicate, handler) = forward_once(tx, predicate);
        self.bus.subscribe(predicate, handler);
        rx.map(cancelled("wait_for")).boxed_local()
    }

    /// Like `wait_for`, delivered through the node; fails with `Cancelled`
    /// if the node ends first
    pub fn wait_for_on(
        &mut self,
        node: NodeId,
        predicate: impl Fn(&Event) -> bool + 'static,
    ) -> LocalBoxFuture<'static, Result<Event>> {
        let (tx, rx) = oneshot::channel();
        let (predicate, handler) = forward_once(tx, predicate);
        self.listen(node, predicate, handler);
        rx.map(cancelled("wait_for_on")).boxed_local()
    }

    /// Resolve `ms` milliseconds of machine time from now
    pub fn sleep(&mut self, ms: Time) -> LocalBoxFuture<'static, Result<()>> {
        let (tx, rx) = oneshot::channel();
        let mut slot = Some(tx);
        self.call_in(ms, "sleep", move |_| {
            if let Some(tx) = slot.take() {
                let _ = tx.send(());
            }
            Ok(())
        });
        rx.map(cancelled("sleep")).boxed_local()
    }

    /// `sleep` owned by a node; fails with `Cancelled` if the node ends first
    pub fn sleep_for(&mut self, node: NodeId, ms: Time) -> LocalBoxFuture<'static, Result<()>> {
        let (tx, rx) = oneshot::channel();
        let mut slot = Some(tx);
        self.call_in_for(node, ms, "sleep", move |_| {
            if let Some(tx) = slot.take() {
                let _ = tx.send(());
            }
            Ok(())
        });
        rx.map(cancelled("sleep")).boxed_local()
    }

    /// Wait for an exclusive turn
    ///
    /// Turns are handed out when the outermost publish returns, lowest
    /// priority first, one at a time.
    ///
    /// # Panics
    ///
    /// Panics if another task already waits with the same priority.
    pub fn wait_turn(&mut self, priority: i64) -> LocalBoxFuture<'static, Result<Turn>> {
        match self.try_turn(priority) {
            Some(turn) => turn,
            None => panic!("a task already waits for turn priority {}", priority),
        }
    }

    /// `wait_turn` that returns `None` when the priority is already taken
    pub fn try_turn(&mut self, priority: i64) -> Option<LocalBoxFuture<'static, Result<Turn>>> {
        if self.turns.is_waiting(priority) {
            return None;
        }
        let (tx, rx) = oneshot::channel();
        self.turns.waiting.insert(priority, tx);
        debug!(priority, "turn requested");
        Some(rx.map(cancelled("turn")).boxed_local())
    }

    pub(crate) fn grant_turn(&mut self) -> bool {
        self.turns.grant()
    }
}

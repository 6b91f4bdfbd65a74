//! The machine context
//!
//! `Machine` owns every component of the control core: clock, event bus,
//! reactive state, timer queue, node arena, switch registry and actuator bank.
//! The behavior of each component lives next to its data (`bus`, `state`,
//! `tree`, `outputs`, `switches`, `actuator`); this module wires them together
//! and numbers the events.

use crate::actuator::ActuatorBank;
use crate::bus::{self, BusHost, EventBus};
use crate::config::{MachineConfig, SwitchConfig};
use crate::event::{Event, EventKind};
use crate::outputs::OutputBindings;
use crate::scheduler::Scheduler;
use crate::state::StateStore;
use crate::tasks::{TaskRegistry, TurnQueue};
use crate::time::{Clock, ClockMode, Time};
use crate::transport::Transport;
use crate::tree::{Node, NodeSpec};
use crate::{FieldRef, NodeId, ObjectId, Result, SwitchId, TimerId, Value, ValueMap};
use futures::executor::LocalSpawner;
use futures::future::LocalBoxFuture;
use indexmap::IndexMap;
use tracing::{debug, error, info, trace};

/// Name of the node every behavior hangs under
pub const ROOT_NAME: &str = "machine";

/// Control core state
pub struct Machine {
    pub(crate) config: MachineConfig,
    pub(crate) clock: Clock,
    pub(crate) bus: EventBus<Machine>,
    pub(crate) state: StateStore,
    pub(crate) scheduler: Scheduler<Machine>,
    pub(crate) nodes: IndexMap<NodeId, Node>,
    pub(crate) next_node: u64,
    pub(crate) next_listener: u64,
    pub(crate) root: NodeId,
    pub(crate) switches: IndexMap<SwitchId, SwitchConfig>,
    pub(crate) actuators: ActuatorBank,
    pub(crate) tasks: TaskRegistry,
    pub(crate) turns: TurnQueue,
    next_seq: u64,
}

impl Machine {
    /// Build a machine from configuration
    ///
    /// The root node is created and started, its outputs default to the
    /// configured initial values, and every switch and actuator is registered.
    pub(crate) fn new(
        config: MachineConfig,
        transport: Box<dyn Transport>,
        mode: ClockMode,
        spawner: LocalSpawner,
    ) -> Self {
        let tasks = TaskRegistry::new(spawner, config.max_pending_tasks);
        let mut machine = Self {
            clock: Clock::with_mode(mode),
            bus: EventBus::new(),
            state: StateStore::new(),
            scheduler: Scheduler::new(),
            nodes: IndexMap::new(),
            next_node: 0,
            next_listener: 0,
            root: NodeId(0),
            switches: IndexMap::new(),
            actuators: ActuatorBank::new(transport),
            tasks,
            turns: TurnQueue::default(),
            next_seq: 0,
            config,
        };

        let root = machine.create_node(NodeSpec::named(ROOT_NAME));
        machine.root = root;
        machine
            .bus
            .subscribe(|_| true, move |m: &mut Machine, e: &Event| {
                m.dispatch(root, e);
                Ok(bus::Flow::Keep)
            });
        machine.declare(ObjectId::Clock, "time", 0u64);

        let defaults = machine
            .config
            .actuators
            .iter()
            .map(|a| (a.key.clone(), a.initial.clone()))
            .chain(machine.config.outputs.iter().map(|o| (o.key.clone(), o.initial.clone())))
            .fold(OutputBindings::new(), |b, (key, initial)| b.constant(key, initial));
        if !defaults.is_empty() {
            machine.bind_outputs(root, defaults);
        }
        machine.start(root);

        for switch in machine.config.switches.clone() {
            machine.add_switch(switch);
        }
        for actuator in machine.config.actuators.clone() {
            machine.add_actuator(actuator);
        }
        info!(
            mode = ?mode,
            switches = machine.switches.len(),
            actuators = machine.config.actuators.len(),
            "machine ready"
        );
        machine
    }

    pub fn config(&self) -> &MachineConfig {
        &self.config
    }

    pub fn clock(&self) -> &Clock {
        &self.clock
    }

    /// Current machine time; not tracked
    pub fn now(&self) -> Time {
        self.clock.now()
    }

    /// Current machine time, recorded as a dependency of the running evaluation
    pub fn now_tracked(&self) -> Time {
        self.state.record(&FieldRef::clock());
        self.clock.now()
    }

    /// Sequence number of the last event published
    pub fn last_seq(&self) -> u64 {
        self.next_seq
    }

    /// Publish an event stamped with the next sequence number and the current time
    pub fn emit(&mut self, kind: EventKind) {
        self.next_seq += 1;
        let event = Event::new(self.next_seq, self.clock.now(), kind);
        bus::publish(self, event);
    }

    pub fn emit_custom(&mut self, name: impl Into<String>) {
        self.emit_custom_with(name, ValueMap::new());
    }

    pub fn emit_custom_with(&mut self, name: impl Into<String>, params: ValueMap) {
        self.emit(EventKind::Custom {
            name: name.into(),
            params,
        });
    }

    /// Buffer published events until the matching `release`
    pub fn hold(&mut self) {
        self.bus.hold();
    }

    /// Leave one hold level; the outermost release delivers the buffered events
    pub fn release(&mut self) {
        bus::release(self);
    }

    /// Register a bus listener; it sees every event after the node tree
    pub fn subscribe(
        &mut self,
        predicate: impl Fn(&Event) -> bool + 'static,
        handler: impl Fn(&mut Machine, &Event) -> Result<bus::Flow> + 'static,
    ) -> crate::SubscriptionId {
        self.bus.subscribe(predicate, handler)
    }

    pub fn unsubscribe(&mut self, id: crate::SubscriptionId) -> bool {
        self.bus.cancel(id)
    }

    /// Move the clock forward and publish the time change
    pub(crate) fn set_time(&mut self, t: Time) {
        let before = self.clock.now();
        if !self.clock.set(t) {
            return;
        }
        trace!(from = before, to = t, "time advanced");
        if let Err(e) = self.set(&FieldRef::clock(), t) {
            error!(error = %e, "clock field missing");
        }
    }

    /// Run `callback` at absolute time `at` (not before the next drain)
    pub fn call_at(
        &mut self,
        at: Time,
        label: impl Into<String>,
        callback: impl FnMut(&mut Machine) -> Result<()> + 'static,
    ) -> TimerId {
        let at = at.max(self.now());
        self.scheduler.schedule(at, label, None, None, Box::new(callback))
    }

    /// Run `callback` after `delay` milliseconds
    pub fn call_in(
        &mut self,
        delay: Time,
        label: impl Into<String>,
        callback: impl FnMut(&mut Machine) -> Result<()> + 'static,
    ) -> TimerId {
        let at = self.now() + delay;
        self.scheduler.schedule(at, label, None, None, Box::new(callback))
    }

    /// Run `callback` every `interval` milliseconds until cancelled
    pub fn call_every(
        &mut self,
        interval: Time,
        label: impl Into<String>,
        callback: impl FnMut(&mut Machine) -> Result<()> + 'static,
    ) -> TimerId {
        let at = self.now() + interval.max(1);
        self.scheduler
            .schedule(at, label, Some(interval), None, Box::new(callback))
    }

    pub fn cancel_timer(&mut self, id: TimerId) -> bool {
        self.scheduler.cancel(id)
    }

    pub fn pending_timers(&self) -> usize {
        self.scheduler.len()
    }

    pub fn next_due(&self) -> Option<Time> {
        self.scheduler.next_due()
    }

    /// Fire the earliest timer due at or before `until`
    ///
    /// The clock is moved to the timer's due time first. Returns false when
    /// nothing was due.
    pub(crate) fn fire_next_due(&mut self, until: Time) -> bool {
        let Some(mut due) = self.scheduler.pop_due(until) else {
            return false;
        };
        self.set_time(due.at);
        debug!(timer = due.id.0, label = %due.label, at = due.at, "timer fired");
        if let Err(e) = due.run(self) {
            error!(timer = due.id.0, label = %due.label, error = %e, "timer callback failed");
        }
        self.scheduler.finish(due);
        true
    }

    /// Read a field without recording it
    pub fn peek(&self, field: &FieldRef) -> Option<&Value> {
        self.state.peek(field)
    }
}

impl BusHost for Machine {
    fn bus(&mut self) -> &mut EventBus<Self> {
        &mut self.bus
    }

    fn spawn_pending(&mut self, label: String, task: LocalBoxFuture<'static, ()>) {
        self.spawn_task(label, task);
    }

    fn after_publish(&mut self) {
        self.grant_turn();
    }
}

impl std::fmt::Debug for Machine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Machine")
            .field("now", &self.clock.now())
            .field("nodes", &self.nodes.len())
            .field("listeners", &self.bus.len())
            .field("timers", &self.scheduler.len())
            .field("tasks", &self.tasks.pending())
            .finish()
    }
}

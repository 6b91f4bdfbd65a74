//! Actuator commit layer
//!
//! One record per physical output maps the resolved root value (desired) onto
//! a confirmed device state (actual). A device may confirm, ask to be retried
//! later, or fault; at most one retry timer is pending per actuator and it is
//! always cancelled before a new attempt.
//!
//! Pulsed actuators (momentary, escalating) never confirm a truthy value:
//! while the desired value stays truthy they keep re-firing, spaced by their
//! minimum spacing. All pulsed actuators share one firing window so that no
//! two coils are energized at once.

use crate::bus::Flow;
use crate::config::{ActuatorConfig, ActuatorKind};
use crate::event::EventKind;
use crate::machine::Machine;
use crate::time::Time;
use crate::transport::{DeviceCommand, DeviceFault, DeviceReply, DeviceRequest, SetOutcome, Transport};
use crate::{Error, FieldRef, ObjectId, OutputKey, Result, TimerId, Value};
use futures::future::FutureExt;
use indexmap::IndexMap;
use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;
use tracing::{debug, info, trace, warn};

/// Slack added to spacing-derived retry delays so the retry lands after the window
const RETRY_SLACK_MS: u64 = 3;

/// Commit state of an actuator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActuatorPhase {
    /// actual == desired
    Idle,
    /// actual != desired, nothing scheduled
    Pending,
    /// actual != desired, retry timer pending
    Retrying,
}

/// Per-output commit record
#[derive(Debug)]
pub struct Actuator {
    key: OutputKey,
    kind: ActuatorKind,
    initial: Value,
    desired: Value,
    actual: Value,
    retry: Option<TimerId>,
    in_flight: Option<u64>,
    attempts: u64,
    last_actual_change: Option<Time>,
    last_fired: Option<Time>,
    fire_count: u64,
    step: u32,
    change_attempts: u64,
    pending: Value,
}

impl Actuator {
    fn new(config: ActuatorConfig) -> Self {
        Self {
            key: config.key,
            kind: config.kind,
            desired: config.initial.clone(),
            actual: config.initial.clone(),
            pending: config.initial.clone(),
            initial: config.initial,
            retry: None,
            in_flight: None,
            attempts: 0,
            last_actual_change: None,
            last_fired: None,
            fire_count: 0,
            step: 0,
            change_attempts: 0,
        }
    }

    pub fn key(&self) -> &OutputKey {
        &self.key
    }

    pub fn kind(&self) -> &ActuatorKind {
        &self.kind
    }

    pub fn desired(&self) -> &Value {
        &self.desired
    }

    pub fn actual(&self) -> &Value {
        &self.actual
    }

    /// Device calls issued so far
    pub fn attempts(&self) -> u64 {
        self.attempts
    }

    pub fn fire_count(&self) -> u64 {
        self.fire_count
    }

    pub fn last_fired(&self) -> Option<Time> {
        self.last_fired
    }

    pub fn last_actual_change(&self) -> Option<Time> {
        self.last_actual_change
    }

    pub fn retry_pending(&self) -> bool {
        self.retry.is_some()
    }

    pub fn phase(&self) -> ActuatorPhase {
        if self.desired == self.actual {
            ActuatorPhase::Idle
        } else if self.retry.is_some() {
            ActuatorPhase::Retrying
        } else {
            ActuatorPhase::Pending
        }
    }

    fn min_spacing(&self) -> u64 {
        match self.kind {
            ActuatorKind::Plain => 0,
            ActuatorKind::Momentary { min_spacing_ms, .. } => min_spacing_ms,
            ActuatorKind::Escalating { min_spacing_ms, .. } => min_spacing_ms,
        }
    }

    /// Pulse length for a fire at `now`; resets the escalation after a quiet period
    fn pulse_length(&mut self, now: Time) -> u64 {
        match self.kind {
            ActuatorKind::Plain => 0,
            ActuatorKind::Momentary { pulse_ms, .. } => pulse_ms,
            ActuatorKind::Escalating {
                initial_ms,
                max_ms,
                steps,
                reset_after_ms,
                ..
            } => {
                let quiet = match self.last_fired {
                    None => true,
                    Some(last) => now > last + reset_after_ms,
                };
                if quiet {
                    self.step = 0;
                }
                let span = max_ms.saturating_sub(initial_ms);
                initial_ms + span * self.step as u64 / (steps.max(2) as u64 - 1)
            }
        }
    }

    fn after_fire(&mut self, now: Time) {
        self.last_fired = Some(now);
        self.fire_count += 1;
        if let ActuatorKind::Escalating { steps, .. } = self.kind {
            if self.step + 1 < steps {
                self.step += 1;
            }
        }
    }
}

struct Completion {
    key: OutputKey,
    attempt: u64,
    value: Value,
    pulse: Option<u64>,
    result: std::result::Result<SetOutcome, DeviceFault>,
}

/// Every actuator plus the transport and the shared firing window
pub struct ActuatorBank {
    actuators: IndexMap<OutputKey, Actuator>,
    firing_until: Option<Time>,
    transport: Box<dyn Transport>,
    completions: Rc<RefCell<VecDeque<Completion>>>,
}

impl ActuatorBank {
    pub(crate) fn new(transport: Box<dyn Transport>) -> Self {
        Self {
            actuators: IndexMap::new(),
            firing_until: None,
            transport,
            completions: Rc::new(RefCell::new(VecDeque::new())),
        }
    }

    pub fn get(&self, key: &OutputKey) -> Option<&Actuator> {
        self.actuators.get(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Actuator> {
        self.actuators.values()
    }

    /// End of the current shared firing window
    pub fn firing_until(&self) -> Option<Time> {
        self.firing_until
    }

    fn record_mut(&mut self, key: &OutputKey) -> Result<&mut Actuator> {
        self.actuators
            .get_mut(key)
            .ok_or_else(|| Error::UnknownActuator(key.clone()))
    }
}

fn field(key: &OutputKey, name: &str) -> FieldRef {
    FieldRef::new(ObjectId::Actuator(key.clone()), name)
}

impl Machine {
    /// Register an actuator and follow the root's resolved value for its key
    pub(crate) fn add_actuator(&mut self, config: ActuatorConfig) {
        let key = config.key.clone();
        let object = ObjectId::Actuator(key.clone());
        self.declare(object.clone(), "desired", config.initial.clone());
        self.declare(object.clone(), "actual", config.initial.clone());
        self.declare(object, "last_actual_change", Value::Null);
        debug!(%key, kind = ?config.kind, "actuator registered");
        self.actuators.actuators.insert(key.clone(), Actuator::new(config));

        let root = self.root;
        let watched = key.clone();
        self.bus.subscribe(
            move |e| matches!(&e.kind, EventKind::OutputChanged { node, key, .. } if *node == root && *key == watched),
            move |m, e| {
                if let EventKind::OutputChanged { value, .. } = &e.kind {
                    m.request_output(&key, value.clone())?;
                }
                Ok(Flow::Keep)
            },
        );
    }

    pub fn actuators(&self) -> &ActuatorBank {
        &self.actuators
    }

    pub fn actuator(&self, key: &OutputKey) -> Option<&Actuator> {
        self.actuators.get(key)
    }

    /// A resolved root value arrived; commit it now or after the settle delay
    fn request_output(&mut self, key: &OutputKey, value: Option<Value>) -> Result<()> {
        let debounce = self.config.settle_debounce_ms;
        let record = self.actuators.record_mut(key)?;
        let value = value.unwrap_or_else(|| record.initial.clone());
        if debounce == 0 {
            return self.try_set(key, value);
        }
        record.change_attempts += 1;
        record.pending = value;
        let attempt = record.change_attempts;
        let k = key.clone();
        self.call_in(debounce, format!("settle {}", key), move |m| {
            m.settle_output(&k, attempt)
        });
        Ok(())
    }

    fn settle_output(&mut self, key: &OutputKey, attempt: u64) -> Result<()> {
        let record = self.actuators.record_mut(key)?;
        if record.change_attempts != attempt {
            trace!(%key, attempt, "settle superseded");
            return Ok(());
        }
        let value = record.pending.clone();
        self.try_set(key, value)
    }

    /// Make `value` the desired state of an actuator and try to commit it
    pub fn try_set(&mut self, key: &OutputKey, value: impl Into<Value>) -> Result<()> {
        let value = value.into();
        let record = self.actuators.record_mut(key)?;
        record.desired = value.clone();
        self.set(&field(key, "desired"), value)?;
        self.commit(key)
    }

    /// One commit attempt: cancel any retry, then call the device unless settled
    fn commit(&mut self, key: &OutputKey) -> Result<()> {
        let now = self.now();
        let record = self.actuators.record_mut(key)?;
        if let Some(timer) = record.retry.take() {
            self.scheduler.cancel(timer);
        }
        if record.desired == record.actual {
            return Ok(());
        }
        if record.in_flight.is_some() {
            trace!(%key, "device call in flight");
            return Ok(());
        }
        let desired = record.desired.clone();
        let pulsed = record.kind.is_pulsed();

        let command = if !pulsed {
            DeviceCommand::Set(desired.clone())
        } else if !desired.is_truthy() {
            self.confirm(key, desired)?;
            return Ok(());
        } else {
            match self.open_firing_window(key, now)? {
                Ok(ms) => DeviceCommand::Pulse { ms },
                Err(wait) => {
                    trace!(%key, wait, "fire deferred");
                    self.schedule_retry(key, wait)?;
                    return Ok(());
                }
            }
        };

        let pulse = match command {
            DeviceCommand::Pulse { ms } => {
                info!(%key, ms, "fire");
                self.emit(EventKind::ActuatorFired {
                    key: key.clone(),
                    pulse_ms: ms,
                });
                Some(ms)
            }
            DeviceCommand::Set(_) => {
                debug!(%key, value = %desired, "try set");
                None
            }
        };

        let request = DeviceRequest {
            key: key.clone(),
            command,
            at: now,
        };
        let record = self.actuators.record_mut(key)?;
        record.attempts += 1;
        let attempt = record.attempts;
        match self.actuators.transport.set_device(&request) {
            DeviceReply::Ready(result) => self.apply_outcome(key, desired, pulse, result),
            DeviceReply::Pending(reply) => {
                let queue = self.actuators.completions.clone();
                let k = key.clone();
                let task = async move {
                    let result = reply.await;
                    queue.borrow_mut().push_back(Completion {
                        key: k,
                        attempt,
                        value: desired,
                        pulse,
                        result,
                    });
                }
                .boxed_local();
                match self.tasks.spawn(format!("set {}", key), task) {
                    Ok(()) => {
                        self.actuators.record_mut(key)?.in_flight = Some(attempt);
                        Ok(())
                    }
                    Err(e) => {
                        // the reply is lost with the task; treat it like a fault
                        let ms = self.config.default_retry_ms;
                        warn!(%key, error = %e, retry_ms = ms, "device reply dropped");
                        self.schedule_retry(key, ms)
                    }
                }
            }
        }
    }

    /// Claim the shared firing window for a pulse at `now`
    ///
    /// Returns the pulse length, or how long to wait before trying again.
    fn open_firing_window(&mut self, key: &OutputKey, now: Time) -> Result<std::result::Result<u64, u64>> {
        let guard = self.config.pulse_guard_ms;
        let bank = &mut self.actuators;
        let record = bank
            .actuators
            .get_mut(key)
            .ok_or_else(|| Error::UnknownActuator(key.clone()))?;
        let spacing = record.min_spacing();
        if let Some(last) = record.last_fired {
            if now < last + spacing {
                return Ok(Err(last + spacing - now + RETRY_SLACK_MS));
            }
        }
        if let Some(until) = bank.firing_until {
            if now <= until {
                return Ok(Err(until - now + 1));
            }
            bank.firing_until = None;
        }
        let ms = record.pulse_length(now);
        record.after_fire(now);
        bank.firing_until = Some(now + ms + guard);
        Ok(Ok(ms))
    }

    fn apply_outcome(
        &mut self,
        key: &OutputKey,
        value: Value,
        pulse: Option<u64>,
        result: std::result::Result<SetOutcome, DeviceFault>,
    ) -> Result<()> {
        match result {
            Ok(SetOutcome::Confirmed) => match pulse {
                Some(ms) => {
                    let spacing = self.actuators.record_mut(key)?.min_spacing();
                    self.schedule_retry(key, ms + spacing + RETRY_SLACK_MS)
                }
                None => self.confirm(key, value),
            },
            Ok(SetOutcome::RetryAfter(ms)) => {
                debug!(%key, ms, "device asked for retry");
                self.schedule_retry(key, ms)
            }
            Err(fault) => {
                let ms = self.config.default_retry_ms;
                warn!(%key, value = %value, error = %fault, retry_ms = ms, "device fault");
                self.schedule_retry(key, ms)
            }
        }
    }

    fn confirm(&mut self, key: &OutputKey, value: Value) -> Result<()> {
        let now = self.now();
        let record = self.actuators.record_mut(key)?;
        if record.actual == value {
            return Ok(());
        }
        record.actual = value.clone();
        record.last_actual_change = Some(now);
        info!(%key, value = %value, "output confirmed");
        self.set(&field(key, "actual"), value)?;
        self.set(&field(key, "last_actual_change"), now)?;
        Ok(())
    }

    /// Schedule the single retry of an actuator; a pending one is kept
    fn schedule_retry(&mut self, key: &OutputKey, ms: u64) -> Result<()> {
        let now = self.now();
        let record = self.actuators.record_mut(key)?;
        if record.retry.is_some() {
            trace!(%key, "retry already pending");
            return Ok(());
        }
        let k = key.clone();
        let label = format!("retry {} to {}", key, record.desired);
        let timer = self
            .scheduler
            .schedule(now + ms, label, None, None, Box::new(move |m: &mut Machine| m.commit(&k)));
        record.retry = Some(timer);
        Ok(())
    }

    /// Apply device replies that completed asynchronously; returns how many
    pub(crate) fn apply_completions(&mut self) -> usize {
        let mut applied = 0;
        loop {
            let next = self.actuators.completions.borrow_mut().pop_front();
            let Some(done) = next else {
                break;
            };
            applied += 1;
            let Ok(record) = self.actuators.record_mut(&done.key) else {
                continue;
            };
            if record.in_flight == Some(done.attempt) {
                record.in_flight = None;
            }
            let key = done.key.clone();
            if let Err(e) = self
                .apply_outcome(&key, done.value, done.pulse, done.result)
                .and_then(|_| self.commit_if_stale(&key))
            {
                warn!(%key, error = %e, "applying device reply failed");
            }
        }
        applied
    }

    /// Re-commit after an async reply if the desired value moved meanwhile
    fn commit_if_stale(&mut self, key: &OutputKey) -> Result<()> {
        let record = self.actuators.record_mut(key)?;
        if record.desired != record.actual && record.retry.is_none() && record.in_flight.is_none() {
            return self.commit(key);
        }
        Ok(())
    }
}

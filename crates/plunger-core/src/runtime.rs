//! Runtime driver
//!
//! The runtime owns the machine and the single-threaded task pool. Nothing
//! moves time forward except the runtime: in virtual mode through
//! `advance_to`, in real-time mode by sampling the wall clock once per tick.
//! Between every step the runtime settles: it runs ready tasks and applies
//! asynchronous device replies until no more work is produced, so an event has
//! fully rippled through before time moves again.

use crate::config::MachineConfig;
use crate::machine::Machine;
use crate::tasks::MachineHandle;
use crate::time::{ClockMode, Time};
use crate::transport::{NullTransport, Transport};
use crate::{Error, Result, SwitchId};
use futures::executor::LocalPool;
use std::cell::RefCell;
use std::rc::Rc;
use std::time::{Duration, Instant};
use tracing::{debug, info, trace};

/// Owner of a machine and its task pool
pub struct Runtime {
    pub(crate) machine: Rc<RefCell<Machine>>,
    pool: LocalPool,
}

impl Runtime {
    /// Create a runtime
    ///
    /// # Panics
    ///
    /// Panics if `config` fails `MachineConfig::validate`, e.g. when two
    /// actuators share a key.
    pub fn new(config: MachineConfig, transport: impl Transport + 'static, mode: ClockMode) -> Self {
        if let Err(e) = config.validate() {
            panic!("invalid machine configuration: {}", e);
        }
        let pool = LocalPool::new();
        let machine = Machine::new(config, Box::new(transport), mode, pool.spawner());
        let mut runtime = Self {
            machine: Rc::new(RefCell::new(machine)),
            pool,
        };
        runtime.settle();
        runtime
    }

    /// Runtime whose clock only moves through `advance_to`
    pub fn virtual_time(config: MachineConfig, transport: impl Transport + 'static) -> Self {
        Self::new(config, transport, ClockMode::Virtual)
    }

    /// Runtime following the wall clock
    pub fn realtime(config: MachineConfig, transport: impl Transport + 'static) -> Self {
        Self::new(config, transport, ClockMode::RealTime)
    }

    /// Virtual-time runtime with no switches, no actuators and a null transport
    pub fn headless() -> Self {
        Self::virtual_time(MachineConfig::default(), NullTransport)
    }

    /// Run `f` with the machine, then settle
    ///
    /// # Panics
    ///
    /// Panics if called from inside a handler or task that already holds the
    /// machine; tasks go through a `MachineHandle` instead.
    pub fn with<R>(&mut self, f: impl FnOnce(&mut Machine) -> R) -> R {
        let out = f(&mut self.machine.borrow_mut());
        self.settle();
        out
    }

    /// Weak handle for tasks
    pub fn handle(&self) -> MachineHandle {
        MachineHandle(Rc::downgrade(&self.machine))
    }

    pub fn now(&self) -> Time {
        self.machine.borrow().now()
    }

    /// Run ready tasks and apply device replies until nothing changes
    pub fn settle(&mut self) {
        loop {
            self.pool.run_until_stalled();
            let mut machine = self.machine.borrow_mut();
            let applied = machine.apply_completions();
            let granted = machine.grant_turn();
            drop(machine);
            if applied == 0 && !granted {
                break;
            }
            trace!(applied, granted, "settle pass");
        }
    }

    /// Fire every timer due up to `t` in order, settling after each, then
    /// move the clock to `t`
    ///
    /// Timers scheduled while draining are honored if they fall within `t`.
    pub fn advance_to(&mut self, t: Time) -> Result<()> {
        let now = {
            let machine = self.machine.borrow();
            if !machine.clock().is_virtual() {
                return Err(Error::NotVirtual);
            }
            machine.now()
        };
        if t < now {
            return Err(Error::TimeTravel { now, target: t });
        }
        self.drain(t);
        Ok(())
    }

    pub fn advance_by(&mut self, ms: Time) -> Result<()> {
        let target = self.now() + ms;
        self.advance_to(target)
    }

    fn drain(&mut self, until: Time) {
        self.settle();
        loop {
            let fired = self.machine.borrow_mut().fire_next_due(until);
            if !fired {
                break;
            }
            self.settle();
        }
        self.machine.borrow_mut().set_time(until);
        self.settle();
    }

    /// Report a switch transition from the sensing collaborator, then settle
    pub fn feed_switch(&mut self, id: &SwitchId, closed: bool) -> Result<bool> {
        let changed = self.machine.borrow_mut().feed_switch(id, closed)?;
        self.settle();
        Ok(changed)
    }

    /// One real-time step: sample the wall clock and drain up to it
    pub fn tick_realtime(&mut self) -> Result<Time> {
        let target = {
            let machine = self.machine.borrow();
            if machine.clock().is_virtual() {
                return Err(Error::Config("tick_realtime on a virtual clock".into()));
            }
            machine.clock().wall_elapsed().max(machine.now())
        };
        self.drain(target);
        Ok(target)
    }

    /// Tick in real time for `duration`, sleeping `tick_ms` between ticks
    pub fn run_realtime(&mut self, duration: Duration) -> Result<()> {
        let tick = Duration::from_millis(self.machine.borrow().config().tick_ms);
        let deadline = Instant::now() + duration;
        info!(?duration, ?tick, "running in real time");
        while Instant::now() < deadline {
            self.tick_realtime()?;
            std::thread::sleep(tick);
        }
        Ok(())
    }

    /// End the root node, dropping every behavior, and settle
    pub fn shutdown(&mut self) {
        let root = self.machine.borrow().root();
        self.with(|m| m.end(root));
        debug!("runtime shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::on;
    use crate::testing::Recorder;
    use crate::tree::Phase;
    use crate::{FieldRef, Value};

    #[test]
    fn test_advance_publishes_time() {
        let mut rt = Runtime::headless();
        let events = Recorder::attach(&rt);
        rt.advance_to(25).unwrap();
        assert_eq!(rt.now(), 25);
        let times = events.matching(on::change(FieldRef::clock()));
        assert_eq!(times.len(), 1);
        assert_eq!(rt.with(|m| m.peek(&FieldRef::clock()).cloned()), Some(Value::Int(25)));
    }

    #[test]
    fn test_time_travel_rejected() {
        let mut rt = Runtime::headless();
        rt.advance_to(10).unwrap();
        assert!(matches!(
            rt.advance_to(5),
            Err(Error::TimeTravel { now: 10, target: 5 })
        ));
        rt.advance_to(10).unwrap();
    }

    #[test]
    fn test_realtime_refuses_advance() {
        let mut rt = Runtime::realtime(MachineConfig::default(), NullTransport);
        assert!(matches!(rt.advance_to(10), Err(Error::NotVirtual)));
        assert!(rt.tick_realtime().is_ok());
    }

    #[test]
    fn test_timer_scheduled_while_draining_runs_in_window() {
        let mut rt = Runtime::headless();
        let log = Rc::new(RefCell::new(Vec::new()));
        let l = log.clone();
        rt.with(|m| {
            m.call_in(10, "first", move |m| {
                l.borrow_mut().push(m.now());
                let l = l.clone();
                m.call_in(5, "second", move |m| {
                    l.borrow_mut().push(m.now());
                    Ok(())
                });
                Ok(())
            });
        });
        rt.advance_to(20).unwrap();
        assert_eq!(*log.borrow(), vec![10, 15]);
    }

    #[test]
    #[should_panic(expected = "invalid machine configuration")]
    fn test_duplicate_actuator_rejected() {
        let config = MachineConfig::default()
            .with_actuator(crate::ActuatorConfig::plain("gi", true))
            .with_actuator(crate::ActuatorConfig::plain("gi", false));
        Runtime::virtual_time(config, NullTransport);
    }

    #[test]
    fn test_shutdown_ends_root() {
        let mut rt = Runtime::headless();
        rt.shutdown();
        assert_eq!(rt.with(|m| m.phase(m.root())), Phase::Ended);
    }
}

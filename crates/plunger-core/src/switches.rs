//! Switch boundary
//!
//! The switch-sensing collaborator debounces and reports transitions; the core
//! keeps one reactive object per switch and turns each transition into a
//! `Switch` event.

use crate::config::SwitchConfig;
use crate::event::EventKind;
use crate::machine::Machine;
use crate::time::Time;
use crate::{Error, FieldRef, ObjectId, Result, SwitchId, Value};
use tracing::{debug, trace};

fn closed_field(id: &SwitchId) -> FieldRef {
    FieldRef::new(ObjectId::Switch(id.clone()), "closed")
}

fn last_change_field(id: &SwitchId) -> FieldRef {
    FieldRef::new(ObjectId::Switch(id.clone()), "last_change")
}

impl Machine {
    /// Register a switch; re-registering keeps the current state
    pub fn add_switch(&mut self, config: SwitchConfig) {
        let object = ObjectId::Switch(config.id.clone());
        self.declare(object.clone(), "closed", false);
        self.declare(object, "last_change", 0u64);
        debug!(switch = %config.id, name = %config.name, "switch registered");
        self.switches.insert(config.id.clone(), config);
    }

    pub fn switch_config(&self, id: &SwitchId) -> Option<&SwitchConfig> {
        self.switches.get(id)
    }

    /// Registered switches in configuration order
    pub fn switch_ids(&self) -> impl Iterator<Item = &SwitchId> {
        self.switches.keys()
    }

    /// Apply a transition reported by the switch collaborator
    ///
    /// Returns false when the switch already was in that state; nothing is
    /// published then.
    pub fn feed_switch(&mut self, id: &SwitchId, closed: bool) -> Result<bool> {
        if !self.switches.contains_key(id) {
            return Err(Error::UnknownSwitch(id.clone()));
        }
        let field = closed_field(id);
        if self.state.peek(&field).map(Value::is_truthy) == Some(closed) {
            trace!(switch = %id, closed, "switch repeat ignored");
            return Ok(false);
        }
        let now = self.now();
        self.set(&last_change_field(id), now)?;
        self.set(&field, closed)?;
        debug!(switch = %id, closed, at = now, "switch transition");
        self.emit(EventKind::Switch {
            switch: id.clone(),
            closed,
        });
        Ok(true)
    }

    /// Current switch state; tracked
    pub fn is_closed(&self, id: &SwitchId) -> bool {
        self.get_bool(&closed_field(id))
    }

    /// Time of the last transition; tracked
    pub fn last_change(&self, id: &SwitchId) -> Option<Time> {
        self.get(&last_change_field(id))
            .and_then(Value::as_int)
            .map(|t| t as Time)
    }

    /// Closed and unchanged for at least `ms`; depends on the clock
    pub fn on_for(&self, id: &SwitchId, ms: Time) -> bool {
        self.is_closed(id) && self.held_for(id, ms)
    }

    /// Open and unchanged for at least `ms`; depends on the clock
    pub fn off_for(&self, id: &SwitchId, ms: Time) -> bool {
        !self.is_closed(id) && self.held_for(id, ms)
    }

    fn held_for(&self, id: &SwitchId, ms: Time) -> bool {
        let since = self.last_change(id).unwrap_or(0);
        self.now_tracked().saturating_sub(since) >= ms
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MachineConfig;
    use crate::event::on;
    use crate::testing::Recorder;
    use crate::Runtime;

    fn runtime() -> Runtime {
        let config = MachineConfig::default()
            .with_switch(SwitchConfig::new("start", "Start Button"))
            .with_switch(SwitchConfig::new("trough1", "Trough 1").min_on(50));
        Runtime::virtual_time(config, crate::NullTransport)
    }

    #[test]
    fn test_feed_switch_ignores_repeats() {
        let mut rt = runtime();
        let events = Recorder::attach(&rt);
        assert!(rt.feed_switch(&"start".into(), true).unwrap());
        assert!(!rt.feed_switch(&"start".into(), true).unwrap());
        assert!(rt.feed_switch(&"start".into(), false).unwrap());
        let seen = events.matching(on::switch("start"));
        assert_eq!(seen.len(), 2);
    }

    #[test]
    fn test_unknown_switch() {
        let mut rt = runtime();
        let err = rt.feed_switch(&"tilt".into(), true);
        assert!(matches!(err, Err(Error::UnknownSwitch(_))));
    }

    #[test]
    fn test_on_for_follows_clock() {
        let mut rt = runtime();
        let id = SwitchId::new("trough1");
        rt.advance_to(100).unwrap();
        rt.feed_switch(&id, true).unwrap();
        rt.with(|m| {
            assert!(m.is_closed(&id));
            assert_eq!(m.last_change(&id), Some(100));
            assert!(!m.on_for(&id, 50));
        });
        rt.advance_to(150).unwrap();
        rt.with(|m| {
            assert!(m.on_for(&id, 50));
            assert!(!m.off_for(&id, 0));
            assert_eq!(m.switch_config(&id).map(|c| c.min_on_ms), Some(50));
        });
    }
}

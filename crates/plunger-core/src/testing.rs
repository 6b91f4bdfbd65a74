//! Test helpers
//!
//! `Recorder` captures every event a runtime publishes so tests can assert on
//! what happened, in order.

use crate::bus::Flow;
use crate::event::{Event, EventKind};
use crate::runtime::Runtime;
use crate::{FieldRef, NodeId, ObjectId, OutputKey, Value};
use std::cell::RefCell;
use std::rc::Rc;

/// Bus listener that keeps a copy of every event
#[derive(Clone, Default)]
pub struct Recorder {
    events: Rc<RefCell<Vec<Event>>>,
}

impl Recorder {
    /// Subscribe to the runtime's bus; sees events published from now on
    pub fn attach(runtime: &Runtime) -> Self {
        let recorder = Self::default();
        let sink = recorder.events.clone();
        runtime.machine.borrow_mut().subscribe(
            |_| true,
            move |_, event| {
                sink.borrow_mut().push(event.clone());
                Ok(Flow::Keep)
            },
        );
        recorder
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.borrow().clone()
    }

    pub fn len(&self) -> usize {
        self.events.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.borrow().is_empty()
    }

    pub fn clear(&self) {
        self.events.borrow_mut().clear();
    }

    /// Events accepted by `predicate`
    pub fn matching(&self, predicate: impl Fn(&Event) -> bool) -> Vec<Event> {
        self.events
            .borrow()
            .iter()
            .filter(|e| predicate(e))
            .cloned()
            .collect()
    }

    /// `(field, new, old)` for every state change except the clock's
    pub fn state_changes(&self) -> Vec<(FieldRef, Value, Value)> {
        self.events
            .borrow()
            .iter()
            .filter_map(|e| match &e.kind {
                EventKind::StateChanged { field, value, old } if field.object != ObjectId::Clock => {
                    Some((field.clone(), value.clone(), old.clone()))
                }
                _ => None,
            })
            .collect()
    }

    /// Successive resolved values of `key` over `node`
    pub fn output_changes(&self, node: NodeId, key: &OutputKey) -> Vec<Option<Value>> {
        self.events
            .borrow()
            .iter()
            .filter_map(|e| match &e.kind {
                EventKind::OutputChanged {
                    node: n,
                    key: k,
                    value,
                    ..
                } if *n == node && k == key => Some(value.clone()),
                _ => None,
            })
            .collect()
    }
}

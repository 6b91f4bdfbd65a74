//! Event types delivered through the bus and the node tree

use crate::time::Time;
use crate::{FieldRef, NodeId, OutputKey, SwitchId, Value, ValueMap};
use serde::{Deserialize, Serialize};
use std::rc::Rc;

/// In-place mutation applied to an observable collection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CollectionOp {
    /// Element inserted at index (list) or added (set, index is its position)
    Insert { index: usize, value: Value },
    /// Element at index removed
    Remove { index: usize, value: Value },
    /// Element at index replaced
    Replace { index: usize, value: Value, old: Value },
    /// Map entry written
    Put { key: String, value: Value, old: Option<Value> },
    /// Map entry deleted
    Delete { key: String, old: Value },
    /// Collection emptied
    Clear,
}

/// Whether a child was attached to or detached from its parent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TreeChange {
    Attached,
    Detached,
}

/// What happened
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum EventKind {
    /// A physical switch changed state
    Switch { switch: SwitchId, closed: bool },
    /// A reactive field was replaced with a different value
    StateChanged {
        field: FieldRef,
        value: Value,
        old: Value,
    },
    /// A collection field was mutated in place (followed by `StateChanged`)
    CollectionChanged { field: FieldRef, op: CollectionOp },
    /// A node entered the Started phase
    NodeStarted { node: NodeId },
    /// A node is about to end (its children have not ended yet)
    NodeEnding { node: NodeId },
    /// A node finished ending and was detached
    NodeEnded { node: NodeId },
    /// A child was attached to or detached from `parent`
    TreeChanged {
        parent: NodeId,
        child: NodeId,
        change: TreeChange,
    },
    /// A node's own binding for `key` produced a different value
    OwnOutputChanged {
        node: NodeId,
        key: OutputKey,
        value: Option<Value>,
        old: Option<Value>,
    },
    /// The resolved value of `key` over `node`'s subtree changed
    OutputChanged {
        node: NodeId,
        key: OutputKey,
        value: Option<Value>,
        old: Option<Value>,
    },
    /// A momentary actuator was pulsed
    ActuatorFired { key: OutputKey, pulse_ms: u64 },
    /// Application-defined event
    Custom { name: String, params: ValueMap },
}

/// An immutable record of a fact, stamped when it was created
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Creation order, unique per machine
    pub seq: u64,
    /// Clock time at creation
    pub at: Time,
    pub kind: EventKind,
}

impl Event {
    /// Create an event
    pub fn new(seq: u64, at: Time, kind: EventKind) -> Self {
        Self { seq, at, kind }
    }

    /// The reactive field this event reports a change of, if any
    ///
    /// Resolved output changes map onto the `Resolved` object so bindings can
    /// depend on another subtree's outputs the same way they depend on state.
    pub fn changed_field(&self) -> Option<FieldRef> {
        match &self.kind {
            EventKind::StateChanged { field, .. } => Some(field.clone()),
            EventKind::OutputChanged { node, key, .. } => Some(FieldRef::resolved(*node, key)),
            _ => None,
        }
    }
}

/// Shared event predicate
pub type Predicate = Rc<dyn Fn(&Event) -> bool>;

/// Predicate constructors for subscriptions and waits
pub mod on {
    use super::*;

    /// Matches every event
    pub fn any() -> impl Fn(&Event) -> bool + 'static {
        |_| true
    }

    /// Any transition of a switch
    pub fn switch(id: impl Into<SwitchId>) -> impl Fn(&Event) -> bool + 'static {
        let id = id.into();
        move |e| matches!(&e.kind, EventKind::Switch { switch, .. } if *switch == id)
    }

    /// A switch closing
    pub fn switch_closed(id: impl Into<SwitchId>) -> impl Fn(&Event) -> bool + 'static {
        let id = id.into();
        move |e| matches!(&e.kind, EventKind::Switch { switch, closed: true } if *switch == id)
    }

    /// A switch opening
    pub fn switch_opened(id: impl Into<SwitchId>) -> impl Fn(&Event) -> bool + 'static {
        let id = id.into();
        move |e| matches!(&e.kind, EventKind::Switch { switch, closed: false } if *switch == id)
    }

    /// A change of one reactive field
    pub fn change(field: FieldRef) -> impl Fn(&Event) -> bool + 'static {
        move |e| matches!(&e.kind, EventKind::StateChanged { field: f, .. } if *f == field)
    }

    /// A reactive field changing to a specific value
    pub fn change_to(field: FieldRef, to: impl Into<Value>) -> impl Fn(&Event) -> bool + 'static {
        let to = to.into();
        move |e| {
            matches!(&e.kind, EventKind::StateChanged { field: f, value, .. } if *f == field && *value == to)
        }
    }

    /// A resolved output change at a node
    pub fn output_change(node: NodeId, key: impl Into<OutputKey>) -> impl Fn(&Event) -> bool + 'static {
        let key = key.into();
        move |e| {
            matches!(&e.kind, EventKind::OutputChanged { node: n, key: k, .. } if *n == node && *k == key)
        }
    }

    /// A node starting
    pub fn started(node: NodeId) -> impl Fn(&Event) -> bool + 'static {
        move |e| matches!(&e.kind, EventKind::NodeStarted { node: n } if *n == node)
    }

    /// A node finishing its end
    pub fn ended(node: NodeId) -> impl Fn(&Event) -> bool + 'static {
        move |e| matches!(&e.kind, EventKind::NodeEnded { node: n } if *n == node)
    }

    /// A momentary actuator firing
    pub fn fired(key: impl Into<OutputKey>) -> impl Fn(&Event) -> bool + 'static {
        let key = key.into();
        move |e| matches!(&e.kind, EventKind::ActuatorFired { key: k, .. } if *k == key)
    }

    /// An application event by name
    pub fn custom(name: impl Into<String>) -> impl Fn(&Event) -> bool + 'static {
        let name = name.into();
        move |e| matches!(&e.kind, EventKind::Custom { name: n, .. } if *n == name)
    }

    /// Matches when any of the predicates matches
    pub fn any_of(predicates: Vec<Predicate>) -> impl Fn(&Event) -> bool + 'static {
        move |e| predicates.iter().any(|p| p(e))
    }
}

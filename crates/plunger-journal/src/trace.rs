//! Resolved-output traces
//!
//! A trace is the sequence of root-level resolved output changes, stamped with
//! machine time. Two replays of the same recording against the same
//! configuration produce identical traces.

use plunger_core::{EventKind, Flow, OutputKey, Runtime, SubscriptionId, Time, Value};
use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::collections::BTreeSet;
use std::fmt;
use std::rc::Rc;

/// One resolved output change at the machine root
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceEntry {
    pub at: Time,
    pub key: OutputKey,
    /// `None` when no node has an opinion
    pub value: Option<Value>,
}

impl fmt::Display for TraceEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.value {
            Some(value) => write!(f, "{:>8} {} = {}", self.at, self.key, value),
            None => write!(f, "{:>8} {} = -", self.at, self.key),
        }
    }
}

/// Live capture of root output changes
pub struct OutputTrace {
    entries: Rc<RefCell<Vec<TraceEntry>>>,
    subscription: SubscriptionId,
}

impl OutputTrace {
    pub fn attach(runtime: &mut Runtime) -> Self {
        let entries = Rc::new(RefCell::new(Vec::new()));
        let sink = entries.clone();
        let subscription = runtime.with(|m| {
            let root = m.root();
            m.subscribe(
                move |e| matches!(&e.kind, EventKind::OutputChanged { node, .. } if *node == root),
                move |_, event| {
                    if let EventKind::OutputChanged { key, value, .. } = &event.kind {
                        sink.borrow_mut().push(TraceEntry {
                            at: event.at,
                            key: key.clone(),
                            value: value.clone(),
                        });
                    }
                    Ok(Flow::Keep)
                },
            )
        });
        Self {
            entries,
            subscription,
        }
    }

    pub fn entries(&self) -> Vec<TraceEntry> {
        self.entries.borrow().clone()
    }

    pub fn len(&self) -> usize {
        self.entries.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.borrow().is_empty()
    }

    /// Stop capturing and return what was seen
    pub fn finish(self, runtime: &mut Runtime) -> Trace {
        runtime.with(|m| m.unsubscribe(self.subscription));
        Trace {
            entries: self.entries.borrow().clone(),
        }
    }
}

/// Completed trace
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Trace {
    pub entries: Vec<TraceEntry>,
}

impl Trace {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Changes of one key, in order
    pub fn for_key<'a>(&'a self, key: &'a OutputKey) -> impl Iterator<Item = &'a TraceEntry> + 'a {
        self.entries.iter().filter(move |e| &e.key == key)
    }

    /// Keys that changed at least once
    pub fn keys(&self) -> BTreeSet<&OutputKey> {
        self.entries.iter().map(|e| &e.key).collect()
    }

    /// Index of the first entry where two traces disagree
    pub fn first_divergence(&self, other: &Trace) -> Option<usize> {
        let shared = self.entries.len().min(other.entries.len());
        (0..shared)
            .find(|&i| self.entries[i] != other.entries[i])
            .or_else(|| (self.entries.len() != other.entries.len()).then_some(shared))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use plunger_core::{ActuatorConfig, MachineConfig, NullTransport, OutputBindings};

    #[test]
    fn test_captures_only_root_changes() {
        let config = MachineConfig::default().with_actuator(ActuatorConfig::plain("gi", false));
        let mut rt = Runtime::virtual_time(config, NullTransport);
        let trace = OutputTrace::attach(&mut rt);
        rt.advance_to(7).unwrap();
        rt.with(|m| {
            let root = m.root();
            let game = m.create_node("game");
            let inner = m.create_node("inner");
            m.bind_outputs(game, OutputBindings::new().constant("gi", true));
            m.bind_outputs(inner, OutputBindings::new().constant("gi", true));
            m.add_child(game, inner);
            m.attach(root, game, 0);
        });
        let trace = trace.finish(&mut rt);
        assert_eq!(
            trace.entries,
            vec![TraceEntry {
                at: 7,
                key: OutputKey::new("gi"),
                value: Some(Value::Bool(true)),
            }]
        );
        assert_eq!(trace.entries[0].to_string(), "       7 gi = true");
    }

    #[test]
    fn test_first_divergence() {
        let entry = |at| TraceEntry {
            at,
            key: OutputKey::new("gi"),
            value: Some(Value::Bool(true)),
        };
        let a = Trace {
            entries: vec![entry(1), entry(2)],
        };
        let b = Trace {
            entries: vec![entry(1), entry(3)],
        };
        let c = Trace {
            entries: vec![entry(1)],
        };
        assert_eq!(a.first_divergence(&a.clone()), None);
        assert_eq!(a.first_divergence(&b), Some(1));
        assert_eq!(a.first_divergence(&c), Some(1));
    }
}

//! Output resolution
//!
//! A node binds output keys to functions. The resolved value of a key over a
//! subtree folds every declaring node's binding in (priority, discovery) order:
//! each binding sees the last defined value produced below it and may return
//! `None` to pass that value through untouched.
//!
//! Priority is a node's exclusive priority, or the nearest ancestor's, or 0.
//! Discovery is pre-order: a parent precedes its children, structural children
//! precede temporary ones.

use crate::event::{Event, EventKind};
use crate::machine::Machine;
use crate::time::Time;
use crate::{FieldRef, NodeId, ObjectId, OutputKey, Result, SwitchId, Value};
use indexmap::{IndexMap, IndexSet};
use std::collections::HashMap;
use std::rc::Rc;
use tracing::{debug, error, trace};

/// Binding that ignores the lower layers
pub type ComputeFn = Rc<dyn Fn(&Scope<'_>) -> Result<Option<Value>>>;

/// Binding that builds on the value produced by lower layers
pub type LayerFn = Rc<dyn Fn(&Scope<'_>, Option<&Value>) -> Result<Option<Value>>>;

/// A node's contribution to one output key
#[derive(Clone)]
pub enum Binding {
    /// Fixed contribution; `None` never has an opinion
    Constant(Option<Value>),
    Computed(ComputeFn),
    Layered(LayerFn),
}

impl Binding {
    pub fn constant(value: impl Into<Value>) -> Self {
        Binding::Constant(Some(value.into()))
    }

    pub fn no_opinion() -> Self {
        Binding::Constant(None)
    }

    pub fn computed(f: impl Fn(&Scope<'_>) -> Result<Option<Value>> + 'static) -> Self {
        Binding::Computed(Rc::new(f))
    }

    pub fn layered(f: impl Fn(&Scope<'_>, Option<&Value>) -> Result<Option<Value>> + 'static) -> Self {
        Binding::Layered(Rc::new(f))
    }

    /// Layered bindings are re-evaluated whenever a lower layer may have moved
    pub fn reads_previous(&self) -> bool {
        matches!(self, Binding::Layered(_))
    }
}

impl std::fmt::Debug for Binding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Binding::Constant(v) => write!(f, "Constant({:?})", v),
            Binding::Computed(_) => write!(f, "Computed"),
            Binding::Layered(_) => write!(f, "Layered"),
        }
    }
}

/// Builder for a node's output binding set
#[derive(Debug, Clone, Default)]
pub struct OutputBindings {
    bindings: IndexMap<OutputKey, Binding>,
}

impl OutputBindings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bind(mut self, key: impl Into<OutputKey>, binding: Binding) -> Self {
        self.bindings.insert(key.into(), binding);
        self
    }

    pub fn constant(self, key: impl Into<OutputKey>, value: impl Into<Value>) -> Self {
        self.bind(key, Binding::constant(value))
    }

    pub fn computed(
        self,
        key: impl Into<OutputKey>,
        f: impl Fn(&Scope<'_>) -> Result<Option<Value>> + 'static,
    ) -> Self {
        self.bind(key, Binding::computed(f))
    }

    pub fn layered(
        self,
        key: impl Into<OutputKey>,
        f: impl Fn(&Scope<'_>, Option<&Value>) -> Result<Option<Value>> + 'static,
    ) -> Self {
        self.bind(key, Binding::layered(f))
    }

    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }
}

/// Output state carried by a node
#[derive(Debug, Default)]
pub(crate) struct OutputSet {
    bindings: IndexMap<OutputKey, Binding>,
    own: IndexMap<OutputKey, Option<Value>>,
    resolved: IndexMap<OutputKey, Option<Value>>,
    deps: HashMap<FieldRef, IndexSet<OutputKey>>,
    reads: HashMap<OutputKey, IndexSet<FieldRef>>,
}

impl OutputSet {
    fn new(bindings: IndexMap<OutputKey, Binding>) -> Self {
        Self {
            bindings,
            ..Default::default()
        }
    }

    pub(crate) fn declares(&self, key: &OutputKey) -> bool {
        self.bindings.contains_key(key)
    }

    fn keys(&self) -> Vec<OutputKey> {
        self.bindings.keys().cloned().collect()
    }

    /// Replace the fields `key` depends on with those read by its latest evaluation
    fn track(&mut self, key: &OutputKey, deps: IndexSet<FieldRef>) {
        if let Some(previous) = self.reads.remove(key) {
            for field in previous.difference(&deps) {
                if let Some(keys) = self.deps.get_mut(field) {
                    keys.shift_remove(key);
                    if keys.is_empty() {
                        self.deps.remove(field);
                    }
                }
            }
        }
        for field in &deps {
            self.deps.entry(field.clone()).or_default().insert(key.clone());
        }
        self.reads.insert(key.clone(), deps);
    }

    /// Fields the last evaluation of `key` read
    #[cfg(test)]
    fn reads(&self, key: &OutputKey) -> Option<&IndexSet<FieldRef>> {
        self.reads.get(key)
    }
}

/// Read-only view handed to bindings; every read is dependency-tracked
pub struct Scope<'m> {
    machine: &'m Machine,
    node: NodeId,
}

impl<'m> Scope<'m> {
    /// Node whose binding is being evaluated
    pub fn node(&self) -> NodeId {
        self.node
    }

    pub fn get(&self, field: &FieldRef) -> Option<&'m Value> {
        self.machine.get(field)
    }

    /// Truthiness of a field, false when undeclared
    pub fn flag(&self, field: &FieldRef) -> bool {
        self.machine.get_bool(field)
    }

    /// Field on the evaluating node's own object
    pub fn own(&self, field: &str) -> Option<&'m Value> {
        self.machine.get(&FieldRef::new(ObjectId::Node(self.node), field))
    }

    pub fn now(&self) -> Time {
        self.machine.now_tracked()
    }

    /// Resolved value of another subtree
    pub fn resolved(&self, node: NodeId, key: &OutputKey) -> Option<&'m Value> {
        self.machine.resolved(node, key)
    }

    pub fn closed(&self, switch: &SwitchId) -> bool {
        self.machine.is_closed(switch)
    }

    /// Switch closed for at least `ms`
    pub fn on_for(&self, switch: &SwitchId, ms: Time) -> bool {
        self.machine.on_for(switch, ms)
    }

    /// Switch open for at least `ms`
    pub fn off_for(&self, switch: &SwitchId, ms: Time) -> bool {
        self.machine.off_for(switch, ms)
    }

    /// Confirmed device value of an actuator
    pub fn actual(&self, key: &OutputKey) -> Option<&'m Value> {
        self.machine
            .get(&FieldRef::new(ObjectId::Actuator(key.clone()), "actual"))
    }

    pub fn machine(&self) -> &'m Machine {
        self.machine
    }
}

/// One layer of a fold, for diagnostics
#[derive(Debug, Clone, PartialEq)]
pub struct Contribution {
    pub node: NodeId,
    pub priority: i64,
    pub value: Option<Value>,
}

struct Layer {
    node: NodeId,
    priority: i64,
    value: Option<Value>,
    deps: IndexSet<FieldRef>,
}

impl Machine {
    /// Install a node's output bindings; once per node
    pub fn bind_outputs(&mut self, node: NodeId, bindings: OutputBindings) {
        let n = self.node_ref(node);
        assert!(!n.is_ended(), "bind outputs on ended node {} ({})", node, n.name());
        assert!(
            n.outputs.is_none(),
            "outputs already bound on {} ({})",
            node,
            n.name()
        );
        self.node_mut(node).outputs = Some(OutputSet::new(bindings.bindings));

        for key in self.output_keys(node) {
            let Some(binding) = self.binding(node, &key) else {
                continue;
            };
            let (value, deps) = self.evaluate(node, &key, &binding, None);
            if let Some(set) = self.node_mut(node).outputs.as_mut() {
                set.track(&key, deps);
                set.own.insert(key.clone(), value.clone());
            }
            self.update_resolved(node, &key);
            self.emit(EventKind::OwnOutputChanged {
                node,
                key,
                value,
                old: None,
            });
        }
    }

    /// Keys bound by a node
    pub fn output_keys(&self, node: NodeId) -> Vec<OutputKey> {
        self.node_ref(node)
            .outputs
            .as_ref()
            .map(OutputSet::keys)
            .unwrap_or_default()
    }

    /// Resolved value of `key` over `node`'s subtree; the read is tracked
    pub fn resolved(&self, node: NodeId, key: &OutputKey) -> Option<&Value> {
        self.state.record(&FieldRef::resolved(node, key));
        self.node(node)
            .and_then(|n| n.outputs.as_ref())
            .and_then(|set| set.resolved.get(key))
            .and_then(Option::as_ref)
    }

    /// Resolved value of `key` at the machine root
    pub fn output(&self, key: &OutputKey) -> Option<&Value> {
        self.resolved(self.root, key)
    }

    /// The node's own contribution as last evaluated without lower layers
    pub fn own_output(&self, node: NodeId, key: &OutputKey) -> Option<&Value> {
        self.node(node)
            .and_then(|n| n.outputs.as_ref())
            .and_then(|set| set.own.get(key))
            .and_then(Option::as_ref)
    }

    /// Fold `key` over `node`'s subtree without caching, returning each layer
    pub fn explain(&self, node: NodeId, key: &OutputKey) -> Vec<Contribution> {
        self.fold(node, key)
            .1
            .into_iter()
            .map(|layer| Contribution {
                node: layer.node,
                priority: layer.priority,
                value: layer.value,
            })
            .collect()
    }

    fn binding(&self, node: NodeId, key: &OutputKey) -> Option<Binding> {
        self.node_ref(node)
            .outputs
            .as_ref()
            .and_then(|set| set.bindings.get(key))
            .cloned()
    }

    /// Exclusive priority of the node or its nearest ancestor claiming one
    pub fn effective_priority(&self, node: NodeId) -> i64 {
        let mut current = Some(node);
        while let Some(id) = current {
            let n = self.node_ref(id);
            if let Some(p) = n.exclusive() {
                return p;
            }
            current = n.parent();
        }
        0
    }

    /// Nodes in the subtree binding `key`, in fold order
    fn affectors(&self, node: NodeId, key: &OutputKey) -> Vec<(NodeId, i64)> {
        let mut found: Vec<(i64, usize, NodeId)> = Vec::new();
        let mut stack = vec![(node, self.effective_priority(node))];
        while let Some((id, inherited)) = stack.pop() {
            let n = self.node_ref(id);
            let priority = n.exclusive().unwrap_or(inherited);
            if n.declares(key) {
                found.push((priority, found.len(), id));
            }
            let children: Vec<NodeId> = n.children().collect();
            for child in children.into_iter().rev() {
                stack.push((child, priority));
            }
        }
        found.sort_by_key(|(priority, discovered, _)| (*priority, *discovered));
        found.into_iter().map(|(p, _, id)| (id, p)).collect()
    }

    fn evaluate(
        &self,
        node: NodeId,
        key: &OutputKey,
        binding: &Binding,
        previous: Option<&Value>,
    ) -> (Option<Value>, IndexSet<FieldRef>) {
        self.state.begin_recording();
        let scope = Scope {
            machine: self,
            node,
        };
        let result = match binding {
            Binding::Constant(value) => Ok(value.clone()),
            Binding::Computed(f) => f(&scope),
            Binding::Layered(f) => f(&scope, previous),
        };
        let deps = self.state.end_recording();
        match result {
            Ok(value) => (value, deps),
            Err(e) => {
                error!(%node, %key, error = %e, "output binding failed");
                (None, deps)
            }
        }
    }

    fn fold(&self, node: NodeId, key: &OutputKey) -> (Option<Value>, Vec<Layer>) {
        let mut running: Option<Value> = None;
        let mut layers = Vec::new();
        for (id, priority) in self.affectors(node, key) {
            let Some(binding) = self.binding(id, key) else {
                continue;
            };
            let (value, deps) = self.evaluate(id, key, &binding, running.as_ref());
            if value.is_some() {
                running = value.clone();
            }
            layers.push(Layer {
                node: id,
                priority,
                value,
                deps,
            });
        }
        (running, layers)
    }

    /// Recompute the resolved value of `key` over `node`'s subtree and publish
    /// `OutputChanged` if it moved
    fn update_resolved(&mut self, node: NodeId, key: &OutputKey) {
        let (value, layers) = self.fold(node, key);
        for layer in layers {
            if let Some(set) = self.node_mut(layer.node).outputs.as_mut() {
                set.track(key, layer.deps);
            }
        }
        let Some(set) = self.node_mut(node).outputs.as_mut() else {
            return;
        };
        let old = set.resolved.get(key).cloned().flatten();
        if old == value {
            return;
        }
        set.resolved.insert(key.clone(), value.clone());
        debug!(%node, %key, ?value, ?old, "resolved output changed");
        self.emit(EventKind::OutputChanged {
            node,
            key: key.clone(),
            value,
            old,
        });
    }

    /// Re-evaluate a node's own binding after one of its dependencies changed
    fn own_value_may_have_changed(&mut self, node: NodeId, key: &OutputKey) {
        let Some(binding) = self.binding(node, key) else {
            return;
        };
        let (value, deps) = self.evaluate(node, key, &binding, None);
        let Some(set) = self.node_mut(node).outputs.as_mut() else {
            return;
        };
        set.track(key, deps);
        let old = set.own.get(key).cloned().flatten();
        if old == value && !binding.reads_previous() {
            trace!(%node, %key, "own output unchanged");
            return;
        }
        set.own.insert(key.clone(), value.clone());
        self.emit(EventKind::OwnOutputChanged {
            node,
            key: key.clone(),
            value,
            old,
        });
    }

    /// Output reactions of a node to an event it is being dispatched
    pub(crate) fn react_outputs(&mut self, node: NodeId, event: &Event) {
        let Some(set) = self.node_ref(node).outputs.as_ref() else {
            return;
        };
        let stale: Vec<OutputKey> = event
            .changed_field()
            .and_then(|field| set.deps.get(&field))
            .map(|keys| keys.iter().cloned().collect())
            .unwrap_or_default();
        let refresh: Vec<OutputKey> = match &event.kind {
            EventKind::TreeChanged { parent, .. } if self.is_in_subtree(node, *parent) => set.keys(),
            EventKind::OwnOutputChanged { node: source, key, .. }
                if set.declares(key) && self.is_in_subtree(node, *source) =>
            {
                vec![key.clone()]
            }
            _ => Vec::new(),
        };

        for key in stale {
            self.own_value_may_have_changed(node, &key);
        }
        for key in refresh {
            self.update_resolved(node, &key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::Recorder;
    use crate::Runtime;

    fn key(k: &str) -> OutputKey {
        OutputKey::new(k)
    }

    #[test]
    fn test_fold_order_and_no_opinion() {
        let mut rt = Runtime::headless();
        rt.with(|m| {
            let root = m.root();
            let mode = m.create_node("mode");
            m.bind_outputs(mode, OutputBindings::new().constant("lamp", "base"));
            let a = m.create_node("a");
            let b = m.create_node("b");
            m.bind_outputs(a, OutputBindings::new().constant("lamp", "a"));
            m.bind_outputs(b, OutputBindings::new().bind("lamp", Binding::no_opinion()));
            m.attach(root, mode, 0);
            m.attach(mode, b, 2);
            m.attach(mode, a, 1);

            assert_eq!(m.resolved(mode, &key("lamp")), Some(&Value::from("a")));
            let trail: Vec<NodeId> = m.explain(mode, &key("lamp")).iter().map(|c| c.node).collect();
            assert_eq!(trail, vec![mode, a, b]);
        });
    }

    #[test]
    fn test_exclusive_priority_wins_over_discovery() {
        let mut rt = Runtime::headless();
        rt.with(|m| {
            let root = m.root();
            let host = m.create_node("host");
            m.bind_outputs(host, OutputBindings::new().constant("music", "attract"));
            m.attach(root, host, 0);
            let high = m.create_node(crate::NodeSpec::named("high").exclusive(20));
            let low = m.create_node(crate::NodeSpec::named("low").exclusive(10));
            m.bind_outputs(high, OutputBindings::new().constant("music", "multiball"));
            m.bind_outputs(low, OutputBindings::new().constant("music", "game"));
            m.attach(host, high, 0);
            m.attach(host, low, 5);
            assert_eq!(m.resolved(host, &key("music")), Some(&Value::from("multiball")));
            m.end(high);
            assert_eq!(m.resolved(host, &key("music")), Some(&Value::from("game")));
            m.end(low);
            assert_eq!(m.resolved(host, &key("music")), Some(&Value::from("attract")));
        });
    }

    #[test]
    fn test_layered_binding_builds_on_lower_layer() {
        let mut rt = Runtime::headless();
        rt.with(|m| {
            let root = m.root();
            let base = m.create_node("base");
            m.bind_outputs(base, OutputBindings::new().constant("colors", vec!["white"]));
            let overlay = m.create_node("overlay");
            m.bind_outputs(
                overlay,
                OutputBindings::new().layered("colors", |_, prev| {
                    let mut colors = prev.and_then(Value::as_list).map(<[Value]>::to_vec).unwrap_or_default();
                    colors.push("red".into());
                    Ok(Some(Value::List(colors)))
                }),
            );
            m.attach(root, base, 0);
            m.add_child(base, overlay);
            assert_eq!(
                m.resolved(base, &key("colors")),
                Some(&Value::from(vec!["white", "red"]))
            );
            assert_eq!(m.own_output(overlay, &key("colors")), Some(&Value::from(vec!["red"])));
        });
    }

    #[test]
    fn test_dependency_change_recomputes_once() {
        let mut rt = Runtime::headless();
        let events = Recorder::attach(&rt);
        let (host, field) = rt.with(|m| {
            let root = m.root();
            let host = m.create_node("host");
            m.bind_outputs(host, OutputBindings::new().constant("flipper", false));
            m.attach(root, host, 0);
            let obj = m.allocate_object();
            let field = m.declare(obj, "enabled", false);
            let child = m.create_node("game");
            let f = field.clone();
            m.bind_outputs(
                child,
                OutputBindings::new().computed("flipper", move |s| {
                    Ok(s.flag(&f).then_some(Value::Bool(true)))
                }),
            );
            m.attach(host, child, 0);
            (host, field)
        });
        events.clear();

        rt.with(|m| m.set(&field, true).unwrap());
        assert_eq!(events.output_changes(host, &key("flipper")), vec![Some(Value::Bool(true))]);
        rt.with(|m| m.set(&field, false).unwrap());
        assert_eq!(
            events.output_changes(host, &key("flipper")),
            vec![Some(Value::Bool(true)), Some(Value::Bool(false))]
        );
    }

    fn reads(m: &Machine, node: NodeId, k: &str) -> IndexSet<FieldRef> {
        m.node(node)
            .and_then(|n| n.outputs.as_ref())
            .and_then(|set| set.reads(&key(k)))
            .cloned()
            .unwrap_or_default()
    }

    #[test]
    fn test_dependencies_follow_latest_evaluation() {
        let mut rt = Runtime::headless();
        rt.with(|m| {
            let root = m.root();
            let obj = m.allocate_object();
            let attract = m.declare(obj.clone(), "attract", true);
            let demo = m.declare(obj.clone(), "demo", "lights");
            let game = m.declare(obj, "game", "scores");
            let display = m.create_node("display");
            let (a, d, g) = (attract.clone(), demo.clone(), game.clone());
            m.bind_outputs(
                display,
                OutputBindings::new().computed("dmd", move |s| {
                    let source = if s.flag(&a) { &d } else { &g };
                    Ok(s.get(source).cloned())
                }),
            );
            m.attach(root, display, 0);
            assert!(reads(m, display, "dmd").contains(&demo));

            m.set(&attract, false).unwrap();
            let now = reads(m, display, "dmd");
            assert!(now.contains(&game));
            assert!(!now.contains(&demo));
            let set = m.node(display).and_then(|n| n.outputs.as_ref()).unwrap();
            assert!(!set.deps.contains_key(&demo));
            assert_eq!(m.resolved(display, &key("dmd")), Some(&Value::from("scores")));
        });
    }

    #[test]
    fn test_failing_binding_is_no_opinion() {
        let mut rt = Runtime::headless();
        rt.with(|m| {
            let root = m.root();
            let host = m.create_node("host");
            m.bind_outputs(host, OutputBindings::new().constant("gi", true));
            m.attach(root, host, 0);
            let broken = m.create_node("broken");
            m.bind_outputs(
                broken,
                OutputBindings::new().computed("gi", |_| Err(crate::Error::Handler("lamp table missing".into()))),
            );
            m.attach(host, broken, 0);
            assert_eq!(m.resolved(host, &key("gi")), Some(&Value::Bool(true)));
        });
    }

    #[test]
    fn test_binding_reads_another_subtree() {
        let mut rt = Runtime::headless();
        rt.with(|m| {
            let root = m.root();
            let source = m.create_node("source");
            let obj = m.allocate_object();
            let level = m.declare(obj, "level", 1i64);
            let l = level.clone();
            m.bind_outputs(source, OutputBindings::new().computed("level", move |s| Ok(s.get(&l).cloned())));
            m.attach(root, source, 0);

            let mirror = m.create_node("mirror");
            m.bind_outputs(
                mirror,
                OutputBindings::new().computed("copy", move |s| {
                    Ok(s.resolved(source, &OutputKey::new("level")).cloned())
                }),
            );
            m.attach(root, mirror, 1);
            assert_eq!(m.resolved(mirror, &key("copy")), Some(&Value::Int(1)));

            m.set(&level, 3i64).unwrap();
            assert_eq!(m.resolved(mirror, &key("copy")), Some(&Value::Int(3)));
        });
    }
}

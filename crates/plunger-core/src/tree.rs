//! Behavior node tree
//!
//! Nodes live in the machine's arena and reference each other by `NodeId`.
//! A parent lists its children; a child keeps only its parent's id. Ended
//! nodes stay in the arena so stale ids keep resolving, but they are detached,
//! hold no listeners and never see another event.

use crate::bus::{pending_removal, Flow, Handler};
use crate::event::{Event, EventKind, Predicate, TreeChange};
use crate::machine::Machine;
use crate::outputs::OutputSet;
use crate::time::Time;
use crate::{NodeId, OutputKey, Result, SubscriptionId, TimerId};
use std::cell::Cell;
use std::rc::Rc;
use tracing::{debug, error, info, trace};

/// Lifecycle phase of a node
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Created,
    Started,
    Ending,
    Ended,
}

/// How to create a node
#[derive(Debug, Clone, Default)]
pub struct NodeSpec {
    pub name: String,
    /// Tree-wide unique priority; also the resolution priority of its subtree
    pub exclusive: Option<i64>,
}

impl NodeSpec {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            exclusive: None,
        }
    }

    /// Claim an exclusive priority
    pub fn exclusive(mut self, priority: i64) -> Self {
        self.exclusive = Some(priority);
        self
    }
}

impl From<&str> for NodeSpec {
    fn from(name: &str) -> Self {
        Self::named(name)
    }
}

impl From<String> for NodeSpec {
    fn from(name: String) -> Self {
        Self::named(name)
    }
}

pub(crate) struct LocalListener {
    id: SubscriptionId,
    predicate: Predicate,
    handler: Handler<Machine>,
    active: Rc<Cell<bool>>,
}

impl Clone for LocalListener {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            predicate: self.predicate.clone(),
            handler: self.handler.clone(),
            active: self.active.clone(),
        }
    }
}

/// A behavior unit
pub struct Node {
    id: NodeId,
    name: String,
    exclusive: Option<i64>,
    parent: Option<NodeId>,
    children: Vec<NodeId>,
    temporary: Vec<(i64, NodeId)>,
    phase: Phase,
    listeners: Vec<LocalListener>,
    subscriptions: Vec<SubscriptionId>,
    pub(crate) outputs: Option<OutputSet>,
}

impl Node {
    fn new(id: NodeId, spec: NodeSpec) -> Self {
        Self {
            id,
            name: spec.name,
            exclusive: spec.exclusive,
            parent: None,
            children: Vec::new(),
            temporary: Vec::new(),
            phase: Phase::Created,
            listeners: Vec::new(),
            subscriptions: Vec::new(),
            outputs: None,
        }
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn exclusive(&self) -> Option<i64> {
        self.exclusive
    }

    pub fn parent(&self) -> Option<NodeId> {
        self.parent
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Started or ending: still attached and receiving events
    pub fn is_live(&self) -> bool {
        matches!(self.phase, Phase::Started | Phase::Ending)
    }

    pub fn is_ended(&self) -> bool {
        self.phase == Phase::Ended
    }

    /// Children in dispatch order: structural first, then temporary by priority
    pub fn children(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.children
            .iter()
            .copied()
            .chain(self.temporary.iter().map(|(_, id)| *id))
    }

    /// Temporary children with their local priority
    pub fn temporary_children(&self) -> &[(i64, NodeId)] {
        &self.temporary
    }

    /// Whether this node binds `key`
    pub fn declares(&self, key: &OutputKey) -> bool {
        self.outputs.as_ref().is_some_and(|o| o.declares(key))
    }

    fn child_ids(&self) -> Vec<NodeId> {
        self.children().collect()
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("exclusive", &self.exclusive)
            .field("parent", &self.parent)
            .field("phase", &self.phase)
            .field("children", &self.child_ids())
            .finish()
    }
}

impl Machine {
    /// The machine's root node, started at construction
    pub fn root(&self) -> NodeId {
        self.root
    }

    pub fn node(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(&id)
    }

    pub(crate) fn node_ref(&self, id: NodeId) -> &Node {
        match self.nodes.get(&id) {
            Some(node) => node,
            None => panic!("unknown node {}", id),
        }
    }

    pub(crate) fn node_mut(&mut self, id: NodeId) -> &mut Node {
        match self.nodes.get_mut(&id) {
            Some(node) => node,
            None => panic!("unknown node {}", id),
        }
    }

    fn assert_not_ended(&self, id: NodeId, what: &str) {
        let node = self.node_ref(id);
        assert!(
            !node.is_ended(),
            "{} on ended node {} ({})",
            what,
            id,
            node.name
        );
    }

    pub fn phase(&self, id: NodeId) -> Phase {
        self.node_ref(id).phase
    }

    /// Create a detached node in the Created phase
    pub fn create_node(&mut self, spec: impl Into<NodeSpec>) -> NodeId {
        self.next_node += 1;
        let id = NodeId(self.next_node);
        let spec = spec.into();
        trace!(node = %id, name = %spec.name, "node created");
        self.nodes.insert(id, Node::new(id, spec));
        id
    }

    /// Attach a permanent child; children keep insertion order
    pub fn add_child(&mut self, parent: NodeId, child: NodeId) {
        self.link(parent, child, None);
    }

    /// Attach a temporary child, ordered among its temporary siblings by
    /// `priority` (stable for equal priorities)
    pub fn attach(&mut self, parent: NodeId, child: NodeId, priority: i64) {
        self.link(parent, child, Some(priority));
    }

    fn link(&mut self, parent: NodeId, child: NodeId, priority: Option<i64>) {
        assert_ne!(parent, child, "cannot attach {} to itself", child);
        self.assert_not_ended(parent, "attach");
        assert!(
            !matches!(self.node_ref(parent).phase, Phase::Ending),
            "attach to ending node {}",
            parent
        );
        let incoming = self.node_ref(child);
        assert!(
            matches!(incoming.phase, Phase::Created | Phase::Started),
            "cannot attach {} ({}) in phase {:?}",
            child,
            incoming.name,
            incoming.phase
        );
        assert!(
            incoming.parent.is_none(),
            "{} ({}) already has a parent",
            child,
            incoming.name
        );
        assert!(
            !self.is_in_subtree(child, parent),
            "cannot attach {} under its own descendant {}",
            child,
            parent
        );
        self.assert_exclusive_free(parent, child);

        let node = self.node_mut(parent);
        match priority {
            None => node.children.push(child),
            Some(p) => {
                let pos = node.temporary.partition_point(|(q, _)| *q <= p);
                node.temporary.insert(pos, (p, child));
            }
        }
        self.node_mut(child).parent = Some(parent);
        debug!(%parent, %child, ?priority, "child attached");
        self.emit(EventKind::TreeChanged {
            parent,
            child,
            change: TreeChange::Attached,
        });
        if self.node_ref(parent).phase == Phase::Started {
            self.start(child);
        }
    }

    fn assert_exclusive_free(&self, parent: NodeId, child: NodeId) {
        let incoming: Vec<(NodeId, i64)> = self
            .subtree(child)
            .into_iter()
            .filter_map(|id| self.node_ref(id).exclusive.map(|p| (id, p)))
            .collect();
        if incoming.is_empty() {
            return;
        }
        for id in self.subtree(self.root_of(parent)) {
            let node = self.node_ref(id);
            if node.is_ended() {
                continue;
            }
            if let Some(held) = node.exclusive {
                if let Some((claimant, _)) = incoming.iter().find(|(_, p)| *p == held) {
                    panic!(
                        "exclusive priority {} is held by {} ({}); cannot attach {}",
                        held, id, node.name, claimant
                    );
                }
            }
        }
    }

    /// Start a node and, recursively, its children
    pub fn start(&mut self, id: NodeId) {
        if self.node_ref(id).phase != Phase::Created {
            return;
        }
        self.node_mut(id).phase = Phase::Started;
        info!(node = %id, name = %self.node_ref(id).name, "node started");
        self.emit(EventKind::NodeStarted { node: id });
        for child in self.node_ref(id).child_ids() {
            self.start(child);
        }
    }

    /// End a node: children first, then detach and release everything it owns
    ///
    /// Ending an ending or ended node does nothing.
    pub fn end(&mut self, id: NodeId) {
        if matches!(self.node_ref(id).phase, Phase::Ending | Phase::Ended) {
            return;
        }
        self.node_mut(id).phase = Phase::Ending;
        self.emit(EventKind::NodeEnding { node: id });
        for child in self.node_ref(id).child_ids() {
            self.end(child);
        }

        let node = self.node_mut(id);
        node.phase = Phase::Ended;
        for listener in node.listeners.drain(..) {
            listener.active.set(false);
        }
        let subscriptions = std::mem::take(&mut node.subscriptions);
        node.outputs = None;
        let parent = node.parent.take();
        for sub in subscriptions {
            self.bus.cancel(sub);
        }
        let timers = self.scheduler.cancel_owned_by(id);
        info!(node = %id, name = %self.node_ref(id).name, timers, "node ended");

        if let Some(parent) = parent {
            let p = self.node_mut(parent);
            p.children.retain(|c| *c != id);
            p.temporary.retain(|(_, c)| *c != id);
            self.emit(EventKind::TreeChanged {
                parent,
                child: id,
                change: TreeChange::Detached,
            });
        }
        self.emit(EventKind::NodeEnded { node: id });
    }

    /// Register a listener that lives as long as the node
    ///
    /// It sees events after the node's descendants and output reactions.
    pub fn listen(
        &mut self,
        node: NodeId,
        predicate: impl Fn(&Event) -> bool + 'static,
        handler: impl Fn(&mut Machine, &Event) -> Result<Flow> + 'static,
    ) -> SubscriptionId {
        self.assert_not_ended(node, "listen");
        self.next_listener += 1;
        let id = SubscriptionId(self.next_listener);
        self.node_mut(node).listeners.push(LocalListener {
            id,
            predicate: Rc::new(predicate),
            handler: Rc::new(handler),
            active: Rc::new(Cell::new(true)),
        });
        id
    }

    /// Remove a node-local listener
    pub fn unlisten(&mut self, node: NodeId, id: SubscriptionId) -> bool {
        let listeners = &mut self.node_mut(node).listeners;
        match listeners.iter().position(|l| l.id == id) {
            Some(pos) => {
                listeners.remove(pos).active.set(false);
                true
            }
            None => false,
        }
    }

    /// Run `body` now and again on every matching event while the node lives
    pub fn watch(
        &mut self,
        node: NodeId,
        predicate: impl Fn(&Event) -> bool + 'static,
        body: impl Fn(&mut Machine) -> Result<()> + 'static,
    ) -> Result<SubscriptionId> {
        body(self)?;
        Ok(self.listen(node, predicate, move |m, _| {
            body(m)?;
            Ok(Flow::Keep)
        }))
    }

    /// Bus subscription cancelled when the node ends
    ///
    /// Unlike `listen`, it also sees events while the node is detached.
    pub fn subscribe_scoped(
        &mut self,
        node: NodeId,
        predicate: impl Fn(&Event) -> bool + 'static,
        handler: impl Fn(&mut Machine, &Event) -> Result<Flow> + 'static,
    ) -> SubscriptionId {
        self.assert_not_ended(node, "subscribe");
        let id = self.bus.subscribe(predicate, handler);
        self.node_mut(node).subscriptions.push(id);
        id
    }

    /// Timer owned by a node; cancelled when the node ends
    pub fn call_in_for(
        &mut self,
        node: NodeId,
        delay: Time,
        label: impl Into<String>,
        callback: impl FnMut(&mut Machine) -> Result<()> + 'static,
    ) -> TimerId {
        self.assert_not_ended(node, "schedule");
        let at = self.now() + delay;
        self.scheduler
            .schedule(at, label, None, Some(node), Box::new(callback))
    }

    /// Topmost ancestor of a node
    pub fn root_of(&self, id: NodeId) -> NodeId {
        let mut current = id;
        while let Some(parent) = self.node_ref(current).parent {
            current = parent;
        }
        current
    }

    /// Parent chain, nearest first
    pub fn ancestors(&self, id: NodeId) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut current = self.node_ref(id).parent;
        while let Some(parent) = current {
            out.push(parent);
            current = self.node_ref(parent).parent;
        }
        out
    }

    /// Node and all its descendants, pre-order, in dispatch order among siblings
    pub fn subtree(&self, id: NodeId) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut stack = vec![id];
        while let Some(current) = stack.pop() {
            out.push(current);
            let children = self.node_ref(current).child_ids();
            stack.extend(children.into_iter().rev());
        }
        out
    }

    pub fn descendants(&self, id: NodeId) -> Vec<NodeId> {
        let mut all = self.subtree(id);
        all.remove(0);
        all
    }

    /// Whether `id` is `ancestor` or one of its descendants
    pub fn is_in_subtree(&self, ancestor: NodeId, id: NodeId) -> bool {
        let mut current = Some(id);
        while let Some(n) = current {
            if n == ancestor {
                return true;
            }
            current = self.node_ref(n).parent;
        }
        false
    }

    /// Deliver an event to a node: descendants first, then output reactions,
    /// then the node's own listeners
    pub(crate) fn dispatch(&mut self, id: NodeId, event: &Event) {
        if !self.node_ref(id).is_live() {
            return;
        }
        for child in self.node_ref(id).child_ids() {
            self.dispatch(child, event);
        }
        if !self.node_ref(id).is_live() {
            return;
        }
        self.react_outputs(id, event);

        let listeners = self.node_ref(id).listeners.clone();
        for listener in listeners {
            if !self.node_ref(id).is_live() {
                break;
            }
            if !listener.active.get() || !(listener.predicate)(event) {
                continue;
            }
            match (listener.handler)(self, event) {
                Ok(Flow::Keep) => {}
                Ok(Flow::Remove) => {
                    self.unlisten(id, listener.id);
                }
                Ok(Flow::Pending(work)) => {
                    let label = format!("{} listener {}", id, listener.id.0);
                    self.spawn_task(label, pending_removal(work, listener.active.clone()));
                }
                Err(e) => {
                    error!(node = %id, listener = listener.id.0, seq = event.seq, error = %e, "node listener failed");
                }
            }
        }
        let node = self.node_mut(id);
        node.listeners.retain(|l| l.active.get());
    }
}

//! Event bus
//!
//! Listeners are (predicate, handler) pairs invoked synchronously in
//! registration order. A publish iterates over a snapshot of the listener
//! list, so subscriptions added by a handler only see later publishes, while
//! a cancelled subscription is never invoked again, even later in the same pass.
//!
//! The bus is generic over the context handed to handlers; the machine is the
//! only production context, tests use a small stand-in.

use crate::event::{Event, Predicate};
use crate::{Result, SubscriptionId};
use futures::future::{FutureExt, LocalBoxFuture};
use std::cell::Cell;
use std::collections::VecDeque;
use std::rc::Rc;
use tracing::{error, trace};

/// What a handler wants done with its subscription after an event
pub enum Flow {
    /// Stay subscribed
    Keep,
    /// Unsubscribe now
    Remove,
    /// Async work was started; unsubscribe if it resolves to `Remove`
    Pending(LocalBoxFuture<'static, Flow>),
}

impl std::fmt::Debug for Flow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Flow::Keep => write!(f, "Keep"),
            Flow::Remove => write!(f, "Remove"),
            Flow::Pending(_) => write!(f, "Pending"),
        }
    }
}

/// Event handler invoked with the bus owner
pub type Handler<C> = Rc<dyn Fn(&mut C, &Event) -> Result<Flow>>;

struct Listener<C> {
    id: SubscriptionId,
    predicate: Predicate,
    handler: Handler<C>,
    active: Rc<Cell<bool>>,
}

/// A listener captured by a publish snapshot
pub struct Delivery<C> {
    pub id: SubscriptionId,
    pub predicate: Predicate,
    pub handler: Handler<C>,
    active: Rc<Cell<bool>>,
}

impl<C> Delivery<C> {
    /// False once the subscription was cancelled
    pub fn is_active(&self) -> bool {
        self.active.get()
    }

    /// Shared flag that deactivates the subscription when cleared
    pub fn active_flag(&self) -> Rc<Cell<bool>> {
        self.active.clone()
    }
}

/// Ordered listener registry with hold/release buffering
pub struct EventBus<C> {
    listeners: Vec<Listener<C>>,
    next_id: u64,
    held: VecDeque<Event>,
    hold_depth: usize,
    depth: usize,
}

impl<C> EventBus<C> {
    pub fn new() -> Self {
        Self {
            listeners: Vec::new(),
            next_id: 0,
            held: VecDeque::new(),
            hold_depth: 0,
            depth: 0,
        }
    }

    /// Register a listener; it is invoked after every existing one
    pub fn subscribe(
        &mut self,
        predicate: impl Fn(&Event) -> bool + 'static,
        handler: impl Fn(&mut C, &Event) -> Result<Flow> + 'static,
    ) -> SubscriptionId {
        self.next_id += 1;
        let id = SubscriptionId(self.next_id);
        self.listeners.push(Listener {
            id,
            predicate: Rc::new(predicate),
            handler: Rc::new(handler),
            active: Rc::new(Cell::new(true)),
        });
        id
    }

    /// Remove a listener. Returns false if it was already gone.
    pub fn cancel(&mut self, id: SubscriptionId) -> bool {
        match self.listeners.iter().position(|l| l.id == id) {
            Some(pos) => {
                let listener = self.listeners.remove(pos);
                let was_active = listener.active.get();
                listener.active.set(false);
                was_active
            }
            None => false,
        }
    }

    /// Whether a subscription is still live
    pub fn is_subscribed(&self, id: SubscriptionId) -> bool {
        self.listeners.iter().any(|l| l.id == id && l.active.get())
    }

    /// Number of live subscriptions
    pub fn len(&self) -> usize {
        self.listeners.iter().filter(|l| l.active.get()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of the live listeners in registration order
    pub fn snapshot(&mut self) -> Vec<Delivery<C>> {
        self.listeners.retain(|l| l.active.get());
        self.listeners
            .iter()
            .map(|l| Delivery {
                id: l.id,
                predicate: l.predicate.clone(),
                handler: l.handler.clone(),
                active: l.active.clone(),
            })
            .collect()
    }

    /// Start buffering published events; nests
    pub fn hold(&mut self) {
        self.hold_depth += 1;
    }

    /// Leave one hold level. Returns the buffered events once the last level is left.
    pub fn release(&mut self) -> Vec<Event> {
        self.hold_depth = self.hold_depth.saturating_sub(1);
        if self.hold_depth == 0 {
            self.held.drain(..).collect()
        } else {
            Vec::new()
        }
    }

    pub fn is_held(&self) -> bool {
        self.hold_depth > 0
    }

    fn defer(&mut self, event: Event) {
        self.held.push_back(event);
    }

    /// Nesting level of publishes currently on the stack
    pub fn depth(&self) -> usize {
        self.depth
    }
}

impl<C> Default for EventBus<C> {
    fn default() -> Self {
        Self::new()
    }
}

/// Owner of an event bus that can receive its own events
pub trait BusHost: Sized + 'static {
    fn bus(&mut self) -> &mut EventBus<Self>;

    /// Run the continuation of a handler that returned `Flow::Pending`
    fn spawn_pending(&mut self, label: String, task: LocalBoxFuture<'static, ()>);

    /// Called when the outermost publish returns
    fn after_publish(&mut self) {}
}

/// Deliver an event to every matching listener, synchronously
///
/// A failing handler is logged and the remaining listeners still run.
pub fn publish<C: BusHost>(ctx: &mut C, event: Event) {
    if ctx.bus().is_held() {
        ctx.bus().defer(event);
        return;
    }
    trace!(seq = event.seq, at = event.at, kind = ?event.kind, "publish");
    ctx.bus().depth += 1;
    let deliveries = ctx.bus().snapshot();
    for delivery in deliveries {
        if !delivery.is_active() || !(delivery.predicate)(&event) {
            continue;
        }
        match (delivery.handler)(ctx, &event) {
            Ok(Flow::Keep) => {}
            Ok(Flow::Remove) => {
                ctx.bus().cancel(delivery.id);
            }
            Ok(Flow::Pending(work)) => {
                let label = format!("subscription {}", delivery.id.0);
                ctx.spawn_pending(label, pending_removal(work, delivery.active_flag()));
            }
            Err(e) => {
                error!(subscription = delivery.id.0, seq = event.seq, error = %e, "event handler failed");
            }
        }
    }
    ctx.bus().depth -= 1;
    if ctx.bus().depth == 0 {
        ctx.after_publish();
    }
}

/// Wrap the async tail of a handler so a final `Remove` deactivates its listener
pub(crate) fn pending_removal(
    work: LocalBoxFuture<'static, Flow>,
    active: Rc<Cell<bool>>,
) -> LocalBoxFuture<'static, ()> {
    async move {
        if let Flow::Remove = work.await {
            active.set(false);
        }
    }
    .boxed_local()
}

/// Leave one hold level, publishing the buffered events in order when it was the last
pub fn release<C: BusHost>(ctx: &mut C) {
    let events = ctx.bus().release();
    for event in events {
        publish(ctx, event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{on, EventKind};
    use crate::Error;

    #[derive(Default)]
    struct Ctx {
        bus: EventBus<Ctx>,
        log: Vec<String>,
        pending: Vec<LocalBoxFuture<'static, ()>>,
        quiescent: usize,
        seq: u64,
    }

    impl BusHost for Ctx {
        fn bus(&mut self) -> &mut EventBus<Self> {
            &mut self.bus
        }

        fn spawn_pending(&mut self, _label: String, task: LocalBoxFuture<'static, ()>) {
            self.pending.push(task);
        }

        fn after_publish(&mut self) {
            self.quiescent += 1;
        }
    }

    impl Ctx {
        fn custom(&mut self, name: &str) -> Event {
            self.seq += 1;
            Event::new(
                self.seq,
                0,
                EventKind::Custom {
                    name: name.into(),
                    params: Default::default(),
                },
            )
        }
    }

    fn logger(tag: &'static str) -> impl Fn(&mut Ctx, &Event) -> Result<Flow> {
        move |ctx, _| {
            ctx.log.push(tag.to_string());
            Ok(Flow::Keep)
        }
    }

    #[test]
    fn test_registration_order() {
        let mut ctx = Ctx::default();
        ctx.bus.subscribe(on::any(), logger("a"));
        ctx.bus.subscribe(on::custom("x"), logger("b"));
        ctx.bus.subscribe(on::any(), logger("c"));

        let e = ctx.custom("x");
        publish(&mut ctx, e);
        assert_eq!(ctx.log, vec!["a", "b", "c"]);

        let e = ctx.custom("y");
        publish(&mut ctx, e);
        assert_eq!(ctx.log, vec!["a", "b", "c", "a", "c"]);
        assert_eq!(ctx.quiescent, 2);
    }

    #[test]
    fn test_remove_during_publish_does_not_skip() {
        let mut ctx = Ctx::default();
        ctx.bus.subscribe(on::any(), |ctx: &mut Ctx, _: &Event| {
            ctx.log.push("once".into());
            Ok(Flow::Remove)
        });
        ctx.bus.subscribe(on::any(), logger("next"));

        let e = ctx.custom("x");
        publish(&mut ctx, e);
        let e = ctx.custom("x");
        publish(&mut ctx, e);
        assert_eq!(ctx.log, vec!["once", "next", "next"]);
        assert_eq!(ctx.bus.len(), 1);
    }

    #[test]
    fn test_subscribe_during_publish_waits_for_next() {
        let mut ctx = Ctx::default();
        ctx.bus.subscribe(on::any(), |ctx: &mut Ctx, _: &Event| {
            if ctx.log.is_empty() {
                ctx.bus.subscribe(on::any(), logger("late"));
            }
            ctx.log.push("first".into());
            Ok(Flow::Keep)
        });

        let e = ctx.custom("x");
        publish(&mut ctx, e);
        assert_eq!(ctx.log, vec!["first"]);
        let e = ctx.custom("x");
        publish(&mut ctx, e);
        assert_eq!(ctx.log, vec!["first", "first", "late"]);
    }

    #[test]
    fn test_cancel_mid_pass_skips_listener() {
        let mut ctx = Ctx::default();
        let victim = SubscriptionId(2);
        ctx.bus.subscribe(on::any(), move |ctx: &mut Ctx, _: &Event| {
            ctx.bus.cancel(victim);
            Ok(Flow::Keep)
        });
        let id = ctx.bus.subscribe(on::any(), logger("victim"));
        assert_eq!(id, victim);

        let e = ctx.custom("x");
        publish(&mut ctx, e);
        assert!(ctx.log.is_empty());
        assert!(!ctx.bus.is_subscribed(victim));
    }

    #[test]
    fn test_nested_publish_is_depth_first() {
        let mut ctx = Ctx::default();
        ctx.bus.subscribe(on::custom("outer"), |ctx: &mut Ctx, _: &Event| {
            ctx.log.push("outer:1".into());
            let inner = ctx.custom("inner");
            publish(ctx, inner);
            Ok(Flow::Keep)
        });
        ctx.bus.subscribe(on::any(), |ctx: &mut Ctx, e: &Event| {
            if let EventKind::Custom { name, .. } = &e.kind {
                ctx.log.push(format!("{}:2", name));
            }
            Ok(Flow::Keep)
        });

        let e = ctx.custom("outer");
        publish(&mut ctx, e);
        assert_eq!(ctx.log, vec!["outer:1", "inner:2", "outer:2"]);
        assert_eq!(ctx.quiescent, 1);
    }

    #[test]
    fn test_handler_error_does_not_stop_dispatch() {
        let mut ctx = Ctx::default();
        ctx.bus.subscribe(on::any(), |_: &mut Ctx, _: &Event| {
            Err(Error::Handler("boom".into()))
        });
        ctx.bus.subscribe(on::any(), logger("after"));

        let e = ctx.custom("x");
        publish(&mut ctx, e);
        assert_eq!(ctx.log, vec!["after"]);
        assert_eq!(ctx.bus.len(), 2);
    }

    #[test]
    fn test_hold_and_release() {
        let mut ctx = Ctx::default();
        ctx.bus.subscribe(on::any(), |ctx: &mut Ctx, e: &Event| {
            ctx.log.push(format!("seq{}", e.seq));
            Ok(Flow::Keep)
        });

        ctx.bus.hold();
        ctx.bus.hold();
        let e = ctx.custom("x");
        publish(&mut ctx, e);
        let e = ctx.custom("y");
        publish(&mut ctx, e);
        release(&mut ctx);
        assert!(ctx.log.is_empty());
        release(&mut ctx);
        assert_eq!(ctx.log, vec!["seq1", "seq2"]);
    }

    #[test]
    fn test_pending_flow_removes_when_resolved() {
        let mut ctx = Ctx::default();
        ctx.bus.subscribe(on::any(), |ctx: &mut Ctx, _: &Event| {
            ctx.log.push("seen".into());
            Ok(Flow::Pending(async { Flow::Remove }.boxed_local()))
        });

        let e = ctx.custom("x");
        publish(&mut ctx, e);
        assert_eq!(ctx.bus.len(), 1);
        for task in ctx.pending.drain(..) {
            futures::executor::block_on(task);
        }
        assert_eq!(ctx.bus.len(), 0);

        let e = ctx.custom("x");
        publish(&mut ctx, e);
        assert_eq!(ctx.log, vec!["seen"]);
    }
}

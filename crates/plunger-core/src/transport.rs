//! Actuator transport boundary
//!
//! The transport owns whatever physical bus reaches the driver boards. The
//! commit layer only asks it to apply one command to one output and reads back
//! whether the device confirmed, wants a retry later, or faulted.

use crate::time::Time;
use crate::{OutputKey, Value};
use futures::future::{self, FutureExt, LocalBoxFuture};
use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::rc::Rc;
use thiserror::Error;

/// What to do to a device
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceCommand {
    /// Hold a level value (lamp, flipper enable, display content)
    Set(Value),
    /// Energize for `ms` then release
    Pulse { ms: u64 },
}

/// A command addressed to one output
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceRequest {
    pub key: OutputKey,
    pub command: DeviceCommand,
    /// Machine time the request was issued
    pub at: Time,
}

/// Non-fault result of a device call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetOutcome {
    /// The device now holds the requested state
    Confirmed,
    /// Not applied; try again after this many milliseconds
    RetryAfter(u64),
}

/// Recoverable device failure
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("device fault: {0}")]
pub struct DeviceFault(pub String);

/// Answer to a device call
pub enum DeviceReply {
    Ready(Result<SetOutcome, DeviceFault>),
    /// Completion arrives later; applied when the runtime settles
    Pending(LocalBoxFuture<'static, Result<SetOutcome, DeviceFault>>),
}

impl std::fmt::Debug for DeviceReply {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceReply::Ready(r) => write!(f, "Ready({:?})", r),
            DeviceReply::Pending(_) => write!(f, "Pending"),
        }
    }
}

/// Injected device setter
pub trait Transport {
    fn set_device(&mut self, request: &DeviceRequest) -> DeviceReply;
}

/// Transport that confirms everything and talks to nothing
#[derive(Debug, Default, Clone, Copy)]
pub struct NullTransport;

impl Transport for NullTransport {
    fn set_device(&mut self, _request: &DeviceRequest) -> DeviceReply {
        DeviceReply::Ready(Ok(SetOutcome::Confirmed))
    }
}

#[derive(Debug)]
struct Scripted {
    result: Result<SetOutcome, DeviceFault>,
    deferred: bool,
}

#[derive(Debug, Default)]
struct Script {
    calls: Vec<DeviceRequest>,
    replies: HashMap<OutputKey, VecDeque<Scripted>>,
}

/// In-memory transport for tests and replays
///
/// Records every request and answers from per-output reply queues, confirming
/// once a queue is empty. Deferred replies come back as `DeviceReply::Pending`
/// and land when the runtime settles. Clones share the same log.
#[derive(Debug, Default, Clone)]
pub struct ScriptedTransport {
    script: Rc<RefCell<Script>>,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn queue(&self, key: OutputKey, result: Result<SetOutcome, DeviceFault>, deferred: bool) {
        self.script
            .borrow_mut()
            .replies
            .entry(key)
            .or_default()
            .push_back(Scripted { result, deferred });
    }

    /// Queue the reply for the next call on `key`
    pub fn reply(&self, key: impl Into<OutputKey>, reply: Result<SetOutcome, DeviceFault>) {
        self.queue(key.into(), reply, false);
    }

    /// Queue an asynchronous reply for the next call on `key`
    pub fn reply_later(&self, key: impl Into<OutputKey>, reply: Result<SetOutcome, DeviceFault>) {
        self.queue(key.into(), reply, true);
    }

    /// Queue a fault for the next call on `key`
    pub fn fail_next(&self, key: impl Into<OutputKey>, reason: impl Into<String>) {
        self.reply(key, Err(DeviceFault(reason.into())));
    }

    /// Every request so far, in order
    pub fn calls(&self) -> Vec<DeviceRequest> {
        self.script.borrow().calls.clone()
    }

    /// Requests addressed to one output
    pub fn calls_for(&self, key: &OutputKey) -> Vec<DeviceRequest> {
        self.script
            .borrow()
            .calls
            .iter()
            .filter(|c| c.key == *key)
            .cloned()
            .collect()
    }

    pub fn clear(&self) {
        self.script.borrow_mut().calls.clear();
    }
}

impl Transport for ScriptedTransport {
    fn set_device(&mut self, request: &DeviceRequest) -> DeviceReply {
        let mut script = self.script.borrow_mut();
        script.calls.push(request.clone());
        match script.replies.get_mut(&request.key).and_then(VecDeque::pop_front) {
            Some(Scripted { result, deferred: true }) => {
                DeviceReply::Pending(future::ready(result).boxed_local())
            }
            Some(Scripted { result, .. }) => DeviceReply::Ready(result),
            None => DeviceReply::Ready(Ok(SetOutcome::Confirmed)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(key: &str) -> DeviceRequest {
        DeviceRequest {
            key: key.into(),
            command: DeviceCommand::Set(Value::Bool(true)),
            at: 0,
        }
    }

    #[test]
    fn test_scripted_replies_then_confirms() {
        let transport = ScriptedTransport::new();
        transport.reply("gi", Ok(SetOutcome::RetryAfter(10)));
        transport.fail_next("gi", "node board offline");
        let mut t = transport.clone();

        let r1 = t.set_device(&request("gi"));
        assert!(matches!(r1, DeviceReply::Ready(Ok(SetOutcome::RetryAfter(10)))));
        let r2 = t.set_device(&request("gi"));
        assert!(matches!(r2, DeviceReply::Ready(Err(_))));
        let r3 = t.set_device(&request("gi"));
        assert!(matches!(r3, DeviceReply::Ready(Ok(SetOutcome::Confirmed))));
        let r4 = t.set_device(&request("other"));
        assert!(matches!(r4, DeviceReply::Ready(Ok(SetOutcome::Confirmed))));

        assert_eq!(transport.calls().len(), 4);
        assert_eq!(transport.calls_for(&"gi".into()).len(), 3);
    }

    #[test]
    fn test_deferred_reply_is_pending() {
        let transport = ScriptedTransport::new();
        transport.reply_later("flasher", Err(DeviceFault("timeout".into())));
        let mut t = transport.clone();

        let DeviceReply::Pending(reply) = t.set_device(&request("flasher")) else {
            panic!("expected a pending reply");
        };
        let result = futures::executor::block_on(reply);
        assert_eq!(result, Err(DeviceFault("timeout".into())));
        assert!(matches!(
            t.set_device(&request("flasher")),
            DeviceReply::Ready(Ok(SetOutcome::Confirmed))
        ));
    }
}

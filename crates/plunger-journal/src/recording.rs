//! Switch recordings
//!
//! A recording is a plain text log with one switch transition per line:
//!
//! ```text
//! # game 1, left flipper stuck
//! 120 start 1
//! 180 start 0
//! 2450 trough1 0
//! ```
//!
//! Fields are the machine time in milliseconds, the switch id and `1`
//! (closed) or `0` (open). Blank lines and `#` comments are ignored.
//! Timestamps never decrease.

use crate::{Error, Result};
use plunger_core::{on, EventKind, Flow, Runtime, SubscriptionId, SwitchId, Time};
use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::fmt;
use std::fs;
use std::path::Path;
use std::rc::Rc;

/// One switch transition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transition {
    pub at: Time,
    pub switch: SwitchId,
    pub closed: bool,
}

impl fmt::Display for Transition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.at, self.switch, u8::from(self.closed))
    }
}

/// Ordered switch transitions
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Recording {
    transitions: Vec<Transition>,
}

impl Recording {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse the line format
    pub fn parse(source: &str) -> Result<Self> {
        let mut recording = Self::new();
        for (index, raw) in source.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let parse_error = |reason: String| Error::Parse {
                line: index + 1,
                reason,
            };
            let mut fields = line.split_whitespace();
            let (Some(at), Some(switch), Some(state), None) =
                (fields.next(), fields.next(), fields.next(), fields.next())
            else {
                return Err(parse_error(format!("expected `<ms> <switch> <0|1>`, got `{}`", line)));
            };
            let at: Time = at
                .parse()
                .map_err(|_| parse_error(format!("bad timestamp `{}`", at)))?;
            let closed = match state {
                "1" => true,
                "0" => false,
                other => return Err(parse_error(format!("bad switch state `{}`", other))),
            };
            recording
                .push(Transition {
                    at,
                    switch: SwitchId::new(switch),
                    closed,
                })
                .map_err(|_| parse_error(format!("timestamp {} goes backwards", at)))?;
        }
        Ok(recording)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let source = fs::read_to_string(path)?;
        Self::parse(&source)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        fs::write(path, self.to_text())?;
        Ok(())
    }

    /// Append a transition; rejected if it is earlier than the last one
    pub fn push(&mut self, transition: Transition) -> Result<()> {
        if let Some(last) = self.transitions.last() {
            if transition.at < last.at {
                return Err(Error::Parse {
                    line: self.transitions.len() + 1,
                    reason: format!("timestamp {} before {}", transition.at, last.at),
                });
            }
        }
        self.transitions.push(transition);
        Ok(())
    }

    pub fn transitions(&self) -> &[Transition] {
        &self.transitions
    }

    pub fn len(&self) -> usize {
        self.transitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transitions.is_empty()
    }

    /// Time of the last transition
    pub fn end_time(&self) -> Time {
        self.transitions.last().map(|t| t.at).unwrap_or(0)
    }

    /// Serialize back to the line format
    pub fn to_text(&self) -> String {
        let mut out = String::new();
        for transition in &self.transitions {
            out.push_str(&transition.to_string());
            out.push('\n');
        }
        out
    }
}

/// Captures live switch transitions from a runtime into a `Recording`
pub struct SwitchRecorder {
    recording: Rc<RefCell<Recording>>,
    subscription: SubscriptionId,
}

impl SwitchRecorder {
    pub fn attach(runtime: &mut Runtime) -> Self {
        let recording = Rc::new(RefCell::new(Recording::new()));
        let sink = recording.clone();
        let subscription = runtime.with(|m| {
            m.subscribe(on::any(), move |_, event| {
                if let EventKind::Switch { switch, closed } = &event.kind {
                    sink.borrow_mut().push(Transition {
                        at: event.at,
                        switch: switch.clone(),
                        closed: *closed,
                    })
                    .map_err(|e| plunger_core::Error::Handler(e.to_string()))?;
                }
                Ok(Flow::Keep)
            })
        });
        Self {
            recording,
            subscription,
        }
    }

    /// Transitions captured so far
    pub fn snapshot(&self) -> Recording {
        self.recording.borrow().clone()
    }

    /// Stop capturing and return the recording
    pub fn finish(self, runtime: &mut Runtime) -> Recording {
        runtime.with(|m| m.unsubscribe(self.subscription));
        self.recording.borrow().clone()
    }
}

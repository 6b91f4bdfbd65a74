//! Error types for plunger-core

use crate::{FieldRef, NodeId, OutputKey, SwitchId};
use thiserror::Error;

/// Core error type
///
/// Contract breaches inside the core (mutating an ended node, attaching a node
/// twice, duplicate exclusive priorities) are programming errors and panic
/// instead of returning one of these.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Field not declared: {0}")]
    UndeclaredField(FieldRef),

    #[error("Type error on {field}: expected {expected}, got {got}")]
    TypeError {
        field: FieldRef,
        expected: String,
        got: String,
    },

    #[error("Index {index} out of range for {field} (len {len})")]
    IndexOutOfRange {
        field: FieldRef,
        index: usize,
        len: usize,
    },

    #[error("Unknown switch: {0}")]
    UnknownSwitch(SwitchId),

    #[error("Unknown actuator: {0}")]
    UnknownActuator(OutputKey),

    #[error("Unknown node: {0}")]
    UnknownNode(NodeId),

    #[error("Clock is not in virtual mode")]
    NotVirtual,

    #[error("Cannot move the clock backwards from {now} to {target}")]
    TimeTravel { now: u64, target: u64 },

    #[error("Task limit of {0} pending tasks reached")]
    TooManyTasks(usize),

    #[error("Wait cancelled: {0}")]
    Cancelled(String),

    #[error("Machine is busy or dropped")]
    MachineUnavailable,

    #[error("Handler failed: {0}")]
    Handler(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

//! Plunger Core - reactive control core for a pinball machine
//!
//! This crate provides the runtime that sits between switch sensing and the
//! driver boards:
//! - Event bus with ordered, snapshot-based delivery (`bus`)
//! - Reactive state with dependency recording (`state`, `collections`)
//! - Timer queue and clock with virtual and real-time modes (`scheduler`, `time`)
//! - Behavior node tree with lifecycle and scoped listeners (`tree`)
//! - Priority-ordered output resolution (`outputs`)
//! - Actuator commit layer with retries and pulse arbitration (`actuator`)
//!
//! ## Driving a machine
//!
//! A `Runtime` owns the `Machine` and its task pool. Behaviors are nodes
//! attached under the machine root; they bind output keys, and the resolved
//! value at the root is committed to the matching actuator through the
//! injected `Transport`.
//!
//! ```
//! use plunger_core::{ActuatorConfig, MachineConfig, OutputBindings, OutputKey, Runtime, ScriptedTransport, Value};
//!
//! let config = MachineConfig::default().with_actuator(ActuatorConfig::plain("rampUp", true));
//! let transport = ScriptedTransport::new();
//! let mut rt = Runtime::virtual_time(config, transport.clone());
//! rt.with(|m| {
//!     let root = m.root();
//!     let lock = m.create_node("ramp lock");
//!     m.bind_outputs(lock, OutputBindings::new().constant("rampUp", false));
//!     m.attach(root, lock, 0);
//! });
//! assert_eq!(rt.with(|m| m.output(&OutputKey::new("rampUp")).cloned()), Some(Value::Bool(false)));
//! assert_eq!(transport.calls().len(), 1);
//! ```

pub mod actuator;
pub mod bus;
pub mod collections;
pub mod config;
mod error;
pub mod event;
mod identity;
pub mod machine;
pub mod outputs;
pub mod runtime;
pub mod scheduler;
pub mod state;
pub mod switches;
pub mod tasks;
pub mod testing;
pub mod time;
pub mod transport;
pub mod tree;
mod value;

pub use actuator::{Actuator, ActuatorBank, ActuatorPhase};
pub use bus::{EventBus, Flow};
pub use collections::{ObservableList, ObservableMap, ObservableSet};
pub use config::{ActuatorConfig, ActuatorKind, MachineConfig, OutputConfig, SwitchConfig};
pub use error::{Error, Result};
pub use event::{on, CollectionOp, Event, EventKind, Predicate, TreeChange};
pub use identity::{FieldRef, NodeId, ObjectId, OutputKey, SubscriptionId, SwitchId, TimerId};
pub use machine::Machine;
pub use outputs::{Binding, Contribution, OutputBindings, Scope};
pub use runtime::Runtime;
pub use state::StateStore;
pub use tasks::{MachineHandle, TaskRegistry, Turn};
pub use time::{Clock, ClockMode, Time};
pub use transport::{
    DeviceCommand, DeviceFault, DeviceReply, DeviceRequest, NullTransport, ScriptedTransport,
    SetOutcome, Transport,
};
pub use tree::{Node, NodeSpec, Phase};
pub use value::{Value, ValueMap};

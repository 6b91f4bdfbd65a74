//! Plunger Journal - Switch recordings, replay and output traces
//!
//! This crate builds on `plunger-core` to provide:
//!
//! - **Recording**: the line-based switch log and a live `SwitchRecorder`
//! - **Replayer**: feed a recording through a virtual-time runtime
//! - **OutputTrace**: capture root-level resolved output changes
//! - **TraceExporter**: export traces to RON, JSON, CSV or text
//!
//! # Example
//!
//! ```rust
//! use plunger_core::{MachineConfig, NullTransport, Runtime, SwitchConfig};
//! use plunger_journal::{OutputTrace, Recording, Replayer};
//!
//! let config = MachineConfig::default().with_switch(SwitchConfig::new("start", "Start Button"));
//! let recording = Recording::parse("100 start 1\n180 start 0\n").unwrap();
//!
//! let mut rt = Runtime::virtual_time(config, NullTransport);
//! let trace = OutputTrace::attach(&mut rt);
//! let summary = Replayer::new(&recording).run(&mut rt).unwrap();
//! assert_eq!(summary.applied, 2);
//! assert!(trace.finish(&mut rt).is_empty());
//! ```

mod error;
mod exporter;
mod recording;
mod replayer;
mod trace;

pub use error::{Error, Result};
pub use exporter::{ExportFormat, TraceExporter};
pub use recording::{Recording, SwitchRecorder, Transition};
pub use replayer::{ReplayState, ReplaySummary, Replayer, UnknownSwitch};
pub use trace::{OutputTrace, Trace, TraceEntry};

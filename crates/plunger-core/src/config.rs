//! RON configuration for a machine

use crate::{Error, OutputKey, Result, SwitchId, Value};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::Path;

/// Root configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MachineConfig {
    /// Real-time drain period
    #[serde(default = "default_tick_ms")]
    pub tick_ms: u64,
    /// Retry delay after a device fault
    #[serde(default = "default_retry_ms")]
    pub default_retry_ms: u64,
    /// Extra spacing added to the momentary firing window after each pulse
    #[serde(default = "default_pulse_guard_ms")]
    pub pulse_guard_ms: u64,
    /// Delay between a resolved-output change and the commit attempt (0 = immediate)
    #[serde(default)]
    pub settle_debounce_ms: u64,
    /// Bound of the async task registry
    #[serde(default = "default_max_pending_tasks")]
    pub max_pending_tasks: usize,
    /// Physical switches
    #[serde(default)]
    pub switches: Vec<SwitchConfig>,
    /// Physical outputs driven through the transport
    #[serde(default)]
    pub actuators: Vec<ActuatorConfig>,
    /// Outputs only observed by presentation (lamps shows, music, display)
    #[serde(default)]
    pub outputs: Vec<OutputConfig>,
}

fn default_tick_ms() -> u64 {
    5
}

fn default_retry_ms() -> u64 {
    5
}

fn default_pulse_guard_ms() -> u64 {
    100
}

fn default_max_pending_tasks() -> usize {
    1024
}

impl Default for MachineConfig {
    fn default() -> Self {
        Self {
            tick_ms: default_tick_ms(),
            default_retry_ms: default_retry_ms(),
            pulse_guard_ms: default_pulse_guard_ms(),
            settle_debounce_ms: 0,
            max_pending_tasks: default_max_pending_tasks(),
            switches: Vec::new(),
            actuators: Vec::new(),
            outputs: Vec::new(),
        }
    }
}

/// Switch definition
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SwitchConfig {
    pub id: SwitchId,
    #[serde(default)]
    pub name: String,
    /// Minimum closed time the sensing collaborator must observe before reporting
    #[serde(default)]
    pub min_on_ms: u64,
    /// Minimum open time the sensing collaborator must observe before reporting
    #[serde(default)]
    pub min_off_ms: u64,
}

impl SwitchConfig {
    pub fn new(id: impl Into<SwitchId>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            min_on_ms: 0,
            min_off_ms: 0,
        }
    }

    pub fn min_on(mut self, ms: u64) -> Self {
        self.min_on_ms = ms;
        self
    }

    pub fn min_off(mut self, ms: u64) -> Self {
        self.min_off_ms = ms;
        self
    }
}

/// Commit policy of an actuator
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize, Default)]
pub enum ActuatorKind {
    /// Level output: the device holds whatever value it was set to
    #[default]
    Plain,
    /// Solenoid fired for `pulse_ms` while the desired value is truthy
    Momentary { pulse_ms: u64, min_spacing_ms: u64 },
    /// Solenoid whose pulse grows on consecutive fires and resets after a quiet period
    Escalating {
        initial_ms: u64,
        max_ms: u64,
        steps: u32,
        min_spacing_ms: u64,
        reset_after_ms: u64,
    },
}

impl ActuatorKind {
    pub fn is_pulsed(&self) -> bool {
        !matches!(self, ActuatorKind::Plain)
    }
}

/// Actuator definition
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ActuatorConfig {
    pub key: OutputKey,
    /// Device value at power-up; also the root-level default of the output
    #[serde(default)]
    pub initial: Value,
    #[serde(default)]
    pub kind: ActuatorKind,
}

impl ActuatorConfig {
    pub fn plain(key: impl Into<OutputKey>, initial: impl Into<Value>) -> Self {
        Self {
            key: key.into(),
            initial: initial.into(),
            kind: ActuatorKind::Plain,
        }
    }

    pub fn momentary(key: impl Into<OutputKey>, pulse_ms: u64, min_spacing_ms: u64) -> Self {
        Self {
            key: key.into(),
            initial: Value::Bool(false),
            kind: ActuatorKind::Momentary {
                pulse_ms,
                min_spacing_ms,
            },
        }
    }

    pub fn escalating(
        key: impl Into<OutputKey>,
        initial_ms: u64,
        max_ms: u64,
        steps: u32,
        min_spacing_ms: u64,
        reset_after_ms: u64,
    ) -> Self {
        Self {
            key: key.into(),
            initial: Value::Bool(false),
            kind: ActuatorKind::Escalating {
                initial_ms,
                max_ms,
                steps,
                min_spacing_ms,
                reset_after_ms,
            },
        }
    }
}

/// Output resolved at the root but not committed to a device
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct OutputConfig {
    pub key: OutputKey,
    #[serde(default)]
    pub initial: Value,
}

impl MachineConfig {
    /// Parse and validate a RON document
    pub fn from_ron_str(source: &str) -> Result<Self> {
        let config: MachineConfig =
            ron::from_str(source).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a RON file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let source = fs::read_to_string(path)?;
        Self::from_ron_str(&source)
    }

    pub fn with_switch(mut self, switch: SwitchConfig) -> Self {
        self.switches.push(switch);
        self
    }

    pub fn with_actuator(mut self, actuator: ActuatorConfig) -> Self {
        self.actuators.push(actuator);
        self
    }

    pub fn with_output(mut self, key: impl Into<OutputKey>, initial: impl Into<Value>) -> Self {
        self.outputs.push(OutputConfig {
            key: key.into(),
            initial: initial.into(),
        });
        self
    }

    pub fn validate(&self) -> Result<()> {
        let mut switch_ids = HashSet::new();
        for switch in &self.switches {
            if !switch_ids.insert(&switch.id) {
                return Err(Error::Config(format!("duplicate switch {}", switch.id)));
            }
        }
        let mut keys = HashSet::new();
        let declared = self
            .actuators
            .iter()
            .map(|a| &a.key)
            .chain(self.outputs.iter().map(|o| &o.key));
        for key in declared {
            if !keys.insert(key) {
                return Err(Error::Config(format!("duplicate output {}", key)));
            }
        }
        for actuator in &self.actuators {
            if let ActuatorKind::Escalating {
                initial_ms,
                max_ms,
                steps,
                ..
            } = actuator.kind
            {
                if steps < 2 {
                    return Err(Error::Config(format!(
                        "{}: escalating actuator needs at least 2 steps",
                        actuator.key
                    )));
                }
                if max_ms < initial_ms {
                    return Err(Error::Config(format!(
                        "{}: max_ms below initial_ms",
                        actuator.key
                    )));
                }
            }
        }
        if self.tick_ms == 0 {
            return Err(Error::Config("tick_ms must be positive".into()));
        }
        Ok(())
    }
}

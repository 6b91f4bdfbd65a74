//! Identity types for nodes, reactive objects, switches and outputs

use serde::{Deserialize, Serialize};
use std::fmt;

/// Unique identifier for a behavior node, assigned in creation order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeId(pub u64);

impl NodeId {
    /// Create a new node ID
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    /// Get the raw ID value
    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "node:{}", self.0)
    }
}

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            /// Create a new ID
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            /// Get the ID as a string slice
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self::new(s)
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }
    };
}

string_id! {
    /// Name of an output channel ("rampUp", "lShootAgain", "music")
    OutputKey
}

string_id! {
    /// Name of a physical switch as reported by the switch matrix
    SwitchId
}

/// Owner of a group of reactive fields
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ObjectId {
    /// The machine clock (field `time`)
    Clock,
    /// Fields declared by a behavior node
    Node(NodeId),
    /// Resolved output values of a node's subtree
    Resolved(NodeId),
    /// A physical switch (fields `closed`, `last_change`)
    Switch(SwitchId),
    /// An actuator (fields `desired`, `actual`, `last_actual_change`)
    Actuator(OutputKey),
    /// Free-standing object allocated by the state store
    Object(u64),
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ObjectId::Clock => write!(f, "clock"),
            ObjectId::Node(id) => write!(f, "{}", id),
            ObjectId::Resolved(id) => write!(f, "resolved:{}", id.0),
            ObjectId::Switch(id) => write!(f, "switch:{}", id),
            ObjectId::Actuator(key) => write!(f, "actuator:{}", key),
            ObjectId::Object(raw) => write!(f, "object:{}", raw),
        }
    }
}

/// (owner object, field name): the unit of dependency tracking
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FieldRef {
    pub object: ObjectId,
    pub field: String,
}

impl FieldRef {
    pub fn new(object: ObjectId, field: impl Into<String>) -> Self {
        Self {
            object,
            field: field.into(),
        }
    }

    /// The clock's `time` field
    pub fn clock() -> Self {
        Self::new(ObjectId::Clock, "time")
    }

    /// Resolved value of `key` in the subtree rooted at `node`
    pub fn resolved(node: NodeId, key: &OutputKey) -> Self {
        Self::new(ObjectId::Resolved(node), key.as_str())
    }
}

impl fmt::Display for FieldRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.object, self.field)
    }
}

/// Handle returned by a bus or node subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SubscriptionId(pub u64);

/// Handle returned when scheduling a timer
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TimerId(pub u64);

impl fmt::Display for TimerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "timer:{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_id() {
        let id = NodeId::new(42);
        assert_eq!(id.raw(), 42);
        assert_eq!(format!("{}", id), "node:42");
    }

    #[test]
    fn test_string_ids() {
        let key = OutputKey::new("rampUp");
        assert_eq!(key.as_str(), "rampUp");
        assert_eq!(SwitchId::from("leftFlipper").to_string(), "leftFlipper");
    }

    #[test]
    fn test_field_ref_display() {
        assert_eq!(FieldRef::clock().to_string(), "clock.time");
        let r = FieldRef::resolved(NodeId(3), &OutputKey::new("music"));
        assert_eq!(r.to_string(), "resolved:3.music");
        let s = FieldRef::new(ObjectId::Switch("shooterLane".into()), "closed");
        assert_eq!(s.to_string(), "switch:shooterLane.closed");
    }
}

//! Dynamic values carried by reactive fields, events and outputs
//!
//! Equality is structural: a field write, a binding result or a resolved
//! output only counts as a change when the new value differs by `==`.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Coil state, lamp color list, display frame, counter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    /// Counts and machine times
    Int(i64),
    Float(f64),
    /// Colors, labels, music tracks
    String(String),
    /// Also backs observable sets
    List(Vec<Value>),
    Map(ValueMap),
}

/// Insertion-ordered record, so exported traces read the same on every replay
pub type ValueMap = IndexMap<String, Value>;

impl Value {
    pub fn as_int(&self) -> Option<i64> {
        if let Value::Int(i) = self {
            Some(*i)
        } else {
            None
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        if let Value::List(items) = self {
            Some(items)
        } else {
            None
        }
    }

    pub fn as_map(&self) -> Option<&ValueMap> {
        if let Value::Map(map) = self {
            Some(map)
        } else {
            None
        }
    }

    /// Variant name, for type mismatch errors
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::String(_) => "string",
            Value::List(_) => "list",
            Value::Map(_) => "map",
        }
    }

    /// Whether a pulsed actuator should fire for this desired value
    ///
    /// Null, `false`, zero and empty strings or containers are falsy.
    pub fn is_truthy(&self) -> bool {
        match self {
            Value::Null => false,
            Value::Bool(on) => *on,
            Value::Int(n) => *n != 0,
            Value::Float(x) => *x != 0.0,
            Value::String(s) => !s.is_empty(),
            Value::List(items) => !items.is_empty(),
            Value::Map(map) => !map.is_empty(),
        }
    }
}

fn write_joined<T>(
    f: &mut fmt::Formatter<'_>,
    items: impl Iterator<Item = T>,
    mut each: impl FnMut(&mut fmt::Formatter<'_>, T) -> fmt::Result,
) -> fmt::Result {
    for (i, item) in items.enumerate() {
        if i > 0 {
            f.write_str(", ")?;
        }
        each(f, item)?;
    }
    Ok(())
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => f.write_str("null"),
            Value::Bool(on) => write!(f, "{}", on),
            Value::Int(n) => write!(f, "{}", n),
            Value::Float(x) => write!(f, "{}", x),
            Value::String(s) => write!(f, "{:?}", s),
            Value::List(items) => {
                f.write_str("[")?;
                write_joined(f, items.iter(), |f, v| write!(f, "{}", v))?;
                f.write_str("]")
            }
            Value::Map(map) => {
                f.write_str("{")?;
                write_joined(f, map.iter(), |f, (k, v)| write!(f, "{}: {}", k, v))?;
                f.write_str("}")
            }
        }
    }
}

macro_rules! value_from {
    ($($ty:ty => |$v:ident| $body:expr),* $(,)?) => {
        $(
            impl From<$ty> for Value {
                fn from($v: $ty) -> Self {
                    $body
                }
            }
        )*
    };
}

value_from! {
    bool => |on| Value::Bool(on),
    i32 => |n| Value::Int(n.into()),
    i64 => |n| Value::Int(n),
    u64 => |ms| Value::Int(ms as i64),
    f64 => |x| Value::Float(x),
    String => |s| Value::String(s),
    &str => |s| Value::String(s.to_owned()),
    ValueMap => |map| Value::Map(map),
}

impl<T: Into<Value>> From<Vec<T>> for Value {
    fn from(items: Vec<T>) -> Self {
        Value::List(items.into_iter().map(Into::into).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_coil_truthiness() {
        assert!(!Value::Null.is_truthy());
        assert!(!Value::from(false).is_truthy());
        assert!(Value::from(true).is_truthy());
        assert!(!Value::Int(0).is_truthy());
        assert!(Value::from("fire").is_truthy());
        assert!(!Value::from(Vec::<Value>::new()).is_truthy());
    }

    #[test]
    fn test_change_detection_is_structural() {
        let frame = |color: &str| {
            let mut map = ValueMap::new();
            map.insert("color".into(), color.into());
            map.insert("blink_ms".into(), 250u64.into());
            Value::Map(map)
        };
        assert_eq!(frame("red"), frame("red"));
        assert_ne!(frame("red"), frame("white"));
        assert_ne!(Value::from(vec!["red", "white"]), Value::from(vec!["white", "red"]));
        assert_eq!(frame("red").as_map().map(|m| m.len()), Some(2));
    }

    #[test]
    fn test_display_quotes_strings() {
        assert_eq!(Value::from(vec!["red"]).to_string(), "[\"red\"]");
        assert_eq!(frame_text(), "{track: \"multiball\", loops: 2}");
    }

    fn frame_text() -> String {
        let mut map = ValueMap::new();
        map.insert("track".into(), "multiball".into());
        map.insert("loops".into(), 2i64.into());
        Value::Map(map).to_string()
    }
}

//! Observable collections
//!
//! Handles over a reactive field holding a list, a set or a map. Reads record
//! the field like any other; in-place edits publish `CollectionChanged` and then
//! `StateChanged` so dependents of the whole field are refreshed.

use crate::event::CollectionOp;
use crate::machine::Machine;
use crate::{Error, FieldRef, ObjectId, Result, Value, ValueMap};

fn list_mut<'a>(field: &FieldRef, value: &'a mut Value) -> Result<&'a mut Vec<Value>> {
    match value {
        Value::List(list) => Ok(list),
        other => Err(Error::TypeError {
            field: field.clone(),
            expected: "list".into(),
            got: other.type_name().into(),
        }),
    }
}

fn map_mut<'a>(field: &FieldRef, value: &'a mut Value) -> Result<&'a mut ValueMap> {
    match value {
        Value::Map(map) => Ok(map),
        other => Err(Error::TypeError {
            field: field.clone(),
            expected: "map".into(),
            got: other.type_name().into(),
        }),
    }
}

/// Ordered list field
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ObservableList {
    field: FieldRef,
}

impl ObservableList {
    /// Declare the backing field (idempotent) and return a handle
    pub fn declare(machine: &mut Machine, object: ObjectId, name: &str, initial: Vec<Value>) -> Self {
        Self {
            field: machine.declare(object, name, Value::List(initial)),
        }
    }

    pub fn field(&self) -> &FieldRef {
        &self.field
    }

    /// Current elements; records the read
    pub fn get<'m>(&self, machine: &'m Machine) -> &'m [Value] {
        machine
            .get(&self.field)
            .and_then(Value::as_list)
            .unwrap_or(&[])
    }

    pub fn len(&self, machine: &Machine) -> usize {
        self.get(machine).len()
    }

    pub fn is_empty(&self, machine: &Machine) -> bool {
        self.get(machine).is_empty()
    }

    pub fn push(&self, machine: &mut Machine, value: impl Into<Value>) -> Result<()> {
        let value = value.into();
        let field = self.field.clone();
        machine.mutate_collection(&self.field, move |current| {
            let list = list_mut(&field, current)?;
            let index = list.len();
            list.push(value.clone());
            Ok((Some(CollectionOp::Insert { index, value }), ()))
        })
    }

    pub fn insert(&self, machine: &mut Machine, index: usize, value: impl Into<Value>) -> Result<()> {
        let value = value.into();
        let field = self.field.clone();
        machine.mutate_collection(&self.field, move |current| {
            let list = list_mut(&field, current)?;
            if index > list.len() {
                return Err(Error::IndexOutOfRange {
                    field,
                    index,
                    len: list.len(),
                });
            }
            list.insert(index, value.clone());
            Ok((Some(CollectionOp::Insert { index, value }), ()))
        })
    }

    /// Remove the element at `index`, returning it
    pub fn remove(&self, machine: &mut Machine, index: usize) -> Result<Value> {
        let field = self.field.clone();
        machine.mutate_collection(&self.field, move |current| {
            let list = list_mut(&field, current)?;
            if index >= list.len() {
                return Err(Error::IndexOutOfRange {
                    field,
                    index,
                    len: list.len(),
                });
            }
            let value = list.remove(index);
            Ok((
                Some(CollectionOp::Remove {
                    index,
                    value: value.clone(),
                }),
                value,
            ))
        })
    }

    /// Replace the element at `index`
    pub fn replace(&self, machine: &mut Machine, index: usize, value: impl Into<Value>) -> Result<()> {
        let value = value.into();
        let field = self.field.clone();
        machine.mutate_collection(&self.field, move |current| {
            let list = list_mut(&field, current)?;
            let len = list.len();
            let slot = list.get_mut(index).ok_or(Error::IndexOutOfRange {
                field: field.clone(),
                index,
                len,
            })?;
            let old = std::mem::replace(slot, value.clone());
            Ok((Some(CollectionOp::Replace { index, value, old }), ()))
        })
    }

    pub fn clear(&self, machine: &mut Machine) -> Result<()> {
        let field = self.field.clone();
        machine.mutate_collection(&self.field, move |current| {
            list_mut(&field, current)?.clear();
            Ok((Some(CollectionOp::Clear), ()))
        })
    }
}

/// Set field: a list whose elements are unique, kept in insertion order
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ObservableSet {
    field: FieldRef,
}

impl ObservableSet {
    pub fn declare(machine: &mut Machine, object: ObjectId, name: &str, initial: Vec<Value>) -> Self {
        let mut unique: Vec<Value> = Vec::with_capacity(initial.len());
        for value in initial {
            if !unique.contains(&value) {
                unique.push(value);
            }
        }
        Self {
            field: machine.declare(object, name, Value::List(unique)),
        }
    }

    pub fn field(&self) -> &FieldRef {
        &self.field
    }

    /// Current members; records the read
    pub fn get<'m>(&self, machine: &'m Machine) -> &'m [Value] {
        machine
            .get(&self.field)
            .and_then(Value::as_list)
            .unwrap_or(&[])
    }

    pub fn contains(&self, machine: &Machine, value: &Value) -> bool {
        self.get(machine).contains(value)
    }

    pub fn len(&self, machine: &Machine) -> usize {
        self.get(machine).len()
    }

    pub fn is_empty(&self, machine: &Machine) -> bool {
        self.get(machine).is_empty()
    }

    /// Add a member. Returns false (and publishes nothing) if it was present.
    pub fn insert(&self, machine: &mut Machine, value: impl Into<Value>) -> Result<bool> {
        let value = value.into();
        let field = self.field.clone();
        machine.mutate_collection(&self.field, move |current| {
            let list = list_mut(&field, current)?;
            if list.contains(&value) {
                return Ok((None, false));
            }
            let index = list.len();
            list.push(value.clone());
            Ok((Some(CollectionOp::Insert { index, value }), true))
        })
    }

    /// Remove a member. Returns false if it was absent.
    pub fn remove(&self, machine: &mut Machine, value: &Value) -> Result<bool> {
        let field = self.field.clone();
        let value = value.clone();
        machine.mutate_collection(&self.field, move |current| {
            let list = list_mut(&field, current)?;
            match list.iter().position(|v| *v == value) {
                Some(index) => {
                    let value = list.remove(index);
                    Ok((Some(CollectionOp::Remove { index, value }), true))
                }
                None => Ok((None, false)),
            }
        })
    }

    pub fn clear(&self, machine: &mut Machine) -> Result<()> {
        let field = self.field.clone();
        machine.mutate_collection(&self.field, move |current| {
            list_mut(&field, current)?.clear();
            Ok((Some(CollectionOp::Clear), ()))
        })
    }
}

/// Map field with string keys
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ObservableMap {
    field: FieldRef,
}

impl ObservableMap {
    pub fn declare(machine: &mut Machine, object: ObjectId, name: &str, initial: ValueMap) -> Self {
        Self {
            field: machine.declare(object, name, Value::Map(initial)),
        }
    }

    pub fn field(&self) -> &FieldRef {
        &self.field
    }

    /// Value stored under `key`; records a read of the whole map
    pub fn get<'m>(&self, machine: &'m Machine, key: &str) -> Option<&'m Value> {
        machine
            .get(&self.field)
            .and_then(Value::as_map)
            .and_then(|map| map.get(key))
    }

    pub fn len(&self, machine: &Machine) -> usize {
        machine
            .get(&self.field)
            .and_then(Value::as_map)
            .map(|map| map.len())
            .unwrap_or(0)
    }

    pub fn is_empty(&self, machine: &Machine) -> bool {
        self.len(machine) == 0
    }

    /// Write an entry. Writing an equal value publishes nothing.
    pub fn put(&self, machine: &mut Machine, key: &str, value: impl Into<Value>) -> Result<()> {
        let value = value.into();
        let field = self.field.clone();
        let key = key.to_string();
        machine.mutate_collection(&self.field, move |current| {
            let map = map_mut(&field, current)?;
            let old = map.insert(key.clone(), value.clone());
            Ok((Some(CollectionOp::Put { key, value, old }), ()))
        })
    }

    /// Delete an entry, returning its value
    pub fn delete(&self, machine: &mut Machine, key: &str) -> Result<Option<Value>> {
        let field = self.field.clone();
        let key = key.to_string();
        machine.mutate_collection(&self.field, move |current| {
            let map = map_mut(&field, current)?;
            match map.shift_remove(&key) {
                Some(old) => Ok((
                    Some(CollectionOp::Delete {
                        key,
                        old: old.clone(),
                    }),
                    Some(old),
                )),
                None => Ok((None, None)),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventKind;
    use crate::testing::Recorder;
    use crate::Runtime;

    #[test]
    fn test_list_mutations_publish_collection_then_state() {
        let mut rt = Runtime::headless();
        let events = Recorder::attach(&rt);
        rt.with(|m| {
            let obj = m.allocate_object();
            let lamps = ObservableList::declare(m, obj, "lamps", vec![]);
            lamps.push(m, "red").unwrap();
            lamps.insert(m, 0, "white").unwrap();
            assert_eq!(lamps.get(m), &[Value::from("white"), Value::from("red")]);
            assert_eq!(lamps.remove(m, 1).unwrap(), Value::from("red"));
            assert!(lamps.remove(m, 5).is_err());
        });

        let kinds: Vec<&'static str> = events
            .events()
            .iter()
            .filter_map(|e| match &e.kind {
                EventKind::CollectionChanged { .. } => Some("collection"),
                EventKind::StateChanged { .. } => Some("state"),
                _ => None,
            })
            .collect();
        assert_eq!(
            kinds,
            vec!["collection", "state", "collection", "state", "collection", "state"]
        );
    }

    #[test]
    fn test_set_keeps_members_unique() {
        let mut rt = Runtime::headless();
        let events = Recorder::attach(&rt);
        rt.with(|m| {
            let obj = m.allocate_object();
            let lit = ObservableSet::declare(m, obj, "lit", vec!["a".into(), "a".into()]);
            assert_eq!(lit.len(m), 1);
            assert!(lit.insert(m, "b").unwrap());
            assert!(!lit.insert(m, "b").unwrap());
            assert!(lit.contains(m, &Value::from("b")));
            assert!(lit.remove(m, &Value::from("a")).unwrap());
            assert!(!lit.remove(m, &Value::from("a")).unwrap());
        });
        assert_eq!(events.state_changes().len(), 2);
    }

    #[test]
    fn test_map_put_and_delete() {
        let mut rt = Runtime::headless();
        let events = Recorder::attach(&rt);
        rt.with(|m| {
            let obj = m.allocate_object();
            let scores = ObservableMap::declare(m, obj, "scores", ValueMap::new());
            scores.put(m, "p1", 100i64).unwrap();
            scores.put(m, "p1", 100i64).unwrap();
            assert_eq!(scores.get(m, "p1"), Some(&Value::Int(100)));
            assert_eq!(scores.delete(m, "p1").unwrap(), Some(Value::Int(100)));
            assert_eq!(scores.delete(m, "p1").unwrap(), None);
            assert!(scores.is_empty(m));
        });
        assert_eq!(events.state_changes().len(), 2);
    }

    #[test]
    fn test_type_mismatch() {
        let mut rt = Runtime::headless();
        rt.with(|m| {
            let obj = m.allocate_object();
            m.declare(obj.clone(), "count", 3i64);
            let wrong = ObservableList {
                field: FieldRef::new(obj, "count"),
            };
            assert!(matches!(wrong.push(m, 1i64), Err(Error::TypeError { .. })));
        });
    }
}

//! Reactive state container
//!
//! Fields live on objects (`ObjectId`) and are addressed by `FieldRef`. Every
//! read made through `get` while a recording is active lands in that recording,
//! which is how output bindings learn their dependencies. Writes go through the
//! machine so a change is published as a `StateChanged` event.

use crate::event::{CollectionOp, EventKind};
use crate::machine::Machine;
use crate::{Error, FieldRef, ObjectId, Result, Value};
use indexmap::{IndexMap, IndexSet};
use std::cell::RefCell;
use std::collections::HashMap;
use tracing::trace;

/// Storage for every reactive field plus the access recorder stack
#[derive(Debug, Default)]
pub struct StateStore {
    objects: HashMap<ObjectId, IndexMap<String, Value>>,
    recorders: RefCell<Vec<IndexSet<FieldRef>>>,
    next_object: u64,
}

impl StateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a fresh free-standing object
    pub fn allocate(&mut self) -> ObjectId {
        self.next_object += 1;
        let id = ObjectId::Object(self.next_object);
        self.objects.insert(id.clone(), IndexMap::new());
        id
    }

    /// Declare a field with an initial value
    ///
    /// Re-declaring an existing field leaves its current value untouched and
    /// returns false.
    pub fn declare(&mut self, object: &ObjectId, field: &str, initial: Value) -> bool {
        let fields = self.objects.entry(object.clone()).or_default();
        if fields.contains_key(field) {
            return false;
        }
        fields.insert(field.to_string(), initial);
        true
    }

    pub fn is_declared(&self, field: &FieldRef) -> bool {
        self.peek(field).is_some()
    }

    /// Read a field, recording the access
    pub fn get(&self, field: &FieldRef) -> Option<&Value> {
        self.record(field);
        self.peek(field)
    }

    /// Read a field without recording the access
    pub fn peek(&self, field: &FieldRef) -> Option<&Value> {
        self.objects
            .get(&field.object)
            .and_then(|fields| fields.get(&field.field))
    }

    /// Names and values of every field on an object, in declaration order
    pub fn fields_of(&self, object: &ObjectId) -> impl Iterator<Item = (&str, &Value)> {
        self.objects
            .get(object)
            .into_iter()
            .flat_map(|fields| fields.iter().map(|(k, v)| (k.as_str(), v)))
    }

    /// Note a read in every active recording
    ///
    /// Used directly for values that are not stored here, like resolved outputs.
    pub fn record(&self, field: &FieldRef) {
        let mut recorders = self.recorders.borrow_mut();
        for frame in recorders.iter_mut() {
            frame.insert(field.clone());
        }
    }

    /// Push a recording frame; nested frames also record into outer ones
    pub fn begin_recording(&self) {
        self.recorders.borrow_mut().push(IndexSet::new());
    }

    /// Pop the innermost frame and return the fields it read
    pub fn end_recording(&self) -> IndexSet<FieldRef> {
        self.recorders.borrow_mut().pop().unwrap_or_default()
    }

    pub fn is_recording(&self) -> bool {
        !self.recorders.borrow().is_empty()
    }

    /// Replace a field's value. Returns the old value if it changed.
    pub(crate) fn write(&mut self, field: &FieldRef, value: Value) -> Result<Option<Value>> {
        let slot = self
            .objects
            .get_mut(&field.object)
            .and_then(|fields| fields.get_mut(&field.field))
            .ok_or_else(|| Error::UndeclaredField(field.clone()))?;
        if *slot == value {
            return Ok(None);
        }
        Ok(Some(std::mem::replace(slot, value)))
    }
}

impl Machine {
    /// Allocate a free-standing reactive object
    pub fn allocate_object(&mut self) -> ObjectId {
        self.state.allocate()
    }

    /// Declare a reactive field; idempotent
    pub fn declare(&mut self, object: ObjectId, field: &str, initial: impl Into<Value>) -> FieldRef {
        self.state.declare(&object, field, initial.into());
        FieldRef::new(object, field)
    }

    /// Read a reactive field, recording the access if a recording is active
    pub fn get(&self, field: &FieldRef) -> Option<&Value> {
        self.state.get(field)
    }

    /// Read a boolean field, treating anything else as false
    pub fn get_bool(&self, field: &FieldRef) -> bool {
        self.get(field).map(Value::is_truthy).unwrap_or(false)
    }

    /// Read-only view of the state container
    pub fn state(&self) -> &StateStore {
        &self.state
    }

    /// Write a reactive field
    ///
    /// Publishes `StateChanged` and returns true if the value differs from the
    /// stored one; an equal write is silent.
    pub fn set(&mut self, field: &FieldRef, value: impl Into<Value>) -> Result<bool> {
        let value = value.into();
        match self.state.write(field, value.clone())? {
            Some(old) => {
                trace!(field = %field, %value, %old, "state changed");
                self.emit(EventKind::StateChanged {
                    field: field.clone(),
                    value,
                    old,
                });
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Apply an in-place edit to a collection field
    ///
    /// `edit` receives a copy of the current value and reports the operation it
    /// performed. If the value actually changed, `CollectionChanged` is published
    /// followed by `StateChanged`.
    pub(crate) fn mutate_collection<R>(
        &mut self,
        field: &FieldRef,
        edit: impl FnOnce(&mut Value) -> Result<(Option<CollectionOp>, R)>,
    ) -> Result<R> {
        let current = self
            .state
            .peek(field)
            .cloned()
            .ok_or_else(|| Error::UndeclaredField(field.clone()))?;
        let mut next = current.clone();
        let (op, out) = edit(&mut next)?;
        let Some(op) = op else {
            return Ok(out);
        };
        if next == current {
            return Ok(out);
        }
        self.state.write(field, next.clone())?;
        self.emit(EventKind::CollectionChanged {
            field: field.clone(),
            op,
        });
        self.emit(EventKind::StateChanged {
            field: field.clone(),
            value: next,
            old: current,
        });
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::Recorder;
    use crate::Runtime;

    #[test]
    fn test_declare_is_idempotent() {
        let mut store = StateStore::new();
        let obj = store.allocate();
        assert!(store.declare(&obj, "score", Value::Int(0)));
        store.write(&FieldRef::new(obj.clone(), "score"), Value::Int(7)).unwrap();
        assert!(!store.declare(&obj, "score", Value::Int(0)));
        assert_eq!(store.peek(&FieldRef::new(obj, "score")), Some(&Value::Int(7)));
    }

    #[test]
    fn test_write_undeclared_fails() {
        let mut store = StateStore::new();
        let obj = store.allocate();
        let err = store.write(&FieldRef::new(obj, "missing"), Value::Bool(true));
        assert!(matches!(err, Err(Error::UndeclaredField(_))));
    }

    #[test]
    fn test_equal_write_reports_no_change() {
        let mut store = StateStore::new();
        let obj = store.allocate();
        store.declare(&obj, "lit", Value::Bool(false));
        let field = FieldRef::new(obj, "lit");
        assert!(store.write(&field, Value::Bool(false)).unwrap().is_none());
        assert_eq!(
            store.write(&field, Value::Bool(true)).unwrap(),
            Some(Value::Bool(false))
        );
    }

    #[test]
    fn test_recording_nests() {
        let mut store = StateStore::new();
        let obj = store.allocate();
        store.declare(&obj, "a", Value::Int(1));
        store.declare(&obj, "b", Value::Int(2));
        let a = FieldRef::new(obj.clone(), "a");
        let b = FieldRef::new(obj, "b");

        store.get(&a);
        store.begin_recording();
        store.get(&a);
        store.begin_recording();
        store.get(&b);
        let inner = store.end_recording();
        store.peek(&b);
        let outer = store.end_recording();

        assert_eq!(inner.len(), 1);
        assert!(inner.contains(&b));
        assert_eq!(outer.len(), 2);
        assert!(!store.is_recording());
    }

    #[test]
    fn test_set_publishes_once_per_change() {
        let mut rt = Runtime::headless();
        let events = Recorder::attach(&rt);
        rt.with(|m| {
            let obj = m.allocate_object();
            let field = m.declare(obj, "mode", "attract");
            assert!(m.set(&field, "game").unwrap());
            assert!(!m.set(&field, "game").unwrap());
        });
        let changes = events.state_changes();
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].1, Value::from("game"));
        assert_eq!(changes[0].2, Value::from("attract"));
    }
}

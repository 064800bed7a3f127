//! Diff generator: turns collection notifications into patch operations.
//!
//! ```text
//! on_inserted(i, item)        → add     "/-"          value = item
//! on_removed(i, item)         → remove  "/{i}"        key   = key(item)
//! on_field_changed(item, f)   → replace "/{index}/f"  value = new value
//!                                        index = current position of key(item)
//! ```
//!
//! Operations are handed to the [`OperationSink`] synchronously, on the
//! mutating thread, in mutation order.

use autopatch_core::{ItemKey, Operation, TypeDescriptor};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashSet;

use crate::collection::ChangeObserver;
use crate::error::TrackError;

/// Destination for emitted operations.
pub trait OperationSink: Send + Sync {
    fn emit(&self, op: Operation);
}

/// Observer of one tracked collection that emits patch operations.
pub struct DiffGenerator<T, S> {
    descriptor: TypeDescriptor<T>,
    excluded_fields: HashSet<String>,
    /// Keys of live items in collection order
    order: Mutex<Vec<ItemKey>>,
    sink: S,
}

impl<T: 'static, S: OperationSink> DiffGenerator<T, S> {
    pub fn new(descriptor: TypeDescriptor<T>, excluded_fields: HashSet<String>, sink: S) -> Self {
        Self {
            descriptor,
            excluded_fields,
            order: Mutex::new(Vec::new()),
            sink,
        }
    }

    /// Number of items currently observed.
    pub fn observed(&self) -> usize {
        self.order.lock().len()
    }

    fn type_name(&self) -> &str {
        self.descriptor.type_name()
    }
}

impl<T, S> ChangeObserver<T> for DiffGenerator<T, S>
where
    T: Serialize + Send + Sync + 'static,
    S: OperationSink,
{
    fn on_tracking_started(&self, items: &[T]) -> Result<(), TrackError> {
        let mut seen = HashSet::with_capacity(items.len());
        let mut keys = Vec::with_capacity(items.len());
        for item in items {
            let key = self.descriptor.key_of(item);
            if !seen.insert(key.clone()) {
                log::error!("Duplicate key {key} while starting to track {}", self.type_name());
                return Err(TrackError::DuplicateKey {
                    type_name: self.type_name().to_owned(),
                    key,
                });
            }
            keys.push(key);
        }
        *self.order.lock() = keys;
        Ok(())
    }

    fn on_inserted(&self, index: usize, item: &T) -> Result<(), TrackError> {
        let value = serde_json::to_value(item)
            .map_err(|e| TrackError::SerializationError(e.to_string()))?;
        let key = self.descriptor.key_of(item);
        {
            let mut order = self.order.lock();
            let at = index.min(order.len());
            order.insert(at, key);
        }
        log::trace!("{}: add at {index}", self.type_name());
        self.sink.emit(Operation::add(value));
        Ok(())
    }

    fn on_removed(&self, index: usize, item: &T) -> Result<(), TrackError> {
        let key = self.descriptor.key_of(item);
        {
            let mut order = self.order.lock();
            match order.iter().position(|k| *k == key) {
                Some(position) => {
                    if position != index {
                        log::warn!(
                            "{}: removed {key} at {index} but it was observed at {position}",
                            self.type_name()
                        );
                    }
                    order.remove(position);
                }
                None => {
                    return Err(TrackError::UnknownItem {
                        type_name: self.type_name().to_owned(),
                        key,
                    })
                }
            }
        }
        log::trace!("{}: remove at {index}", self.type_name());
        self.sink.emit(Operation::remove(index, key));
        Ok(())
    }

    fn on_field_changed(&self, item: &T, field: &str, value: &Value) -> Result<(), TrackError> {
        if self.excluded_fields.contains(field) {
            return Ok(());
        }
        let key = self.descriptor.key_of(item);
        let index = self
            .order
            .lock()
            .iter()
            .position(|k| *k == key)
            .ok_or_else(|| TrackError::UnknownItem {
                type_name: self.type_name().to_owned(),
                key: key.clone(),
            })?;
        log::trace!("{}: replace {field} at {index}", self.type_name());
        self.sink.emit(Operation::replace(index, field, value.clone(), key));
        Ok(())
    }
}

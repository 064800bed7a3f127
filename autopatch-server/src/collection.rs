//! Observable ordered collection.
//!
//! Application code mutates a [`TrackedCollection`]; every structural or field
//! change is reported to the attached [`ChangeObserver`]:
//!
//! ```text
//! push / remove / remove_at ──► on_inserted / on_removed      (sequence events)
//! update / notify_field_changed ──► on_field_changed          (field events)
//! ```
//!
//! All mutations of one collection are expected to come from one logical
//! thread. Notifications are delivered while the collection's write lock is
//! held, so observers see events in mutation order. A mutation whose
//! notification fails is rolled back before the error is returned.

use autopatch_core::{ItemKey, TypeDescriptor};
use parking_lot::RwLock;
use serde_json::Value;
use std::sync::Arc;

use crate::error::TrackError;

/// Receiver of collection change notifications.
pub trait ChangeObserver<T>: Send + Sync {
    /// Called once when the observer is attached, with the items already present.
    fn on_tracking_started(&self, _items: &[T]) -> Result<(), TrackError> {
        Ok(())
    }

    fn on_inserted(&self, index: usize, item: &T) -> Result<(), TrackError>;

    fn on_removed(&self, index: usize, item: &T) -> Result<(), TrackError>;

    fn on_field_changed(&self, item: &T, field: &str, value: &Value) -> Result<(), TrackError>;
}

struct CollectionState<T> {
    items: Vec<T>,
    observer: Option<Arc<dyn ChangeObserver<T>>>,
}

/// Shared handle to an observable ordered collection of `T`.
///
/// Cloning the handle shares the underlying collection.
pub struct TrackedCollection<T> {
    descriptor: TypeDescriptor<T>,
    state: Arc<RwLock<CollectionState<T>>>,
}

impl<T> Clone for TrackedCollection<T> {
    fn clone(&self) -> Self {
        Self {
            descriptor: self.descriptor.clone(),
            state: self.state.clone(),
        }
    }
}

impl<T: Send + Sync + 'static> TrackedCollection<T> {
    pub fn new(descriptor: TypeDescriptor<T>) -> Self {
        Self::with_items(descriptor, Vec::new())
    }

    /// Collection pre-populated with `items`; keys are checked once tracking starts.
    pub fn with_items(descriptor: TypeDescriptor<T>, items: Vec<T>) -> Self {
        Self {
            descriptor,
            state: Arc::new(RwLock::new(CollectionState {
                items,
                observer: None,
            })),
        }
    }

    pub fn descriptor(&self) -> &TypeDescriptor<T> {
        &self.descriptor
    }

    /// Attach `observer` and start reporting changes to it.
    pub fn start_tracking(&self, observer: Arc<dyn ChangeObserver<T>>) -> Result<(), TrackError> {
        let mut state = self.state.write();
        if state.observer.is_some() {
            return Err(TrackError::AlreadyTracking(
                self.descriptor.type_name().to_owned(),
            ));
        }
        observer.on_tracking_started(&state.items)?;
        state.observer = Some(observer);
        log::debug!(
            "Tracking started for {} ({} items)",
            self.descriptor.type_name(),
            state.items.len()
        );
        Ok(())
    }

    /// Detach the observer; later mutations are no longer reported.
    pub fn stop_tracking(&self) {
        if self.state.write().observer.take().is_some() {
            log::debug!("Tracking stopped for {}", self.descriptor.type_name());
        }
    }

    pub fn is_tracking(&self) -> bool {
        self.state.read().observer.is_some()
    }

    /// Append `item` at the tail.
    pub fn push(&self, item: T) -> Result<(), TrackError> {
        let key = self.descriptor.key_of(&item);
        let mut guard = self.state.write();
        let state = &mut *guard;
        if self.position(&state.items, &key).is_some() {
            return Err(self.duplicate(key));
        }
        state.items.push(item);
        let index = state.items.len() - 1;
        if let Some(observer) = &state.observer {
            if let Err(e) = observer.on_inserted(index, &state.items[index]) {
                state.items.pop();
                return Err(e);
            }
        }
        Ok(())
    }

    /// Remove the item identified by `key`.
    pub fn remove(&self, key: &ItemKey) -> Result<T, TrackError> {
        let mut state = self.state.write();
        let index = self
            .position(&state.items, key)
            .ok_or_else(|| self.unknown(key.clone()))?;
        Self::remove_locked(&mut state, index)
    }

    pub fn remove_at(&self, index: usize) -> Result<T, TrackError> {
        let mut state = self.state.write();
        let len = state.items.len();
        if index >= len {
            return Err(TrackError::IndexOutOfBounds { index, len });
        }
        Self::remove_locked(&mut state, index)
    }

    fn remove_locked(state: &mut CollectionState<T>, index: usize) -> Result<T, TrackError> {
        let item = state.items.remove(index);
        if let Some(observer) = &state.observer {
            if let Err(e) = observer.on_removed(index, &item) {
                state.items.insert(index, item);
                return Err(e);
            }
        }
        Ok(item)
    }

    /// Mutate the item identified by `key` in place.
    ///
    /// Every field of the accessor table whose value differs afterwards is
    /// reported as a field change. Returns the number of changed fields. An
    /// update that changes the identity key is reverted.
    pub fn update<F>(&self, key: &ItemKey, mutate: F) -> Result<usize, TrackError>
    where
        T: Clone,
        F: FnOnce(&mut T),
    {
        let mut guard = self.state.write();
        let state = &mut *guard;
        let index = self
            .position(&state.items, key)
            .ok_or_else(|| self.unknown(key.clone()))?;

        let fields = self.descriptor.fields();
        let original = state.items[index].clone();
        let before = fields.read_all(&original);

        mutate(&mut state.items[index]);

        let new_key = self.descriptor.key_of(&state.items[index]);
        if new_key != *key {
            state.items[index] = original;
            return Err(TrackError::KeyChanged {
                type_name: self.descriptor.type_name().to_owned(),
                from: key.clone(),
                to: new_key,
            });
        }

        let after = fields.read_all(&state.items[index]);
        let mut changed = 0;
        for ((name, old), new) in fields.names().zip(&before).zip(&after) {
            if old == new {
                continue;
            }
            changed += 1;
            if let Some(observer) = &state.observer {
                if let Err(e) = observer.on_field_changed(&state.items[index], name, new) {
                    state.items[index] = original;
                    return Err(e);
                }
            }
        }
        Ok(changed)
    }

    /// Report an in-place change of `field` that the collection could not see.
    pub fn notify_field_changed(&self, key: &ItemKey, field: &str) -> Result<(), TrackError> {
        let state = self.state.write();
        let index = self
            .position(&state.items, key)
            .ok_or_else(|| self.unknown(key.clone()))?;
        let item = &state.items[index];
        let value = self
            .descriptor
            .fields()
            .get(item, field)
            .ok_or_else(|| TrackError::UnknownField {
                type_name: self.descriptor.type_name().to_owned(),
                field: field.to_owned(),
            })?;
        if let Some(observer) = &state.observer {
            observer.on_field_changed(item, field, &value)?;
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.state.read().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.read().items.is_empty()
    }

    pub fn index_of(&self, key: &ItemKey) -> Option<usize> {
        self.position(&self.state.read().items, key)
    }

    pub fn get(&self, key: &ItemKey) -> Option<T>
    where
        T: Clone,
    {
        let state = self.state.read();
        self.position(&state.items, key)
            .map(|i| state.items[i].clone())
    }

    pub fn items(&self) -> Vec<T>
    where
        T: Clone,
    {
        self.state.read().items.clone()
    }

    /// Run `f` over the current items under the read lock.
    ///
    /// No mutation can interleave with `f`, which makes this the point at
    /// which snapshots are taken.
    pub fn read<R>(&self, f: impl FnOnce(&[T]) -> R) -> R {
        f(&self.state.read().items)
    }

    fn position(&self, items: &[T], key: &ItemKey) -> Option<usize> {
        items
            .iter()
            .position(|item| self.descriptor.key_of(item) == *key)
    }

    fn duplicate(&self, key: ItemKey) -> TrackError {
        TrackError::DuplicateKey {
            type_name: self.descriptor.type_name().to_owned(),
            key,
        }
    }

    fn unknown(&self, key: ItemKey) -> TrackError {
        TrackError::UnknownItem {
            type_name: self.descriptor.type_name().to_owned(),
            key,
        }
    }
}

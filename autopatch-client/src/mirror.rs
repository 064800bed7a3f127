//! Client-local replica of a tracked collection.

use autopatch_core::{ItemKey, TypeDescriptor};
use parking_lot::RwLock;
use std::sync::Arc;
use tokio::sync::watch;

struct MirrorInner<T> {
    descriptor: TypeDescriptor<T>,
    items: RwLock<Vec<T>>,
    version: watch::Sender<u64>,
}

/// Read-only view of a subscribed collection.
///
/// Only applied batches mutate a mirror. Each batch is applied under the
/// write lock as a whole, then the version is bumped once, so readers never
/// see a half-applied batch.
pub struct Mirror<T> {
    inner: Arc<MirrorInner<T>>,
}

impl<T> Clone for Mirror<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Clone + Send + Sync + 'static> Mirror<T> {
    pub(crate) fn new(descriptor: TypeDescriptor<T>) -> Self {
        let (version, _) = watch::channel(0);
        Self {
            inner: Arc::new(MirrorInner {
                descriptor,
                items: RwLock::new(Vec::new()),
                version,
            }),
        }
    }

    pub fn type_name(&self) -> &str {
        self.inner.descriptor.type_name()
    }

    pub fn descriptor(&self) -> &TypeDescriptor<T> {
        &self.inner.descriptor
    }

    pub fn items(&self) -> Vec<T> {
        self.inner.items.read().clone()
    }

    pub fn len(&self) -> usize {
        self.inner.items.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.items.read().is_empty()
    }

    pub fn get(&self, key: &ItemKey) -> Option<T> {
        let items = self.inner.items.read();
        items
            .iter()
            .find(|item| self.inner.descriptor.key_of(item) == *key)
            .cloned()
    }

    pub fn index_of(&self, key: &ItemKey) -> Option<usize> {
        self.inner
            .items
            .read()
            .iter()
            .position(|item| self.inner.descriptor.key_of(item) == *key)
    }

    /// Run `f` over a consistent view of the items.
    pub fn read<R>(&self, f: impl FnOnce(&[T]) -> R) -> R {
        f(&self.inner.items.read())
    }

    /// Number of batches applied so far.
    pub fn version(&self) -> u64 {
        *self.inner.version.borrow()
    }

    /// Receiver notified after every applied batch.
    pub fn changes(&self) -> watch::Receiver<u64> {
        self.inner.version.subscribe()
    }

    /// Apply one batch under the write lock and bump the version.
    pub(crate) fn write_batch<R>(&self, f: impl FnOnce(&mut Vec<T>) -> R) -> R {
        let result = f(&mut self.inner.items.write());
        self.inner.version.send_modify(|v| *v += 1);
        result
    }
}

//! Applies received operation batches to a mirror.
//!
//! ```text
//! add      "/-"          → deserialize value, append
//! remove   "/{i}"        → resolve target, remove
//! replace  "/{i}/{f}"    → resolve target, set field f through the accessor table
//! ```
//!
//! The target of `remove` and `replace` is resolved by identity key when the
//! operation carries one, and by path index otherwise. An operation whose
//! target cannot be resolved is dropped and reported; the rest of the batch
//! still applies.

use autopatch_core::{FieldError, ItemKey, OpKind, Operation, PatchPath, TypeDescriptor};
use serde::de::DeserializeOwned;
use std::fmt;

use crate::mirror::Mirror;

/// A dropped operation.
#[derive(Debug, Clone, PartialEq)]
pub enum Inconsistency {
    /// No item matches the operation's key or index
    UnknownItem { path: PatchPath, key: Option<ItemKey> },
    UnknownField { path: PatchPath, field: String },
    InvalidValue { path: PatchPath, reason: String },
    MissingValue { path: PatchPath },
    /// The operation does not fit its path or batch kind
    UnexpectedOp { kind: OpKind, path: PatchPath },
}

impl fmt::Display for Inconsistency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownItem { path, key: Some(key) } => {
                write!(f, "No item with key {key} (path {path})")
            }
            Self::UnknownItem { path, key: None } => write!(f, "No item at {path}"),
            Self::UnknownField { path, field } => write!(f, "Unknown field {field} at {path}"),
            Self::InvalidValue { path, reason } => write!(f, "Invalid value at {path}: {reason}"),
            Self::MissingValue { path } => write!(f, "Missing value at {path}"),
            Self::UnexpectedOp { kind, path } => write!(f, "Unexpected {kind:?} at {path}"),
        }
    }
}

/// Outcome of applying one batch.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ApplyReport {
    pub applied: usize,
    pub inconsistencies: Vec<Inconsistency>,
}

impl ApplyReport {
    pub fn is_clean(&self) -> bool {
        self.inconsistencies.is_empty()
    }
}

pub struct PatchApplier<T> {
    descriptor: TypeDescriptor<T>,
}

impl<T> PatchApplier<T>
where
    T: DeserializeOwned + Clone + Send + Sync + 'static,
{
    pub fn new(descriptor: TypeDescriptor<T>) -> Self {
        Self { descriptor }
    }

    /// Apply an incremental batch to `mirror` as one unit.
    pub fn apply_batch(&self, mirror: &Mirror<T>, ops: &[Operation]) -> ApplyReport {
        let report = mirror.write_batch(|items| self.apply_to(items, ops));
        self.log_report(&report);
        report
    }

    /// Replace the contents of `mirror` with the items of a snapshot.
    pub fn apply_snapshot(&self, mirror: &Mirror<T>, ops: &[Operation]) -> ApplyReport {
        let mut fresh = Vec::with_capacity(ops.len());
        let mut report = ApplyReport::default();
        for op in ops {
            if op.kind() != OpKind::Add {
                report.inconsistencies.push(Inconsistency::UnexpectedOp {
                    kind: op.kind(),
                    path: op.path().clone(),
                });
                continue;
            }
            match self.apply_one(&mut fresh, op) {
                Ok(()) => report.applied += 1,
                Err(inconsistency) => report.inconsistencies.push(inconsistency),
            }
        }
        mirror.write_batch(|items| *items = fresh);
        log::debug!(
            "Snapshot of {} applied ({} items)",
            self.descriptor.type_name(),
            report.applied
        );
        self.log_report(&report);
        report
    }

    /// Apply `ops` in order to a plain item list.
    pub fn apply_to(&self, items: &mut Vec<T>, ops: &[Operation]) -> ApplyReport {
        let mut report = ApplyReport::default();
        for op in ops {
            match self.apply_one(items, op) {
                Ok(()) => report.applied += 1,
                Err(inconsistency) => report.inconsistencies.push(inconsistency),
            }
        }
        report
    }

    fn apply_one(&self, items: &mut Vec<T>, op: &Operation) -> Result<(), Inconsistency> {
        let path = op.path();
        match op.kind() {
            OpKind::Add => {
                if *path != PatchPath::Append {
                    return Err(Inconsistency::UnexpectedOp {
                        kind: OpKind::Add,
                        path: path.clone(),
                    });
                }
                let value = op
                    .value()
                    .cloned()
                    .ok_or_else(|| Inconsistency::MissingValue { path: path.clone() })?;
                let item = serde_json::from_value(value).map_err(|e| Inconsistency::InvalidValue {
                    path: path.clone(),
                    reason: e.to_string(),
                })?;
                items.push(item);
                Ok(())
            }
            OpKind::Remove => {
                let index = self.resolve(items, op)?;
                items.remove(index);
                Ok(())
            }
            OpKind::Replace => {
                let Some(field) = path.field() else {
                    return Err(Inconsistency::UnexpectedOp {
                        kind: OpKind::Replace,
                        path: path.clone(),
                    });
                };
                let value = op
                    .value()
                    .cloned()
                    .ok_or_else(|| Inconsistency::MissingValue { path: path.clone() })?;
                let index = self.resolve(items, op)?;
                self.descriptor
                    .fields()
                    .set(&mut items[index], field, value)
                    .map_err(|e| match e {
                        FieldError::UnknownField(field) | FieldError::ReadOnly(field) => {
                            Inconsistency::UnknownField {
                                path: path.clone(),
                                field,
                            }
                        }
                        FieldError::InvalidValue { reason, .. } => Inconsistency::InvalidValue {
                            path: path.clone(),
                            reason,
                        },
                    })
            }
        }
    }

    fn resolve(&self, items: &[T], op: &Operation) -> Result<usize, Inconsistency> {
        let found = match op.key() {
            Some(key) => items
                .iter()
                .position(|item| self.descriptor.key_of(item) == *key),
            None => op.path().index().filter(|index| *index < items.len()),
        };
        found.ok_or_else(|| Inconsistency::UnknownItem {
            path: op.path().clone(),
            key: op.key().cloned(),
        })
    }

    fn log_report(&self, report: &ApplyReport) {
        for inconsistency in &report.inconsistencies {
            log::warn!(
                "Dropped operation on {}: {inconsistency}",
                self.descriptor.type_name()
            );
        }
    }
}

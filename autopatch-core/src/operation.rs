//! Patch operations and batches.
//!
//! JSON shape of one operation (an array of these is a patch payload):
//! ```text
//! {"op":"replace","path":"/0/lat","value":48.21,"key":"1"}
//! ```
//! `value` is present for add/replace, `key` for remove/replace.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::key::ItemKey;
use crate::path::PatchPath;
use crate::protocol::ProtocolError;

/// Identifies one transport connection on the server.
pub type ConnectionId = Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OpKind {
    Add,
    Remove,
    Replace,
}

/// One change to a tracked collection. Immutable once built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    op: OpKind,
    path: PatchPath,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    value: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    key: Option<ItemKey>,
}

impl Operation {
    /// Append `value` to the collection.
    pub fn add(value: Value) -> Self {
        Self {
            op: OpKind::Add,
            path: PatchPath::Append,
            value: Some(value),
            key: None,
        }
    }

    /// Remove the item that sat at `index` when it was removed.
    pub fn remove(index: usize, key: ItemKey) -> Self {
        Self {
            op: OpKind::Remove,
            path: PatchPath::Index(index),
            value: None,
            key: Some(key),
        }
    }

    /// Set `field` of the item at `index` to `value`.
    pub fn replace(index: usize, field: impl Into<String>, value: Value, key: ItemKey) -> Self {
        Self {
            op: OpKind::Replace,
            path: PatchPath::field_of(index, field),
            value: Some(value),
            key: Some(key),
        }
    }

    pub fn kind(&self) -> OpKind {
        self.op
    }

    pub fn path(&self) -> &PatchPath {
        &self.path
    }

    pub fn value(&self) -> Option<&Value> {
        self.value.as_ref()
    }

    pub fn key(&self) -> Option<&ItemKey> {
        self.key.as_ref()
    }

    /// Drop the identity key, leaving a pure `{op,path,value}` operation.
    pub fn without_key(mut self) -> Self {
        self.key = None;
        self
    }

    /// Encode a slice of operations as a JSON patch array.
    pub fn encode_all(ops: &[Operation]) -> Result<Vec<u8>, ProtocolError> {
        serde_json::to_vec(ops).map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    pub fn decode_all(bytes: &[u8]) -> Result<Vec<Operation>, ProtocolError> {
        serde_json::from_slice(bytes)
            .map_err(|e| ProtocolError::DeserializationError(e.to_string()))
    }
}

/// Operations delivered together as one flush.
///
/// A batch with a target is a snapshot for that single connection; a batch
/// without one is broadcast to the type's group.
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    operations: Vec<Operation>,
    target: Option<ConnectionId>,
}

impl Batch {
    pub fn broadcast(operations: Vec<Operation>) -> Self {
        Self {
            operations,
            target: None,
        }
    }

    pub fn snapshot(target: ConnectionId, operations: Vec<Operation>) -> Self {
        Self {
            operations,
            target: Some(target),
        }
    }

    pub fn is_snapshot(&self) -> bool {
        self.target.is_some()
    }

    pub fn target(&self) -> Option<ConnectionId> {
        self.target
    }

    pub fn operations(&self) -> &[Operation] {
        &self.operations
    }

    pub fn len(&self) -> usize {
        self.operations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_wire_shape() {
        let ops = vec![
            Operation::add(json!({"id": 1, "model": "BMW i4"})),
            Operation::remove(2, ItemKey::from(3u32)),
            Operation::replace(0, "lat", json!(48.21), ItemKey::from(1u32)),
        ];
        let encoded: Value = serde_json::from_slice(&Operation::encode_all(&ops).unwrap()).unwrap();
        assert_eq!(
            encoded,
            json!([
                {"op": "add", "path": "/-", "value": {"id": 1, "model": "BMW i4"}},
                {"op": "remove", "path": "/2", "key": "3"},
                {"op": "replace", "path": "/0/lat", "value": 48.21, "key": "1"},
            ])
        );
    }

    #[test]
    fn test_decode_without_key() {
        let ops = Operation::decode_all(br#"[{"op":"remove","path":"/4"}]"#).unwrap();
        assert_eq!(ops[0].kind(), OpKind::Remove);
        assert_eq!(ops[0].path().index(), Some(4));
        assert!(ops[0].key().is_none());
        assert!(ops[0].value().is_none());
    }

    #[test]
    fn test_decode_rejects_unknown_op() {
        let result = Operation::decode_all(br#"[{"op":"move","path":"/0"}]"#);
        assert!(matches!(result, Err(ProtocolError::DeserializationError(_))));
    }

    #[test]
    fn test_without_key() {
        let op = Operation::remove(1, ItemKey::from("a")).without_key();
        assert!(op.key().is_none());
        assert_eq!(op.path(), &PatchPath::Index(1));
    }

    #[test]
    fn test_batch_targeting() {
        let conn = Uuid::new_v4();
        let snapshot = Batch::snapshot(conn, vec![Operation::add(json!(1))]);
        assert!(snapshot.is_snapshot());
        assert_eq!(snapshot.target(), Some(conn));
        assert_eq!(snapshot.len(), 1);

        let broadcast = Batch::broadcast(Vec::new());
        assert!(!broadcast.is_snapshot());
        assert!(broadcast.is_empty());
    }
}

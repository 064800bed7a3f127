//! Identity keys for tracked items.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Stable identity of a tracked item, produced by a per-type key selector.
///
/// Keys are compared as strings so that numeric, textual and UUID keys share
/// one representation on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ItemKey(String);

impl ItemKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ItemKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

macro_rules! impl_from_integer {
    ($($ty:ty),*) => {
        $(
            impl From<$ty> for ItemKey {
                fn from(value: $ty) -> Self {
                    Self(value.to_string())
                }
            }
        )*
    };
}

impl_from_integer!(i8, i16, i32, i64, u8, u16, u32, u64, usize);

impl From<&str> for ItemKey {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

impl From<String> for ItemKey {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&String> for ItemKey {
    fn from(value: &String) -> Self {
        Self(value.clone())
    }
}

impl From<Uuid> for ItemKey {
    fn from(value: Uuid) -> Self {
        Self(value.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_integer_and_string_keys_agree() {
        assert_eq!(ItemKey::from(42u32), ItemKey::from("42"));
        assert_eq!(ItemKey::from(-7i64).as_str(), "-7");
    }

    #[test]
    fn test_key_serializes_transparently() {
        let json = serde_json::to_string(&ItemKey::from(1u8)).unwrap();
        assert_eq!(json, "\"1\"");
        let back: ItemKey = serde_json::from_str(&json).unwrap();
        assert_eq!(back, ItemKey::new("1"));
    }

    #[test]
    fn test_uuid_key_display() {
        let id = Uuid::parse_str("550e8400-e29b-41d4-a716-446655440000").unwrap();
        assert_eq!(
            ItemKey::from(id).to_string(),
            "550e8400-e29b-41d4-a716-446655440000"
        );
    }
}

//! Per-type field accessor table.
//!
//! Built once when a type is registered; diffing and patch application look
//! fields up by name instead of inspecting values at runtime.
//!
//! ```text
//! FieldTable<Car>
//!   "id"    → get: |c| c.id     set: |c, v| c.id = v
//!   "lat"   → get: |c| c.lat    set: |c, v| c.lat = v
//!   "model" → get: |c| c.model  (read-only)
//! ```

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::key::ItemKey;

type Getter<T> = Arc<dyn Fn(&T) -> Value + Send + Sync>;
type Setter<T> = Arc<dyn Fn(&mut T, Value) -> Result<(), FieldError> + Send + Sync>;
type KeySelector<T> = Arc<dyn Fn(&T) -> ItemKey + Send + Sync>;

struct FieldAccessor<T> {
    name: String,
    get: Getter<T>,
    set: Option<Setter<T>>,
}

impl<T> Clone for FieldAccessor<T> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            get: self.get.clone(),
            set: self.set.clone(),
        }
    }
}

/// Ordered table of named field getters and setters for `T`.
pub struct FieldTable<T> {
    fields: Vec<FieldAccessor<T>>,
    index: HashMap<String, usize>,
}

impl<T> Clone for FieldTable<T> {
    fn clone(&self) -> Self {
        Self {
            fields: self.fields.clone(),
            index: self.index.clone(),
        }
    }
}

impl<T> fmt::Debug for FieldTable<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.names()).finish()
    }
}

impl<T> FieldTable<T> {
    pub fn contains(&self, field: &str) -> bool {
        self.index.contains_key(field)
    }

    /// Field names in registration order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(|f| f.name.as_str())
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

impl<T: 'static> FieldTable<T> {
    pub fn builder() -> FieldTableBuilder<T> {
        FieldTableBuilder { fields: Vec::new() }
    }

    /// Current value of `field`, or `None` if the table has no such field.
    pub fn get(&self, item: &T, field: &str) -> Option<Value> {
        self.index
            .get(field)
            .map(|&i| (self.fields[i].get)(item))
    }

    /// Set `field` from a JSON value.
    pub fn set(&self, item: &mut T, field: &str, value: Value) -> Result<(), FieldError> {
        let accessor = self
            .index
            .get(field)
            .map(|&i| &self.fields[i])
            .ok_or_else(|| FieldError::UnknownField(field.to_owned()))?;
        let setter = accessor
            .set
            .as_ref()
            .ok_or_else(|| FieldError::ReadOnly(field.to_owned()))?;
        setter(item, value)
    }

    /// Values of every field, in registration order.
    pub fn read_all(&self, item: &T) -> Vec<Value> {
        self.fields.iter().map(|f| (f.get)(item)).collect()
    }

}

/// Builder for [`FieldTable`].
pub struct FieldTableBuilder<T> {
    fields: Vec<FieldAccessor<T>>,
}

impl<T: 'static> FieldTableBuilder<T> {
    /// Register a read/write field.
    pub fn field<V, G, S>(self, name: &str, get: G, set: S) -> Self
    where
        V: Serialize + DeserializeOwned + 'static,
        G: Fn(&T) -> V + Send + Sync + 'static,
        S: Fn(&mut T, V) + Send + Sync + 'static,
    {
        let field_name = name.to_owned();
        let setter: Setter<T> = Arc::new(move |item: &mut T, value: Value| {
            let typed = serde_json::from_value::<V>(value).map_err(|e| FieldError::InvalidValue {
                field: field_name.clone(),
                reason: e.to_string(),
            })?;
            set(item, typed);
            Ok(())
        });
        self.push(name, get, Some(setter))
    }

    /// Register a field that is diffed but never written by patches.
    pub fn read_only<V, G>(self, name: &str, get: G) -> Self
    where
        V: Serialize + 'static,
        G: Fn(&T) -> V + Send + Sync + 'static,
    {
        self.push(name, get, None)
    }

    fn push<V, G>(mut self, name: &str, get: G, set: Option<Setter<T>>) -> Self
    where
        V: Serialize + 'static,
        G: Fn(&T) -> V + Send + Sync + 'static,
    {
        let field_name = name.to_owned();
        let getter: Getter<T> = Arc::new(move |item: &T| {
            serde_json::to_value(get(item)).unwrap_or_else(|e| {
                log::warn!("Field {field_name} is not representable as JSON, read as null: {e}");
                Value::Null
            })
        });
        self.fields.retain(|f| f.name != name);
        self.fields.push(FieldAccessor {
            name: name.to_owned(),
            get: getter,
            set,
        });
        self
    }

    pub fn build(self) -> FieldTable<T> {
        let index = self
            .fields
            .iter()
            .enumerate()
            .map(|(i, f)| (f.name.clone(), i))
            .collect();
        FieldTable {
            fields: self.fields,
            index,
        }
    }
}

/// Everything both ends need to know about one tracked type.
pub struct TypeDescriptor<T> {
    type_name: String,
    key: KeySelector<T>,
    fields: FieldTable<T>,
}

impl<T> Clone for TypeDescriptor<T> {
    fn clone(&self) -> Self {
        Self {
            type_name: self.type_name.clone(),
            key: self.key.clone(),
            fields: self.fields.clone(),
        }
    }
}

impl<T> fmt::Debug for TypeDescriptor<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TypeDescriptor")
            .field("type_name", &self.type_name)
            .field("fields", &self.fields)
            .finish()
    }
}

impl<T: 'static> TypeDescriptor<T> {
    pub fn new<K, F>(type_name: impl Into<String>, key: F, fields: FieldTable<T>) -> Self
    where
        K: Into<ItemKey>,
        F: Fn(&T) -> K + Send + Sync + 'static,
    {
        Self {
            type_name: type_name.into(),
            key: Arc::new(move |item: &T| key(item).into()),
            fields,
        }
    }

    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    pub fn key_of(&self, item: &T) -> ItemKey {
        (self.key)(item)
    }

    pub fn fields(&self) -> &FieldTable<T> {
        &self.fields
    }

    /// Broadcast group carrying this type's patches.
    pub fn group_name(&self) -> String {
        crate::protocol::group_name(&self.type_name)
    }
}

/// Field access errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldError {
    UnknownField(String),
    ReadOnly(String),
    InvalidValue { field: String, reason: String },
}

impl fmt::Display for FieldError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownField(name) => write!(f, "Unknown field: {name}"),
            Self::ReadOnly(name) => write!(f, "Field is read-only: {name}"),
            Self::InvalidValue { field, reason } => {
                write!(f, "Invalid value for field {field}: {reason}")
            }
        }
    }
}

impl std::error::Error for FieldError {}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[derive(Debug, Clone, PartialEq)]
    struct Car {
        id: u32,
        model: String,
        lat: f64,
    }

    fn car_fields() -> FieldTable<Car> {
        FieldTable::<Car>::builder()
            .field("id", |c| c.id, |c, v| c.id = v)
            .read_only("model", |c| c.model.clone())
            .field("lat", |c| c.lat, |c, v| c.lat = v)
            .build()
    }

    fn car() -> Car {
        Car {
            id: 1,
            model: "Tesla Model 3".into(),
            lat: 48.2082,
        }
    }

    #[test]
    fn test_get_and_set() {
        let fields = car_fields();
        let mut c = car();
        assert_eq!(fields.get(&c, "lat"), Some(json!(48.2082)));
        fields.set(&mut c, "lat", json!(10.5)).unwrap();
        assert_eq!(c.lat, 10.5);
        assert_eq!(fields.get(&c, "missing"), None);
    }

    #[test]
    fn test_set_errors() {
        let fields = car_fields();
        let mut c = car();
        assert_eq!(
            fields.set(&mut c, "speed", json!(1)),
            Err(FieldError::UnknownField("speed".into()))
        );
        assert_eq!(
            fields.set(&mut c, "model", json!("x")),
            Err(FieldError::ReadOnly("model".into()))
        );
        assert!(matches!(
            fields.set(&mut c, "lat", json!("north")),
            Err(FieldError::InvalidValue { .. })
        ));
        assert_eq!(c, car());
    }

    #[test]
    fn test_registration_order() {
        let fields = car_fields();
        let names: Vec<&str> = fields.names().collect();
        assert_eq!(names, vec!["id", "model", "lat"]);
        assert_eq!(
            fields.read_all(&car()),
            vec![json!(1), json!("Tesla Model 3"), json!(48.2082)]
        );
    }

    #[test]
    fn test_reregistering_replaces_field() {
        let fields = FieldTable::<Car>::builder()
            .read_only("lat", |c| c.lat)
            .field("lat", |c| c.lat, |c, v| c.lat = v)
            .build();
        assert_eq!(fields.len(), 1);
        let mut c = car();
        assert!(fields.set(&mut c, "lat", json!(1.0)).is_ok());
    }

    #[test]
    fn test_descriptor_key_and_group() {
        let descriptor = TypeDescriptor::new("Car", |c: &Car| c.id, car_fields());
        assert_eq!(descriptor.type_name(), "Car");
        assert_eq!(descriptor.key_of(&car()), ItemKey::from(1u32));
        assert_eq!(descriptor.group_name(), "patch/Car");
        assert!(descriptor.fields().contains("model"));
    }

    #[test]
    fn test_debug_lists_field_names() {
        let descriptor = TypeDescriptor::new("Car", |c: &Car| c.id, car_fields());
        let printed = format!("{descriptor:?}");
        assert!(printed.contains("\"Car\""));
        assert!(printed.contains("[\"id\", \"model\", \"lat\"]"));
    }

    #[test]
    fn test_unrepresentable_value_reads_as_null() {
        let fields = FieldTable::<Car>::builder()
            .read_only("grid", |c| HashMap::from([((c.id, c.id), 1u8)]))
            .build();
        assert_eq!(fields.get(&car(), "grid"), Some(Value::Null));
    }
}

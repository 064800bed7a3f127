//! Global and per-type configuration.

use autopatch_core::{ClientChangePolicy, TypeDescriptor};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::time::Duration;

use crate::error::ServiceError;

/// Service-wide configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AutopatchConfig {
    /// Address the WebSocket server binds to
    pub bind_addr: String,
    /// Flush interval for types without their own throttle, in milliseconds
    pub default_throttle_interval_ms: u64,
    /// Queue length that forces an immediate flush
    pub max_batch_size: usize,
}

impl Default for AutopatchConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:5249".to_string(),
            default_throttle_interval_ms: 1000,
            max_batch_size: 100,
        }
    }
}

impl AutopatchConfig {
    pub fn default_throttle_interval(&self) -> Duration {
        Duration::from_millis(self.default_throttle_interval_ms)
    }

    pub fn validate(&self) -> Result<(), ServiceError> {
        if self.max_batch_size == 0 {
            return Err(ServiceError::Config("max_batch_size must be > 0".into()));
        }
        if self.default_throttle_interval_ms == 0 {
            return Err(ServiceError::Config(
                "default_throttle_interval_ms must be > 0".into(),
            ));
        }
        Ok(())
    }
}

/// Registration options for one tracked type.
pub struct TypeConfig<T> {
    descriptor: TypeDescriptor<T>,
    excluded_fields: HashSet<String>,
    throttle_interval: Option<Duration>,
    client_change_policy: ClientChangePolicy,
}

impl<T> fmt::Debug for TypeConfig<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TypeConfig")
            .field("descriptor", &self.descriptor)
            .field("excluded_fields", &self.excluded_fields)
            .field("throttle_interval", &self.throttle_interval)
            .field("client_change_policy", &self.client_change_policy)
            .finish()
    }
}

impl<T: 'static> TypeConfig<T> {
    pub fn new(descriptor: TypeDescriptor<T>) -> Self {
        Self {
            descriptor,
            excluded_fields: HashSet::new(),
            throttle_interval: None,
            client_change_policy: ClientChangePolicy::default(),
        }
    }

    /// Never emit replace operations for `field`.
    pub fn exclude_field(mut self, field: impl Into<String>) -> Self {
        self.excluded_fields.insert(field.into());
        self
    }

    pub fn with_throttle_interval(mut self, interval: Duration) -> Self {
        self.throttle_interval = Some(interval);
        self
    }

    pub fn with_client_change_policy(mut self, policy: ClientChangePolicy) -> Self {
        self.client_change_policy = policy;
        self
    }

    pub fn descriptor(&self) -> &TypeDescriptor<T> {
        &self.descriptor
    }

    pub fn type_name(&self) -> &str {
        self.descriptor.type_name()
    }

    pub fn excluded_fields(&self) -> &HashSet<String> {
        &self.excluded_fields
    }

    pub fn throttle_interval(&self) -> Option<Duration> {
        self.throttle_interval
    }

    pub fn client_change_policy(&self) -> ClientChangePolicy {
        self.client_change_policy
    }

    /// Per-type throttle, falling back to the global default.
    pub fn effective_throttle(&self, global: &AutopatchConfig) -> Duration {
        self.throttle_interval
            .unwrap_or_else(|| global.default_throttle_interval())
    }

    pub(crate) fn validate(&self) -> Result<(), ServiceError> {
        if self.descriptor.type_name().is_empty() {
            return Err(ServiceError::Config("type name must not be empty".into()));
        }
        if self.throttle_interval == Some(Duration::ZERO) {
            return Err(ServiceError::Config(format!(
                "throttle interval of {} must be > 0",
                self.descriptor.type_name()
            )));
        }
        for field in &self.excluded_fields {
            if !self.descriptor.fields().contains(field) {
                log::warn!(
                    "Excluded field {field} is not in the field table of {}",
                    self.descriptor.type_name()
                );
            }
        }
        Ok(())
    }

    pub(crate) fn into_parts(self) -> (TypeDescriptor<T>, HashSet<String>) {
        (self.descriptor, self.excluded_fields)
    }
}

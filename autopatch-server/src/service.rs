//! AutopatchService: owns every tracked type and subscription.
//!
//! ```text
//! register::<T>() ──► TrackedCollection<T> ──► DiffGenerator ──► FlushScheduler ──► BroadcastRouter
//!                                                                     ▲
//! subscribe_to_type / request_full_data ── snapshot marker ───────────┘
//! ```
//!
//! A snapshot is built under the collection's read lock and enqueued before
//! the lock is released, so it lands in the type's queue exactly between the
//! operations it already reflects and the ones it does not.

use autopatch_core::{ClientChangePolicy, ConnectionId, Operation};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

use crate::collection::TrackedCollection;
use crate::config::{AutopatchConfig, TypeConfig};
use crate::diff::DiffGenerator;
use crate::error::{ServiceError, TrackError};
use crate::router::{BroadcastRouter, OutboundSender, PatchEntry, RouterStats};
use crate::scheduler::{FlushMode, FlushScheduler, FlushStats, SchedulerConfig};

/// Server-side record of one subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    pub id: Uuid,
    pub connection: ConnectionId,
    pub type_name: String,
}

/// Type-erased view of one registered type.
trait TypeEntry: Send + Sync {
    fn type_name(&self) -> &str;
    fn enqueue_snapshot(&self, connection: ConnectionId) -> Result<usize, ServiceError>;
    fn flush(&self, mode: FlushMode) -> usize;
    fn pending(&self) -> usize;
    fn item_count(&self) -> usize;
    fn stop(&self);
    fn is_stopped(&self) -> bool;
    fn client_change_policy(&self) -> ClientChangePolicy;
    fn flush_stats(&self) -> FlushStats;
}

struct TrackedType<T> {
    type_name: String,
    policy: ClientChangePolicy,
    collection: TrackedCollection<T>,
    scheduler: Arc<FlushScheduler<PatchEntry>>,
}

impl<T> TypeEntry for TrackedType<T>
where
    T: Serialize + Send + Sync + 'static,
{
    fn type_name(&self) -> &str {
        &self.type_name
    }

    fn enqueue_snapshot(&self, connection: ConnectionId) -> Result<usize, ServiceError> {
        self.collection.read(|items| {
            let operations = items
                .iter()
                .map(|item| {
                    serde_json::to_value(item)
                        .map(Operation::add)
                        .map_err(|e| TrackError::SerializationError(e.to_string()))
                })
                .collect::<Result<Vec<_>, _>>()?;
            let count = operations.len();
            self.scheduler.enqueue(PatchEntry::Snapshot {
                connection,
                operations,
            });
            Ok(count)
        })
    }

    fn flush(&self, mode: FlushMode) -> usize {
        self.scheduler.flush(mode)
    }

    fn pending(&self) -> usize {
        self.scheduler.pending()
    }

    fn item_count(&self) -> usize {
        self.collection.len()
    }

    fn stop(&self) {
        self.scheduler.stop();
        self.collection.stop_tracking();
    }

    fn is_stopped(&self) -> bool {
        self.scheduler.is_stopped()
    }

    fn client_change_policy(&self) -> ClientChangePolicy {
        self.policy
    }

    fn flush_stats(&self) -> FlushStats {
        self.scheduler.stats()
    }
}

/// Registry of tracked types, subscriptions and connections.
pub struct AutopatchService {
    config: AutopatchConfig,
    types: RwLock<HashMap<String, Arc<dyn TypeEntry>>>,
    subscriptions: RwLock<HashMap<Uuid, Subscription>>,
    router: Arc<BroadcastRouter>,
}

impl AutopatchService {
    pub fn new(config: AutopatchConfig) -> Result<Self, ServiceError> {
        if let Err(e) = config.validate() {
            log::error!("Invalid autopatch configuration: {e}");
            return Err(e);
        }
        Ok(Self {
            config,
            types: RwLock::new(HashMap::new()),
            subscriptions: RwLock::new(HashMap::new()),
            router: Arc::new(BroadcastRouter::new()),
        })
    }

    pub fn config(&self) -> &AutopatchConfig {
        &self.config
    }

    /// Register a type with an empty collection.
    ///
    /// Call from within a tokio runtime so the type's flush timer can run.
    pub fn register<T>(&self, type_config: TypeConfig<T>) -> Result<TrackedCollection<T>, ServiceError>
    where
        T: Serialize + Send + Sync + 'static,
    {
        self.register_with_items(type_config, Vec::new())
    }

    /// Register a type whose collection starts out with `items`.
    pub fn register_with_items<T>(
        &self,
        type_config: TypeConfig<T>,
        items: Vec<T>,
    ) -> Result<TrackedCollection<T>, ServiceError>
    where
        T: Serialize + Send + Sync + 'static,
    {
        if let Err(e) = type_config.validate() {
            log::error!("Invalid configuration for {}: {e}", type_config.type_name());
            return Err(e);
        }
        let type_name = type_config.type_name().to_owned();
        let mut types = self.types.write();
        if types.contains_key(&type_name) {
            return Err(ServiceError::TypeAlreadyRegistered(type_name));
        }

        let scheduler = Arc::new(FlushScheduler::new(
            type_name.clone(),
            SchedulerConfig {
                throttle_interval: type_config.effective_throttle(&self.config),
                max_batch_size: self.config.max_batch_size,
            },
        ));
        let router = self.router.clone();
        let routed_type = type_name.clone();
        scheduler.on_flush(move |_, entries| router.dispatch(&routed_type, entries));

        let policy = type_config.client_change_policy();
        let (descriptor, excluded_fields) = type_config.into_parts();
        let diff = Arc::new(DiffGenerator::new(
            descriptor.clone(),
            excluded_fields,
            scheduler.clone(),
        ));
        let collection = TrackedCollection::with_items(descriptor, items);
        collection.start_tracking(diff)?;

        log::info!(
            "Registered tracked type {type_name} (throttle {:?}, {} items)",
            scheduler.config().throttle_interval,
            collection.len()
        );
        types.insert(
            type_name.clone(),
            Arc::new(TrackedType {
                type_name,
                policy,
                collection: collection.clone(),
                scheduler,
            }),
        );
        Ok(collection)
    }

    pub fn is_registered(&self, type_name: &str) -> bool {
        self.types.read().contains_key(type_name)
    }

    pub fn registered_types(&self) -> Vec<String> {
        self.types.read().keys().cloned().collect()
    }

    /// Attach a connection's outbound channel.
    pub fn connect(&self, connection: ConnectionId, sender: OutboundSender) {
        self.router.register_connection(connection, sender);
        log::info!("Connection {connection} attached");
    }

    /// Tear down every subscription of `connection`.
    pub fn disconnect(&self, connection: &ConnectionId) {
        let groups = self.router.remove_connection(connection);
        let mut subscriptions = self.subscriptions.write();
        let before = subscriptions.len();
        subscriptions.retain(|_, sub| sub.connection != *connection);
        log::info!(
            "Connection {connection} detached ({} subscriptions, {} groups)",
            before - subscriptions.len(),
            groups.len()
        );
    }

    /// Subscribe `connection` to `type_name` and schedule its snapshot.
    ///
    /// Subscribing again on the same connection keeps the subscription id
    /// and re-sends the snapshot.
    pub fn subscribe_to_type(
        &self,
        connection: ConnectionId,
        type_name: &str,
    ) -> Result<Uuid, ServiceError> {
        let entry = self.live_entry(type_name)?;
        if !self.router.is_connected(&connection) {
            return Err(ServiceError::UnknownConnection(connection));
        }

        let existing = self
            .subscriptions
            .read()
            .values()
            .find(|sub| sub.connection == connection && sub.type_name == type_name)
            .map(|sub| sub.id);

        let id = match existing {
            Some(id) => {
                self.router.mark_awaiting(type_name, &connection);
                id
            }
            None => {
                let id = Uuid::new_v4();
                self.subscriptions.write().insert(
                    id,
                    Subscription {
                        id,
                        connection,
                        type_name: type_name.to_owned(),
                    },
                );
                self.router.join(type_name, connection);
                id
            }
        };

        match entry.enqueue_snapshot(connection) {
            Ok(count) => {
                entry.flush(FlushMode::Manual);
                log::info!("Connection {connection} subscribed to {type_name} ({count} items)");
                Ok(id)
            }
            Err(e) => {
                log::error!("Snapshot of {type_name} for {connection} failed: {e}");
                self.subscriptions.write().remove(&id);
                self.router.leave(type_name, &connection);
                Err(e)
            }
        }
    }

    /// Leave the type's group. Returns false if the connection was not subscribed.
    pub fn unsubscribe(&self, connection: &ConnectionId, type_name: &str) -> Result<bool, ServiceError> {
        self.entry(type_name)?;
        self.subscriptions
            .write()
            .retain(|_, sub| !(sub.connection == *connection && sub.type_name == type_name));
        let left = self.router.leave(type_name, connection);
        if left {
            log::info!("Connection {connection} unsubscribed from {type_name}");
        }
        Ok(left)
    }

    /// Unsubscribe by subscription id; ids of other connections are ignored.
    pub fn unsubscribe_by_id(&self, connection: &ConnectionId, subscription_id: &Uuid) -> bool {
        let removed = {
            let mut subscriptions = self.subscriptions.write();
            match subscriptions.get(subscription_id) {
                Some(sub) if sub.connection == *connection => subscriptions.remove(subscription_id),
                _ => None,
            }
        };
        match removed {
            Some(sub) => {
                self.router.leave(&sub.type_name, connection);
                log::info!("Connection {connection} unsubscribed from {}", sub.type_name);
                true
            }
            None => false,
        }
    }

    /// Schedule a fresh snapshot for one subscription, sent only to its connection.
    pub fn request_full_data(
        &self,
        subscription_id: &Uuid,
        connection: &ConnectionId,
    ) -> Result<(), ServiceError> {
        let sub = self
            .subscriptions
            .read()
            .get(subscription_id)
            .filter(|sub| sub.connection == *connection)
            .cloned()
            .ok_or(ServiceError::UnknownSubscription(*subscription_id))?;
        let entry = self.live_entry(&sub.type_name)?;

        self.router.mark_awaiting(&sub.type_name, connection);
        let count = entry.enqueue_snapshot(*connection)?;
        entry.flush(FlushMode::Manual);
        log::debug!(
            "Full data of {} ({count} items) requested by {connection}",
            sub.type_name
        );
        Ok(())
    }

    /// Flush one type now. Returns the number of queue entries flushed.
    pub fn flush(&self, type_name: &str) -> Result<usize, ServiceError> {
        Ok(self.entry(type_name)?.flush(FlushMode::Manual))
    }

    pub fn flush_all(&self) -> usize {
        let entries: Vec<_> = self.types.read().values().cloned().collect();
        entries
            .iter()
            .map(|entry| entry.flush(FlushMode::Manual))
            .sum()
    }

    /// Stop every scheduler and detach every collection.
    ///
    /// Pending operations are discarded; no flush runs after this returns.
    pub fn shutdown(&self) {
        let entries: Vec<_> = self.types.read().values().cloned().collect();
        for entry in &entries {
            entry.stop();
        }
        log::info!("Autopatch service shut down ({} types)", entries.len());
    }

    pub fn subscription(&self, subscription_id: &Uuid) -> Option<Subscription> {
        self.subscriptions.read().get(subscription_id).cloned()
    }

    pub fn subscription_count(&self) -> usize {
        self.subscriptions.read().len()
    }

    pub fn subscriber_count(&self, type_name: &str) -> usize {
        self.router.member_count(type_name)
    }

    pub fn pending(&self, type_name: &str) -> Result<usize, ServiceError> {
        Ok(self.entry(type_name)?.pending())
    }

    pub fn item_count(&self, type_name: &str) -> Result<usize, ServiceError> {
        Ok(self.entry(type_name)?.item_count())
    }

    pub fn client_change_policy(&self, type_name: &str) -> Result<ClientChangePolicy, ServiceError> {
        Ok(self.entry(type_name)?.client_change_policy())
    }

    pub fn flush_stats(&self, type_name: &str) -> Result<FlushStats, ServiceError> {
        Ok(self.entry(type_name)?.flush_stats())
    }

    pub fn router(&self) -> &BroadcastRouter {
        &self.router
    }

    pub fn router_stats(&self) -> RouterStats {
        self.router.stats()
    }

    fn entry(&self, type_name: &str) -> Result<Arc<dyn TypeEntry>, ServiceError> {
        match self.types.read().get(type_name) {
            Some(entry) => Ok(entry.clone()),
            None => {
                log::error!("Type {type_name} is not registered with the autopatch service");
                Err(ServiceError::UnknownType(type_name.to_owned()))
            }
        }
    }

    /// Like `entry`, but refuses types whose scheduler was stopped.
    fn live_entry(&self, type_name: &str) -> Result<Arc<dyn TypeEntry>, ServiceError> {
        let entry = self.entry(type_name)?;
        if entry.is_stopped() {
            log::warn!("Type {type_name} was shut down; no snapshot can be delivered");
            return Err(ServiceError::Stopped(type_name.to_owned()));
        }
        Ok(entry)
    }
}

impl Drop for AutopatchService {
    fn drop(&mut self) {
        for entry in self.types.get_mut().values() {
            entry.stop();
        }
    }
}

//! Subscription manager: reference-counted per-type subscriptions.
//!
//! State machine per type:
//! ```text
//! Unsubscribed ──subscribe──► Subscribing ──ack──► AwaitingSnapshot ──snapshot──► Synced
//!      ▲                          │                       │                        │
//!      │                          └───────────┬───────────┴────────────────────────┤
//!      │                                      ▼ connection lost                    │ last unsubscribe
//!      │                               ConnectionLost ──resubscribe_all──► Subscribing
//!      │                                                                           ▼
//!      └─────────────────────────────────────────────────────────────────── Unsubscribing
//! ```
//!
//! The manager lock is never held across a transport call. A snapshot may
//! arrive before the subscribe ack; it is applied right away and the ack then
//! moves the entry straight to `Synced`.

use async_trait::async_trait;
use autopatch_core::{MessageType, Operation, TypeDescriptor, WireMessage};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::applier::{ApplyReport, Inconsistency, PatchApplier};
use crate::error::ClientError;
use crate::mirror::Mirror;

/// Request side of the patch protocol.
#[async_trait]
pub trait PatchTransport: Send + Sync {
    /// Subscribe to a type; resolves to the server's subscription id.
    async fn subscribe(&self, type_name: &str) -> Result<Uuid, ClientError>;

    async fn unsubscribe(&self, type_name: &str, subscription_id: Option<Uuid>) -> Result<(), ClientError>;

    /// Ask for a fresh snapshot of one subscription.
    async fn request_full_data(&self, subscription_id: Uuid) -> Result<(), ClientError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionState {
    Unsubscribed,
    Subscribing,
    AwaitingSnapshot,
    Synced,
    Unsubscribing,
    ConnectionLost,
}

/// Events emitted by the client.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    /// Connection established
    Connected,
    /// Connection closed
    Disconnected,
    /// A snapshot was applied and the type is now live
    Synced { type_name: String, items: usize },
    /// An operation was dropped while applying a batch
    Inconsistency {
        type_name: String,
        inconsistency: Inconsistency,
    },
    /// These subscriptions must be re-established with a fresh snapshot
    ConnectionLost { type_names: Vec<String> },
}

/// Type-erased mirror plus its applier.
trait MirrorSink: Send + Sync {
    fn apply_patch(&self, ops: &[Operation]) -> ApplyReport;
    fn apply_snapshot(&self, ops: &[Operation]) -> ApplyReport;
    fn len(&self) -> usize;
    fn as_any(&self) -> &dyn Any;
}

struct TypedMirror<T> {
    mirror: Mirror<T>,
    applier: PatchApplier<T>,
}

impl<T> MirrorSink for TypedMirror<T>
where
    T: DeserializeOwned + Clone + Send + Sync + 'static,
{
    fn apply_patch(&self, ops: &[Operation]) -> ApplyReport {
        self.applier.apply_batch(&self.mirror, ops)
    }

    fn apply_snapshot(&self, ops: &[Operation]) -> ApplyReport {
        self.applier.apply_snapshot(&self.mirror, ops)
    }

    fn len(&self) -> usize {
        self.mirror.len()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

struct Entry {
    state: SubscriptionState,
    ref_count: usize,
    subscription_id: Option<Uuid>,
    /// A snapshot arrived while the subscribe request was still in flight
    snapshot_applied: bool,
    /// Bumped whenever a new subscribe round starts
    generation: u64,
    sink: Arc<dyn MirrorSink>,
}

/// Outcome of a subscribe round, decided under the lock.
enum Completion {
    Done { id: Uuid, synced: Option<usize> },
    Failed(ClientError),
    /// Every reference was released meanwhile; undo the server subscription
    Cancel(Uuid),
    /// The round was superseded by a reconnect; the entry lives on
    Stale,
}

pub struct SubscriptionManager {
    transport: Arc<dyn PatchTransport>,
    entries: Mutex<HashMap<String, Entry>>,
    events: mpsc::Sender<ClientEvent>,
}

impl SubscriptionManager {
    pub fn new(transport: Arc<dyn PatchTransport>, events: mpsc::Sender<ClientEvent>) -> Self {
        Self {
            transport,
            entries: Mutex::new(HashMap::new()),
            events,
        }
    }

    /// Subscribe to the type described by `descriptor`.
    ///
    /// The first call per type performs the wire subscribe; later calls only
    /// take another reference and return the same mirror.
    pub async fn subscribe<T>(&self, descriptor: TypeDescriptor<T>) -> Result<Mirror<T>, ClientError>
    where
        T: DeserializeOwned + Clone + Send + Sync + 'static,
    {
        let type_name = descriptor.type_name().to_owned();
        let (mirror, generation) = {
            let mut entries = self.entries.lock();
            if let Some(entry) = entries.get_mut(&type_name) {
                if entry.state == SubscriptionState::Unsubscribing {
                    return Err(ClientError::Unsubscribing(type_name));
                }
                let mirror = Self::downcast::<T>(entry, &type_name)?;
                entry.ref_count += 1;
                log::debug!("{type_name} now has {} references", entry.ref_count);
                return Ok(mirror);
            }

            let mirror = Mirror::new(descriptor.clone());
            let sink: Arc<dyn MirrorSink> = Arc::new(TypedMirror {
                mirror: mirror.clone(),
                applier: PatchApplier::new(descriptor),
            });
            entries.insert(
                type_name.clone(),
                Entry {
                    state: SubscriptionState::Subscribing,
                    ref_count: 1,
                    subscription_id: None,
                    snapshot_applied: false,
                    generation: 0,
                    sink,
                },
            );
            (mirror, 0)
        };

        log::info!("Subscribing to {type_name}");
        let result = self.transport.subscribe(&type_name).await;
        self.complete_subscribe(&type_name, generation, result).await?;
        Ok(mirror)
    }

    /// Release one reference. The wire unsubscribe is sent when the last
    /// reference goes; releasing an unknown or already released type is a
    /// no-op that returns `false`.
    pub async fn unsubscribe(&self, type_name: &str) -> Result<bool, ClientError> {
        let (subscription_id, generation) = {
            let mut entries = self.entries.lock();
            let Some(entry) = entries.get_mut(type_name) else {
                return Ok(false);
            };
            if entry.ref_count == 0 {
                return Ok(false);
            }
            entry.ref_count -= 1;
            if entry.ref_count > 0 {
                return Ok(true);
            }
            let state = entry.state;
            match state {
                // The pending subscribe round finishes the teardown
                SubscriptionState::Subscribing => return Ok(true),
                SubscriptionState::ConnectionLost => {
                    entries.remove(type_name);
                    log::info!("Released {type_name} while disconnected");
                    return Ok(true);
                }
                _ => {
                    entry.state = SubscriptionState::Unsubscribing;
                    (entry.subscription_id, entry.generation)
                }
            }
        };

        log::info!("Unsubscribing from {type_name}");
        let result = self.transport.unsubscribe(type_name, subscription_id).await;
        {
            let mut entries = self.entries.lock();
            if entries
                .get(type_name)
                .is_some_and(|e| e.generation == generation && e.state == SubscriptionState::Unsubscribing)
            {
                entries.remove(type_name);
            }
        }
        match result {
            Ok(()) => Ok(true),
            Err(e) => {
                log::warn!("Unsubscribe from {type_name} failed: {e}");
                Err(e)
            }
        }
    }

    /// Route a server push to the type's mirror.
    pub fn handle_push(&self, msg: &WireMessage) {
        let is_snapshot = match msg.msg_type {
            MessageType::Patch => false,
            MessageType::Snapshot => true,
            other => {
                log::debug!("Ignoring non-push message {other:?}");
                return;
            }
        };
        let ops = match msg.operations() {
            Ok(ops) => ops,
            Err(e) => {
                log::warn!("Malformed push for {}: {e}", msg.type_name);
                return;
            }
        };

        let (sink, generation) = {
            let entries = self.entries.lock();
            let Some(entry) = entries.get(&msg.type_name) else {
                log::debug!("Push for unsubscribed type {}", msg.type_name);
                return;
            };
            let accepts = match entry.state {
                SubscriptionState::Synced => true,
                // The server went live at the snapshot, ahead of our ack
                SubscriptionState::Subscribing => is_snapshot || entry.snapshot_applied,
                SubscriptionState::AwaitingSnapshot => is_snapshot,
                _ => false,
            };
            if !accepts {
                log::trace!(
                    "Dropping {:?} for {} in state {:?}",
                    msg.msg_type,
                    msg.type_name,
                    entry.state
                );
                return;
            }
            (entry.sink.clone(), entry.generation)
        };

        let report = if is_snapshot {
            sink.apply_snapshot(&ops)
        } else {
            sink.apply_patch(&ops)
        };
        for inconsistency in report.inconsistencies {
            self.emit(ClientEvent::Inconsistency {
                type_name: msg.type_name.clone(),
                inconsistency,
            });
        }

        if is_snapshot {
            let synced = {
                let mut entries = self.entries.lock();
                match entries.get_mut(&msg.type_name) {
                    Some(entry) if entry.generation == generation => match entry.state {
                        SubscriptionState::Subscribing => {
                            entry.snapshot_applied = true;
                            None
                        }
                        SubscriptionState::AwaitingSnapshot => {
                            entry.state = SubscriptionState::Synced;
                            Some(sink.len())
                        }
                        _ => None,
                    },
                    _ => None,
                }
            };
            if let Some(items) = synced {
                self.synced(&msg.type_name, items);
            }
        }
    }

    /// Mark every live subscription as lost.
    pub fn connection_lost(&self) {
        let mut lost = Vec::new();
        {
            let mut entries = self.entries.lock();
            for (name, entry) in entries.iter_mut() {
                if matches!(
                    entry.state,
                    SubscriptionState::Subscribing
                        | SubscriptionState::AwaitingSnapshot
                        | SubscriptionState::Synced
                ) {
                    entry.state = SubscriptionState::ConnectionLost;
                    entry.subscription_id = None;
                    entry.snapshot_applied = false;
                    entry.generation += 1;
                    lost.push(name.clone());
                }
            }
        }
        if !lost.is_empty() {
            lost.sort();
            log::warn!("Connection lost with {} active subscriptions", lost.len());
            self.emit(ClientEvent::ConnectionLost { type_names: lost });
        }
    }

    /// Re-establish every lost subscription. Each mirror is replaced
    /// wholesale by the fresh snapshot.
    ///
    /// Returns the number of subscriptions restored, or the first error after
    /// trying all of them.
    pub async fn resubscribe_all(&self) -> Result<usize, ClientError> {
        let rounds: Vec<(String, u64)> = {
            let mut entries = self.entries.lock();
            entries
                .iter_mut()
                .filter(|(_, entry)| entry.state == SubscriptionState::ConnectionLost)
                .map(|(name, entry)| {
                    entry.state = SubscriptionState::Subscribing;
                    entry.snapshot_applied = false;
                    entry.generation += 1;
                    (name.clone(), entry.generation)
                })
                .collect()
        };

        let mut restored = 0;
        let mut first_error = None;
        for (type_name, generation) in rounds {
            log::info!("Resubscribing to {type_name}");
            let result = self.transport.subscribe(&type_name).await;
            match self.complete_subscribe(&type_name, generation, result).await {
                Ok(()) => restored += 1,
                Err(e) => {
                    first_error.get_or_insert(e);
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(restored),
        }
    }

    /// Ask the server for a fresh snapshot of `type_name`.
    pub async fn request_full_data(&self, type_name: &str) -> Result<(), ClientError> {
        let (subscription_id, previous, generation) = {
            let mut entries = self.entries.lock();
            let entry = entries
                .get_mut(type_name)
                .filter(|e| {
                    matches!(
                        e.state,
                        SubscriptionState::AwaitingSnapshot | SubscriptionState::Synced
                    )
                })
                .ok_or_else(|| ClientError::NotSubscribed(type_name.to_owned()))?;
            let id = entry
                .subscription_id
                .ok_or_else(|| ClientError::NotSubscribed(type_name.to_owned()))?;
            let previous = entry.state;
            entry.state = SubscriptionState::AwaitingSnapshot;
            (id, previous, entry.generation)
        };

        let result = self.transport.request_full_data(subscription_id).await;
        if let Err(e) = &result {
            log::warn!("Full data request for {type_name} failed: {e}");
            let mut entries = self.entries.lock();
            if let Some(entry) = entries.get_mut(type_name) {
                if entry.generation == generation && entry.state == SubscriptionState::AwaitingSnapshot {
                    entry.state = previous;
                }
            }
        }
        result
    }

    pub fn state_of(&self, type_name: &str) -> SubscriptionState {
        self.entries
            .lock()
            .get(type_name)
            .map_or(SubscriptionState::Unsubscribed, |e| e.state)
    }

    pub fn ref_count(&self, type_name: &str) -> usize {
        self.entries.lock().get(type_name).map_or(0, |e| e.ref_count)
    }

    pub fn subscription_id(&self, type_name: &str) -> Option<Uuid> {
        self.entries.lock().get(type_name).and_then(|e| e.subscription_id)
    }

    pub fn subscribed_types(&self) -> Vec<String> {
        self.entries.lock().keys().cloned().collect()
    }

    /// The mirror of an existing subscription, without taking a reference.
    pub fn mirror<T>(&self, type_name: &str) -> Result<Mirror<T>, ClientError>
    where
        T: DeserializeOwned + Clone + Send + Sync + 'static,
    {
        let entries = self.entries.lock();
        let entry = entries
            .get(type_name)
            .ok_or_else(|| ClientError::NotSubscribed(type_name.to_owned()))?;
        Self::downcast(entry, type_name)
    }

    async fn complete_subscribe(
        &self,
        type_name: &str,
        generation: u64,
        result: Result<Uuid, ClientError>,
    ) -> Result<(), ClientError> {
        let completion = Self::settle(&mut self.entries.lock(), type_name, generation, result);

        match completion {
            Completion::Done { id, synced } => {
                log::info!("Subscribed to {type_name} ({id})");
                if let Some(items) = synced {
                    self.synced(type_name, items);
                }
                Ok(())
            }
            Completion::Failed(e) => {
                log::error!("Subscribe to {type_name} failed: {e}");
                Err(e)
            }
            Completion::Stale => {
                log::debug!("Subscribe round for {type_name} superseded");
                Ok(())
            }
            Completion::Cancel(id) => {
                log::info!("Subscription to {type_name} released before it completed");
                if let Err(e) = self.transport.unsubscribe(type_name, Some(id)).await {
                    log::warn!("Unsubscribe from {type_name} failed: {e}");
                }
                let mut entries = self.entries.lock();
                if entries.get(type_name).is_some_and(|entry| {
                    entry.generation == generation && entry.state == SubscriptionState::Unsubscribing
                }) {
                    entries.remove(type_name);
                }
                Err(ClientError::Cancelled(type_name.to_owned()))
            }
        }
    }

    /// Decide the outcome of a subscribe round against the current entry.
    fn settle(
        entries: &mut HashMap<String, Entry>,
        type_name: &str,
        generation: u64,
        result: Result<Uuid, ClientError>,
    ) -> Completion {
        let Some(entry) = entries.get_mut(type_name) else {
            return match result {
                Ok(id) => Completion::Cancel(id),
                Err(e) => Completion::Failed(e),
            };
        };
        if entry.generation != generation {
            return Completion::Stale;
        }
        let id = match result {
            Ok(id) => id,
            Err(e) => {
                if generation == 0 {
                    // A first subscription that never succeeded leaves nothing behind
                    entries.remove(type_name);
                } else {
                    entry.state = SubscriptionState::ConnectionLost;
                }
                return Completion::Failed(e);
            }
        };
        if entry.ref_count == 0 {
            entry.state = SubscriptionState::Unsubscribing;
            return Completion::Cancel(id);
        }
        entry.subscription_id = Some(id);
        let synced = if entry.snapshot_applied {
            entry.state = SubscriptionState::Synced;
            Some(entry.sink.len())
        } else {
            entry.state = SubscriptionState::AwaitingSnapshot;
            None
        };
        Completion::Done { id, synced }
    }

    fn downcast<T>(entry: &Entry, type_name: &str) -> Result<Mirror<T>, ClientError>
    where
        T: DeserializeOwned + Clone + Send + Sync + 'static,
    {
        entry
            .sink
            .as_any()
            .downcast_ref::<TypedMirror<T>>()
            .map(|typed| typed.mirror.clone())
            .ok_or_else(|| ClientError::TypeMismatch(type_name.to_owned()))
    }

    fn synced(&self, type_name: &str, items: usize) {
        log::info!("{type_name} synced ({items} items)");
        self.emit(ClientEvent::Synced {
            type_name: type_name.to_owned(),
            items,
        });
    }

    fn emit(&self, event: ClientEvent) {
        if let Err(e) = self.events.try_send(event) {
            log::warn!("Client event dropped: {e}");
        }
    }
}

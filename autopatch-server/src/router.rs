//! Subscription groups and batch fan-out.
//!
//! Each tracked type has one group (`patch/{type}`) of connections. A member
//! is `AwaitingSnapshot` until its snapshot has been routed, then `Live`.
//!
//! ```text
//! queue:  op op op [snapshot→C] op op
//!         └──┬───┘       │      └─┬─┘
//!   Live members         C    Live members (now including C)
//! ```
//!
//! Every batch is encoded once and the same `Arc<Vec<u8>>` is pushed onto
//! each recipient's unbounded outbound channel.

use autopatch_core::{group_name, Batch, ConnectionId, Operation, WireMessage};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::diff::OperationSink;
use crate::scheduler::{FlushError, FlushScheduler};

/// Outbound channel of one connection, carrying encoded wire messages.
pub type OutboundSender = mpsc::UnboundedSender<Arc<Vec<u8>>>;

/// One item of a type's flush queue.
#[derive(Debug, Clone, PartialEq)]
pub enum PatchEntry {
    /// Incremental operation for the whole group
    Operation(Operation),
    /// Full state for a single connection
    Snapshot {
        connection: ConnectionId,
        operations: Vec<Operation>,
    },
}

impl OperationSink for Arc<FlushScheduler<PatchEntry>> {
    fn emit(&self, op: Operation) {
        self.enqueue(PatchEntry::Operation(op));
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemberState {
    AwaitingSnapshot,
    Live,
}

/// Statistics for monitoring routing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RouterStats {
    pub batches_broadcast: u64,
    pub snapshots_sent: u64,
    pub operations_routed: u64,
    /// Sends that found the connection's channel closed
    pub closed_sends: u64,
}

#[derive(Default)]
struct AtomicRouterStats {
    batches_broadcast: AtomicU64,
    snapshots_sent: AtomicU64,
    operations_routed: AtomicU64,
    closed_sends: AtomicU64,
}

/// Split a drained queue into batches, preserving queue order.
///
/// Consecutive operations form one broadcast batch; every snapshot marker
/// becomes its own targeted batch.
pub fn split_batches(entries: &[PatchEntry]) -> Vec<Batch> {
    let mut batches = Vec::new();
    let mut run = Vec::new();
    for entry in entries {
        match entry {
            PatchEntry::Operation(op) => run.push(op.clone()),
            PatchEntry::Snapshot {
                connection,
                operations,
            } => {
                if !run.is_empty() {
                    batches.push(Batch::broadcast(std::mem::take(&mut run)));
                }
                batches.push(Batch::snapshot(*connection, operations.clone()));
            }
        }
    }
    if !run.is_empty() {
        batches.push(Batch::broadcast(run));
    }
    batches
}

/// Connection registry and per-type groups.
#[derive(Default)]
pub struct BroadcastRouter {
    connections: RwLock<HashMap<ConnectionId, OutboundSender>>,
    /// group name → members
    groups: RwLock<HashMap<String, HashMap<ConnectionId, MemberState>>>,
    stats: AtomicRouterStats,
}

impl BroadcastRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_connection(&self, connection: ConnectionId, sender: OutboundSender) {
        self.connections.write().insert(connection, sender);
    }

    /// Forget a connection and remove it from every group.
    ///
    /// Returns the names of the groups it was a member of.
    pub fn remove_connection(&self, connection: &ConnectionId) -> Vec<String> {
        self.connections.write().remove(connection);
        let mut groups = self.groups.write();
        let mut left = Vec::new();
        for (name, members) in groups.iter_mut() {
            if members.remove(connection).is_some() {
                left.push(name.clone());
            }
        }
        groups.retain(|_, members| !members.is_empty());
        left
    }

    pub fn is_connected(&self, connection: &ConnectionId) -> bool {
        self.connections.read().contains_key(connection)
    }

    pub fn connection_count(&self) -> usize {
        self.connections.read().len()
    }

    /// Add `connection` to the type's group, awaiting its snapshot.
    pub fn join(&self, type_name: &str, connection: ConnectionId) {
        self.groups
            .write()
            .entry(group_name(type_name))
            .or_default()
            .insert(connection, MemberState::AwaitingSnapshot);
    }

    pub fn leave(&self, type_name: &str, connection: &ConnectionId) -> bool {
        let mut groups = self.groups.write();
        let name = group_name(type_name);
        let Some(members) = groups.get_mut(&name) else {
            return false;
        };
        let removed = members.remove(connection).is_some();
        if members.is_empty() {
            groups.remove(&name);
        }
        removed
    }

    /// Suspend incremental delivery to a member until its next snapshot.
    pub fn mark_awaiting(&self, type_name: &str, connection: &ConnectionId) -> bool {
        let mut groups = self.groups.write();
        match groups
            .get_mut(&group_name(type_name))
            .and_then(|members| members.get_mut(connection))
        {
            Some(state) => {
                *state = MemberState::AwaitingSnapshot;
                true
            }
            None => false,
        }
    }

    pub fn member_state(&self, type_name: &str, connection: &ConnectionId) -> Option<MemberState> {
        self.groups
            .read()
            .get(&group_name(type_name))
            .and_then(|members| members.get(connection).copied())
    }

    pub fn is_member(&self, type_name: &str, connection: &ConnectionId) -> bool {
        self.member_state(type_name, connection).is_some()
    }

    pub fn member_count(&self, type_name: &str) -> usize {
        self.groups
            .read()
            .get(&group_name(type_name))
            .map_or(0, HashMap::len)
    }

    pub fn live_count(&self, type_name: &str) -> usize {
        self.groups.read().get(&group_name(type_name)).map_or(0, |members| {
            members
                .values()
                .filter(|state| **state == MemberState::Live)
                .count()
        })
    }

    /// Route one drained queue of `type_name` in order.
    pub fn dispatch(&self, type_name: &str, entries: &[PatchEntry]) -> Result<(), FlushError> {
        let batches = split_batches(entries);
        let name = group_name(type_name);

        // Lock order: groups, then connections
        let mut groups = self.groups.write();
        let connections = self.connections.read();
        let Some(members) = groups.get_mut(&name) else {
            log::trace!("No subscribers for {name}; {} batches dropped", batches.len());
            return Ok(());
        };

        for batch in batches {
            let ops = batch.operations();
            match batch.target() {
                None => {
                    let msg = WireMessage::patch(type_name, ops)
                        .map_err(|e| FlushError(e.to_string()))?;
                    let encoded = Arc::new(msg.encode().map_err(|e| FlushError(e.to_string()))?);
                    let mut recipients = 0usize;
                    for (connection, state) in members.iter() {
                        if *state != MemberState::Live {
                            continue;
                        }
                        if self.send(&connections, connection, encoded.clone()) {
                            recipients += 1;
                        }
                    }
                    log::debug!("Broadcast {} ops on {name} to {recipients} connections", ops.len());
                    self.stats.batches_broadcast.fetch_add(1, Ordering::Relaxed);
                    self.stats
                        .operations_routed
                        .fetch_add(ops.len() as u64, Ordering::Relaxed);
                }
                Some(target) => {
                    let Some(state) = members.get_mut(&target) else {
                        log::debug!("Snapshot target {target} left {name}; snapshot dropped");
                        continue;
                    };
                    let msg = WireMessage::snapshot(type_name, ops)
                        .map_err(|e| FlushError(e.to_string()))?;
                    let encoded = Arc::new(msg.encode().map_err(|e| FlushError(e.to_string()))?);
                    *state = MemberState::Live;
                    if self.send(&connections, &target, encoded) {
                        log::debug!("Snapshot of {} items on {name} sent to {target}", ops.len());
                    }
                    self.stats.snapshots_sent.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
        Ok(())
    }

    pub fn stats(&self) -> RouterStats {
        RouterStats {
            batches_broadcast: self.stats.batches_broadcast.load(Ordering::Relaxed),
            snapshots_sent: self.stats.snapshots_sent.load(Ordering::Relaxed),
            operations_routed: self.stats.operations_routed.load(Ordering::Relaxed),
            closed_sends: self.stats.closed_sends.load(Ordering::Relaxed),
        }
    }

    fn send(
        &self,
        connections: &HashMap<ConnectionId, OutboundSender>,
        connection: &ConnectionId,
        encoded: Arc<Vec<u8>>,
    ) -> bool {
        let delivered = connections
            .get(connection)
            .is_some_and(|sender| sender.send(encoded).is_ok());
        if !delivered {
            log::warn!("Connection {connection} is closed; message dropped");
            self.stats.closed_sends.fetch_add(1, Ordering::Relaxed);
        }
        delivered
    }
}

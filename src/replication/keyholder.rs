//! The per-key state machine. A keyholder owns three version-ordered queues
//! for one (region, key):
//!
//! - deferred: chain updates received out of order, parked until their
//!   predecessor version arrives.
//! - blocked: updates received and ordered but not yet forwarded.
//! - committable: updates forwarded down the chain, awaiting their ack.
//!
//! Queue invariants (enforced under the key's stripe lock):
//!
//! * Every committable version is below every blocked version; deferred
//!   versions are gaps above the latest known version.
//! * A version lives in at most one queue at a time.
//! * `version_on_disk` never exceeds the newest committable version and never
//!   decreases.
//! * A keyholder with all three queues empty is garbage.
//!
//! Keyholders do no I/O and never take locks; the manager owns both.

use super::message::MsgType;
use crate::config::{EntityId, Instance, RegionId};
use crate::error::{Error, Result};
use crate::storage::Reference;

use bytes::Bytes;
use std::collections::BTreeMap;

/// A client mutation awaiting its response, carried by the pending op it
/// produced until the ack comes back to the point-leader.
#[derive(Clone, Copy, Debug)]
pub struct ClientOp {
    pub region: RegionId,
    pub from: EntityId,
    pub nonce: u64,
}

/// Chain coordinates of a pending op: where this update sits in each
/// adjacent subspace's hash space, as computed by prev_and_next.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct ChainCoords {
    pub subspace_prev: Option<u16>,
    pub subspace_next: Option<u16>,
    pub point_prev: u64,
    pub point_this: u64,
    pub point_next: u64,
    pub point_next_next: u64,
}

/// An ordered update: blocked until its turn, then committable until acked.
#[derive(Clone, Debug)]
pub struct Pending {
    /// False for deletes.
    pub has_value: bool,
    /// A create: no predecessor version is required.
    pub fresh: bool,
    pub key: Bytes,
    pub value: Vec<Bytes>,
    /// Set at the point-leader while the client waits.
    pub client: Option<ClientOp>,
    /// The message type used when responding to the client.
    pub retcode: MsgType,
    /// Pins the disk-resident backing the value slices may refer to.
    pub reference: Reference,
    pub subspace_prev: Option<u16>,
    pub subspace_next: Option<u16>,
    pub point_prev: u64,
    pub point_this: u64,
    pub point_next: u64,
    pub point_next_next: u64,
    /// The entity and instance we received this update from.
    pub recv: Option<(EntityId, Instance)>,
    /// The entity and instance we forwarded this update to; None until sent,
    /// cleared by the retransmission pass on instance churn.
    pub sent: Option<(EntityId, Instance)>,
    pub acked: bool,
}

impl Pending {
    pub fn new(has_value: bool, key: Bytes, value: Vec<Bytes>) -> Self {
        Self {
            has_value,
            fresh: false,
            key,
            value,
            client: None,
            retcode: MsgType::RespAtomic,
            reference: Reference::default(),
            subspace_prev: None,
            subspace_next: None,
            point_prev: 0,
            point_this: 0,
            point_next: 0,
            point_next_next: 0,
            recv: None,
            sent: None,
            acked: false,
        }
    }

    pub fn set_chain_coords(&mut self, coords: ChainCoords) {
        self.subspace_prev = coords.subspace_prev;
        self.subspace_next = coords.subspace_next;
        self.point_prev = coords.point_prev;
        self.point_this = coords.point_this;
        self.point_next = coords.point_next;
        self.point_next_next = coords.point_next_next;
    }
}

/// An out-of-order update, parked without chain coordinates until its
/// predecessor version resolves.
#[derive(Clone, Debug)]
pub struct Deferred {
    pub has_value: bool,
    pub key: Bytes,
    pub value: Vec<Bytes>,
    pub from: EntityId,
    pub from_instance: Instance,
    pub reference: Reference,
}

/// The per-key queues. All methods require the caller to hold the key's
/// stripe lock.
#[derive(Default)]
pub struct KeyHolder {
    deferred: BTreeMap<u64, Deferred>,
    blocked: BTreeMap<u64, Pending>,
    committable: BTreeMap<u64, Pending>,
    version_on_disk: u64,
}

impl KeyHolder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parks an out-of-order update at its version.
    pub fn insert_deferred(&mut self, version: u64, op: Deferred) -> Result<()> {
        if self.deferred.contains_key(&version) {
            return Err(Error::DuplicateVersion(version));
        }
        self.deferred.insert(version, op);
        Ok(())
    }

    /// Appends an ordered update. The version must exceed everything already
    /// blocked or committable.
    pub fn append_blocked(&mut self, version: u64, op: Pending) {
        debug_assert!(self.most_recent_blocked_version().map_or(true, |v| v < version));
        debug_assert!(self.most_recent_committable_version().map_or(true, |v| v < version));
        self.blocked.insert(version, op);
    }

    /// Moves the oldest blocked op to the committable tail.
    pub fn transfer_blocked_to_committable(&mut self) {
        if let Some((version, op)) = self.blocked.pop_first() {
            self.committable.insert(version, op);
        }
    }

    pub fn remove_oldest_committable_op(&mut self) -> Option<(u64, Pending)> {
        self.committable.pop_first()
    }

    pub fn remove_oldest_deferred_op(&mut self) -> Option<(u64, Deferred)> {
        self.deferred.pop_first()
    }

    /// Finds an op by version across blocked and committable.
    pub fn get_by_version(&self, version: u64) -> Option<&Pending> {
        self.blocked.get(&version).or_else(|| self.committable.get(&version))
    }

    pub fn get_by_version_mut(&mut self, version: u64) -> Option<&mut Pending> {
        self.blocked.get_mut(&version).or_else(|| self.committable.get_mut(&version))
    }

    pub fn has_deferred_ops(&self) -> bool {
        !self.deferred.is_empty()
    }

    pub fn has_blocked_ops(&self) -> bool {
        !self.blocked.is_empty()
    }

    pub fn has_committable_ops(&self) -> bool {
        !self.committable.is_empty()
    }

    pub fn empty(&self) -> bool {
        self.deferred.is_empty() && self.blocked.is_empty() && self.committable.is_empty()
    }

    pub fn oldest_deferred_version(&self) -> Option<u64> {
        self.deferred.keys().next().copied()
    }

    pub fn oldest_deferred_op(&self) -> Option<&Deferred> {
        self.deferred.values().next()
    }

    pub fn oldest_blocked_version(&self) -> Option<u64> {
        self.blocked.keys().next().copied()
    }

    pub fn oldest_blocked_op(&self) -> Option<&Pending> {
        self.blocked.values().next()
    }

    pub fn most_recent_blocked_version(&self) -> Option<u64> {
        self.blocked.keys().next_back().copied()
    }

    pub fn most_recent_blocked_op(&self) -> Option<&Pending> {
        self.blocked.values().next_back()
    }

    pub fn oldest_committable_version(&self) -> Option<u64> {
        self.committable.keys().next().copied()
    }

    pub fn oldest_committable_op(&self) -> Option<&Pending> {
        self.committable.values().next()
    }

    pub fn oldest_committable_op_mut(&mut self) -> Option<(u64, &mut Pending)> {
        self.committable.iter_mut().next().map(|(v, op)| (*v, op))
    }

    pub fn most_recent_committable_version(&self) -> Option<u64> {
        self.committable.keys().next_back().copied()
    }

    pub fn most_recent_committable_op(&self) -> Option<&Pending> {
        self.committable.values().next_back()
    }

    /// The newest version queued anywhere, with its op: the blocked tail if
    /// any, else the committable tail.
    pub fn latest_queued(&self) -> Option<(u64, &Pending)> {
        self.most_recent_blocked_version()
            .zip(self.most_recent_blocked_op())
            .or_else(|| self.most_recent_committable_version().zip(self.most_recent_committable_op()))
    }

    pub fn version_on_disk(&self) -> u64 {
        self.version_on_disk
    }

    pub fn set_version_on_disk(&mut self, version: u64) {
        debug_assert!(version >= self.version_on_disk);
        self.version_on_disk = version;
    }
}

//! The replication manager orders client mutations against a key, propagates
//! them along the key's value-dependent chain, integrates chain traffic with
//! local disk state, and acknowledges completion back to the client.
//!
//! Client requests enter through [`ReplicationManager::client_atomic`] and
//! [`ReplicationManager::client_del`] at the point-leader only; peer traffic
//! enters through the `chain_*` handlers (or [`ReplicationManager::handle_message`],
//! which decodes raw payloads). Every path funnels into the same per-key
//! state machine: out-of-order updates park as deferred, ordered updates
//! queue as blocked, forwarded updates await their ack as committable.
//!
//! Protocol obligations, for a fixed (region, key):
//!
//! * Committed versions are 1, 2, 3, … with no gaps.
//! * All processing happens under the key's stripe lock, in version order.
//! * A client is answered no earlier than when its op's ack returns.
//! * Creates and deletes serialize behind every outstanding ack.
//! * Chain handlers never answer clients; they drop bad traffic and rely on
//!   the sender's retransmission.
//!
//! Lock order: stripe lock, then quiesce state lock. The keyholder table is
//! concurrent and takes no part in the ordering; erasure re-verifies entry
//! identity under the stripe lock instead.
//!
//! The manager runs one background thread that retransmits stuck committable
//! ops every [`RETRANSMIT_INTERVAL`], garbage-collects drained keyholders,
//! and reports quiescence to the coordinator. Call
//! [`ReplicationManager::shutdown`] to stop it; dropping the manager without
//! shutting down leaks the thread, since it keeps the manager alive.

use super::keyholder::{ChainCoords, ClientOp, Deferred, KeyHolder, Pending};
use super::message::{self, MsgType, ReturnCode};
use super::table::{KeyHolderMap, StripedLock};
use super::transport::Messenger;
use super::{
    Coordinator, StateTransfers, LOCK_STRIPING, REPLICATION_HASHTABLE_SIZE, RETRANSMIT_INTERVAL,
};
use crate::config::{Configuration, Coordinate, EntityId, Instance, RegionId, SubspaceId};
use crate::datatypes::{self, MicroCheck, MicroError, MicroOp};
use crate::storage::{DataLayer, Reference};

use bytes::Bytes;
use log::{debug, error, info, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::thread::JoinHandle;

/// The installed configuration and our identity under it, swapped atomically
/// on reconfigure and snapshotted at the top of every operation.
#[derive(Clone, Default)]
struct View {
    config: Arc<Configuration>,
    us: Instance,
}

/// The latest known state of a key: the newest queued op, or disk.
struct Latest {
    version: u64,
    /// None if the key does not exist (or its newest op is a delete).
    value: Option<Vec<Bytes>>,
    reference: Reference,
}

/// Replies SERVERERROR to the client unless dismissed before going out of
/// scope. Installed at the top of client entry points so that no early
/// return, however unexpected, leaves the client hanging.
struct ClientGuard<'a> {
    manager: &'a ReplicationManager,
    us: EntityId,
    client: EntityId,
    nonce: u64,
    opcode: MsgType,
    armed: bool,
}

impl<'a> ClientGuard<'a> {
    fn new(
        manager: &'a ReplicationManager,
        us: EntityId,
        client: EntityId,
        nonce: u64,
        opcode: MsgType,
    ) -> Self {
        Self { manager, us, client, nonce, opcode, armed: true }
    }

    fn dismiss(&mut self) {
        self.armed = false;
    }
}

impl Drop for ClientGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.manager.respond_to_client(
                self.us,
                self.client,
                self.nonce,
                self.opcode,
                ReturnCode::ServerError,
            );
        }
    }
}

/// The per-key replication core. See the module documentation.
pub struct ReplicationManager {
    data: Arc<dyn DataLayer>,
    comm: Arc<dyn Messenger>,
    transfers: Arc<dyn StateTransfers>,
    coordinator: Arc<dyn Coordinator>,
    view: RwLock<View>,
    locks: StripedLock,
    keyholders: KeyHolderMap,
    /// Monotone: set on the first quiescing configuration, never cleared.
    quiesce: AtomicBool,
    quiesce_state_id: Mutex<String>,
    shutdown: AtomicBool,
    periodic_thread: Mutex<Option<JoinHandle<()>>>,
}

impl ReplicationManager {
    /// Creates a manager and starts its periodic thread. The manager serves
    /// nothing until the first [`ReplicationManager::reconfigure`].
    pub fn new(
        data: Arc<dyn DataLayer>,
        comm: Arc<dyn Messenger>,
        transfers: Arc<dyn StateTransfers>,
        coordinator: Arc<dyn Coordinator>,
    ) -> Arc<Self> {
        let manager = Arc::new(Self {
            data,
            comm,
            transfers,
            coordinator,
            view: RwLock::new(View::default()),
            locks: StripedLock::new(LOCK_STRIPING),
            keyholders: KeyHolderMap::new(REPLICATION_HASHTABLE_SIZE),
            quiesce: AtomicBool::new(false),
            quiesce_state_id: Mutex::new(String::new()),
            shutdown: AtomicBool::new(false),
            periodic_thread: Mutex::new(None),
        });
        let periodic = {
            let manager = manager.clone();
            std::thread::Builder::new()
                .name("replication-periodic".into())
                .spawn(move || manager.periodic())
                .expect("failed to spawn periodic thread")
        };
        *manager.periodic_thread.lock().expect("periodic handle poisoned") = Some(periodic);
        manager
    }

    /// Installs a new configuration and evicts keyholders for regions we no
    /// longer host. If the configuration directs quiescence, client writes
    /// are refused from here on; repeated quiesce directives adopt the newest
    /// state id but never revert to serving.
    pub fn reconfigure(&self, config: Configuration, us: Instance) {
        if config.quiesce() {
            let mut state_id = self.quiesce_state_id.lock().expect("quiesce state poisoned");
            *state_id = config.quiesce_state_id().into();
            self.quiesce.store(true, Ordering::SeqCst);
        }

        let config = Arc::new(config);
        *self.view.write().expect("view poisoned") = View { config: config.clone(), us };

        for pair in self.keyholders.keys() {
            let _stripe = self.locks.lock(&pair.region, &pair.key);
            if !config.in_region(us, &pair.region) {
                self.keyholders.remove(&pair);
            }
        }
    }

    /// Stops the periodic thread. Idempotent.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        let handle = self.periodic_thread.lock().expect("periodic handle poisoned").take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }

    /// Whether the manager has begun quiescing.
    pub fn quiescing(&self) -> bool {
        self.quiesce.load(Ordering::SeqCst)
    }

    /// A client mutation: validate checks against the latest version, apply
    /// micro-ops, and queue the result for the chain. Responds on every path.
    pub fn client_atomic(
        &self,
        opcode: MsgType,
        from: EntityId,
        to: EntityId,
        nonce: u64,
        key: Bytes,
        checks: Vec<MicroCheck>,
        mut ops: Vec<MicroOp>,
        fail_if_found: bool,
        fail_if_not_found: bool,
    ) {
        if self.quiescing() {
            self.respond_to_client(to, from, nonce, opcode, ReturnCode::ReadOnly);
            return;
        }

        let view = self.view();
        let Some(schema) = view.config.get_schema(to.space()).cloned() else {
            self.respond_to_client(to, from, nonce, opcode, ReturnCode::NotUs);
            return;
        };
        if !schema.validate_key(&key) {
            self.respond_to_client(to, from, nonce, opcode, ReturnCode::BadDimSpec);
            return;
        }
        if !view.config.is_point_leader(&to) {
            self.respond_to_client(to, from, nonce, opcode, ReturnCode::NotUs);
            return;
        }

        // Reply SERVERERROR on any exit that does not dismiss.
        let mut guard = ClientGuard::new(self, to, from, nonce, opcode);

        let _stripe = self.locks.lock(&to.region, &key);
        let kh_arc = self.keyholders.get_or_insert(&to.region, &key);
        let mut kh = lock_keyholder(&kh_arc);

        let Some(latest) = self.retrieve_latest(&to.region, &key, &kh) else {
            return;
        };

        let fresh = latest.value.is_none();
        if fresh && fail_if_not_found {
            self.respond_to_client(to, from, nonce, opcode, ReturnCode::NotFound);
            guard.dismiss();
            return;
        }
        if !fresh && fail_if_found {
            self.respond_to_client(to, from, nonce, opcode, ReturnCode::CmpFail);
            guard.dismiss();
            return;
        }
        if let Some(value) = &latest.value {
            if !schema.matches_value_arity(value) {
                error!("stored object for key {} has wrong arity", hex::encode(&key));
                return;
            }
        }

        let old_value = latest.value.clone().unwrap_or_default();
        let new_value =
            match datatypes::apply_checks_and_ops(&schema, &checks, &mut ops, &key, &old_value) {
                Ok(value) => value,
                Err(MicroError::Overflow) => {
                    self.respond_to_client(to, from, nonce, opcode, ReturnCode::Overflow);
                    guard.dismiss();
                    return;
                }
                Err(_) => {
                    self.respond_to_client(to, from, nonce, opcode, ReturnCode::CmpFail);
                    guard.dismiss();
                    return;
                }
            };

        let mut pending = Pending::new(true, key.clone(), new_value);
        pending.fresh = fresh;
        pending.reference = latest.reference;
        pending.client = Some(ClientOp { region: to.region, from, nonce });
        pending.retcode = opcode;

        let Some(coords) = self.prev_and_next(
            &view.config,
            &to.region,
            &key,
            Some(pending.value.as_slice()),
            latest.value.as_deref(),
        ) else {
            self.respond_to_client(to, from, nonce, opcode, ReturnCode::NotUs);
            guard.dismiss();
            return;
        };
        pending.set_chain_coords(coords);

        debug_assert!(!kh.has_deferred_ops(), "point-leader cannot have deferred ops");
        kh.append_blocked(latest.version + 1, pending);
        self.move_operations_between_queues(&view, to, &key, &mut kh);
        guard.dismiss();
    }

    /// A client delete. A delete of an absent key is NOTFOUND; an existing
    /// key's delete is versioned and chained like any other update.
    pub fn client_del(
        &self,
        opcode: MsgType,
        from: EntityId,
        to: EntityId,
        nonce: u64,
        key: Bytes,
        checks: Vec<MicroCheck>,
    ) {
        if self.quiescing() {
            self.respond_to_client(to, from, nonce, opcode, ReturnCode::ReadOnly);
            return;
        }

        let view = self.view();
        let Some(schema) = view.config.get_schema(to.space()).cloned() else {
            self.respond_to_client(to, from, nonce, opcode, ReturnCode::NotUs);
            return;
        };
        if !schema.validate_key(&key) {
            self.respond_to_client(to, from, nonce, opcode, ReturnCode::BadDimSpec);
            return;
        }
        if !view.config.is_point_leader(&to) {
            self.respond_to_client(to, from, nonce, opcode, ReturnCode::NotUs);
            return;
        }

        let mut guard = ClientGuard::new(self, to, from, nonce, opcode);

        let _stripe = self.locks.lock(&to.region, &key);
        let kh_arc = self.keyholders.get_or_insert(&to.region, &key);
        let mut kh = lock_keyholder(&kh_arc);

        let Some(latest) = self.retrieve_latest(&to.region, &key, &kh) else {
            return;
        };
        let Some(old_value) = latest.value else {
            self.respond_to_client(to, from, nonce, opcode, ReturnCode::NotFound);
            guard.dismiss();
            return;
        };

        // The checks a delete carries are validated against the value it
        // removes.
        if !checks.is_empty() {
            let mut no_ops: [MicroOp; 0] = [];
            if datatypes::apply_checks_and_ops(&schema, &checks, &mut no_ops, &key, &old_value)
                .is_err()
            {
                self.respond_to_client(to, from, nonce, opcode, ReturnCode::CmpFail);
                guard.dismiss();
                return;
            }
        }

        let mut pending = Pending::new(false, key.clone(), old_value.clone());
        pending.reference = latest.reference;
        pending.client = Some(ClientOp { region: to.region, from, nonce });
        pending.retcode = opcode;

        let Some(coords) =
            self.prev_and_next(&view.config, &to.region, &key, None, Some(old_value.as_slice()))
        else {
            self.respond_to_client(to, from, nonce, opcode, ReturnCode::NotUs);
            guard.dismiss();
            return;
        };
        pending.set_chain_coords(coords);

        debug_assert!(!kh.has_deferred_ops(), "point-leader cannot have deferred ops");
        kh.append_blocked(latest.version + 1, pending);
        self.move_operations_between_queues(&view, to, &key, &mut kh);
        guard.dismiss();
    }

    /// A CHAIN_PUT from a peer.
    pub fn chain_put(
        &self,
        from: EntityId,
        to: EntityId,
        version: u64,
        fresh: bool,
        key: Bytes,
        value: Vec<Bytes>,
    ) {
        self.chain_common(true, from, to, version, fresh, key, value);
    }

    /// A CHAIN_DEL from a peer.
    pub fn chain_del(&self, from: EntityId, to: EntityId, version: u64, key: Bytes) {
        self.chain_common(false, from, to, version, false, key, Vec::new());
    }

    /// A CHAIN_SUBSPACE from a peer: an update whose value moved this key to
    /// another region of our subspace. The sender precomputed where the
    /// update goes after us (`next_point`); we verify the update actually
    /// lands here and relay it down our chain.
    pub fn chain_subspace(
        &self,
        from: EntityId,
        to: EntityId,
        version: u64,
        key: Bytes,
        value: Vec<Bytes>,
        next_point: u64,
    ) {
        let view = self.view();
        let Some(schema) = view.config.get_schema(to.space()) else {
            info!("dropping CHAIN_SUBSPACE for an unknown space");
            return;
        };
        if !schema.matches_value_arity(&value) {
            info!("dropping CHAIN_SUBSPACE because the dimensions are incorrect");
            return;
        }
        let Some(subspaces) = view.config.subspaces(to.space()) else {
            return;
        };

        let _stripe = self.locks.lock(&to.region, &key);
        let kh_arc = self.keyholders.get_or_insert(&to.region, &key);
        let mut kh = lock_keyholder(&kh_arc);

        let Some(latest) = self.retrieve_latest(&to.region, &key, &kh) else {
            return;
        };
        if latest.version >= version {
            self.send_ack(to, from, version, &key);
            return;
        }

        let mut pending = Pending::new(true, key.clone(), value);
        pending.recv = Some((from, view.config.instancefor(&from).unwrap_or_default()));
        pending.subspace_prev = Some(to.subspace_index());
        pending.subspace_next =
            ((to.subspace_index() as usize) < subspaces - 1).then(|| to.subspace_index() + 1);
        pending.point_prev = from.region.mask;
        let Some(hasher) = view.config.repl_hasher(to.subspace()) else {
            return;
        };
        pending.point_this = hasher.hash(&key, &pending.value).point;
        pending.point_next = next_point;

        // The handoff stays within one subspace: tail of the old region to
        // head of the new. Anything else is misrouted.
        if from.subspace() != to.subspace()
            || (!(from.region == to.region && view.config.chain_adjacent(&from, &to))
                && !(from.region != to.region
                    && view.config.is_tail(&from)
                    && view.config.is_head(&to)))
        {
            info!("dropping CHAIN_SUBSPACE message which didn't come from the right host");
            return;
        }
        if !to.region.contains(Coordinate::full(pending.point_this)) {
            info!("dropping CHAIN_SUBSPACE message which didn't come to the right host");
            return;
        }

        kh.append_blocked(version, pending);
        self.move_operations_between_queues(&view, to, &key, &mut kh);
    }

    /// A CHAIN_ACK from the entity we forwarded to: persist, garbage-collect,
    /// and either answer the waiting client (point-leader) or propagate the
    /// ack upstream.
    pub fn chain_ack(&self, from: EntityId, to: EntityId, version: u64, key: Bytes) {
        let view = self.view();
        let _stripe = self.locks.lock(&to.region, &key);
        let Some(kh_arc) = self.keyholders.lookup(&to.region, &key) else {
            info!("dropping CHAIN_ACK for update we haven't seen");
            return;
        };
        let mut kh = lock_keyholder(&kh_arc);

        let (client, retcode, recv) = {
            let Some(pend) = kh.get_by_version_mut(version) else {
                info!("dropping CHAIN_ACK for update we haven't seen");
                return;
            };
            let Some((sent_e, _)) = pend.sent else {
                info!("dropping CHAIN_ACK for update we haven't sent");
                return;
            };
            if from != sent_e {
                info!("dropping CHAIN_ACK that came from the wrong host");
                return;
            }
            pend.acked = true;
            // Taking the client op here makes duplicate acks unable to
            // answer twice; the op itself may be garbage-collected below.
            (pend.client.take(), pend.retcode, pend.recv)
        };

        self.transfers.add_trigger(&to.region, &key, version);
        self.put_to_disk(&to.region, &mut kh, version);

        while kh.oldest_committable_op().is_some_and(|op| op.acked) {
            kh.remove_oldest_committable_op();
        }

        self.move_operations_between_queues(&view, to, &key, &mut kh);

        if view.config.is_point_leader(&to) {
            if let Some(co) = client {
                self.respond_to_client(to, co.from, co.nonce, retcode, ReturnCode::Success);
            }
        } else if let Some((recv_e, _)) = recv {
            self.send_ack(to, recv_e, version, &key);
        }

        if kh.empty() {
            drop(kh);
            self.keyholders.remove_if_same(&to.region, &key, &kh_arc);
        }
    }

    /// Decodes a raw chain payload (framing header already stripped) and
    /// dispatches it. Malformed payloads are dropped; the sender retransmits.
    pub fn handle_message(&self, from: EntityId, to: EntityId, msgtype: MsgType, payload: Bytes) {
        let result = match msgtype {
            MsgType::ChainPut => message::decode_chain_put(payload)
                .map(|m| self.chain_put(from, to, m.version, m.fresh, m.key, m.value)),
            MsgType::ChainDel => message::decode_chain_del(payload)
                .map(|m| self.chain_del(from, to, m.version, m.key)),
            MsgType::ChainSubspace => message::decode_chain_subspace(payload)
                .map(|m| self.chain_subspace(from, to, m.version, m.key, m.value, m.next_point)),
            MsgType::ChainAck => message::decode_chain_ack(payload)
                .map(|m| self.chain_ack(from, to, m.version, m.key)),
            MsgType::ReqAtomic | MsgType::RespAtomic => {
                info!("dropping non-chain message {msgtype:?}");
                Ok(())
            }
        };
        if let Err(err) = result {
            info!("dropping malformed {msgtype:?}: {err}");
        }
    }

    /// CHAIN_PUT and CHAIN_DEL share everything but the value.
    fn chain_common(
        &self,
        has_value: bool,
        from: EntityId,
        to: EntityId,
        version: u64,
        fresh: bool,
        key: Bytes,
        value: Vec<Bytes>,
    ) {
        if version == 0 {
            info!("dropping CHAIN_* with version zero");
            return;
        }

        let view = self.view();
        let Some(schema) = view.config.get_schema(to.space()) else {
            info!("dropping CHAIN_* for an unknown space");
            return;
        };
        if has_value && !schema.matches_value_arity(&value) {
            info!("dropping CHAIN_* because the dimensions are incorrect");
            return;
        }

        let _stripe = self.locks.lock(&to.region, &key);
        let kh_arc = self.keyholders.get_or_insert(&to.region, &key);
        let mut kh = lock_keyholder(&kh_arc);

        // A duplicate of something already queued: adopt the (possibly
        // restarted) sender as our upstream and re-ack.
        if let Some(newop) = kh.get_by_version_mut(version) {
            newop.recv = Some((from, view.config.instancefor(&from).unwrap_or_default()));
            self.send_ack(to, from, version, &key);
            return;
        }

        // Resolve the predecessor: the queued previous version if present,
        // else disk. A predecessor gap leaves old_version at zero.
        let mut old_version = 0;
        let mut old_value: Option<Vec<Bytes>> = None;
        let mut reference = Reference::default();
        if let Some(oldop) = kh.get_by_version(version - 1) {
            old_version = version - 1;
            old_value = oldop.has_value.then(|| oldop.value.clone());
        } else {
            let Some((disk_value, disk_version, disk_ref)) = self.from_disk(&to.region, &key)
            else {
                info!("dropping CHAIN_* because the data layer failed");
                return;
            };
            if disk_version >= version {
                self.send_ack(to, from, version, &key);
                return;
            }
            old_value = disk_value;
            reference = disk_ref;
            if disk_version == version - 1 {
                old_version = disk_version;
            }
        }

        // Can't order it yet: park it until the predecessor arrives.
        if old_version == 0 && !fresh {
            let deferred = Deferred {
                has_value,
                key: key.clone(),
                value,
                from,
                from_instance: view.config.instancefor(&from).unwrap_or_default(),
                reference,
            };
            if let Err(err) = kh.insert_deferred(version, deferred) {
                debug!("dropping CHAIN_* already deferred: {err}");
            }
            return;
        }

        let mut pending = Pending::new(has_value, key.clone(), value);
        pending.fresh = fresh;
        pending.reference = reference;
        pending.recv = Some((from, view.config.instancefor(&from).unwrap_or_default()));

        let newside = has_value.then_some(&pending.value[..]);
        let Some(coords) =
            self.prev_and_next(&view.config, &to.region, &key, newside, old_value.as_deref())
        else {
            info!("dropping CHAIN_* which does not match this host");
            return;
        };
        pending.set_chain_coords(coords);

        if !Self::valid_chain_sender(&view.config, &from, &to) {
            info!("dropping CHAIN_* which didn't come from the right host");
            return;
        }

        kh.append_blocked(version, pending);
        self.move_operations_between_queues(&view, to, &key, &mut kh);
    }

    /// Whether a chain update may come from `from` to `us`: our chain
    /// predecessor, or the tail of the previous subspace when we are a head.
    fn valid_chain_sender(config: &Configuration, from: &EntityId, us: &EntityId) -> bool {
        (from.region == us.region && config.chain_adjacent(from, us))
            || (from.space() == us.space()
                && from.subspace_index() + 1 == us.subspace_index()
                && config.is_tail(from)
                && config.is_head(us))
    }

    /// Snapshots the current view.
    fn view(&self) -> View {
        self.view.read().expect("view poisoned").clone()
    }

    /// The latest known version of a key: the newest blocked op, else the
    /// newest committable op, else disk. None if the data layer failed.
    fn retrieve_latest(&self, region: &RegionId, key: &[u8], kh: &KeyHolder) -> Option<Latest> {
        if let Some((version, op)) = kh.latest_queued() {
            return Some(Latest {
                version,
                value: op.has_value.then(|| op.value.clone()),
                reference: Reference::default(),
            });
        }
        let (value, version, reference) = self.from_disk(region, key)?;
        Some(Latest { version, value, reference })
    }

    /// Reads a key from the data layer. Absence is success with version
    /// zero; a data layer fault is None.
    fn from_disk(
        &self,
        region: &RegionId,
        key: &[u8],
    ) -> Option<(Option<Vec<Bytes>>, u64, Reference)> {
        match self.data.get(region, key) {
            Ok(Some(stored)) => Some((Some(stored.value), stored.version, stored.reference)),
            Ok(None) => Some((None, 0, Reference::default())),
            Err(err) => {
                error!("data layer failed reading key {}: {err}", hex::encode(key));
                None
            }
        }
    }

    /// Persists the op at `version` once its ack has been seen. Deletes are
    /// removals, as are values handing this key off to another region of our
    /// subspace. The disk version advances even on failure, so a sick disk
    /// cannot wedge the chain; the failure is logged with its cause.
    fn put_to_disk(&self, region: &RegionId, kh: &mut KeyHolder, version: u64) -> bool {
        if version <= kh.version_on_disk() {
            return true;
        }
        let Some(op) = kh.get_by_version(version) else {
            return false;
        };

        let mut success = true;
        let migrating =
            op.subspace_next == Some(region.subspace_index()) && region.subspace_index() != 0;
        if !op.has_value || migrating {
            if let Err(err) = self.data.del(region, &op.key) {
                error!("commit caused error {err}");
                success = false;
            }
        } else if let Err(err) = self.data.put(region, &op.key, &op.value, version) {
            error!("commit caused error {err}");
            success = false;
        }

        kh.set_version_on_disk(version);
        success
    }

    /// Computes a pending op's chain coordinates, or None if the update does
    /// not belong on this region's chain.
    ///
    /// When both sides exist, the predecessor hop hashes the new value and
    /// the successor hop hashes the old one; that asymmetry is what keeps
    /// value-dependent chains contiguous across an update that moves the
    /// value. A region containing the old hash but not the new one is
    /// handing the key to a sibling region, which turns the successor hop
    /// into a CHAIN_SUBSPACE and precomputes the hop after it.
    fn prev_and_next(
        &self,
        config: &Configuration,
        region: &RegionId,
        key: &[u8],
        newvalue: Option<&[Bytes]>,
        oldvalue: Option<&[Bytes]>,
    ) -> Option<ChainCoords> {
        let subspaces = config.subspaces(region.space())?;
        let mut coords = ChainCoords {
            subspace_prev: (region.subspace_index() > 0).then(|| region.subspace_index() - 1),
            subspace_next: ((region.subspace_index() as usize) < subspaces - 1)
                .then(|| region.subspace_index() + 1),
            ..ChainCoords::default()
        };

        let hasher_this = config.repl_hasher(region.subspace)?;
        let (coord_old, coord_new) = match (oldvalue, newvalue) {
            (Some(old), Some(new)) => (hasher_this.hash(key, old), hasher_this.hash(key, new)),
            (Some(old), None) => {
                let coord = hasher_this.hash(key, old);
                (coord, coord)
            }
            (None, Some(new)) => {
                let coord = hasher_this.hash(key, new);
                (coord, coord)
            }
            (None, None) => return None,
        };

        let mut set_next = false;
        if region.contains(coord_old) && region.contains(coord_new) {
            coords.point_this = coord_new.point;
        } else if region.contains(coord_old) {
            // The new value hashes out of this region: hand off with
            // CHAIN_SUBSPACE. Precompute where the update goes after the
            // receiving region so it can keep chaining forward.
            if let Some(next) = coords.subspace_next {
                let hasher = config.repl_hasher(SubspaceId::new(region.space(), next))?;
                coords.point_next_next = hasher.hash(key, oldvalue?).point;
            }
            coords.subspace_next = Some(region.subspace_index());
            coords.point_this = coord_old.point;
            coords.point_next = coord_new.point;
            set_next = true;
        } else {
            // Contains only the new hash, or neither: not ours.
            return None;
        }

        if let Some(prev) = coords.subspace_prev {
            let hasher = config.repl_hasher(SubspaceId::new(region.space(), prev))?;
            coords.point_prev = hasher.hash(key, newvalue.or(oldvalue)?).point;
        }
        if !set_next {
            if let Some(next) = coords.subspace_next {
                let hasher = config.repl_hasher(SubspaceId::new(region.space(), next))?;
                coords.point_next = hasher.hash(key, oldvalue.or(newvalue)?).point;
            }
        }

        Some(coords)
    }

    /// Promotes whatever became promotable.
    ///
    /// Phase A moves deferred ops whose predecessor is now known into
    /// blocked, re-running the coordinate computation and sender checks that
    /// chain_common would have. Phase B releases blocked ops in version
    /// order, with one barrier: creates and deletes wait until every
    /// committable op is acked, since both assume a settled predecessor
    /// state.
    fn move_operations_between_queues(
        &self,
        view: &View,
        us: EntityId,
        key: &Bytes,
        kh: &mut KeyHolder,
    ) {
        while kh.has_deferred_ops() {
            let Some(deferred_version) = kh.oldest_deferred_version() else {
                break;
            };

            let latest = match kh.latest_queued() {
                Some((version, op)) => Some((version, op.has_value.then(|| op.value.clone()))),
                None => self
                    .from_disk(&us.region, key)
                    .map(|(value, version, _)| (version, value)),
            };
            let Some((latest_version, latest_value)) = latest else {
                return;
            };

            if latest_version >= deferred_version {
                info!("dropping deferred update for an already-seen version");
                kh.remove_oldest_deferred_op();
                continue;
            }
            if latest_version + 1 != deferred_version {
                break;
            }

            let Some((version, op)) = kh.remove_oldest_deferred_op() else {
                break;
            };
            let newside = op.has_value.then_some(&op.value[..]);
            let Some(coords) = self.prev_and_next(
                &view.config,
                &us.region,
                key,
                newside,
                latest_value.as_deref(),
            ) else {
                info!("dropping deferred update which does not match this host");
                return;
            };
            if !Self::valid_chain_sender(&view.config, &op.from, &us) {
                info!("dropping deferred update which didn't come from the right host");
                return;
            }

            let mut pending = Pending::new(op.has_value, op.key, op.value);
            pending.fresh = false;
            pending.reference = op.reference;
            pending.recv = Some((op.from, op.from_instance));
            pending.set_chain_coords(coords);
            kh.append_blocked(version, pending);
        }

        while kh.has_blocked_ops() {
            let Some(version) = kh.oldest_blocked_version() else {
                break;
            };
            let Some(op) = kh.oldest_blocked_op() else {
                break;
            };
            if (op.fresh || !op.has_value) && kh.has_committable_ops() {
                break;
            }
            kh.transfer_blocked_to_committable();
            if let Some(op) = kh.get_by_version_mut(version) {
                self.send_message(view, us, version, key, op);
            }
        }
    }

    /// Forwards a committable op one hop, or acks it if the chain ends here.
    /// Idempotent while an earlier send is outstanding; the retransmission
    /// pass clears `sent` when the send must be repeated.
    fn send_message(&self, view: &View, us: EntityId, version: u64, key: &[u8], op: &mut Pending) {
        if op.sent.is_some() {
            return;
        }
        let config = &view.config;
        let header = self.comm.header_size();

        let dst;
        if config.is_tail(&us) {
            match op.subspace_next {
                // The end of the whole chain: turn the update around by
                // acking ourselves.
                None => {
                    let msg = message::pack_chain_ack(header, version, key);
                    if self.comm.send(us, us, MsgType::ChainAck, msg) {
                        op.sent = Some((us, view.us));
                    }
                    return;
                }
                // Hand off to the region now owning this key's point in our
                // own subspace.
                Some(next) if next == us.subspace_index() => {
                    let msg = message::pack_chain_subspace(
                        header,
                        version,
                        key,
                        &op.value,
                        op.point_next_next,
                    );
                    let Some(target) =
                        config.sloppy_lookup(SubspaceId::new(us.space(), next), op.point_next)
                    else {
                        debug!("no available host for subspace handoff");
                        return;
                    };
                    if self.comm.send(us, target, MsgType::ChainSubspace, msg) {
                        op.sent = Some((target, config.instancefor(&target).unwrap_or_default()));
                    }
                    return;
                }
                // The head of the next subspace's chain.
                Some(next) if next == us.subspace_index() + 1 => {
                    let Some(target) =
                        config.sloppy_lookup(SubspaceId::new(us.space(), next), op.point_next)
                    else {
                        debug!("no available host in the next subspace");
                        return;
                    };
                    dst = target;
                }
                Some(next) => {
                    error!(
                        "pending op with inconsistent chain coordinates: \
                         subspace {next} after {}",
                        us.subspace_index()
                    );
                    return;
                }
            }
        } else if op.subspace_prev == Some(us.subspace_index()) {
            // We took this over with CHAIN_SUBSPACE; relay it as such so the
            // rest of our chain applies the same handoff logic.
            let msg = message::pack_chain_subspace(header, version, key, &op.value, op.point_next);
            let Some(target) = config.chain_next(&us) else {
                return;
            };
            if self.comm.send(us, target, MsgType::ChainSubspace, msg) {
                op.sent = Some((target, config.instancefor(&target).unwrap_or_default()));
            }
            return;
        } else {
            let Some(target) = config.chain_next(&us) else {
                return;
            };
            dst = target;
        }

        let (msgtype, msg) = if op.has_value {
            (MsgType::ChainPut, message::pack_chain_put(header, version, op.fresh, key, &op.value))
        } else {
            (MsgType::ChainDel, message::pack_chain_del(header, version, key))
        };
        if self.comm.send(us, dst, msgtype, msg) {
            op.sent = Some((dst, config.instancefor(&dst).unwrap_or_default()));
        }
    }

    fn send_ack(&self, from: EntityId, to: EntityId, version: u64, key: &[u8]) -> bool {
        let msg = message::pack_chain_ack(self.comm.header_size(), version, key);
        self.comm.send(from, to, MsgType::ChainAck, msg)
    }

    fn respond_to_client(
        &self,
        us: EntityId,
        client: EntityId,
        nonce: u64,
        msgtype: MsgType,
        returncode: ReturnCode,
    ) {
        let msg = message::pack_client_response(self.comm.header_size(), nonce, returncode);
        self.comm.send(us, client, msgtype, msg);
    }

    /// The periodic thread body: retransmit until shutdown, or until a
    /// quiescing manager completes a pass with nothing left to process, at
    /// which point the coordinator is told exactly once and the thread ends.
    fn periodic(&self) {
        warn!("replication retransmission thread started");
        while !self.shutdown.load(Ordering::SeqCst) {
            let processed = self.retransmit();
            if self.quiescing() && processed == 0 {
                let state_id =
                    self.quiesce_state_id.lock().expect("quiesce state poisoned").clone();
                self.coordinator.quiesced(&state_id);
                info!("replication manager quiesced, periodic thread stopping");
                break;
            }
            std::thread::sleep(RETRANSMIT_INTERVAL);
        }
    }

    /// One pass over every keyholder: erase the drained, nudge the stuck.
    /// Returns the number of keyholders processed, which doubles as the
    /// quiesce progress measure.
    fn retransmit(&self) -> usize {
        let view = self.view();
        let mut processed = 0;
        for pair in self.keyholders.keys() {
            processed += 1;
            let _stripe = self.locks.lock(&pair.region, &pair.key);
            // Stale snapshot entries fail this re-lookup and are skipped.
            let Some(kh_arc) = self.keyholders.lookup(&pair.region, &pair.key) else {
                continue;
            };
            let mut kh = lock_keyholder(&kh_arc);

            if kh.empty() {
                drop(kh);
                self.keyholders.remove_if_same(&pair.region, &pair.key, &kh_arc);
                continue;
            }

            // Only the oldest committable op is retransmitted; hammering a
            // struggling host with the whole queue helps nobody.
            let Some((version, op)) = kh.oldest_committable_op_mut() else {
                continue;
            };
            let resend = match op.sent {
                None => true,
                Some((entity, instance)) => {
                    view.config.instancefor(&entity).unwrap_or_default() != instance
                }
            };
            if resend {
                op.sent = None;
                let Some(us) = view.config.entityfor(view.us, &pair.region) else {
                    continue;
                };
                self.send_message(&view, us, version, &pair.key, op);
            }
        }
        processed
    }
}

/// Locks a keyholder. Uncontended by construction: the stripe lock already
/// serializes everyone interested in this key.
fn lock_keyholder(kh: &Arc<Mutex<KeyHolder>>) -> MutexGuard<'_, KeyHolder> {
    kh.lock().expect("keyholder poisoned")
}

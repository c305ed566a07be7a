//! End-to-end chain replication scenarios: a miniature cluster of managers
//! wired together through the channel messenger, with messages pumped by the
//! test so that delivery order and loss are under test control.

use chainkv::config::{
    Attribute, Configuration, EntityId, Instance, PrefixHasher, RegionConfig, RegionId, Schema,
    SpaceConfig, SubspaceConfig, SubspaceId,
};
use chainkv::datatypes::{Action, DataType, MicroOp};
use chainkv::replication::message::{self, ClientResponse, ReturnCode};
use chainkv::replication::transport::{ChannelMessenger, Envelope};
use chainkv::replication::{Coordinator, MsgType, ReplicationManager, StateTransfers};
use chainkv::storage::{DataLayer, Memory};

use bytes::Bytes;
use serial_test::serial;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

const SPACE: u32 = 1;

struct NullTransfers;

impl StateTransfers for NullTransfers {
    fn add_trigger(&self, _region: &RegionId, _key: &Bytes, _version: u64) {}
}

#[derive(Default)]
struct RecordingCoordinator {
    quiesced: Mutex<Vec<String>>,
}

impl Coordinator for RecordingCoordinator {
    fn quiesced(&self, state_id: &str) {
        self.quiesced.lock().unwrap().push(state_id.into());
    }
}

struct Node {
    manager: Arc<ReplicationManager>,
    data: Arc<Memory>,
    coordinator: Arc<RecordingCoordinator>,
}

/// A process-local cluster: one node per instance, all sharing a messenger
/// whose traffic the test routes explicitly.
struct Cluster {
    config: Configuration,
    nodes: Vec<Node>,
    rx: crossbeam::channel::Receiver<Envelope>,
}

impl Cluster {
    /// Builds nodes for instances 1..=n and installs the configuration on
    /// each.
    fn new(config: Configuration, n: u64) -> Self {
        let (messenger, rx) = ChannelMessenger::new();
        let messenger = Arc::new(messenger);
        let nodes = (1..=n)
            .map(|id| {
                let data = Arc::new(Memory::new());
                let coordinator = Arc::new(RecordingCoordinator::default());
                let manager = ReplicationManager::new(
                    data.clone(),
                    messenger.clone(),
                    Arc::new(NullTransfers),
                    coordinator.clone(),
                );
                manager.reconfigure(config.clone(), Instance(id));
                Node { manager, data, coordinator }
            })
            .collect();
        Self { config, nodes, rx }
    }

    fn reconfigure(&mut self, config: Configuration) {
        for (index, node) in self.nodes.iter().enumerate() {
            node.manager.reconfigure(config.clone(), Instance(index as u64 + 1));
        }
        self.config = config;
    }

    fn node_for(&self, entity: &EntityId) -> &Node {
        let instance = self.config.instancefor(entity).expect("routable entity");
        &self.nodes[instance.0 as usize - 1]
    }

    /// Delivers messages until the wires are quiet, returning client
    /// responses in arrival order.
    fn pump(&self) -> Vec<ClientResponse> {
        let mut responses = Vec::new();
        while let Ok(envelope) = self.rx.try_recv() {
            self.route(envelope, &mut responses);
        }
        responses
    }

    fn route(&self, envelope: Envelope, responses: &mut Vec<ClientResponse>) {
        match envelope.msgtype {
            MsgType::RespAtomic => {
                let response =
                    message::decode_client_response(envelope.payload).expect("valid response");
                responses.push(response);
            }
            msgtype => {
                self.node_for(&envelope.to).manager.handle_message(
                    envelope.from,
                    envelope.to,
                    msgtype,
                    envelope.payload,
                );
            }
        }
    }

    /// Drains exactly the currently queued envelopes, without chasing any
    /// messages their delivery produces.
    fn drain_once(&self) -> Vec<Envelope> {
        self.rx.try_iter().collect()
    }
}

impl Drop for Cluster {
    fn drop(&mut self) {
        for node in &self.nodes {
            node.manager.shutdown();
        }
    }
}

fn schema() -> Schema {
    Schema::new(vec![
        Attribute::new("key", DataType::String),
        Attribute::new("color", DataType::String),
    ])
}

/// One space, one key subspace, one region, replicated across instances
/// 1..=chain_len.
fn chain_config(chain_len: u64) -> Configuration {
    let mut config = Configuration::new(1);
    config.add_space(SpaceConfig {
        id: SPACE,
        schema: schema(),
        subspaces: vec![SubspaceConfig {
            dims: vec![0],
            regions: vec![RegionConfig {
                prefix: 0,
                mask: 0,
                replicas: (1..=chain_len).map(Instance).collect(),
            }],
        }],
    });
    config
}

fn key_region() -> RegionId {
    RegionId::new(SPACE, 0, 0, 0)
}

fn client() -> EntityId {
    EntityId::new(RegionId::new(u32::MAX, 0, 0, 0), 0)
}

fn set_color(value: &[u8]) -> MicroOp {
    MicroOp {
        attr: 1,
        action: Action::Set,
        arg1: Bytes::copy_from_slice(value),
        arg1_datatype: DataType::String,
        arg2: Bytes::new(),
        arg2_datatype: DataType::String,
    }
}

fn client_put(cluster: &Cluster, to: EntityId, nonce: u64, key: &[u8], value: &[u8]) {
    cluster.node_for(&to).manager.client_atomic(
        MsgType::RespAtomic,
        client(),
        to,
        nonce,
        Bytes::copy_from_slice(key),
        Vec::new(),
        vec![set_color(value)],
        false,
        false,
    );
}

#[test]
fn s1_single_replica_put() {
    let cluster = Cluster::new(chain_config(1), 1);
    let head = EntityId::new(key_region(), 0);

    client_put(&cluster, head, 7, b"k", b"v1");
    let responses = cluster.pump();

    assert_eq!(responses, vec![ClientResponse { nonce: 7, returncode: ReturnCode::Success }]);
    let stored = cluster.nodes[0].data.get(&key_region(), b"k").unwrap().expect("committed");
    assert_eq!(stored.value, vec![Bytes::from_static(b"v1")]);
    assert_eq!(stored.version, 1);
}

#[test]
fn s2_fail_if_not_found_on_empty_key() {
    let cluster = Cluster::new(chain_config(1), 1);
    let head = EntityId::new(key_region(), 0);

    cluster.nodes[0].manager.client_atomic(
        MsgType::RespAtomic,
        client(),
        head,
        9,
        Bytes::from_static(b"k"),
        Vec::new(),
        vec![set_color(b"v")],
        false,
        true,
    );
    let responses = cluster.pump();

    assert_eq!(responses, vec![ClientResponse { nonce: 9, returncode: ReturnCode::NotFound }]);
    assert!(cluster.nodes[0].data.is_empty());
}

#[test]
fn three_replica_chain_commits_everywhere() {
    let cluster = Cluster::new(chain_config(3), 3);
    let head = EntityId::new(key_region(), 0);

    client_put(&cluster, head, 1, b"k", b"v1");
    let responses = cluster.pump();

    assert_eq!(responses, vec![ClientResponse { nonce: 1, returncode: ReturnCode::Success }]);
    for node in &cluster.nodes {
        let stored = node.data.get(&key_region(), b"k").unwrap().expect("committed");
        assert_eq!(stored.value, vec![Bytes::from_static(b"v1")]);
        assert_eq!(stored.version, 1);
    }
}

#[test]
fn s4_out_of_order_chain_messages() {
    let cluster = Cluster::new(chain_config(3), 3);
    let head = EntityId::new(key_region(), 0);
    let middle = EntityId::new(key_region(), 1);

    // The middle replica already has version 3 on disk.
    cluster.nodes[1]
        .data
        .put(&key_region(), b"k", &[Bytes::from_static(b"v3")], 3)
        .unwrap();

    // Version 5 arrives before version 4: it parks, and nothing is sent.
    cluster.nodes[1].manager.chain_put(
        head,
        middle,
        5,
        false,
        Bytes::from_static(b"k"),
        vec![Bytes::from_static(b"v5")],
    );
    assert!(cluster.drain_once().is_empty());

    // Version 4 arrives: both promote, and forward in version order.
    cluster.nodes[1].manager.chain_put(
        head,
        middle,
        4,
        false,
        Bytes::from_static(b"k"),
        vec![Bytes::from_static(b"v4")],
    );
    let forwarded = cluster.drain_once();
    let versions: Vec<u64> = forwarded
        .iter()
        .map(|envelope| {
            assert_eq!(envelope.msgtype, MsgType::ChainPut);
            assert_eq!(envelope.to, EntityId::new(key_region(), 2));
            message::decode_chain_put(envelope.payload.clone()).unwrap().version
        })
        .collect();
    assert_eq!(versions, vec![4, 5]);
}

#[test]
fn duplicate_chain_put_is_reacked_without_state_change() {
    let cluster = Cluster::new(chain_config(2), 2);
    let head = EntityId::new(key_region(), 0);
    let tail = EntityId::new(key_region(), 1);

    client_put(&cluster, head, 1, b"k", b"v1");
    let responses = cluster.pump();
    assert_eq!(responses.len(), 1);
    let stored = cluster.nodes[1].data.get(&key_region(), b"k").unwrap().expect("committed");
    assert_eq!(stored.version, 1);

    // The head retransmits version 1; the tail re-acks and nothing changes.
    cluster.nodes[1].manager.chain_put(
        head,
        tail,
        1,
        true,
        Bytes::from_static(b"k"),
        vec![Bytes::from_static(b"v1")],
    );
    let resent = cluster.drain_once();
    assert!(resent.iter().all(|envelope| envelope.msgtype == MsgType::ChainAck));
    assert!(!resent.is_empty());
    let stored = cluster.nodes[1].data.get(&key_region(), b"k").unwrap().expect("committed");
    assert_eq!(stored.version, 1);
}

/// A two-subspace space whose second subspace hashes the color attribute
/// into two half-ring regions: instance 2 hosts the low half, instance 3 the
/// high half. Instance 1 hosts the whole key subspace.
fn two_subspace_config() -> Configuration {
    let mut config = Configuration::new(1);
    config.add_space(SpaceConfig {
        id: SPACE,
        schema: schema(),
        subspaces: vec![
            SubspaceConfig {
                dims: vec![0],
                regions: vec![RegionConfig { prefix: 0, mask: 0, replicas: vec![Instance(1)] }],
            },
            SubspaceConfig {
                dims: vec![1],
                regions: vec![
                    RegionConfig { prefix: 1, mask: 0, replicas: vec![Instance(2)] },
                    RegionConfig { prefix: 1, mask: 1 << 63, replicas: vec![Instance(3)] },
                ],
            },
        ],
    });
    config
}

/// Finds a color whose subspace-1 hash lands in the given half of the ring.
fn color_in_half(high: bool) -> Vec<u8> {
    let hasher = PrefixHasher::new(SubspaceId::new(SPACE, 1), vec![1]);
    for i in 0u32.. {
        let candidate = format!("color-{i}").into_bytes();
        let point = hasher.hash(b"k", &[Bytes::from(candidate.clone())]).point;
        if (point >> 63 == 1) == high {
            return candidate;
        }
    }
    unreachable!();
}

#[test]
fn s5_cross_subspace_transition() {
    let cluster = Cluster::new(two_subspace_config(), 3);
    let head = EntityId::new(key_region(), 0);
    let low_region = RegionId::new(SPACE, 1, 1, 0);
    let high_region = RegionId::new(SPACE, 1, 1, 1 << 63);

    let low_color = color_in_half(false);
    let high_color = color_in_half(true);

    // Create with a color hashing into the low half: the value chain runs
    // through instance 2.
    client_put(&cluster, head, 1, b"k", &low_color);
    let responses = cluster.pump();
    assert_eq!(responses, vec![ClientResponse { nonce: 1, returncode: ReturnCode::Success }]);
    let stored = cluster.nodes[1].data.get(&low_region, b"k").unwrap().expect("committed low");
    assert_eq!(stored.value, vec![Bytes::copy_from_slice(&low_color)]);
    assert!(cluster.nodes[2].data.is_empty());

    // Update to a color hashing into the high half: the old region hands the
    // key off with CHAIN_SUBSPACE and deletes its copy.
    client_put(&cluster, head, 2, b"k", &high_color);

    // The handoff is observable on the wire before we let it proceed.
    let mut responses = Vec::new();
    let mut saw_subspace_handoff = false;
    let mut queue: Vec<Envelope> = cluster.drain_once();
    while !queue.is_empty() {
        for envelope in queue {
            if envelope.msgtype == MsgType::ChainSubspace {
                assert_eq!(envelope.to, EntityId::new(high_region, 0));
                let decoded = message::decode_chain_subspace(envelope.payload.clone()).unwrap();
                assert_eq!(decoded.version, 2);
                saw_subspace_handoff = true;
            }
            cluster.route(envelope, &mut responses);
        }
        queue = cluster.drain_once();
    }
    assert!(saw_subspace_handoff);
    assert_eq!(responses, vec![ClientResponse { nonce: 2, returncode: ReturnCode::Success }]);

    // The key now lives in the high region, and only there.
    let stored = cluster.nodes[2].data.get(&high_region, b"k").unwrap().expect("committed high");
    assert_eq!(stored.value, vec![Bytes::copy_from_slice(&high_color)]);
    assert_eq!(stored.version, 2);
    assert!(cluster.nodes[1].data.get(&low_region, b"k").unwrap().is_none());
}

#[test]
#[serial]
fn s6_quiesce_drains_and_notifies_once() {
    let mut cluster = Cluster::new(chain_config(2), 2);
    let head = EntityId::new(key_region(), 0);

    // Two keys with their chain ops still in flight (nothing delivered yet).
    client_put(&cluster, head, 1, b"a", b"v1");
    client_put(&cluster, head, 2, b"b", b"v1");

    let mut config = chain_config(2);
    config.set_quiesce("epoch-3");
    cluster.reconfigure(config);

    // New writes are refused while quiescing.
    client_put(&cluster, head, 3, b"c", b"v1");

    // Let the in-flight chain work drain; the periodic threads keep nudging,
    // the test keeps delivering. Each node must report quiesced exactly once.
    let deadline = Instant::now() + Duration::from_secs(10);
    let mut responses = Vec::new();
    loop {
        responses.extend(cluster.pump());
        let reports: Vec<usize> =
            cluster.nodes.iter().map(|n| n.coordinator.quiesced.lock().unwrap().len()).collect();
        if reports.iter().all(|&n| n == 1) {
            break;
        }
        assert!(Instant::now() < deadline, "cluster never quiesced: {reports:?}");
        std::thread::sleep(Duration::from_millis(20));
    }

    // The refused write answered READONLY; the drained writes succeeded.
    assert!(responses
        .contains(&ClientResponse { nonce: 3, returncode: ReturnCode::ReadOnly }));
    assert!(responses
        .contains(&ClientResponse { nonce: 1, returncode: ReturnCode::Success }));
    assert!(responses
        .contains(&ClientResponse { nonce: 2, returncode: ReturnCode::Success }));

    for node in &cluster.nodes {
        assert_eq!(node.coordinator.quiesced.lock().unwrap().as_slice(), &["epoch-3".to_string()]);
    }
    // No second report arrives.
    std::thread::sleep(Duration::from_millis(600));
    for node in &cluster.nodes {
        assert_eq!(node.coordinator.quiesced.lock().unwrap().len(), 1);
    }
}

#[test]
fn empty_and_single_byte_keys_replicate() {
    let cluster = Cluster::new(chain_config(2), 2);
    let head = EntityId::new(key_region(), 0);

    for (nonce, key) in [(1u64, &b""[..]), (2, b"x")] {
        client_put(&cluster, head, nonce, key, b"v");
        let responses = cluster.pump();
        assert_eq!(responses, vec![ClientResponse { nonce, returncode: ReturnCode::Success }]);
        let stored = cluster.nodes[1].data.get(&key_region(), key).unwrap().expect("committed");
        assert_eq!(stored.version, 1);
    }
}

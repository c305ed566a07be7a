//! Cluster identity and configuration.
//!
//! A space is a user table, sharded along one or more subspaces: independent
//! projections of the value dimensions, each with its own 64-bit hash space.
//! A region is a prefix-defined slice of one subspace's hash space, and is
//! replicated along a chain of entities. The coordinator assigns each entity
//! to an instance (a daemon process); the Configuration is the local,
//! immutable snapshot of those assignments that every replication decision
//! consults. Reconfiguration installs a whole new snapshot.

use crate::datatypes::{validate_as_type, DataType};

use bytes::Bytes;
use serde_derive::{Deserialize, Serialize};
use std::collections::HashMap;
use xxhash_rust::xxh3::xxh3_64_with_seed;

/// A space identifier, naming one user table.
pub type SpaceId = u32;

/// A subspace identifier: one value-dimension projection of a space.
/// Subspace 0 is the key subspace.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
pub struct SubspaceId {
    pub space: SpaceId,
    pub subspace: u16,
}

impl SubspaceId {
    pub fn new(space: SpaceId, subspace: u16) -> Self {
        Self { space, subspace }
    }
}

/// A hashed location in a subspace's hash space. Only the topmost `bits` bits
/// of `point` are meaningful.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Coordinate {
    pub bits: u8,
    pub point: u64,
}

impl Coordinate {
    /// A fully-specified coordinate.
    pub fn full(point: u64) -> Self {
        Self { bits: 64, point }
    }
}

/// A region identifier: the slice of a subspace's hash space whose points
/// share the topmost `prefix` bits of `mask`.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct RegionId {
    pub subspace: SubspaceId,
    pub prefix: u8,
    pub mask: u64,
}

impl RegionId {
    pub fn new(space: SpaceId, subspace: u16, prefix: u8, mask: u64) -> Self {
        Self { subspace: SubspaceId::new(space, subspace), prefix, mask }
    }

    pub fn space(&self) -> SpaceId {
        self.subspace.space
    }

    /// The subspace index within the space.
    pub fn subspace_index(&self) -> u16 {
        self.subspace.subspace
    }

    /// Prefix test: does this region contain the coordinate?
    pub fn contains(&self, coord: Coordinate) -> bool {
        if self.prefix > coord.bits {
            return false;
        }
        if self.prefix == 0 {
            return true;
        }
        (self.mask ^ coord.point) >> (64 - self.prefix as u32) == 0
    }

    /// A stable 64-bit hash of the region identity, used to seed per-key
    /// stripe selection.
    pub fn hash(&self) -> u64 {
        let mut buf = [0u8; 17];
        buf[0..4].copy_from_slice(&self.subspace.space.to_le_bytes());
        buf[4..6].copy_from_slice(&self.subspace.subspace.to_le_bytes());
        buf[6] = self.prefix;
        buf[7..15].copy_from_slice(&self.mask.to_le_bytes());
        xxh3_64_with_seed(&buf, 0)
    }
}

/// An entity identifier: one replica position on a region's chain. Position 0
/// is the chain head.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct EntityId {
    pub region: RegionId,
    pub number: u8,
}

impl EntityId {
    pub fn new(region: RegionId, number: u8) -> Self {
        Self { region, number }
    }

    pub fn space(&self) -> SpaceId {
        self.region.space()
    }

    pub fn subspace(&self) -> SubspaceId {
        self.region.subspace
    }

    pub fn subspace_index(&self) -> u16 {
        self.region.subspace_index()
    }
}

/// An instance identifier, naming one daemon process. The coordinator assigns
/// a fresh id when a process (re)starts, so a changed instance under an
/// unchanged entity means the replica was replaced.
#[derive(Clone, Copy, Debug, Default, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct Instance(pub u64);

/// A schema attribute. Attribute 0 is the key.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Attribute {
    pub name: String,
    pub datatype: DataType,
}

impl Attribute {
    pub fn new(name: &str, datatype: DataType) -> Self {
        Self { name: name.into(), datatype }
    }
}

/// A space schema: the key attribute followed by the value attributes.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Schema {
    pub attrs: Vec<Attribute>,
}

impl Schema {
    pub fn new(attrs: Vec<Attribute>) -> Self {
        assert!(!attrs.is_empty(), "schema must have a key attribute");
        Self { attrs }
    }

    /// The number of attributes, key included.
    pub fn arity(&self) -> usize {
        self.attrs.len()
    }

    /// Validates a key against the key attribute's type.
    pub fn validate_key(&self, key: &[u8]) -> bool {
        validate_as_type(key, self.attrs[0].datatype)
    }

    /// Checks that a value vector matches the non-key attribute count.
    pub fn matches_value_arity(&self, value: &[Bytes]) -> bool {
        value.len() + 1 == self.attrs.len()
    }
}

/// Hashes a key and value vector to a coordinate in one subspace's hash
/// space. Each subspace hashes its own dimension subset: dimension 0 is the
/// key, dimension i > 0 is value attribute i - 1. Hashing different value
/// dimensions per subspace is what makes chains value-dependent.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PrefixHasher {
    seed: u64,
    dims: Vec<usize>,
}

impl PrefixHasher {
    pub fn new(subspace: SubspaceId, dims: Vec<usize>) -> Self {
        assert!(!dims.is_empty(), "a subspace must hash at least one dimension");
        let seed = ((subspace.space as u64) << 16) | subspace.subspace as u64;
        Self { seed, dims }
    }

    /// Hashes the selected dimensions to a full 64-bit coordinate. Each
    /// dimension is length-framed so that attribute boundaries matter.
    pub fn hash(&self, key: &[u8], value: &[Bytes]) -> Coordinate {
        let mut buf = Vec::new();
        for &dim in &self.dims {
            let attr: &[u8] = match dim {
                0 => key,
                i => value.get(i - 1).map(|b| b.as_ref()).unwrap_or(&[]),
            };
            buf.extend_from_slice(&(attr.len() as u32).to_le_bytes());
            buf.extend_from_slice(attr);
        }
        Coordinate::full(xxh3_64_with_seed(&buf, self.seed))
    }
}

/// One subspace of a space: the value dimensions it hashes and the regions
/// its hash space is carved into.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SubspaceConfig {
    /// Hashed dimensions: 0 is the key, i > 0 is value attribute i - 1.
    pub dims: Vec<usize>,
    pub regions: Vec<RegionConfig>,
}

/// One region of a subspace and its replica chain, in chain order.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RegionConfig {
    pub prefix: u8,
    pub mask: u64,
    pub replicas: Vec<Instance>,
}

/// One space: schema plus subspace layout. Subspace 0 must hash the key.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SpaceConfig {
    pub id: SpaceId,
    pub schema: Schema,
    pub subspaces: Vec<SubspaceConfig>,
}

/// A cluster configuration snapshot: the schema and chain layout of every
/// space, plus the coordinator's quiesce directive. Configurations are
/// immutable; reconfiguration swaps in a whole new one.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Configuration {
    pub version: u64,
    spaces: HashMap<SpaceId, SpaceConfig>,
    quiesce: bool,
    quiesce_state_id: String,
}

impl Configuration {
    pub fn new(version: u64) -> Self {
        Self { version, ..Self::default() }
    }

    pub fn add_space(&mut self, space: SpaceConfig) {
        assert!(!space.subspaces.is_empty(), "space must have a subspace");
        assert_eq!(space.subspaces[0].dims, vec![0], "subspace 0 must hash the key");
        self.spaces.insert(space.id, space);
    }

    /// Directs the cluster to quiesce, draining in-flight replication.
    pub fn set_quiesce(&mut self, state_id: &str) {
        self.quiesce = true;
        self.quiesce_state_id = state_id.into();
    }

    pub fn quiesce(&self) -> bool {
        self.quiesce
    }

    pub fn quiesce_state_id(&self) -> &str {
        &self.quiesce_state_id
    }

    pub fn get_schema(&self, space: SpaceId) -> Option<&Schema> {
        self.spaces.get(&space).map(|s| &s.schema)
    }

    /// The number of subspaces in a space.
    pub fn subspaces(&self, space: SpaceId) -> Option<usize> {
        self.spaces.get(&space).map(|s| s.subspaces.len())
    }

    /// The hasher for one subspace's hash space.
    pub fn repl_hasher(&self, subspace: SubspaceId) -> Option<PrefixHasher> {
        let sub = self.subspace_config(subspace)?;
        Some(PrefixHasher::new(subspace, sub.dims.clone()))
    }

    fn subspace_config(&self, subspace: SubspaceId) -> Option<&SubspaceConfig> {
        self.spaces.get(&subspace.space)?.subspaces.get(subspace.subspace as usize)
    }

    fn region_config(&self, region: &RegionId) -> Option<&RegionConfig> {
        self.subspace_config(region.subspace)?
            .regions
            .iter()
            .find(|r| r.prefix == region.prefix && r.mask == region.mask)
    }

    /// Whether the entity exists in this configuration.
    pub fn has_entity(&self, e: &EntityId) -> bool {
        self.instancefor(e).is_some()
    }

    /// The instance hosting an entity, if the entity exists.
    pub fn instancefor(&self, e: &EntityId) -> Option<Instance> {
        self.region_config(&e.region)?.replicas.get(e.number as usize).copied()
    }

    /// The entity an instance holds in a region, if any.
    pub fn entityfor(&self, us: Instance, region: &RegionId) -> Option<EntityId> {
        let rc = self.region_config(region)?;
        let number = rc.replicas.iter().position(|i| *i == us)?;
        Some(EntityId::new(*region, number as u8))
    }

    /// Whether an instance holds a replica of the region.
    pub fn in_region(&self, us: Instance, region: &RegionId) -> bool {
        self.entityfor(us, region).is_some()
    }

    /// The point-leader test: only the head of a key-subspace chain accepts
    /// client mutations for its keys.
    pub fn is_point_leader(&self, e: &EntityId) -> bool {
        e.region.subspace_index() == 0 && e.number == 0 && self.has_entity(e)
    }

    /// Whether the entity is the head of its region's chain.
    pub fn is_head(&self, e: &EntityId) -> bool {
        e.number == 0 && self.has_entity(e)
    }

    /// Whether the entity is the tail of its region's chain.
    pub fn is_tail(&self, e: &EntityId) -> bool {
        match self.region_config(&e.region) {
            Some(rc) => e.number as usize + 1 == rc.replicas.len(),
            None => false,
        }
    }

    /// Whether `b` immediately follows `a` on the same chain.
    pub fn chain_adjacent(&self, a: &EntityId, b: &EntityId) -> bool {
        a.region == b.region && a.number + 1 == b.number && self.has_entity(b)
    }

    /// The next entity along the chain.
    pub fn chain_next(&self, e: &EntityId) -> Option<EntityId> {
        let next = EntityId::new(e.region, e.number + 1);
        self.has_entity(&next).then_some(next)
    }

    /// Maps a hash point to the best-available entity in a subspace: the head
    /// of the region containing the point. Tolerant of chain holes by
    /// construction, since it never names a specific chain position beyond
    /// the head.
    pub fn sloppy_lookup(&self, subspace: SubspaceId, point: u64) -> Option<EntityId> {
        let sub = self.subspace_config(subspace)?;
        let coord = Coordinate::full(point);
        sub.regions
            .iter()
            .find(|r| {
                RegionId { subspace, prefix: r.prefix, mask: r.mask }.contains(coord)
                    && !r.replicas.is_empty()
            })
            .map(|r| EntityId::new(RegionId { subspace, prefix: r.prefix, mask: r.mask }, 0))
    }
}

//! The data layer: local durable storage for replicated objects, keyed by
//! (region, key). Replication only consumes the [`DataLayer`] trait; the
//! in-memory [`Memory`] engine backs tests and single-process use. For
//! details, see the [`memory`] module documentation.

pub mod memory;

pub use memory::Memory;

use crate::config::RegionId;

use bytes::Bytes;

/// An opaque reference pinning a disk-resident value's backing storage while
/// an in-flight operation still reads it. The in-memory engine has nothing to
/// pin, so the default reference is always valid.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct Reference(pub u64);

/// A data layer fault. Key absence is not a fault; reads yield Option.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DiskError {
    /// The shard backing the region is not mounted here.
    MissingDisk,
    /// The stored or submitted value does not match the region's schema.
    WrongArity,
    /// The write could not be made durable.
    SyncFailed,
}

impl std::fmt::Display for DiskError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.write_str(match self {
            Self::MissingDisk => "missing disk",
            Self::WrongArity => "wrong arity",
            Self::SyncFailed => "sync failed",
        })
    }
}

/// A data layer result.
pub type DiskResult<T> = std::result::Result<T, DiskError>;

/// A stored object: the attribute vector and the version that produced it.
#[derive(Clone, Debug, PartialEq)]
pub struct StoredObject {
    pub value: Vec<Bytes>,
    pub version: u64,
    pub reference: Reference,
}

/// Local durable storage, sharded by region. Implementations must be safe for
/// concurrent use; replication serializes per key but not across keys.
pub trait DataLayer: Send + Sync {
    /// Reads the latest stored object for a key, or None if absent.
    fn get(&self, region: &RegionId, key: &[u8]) -> DiskResult<Option<StoredObject>>;

    /// Stores an object at a version, replacing any previous version.
    fn put(&self, region: &RegionId, key: &[u8], value: &[Bytes], version: u64) -> DiskResult<()>;

    /// Removes a key. Removing an absent key is a no-op.
    fn del(&self, region: &RegionId, key: &[u8]) -> DiskResult<()>;
}

//! An in-memory data layer using the Rust standard library B-tree
//! implementation. Data is not persisted; it exists for tests and
//! single-process clusters. Records are bincode-encoded under a composite
//! (region, key) key so that the same key bytes can live independently in
//! several regions, as they do during cross-subspace transfers.

use super::{DataLayer, DiskError, DiskResult, Reference, StoredObject};
use crate::config::RegionId;

use bincode::Options as _;
use bytes::Bytes;
use serde_derive::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Mutex;

/// Bincode options for record and record-key encoding: DefaultOptions, i.e.
/// variable-length integers (upstream bincode::(de)serialize confusingly
/// defaults to fixed-length).
fn bincode() -> bincode::DefaultOptions {
    bincode::DefaultOptions::new()
}

/// A stored record. Attribute bytes are owned; Bytes views are rebuilt on
/// read.
#[derive(Serialize, Deserialize)]
struct Record {
    value: Vec<Vec<u8>>,
    version: u64,
}

/// An in-memory DataLayer.
#[derive(Default)]
pub struct Memory {
    data: Mutex<BTreeMap<Vec<u8>, Vec<u8>>>,
}

impl Memory {
    pub fn new() -> Self {
        Self::default()
    }

    fn record_key(region: &RegionId, key: &[u8]) -> Vec<u8> {
        // Bincode length-frames the key bytes, so (region, key) pairs cannot
        // collide across regions.
        bincode().serialize(&(region, key)).expect("region keys are encodable")
    }

    /// The number of stored objects, for tests.
    pub fn len(&self) -> usize {
        self.data.lock().expect("lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl DataLayer for Memory {
    fn get(&self, region: &RegionId, key: &[u8]) -> DiskResult<Option<StoredObject>> {
        let data = self.data.lock().expect("lock poisoned");
        let Some(encoded) = data.get(&Self::record_key(region, key)) else {
            return Ok(None);
        };
        let record: Record = bincode().deserialize(encoded).map_err(|_| DiskError::WrongArity)?;
        Ok(Some(StoredObject {
            value: record.value.into_iter().map(Bytes::from).collect(),
            version: record.version,
            reference: Reference::default(),
        }))
    }

    fn put(&self, region: &RegionId, key: &[u8], value: &[Bytes], version: u64) -> DiskResult<()> {
        let record =
            Record { value: value.iter().map(|attr| attr.to_vec()).collect(), version };
        let encoded = bincode().serialize(&record).map_err(|_| DiskError::SyncFailed)?;
        let mut data = self.data.lock().expect("lock poisoned");
        data.insert(Self::record_key(region, key), encoded);
        Ok(())
    }

    fn del(&self, region: &RegionId, key: &[u8]) -> DiskResult<()> {
        let mut data = self.data.lock().expect("lock poisoned");
        data.remove(&Self::record_key(region, key));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn region(subspace: u16, prefix: u8, mask: u64) -> RegionId {
        RegionId::new(1, subspace, prefix, mask)
    }

    #[test]
    fn point_ops() -> DiskResult<()> {
        let data = Memory::new();
        let r = region(0, 0, 0);

        // Getting a missing key returns None.
        assert_eq!(data.get(&r, b"a")?, None);

        // Putting and getting a key returns its value and version.
        let value = vec![Bytes::from_static(b"v1"), Bytes::from_static(b"v2")];
        data.put(&r, b"a", &value, 3)?;
        let stored = data.get(&r, b"a")?.expect("stored");
        assert_eq!(stored.value, value);
        assert_eq!(stored.version, 3);

        // Deleting removes it; deleting again is a no-op.
        data.del(&r, b"a")?;
        assert_eq!(data.get(&r, b"a")?, None);
        data.del(&r, b"a")?;
        Ok(())
    }

    #[test]
    fn regions_are_independent() -> DiskResult<()> {
        let data = Memory::new();
        let source = region(0, 1, 0);
        let target = region(1, 1, 1 << 63);

        data.put(&source, b"k", &[Bytes::from_static(b"old")], 1)?;
        data.put(&target, b"k", &[Bytes::from_static(b"new")], 2)?;
        assert_eq!(data.get(&source, b"k")?.expect("stored").version, 1);
        assert_eq!(data.get(&target, b"k")?.expect("stored").version, 2);

        data.del(&source, b"k")?;
        assert!(data.get(&source, b"k")?.is_none());
        assert!(data.get(&target, b"k")?.is_some());
        Ok(())
    }

    #[test]
    fn empty_keys_and_values_are_stored() -> DiskResult<()> {
        let data = Memory::new();
        let r = region(0, 0, 0);
        data.put(&r, b"", &[Bytes::new()], 1)?;
        let stored = data.get(&r, b"")?.expect("stored");
        assert_eq!(stored.value, vec![Bytes::new()]);
        Ok(())
    }
}

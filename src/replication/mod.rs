//! Per-key chain replication.
//!
//! Writes to a key propagate along a value-dependent chain: the ordered
//! replicas of the key's region in each subspace, visited subspace by
//! subspace. The point-leader (head of the key-subspace chain) orders client
//! mutations, every replica integrates chain traffic through a per-key
//! state machine (the keyholder), and acknowledgments flow tail-to-head back
//! to the client. See the [`manager`] module for the protocol itself.
//!
//! - keyholder: the per-key deferred/blocked/committable queues.
//! - table: striped per-key locks and the concurrent keyholder table.
//! - message: chain message payloads and client return codes.
//! - transport: the Messenger seam and a channel transport.
//! - manager: the replication manager.

pub mod keyholder;
pub mod manager;
pub mod message;
pub mod table;
pub mod transport;

pub use manager::ReplicationManager;
pub use message::{MsgType, ReturnCode};
pub use transport::Messenger;

use crate::config::RegionId;

use bytes::Bytes;
use std::time::Duration;

/// The number of stripes in the per-key lock table. Must be a power of two.
pub const LOCK_STRIPING: usize = 1024;

/// The initial capacity of the keyholder table.
pub const REPLICATION_HASHTABLE_SIZE: usize = 16384;

/// How often the periodic task scans for stuck or finished keyholders.
pub const RETRANSMIT_INTERVAL: Duration = Duration::from_millis(250);

/// The coordinator link. Replication only reports quiescence; everything else
/// the coordinator knows arrives back as a new Configuration.
pub trait Coordinator: Send + Sync {
    /// Reports that replication has fully drained under the given quiesce
    /// state id.
    fn quiesced(&self, state_id: &str);
}

/// The state-transfer subsystem. Replication notifies it whenever a version
/// becomes stable for a key so that in-progress region transfers can ship it.
pub trait StateTransfers: Send + Sync {
    fn add_trigger(&self, region: &RegionId, key: &Bytes, version: u64);
}

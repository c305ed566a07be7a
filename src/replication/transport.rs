//! The transport seam between replication and the network.
//!
//! The manager never opens sockets; it hands framed buffers to a
//! [`Messenger`]. Sends are best-effort: a false return or a silently lost
//! message is recovered by the periodic retransmission pass, never by the
//! caller blocking.

use super::message::MsgType;
use crate::config::EntityId;

use bytes::Bytes;
use crossbeam::channel::{Receiver, Sender};

/// A wire transport for chain messages and client responses.
pub trait Messenger: Send + Sync {
    /// Sends a message buffer from one entity to another. The buffer's first
    /// `header_size()` bytes are reserved for the transport's framing.
    /// Returns false if the destination is unreachable.
    fn send(&self, from: EntityId, to: EntityId, msgtype: MsgType, msg: Bytes) -> bool;

    /// The number of bytes senders must reserve at the front of every
    /// message for framing.
    fn header_size(&self) -> usize;
}

/// A message in flight through the channel transport, header stripped.
#[derive(Clone, Debug)]
pub struct Envelope {
    pub from: EntityId,
    pub to: EntityId,
    pub msgtype: MsgType,
    pub payload: Bytes,
}

/// A process-local messenger that delivers every send onto an unbounded
/// crossbeam channel. Tests and single-process clusters pump the receiver
/// and dispatch each envelope to the destination entity's manager.
pub struct ChannelMessenger {
    tx: Sender<Envelope>,
    header_size: usize,
}

impl ChannelMessenger {
    /// Creates a messenger and the receiver its sends drain into.
    pub fn new() -> (Self, Receiver<Envelope>) {
        Self::with_header_size(0)
    }

    /// Creates a messenger that reserves a framing header, exercising the
    /// same offsets a real transport would.
    pub fn with_header_size(header_size: usize) -> (Self, Receiver<Envelope>) {
        let (tx, rx) = crossbeam::channel::unbounded();
        (Self { tx, header_size }, rx)
    }
}

impl Messenger for ChannelMessenger {
    fn send(&self, from: EntityId, to: EntityId, msgtype: MsgType, msg: Bytes) -> bool {
        // In-process delivery consumes its own framing.
        let payload = msg.slice(self.header_size.min(msg.len())..);
        self.tx.send(Envelope { from, to, msgtype, payload }).is_ok()
    }

    fn header_size(&self) -> usize {
        self.header_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RegionId;

    fn entity(number: u8) -> EntityId {
        EntityId::new(RegionId::new(1, 0, 0, 0), number)
    }

    #[test]
    fn delivers_envelopes_in_order() {
        let (messenger, rx) = ChannelMessenger::new();
        assert!(messenger.send(entity(0), entity(1), MsgType::ChainPut, Bytes::from_static(b"a")));
        assert!(messenger.send(entity(1), entity(2), MsgType::ChainAck, Bytes::from_static(b"b")));

        let first = rx.recv().unwrap();
        assert_eq!(first.msgtype, MsgType::ChainPut);
        assert_eq!(first.payload, Bytes::from_static(b"a"));
        let second = rx.recv().unwrap();
        assert_eq!(second.to, entity(2));
        assert_eq!(second.payload, Bytes::from_static(b"b"));
    }

    #[test]
    fn strips_reserved_header() {
        let (messenger, rx) = ChannelMessenger::with_header_size(4);
        assert_eq!(messenger.header_size(), 4);
        messenger.send(entity(0), entity(1), MsgType::ChainDel, Bytes::from_static(b"\0\0\0\0xy"));
        assert_eq!(rx.recv().unwrap().payload, Bytes::from_static(b"xy"));
    }

    #[test]
    fn send_fails_once_receiver_is_gone() {
        let (messenger, rx) = ChannelMessenger::new();
        drop(rx);
        assert!(!messenger.send(entity(0), entity(1), MsgType::ChainAck, Bytes::new()));
    }
}

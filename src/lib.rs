//! Group replication of a live media stream over a mesh of peers.
//!
//! The engine takes a stream of media packets on the publishing side, cuts
//! them into identified fragments and disseminates every fragment, in order,
//! to every peer of the mesh with a hybrid push/pull protocol:
//!
//! * *push*: each fragment id maps to one of eight single-bit masks, and
//!   peers negotiate which masks they push to each other, so a subscriber
//!   receives a full stream from up to eight pushers without duplication
//! * *pull*: peers gossip bitmaps of the fragment ids they hold, and a
//!   subscriber explicitly requests the ids the pushers did not deliver
//!
//! The engine sits *above* the datagram layer: it writes control and media
//! messages through [`flow::FlowWriter`]s which implement acknowledged,
//! selectively-retransmitted delivery over an abstract [`flow::Band`]
//! (one outbound packet assembler per peer connection, with a per-packet
//! write budget). NAT traversal, handshakes and cryptographic framing are
//! the embedding session's business.

pub mod flow;
pub mod group;
pub mod util;
pub mod wire;

#[cfg(test)]
pub mod test_util;

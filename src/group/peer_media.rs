use bytes::{Buf, Bytes, BytesMut};
use rustc_hash::FxHashSet;
use tracing::{debug, error, trace};

use crate::flow::{Band, FlowWriter};
use crate::group::config::GroupMediaConfig;
use crate::group::fragments_map::FragmentsMap;
use crate::group::PeerId;

/// Writer id of the media-report flow (control traffic). Kept at 2 so its
/// header stays below the flow-id-trailer threshold.
const REPORT_WRITER_ID: u64 = 2;
/// Writer id of the media flow (payload fragments), created lazily.
const MEDIA_WRITER_ID: u64 = 3;

/// Flow signature tag of the media-report flow.
const REPORT_SIGNATURE: [u8; 4] = [0x00, 0x47, 0x52, 0x1c];
/// Flow signature prefix of the media flow; the stream key follows.
const MEDIA_SIGNATURE_PREFIX: [u8; 4] = [0x00, 0x47, 0x52, 0x11];

/// One peer's state relative to one [`crate::group::GroupMedia`].
///
/// Owns the peer's outbound band and the two flow writers on it: the media
/// report writer for control (subscription, fragments maps, push modes,
/// pulls) and the lazily-created media writer for payload fragments.
pub struct PeerMedia {
    peer_id: PeerId,
    band: Box<dyn Band>,
    report_writer: FlowWriter,
    media_writer: Option<FlowWriter>,
    media_signature: Bytes,

    /// masks we asked this peer to push to us
    pub push_in_mode: u8,
    /// masks this peer asked us to push to it
    push_out_mode: u8,

    fragments_map: FragmentsMap,
    pull_blacklist: FxHashSet<u64>,
    /// last fragment id we announced to this peer
    id_fragments_map_out: u64,
    /// media subscription already sent
    pub group_media_sent: bool,
}

impl PeerMedia {
    pub fn new(peer_id: PeerId, band: Box<dyn Band>, stream_key: &[u8]) -> PeerMedia {
        let mut media_signature = BytesMut::with_capacity(MEDIA_SIGNATURE_PREFIX.len() + stream_key.len());
        media_signature.extend_from_slice(&MEDIA_SIGNATURE_PREFIX);
        media_signature.extend_from_slice(stream_key);

        PeerMedia {
            peer_id,
            band,
            report_writer: FlowWriter::new(
                REPORT_WRITER_ID,
                Bytes::copy_from_slice(&REPORT_SIGNATURE),
                0,
            ),
            media_writer: None,
            media_signature: media_signature.freeze(),
            push_in_mode: 0,
            push_out_mode: 0,
            fragments_map: FragmentsMap::new(),
            pull_blacklist: FxHashSet::default(),
            id_fragments_map_out: 0,
            group_media_sent: false,
        }
    }

    pub fn peer_id(&self) -> &PeerId {
        &self.peer_id
    }

    fn is_pushable(&self, rest: u8) -> bool {
        self.push_out_mode & (1 << rest) != 0
    }

    /// The peer asked us to push this mask set to it.
    pub fn set_push_out_mode(&mut self, mode: u8) {
        self.push_out_mode = mode;
    }

    /// Send one serialized fragment. Push sends are gated by the peer's
    /// outbound push mask; pull answers always go out. Returns whether the
    /// fragment was enqueued.
    pub fn send_media(&mut self, data: &[u8], fragment_id: u64, pull: bool) -> bool {
        if !pull && !self.is_pushable((fragment_id % 8) as u8) {
            return false;
        }

        if self.media_writer.is_none() {
            self.media_writer = Some(FlowWriter::new(
                MEDIA_WRITER_ID,
                self.media_signature.clone(),
                0,
            ));
        }
        let writer = self.media_writer.as_mut().unwrap();
        writer.write_raw(data);
        writer.flush(self.band.as_mut(), true);
        true
    }

    /// Announce our fragment availability, unless the peer already has this
    /// announcement.
    pub fn send_fragments_map(&mut self, last_fragment: u64, data: &[u8]) -> bool {
        if last_fragment == self.id_fragments_map_out {
            return false;
        }
        debug!(
            "sending fragments map to peer {} (last fragment {})",
            self.peer_id, last_fragment
        );
        self.report_writer.write_raw(data);
        self.report_writer.flush(self.band.as_mut(), true);
        self.id_fragments_map_out = last_fragment;
        true
    }

    /// Ask the peer to push the given mask set to us.
    pub fn send_push_mode(&mut self, mode: u8) {
        if self.push_in_mode == mode {
            return;
        }
        debug!(
            "setting push in mode to {:02x} for peer {} (last announced fragment {})",
            mode,
            self.peer_id,
            self.fragments_map.last_id()
        );
        self.report_writer.write_group_play_push(mode);
        self.report_writer.flush(self.band.as_mut(), true);
        self.push_in_mode = mode;
    }

    /// Request one fragment. No deduplication here; the pull scheduler owns
    /// the waiting set.
    pub fn send_pull(&mut self, index: u64) {
        trace!("sending pull request for fragment {} to peer {}", index, self.peer_id);
        self.report_writer.write_group_play_pull(index);
    }

    /// Send the media subscription (stream name, key, replication config).
    pub fn send_group_media(&mut self, stream_name: &str, stream_key: &[u8], config: &GroupMediaConfig) {
        trace!(
            "sending the media subscription for stream '{}' to peer {}",
            stream_name,
            self.peer_id
        );
        self.report_writer
            .write_group_media_info(stream_name, stream_key, config);
        self.group_media_sent = true;
    }

    pub fn flush_report_writer(&mut self) {
        self.report_writer.flush(self.band.as_mut(), true);
    }

    /// Ingest the peer's availability announcement. Returns false when the
    /// announcement is stale.
    pub fn on_fragments_map(&mut self, id: u64, bitmap: &[u8]) -> bool {
        if id <= self.fragments_map.last_id() {
            debug!(
                "wrong fragments map received from peer {}: {} <= {}",
                self.peer_id,
                id,
                self.fragments_map.last_id()
            );
            return false;
        }
        self.fragments_map.update(id, bitmap);
        true
    }

    /// Whether this peer announced `index` and is still worth pulling it
    /// from.
    pub fn has_fragment(&self, index: u64) -> bool {
        let last = self.fragments_map.last_id();
        if last == 0 || last < index {
            trace!(
                "searching {} impossible into {}, current id {}",
                index,
                self.peer_id,
                last
            );
            return false;
        }
        if last == index {
            return true;
        }
        if self.pull_blacklist.contains(&index) {
            trace!(
                "searching {} impossible into {}, a request has already failed",
                index,
                self.peer_id
            );
            return false;
        }
        self.fragments_map.has(index)
    }

    /// A pull for this id timed out at this peer; never ask it again.
    // TODO drop blacklisted ids once they leave the retention window
    pub fn add_pull_blacklist(&mut self, fragment_id: u64) {
        self.pull_blacklist.insert(fragment_id);
    }

    /// Route an acknowledgment to the addressed writer. Returns whether the
    /// peer should be closed (its report flow died).
    pub fn on_acknowledgment(&mut self, writer_id: u64, buf: &mut impl Buf) -> anyhow::Result<bool> {
        if writer_id == REPORT_WRITER_ID {
            self.report_writer.acknowledgment(self.band.as_mut(), buf)?;
        } else if writer_id == MEDIA_WRITER_ID {
            if let Some(writer) = self.media_writer.as_mut() {
                writer.acknowledgment(self.band.as_mut(), buf)?;
                if writer.is_closed() {
                    debug!("media writer of peer {} closed", self.peer_id);
                    self.media_writer = None;
                }
            }
        } else {
            error!(
                "acknowledgment for unknown writer {} of peer {}",
                writer_id, self.peer_id
            );
        }
        Ok(self.report_writer.is_closed())
    }

    /// Periodic drive of both writers. Returns whether the peer should be
    /// closed (its report flow died).
    pub fn manage(&mut self) -> bool {
        self.report_writer.manage(self.band.as_mut());
        if let Some(writer) = self.media_writer.as_mut() {
            writer.manage(self.band.as_mut());
            if writer.is_closed() {
                debug!("media writer of peer {} closed", self.peer_id);
                self.media_writer = None;
            }
        }
        self.report_writer.is_closed()
    }

    /// Close both flows and flush the goodbye.
    pub fn close(&mut self) {
        if let Some(writer) = self.media_writer.as_mut() {
            writer.close(self.band.as_mut());
        }
        self.media_writer = None;
        self.report_writer.close(self.band.as_mut());
        self.band.flush();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::TestBand;
    use crate::wire;

    fn peer(band: &TestBand) -> PeerMedia {
        PeerMedia::new(PeerId::from("peer-a"), Box::new(band.handle()), b"key")
    }

    #[test]
    fn test_send_media_gated_by_push_mask() {
        let band = TestBand::new(2000);
        let mut peer = peer(&band);

        // fragment 9 -> mask 0x02; not pushable yet
        assert!(!peer.send_media(b"\x22\x09payload", 9, false));
        assert!(band.frames().is_empty());

        peer.set_push_out_mode(0x02);
        assert!(peer.send_media(b"\x22\x09payload", 9, false));
        assert_eq!(band.frames().len(), 1);
        assert_eq!(band.frames()[0].writer_id, 3);

        // a pull answer ignores the mask
        assert!(peer.send_media(b"\x22\x0bpayload", 11, true));
        assert_eq!(band.frames().len(), 2);
    }

    #[test]
    fn test_media_writer_signature_carries_stream_key() {
        let band = TestBand::new(2000);
        let mut peer = peer(&band);
        peer.set_push_out_mode(0xff);
        peer.send_media(b"x", 1, false);

        let frame = &band.frames()[0];
        // flags + HEADER: id 3, stage 1, gap 1, then len-prefixed signature
        assert_eq!(frame.bytes[4], 7);
        assert_eq!(&frame.bytes[5..12], b"\x00\x47\x52\x11key");
    }

    #[test]
    fn test_send_fragments_map_deduplicates() {
        let band = TestBand::new(2000);
        let mut peer = peer(&band);

        assert!(peer.send_fragments_map(10, &[0x22, 0x0a, 0xff]));
        assert!(!peer.send_fragments_map(10, &[0x22, 0x0a, 0xff]));
        assert!(peer.send_fragments_map(11, &[0x22, 0x0b, 0xff]));
        assert_eq!(band.frames().len(), 2);
    }

    #[test]
    fn test_send_push_mode_deduplicates() {
        let band = TestBand::new(2000);
        let mut peer = peer(&band);

        peer.send_push_mode(0x05);
        peer.send_push_mode(0x05);
        assert_eq!(peer.push_in_mode, 0x05);
        assert_eq!(band.frames_with_opcode(wire::GROUP_PLAY_PUSH).len(), 1);

        peer.send_push_mode(0x04);
        assert_eq!(band.frames_with_opcode(wire::GROUP_PLAY_PUSH).len(), 2);
    }

    #[test]
    fn test_stale_fragments_map_rejected() {
        let band = TestBand::new(2000);
        let mut peer = peer(&band);

        assert!(peer.on_fragments_map(20, &[0xff]));
        assert!(!peer.on_fragments_map(20, &[0xff]));
        assert!(!peer.on_fragments_map(19, &[0xff]));
        assert!(peer.on_fragments_map(21, &[0xff]));
    }

    #[test]
    fn test_has_fragment_respects_blacklist() {
        let band = TestBand::new(2000);
        let mut peer = peer(&band);

        peer.on_fragments_map(20, &[0xff]);
        assert!(peer.has_fragment(19));

        peer.add_pull_blacklist(19);
        assert!(!peer.has_fragment(19));
        // the announced id itself stays reachable
        peer.add_pull_blacklist(20);
        assert!(peer.has_fragment(20));
    }

    #[test]
    fn test_negative_ack_on_report_flow_closes_peer() {
        let band = TestBand::new(2000);
        let mut peer = peer(&band);

        peer.send_push_mode(0x01);
        let mut ack = Bytes::from_static(&[0x00]);
        let closed = peer.on_acknowledgment(2, &mut ack).unwrap();
        assert!(closed);
    }

    #[test]
    fn test_send_pull_queues_without_flushing() {
        let band = TestBand::new(2000);
        let mut peer = peer(&band);

        peer.send_pull(42);
        assert!(band.frames().is_empty());

        // the next periodic drive sends it
        peer.manage();
        assert_eq!(band.frames_with_opcode(wire::GROUP_PLAY_PULL).len(), 1);
    }
}

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::collections::BTreeMap;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU32, Ordering};
use tokio::time::Instant;
use tracing::{debug, error, trace, warn};

use crate::group::config::{GroupMediaConfig, MAX_PACKET_SIZE, PULL_DELAY, PUSH_DELAY};
use crate::group::cursor::PeerCursor;
use crate::group::fragment::{Fragment, ParsedFragment};
use crate::group::peer_media::PeerMedia;
use crate::group::PeerId;
use crate::util::buf::put_u64_7bit;
use crate::util::random::{Random, RngRandom};
use crate::wire::{self, FragmentMarker, MediaType};

static GROUP_MEDIA_COUNTER: AtomicU32 = AtomicU32::new(0);

/// Events the engine raises to its host.
pub trait GroupObserver: Send {
    /// One complete media packet, reassembled and in order.
    fn on_group_packet(&mut self, time: u32, payload: &[u8], is_audio: bool);
}

struct PendingPull {
    peer: PeerId,
    requested_at: Instant,
}

/// Per-stream replication engine.
///
/// A publisher fragments local media into the store and pushes the
/// fragments out; a subscriber collects fragments from pushes and pulls,
/// relays them onward, and advances an ordered-delivery cursor that emits
/// complete packets to the [`GroupObserver`].
///
/// All state is driven from one logical thread: ingress callbacks run to
/// completion, and a periodic [`GroupMedia::manage`] tick drives gossip,
/// push assignment, pull scheduling, window eviction and the flow-writer
/// retransmit triggers.
pub struct GroupMedia<R: Random = RngRandom> {
    pub id: u32,
    config: GroupMediaConfig,
    stream_name: String,
    stream_key: Bytes,

    /// fragment id -> fragment, bounded by the retention window
    fragments: BTreeMap<u64, Fragment>,
    /// timestamp -> fragment id, for window eviction only
    time_index: BTreeMap<u32, u64>,
    /// publisher: last assigned id; subscriber: last id delivered in order
    fragment_counter: u64,

    peers: BTreeMap<PeerId, PeerMedia>,

    /// pulls in flight: fragment id -> where and when we asked
    waiting_pulls: BTreeMap<u64, PendingPull>,
    /// arrival time -> last id of each availability announcement, so the
    /// pull scheduler only chases fragments that are really missing
    pull_time_to_fragment: BTreeMap<Instant, u64>,
    /// highest announced fragment id seen so far
    last_fragment_map_id: u64,

    /// ordered delivery stays gated until the first pulled fragment arrives
    first_pull_received: bool,
    /// the first availability announcement triggers an immediate
    /// push-assignment round
    first_push_mode: bool,
    current_push_mask: u8,
    /// upper edge of the hole-fill scan
    current_pull_fragment: u64,

    /// mask -> (owning pusher, highest fragment id seen under that mask)
    push_masks: BTreeMap<u8, (PeerId, u64)>,

    pull_cursor: PeerCursor,
    push_cursor: PeerCursor,
    fragments_cursor: PeerCursor,

    last_fragments_map: Instant,
    last_push: Instant,
    last_pull: Instant,

    _random: PhantomData<R>,
}

impl GroupMedia<RngRandom> {
    pub fn new(
        stream_name: String,
        stream_key: Bytes,
        config: GroupMediaConfig,
        now: Instant,
    ) -> GroupMedia<RngRandom> {
        Self::new_with_random(stream_name, stream_key, config, now)
    }
}

impl<R: Random> GroupMedia<R> {
    pub fn new_with_random(
        stream_name: String,
        stream_key: Bytes,
        config: GroupMediaConfig,
        now: Instant,
    ) -> GroupMedia<R> {
        GroupMedia {
            id: GROUP_MEDIA_COUNTER.fetch_add(1, Ordering::Relaxed) + 1,
            config,
            stream_name,
            stream_key,
            fragments: BTreeMap::default(),
            time_index: BTreeMap::default(),
            fragment_counter: 0,
            peers: BTreeMap::default(),
            waiting_pulls: BTreeMap::default(),
            pull_time_to_fragment: BTreeMap::default(),
            last_fragment_map_id: 0,
            first_pull_received: false,
            first_push_mode: true,
            current_push_mask: 0,
            current_pull_fragment: 0,
            push_masks: BTreeMap::default(),
            pull_cursor: PeerCursor::new(),
            push_cursor: PeerCursor::new(),
            fragments_cursor: PeerCursor::new(),
            last_fragments_map: now,
            last_push: now,
            last_pull: now,
            _random: PhantomData,
        }
    }

    pub fn is_publisher(&self) -> bool {
        self.config.is_publisher
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    // ------------------------------------------------------------------
    // peer lifecycle
    // ------------------------------------------------------------------

    pub fn add_peer(&mut self, peer: PeerMedia, sink: &mut dyn GroupObserver) {
        let peer_id = peer.peer_id().clone();
        if self.peers.contains_key(&peer_id) {
            return;
        }
        self.peers.insert(peer_id.clone(), peer);
        debug!(
            "GroupMedia {} - adding peer {} ({} peers)",
            self.id,
            peer_id,
            self.peers.len()
        );

        self.send_group_media(&peer_id, sink);
    }

    /// Media subscription plus our current fragments map, once per peer.
    fn send_group_media(&mut self, peer_id: &PeerId, sink: &mut dyn GroupObserver) {
        if self.peers.get(peer_id).map(|p| p.group_media_sent) != Some(false) {
            return;
        }

        let stream_name = self.stream_name.clone();
        let stream_key = self.stream_key.clone();
        let config = self.config.clone();
        let map = self.update_fragment_map(sink);

        let Some(peer) = self.peers.get_mut(peer_id) else {
            return;
        };
        peer.send_group_media(&stream_name, &stream_key, &config);
        match map {
            Some((last_fragment, bytes)) => {
                if !peer.send_fragments_map(last_fragment, &bytes) {
                    peer.flush_report_writer();
                }
            }
            None => peer.flush_report_writer(),
        }
    }

    /// The session layer observed this peer going away, or one of its flows
    /// died: forget its push-mask ownerships and drop it.
    pub fn close_peer(&mut self, peer_id: &PeerId) {
        let mask = self.peers.get(peer_id).map(|p| p.push_in_mode).unwrap_or(0);
        if mask != 0 {
            for bit in 0..8u8 {
                let single = 1 << bit;
                if mask & single != 0 {
                    if let Some((owner, _)) = self.push_masks.get(&single) {
                        if owner == peer_id {
                            self.push_masks.remove(&single);
                        }
                    }
                }
            }
        }
        self.remove_peer(peer_id);
    }

    fn remove_peer(&mut self, peer_id: &PeerId) {
        if !self.peers.contains_key(peer_id) {
            return;
        }
        debug!(
            "GroupMedia {} - removing peer {} ({} peers)",
            self.id,
            peer_id,
            self.peers.len()
        );

        // a cursor aimed at the removed peer steps onward; if the step wraps
        // back it parks at "end"
        fix_cursor(&mut self.pull_cursor, &self.peers, true, peer_id);
        fix_cursor(&mut self.push_cursor, &self.peers, false, peer_id);
        fix_cursor(&mut self.fragments_cursor, &self.peers, false, peer_id);

        if let Some(mut peer) = self.peers.remove(peer_id) {
            peer.close();
        }
    }

    // ------------------------------------------------------------------
    // publishing path
    // ------------------------------------------------------------------

    /// Fragment one local media frame and push it into the mesh.
    pub fn on_media(&mut self, media_type: MediaType, time: u32, data: &[u8]) {
        if !self.config.is_publisher {
            warn!("GroupMedia {} - ignoring local media on a subscriber", self.id);
            return;
        }
        if data.is_empty() {
            return;
        }

        let mut split_counter =
            (data.len() / MAX_PACKET_SIZE - usize::from(data.len() % MAX_PACKET_SIZE == 0)) as u8;
        let mut marker = FragmentMarker::Data;
        trace!(
            "GroupMedia {} - creating fragments {} to {} - time {}",
            self.id,
            self.fragment_counter + 1,
            self.fragment_counter + 1 + split_counter as u64,
            time
        );

        let mut pos = 0;
        loop {
            if data.len() > MAX_PACKET_SIZE {
                marker = if split_counter == 0 {
                    FragmentMarker::End
                } else if pos == 0 {
                    FragmentMarker::Start
                } else {
                    FragmentMarker::Next
                };
            }

            let fragment_size = if split_counter > 0 {
                MAX_PACKET_SIZE
            } else {
                data.len() - pos
            };
            self.fragment_counter += 1;
            let id = self.fragment_counter;
            self.add_fragment(
                None,
                marker,
                id,
                split_counter,
                media_type,
                time,
                &data[pos..pos + fragment_size],
            );

            pos += fragment_size;
            if split_counter == 0 {
                break;
            }
            split_counter -= 1;
        }
    }

    // ------------------------------------------------------------------
    // subscribing path
    // ------------------------------------------------------------------

    /// One fragment arrived from `peer_id`, by push or as a pull answer.
    pub fn on_fragment(
        &mut self,
        peer_id: &PeerId,
        fragment: ParsedFragment,
        sink: &mut dyn GroupObserver,
    ) {
        let id = fragment.id;

        if self.waiting_pulls.remove(&id).is_some() {
            trace!("GroupMedia {} - waiting fragment {} arrived", self.id, id);
            if !self.first_pull_received {
                self.first_pull_received = true;
            }
        } else {
            // pushed fragment: track who pushes this mask fastest
            let mask = 1u8 << (id % 8);
            let push_in = self.peers.get(peer_id).map(|p| p.push_in_mode).unwrap_or(0);
            if push_in & mask != 0 {
                trace!(
                    "GroupMedia {} - push in fragment received from {}: {} ; mask {:02x}",
                    self.id,
                    peer_id,
                    id,
                    mask
                );
                self.update_push_mask_owner(mask, peer_id, id);
            } else {
                debug!(
                    "GroupMedia {} - unexpected fragment received from {}: {} ; mask {:02x}",
                    self.id, peer_id, id, mask
                );
            }
        }

        if self.fragments.contains_key(&id) {
            trace!("GroupMedia {} - fragment {} already received, ignored", self.id, id);
            return;
        }

        self.add_fragment(
            Some(peer_id),
            fragment.marker,
            id,
            fragment.split_index,
            fragment.media_type,
            fragment.time,
            &fragment.payload,
        );
        self.push_fragment(id, sink);
    }

    /// "Faster wins": the peer that pushes higher ids under a mask owns it;
    /// the loser is told to drop the mask bit.
    fn update_push_mask_owner(&mut self, mask: u8, peer_id: &PeerId, id: u64) {
        match self.push_masks.get(&mask).cloned() {
            None => {
                self.push_masks.insert(mask, (peer_id.clone(), id));
            }
            Some((owner, highest)) => {
                if owner != *peer_id {
                    if highest < id {
                        trace!(
                            "GroupMedia {} - push in - updating the pusher, last peer was {}",
                            self.id,
                            owner
                        );
                        if let Some(old_peer) = self.peers.get_mut(&owner) {
                            let mode = old_peer.push_in_mode & !mask;
                            old_peer.send_push_mode(mode);
                        }
                        self.push_masks.insert(mask, (peer_id.clone(), id));
                    } else {
                        trace!(
                            "GroupMedia {} - push in - tested pusher is slower than the current one, resetting mask",
                            self.id
                        );
                        if let Some(peer) = self.peers.get_mut(peer_id) {
                            let mode = peer.push_in_mode & !mask;
                            peer.send_push_mode(mode);
                        }
                    }
                } else if highest < id {
                    self.push_masks.insert(mask, (owner, id));
                }
            }
        }
    }

    /// A peer asks for one fragment: answer from the store in pull mode.
    pub fn on_play_pull(&mut self, peer_id: &PeerId, index: u64) {
        let Some(fragment) = self.fragments.get(&index) else {
            debug!(
                "GroupMedia {} - peer is asking for an unknown fragment ({}), possibly deleted",
                self.id, index
            );
            return;
        };
        let bytes = fragment.bytes();
        if let Some(peer) = self.peers.get_mut(peer_id) {
            peer.send_media(&bytes, index, true);
        }
    }

    /// A peer asks us to push a mask set to it.
    pub fn on_play_push(&mut self, peer_id: &PeerId, mode: u8) {
        if let Some(peer) = self.peers.get_mut(peer_id) {
            peer.set_push_out_mode(mode);
        }
    }

    /// A peer announced its fragment availability.
    pub fn on_fragments_map(&mut self, peer_id: &PeerId, map_id: u64, bitmap: &[u8], now: Instant) {
        if self.config.is_publisher {
            return; // a publisher does not consume availability
        }

        if self.last_fragment_map_id < map_id {
            self.pull_time_to_fragment.insert(now, map_id);
            self.last_fragment_map_id = map_id;
        }

        if self.first_push_mode {
            self.send_push_requests(now);
            self.first_push_mode = false;
        }

        if let Some(peer) = self.peers.get_mut(peer_id) {
            peer.on_fragments_map(map_id, bitmap);
        }
    }

    /// Route a flow acknowledgment to the addressed writer of the addressed
    /// peer; a dead report flow cascades into a peer close.
    pub fn on_acknowledgment(
        &mut self,
        peer_id: &PeerId,
        writer_id: u64,
        buf: &mut impl Buf,
    ) -> anyhow::Result<()> {
        let closed = match self.peers.get_mut(peer_id) {
            Some(peer) => peer.on_acknowledgment(writer_id, buf)?,
            None => return Ok(()),
        };
        if closed {
            self.close_peer(peer_id);
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // store
    // ------------------------------------------------------------------

    /// Insert a fragment and relay it to up to `push_limit + 1` accepting
    /// peers (everyone but the sender). DATA/START fragments with a fresh
    /// timestamp extend the time index.
    fn add_fragment(
        &mut self,
        from_peer: Option<&PeerId>,
        marker: FragmentMarker,
        id: u64,
        split_index: u8,
        media_type: MediaType,
        time: u32,
        payload: &[u8],
    ) {
        let fragment = Fragment::new(marker, id, split_index, media_type, time, payload);
        let bytes = fragment.bytes();
        self.fragments.insert(id, fragment);

        let mut nb_push = self.config.push_limit as u32 + 1;
        for (peer_id, peer) in self.peers.iter_mut() {
            if Some(peer_id) != from_peer && peer.send_media(&bytes, id, false) {
                nb_push -= 1;
                if nb_push == 0 {
                    trace!(
                        "GroupMedia {} - push limit ({}) reached for fragment {} (mask={:02x})",
                        id,
                        self.config.push_limit as u32 + 1,
                        id,
                        1u8 << (id % 8)
                    );
                    break;
                }
            }
        }

        if marker.carries_time()
            && self
                .time_index
                .last_key_value()
                .map_or(true, |(&latest, _)| time > latest)
        {
            self.time_index.insert(time, id);
        }
    }

    // ------------------------------------------------------------------
    // ordered delivery
    // ------------------------------------------------------------------

    /// Advance the ordered-delivery cursor from `id` as far as the store
    /// allows, emitting complete audio/video packets to the sink.
    fn push_fragment(&mut self, start_at: u64, sink: &mut dyn GroupObserver) {
        if !self.first_pull_received {
            return;
        }

        let mut id = start_at;
        loop {
            let Some(fragment) = self.fragments.get(&id) else {
                return;
            };

            // stand-alone fragment (plus the degenerate solitary END case)
            if fragment.marker == FragmentMarker::Data
                || (fragment.marker == FragmentMarker::End && id == self.fragment_counter + 1)
            {
                if self.fragment_counter != 0 && id != self.fragment_counter + 1 {
                    return;
                }
                self.fragment_counter = id;
                trace!("GroupMedia {} - pushing media fragment {}", self.id, id);
                if matches!(fragment.media_type, MediaType::Audio | MediaType::Video) {
                    let is_audio = fragment.media_type == MediaType::Audio;
                    let time = fragment.time;
                    let payload = fragment.payload().to_vec();
                    sink.on_group_packet(time, &payload, is_audio);
                }
                id += 1;
                continue;
            }

            // split packet
            if self.fragment_counter == 0 {
                if fragment.marker != FragmentMarker::Start {
                    trace!(
                        "GroupMedia {} - ignoring split fragment {}, we are waiting for a starting fragment",
                        self.id,
                        id
                    );
                    self.fragments.remove(&id);
                    return;
                }
                trace!("GroupMedia {} - first fragment is a start media fragment", self.id);
                self.fragment_counter = id - 1;
            }

            // walk back over the contiguous run to the START
            let mut start_id = id;
            while self.fragments[&start_id].marker != FragmentMarker::Start {
                start_id -= 1;
                if !self.fragments.contains_key(&start_id) {
                    return; // a hole; wait for it to fill
                }
            }

            // every fragment of the split group must be present
            let end_id = start_id + self.fragments[&start_id].split_index as u64;
            let mut payload_size = 0;
            for fid in start_id..=end_id {
                match self.fragments.get(&fid) {
                    Some(f) => payload_size += f.payload_len(),
                    None => return,
                }
            }

            if start_id != self.fragment_counter + 1 {
                return;
            }
            self.fragment_counter = end_id;

            let first = &self.fragments[&start_id];
            if matches!(first.media_type, MediaType::Audio | MediaType::Video) {
                let is_audio = first.media_type == MediaType::Audio;
                let time = first.time;
                let mut payload = BytesMut::with_capacity(payload_size);
                for fid in start_id..=end_id {
                    payload.put_slice(self.fragments[&fid].payload());
                }
                trace!(
                    "GroupMedia {} - pushing split packet {} - {} fragments for a total size of {}",
                    self.id,
                    start_id,
                    end_id - start_id + 1,
                    payload_size
                );
                sink.on_group_packet(time, &payload, is_audio);
            }

            id = end_id + 1;
        }
    }

    // ------------------------------------------------------------------
    // availability gossip
    // ------------------------------------------------------------------

    /// Encode the availability map over the current store (after trimming
    /// the window). Returns the announced last id and the full message.
    fn update_fragment_map(&mut self, sink: &mut dyn GroupObserver) -> Option<(u64, Bytes)> {
        if self.fragments.is_empty() {
            return None;
        }

        self.erase_old_fragments(sink);

        let first = *self.fragments.keys().next().unwrap();
        let last = *self.fragments.keys().next_back().unwrap();
        let fragment_span = last - first;

        let mut buf = BytesMut::with_capacity(2 + (fragment_span as usize + 7) / 8 + 9);
        buf.put_u8(wire::GROUP_FRAGMENTS_MAP);
        put_u64_7bit(&mut buf, last);

        if fragment_span == 0 {
            return Some((last, buf.freeze()));
        }

        if self.config.is_publisher {
            // a publisher has every fragment of the window
            let mut remaining = fragment_span;
            while remaining > 8 {
                buf.put_u8(0xff);
                remaining -= 8;
            }
            let mut last_byte: u8 = 1;
            remaining -= 1;
            while remaining > 0 {
                last_byte = (last_byte << 1) + 1;
                remaining -= 1;
            }
            buf.put_u8(last_byte);
        } else {
            let mut index = last - 1;
            while index >= first && index >= 8 {
                let mut current: u8 = 0;
                for bit in 0..8u64 {
                    if index - bit < first {
                        break;
                    }
                    if self.fragments.contains_key(&(index - bit)) {
                        current |= 1 << bit;
                    }
                }
                buf.put_u8(current);
                index -= 8;
            }
        }

        Some((last, buf.freeze()))
    }

    // ------------------------------------------------------------------
    // window eviction
    // ------------------------------------------------------------------

    /// Trim fragments older than the retention window, advancing the
    /// delivery cursor past the cut when the consumer fell behind.
    fn erase_old_fragments(&mut self, sink: &mut dyn GroupObserver) {
        let Some(last_fragment) = self.fragments.values().next_back() else {
            return;
        };
        let end_time = last_fragment.time;
        let window =
            (self.config.window_duration + self.config.relay_margin).as_millis() as u32;
        let keep_after = end_time.saturating_sub(window);

        // the first time-indexed fragment that must survive
        let Some((&cut_time, &cut_id)) = self.time_index.range(keep_after..).next() else {
            return;
        };
        if self.time_index.keys().next() == Some(&cut_time) {
            return; // never drop the first surviving reference
        }

        if !self.fragments.contains_key(&cut_id) {
            error!(
                "GroupMedia {} - unable to find the fragment {} for cleaning the buffer",
                self.id, cut_id
            );
            return;
        }
        // keep from the fragment right before the surviving time reference
        let Some((&keep_from, _)) = self.fragments.range(..cut_id).next_back() else {
            return;
        };

        if self.fragment_counter < keep_from {
            warn!(
                "GroupMedia {} - deleting unread fragments to keep the window duration ({} fragments ignored)",
                self.id,
                keep_from - self.fragment_counter
            );
            self.fragment_counter = keep_from;
        }

        debug!(
            "GroupMedia {} - deletion of fragments {} (~{}) to {} (~{}) - current time {}",
            self.id,
            self.fragments.keys().next().unwrap(),
            self.time_index.keys().next().unwrap(),
            keep_from,
            cut_time,
            end_time
        );
        self.fragments = self.fragments.split_off(&keep_from);
        self.time_index = self.time_index.split_off(&cut_time);

        // pulls for evicted fragments will never be answered usefully
        if let Some((&oldest_waiting, _)) = self.waiting_pulls.first_key_value() {
            if oldest_waiting < keep_from {
                warn!(
                    "GroupMedia {} - deletion of waiting fragments {} to {}",
                    self.id, oldest_waiting, keep_from
                );
                self.waiting_pulls = self.waiting_pulls.split_off(&keep_from);
            }
        }
        if self.current_pull_fragment < keep_from {
            self.current_pull_fragment = keep_from;
        }

        // eviction may have unstuck the delivery cursor
        let next = self.fragment_counter + 1;
        if self.fragments.contains_key(&next) {
            self.push_fragment(next, sink);
        }
    }

    // ------------------------------------------------------------------
    // scheduling
    // ------------------------------------------------------------------

    /// Periodic drive: availability gossip, push assignment, pull
    /// scheduling, and the per-peer flow writers.
    pub fn manage(&mut self, now: Instant, sink: &mut dyn GroupObserver) {
        if self.peers.is_empty() {
            return;
        }

        if now.duration_since(self.last_fragments_map) > self.config.availability_update_period {
            if let Some((last_fragment, bytes)) = self.update_fragment_map(sink) {
                if self.config.availability_send_to_all {
                    for peer in self.peers.values_mut() {
                        peer.send_fragments_map(last_fragment, &bytes);
                    }
                } else {
                    let seeded = self.fragments_cursor.current().is_none()
                        && self.fragments_cursor.seed_random::<R, _>(&self.peers, |_| true);
                    if seeded || self.fragments_cursor.advance(&self.peers, false, |_| true) {
                        let target = self.fragments_cursor.current().unwrap().clone();
                        self.peers
                            .get_mut(&target)
                            .unwrap()
                            .send_fragments_map(last_fragment, &bytes);
                    }
                }
                self.last_fragments_map = now;
            }
        }

        if !self.config.is_publisher && now.duration_since(self.last_push) > PUSH_DELAY {
            self.send_push_requests(now);
        }

        if !self.config.is_publisher && now.duration_since(self.last_pull) > PULL_DELAY {
            self.send_pull_requests(now);
            self.last_pull = now;
        }

        // drive the flow writers; a dead report flow closes its peer
        let closed: Vec<PeerId> = self
            .peers
            .iter_mut()
            .filter_map(|(peer_id, peer)| peer.manage().then(|| peer_id.clone()))
            .collect();
        for peer_id in closed {
            warn!("GroupMedia {} - peer {} stopped acknowledging, closing", self.id, peer_id);
            self.close_peer(&peer_id);
        }
    }

    /// Rotate the push mask and ask one more peer to push it to us. Over
    /// time this spreads the eight masks over up to eight distinct peers.
    fn send_push_requests(&mut self, now: Instant) {
        if !self.peers.is_empty() {
            self.current_push_mask = if self.current_push_mask == 0 {
                1 << (R::gen_u8() % 8)
            } else if self.current_push_mask == 0x80 {
                1
            } else {
                self.current_push_mask << 1
            };
            trace!(
                "GroupMedia {} - push in - current mask is {:02x}",
                self.id,
                self.current_push_mask
            );

            let mask = self.current_push_mask;
            let seeded = self.push_cursor.current().is_none()
                && self
                    .push_cursor
                    .seed_random::<R, _>(&self.peers, |p: &PeerMedia| p.push_in_mode & mask == 0);
            if seeded
                || self
                    .push_cursor
                    .advance(&self.peers, false, |p: &PeerMedia| p.push_in_mode & mask == 0)
            {
                let target = self.push_cursor.current().unwrap().clone();
                let peer = self.peers.get_mut(&target).unwrap();
                let mode = peer.push_in_mode | mask;
                peer.send_push_mode(mode);
            } else {
                trace!(
                    "GroupMedia {} - push in - no new peer available for mask {:02x}",
                    self.id,
                    mask
                );
            }
        }

        self.last_push = now;
    }

    /// Deadline-driven pull: retry timed-out pulls elsewhere (blacklisting
    /// the silent peer), then fill the holes up to the newest announcement
    /// old enough to be trusted.
    fn send_pull_requests(&mut self, now: Instant) {
        if self.pull_time_to_fragment.is_empty() {
            return; // not started yet
        }

        let fetch_period = self.config.fetch_period;
        let Some(time_max) = now.checked_sub(fetch_period) else {
            return;
        };

        // newest announcement that is at least one fetch period old; younger
        // announcements must exist too, or gossip has stalled entirely
        let has_younger = self.pull_time_to_fragment.range(time_max..).next().is_some();
        let older = self
            .pull_time_to_fragment
            .range(..time_max)
            .next_back()
            .map(|(_, &id)| id);
        let last_fragment = match (older, has_younger) {
            (Some(id), true) => id,
            _ => {
                if let Some((&first_arrival, _)) = self.pull_time_to_fragment.first_key_value() {
                    if now.duration_since(first_arrival) > fetch_period {
                        debug!(
                            "GroupMedia {} - send_pull_requests - no fragments map received since the fetch period ({:?}), possible network issue",
                            self.id, fetch_period
                        );
                    }
                }
                return;
            }
        };

        // bootstrap: pull the two newest known fragments from random holders
        if self.current_pull_fragment == 0 {
            self.current_pull_fragment = if last_fragment > 1 { last_fragment - 1 } else { 1 };
            let first_target = self.current_pull_fragment;

            let mut random_cursor = PeerCursor::new();
            if random_cursor
                .seed_random::<R, _>(&self.peers, |p: &PeerMedia| p.has_fragment(first_target))
            {
                trace!(
                    "GroupMedia {} - send_pull_requests - first fragment found: {}",
                    self.id,
                    first_target
                );
                if !self.fragments.contains_key(&first_target) {
                    let target = random_cursor.current().unwrap().clone();
                    self.peers.get_mut(&target).unwrap().send_pull(first_target);
                    self.waiting_pulls.insert(
                        first_target,
                        PendingPull {
                            peer: target,
                            requested_at: now,
                        },
                    );
                } else {
                    self.first_pull_received = true;
                }
            } else {
                trace!(
                    "GroupMedia {} - send_pull_requests - unable to find the first fragment ({})",
                    self.id,
                    first_target
                );
            }

            let second_target = self.current_pull_fragment + 1;
            self.pull_cursor.reset();
            if self
                .pull_cursor
                .seed_random::<R, _>(&self.peers, |p: &PeerMedia| p.has_fragment(second_target))
            {
                trace!(
                    "GroupMedia {} - send_pull_requests - second fragment found: {}",
                    self.id,
                    second_target
                );
                self.current_pull_fragment = second_target;
                if !self.fragments.contains_key(&second_target) {
                    let target = self.pull_cursor.current().unwrap().clone();
                    self.peers.get_mut(&target).unwrap().send_pull(second_target);
                    self.waiting_pulls.insert(
                        second_target,
                        PendingPull {
                            peer: target,
                            requested_at: now,
                        },
                    );
                } else {
                    self.first_pull_received = true;
                }
                return;
            }
            trace!(
                "GroupMedia {} - send_pull_requests - unable to find the second fragment ({})",
                self.id,
                second_target
            );
            self.current_pull_fragment = 0; // no pullers found
            return;
        }

        // retry pass: anything waiting longer than a fetch period moves to
        // another holder, and the silent peer is blacklisted for that id
        if let Some(retry_max) = now.checked_sub(fetch_period + fetch_period) {
            let has_younger = self
                .pull_time_to_fragment
                .range(retry_max..)
                .next()
                .is_some();
            let last_old = self
                .pull_time_to_fragment
                .range(..retry_max)
                .next_back()
                .map(|(_, &id)| id);
            if let (Some(last_old_fragment), true) = (last_old, has_younger) {
                let due: Vec<u64> = self
                    .waiting_pulls
                    .iter()
                    .take_while(|(&id, _)| id <= last_old_fragment)
                    .filter(|(_, pull)| now.duration_since(pull.requested_at) > fetch_period)
                    .map(|(&id, _)| id)
                    .collect();
                for id in due {
                    let silent_peer = self.waiting_pulls[&id].peer.clone();
                    debug!(
                        "GroupMedia {} - send_pull_requests - {:?} without receiving fragment {}, blacklisting peer {}",
                        self.id, fetch_period, id, silent_peer
                    );
                    if let Some(peer) = self.peers.get_mut(&silent_peer) {
                        peer.add_pull_blacklist(id);
                    }
                    self.send_pull_to_next_peer(id, now);
                }
            }
        }

        // hole-fill pass
        while self.current_pull_fragment < last_fragment {
            let next = self.current_pull_fragment + 1;
            if !self.fragments.contains_key(&next) && !self.send_pull_to_next_peer(next, now) {
                break; // wait for the fragment to be announced somewhere
            }
            self.current_pull_fragment = next;
        }

        trace!(
            "GroupMedia {} - send_pull_requests - pull requests done: {} waiting fragments (current: {}; last fragment: {})",
            self.id,
            self.waiting_pulls.len(),
            self.current_pull_fragment,
            last_fragment
        );
    }

    fn send_pull_to_next_peer(&mut self, fragment_id: u64, now: Instant) -> bool {
        if !self
            .pull_cursor
            .advance(&self.peers, true, |p: &PeerMedia| p.has_fragment(fragment_id))
        {
            debug!(
                "GroupMedia {} - send_pull_requests - no peer found for fragment {}",
                self.id, fragment_id
            );
            return false;
        }

        let target = self.pull_cursor.current().unwrap().clone();
        self.peers.get_mut(&target).unwrap().send_pull(fragment_id);
        self.waiting_pulls.insert(
            fragment_id,
            PendingPull {
                peer: target,
                requested_at: now,
            },
        );
        true
    }
}

fn fix_cursor(
    cursor: &mut PeerCursor,
    peers: &BTreeMap<PeerId, PeerMedia>,
    ascending: bool,
    removed: &PeerId,
) {
    if cursor.current() == Some(removed)
        && cursor.advance(peers, ascending, |_| true)
        && cursor.current() == Some(removed)
    {
        cursor.reset();
    }
}

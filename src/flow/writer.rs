use anyhow::bail;
use bitflags::bitflags;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::collections::VecDeque;
use tracing::{debug, error, info, trace, warn};

use crate::flow::band::Band;
use crate::flow::message::FlowMessage;
use crate::flow::trigger::{RepeatTrigger, TriggerOutcome};
use crate::group::config::GroupMediaConfig;
use crate::util::buf::{put_u64_7bit, seven_bit_len, try_get_u64_7bit};
use crate::wire;

bitflags! {
    /// Flags byte leading every flow fragment.
    #[derive(Clone, Copy, PartialEq, Eq, Debug)]
    pub struct FrameFlags: u8 {
        /// the message continues in a following fragment
        const WITH_AFTERPART = 0x01;
        /// the fragment continues a message started in an earlier fragment
        const WITH_BEFOREPART = 0x02;
        /// empty fragment, the writer abandons the flow
        const ABANDONMENT = 0x04;
        /// last fragment of a closing writer
        const END = 0x08;
        /// full header (writer id, stage, ack gap, signature) follows
        const HEADER = 0x80;
    }
}

/// Minimum usable fragment payload; below this the current packet is flushed
/// and a fresh one started.
const MIN_FRAGMENT_PAYLOAD: usize = 12;

/// Writers with an id above this carry the flow-id trailer in their header.
const BARE_HEADER_MAX_ID: u64 = 2;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum WriterState {
    /// handshake pending: reliable writes buffer, flushing is refused
    Opening,
    Open,
    /// draining; new writes are ignored
    Closed,
}

/// Reliable, sequenced delivery of opaque messages over one unidirectional
/// flow.
///
/// The writer assigns a monotonic *stage* to every fragment it transmits,
/// keeps transmitted messages until the receiver acknowledges their stages,
/// and selectively retransmits the stages an acknowledgment exposes as lost.
/// It does no congestion control of its own: the [`Band`] below reports a
/// per-packet write budget and the writer packs fragments into it.
pub struct FlowWriter {
    pub id: u64,
    flow_id: u64,
    signature: Bytes,
    /// messages queued on this writer survive loss reports and are
    /// retransmitted; unreliable writers hand losses to the layer above
    reliable: bool,
    state: WriterState,

    /// id of the next fragment transmission
    stage: u64,
    /// highest stage the receiver acknowledged
    stage_ack: u64,

    /// accepted but not yet transmitted
    messages: VecDeque<FlowMessage>,
    /// transmitted at least once, pending acknowledgment
    messages_sent: VecDeque<FlowMessage>,
    /// number of repeatable messages in `messages_sent`
    repeatable: usize,

    ack_count: u64,
    lost_count: u64,
    trigger: RepeatTrigger,
}

impl FlowWriter {
    pub fn new(id: u64, signature: Bytes, flow_id: u64) -> FlowWriter {
        FlowWriter {
            id,
            flow_id,
            signature,
            reliable: true,
            state: WriterState::Open,
            stage: 0,
            stage_ack: 0,
            messages: VecDeque::default(),
            messages_sent: VecDeque::default(),
            repeatable: 0,
            ack_count: 0,
            lost_count: 0,
            trigger: RepeatTrigger::new(),
        }
    }

    pub fn opening(id: u64, signature: Bytes, flow_id: u64) -> FlowWriter {
        let mut writer = Self::new(id, signature, flow_id);
        writer.state = WriterState::Opening;
        writer
    }

    pub fn open(&mut self) {
        if self.state == WriterState::Opening {
            self.state = WriterState::Open;
        }
    }

    pub fn state(&self) -> WriterState {
        self.state
    }

    pub fn is_closed(&self) -> bool {
        self.state == WriterState::Closed
    }

    /// Closed with all queues drained.
    pub fn consumed(&self) -> bool {
        self.state == WriterState::Closed
            && self.messages.is_empty()
            && self.messages_sent.is_empty()
    }

    pub fn stage(&self) -> u64 {
        self.stage
    }

    pub fn stage_ack(&self) -> u64 {
        self.stage_ack
    }

    /// Queue raw bytes, following the writer's reliability:
    /// reliable (or still opening) writers buffer, unreliable open writers
    /// queue a fire-and-forget message.
    pub fn write_raw(&mut self, data: &[u8]) {
        if self.state == WriterState::Closed {
            trace!("flow writer {}: ignoring write on a closed writer", self.id);
            return;
        }
        if self.reliable || self.state == WriterState::Opening {
            self.messages
                .push_back(FlowMessage::buffered(Bytes::copy_from_slice(data)));
        } else {
            self.messages
                .push_back(FlowMessage::unbuffered(Bytes::copy_from_slice(data)));
        }
    }

    fn queue_control(&mut self, build: impl FnOnce(&mut BytesMut)) {
        if self.state == WriterState::Closed {
            return;
        }
        let mut body = BytesMut::new();
        build(&mut body);
        self.messages.push_back(FlowMessage::buffered(body.freeze()));
    }

    pub fn write_group_connect(&mut self, group_id: &[u8]) {
        self.queue_control(|buf| {
            buf.put_u8(wire::GROUP_INIT);
            buf.put_u16(0x2115);
            buf.put_slice(group_id);
        });
    }

    pub fn write_peer_group_join(&mut self, group_hex: &str, key: &[u8], raw_peer_id: &[u8]) {
        self.queue_control(|buf| {
            buf.put_u8(wire::GROUP_INIT);
            buf.put_u16(0x4100);
            buf.put_slice(group_hex.as_bytes());
            buf.put_u16(0x2101);
            buf.put_slice(key);
            buf.put_u16(0x2303);
            buf.put_slice(raw_peer_id);
        });
    }

    pub fn write_group_begin(&mut self) {
        self.queue_control(|buf| {
            buf.put_u8(wire::ABORT_MARKER);
        });
        self.queue_control(|buf| {
            buf.put_u8(wire::GROUP_BEGIN);
        });
    }

    /// Media subscription: stream name plus the replication parameters the
    /// subscriber should mirror, as tagged 7-bit-long fields.
    pub fn write_group_media_info(
        &mut self,
        stream_name: &str,
        stream_key: &[u8],
        config: &GroupMediaConfig,
    ) {
        let window = config.window_duration.as_millis() as u64;
        let update_period = config.availability_update_period.as_millis() as u64;
        let fetch_period = config.fetch_period.as_millis() as u64;
        let send_to_all = config.availability_send_to_all;

        self.queue_control(move |buf| {
            buf.put_u8(wire::GROUP_MEDIA_INFOS);
            put_u64_7bit(buf, stream_name.len() as u64 + 1);
            buf.put_u8(0);
            buf.put_slice(stream_name.as_bytes());
            buf.put_slice(stream_key);
            buf.put_slice(b"\x01\x02");
            if send_to_all {
                buf.put_slice(b"\x01\x06");
            }
            buf.put_u8(1 + seven_bit_len(window) as u8);
            buf.put_u8(0x03);
            put_u64_7bit(buf, window);
            buf.put_slice(b"\x04\x04\x92\xa7\x60");
            buf.put_u8(1 + seven_bit_len(update_period) as u8);
            buf.put_u8(0x05);
            put_u64_7bit(buf, update_period);
            buf.put_u8(1 + seven_bit_len(fetch_period) as u8);
            buf.put_u8(0x07);
            put_u64_7bit(buf, fetch_period);
        });
    }

    pub fn write_group_play_push(&mut self, mode: u8) {
        self.queue_control(|buf| {
            buf.put_u8(wire::GROUP_PLAY_PUSH);
            buf.put_u8(mode);
        });
    }

    pub fn write_group_play_pull(&mut self, fragment_id: u64) {
        self.queue_control(|buf| {
            buf.put_u8(wire::GROUP_PLAY_PULL);
            put_u64_7bit(buf, fragment_id);
        });
    }

    /// Header bytes after the flags byte for a fragment at `stage`.
    /// At most 50 bytes with a signature of sane length.
    fn header_size(&self, stage: u64) -> usize {
        debug_assert!(self.stage_ack <= stage);
        let mut size = seven_bit_len(self.id)
            + seven_bit_len(stage)
            + seven_bit_len(stage.saturating_sub(self.stage_ack));
        if self.stage_ack == 0 {
            size += 1 + self.signature.len();
            if self.id > BARE_HEADER_MAX_ID {
                size += 2 + seven_bit_len(self.flow_id);
            }
            size += 1;
        }
        size
    }

    /// Full frame overhead: flags byte plus the header if one is emitted.
    fn frame_overhead(&self, header: bool, stage: u64) -> usize {
        1 + if header { self.header_size(stage) } else { 0 }
    }

    fn pack_fragment(
        &self,
        stage: u64,
        mut flags: FrameFlags,
        header: bool,
        chunk: &[u8],
        last_message: bool,
    ) -> BytesMut {
        if self.stage_ack == 0 && header {
            flags |= FrameFlags::HEADER;
        }
        if chunk.is_empty() {
            flags |= FrameFlags::ABANDONMENT;
        }
        if self.state == WriterState::Closed && last_message {
            flags |= FrameFlags::END;
        }

        let mut frame = BytesMut::with_capacity(self.frame_overhead(header, stage) + chunk.len());
        frame.put_u8(flags.bits());
        if header {
            put_u64_7bit(&mut frame, self.id);
            put_u64_7bit(&mut frame, stage);
            put_u64_7bit(&mut frame, stage.saturating_sub(self.stage_ack));
            if self.stage_ack == 0 {
                frame.put_u8(self.signature.len() as u8);
                frame.put_slice(&self.signature);
                if self.id > BARE_HEADER_MAX_ID {
                    frame.put_u8(1 + seven_bit_len(self.flow_id) as u8);
                    frame.put_u8(0x0a);
                    put_u64_7bit(&mut frame, self.flow_id);
                }
                frame.put_u8(0);
            }
        }
        frame.put_slice(chunk);
        frame
    }

    /// Fragment every pending message onto the band, within the band's
    /// per-packet budget, eliding the header when the previous frame in the
    /// packet is ours. With `full` the band packet is sent at the end.
    pub fn flush(&mut self, band: &mut dyn Band, full: bool) -> bool {
        if self.state == WriterState::Opening {
            error!(
                "flow writer {}: policy violation, impossible to flush an opening writer",
                self.id
            );
            return false;
        }

        if self.messages_sent.len() > 100 {
            trace!(
                "flow writer {}: buffering becomes high, {} messages await acknowledgment",
                self.id,
                self.messages_sent.len()
            );
        }

        let mut has_sent = false;
        let mut header = !band.can_write_following(self.id);

        while let Some(mut message) = self.messages.pop_front() {
            has_sent = true;

            if message.repeatable() {
                self.repeatable += 1;
                self.trigger.start();
            }

            let body = message.body();
            let mut offset: usize = 0;
            loop {
                self.stage += 1;

                // packet too full for even a minimal fragment? start a new one
                if band.available_to_write()
                    < self.frame_overhead(header, self.stage) + MIN_FRAGMENT_PAYLOAD
                {
                    band.flush();
                    header = true;
                }

                let overhead = self.frame_overhead(header, self.stage);
                let remaining = body.len() - offset;
                let content_size =
                    remaining.min(band.available_to_write().saturating_sub(overhead));

                let mut flags = FrameFlags::empty();
                if offset > 0 {
                    flags |= FrameFlags::WITH_BEFOREPART;
                }
                let head = header;
                if content_size < remaining {
                    // the message continues in the next packet
                    flags |= FrameFlags::WITH_AFTERPART;
                    header = true;
                } else {
                    header = false;
                }

                let frame = self.pack_fragment(
                    self.stage,
                    flags,
                    head,
                    &body[offset..offset + content_size],
                    self.messages.is_empty(),
                );
                band.write_frame(self.id, head, &frame);
                message.fragments_mut().insert(offset as u32, self.stage);

                offset += content_size;
                if offset >= body.len() {
                    break;
                }
            }

            self.messages_sent.push_back(message);
        }

        if full {
            band.flush();
        }
        has_sent
    }

    /// Process one acknowledgment: a receive-buffer hint, the highest
    /// contiguous stage the receiver holds, and the ranges of stages it
    /// knows lost. Acknowledged fragments are dropped, lost repeatable
    /// fragments are retransmitted, lost unrepeatable fragments are counted
    /// and skipped.
    pub fn acknowledgment(
        &mut self,
        band: &mut dyn Band,
        buf: &mut impl Buf,
    ) -> anyhow::Result<()> {
        let buffer_size = try_get_u64_7bit(buf)?;
        if buffer_size == 0 {
            // the receiver is overwhelmed or uninterested
            warn!("flow writer {}: negative acknowledgment, closing", self.id);
            self.close(band);
            return Ok(());
        }

        let stage_ack_prec = self.stage_ack;
        let stage_readen = try_get_u64_7bit(buf)?;

        let mut lost_ranges = Vec::new();
        while buf.has_remaining() {
            let count_minus_1 = try_get_u64_7bit(buf)?;
            if !buf.has_remaining() {
                bail!("acknowledgment with a dangling lost-range count");
            }
            let gap = try_get_u64_7bit(buf)?;
            lost_ranges.push((count_minus_1, gap));
        }

        // the highest stage the receiver has observed in any form
        let max_stage_recv = stage_readen
            + lost_ranges
                .iter()
                .map(|&(count_minus_1, gap)| count_minus_1 + gap + 2)
                .sum::<u64>();

        if stage_readen > self.stage {
            error!(
                "flow writer {}: acknowledgment {} superior to the current sending stage {}",
                self.id, stage_readen, self.stage
            );
            self.stage_ack = self.stage;
        } else if stage_readen <= self.stage_ack {
            if lost_ranges.is_empty() {
                debug!("flow writer {}: obsolete acknowledgment {}", self.id, stage_readen);
            }
        } else {
            self.stage_ack = stage_readen;
        }

        let mut ranges = lost_ranges.into_iter().peekable();
        let mut range_cursor = stage_readen;
        let mut lost_count: u64 = 0;
        let mut lost_stage: u64 = 0;
        let mut repeated = false;
        let mut header = true;
        let mut stop = false;
        let mut stage = stage_ack_prec + 1;

        let mut i = 0;
        while !stop && i < self.messages_sent.len() {
            if self.messages_sent[i].fragments().is_empty() {
                error!(
                    "flow writer {}: message at stage {} is badly formatted",
                    self.id,
                    stage + 1
                );
                i += 1;
                continue;
            }

            let body = self.messages_sent[i].body();
            let repeatable = self.messages_sent[i].repeatable();
            let keys: Vec<u32> = self.messages_sent[i].fragments().keys().cloned().collect();
            let mut fi = 0;

            while fi < keys.len() {
                // acknowledged
                if self.stage_ack >= stage {
                    self.messages_sent[i].fragments_mut().remove(&keys[fi]);
                    self.ack_count += 1;
                    stage += 1;
                    fi += 1;
                    continue;
                }

                // decode the next lost stage
                while !stop {
                    if lost_count == 0 {
                        if let Some((count_minus_1, gap)) = ranges.next() {
                            lost_count = count_minus_1 + 1;
                            lost_stage = range_cursor + 1;
                            range_cursor = lost_stage + lost_count + gap;
                        } else {
                            stop = true;
                            break;
                        }
                    }
                    if lost_stage > self.stage {
                        error!(
                            "flow writer {}: lost information {} has not been sent yet",
                            self.id, lost_stage
                        );
                        stop = true;
                    } else if lost_stage <= self.stage_ack {
                        // already acknowledged
                        lost_count -= 1;
                        lost_stage += 1;
                        continue;
                    }
                    break;
                }
                if stop {
                    break;
                }

                if lost_stage != stage {
                    if repeated {
                        stage += 1;
                        fi += 1;
                        header = true;
                    } else {
                        // nothing repeated so far: the intermediate received
                        // sequence is implicitly acknowledged
                        self.stage_ack = stage;
                    }
                    continue;
                }

                // this stage is reported lost
                if !repeatable {
                    if repeated {
                        fi += 1;
                        stage += 1;
                        header = true;
                    } else {
                        info!("flow writer {}: message {} lost", self.id, stage);
                        self.ack_count = self.ack_count.saturating_sub(1);
                        self.lost_count += 1;
                        self.stage_ack = stage;
                    }
                    lost_count -= 1;
                    lost_stage += 1;
                    continue;
                }

                repeated = true;

                // don't repeat before the receiver saw the last transmission
                let last_sent_stage = self.messages_sent[i].fragments()[&keys[fi]];
                if last_sent_stage >= max_stage_recv {
                    stage += 1;
                    header = true;
                    lost_count -= 1;
                    lost_stage += 1;
                    fi += 1;
                    continue;
                }

                // retransmit, remembering the current top stage so the next
                // acknowledgment can tell a stale loss report from a real one
                debug!("flow writer {}: stage {} repeated", self.id, stage);
                let frag_offset = keys[fi];
                self.messages_sent[i]
                    .fragments_mut()
                    .insert(frag_offset, self.stage);
                fi += 1;

                let mut flags = FrameFlags::empty();
                if frag_offset > 0 {
                    flags |= FrameFlags::WITH_BEFOREPART;
                }
                let mut content_size = body.len() - frag_offset as usize;
                if fi < keys.len() {
                    flags |= FrameFlags::WITH_AFTERPART;
                    content_size = (keys[fi] - frag_offset) as usize;
                }

                if !header && self.frame_overhead(false, stage) + content_size > band.available_to_write()
                {
                    band.flush();
                    header = true;
                }
                if self.frame_overhead(header, stage) + content_size > band.available_to_write() {
                    band.flush();
                }

                let start = frag_offset as usize;
                let frame = self.pack_fragment(
                    stage,
                    flags,
                    header,
                    &body[start..start + content_size],
                    self.messages.len() == 1,
                );
                band.write_frame(self.id, header, &frame);

                header = false;
                lost_count -= 1;
                lost_stage += 1;
                stage += 1;
            }

            if self.messages_sent[i].fragments().is_empty() {
                if self.messages_sent[i].repeatable() {
                    self.repeatable -= 1;
                }
                if self.ack_count > 0 || self.lost_count > 0 {
                    self.ack_count = 0;
                    self.lost_count = 0;
                }
                self.messages_sent.remove(i);
            } else {
                i += 1;
            }
        }

        if lost_count > 0 && ranges.peek().is_some() {
            error!(
                "flow writer {}: some lost information received has not been sent yet",
                self.id
            );
        }

        if self.repeatable == 0 {
            self.trigger.stop();
        } else if self.stage_ack > stage_ack_prec || repeated {
            self.trigger.reset();
        }

        Ok(())
    }

    /// Bulk retransmit of the repeatable backlog, as far as one packet
    /// allows. Fired by the trigger when no acknowledgment advanced
    /// `stage_ack` within its current cycle.
    fn raise_message(&mut self, band: &mut dyn Band) {
        let mut header = true;
        let mut stop = true;
        let mut sent = false;
        let mut stage = self.stage_ack + 1;

        for i in 0..self.messages_sent.len() {
            if self.messages_sent[i].fragments().is_empty() {
                break;
            }

            // unbuffered messages are not repeated
            if !self.messages_sent[i].repeatable() {
                stage += self.messages_sent[i].fragments().len() as u64;
                header = true;
                continue;
            }

            if stop {
                // waiting band content goes first
                band.flush();
                stop = false;
            }

            let body = self.messages_sent[i].body();
            let keys: Vec<u32> = self.messages_sent[i].fragments().keys().cloned().collect();
            let mut available = body.len() - keys[0] as usize;

            let mut fi = 0;
            while fi < keys.len() {
                let frag_offset = keys[fi];
                let mut content_size = available;
                fi += 1;

                let mut flags = FrameFlags::empty();
                if frag_offset > 0 {
                    flags |= FrameFlags::WITH_BEFOREPART;
                }
                if fi < keys.len() {
                    flags |= FrameFlags::WITH_AFTERPART;
                    content_size = (keys[fi] - frag_offset) as usize;
                }

                // we fill just this one packet; the rest waits for the next cycle
                if self.frame_overhead(header, stage) + content_size > band.available_to_write() {
                    if !sent {
                        error!("flow writer {}: raising messages without sending", self.id);
                    }
                    debug!("flow writer {}: raise finishes on stage {}", self.id, stage);
                    return;
                }
                sent = true;

                let start = frag_offset as usize;
                let frame = self.pack_fragment(
                    stage,
                    flags,
                    header,
                    &body[start..start + content_size],
                    self.messages.len() == 1,
                );
                band.write_frame(self.id, header, &frame);

                stage += 1;
                available -= content_size;
                header = false;
            }
        }

        if stop {
            self.trigger.stop();
        }
    }

    /// Periodic drive: evaluate the retransmit trigger and flush pending
    /// messages. Closes the writer when the trigger exhausts its cycles.
    pub fn manage(&mut self, band: &mut dyn Band) {
        if !self.consumed() {
            match self.trigger.on_tick() {
                TriggerOutcome::Raise => {
                    trace!(
                        "flow writer {}: sending back repeatable messages (cycle {})",
                        self.id,
                        self.trigger.cycle()
                    );
                    self.raise_message(band);
                }
                TriggerOutcome::Exhausted => {
                    warn!(
                        "flow writer {}: cannot deliver its data, closing",
                        self.id
                    );
                    self.close(band);
                    return;
                }
                TriggerOutcome::Idle => {}
            }
        }
        self.flush(band, true);
    }

    /// Close the flow: queue the end marker (if the receiver may exist) and
    /// drain. Further writes are ignored.
    pub fn close(&mut self, band: &mut dyn Band) {
        if self.state == WriterState::Closed {
            return;
        }
        if self.stage > 0 || !self.messages.is_empty() {
            // an empty fragment carries ABANDONMENT / END to the receiver
            self.messages.push_back(FlowMessage::buffered(Bytes::new()));
        }
        self.state = WriterState::Closed;
        self.flush(band, true);
    }
}

//! On-wire constants shared by the media flow and the media-report flow.
//!
//! Fragment markers and media-info opcodes live in disjoint flows, so the
//! overlapping byte values (0x21..0x23) never meet in one parser.

use num_enum::{IntoPrimitive, TryFromPrimitive};

/// Group handshake: net-group id announcement.
pub const GROUP_INIT: u8 = 0x01;
/// Group handshake: ready-to-exchange marker.
pub const GROUP_BEGIN: u8 = 0x0e;
/// Media subscription: stream name + replication parameters.
pub const GROUP_MEDIA_INFOS: u8 = 0x21;
/// Availability gossip: last fragment id + presence bitmap.
pub const GROUP_FRAGMENTS_MAP: u8 = 0x22;
/// Push-mode assignment: one byte, the mask set the sender wants pushed.
pub const GROUP_PLAY_PUSH: u8 = 0x23;
/// Pull request: 7-bit-long fragment id.
pub const GROUP_PLAY_PULL: u8 = 0x2b;
/// Flow-level abort marker queued right before GROUP_BEGIN.
pub const ABORT_MARKER: u8 = 0x02;

/// Role of a fragment within a (possibly split) media packet.
#[derive(Clone, Copy, PartialEq, Eq, Debug, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum FragmentMarker {
    /// continuation of a split packet
    Next = 0x20,
    /// last fragment of a split packet
    End = 0x21,
    /// unsplit packet
    Data = 0x22,
    /// first fragment of a split packet
    Start = 0x23,
}

impl FragmentMarker {
    /// Only the leading fragment of a packet carries media type and time.
    pub fn carries_time(self) -> bool {
        matches!(self, FragmentMarker::Data | FragmentMarker::Start)
    }

    /// Split index on the wire is implied zero for DATA and END.
    pub fn carries_split_index(self) -> bool {
        matches!(self, FragmentMarker::Start | FragmentMarker::Next)
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum MediaType {
    /// continuation fragments have no type on the wire
    Empty = 0x00,
    Audio = 0x08,
    Video = 0x09,
    Data = 0x0f,
}

use anyhow::bail;
use std::time::Duration;

/// Largest fragment payload; media packets above this are split into a
/// START / NEXT* / END group.
pub const MAX_PACKET_SIZE: usize = 959;

/// Upper bound on a stored peer availability bitmap; announcements larger
/// than this are truncated.
pub const MAX_FRAGMENT_MAP_SIZE: usize = 1024;

/// Cadence of push-mode assignment rounds on subscribers.
pub const PUSH_DELAY: Duration = Duration::from_millis(2000);

/// Cadence of pull scheduling rounds on subscribers.
pub const PULL_DELAY: Duration = Duration::from_millis(100);

/// Replication parameters of one group media stream.
///
/// The publisher picks these and announces them in its media subscription;
/// subscribers mirror what they receive so the whole mesh agrees on window
/// and cadences.
#[derive(Clone, Debug)]
pub struct GroupMediaConfig {
    /// this side originates the stream: it fragments local media, answers
    /// pulls, and ignores inbound availability announcements
    pub is_publisher: bool,

    /// how much media time the fragment store retains; older fragments are
    /// evicted
    pub window_duration: Duration,

    /// grace added to the window so relay peers can still serve fragments
    /// that fell out of their own playback range
    pub relay_margin: Duration,

    /// cadence of fragments-map gossip
    pub availability_update_period: Duration,

    /// pull deadline, and the minimum age an availability announcement must
    /// reach before its fragments are considered really missing (younger
    /// ones may simply still be in flight)
    pub fetch_period: Duration,

    /// gossip to every peer each round instead of one round-robin peer
    pub availability_send_to_all: bool,

    /// `push_limit + 1` is the maximum number of peers a fragment is pushed
    /// to when it enters the store
    pub push_limit: u8,
}

impl GroupMediaConfig {
    /// Defaults for live distribution: an 8 second window with 2 seconds of
    /// relay margin, gossip every 100 ms, and a 2.5 second pull deadline.
    pub fn default_live(is_publisher: bool) -> GroupMediaConfig {
        GroupMediaConfig {
            is_publisher,
            window_duration: Duration::from_millis(8000),
            relay_margin: Duration::from_millis(2000),
            availability_update_period: Duration::from_millis(100),
            fetch_period: Duration::from_millis(2500),
            availability_send_to_all: false,
            push_limit: 4,
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.window_duration.is_zero() {
            bail!("window duration must not be zero");
        }
        if self.availability_update_period.is_zero() {
            bail!("availability update period must not be zero");
        }
        if self.fetch_period.is_zero() {
            bail!("fetch period must not be zero");
        }
        Ok(())
    }
}

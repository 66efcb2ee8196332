use std::collections::BTreeMap;
use std::ops::Bound::{Excluded, Unbounded};

use crate::group::PeerId;
use crate::util::random::Random;

/// Round-robin cursor over the peer map.
///
/// The cursor anchors on a peer id instead of a map iterator, so peers can
/// be inserted or removed between uses without invalidating it: each step
/// looks the anchor up by id and moves to the next present entry. "End" is
/// the `None` position, between the last and the first entry.
#[derive(Default, Debug)]
pub struct PeerCursor {
    current: Option<PeerId>,
}

impl PeerCursor {
    pub fn new() -> PeerCursor {
        PeerCursor::default()
    }

    pub fn current(&self) -> Option<&PeerId> {
        self.current.as_ref()
    }

    /// Park the cursor at "end".
    pub fn reset(&mut self) {
        self.current = None;
    }

    /// Step through the ring (entries plus the "end" position) until an
    /// entry satisfies `pred`, starting just after the current position and
    /// wrapping at most once. Returns whether a match was found; the cursor
    /// only moves on a match or a full fruitless cycle.
    pub fn advance<V>(
        &mut self,
        peers: &BTreeMap<PeerId, V>,
        ascending: bool,
        pred: impl Fn(&V) -> bool,
    ) -> bool {
        if peers.is_empty() {
            return false;
        }

        // fast path when there is only one peer
        if peers.len() == 1 {
            let (id, value) = peers.iter().next().unwrap();
            if pred(value) {
                self.current = Some(id.clone());
                return true;
            }
            return false;
        }

        let start = self.current.clone();
        let mut pos = self.current.clone();
        for _ in 0..=peers.len() {
            pos = match (&pos, ascending) {
                (None, true) => peers.keys().next().cloned(),
                (Some(k), true) => peers.range((Excluded(k), Unbounded)).next().map(|(k, _)| k.clone()),
                (None, false) => peers.keys().next_back().cloned(),
                (Some(k), false) => peers.range(..k.clone()).next_back().map(|(k, _)| k.clone()),
            };

            if let Some(k) = &pos {
                if pred(&peers[k]) {
                    self.current = pos;
                    return true;
                }
            }
            if pos == start {
                break;
            }
        }
        false
    }

    /// Anchor the cursor on a random entry satisfying `pred` (scanning
    /// forward with wrap-around from a random start). Returns whether one
    /// was found.
    pub fn seed_random<R: Random, V>(
        &mut self,
        peers: &BTreeMap<PeerId, V>,
        pred: impl Fn(&V) -> bool,
    ) -> bool {
        if peers.is_empty() {
            return false;
        }
        let start = R::gen_usize_range(0..peers.len());
        for i in 0..peers.len() {
            let idx = (start + i) % peers.len();
            let (id, value) = peers.iter().nth(idx).unwrap();
            if pred(value) {
                self.current = Some(id.clone());
                return true;
            }
        }
        false
    }
}

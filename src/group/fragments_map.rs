use tracing::warn;

use crate::group::config::MAX_FRAGMENT_MAP_SIZE;

/// A peer's most recent availability announcement: the highest fragment id
/// it holds plus a bitmap of the ids below it.
///
/// Bit `r` of byte `b` stands for id `last - 1 - (8*b + r)`; ids older than
/// the bitmap's reach have scrolled off and count as absent.
#[derive(Default)]
pub struct FragmentsMap {
    last_id: u64,
    bitmap: Vec<u8>,
}

impl FragmentsMap {
    pub fn new() -> FragmentsMap {
        FragmentsMap::default()
    }

    pub fn last_id(&self) -> u64 {
        self.last_id
    }

    pub fn is_empty(&self) -> bool {
        self.last_id == 0
    }

    /// Replace the map with a newer announcement. Staleness (`id` not above
    /// the previous one) is the caller's check.
    pub fn update(&mut self, id: u64, bitmap: &[u8]) {
        self.last_id = id;
        if bitmap.is_empty() {
            return;
        }
        if bitmap.len() > MAX_FRAGMENT_MAP_SIZE {
            warn!(
                "fragments map of {} bytes exceeds the maximum of {}, truncating",
                bitmap.len(),
                MAX_FRAGMENT_MAP_SIZE
            );
        }
        self.bitmap.clear();
        self.bitmap
            .extend_from_slice(&bitmap[..bitmap.len().min(MAX_FRAGMENT_MAP_SIZE)]);
    }

    /// Whether the announcement covers `index` as present.
    pub fn has(&self, index: u64) -> bool {
        if self.last_id == 0 || self.last_id < index {
            return false;
        }
        if self.last_id == index {
            return true;
        }
        let offset = ((self.last_id - index - 1) / 8) as usize;
        let rest = ((self.last_id - index - 1) % 8) as u32;
        if offset >= self.bitmap.len() {
            return false; // scrolled off
        }
        self.bitmap[offset] & (1 << rest) != 0
    }
}

use rand::Rng;
use std::ops::Range;

/// Randomness seam for the schedulers (push-mask rotation, cursor seeding).
/// Static methods so production code stays free of plumbing and tests can
/// substitute a deterministic implementation.
pub trait Random {
    fn gen_u8() -> u8;
    fn gen_usize_range(range: Range<usize>) -> usize;
}

pub struct RngRandom {}
impl Random for RngRandom {
    fn gen_u8() -> u8 {
        rand::thread_rng().gen()
    }

    fn gen_usize_range(range: Range<usize>) -> usize {
        rand::thread_rng().gen_range(range)
    }
}

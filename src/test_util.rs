//! Hand-built doubles shared by the unit tests: a recording band and a
//! recording group observer.

use crate::flow::Band;
use crate::group::group_media::GroupObserver;
use std::sync::{Arc, Mutex};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TestFrame {
    pub writer_id: u64,
    pub with_header: bool,
    pub bytes: Vec<u8>,
    /// index of the packet this frame was flushed in
    pub packet: usize,
}

impl TestFrame {
    /// The fragment's payload, with flags byte and header fields stripped.
    pub fn payload(&self) -> &[u8] {
        fn skip_7bit(bytes: &[u8], idx: &mut usize) -> u64 {
            let mut value = 0u64;
            loop {
                let byte = bytes[*idx];
                *idx += 1;
                value = (value << 7) | (byte & 0x7f) as u64;
                if byte & 0x80 == 0 {
                    return value;
                }
            }
        }

        let flags = self.bytes[0];
        let mut idx = 1;
        if self.with_header {
            let id = skip_7bit(&self.bytes, &mut idx);
            skip_7bit(&self.bytes, &mut idx); // stage
            skip_7bit(&self.bytes, &mut idx); // ack gap
            if flags & 0x80 != 0 {
                let sig_len = self.bytes[idx] as usize;
                idx += 1 + sig_len;
                if id > 2 {
                    let trailer_len = self.bytes[idx] as usize;
                    idx += 1 + trailer_len;
                }
                idx += 1; // end-of-header marker
            }
        }
        &self.bytes[idx..]
    }
}

#[derive(Default)]
struct TestBandInner {
    budget: usize,
    used: usize,
    frames: Vec<TestFrame>,
    packets_flushed: usize,
    last_writer: Option<u64>,
}

/// A band double recording every frame written through it. Clones share the
/// same recording, so a handle can be moved into a `PeerMedia` while the
/// test keeps another for assertions.
#[derive(Clone)]
pub struct TestBand {
    inner: Arc<Mutex<TestBandInner>>,
}

impl TestBand {
    pub fn new(budget: usize) -> TestBand {
        TestBand {
            inner: Arc::new(Mutex::new(TestBandInner {
                budget,
                ..TestBandInner::default()
            })),
        }
    }

    pub fn handle(&self) -> TestBand {
        self.clone()
    }

    pub fn frames(&self) -> Vec<TestFrame> {
        self.inner.lock().unwrap().frames.clone()
    }

    /// Frames whose first payload byte matches `opcode`.
    pub fn frames_with_opcode(&self, opcode: u8) -> Vec<TestFrame> {
        self.frames()
            .into_iter()
            .filter(|f| f.payload().first() == Some(&opcode))
            .collect()
    }

    pub fn packets_flushed(&self) -> usize {
        self.inner.lock().unwrap().packets_flushed
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.frames.clear();
        inner.used = 0;
        inner.packets_flushed = 0;
        inner.last_writer = None;
    }
}

impl Band for TestBand {
    fn available_to_write(&self) -> usize {
        let inner = self.inner.lock().unwrap();
        inner.budget.saturating_sub(inner.used)
    }

    fn can_write_following(&self, writer_id: u64) -> bool {
        self.inner.lock().unwrap().last_writer == Some(writer_id)
    }

    fn write_frame(&mut self, writer_id: u64, with_header: bool, frame: &[u8]) {
        let mut inner = self.inner.lock().unwrap();
        assert!(
            frame.len() <= inner.budget.saturating_sub(inner.used),
            "writer {} exceeded the packet budget",
            writer_id
        );
        let packet = inner.packets_flushed;
        inner.used += frame.len();
        inner.last_writer = Some(writer_id);
        inner.frames.push(TestFrame {
            writer_id,
            with_header,
            bytes: frame.to_vec(),
            packet,
        });
    }

    fn flush(&mut self) {
        let mut inner = self.inner.lock().unwrap();
        if inner.used > 0 {
            inner.packets_flushed += 1;
            inner.used = 0;
        }
        inner.last_writer = None;
    }
}

/// Records everything the engine emits upward.
#[derive(Default)]
pub struct RecordingObserver {
    pub packets: Vec<(u32, Vec<u8>, bool)>,
}

impl GroupObserver for RecordingObserver {
    fn on_group_packet(&mut self, time: u32, payload: &[u8], is_audio: bool) {
        self.packets.push((time, payload.to_vec(), is_audio));
    }
}

/// Deterministic stand-in for the `Random` seam: always picks the first
/// choice.
pub struct StubRandom;
impl crate::util::random::Random for StubRandom {
    fn gen_u8() -> u8 {
        0
    }

    fn gen_usize_range(range: std::ops::Range<usize>) -> usize {
        range.start
    }
}

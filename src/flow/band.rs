/// Abstraction of the outbound half of one peer connection, introduced to
/// keep the engine independent of datagram framing and to facilitate mocking
/// the I/O part away for testing.
///
/// A band assembles one outbound packet at a time. Writers append *flow
/// fragments* (already serialized, flags byte included) and the band reports
/// how many bytes the current packet still accepts. `flush` finalizes and
/// hands the packet to the socket layer below; afterwards the band must
/// offer budget for at least a maximal fragment header plus the minimum
/// fragmentation size (62 bytes) again.
#[cfg_attr(test, mockall::automock)]
pub trait Band: Send {
    /// Bytes the current outbound packet still accepts.
    fn available_to_write(&self) -> usize;

    /// True iff the last frame written into the current packet belongs to
    /// `writer_id`, so the next frame may elide its header.
    fn can_write_following(&self, writer_id: u64) -> bool;

    /// Append one flow fragment to the current packet. `with_header` tells
    /// the band whether the frame opens a new message chain (distinct frame
    /// kind on the wire) or follows the previous frame of the same writer.
    fn write_frame(&mut self, writer_id: u64, with_header: bool, frame: &[u8]);

    /// Finalize and send the current packet, if any.
    fn flush(&mut self);
}

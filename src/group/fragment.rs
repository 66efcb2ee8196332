use anyhow::bail;
use bytes::{BufMut, Bytes, BytesMut};
use bytes_varint::try_get_fixed::TryGetFixedSupport;

use crate::util::buf::{put_u64_7bit, seven_bit_len, try_get_u64_7bit};
use crate::wire::{FragmentMarker, MediaType};

/// One piece of a media packet, kept in its serialized wire form.
///
/// The buffer holds the complete fragment encoding (marker, 7-bit-long id,
/// optional split index, optional type + time, payload); `payload_offset`
/// remembers where the payload starts so ordered delivery can emit it
/// without re-copying.
pub struct Fragment {
    buffer: Bytes,
    payload_offset: usize,
    pub time: u32,
    pub media_type: MediaType,
    pub marker: FragmentMarker,
    pub split_index: u8,
}

impl Fragment {
    pub fn new(
        marker: FragmentMarker,
        id: u64,
        split_index: u8,
        media_type: MediaType,
        time: u32,
        payload: &[u8],
    ) -> Fragment {
        let mut buf = BytesMut::with_capacity(
            1 + seven_bit_len(id)
                + usize::from(split_index > 0)
                + if marker.carries_time() { 5 } else { 0 }
                + payload.len(),
        );
        buf.put_u8(marker.into());
        put_u64_7bit(&mut buf, id);
        if split_index > 0 {
            buf.put_u8(split_index);
        }
        if marker.carries_time() {
            buf.put_u8(media_type.into());
            buf.put_u32(time);
        }
        let payload_offset = buf.len();
        buf.put_slice(payload);

        Fragment {
            buffer: buf.freeze(),
            payload_offset,
            time,
            media_type,
            marker,
            split_index,
        }
    }

    /// The complete wire encoding, as sent to peers.
    pub fn bytes(&self) -> Bytes {
        self.buffer.clone()
    }

    pub fn payload(&self) -> &[u8] {
        &self.buffer[self.payload_offset..]
    }

    pub fn payload_len(&self) -> usize {
        self.buffer.len() - self.payload_offset
    }
}

/// A fragment as decoded from a media-flow message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ParsedFragment {
    pub marker: FragmentMarker,
    pub id: u64,
    pub split_index: u8,
    pub media_type: MediaType,
    pub time: u32,
    pub payload: Bytes,
}

impl ParsedFragment {
    /// Decode one fragment. The split index is only on the wire for START
    /// and NEXT fragments (DATA and END imply zero), type and time only for
    /// DATA and START.
    pub fn decode(buf: &mut Bytes) -> anyhow::Result<ParsedFragment> {
        let marker_byte = TryGetFixedSupport::try_get_u8(buf)?;
        let Ok(marker) = FragmentMarker::try_from(marker_byte) else {
            bail!("unknown fragment marker 0x{:02x}", marker_byte);
        };
        let id = try_get_u64_7bit(buf)?;
        if id == 0 {
            bail!("fragment id 0 is reserved");
        }

        let split_index = if marker.carries_split_index() {
            let split = TryGetFixedSupport::try_get_u8(buf)?;
            if split == 0 {
                bail!("split fragment with split index 0");
            }
            split
        } else {
            0
        };

        let (media_type, time) = if marker.carries_time() {
            let type_byte = TryGetFixedSupport::try_get_u8(buf)?;
            let Ok(media_type) = MediaType::try_from(type_byte) else {
                bail!("unknown media type 0x{:02x}", type_byte);
            };
            (media_type, TryGetFixedSupport::try_get_u32(buf)?)
        } else {
            (MediaType::Empty, 0)
        };

        Ok(ParsedFragment {
            marker,
            id,
            split_index,
            media_type,
            time,
            payload: std::mem::take(buf),
        })
    }
}

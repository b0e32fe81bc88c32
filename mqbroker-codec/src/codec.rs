use bytes::{Buf, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::{DecodeError, EncodeError};
use crate::packet::Packet;
use crate::types::FixedHeader;
use crate::utils::decode_variable_length;
use crate::{decode, encode};

/// Framing for MQTT v3.1 / v3.1.1 control packets.
///
/// Decoding happens in two steps: first the fixed header, which is remembered
/// until the whole body has arrived, then the body itself.
#[derive(Debug, Clone, Default)]
pub struct Codec {
    pending: Option<FixedHeader>,
    /// inbound body limit in bytes, 0 disables the check
    max_size: u32,
}

impl Codec {
    pub fn new(max_packet_size: u32) -> Self {
        Codec { pending: None, max_size: max_packet_size }
    }

    pub fn set_max_size(&mut self, size: u32) {
        self.max_size = size;
    }

    pub fn max_size(&self) -> u32 {
        self.max_size
    }

    fn read_header(&self, src: &mut BytesMut) -> Result<Option<FixedHeader>, DecodeError> {
        let Some(&first_byte) = src.first() else {
            return Ok(None);
        };
        let Some((remaining_length, n)) = decode_variable_length(&src[1..])? else {
            return Ok(None);
        };
        if self.max_size > 0 && remaining_length > self.max_size {
            return Err(DecodeError::MaxSizeExceeded);
        }
        src.advance(1 + n);
        Ok(Some(FixedHeader { first_byte, remaining_length }))
    }
}

impl Decoder for Codec {
    type Item = (Packet, u32);
    type Error = DecodeError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, DecodeError> {
        let header = match self.pending.take() {
            Some(h) => h,
            None => match self.read_header(src)? {
                Some(h) => h,
                None => return Ok(None),
            },
        };

        let len = header.remaining_length as usize;
        if src.len() < len {
            src.reserve(len - src.len());
            self.pending = Some(header);
            return Ok(None);
        }

        let body = src.split_to(len).freeze();
        let packet = decode::decode_packet(body, header.first_byte)?;
        Ok(Some((packet, header.remaining_length)))
    }
}

impl Encoder<Packet> for Codec {
    type Error = EncodeError;

    fn encode(&mut self, item: Packet, dst: &mut BytesMut) -> Result<(), EncodeError> {
        encode::encode_packet(&item, dst)
    }
}

#[cfg(test)]
mod tests {
    use std::num::NonZeroU16;

    use bytes::Bytes;

    use super::*;
    use crate::types::{Publish, QoS};

    #[test]
    fn test_rejects_oversized_body_from_header() {
        let mut codec = Codec::new(16);
        assert_eq!(codec.max_size(), 16);
        let mut buf = BytesMut::from(&b"\x30\x11"[..]);
        assert!(matches!(codec.decode(&mut buf), Err(DecodeError::MaxSizeExceeded)));

        codec.set_max_size(0);
        let mut buf = BytesMut::from(&b"\x30\x11"[..]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_body_split_across_reads() {
        let mut codec = Codec::default();
        let mut p = Publish::new("big/one", QoS::ExactlyOnce, Bytes::from(vec![b'z'; 70_000]));
        p.packet_id = NonZeroU16::new(77);

        let mut wire = BytesMut::new();
        codec.encode(Packet::Publish(p.clone()), &mut wire).unwrap();
        let total = wire.len();

        let mut buf = BytesMut::new();
        let mut decoded = None;
        for chunk in wire.chunks(4096) {
            buf.extend_from_slice(chunk);
            if let Some(item) = codec.decode(&mut buf).unwrap() {
                decoded = Some(item);
            }
        }
        let (packet, len) = decoded.unwrap();
        assert_eq!(packet, Packet::Publish(p));
        assert_eq!(len as usize, total - 4);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_header_byte_at_a_time() {
        let mut codec = Codec::default();
        let mut buf = BytesMut::new();
        for b in b"\x62\x02\x00\x2a" {
            assert!(codec.decode(&mut buf).unwrap().is_none());
            buf.extend_from_slice(&[*b]);
        }
        buf.extend_from_slice(b"\xd0\x00");

        let (p, len) = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(p, Packet::PublishRelease { packet_id: NonZeroU16::new(42).unwrap() });
        assert_eq!(len, 2);
        assert_eq!(codec.decode(&mut buf).unwrap().unwrap().0, Packet::PingResponse);
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_reserved_packet_types() {
        for first in [0x00u8, 0xf0] {
            let mut buf = BytesMut::from(&[first, 0][..]);
            assert!(matches!(Codec::default().decode(&mut buf), Err(DecodeError::UnsupportedPacketType)));
        }
    }
}

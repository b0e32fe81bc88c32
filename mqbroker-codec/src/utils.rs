use std::num::NonZeroU16;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use bytestring::ByteString;

use crate::error::{DecodeError, EncodeError};
use crate::types::MAX_REMAINING_LENGTH;

/// Returns `$err` from the enclosing function unless `$cond` holds.
macro_rules! ensure {
    ($cond:expr, $err:expr) => {
        if !($cond) {
            return Err($err);
        }
    };
}

/// Declares a `u8` backed enum together with a checked `TryFrom<u8>`; unknown
/// values decode as `MalformedPacket`.
macro_rules! prim_enum {
    (
        $( #[$meta:meta] )*
        pub enum $name:ident {
            $( $( #[$vmeta:meta] )* $variant:ident = $value:expr ),+ $(,)?
        }
    ) => {
        $( #[$meta] )*
        #[repr(u8)]
        #[derive(Debug, Eq, PartialEq, Copy, Clone)]
        pub enum $name {
            $( $( #[$vmeta] )* $variant = $value ),+
        }

        impl std::convert::TryFrom<u8> for $name {
            type Error = $crate::error::DecodeError;

            fn try_from(byte: u8) -> Result<Self, Self::Error> {
                $( if byte == $value { return Ok($name::$variant); } )+
                Err($crate::error::DecodeError::MalformedPacket)
            }
        }
    };
}

/// Reads a value from the front of a packet body, advancing it.
pub(crate) trait Decode: Sized {
    fn decode(src: &mut Bytes) -> Result<Self, DecodeError>;
}

impl Decode for u16 {
    fn decode(src: &mut Bytes) -> Result<Self, DecodeError> {
        if src.remaining() < 2 {
            return Err(DecodeError::InvalidLength);
        }
        Ok(src.get_u16())
    }
}

impl Decode for NonZeroU16 {
    fn decode(src: &mut Bytes) -> Result<Self, DecodeError> {
        let id = u16::decode(src)?;
        NonZeroU16::new(id).ok_or(DecodeError::MalformedPacket)
    }
}

/// Two byte big-endian length followed by that many bytes.
impl Decode for Bytes {
    fn decode(src: &mut Bytes) -> Result<Self, DecodeError> {
        let n = usize::from(u16::decode(src)?);
        if n > src.len() {
            return Err(DecodeError::InvalidLength);
        }
        Ok(src.split_to(n))
    }
}

impl Decode for ByteString {
    fn decode(src: &mut Bytes) -> Result<Self, DecodeError> {
        let raw = Bytes::decode(src)?;
        raw.try_into().map_err(|_| DecodeError::Utf8Error)
    }
}

/// Parses the remaining-length field at the start of `src` into
/// `(value, bytes used)`.
///
/// `Ok(None)` means more bytes are needed. The field is at most four bytes long.
pub(crate) fn decode_variable_length(src: &[u8]) -> Result<Option<(u32, usize)>, DecodeError> {
    let mut value = 0u32;
    for (i, byte) in src.iter().take(4).enumerate() {
        value += u32::from(byte & 0x7f) << (7 * i);
        if byte & 0x80 == 0 {
            return Ok(Some((value, i + 1)));
        }
    }
    if src.len() >= 4 {
        Err(DecodeError::InvalidLength)
    } else {
        Ok(None)
    }
}

pub(crate) fn write_variable_length(len: u32, dst: &mut BytesMut) -> Result<(), EncodeError> {
    if len > MAX_REMAINING_LENGTH {
        return Err(EncodeError::InvalidLength);
    }
    let mut rest = len;
    loop {
        let digit = (rest % 128) as u8;
        rest /= 128;
        if rest == 0 {
            dst.put_u8(digit);
            return Ok(());
        }
        dst.put_u8(digit | 0x80);
    }
}

/// Writes a value into an outgoing packet body.
pub(crate) trait Encode {
    fn encoded_size(&self) -> usize;

    fn encode(&self, buf: &mut BytesMut) -> Result<(), EncodeError>;
}

impl Encode for u16 {
    fn encoded_size(&self) -> usize {
        2
    }

    fn encode(&self, buf: &mut BytesMut) -> Result<(), EncodeError> {
        buf.put_u16(*self);
        Ok(())
    }
}

impl Encode for NonZeroU16 {
    fn encoded_size(&self) -> usize {
        2
    }

    fn encode(&self, buf: &mut BytesMut) -> Result<(), EncodeError> {
        buf.put_u16(self.get());
        Ok(())
    }
}

fn write_prefixed(data: &[u8], buf: &mut BytesMut) -> Result<(), EncodeError> {
    let n = u16::try_from(data.len()).map_err(|_| EncodeError::InvalidLength)?;
    buf.put_u16(n);
    buf.put_slice(data);
    Ok(())
}

impl Encode for &[u8] {
    fn encoded_size(&self) -> usize {
        self.len() + 2
    }

    fn encode(&self, buf: &mut BytesMut) -> Result<(), EncodeError> {
        write_prefixed(self, buf)
    }
}

impl Encode for Bytes {
    fn encoded_size(&self) -> usize {
        self.len() + 2
    }

    fn encode(&self, buf: &mut BytesMut) -> Result<(), EncodeError> {
        write_prefixed(self, buf)
    }
}

impl Encode for ByteString {
    fn encoded_size(&self) -> usize {
        self.len() + 2
    }

    fn encode(&self, buf: &mut BytesMut) -> Result<(), EncodeError> {
        write_prefixed(self.as_bytes(), buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remaining_length_boundaries() {
        let cases: [(&[u8], u32); 6] = [
            (b"\x00", 0),
            (b"\x7f", 127),
            (b"\x80\x01", 128),
            (b"\xff\x7f", 16_383),
            (b"\x80\x80\x01", 16_384),
            (b"\xff\xff\xff\x7f", MAX_REMAINING_LENGTH),
        ];
        let mut out = BytesMut::new();
        for (wire, value) in cases {
            assert_eq!(decode_variable_length(wire).unwrap(), Some((value, wire.len())));
            out.clear();
            write_variable_length(value, &mut out).unwrap();
            assert_eq!(&out[..], wire);
        }
        // trailing bytes belong to the body
        assert_eq!(decode_variable_length(b"\x05\x00\x01").unwrap(), Some((5, 1)));
    }

    #[test]
    fn test_remaining_length_incomplete_or_too_long() {
        assert_eq!(decode_variable_length(b"").unwrap(), None);
        assert_eq!(decode_variable_length(b"\x80\x80").unwrap(), None);
        assert!(matches!(decode_variable_length(b"\x80\x80\x80\x80"), Err(DecodeError::InvalidLength)));
        assert!(matches!(decode_variable_length(b"\xff\xff\xff\xff\x7f"), Err(DecodeError::InvalidLength)));

        let mut out = BytesMut::new();
        assert!(matches!(
            write_variable_length(MAX_REMAINING_LENGTH + 1, &mut out),
            Err(EncodeError::InvalidLength)
        ));
    }

    #[test]
    fn test_length_prefixed_fields() {
        let mut src = Bytes::from_static(b"\x00\x02hi\x00\x09short");
        assert_eq!(ByteString::decode(&mut src).unwrap(), "hi");
        assert!(matches!(Bytes::decode(&mut src), Err(DecodeError::InvalidLength)));

        let mut invalid = Bytes::from_static(b"\x00\x01\xff");
        assert!(matches!(ByteString::decode(&mut invalid), Err(DecodeError::Utf8Error)));

        let mut zero_id = Bytes::from_static(b"\x00\x00");
        assert!(matches!(NonZeroU16::decode(&mut zero_id), Err(DecodeError::MalformedPacket)));

        let mut buf = BytesMut::new();
        ByteString::from_static("a/b").encode(&mut buf).unwrap();
        assert_eq!(&buf[..], b"\x00\x03a/b");
        let long = vec![0u8; 70_000];
        assert!(matches!(long.as_slice().encode(&mut buf), Err(EncodeError::InvalidLength)));
    }
}

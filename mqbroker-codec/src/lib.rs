#![deny(unsafe_code)]

//! MQTT v3.1 / v3.1.1 wire codec.
//!
//! Every control packet is a one byte type/flags header, a base-128 varint
//! "remaining length" of at most four bytes, then a variable header and payload
//! whose layout depends on the packet type. [`Codec`] plugs into
//! `tokio_util::codec::Framed` and yields `(Packet, remaining_length)` pairs.
//!
//! ```
//! use bytes::BytesMut;
//! use mqbroker_codec::{Codec, Packet};
//! use tokio_util::codec::{Decoder, Encoder};
//!
//! let mut codec = Codec::new(1024 * 1024);
//! let mut buf = BytesMut::new();
//! codec.encode(Packet::PingRequest, &mut buf).unwrap();
//! assert_eq!(&buf[..], b"\xc0\x00");
//! let (packet, _) = codec.decode(&mut buf).unwrap().unwrap();
//! assert_eq!(packet, Packet::PingRequest);
//! ```

#[macro_use]
mod utils;

mod codec;
mod decode;
mod encode;
mod packet;

/// Error types for encoding/decoding operations
pub mod error;

/// Shared types and constants
pub mod types;

pub use self::codec::Codec;
pub use self::packet::{Connect, ConnectAck, ConnectAckReason, LastWill, Packet, SubscribeReturnCode};
pub use self::types::{ConnectAckFlags, ConnectFlags, Protocol, Publish, QoS};

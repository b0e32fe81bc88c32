use std::fmt;
use std::num::NonZeroU16;

use bytes::Bytes;
use bytestring::ByteString;
use serde::{Deserialize, Serialize};

/// Protocol names accepted in CONNECT, v3.1.1 and v3.1 respectively.
pub(crate) const MQTT: &[u8] = b"MQTT";
pub(crate) const MQISDP: &[u8] = b"MQIsdp";

pub const MQTT_LEVEL_31: u8 = 3;
pub const MQTT_LEVEL_311: u8 = 4;

/// Bit offset of the will QoS inside the CONNECT flags byte.
pub(crate) const WILL_QOS_SHIFT: u8 = 3;

/// Largest value the four byte remaining-length field can carry.
pub const MAX_REMAINING_LENGTH: u32 = 268_435_455;

/// Protocol level announced by the client in CONNECT.
///
/// The decoder keeps whatever level byte the client sent, so the handshake can
/// answer an unknown level with `UnacceptableProtocolVersion` instead of
/// dropping the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Protocol(pub u8);

impl Protocol {
    /// Protocol name written on the wire for this level.
    pub fn name(self) -> &'static str {
        if self.0 == MQTT_LEVEL_31 {
            "MQIsdp"
        } else {
            "MQTT"
        }
    }

    #[inline]
    pub fn level(self) -> u8 {
        self.0
    }

    #[inline]
    pub fn is_supported(self) -> bool {
        self.0 == MQTT_LEVEL_31 || self.0 == MQTT_LEVEL_311
    }
}

impl Default for Protocol {
    fn default() -> Self {
        Self(MQTT_LEVEL_311)
    }
}

prim_enum! {
    /// Quality of Service
    #[derive(Serialize, Deserialize, PartialOrd, Ord, Hash)]
    pub enum QoS {
        /// fire and forget
        AtMostOnce = 0,
        /// PUBACK
        AtLeastOnce = 1,
        /// PUBREC, PUBREL, PUBCOMP
        ExactlyOnce = 2
    }
}

impl QoS {
    #[inline]
    pub fn value(self) -> u8 {
        self as u8
    }

    /// Level actually used when a message published at `self` is delivered
    /// through a subscription granted at `granted`.
    #[inline]
    pub fn downgrade(self, granted: QoS) -> QoS {
        self.min(granted)
    }
}

impl From<QoS> for u8 {
    fn from(q: QoS) -> u8 {
        q.value()
    }
}

bitflags::bitflags! {
    /// CONNECT flags byte, bit 0 is reserved.
    #[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
    pub struct ConnectFlags: u8 {
        const CLEAN_SESSION = 1 << 1;
        const WILL          = 1 << 2;
        const WILL_QOS      = 0b11 << 3;
        const WILL_RETAIN   = 1 << 5;
        const PASSWORD      = 1 << 6;
        const USERNAME      = 1 << 7;
    }
}

bitflags::bitflags! {
    /// CONNACK acknowledge flags, only bit 0 is defined.
    #[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
    pub struct ConnectAckFlags: u8 {
        const SESSION_PRESENT = 1;
    }
}

/// First byte of each fixed header: type in the high nibble, and for
/// PUBREL / SUBSCRIBE / UNSUBSCRIBE the mandatory `0010` flags.
pub(crate) mod packet_type {
    const fn header(kind: u8, flags: u8) -> u8 {
        (kind << 4) | flags
    }

    pub(crate) const CONNECT: u8 = header(1, 0);
    pub(crate) const CONNACK: u8 = header(2, 0);
    pub(crate) const PUBLISH_START: u8 = header(3, 0);
    pub(crate) const PUBLISH_END: u8 = header(3, 0xf);
    pub(crate) const PUBACK: u8 = header(4, 0);
    pub(crate) const PUBREC: u8 = header(5, 0);
    pub(crate) const PUBREL: u8 = header(6, 2);
    pub(crate) const PUBCOMP: u8 = header(7, 0);
    pub(crate) const SUBSCRIBE: u8 = header(8, 2);
    pub(crate) const SUBACK: u8 = header(9, 0);
    pub(crate) const UNSUBSCRIBE: u8 = header(10, 2);
    pub(crate) const UNSUBACK: u8 = header(11, 0);
    pub(crate) const PINGREQ: u8 = header(12, 0);
    pub(crate) const PINGRESP: u8 = header(13, 0);
    pub(crate) const DISCONNECT: u8 = header(14, 0);
}

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub(crate) struct FixedHeader {
    pub(crate) first_byte: u8,
    /// bytes of variable header plus payload
    pub(crate) remaining_length: u32,
}

/// Application message as carried by a PUBLISH packet.
#[derive(Serialize, Deserialize, PartialEq, Eq, Clone)]
pub struct Publish {
    /// set on re-delivery of an unacknowledged message
    pub dup: bool,
    pub retain: bool,
    pub qos: QoS,
    pub topic: ByteString,
    /// present only for QoS 1 and 2
    pub packet_id: Option<NonZeroU16>,
    pub payload: Bytes,
}

impl Publish {
    pub fn new<T: Into<ByteString>>(topic: T, qos: QoS, payload: Bytes) -> Self {
        Publish { dup: false, retain: false, qos, topic: topic.into(), packet_id: None, payload }
    }
}

impl fmt::Debug for Publish {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Publish {{ topic: {:?}, qos: {:?}, id: {:?}, dup: {}, retain: {}, payload: {}B }}",
            self.topic,
            self.qos,
            self.packet_id,
            self.dup,
            self.retain,
            self.payload.len()
        )
    }
}

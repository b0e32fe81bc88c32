use std::num::NonZeroU16;

use bytes::{Buf, Bytes};
use bytestring::ByteString;

use crate::error::DecodeError;
use crate::packet::{Connect, ConnectAck, LastWill, Packet, SubscribeReturnCode};
use crate::types::{packet_type, ConnectAckFlags, ConnectFlags, Protocol, Publish, QoS, MQISDP, MQTT, WILL_QOS_SHIFT};
use crate::utils::Decode;

/// Decodes the body of one packet. `first_byte` is the fixed header byte,
/// i.e. the packet type in the high nibble and its flags in the low one.
pub(crate) fn decode_packet(mut src: Bytes, first_byte: u8) -> Result<Packet, DecodeError> {
    let packet = match first_byte {
        packet_type::PUBLISH_START..=packet_type::PUBLISH_END => {
            return Ok(Packet::Publish(decode_publish(&mut src, first_byte & 0x0f)?))
        }
        packet_type::CONNECT => Packet::Connect(Box::new(Connect::decode(&mut src)?)),
        packet_type::CONNACK => Packet::ConnectAck(ConnectAck::decode(&mut src)?),
        packet_type::PUBACK => Packet::PublishAck { packet_id: NonZeroU16::decode(&mut src)? },
        packet_type::PUBREC => Packet::PublishReceived { packet_id: NonZeroU16::decode(&mut src)? },
        packet_type::PUBREL => Packet::PublishRelease { packet_id: NonZeroU16::decode(&mut src)? },
        packet_type::PUBCOMP => Packet::PublishComplete { packet_id: NonZeroU16::decode(&mut src)? },
        packet_type::UNSUBACK => Packet::UnsubscribeAck { packet_id: NonZeroU16::decode(&mut src)? },
        packet_type::SUBSCRIBE => {
            let packet_id = NonZeroU16::decode(&mut src)?;
            let mut topic_filters = Vec::new();
            while src.has_remaining() {
                let filter = ByteString::decode(&mut src)?;
                ensure!(src.has_remaining(), DecodeError::InvalidLength);
                // requested QoS, the other bits are reserved
                let options = src.get_u8();
                ensure!(options >> 2 == 0, DecodeError::MalformedPacket);
                topic_filters.push((filter, QoS::try_from(options)?));
            }
            ensure!(!topic_filters.is_empty(), DecodeError::MalformedPacket);
            Packet::Subscribe { packet_id, topic_filters }
        }
        packet_type::SUBACK => {
            let packet_id = NonZeroU16::decode(&mut src)?;
            let mut status = Vec::with_capacity(src.remaining());
            while src.has_remaining() {
                status.push(SubscribeReturnCode::decode(&mut src)?);
            }
            Packet::SubscribeAck { packet_id, status }
        }
        packet_type::UNSUBSCRIBE => {
            let packet_id = NonZeroU16::decode(&mut src)?;
            let mut topic_filters = Vec::new();
            while src.has_remaining() {
                topic_filters.push(ByteString::decode(&mut src)?);
            }
            ensure!(!topic_filters.is_empty(), DecodeError::MalformedPacket);
            Packet::Unsubscribe { packet_id, topic_filters }
        }
        packet_type::PINGREQ => Packet::PingRequest,
        packet_type::PINGRESP => Packet::PingResponse,
        packet_type::DISCONNECT => Packet::Disconnect,
        _ => return Err(DecodeError::UnsupportedPacketType),
    };
    // everything but PUBLISH has a fully determined body
    ensure!(!src.has_remaining(), DecodeError::InvalidLength);
    Ok(packet)
}

fn decode_publish(src: &mut Bytes, flags: u8) -> Result<Publish, DecodeError> {
    let qos = QoS::try_from((flags >> 1) & 0b11)?;
    let topic = ByteString::decode(src)?;
    let packet_id = match qos {
        QoS::AtMostOnce => None,
        _ => Some(NonZeroU16::decode(src)?),
    };
    Ok(Publish {
        dup: flags & 0b1000 != 0,
        retain: flags & 0b0001 != 0,
        qos,
        topic,
        packet_id,
        payload: src.split_off(0),
    })
}

impl Decode for Connect {
    fn decode(src: &mut Bytes) -> Result<Self, DecodeError> {
        let name = Bytes::decode(src)?;
        ensure!(matches!(name.as_ref(), MQTT | MQISDP), DecodeError::InvalidProtocol);

        ensure!(src.remaining() >= 2, DecodeError::InvalidLength);
        let protocol = Protocol(src.get_u8());
        let flags = ConnectFlags::from_bits(src.get_u8()).ok_or(DecodeError::ConnectReservedFlagSet)?;
        let has_will = flags.contains(ConnectFlags::WILL);
        ensure!(
            has_will || !flags.intersects(ConnectFlags::WILL_QOS | ConnectFlags::WILL_RETAIN),
            DecodeError::MalformedPacket
        );
        ensure!(
            !flags.contains(ConnectFlags::PASSWORD) || flags.contains(ConnectFlags::USERNAME),
            DecodeError::MalformedPacket
        );

        let keep_alive = u16::decode(src)?;
        let client_id = ByteString::decode(src)?;
        let last_will = if has_will {
            let qos = QoS::try_from((flags & ConnectFlags::WILL_QOS).bits() >> WILL_QOS_SHIFT)?;
            Some(LastWill {
                qos,
                retain: flags.contains(ConnectFlags::WILL_RETAIN),
                topic: ByteString::decode(src)?,
                message: Bytes::decode(src)?,
            })
        } else {
            None
        };
        let username = flags.contains(ConnectFlags::USERNAME).then(|| ByteString::decode(src)).transpose()?;
        let password = flags.contains(ConnectFlags::PASSWORD).then(|| Bytes::decode(src)).transpose()?;

        Ok(Connect {
            protocol,
            clean_session: flags.contains(ConnectFlags::CLEAN_SESSION),
            keep_alive,
            client_id,
            last_will,
            username,
            password,
        })
    }
}

impl Decode for ConnectAck {
    fn decode(src: &mut Bytes) -> Result<Self, DecodeError> {
        ensure!(src.remaining() >= 2, DecodeError::InvalidLength);
        let flags = ConnectAckFlags::from_bits(src.get_u8()).ok_or(DecodeError::ConnAckReservedFlagSet)?;
        Ok(ConnectAck {
            session_present: flags.contains(ConnectAckFlags::SESSION_PRESENT),
            return_code: src.get_u8().try_into()?,
        })
    }
}

impl Decode for SubscribeReturnCode {
    fn decode(src: &mut Bytes) -> Result<Self, DecodeError> {
        match src.get_u8() {
            0x80 => Ok(SubscribeReturnCode::Failure),
            code => Ok(SubscribeReturnCode::Success(QoS::try_from(code)?)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::ConnectAckReason;
    use crate::utils::decode_variable_length;

    /// Decodes a complete frame, fixed header included.
    fn decode_frame(frame: &'static [u8]) -> Result<Packet, DecodeError> {
        let (len, consumed) = decode_variable_length(&frame[1..])?.expect("incomplete frame");
        let body = &frame[1 + consumed..];
        assert_eq!(body.len(), len as usize);
        decode_packet(Bytes::from_static(body), frame[0])
    }

    fn pid(v: u16) -> NonZeroU16 {
        NonZeroU16::new(v).unwrap()
    }

    fn connect_body(body: &'static [u8]) -> Result<Connect, DecodeError> {
        Connect::decode(&mut Bytes::from_static(body))
    }

    #[test]
    fn test_decode_connect_packets() {
        let c = connect_body(b"\x00\x04MQTT\x04\x80\x00\x1e\x00\x03dev\x00\x05alice").unwrap();
        assert_eq!(c.protocol, Protocol(4));
        assert!(!c.clean_session);
        assert_eq!(c.keep_alive, 30);
        assert_eq!(c.client_id, "dev");
        assert_eq!(c.username.as_deref(), Some("alice"));
        assert!(c.password.is_none());
        assert!(c.last_will.is_none());

        // MQTT 3.1, clean session, will at QoS 1 without retain
        let c = connect_body(b"\x00\x06MQIsdp\x03\x0e\x00\x00\x00\x01x\x00\x04gone\x00\x03bye").unwrap();
        assert_eq!(c.protocol, Protocol(3));
        assert!(c.clean_session);
        assert_eq!(c.keep_alive, 0);
        assert_eq!(
            c.last_will,
            Some(LastWill {
                qos: QoS::AtLeastOnce,
                retain: false,
                topic: ByteString::from_static("gone"),
                message: Bytes::from_static(b"bye"),
            })
        );

        let p = decode_frame(b"\x10\x10\x00\x04MQTT\x04\x02\x00\x0a\x00\x04node").unwrap();
        assert_eq!(p, Packet::Connect(Box::new(Connect::default().client_id("node").keep_alive(10).clean_session(true))));
    }

    #[test]
    fn test_decode_connect_keeps_unknown_level() {
        let c = connect_body(b"\x00\x04MQTT\x05\x02\x00\x00\x00\x01a").unwrap();
        assert_eq!(c.protocol, Protocol(5));
        assert!(!c.protocol.is_supported());
        assert!(c.clean_session);
    }

    #[test]
    fn test_decode_connect_errors() {
        assert!(matches!(connect_body(b"\x00\x04MQTX\x04\x02\x00\x00\x00\x00"), Err(DecodeError::InvalidProtocol)));
        assert!(matches!(
            connect_body(b"\x00\x04MQTT\x04\x03\x00\x00\x00\x00"),
            Err(DecodeError::ConnectReservedFlagSet)
        ));
        // password flag without username flag
        assert!(matches!(
            connect_body(b"\x00\x04MQTT\x04\x42\x00\x00\x00\x00\x00\x02pw"),
            Err(DecodeError::MalformedPacket)
        ));
        // will retain without will flag
        assert!(matches!(connect_body(b"\x00\x04MQTT\x04\x22\x00\x00\x00\x00"), Err(DecodeError::MalformedPacket)));
        // will QoS 3
        assert!(matches!(
            connect_body(b"\x00\x04MQTT\x04\x1e\x00\x00\x00\x00\x00\x01t\x00\x00"),
            Err(DecodeError::MalformedPacket)
        ));
        // client id longer than the body
        assert!(matches!(connect_body(b"\x00\x04MQTT\x04\x02\x00\x00\x00\x09abc"), Err(DecodeError::InvalidLength)));
        // trailing garbage
        assert!(matches!(
            decode_frame(b"\x10\x0f\x00\x04MQTT\x04\x02\x00\x00\x00\x01a\xff\xff"),
            Err(DecodeError::InvalidLength)
        ));
    }

    #[test]
    fn test_decode_connect_ack_packets() {
        assert_eq!(
            decode_frame(b"\x20\x02\x01\x05").unwrap(),
            Packet::ConnectAck(ConnectAck { session_present: true, return_code: ConnectAckReason::NotAuthorized })
        );
        assert_eq!(
            decode_frame(b"\x20\x02\x00\x00").unwrap(),
            Packet::ConnectAck(ConnectAck {
                session_present: false,
                return_code: ConnectAckReason::ConnectionAccepted
            })
        );
        assert!(matches!(decode_frame(b"\x20\x02\x02\x00"), Err(DecodeError::ConnAckReservedFlagSet)));
        assert!(matches!(decode_frame(b"\x20\x02\x00\x06"), Err(DecodeError::MalformedPacket)));
    }

    #[test]
    fn test_decode_publish_packets() {
        // DUP, QoS 1, RETAIN
        assert_eq!(
            decode_frame(b"\x3b\x0a\x00\x03a/b\x00\x07hot").unwrap(),
            Packet::Publish(Publish {
                dup: true,
                retain: true,
                qos: QoS::AtLeastOnce,
                topic: ByteString::from_static("a/b"),
                packet_id: Some(pid(7)),
                payload: Bytes::from_static(b"hot"),
            })
        );
        // QoS 0 has no packet id, an empty payload is fine
        assert_eq!(
            decode_frame(b"\x30\x05\x00\x03a/b").unwrap(),
            Packet::Publish(Publish::new("a/b", QoS::AtMostOnce, Bytes::new()))
        );
        assert!(matches!(decode_frame(b"\x36\x05\x00\x01t\x00\x01"), Err(DecodeError::MalformedPacket)));
        assert!(matches!(decode_frame(b"\x34\x05\x00\x01t\x00\x00"), Err(DecodeError::MalformedPacket)));
        // QoS 2 without room for a packet id
        assert!(matches!(decode_frame(b"\x34\x03\x00\x01t"), Err(DecodeError::InvalidLength)));
    }

    #[test]
    fn test_decode_ack_packets() {
        assert_eq!(decode_frame(b"\x40\x02\x01\x00").unwrap(), Packet::PublishAck { packet_id: pid(256) });
        assert_eq!(decode_frame(b"\x50\x02\x00\x09").unwrap(), Packet::PublishReceived { packet_id: pid(9) });
        assert_eq!(decode_frame(b"\x62\x02\xff\xff").unwrap(), Packet::PublishRelease { packet_id: pid(u16::MAX) });
        assert_eq!(decode_frame(b"\x70\x02\x00\x01").unwrap(), Packet::PublishComplete { packet_id: pid(1) });
        assert!(matches!(decode_frame(b"\x40\x02\x00\x00"), Err(DecodeError::MalformedPacket)));
        assert!(matches!(decode_frame(b"\x40\x03\x00\x01\x00"), Err(DecodeError::InvalidLength)));
        // PUBREL must carry the 0b0010 flags
        assert!(matches!(decode_frame(b"\x60\x02\x00\x01"), Err(DecodeError::UnsupportedPacketType)));
    }

    #[test]
    fn test_decode_subscribe_packets() {
        assert_eq!(
            decode_frame(b"\x82\x0e\x00\x0a\x00\x03a/#\x02\x00\x03+/b\x00").unwrap(),
            Packet::Subscribe {
                packet_id: pid(10),
                topic_filters: vec![
                    (ByteString::from_static("a/#"), QoS::ExactlyOnce),
                    (ByteString::from_static("+/b"), QoS::AtMostOnce),
                ],
            }
        );
        // no filters
        assert!(matches!(decode_frame(b"\x82\x02\x00\x0a"), Err(DecodeError::MalformedPacket)));
        // reserved option bits
        assert!(matches!(decode_frame(b"\x82\x07\x00\x0a\x00\x02ab\x04"), Err(DecodeError::MalformedPacket)));
        // filter without options byte
        assert!(matches!(decode_frame(b"\x82\x06\x00\x0a\x00\x02ab"), Err(DecodeError::InvalidLength)));

        assert_eq!(
            decode_frame(b"\x90\x05\x00\x0a\x00\x80\x01").unwrap(),
            Packet::SubscribeAck {
                packet_id: pid(10),
                status: vec![
                    SubscribeReturnCode::Success(QoS::AtMostOnce),
                    SubscribeReturnCode::Failure,
                    SubscribeReturnCode::Success(QoS::AtLeastOnce),
                ],
            }
        );

        assert_eq!(
            decode_frame(b"\xa2\x0a\x00\x0b\x00\x03a/#\x00\x01c").unwrap(),
            Packet::Unsubscribe {
                packet_id: pid(11),
                topic_filters: vec![ByteString::from_static("a/#"), ByteString::from_static("c")],
            }
        );
        assert_eq!(decode_frame(b"\xb0\x02\x00\x0b").unwrap(), Packet::UnsubscribeAck { packet_id: pid(11) });
    }

    #[test]
    fn test_decode_control_packets() {
        assert_eq!(decode_frame(b"\xc0\x00").unwrap(), Packet::PingRequest);
        assert_eq!(decode_frame(b"\xd0\x00").unwrap(), Packet::PingResponse);
        assert_eq!(decode_frame(b"\xe0\x00").unwrap(), Packet::Disconnect);
        assert!(matches!(decode_frame(b"\xe0\x01\x00"), Err(DecodeError::InvalidLength)));
        assert!(matches!(decode_packet(Bytes::new(), 0xf0), Err(DecodeError::UnsupportedPacketType)));
        assert!(matches!(decode_packet(Bytes::new(), 0x00), Err(DecodeError::UnsupportedPacketType)));
        // SUBSCRIBE with wrong fixed header flags
        assert!(matches!(decode_packet(Bytes::new(), 0x80), Err(DecodeError::UnsupportedPacketType)));
    }
}

use bytes::{BufMut, BytesMut};

use crate::error::EncodeError;
use crate::packet::{Connect, ConnectAck, LastWill, Packet, SubscribeReturnCode};
use crate::types::{packet_type, ConnectFlags, Publish, QoS, WILL_QOS_SHIFT};
use crate::utils::{write_variable_length, Encode};

/// Writes a complete frame, fixed header included, for `packet`.
pub(crate) fn encode_packet(packet: &Packet, dst: &mut BytesMut) -> Result<(), EncodeError> {
    let body_len = body_size(packet);
    let body_len32 = u32::try_from(body_len).map_err(|_| EncodeError::InvalidLength)?;
    dst.reserve(body_len + 5);
    dst.put_u8(first_byte(packet));
    write_variable_length(body_len32, dst)?;
    write_body(packet, dst)
}

fn first_byte(packet: &Packet) -> u8 {
    if let Packet::Publish(p) = packet {
        let mut b = packet_type::PUBLISH_START | (p.qos.value() << 1);
        if p.dup {
            b |= 0b1000;
        }
        if p.retain {
            b |= 0b0001;
        }
        b
    } else {
        packet.packet_type()
    }
}

fn body_size(packet: &Packet) -> usize {
    match packet {
        Packet::Connect(c) => c.encoded_size(),
        Packet::ConnectAck(ack) => ack.encoded_size(),
        Packet::Publish(p) => p.encoded_size(),
        Packet::Subscribe { topic_filters, .. } => {
            topic_filters.iter().fold(2, |n, (f, _)| n + f.encoded_size() + 1)
        }
        Packet::SubscribeAck { status, .. } => 2 + status.len(),
        Packet::Unsubscribe { topic_filters, .. } => {
            topic_filters.iter().fold(2, |n, f| n + f.encoded_size())
        }
        Packet::PublishAck { .. }
        | Packet::PublishReceived { .. }
        | Packet::PublishRelease { .. }
        | Packet::PublishComplete { .. }
        | Packet::UnsubscribeAck { .. } => 2,
        Packet::PingRequest | Packet::PingResponse | Packet::Disconnect => 0,
    }
}

fn write_body(packet: &Packet, dst: &mut BytesMut) -> Result<(), EncodeError> {
    match packet {
        Packet::Connect(c) => c.encode(dst),
        Packet::ConnectAck(ack) => ack.encode(dst),
        Packet::Publish(p) => p.encode(dst),
        Packet::Subscribe { packet_id, topic_filters } => {
            packet_id.encode(dst)?;
            topic_filters.iter().try_for_each(|(f, qos)| {
                f.encode(dst)?;
                dst.put_u8(qos.value());
                Ok(())
            })
        }
        Packet::SubscribeAck { packet_id, status } => {
            packet_id.encode(dst)?;
            dst.extend(status.iter().map(|code| match code {
                SubscribeReturnCode::Success(qos) => qos.value(),
                SubscribeReturnCode::Failure => 0x80,
            }));
            Ok(())
        }
        Packet::Unsubscribe { packet_id, topic_filters } => {
            packet_id.encode(dst)?;
            topic_filters.iter().try_for_each(|f| f.encode(dst))
        }
        Packet::PublishAck { packet_id }
        | Packet::PublishReceived { packet_id }
        | Packet::PublishRelease { packet_id }
        | Packet::PublishComplete { packet_id }
        | Packet::UnsubscribeAck { packet_id } => packet_id.encode(dst),
        Packet::PingRequest | Packet::PingResponse | Packet::Disconnect => Ok(()),
    }
}

impl Encode for ConnectAck {
    fn encoded_size(&self) -> usize {
        2
    }

    fn encode(&self, buf: &mut BytesMut) -> Result<(), EncodeError> {
        buf.put_u8(self.session_present as u8);
        buf.put_u8(self.return_code.into());
        Ok(())
    }
}

impl Encode for Publish {
    fn encoded_size(&self) -> usize {
        let id = if self.qos == QoS::AtMostOnce { 0 } else { 2 };
        self.topic.encoded_size() + id + self.payload.len()
    }

    fn encode(&self, buf: &mut BytesMut) -> Result<(), EncodeError> {
        self.topic.encode(buf)?;
        match self.packet_id {
            Some(_) if self.qos == QoS::AtMostOnce => return Err(EncodeError::MalformedPacket),
            Some(id) => id.encode(buf)?,
            None if self.qos != QoS::AtMostOnce => return Err(EncodeError::PacketIdRequired),
            None => {}
        }
        buf.extend_from_slice(&self.payload);
        Ok(())
    }
}

impl Connect {
    fn flags(&self) -> ConnectFlags {
        let mut flags = ConnectFlags::empty();
        flags.set(ConnectFlags::USERNAME, self.username.is_some());
        flags.set(ConnectFlags::PASSWORD, self.password.is_some());
        flags.set(ConnectFlags::CLEAN_SESSION, self.clean_session);
        if let Some(will) = &self.last_will {
            flags.insert(ConnectFlags::WILL);
            flags.set(ConnectFlags::WILL_RETAIN, will.retain);
            flags |= ConnectFlags::from_bits_truncate(will.qos.value() << WILL_QOS_SHIFT);
        }
        flags
    }
}

impl Encode for Connect {
    fn encoded_size(&self) -> usize {
        // name, level, flags, keep alive
        let header = self.protocol.name().len() + 6;
        let will = self.last_will.as_ref().map_or(0, |w| w.topic.encoded_size() + w.message.encoded_size());
        let credentials = self.username.as_ref().map_or(0, Encode::encoded_size)
            + self.password.as_ref().map_or(0, Encode::encoded_size);
        header + self.client_id.encoded_size() + will + credentials
    }

    fn encode(&self, buf: &mut BytesMut) -> Result<(), EncodeError> {
        self.protocol.name().as_bytes().encode(buf)?;
        buf.put_u8(self.protocol.level());
        buf.put_u8(self.flags().bits());
        self.keep_alive.encode(buf)?;
        self.client_id.encode(buf)?;
        if let Some(LastWill { topic, message, .. }) = &self.last_will {
            topic.encode(buf)?;
            message.encode(buf)?;
        }
        if let Some(name) = &self.username {
            name.encode(buf)?;
        }
        if let Some(pass) = &self.password {
            pass.encode(buf)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::num::NonZeroU16;

    use bytes::Bytes;
    use bytestring::ByteString;

    use super::*;
    use crate::packet::ConnectAckReason;
    use crate::types::Protocol;

    fn pid(v: u16) -> NonZeroU16 {
        NonZeroU16::new(v).unwrap()
    }

    fn frame(packet: Packet) -> Vec<u8> {
        let mut buf = BytesMut::new();
        encode_packet(&packet, &mut buf).unwrap();
        buf.to_vec()
    }

    #[test]
    fn test_encode_connect() {
        let c = Connect::default().client_id("dev-1").keep_alive(30);
        assert_eq!(frame(c.into()), b"\x10\x11\x00\x04MQTT\x04\x00\x00\x1e\x00\x05dev-1".to_vec());

        let mut c = Connect::default().client_id("a").clean_session(true).last_will(LastWill {
            qos: QoS::ExactlyOnce,
            retain: false,
            topic: ByteString::from_static("gone"),
            message: Bytes::from_static(b"x"),
        });
        c.protocol = Protocol(3);
        c.password = Some(Bytes::from_static(b"pw"));
        assert_eq!(
            frame(c.into()),
            b"\x10\x1c\x00\x06MQIsdp\x03\x56\x00\x00\x00\x01a\x00\x04gone\x00\x01x\x00\x02pw".to_vec()
        );
    }

    #[test]
    fn test_encode_publish() {
        let mut p = Publish::new("a/b", QoS::AtLeastOnce, Bytes::from_static(b"hi"));
        p.packet_id = Some(pid(0x0102));
        p.retain = true;
        assert_eq!(frame(p.clone().into()), b"\x33\x09\x00\x03a/b\x01\x02hi".to_vec());

        p.dup = true;
        p.qos = QoS::ExactlyOnce;
        assert_eq!(frame(p.into()), b"\x3d\x09\x00\x03a/b\x01\x02hi".to_vec());

        assert_eq!(frame(Publish::new("t", QoS::AtMostOnce, Bytes::new()).into()), b"\x30\x03\x00\x01t".to_vec());
    }

    #[test]
    fn test_encode_publish_packet_id_mismatch() {
        let mut buf = BytesMut::new();
        let p = Publish::new("t", QoS::ExactlyOnce, Bytes::new());
        assert!(matches!(encode_packet(&p.into(), &mut buf), Err(EncodeError::PacketIdRequired)));

        let mut p = Publish::new("t", QoS::AtMostOnce, Bytes::new());
        p.packet_id = Some(pid(1));
        assert!(matches!(encode_packet(&p.into(), &mut buf), Err(EncodeError::MalformedPacket)));
    }

    #[test]
    fn test_encode_long_remaining_length() {
        let payload = Bytes::from(vec![7u8; 200]);
        let out = frame(Publish::new("x", QoS::AtMostOnce, payload).into());
        // 3 topic bytes + 200 payload bytes = 203 = 0xcb 0x01
        assert_eq!(&out[..3], b"\x30\xcb\x01");
        assert_eq!(out.len(), 3 + 203);
    }

    #[test]
    fn test_encode_acks() {
        let ack = ConnectAck { return_code: ConnectAckReason::NotAuthorized, session_present: false };
        assert_eq!(frame(Packet::ConnectAck(ack)), b"\x20\x02\x00\x05".to_vec());
        let ack = ConnectAck { return_code: ConnectAckReason::ConnectionAccepted, session_present: true };
        assert_eq!(frame(Packet::ConnectAck(ack)), b"\x20\x02\x01\x00".to_vec());

        assert_eq!(frame(Packet::PublishAck { packet_id: pid(300) }), b"\x40\x02\x01\x2c".to_vec());
        assert_eq!(frame(Packet::PublishReceived { packet_id: pid(300) }), b"\x50\x02\x01\x2c".to_vec());
        assert_eq!(frame(Packet::PublishRelease { packet_id: pid(300) }), b"\x62\x02\x01\x2c".to_vec());
        assert_eq!(frame(Packet::PublishComplete { packet_id: pid(300) }), b"\x70\x02\x01\x2c".to_vec());
        assert_eq!(frame(Packet::UnsubscribeAck { packet_id: pid(300) }), b"\xb0\x02\x01\x2c".to_vec());
    }

    #[test]
    fn test_encode_subscriptions() {
        let sub = Packet::Subscribe {
            packet_id: pid(2),
            topic_filters: vec![(ByteString::from_static("s/+"), QoS::ExactlyOnce)],
        };
        assert_eq!(frame(sub), b"\x82\x08\x00\x02\x00\x03s/+\x02".to_vec());

        let suback = Packet::SubscribeAck {
            packet_id: pid(2),
            status: vec![SubscribeReturnCode::Failure, SubscribeReturnCode::Success(QoS::AtMostOnce)],
        };
        assert_eq!(frame(suback), b"\x90\x04\x00\x02\x80\x00".to_vec());

        let unsub = Packet::Unsubscribe {
            packet_id: pid(3),
            topic_filters: vec![ByteString::from_static("#"), ByteString::from_static("a")],
        };
        assert_eq!(frame(unsub), b"\xa2\x08\x00\x03\x00\x01#\x00\x01a".to_vec());
    }

    #[test]
    fn test_encode_empty_bodies() {
        assert_eq!(frame(Packet::PingRequest), vec![0xc0, 0]);
        assert_eq!(frame(Packet::PingResponse), vec![0xd0, 0]);
        assert_eq!(frame(Packet::Disconnect), vec![0xe0, 0]);
    }
}

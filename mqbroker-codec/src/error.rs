use std::io;

/// Why an inbound frame could not be turned into a [`Packet`](crate::Packet).
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("unknown protocol name")]
    InvalidProtocol,
    #[error("remaining length out of range")]
    InvalidLength,
    #[error("malformed packet")]
    MalformedPacket,
    #[error("reserved bit of CONNECT flags is set")]
    ConnectReservedFlagSet,
    #[error("reserved bits of CONNACK flags are set")]
    ConnAckReservedFlagSet,
    #[error("packet type is not supported")]
    UnsupportedPacketType,
    #[error("packet exceeds the max packet size")]
    MaxSizeExceeded,
    #[error("string is not valid utf-8")]
    Utf8Error,
    #[error("io error, {0:?}")]
    Io(#[from] io::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum EncodeError {
    #[error("remaining length out of range")]
    InvalidLength,
    #[error("malformed packet")]
    MalformedPacket,
    /// QoS 1/2 PUBLISH without a packet id
    #[error("packet id is missing")]
    PacketIdRequired,
    #[error("io error, {0:?}")]
    Io(#[from] io::Error),
}

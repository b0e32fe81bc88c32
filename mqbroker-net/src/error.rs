use mqbroker_codec::error::{DecodeError, EncodeError};

#[derive(Debug, thiserror::Error)]
pub enum MqttError {
    #[error("decode error, {0}")]
    Decode(#[from] DecodeError),
    #[error("encode error, {0}")]
    Encode(#[from] EncodeError),
    #[error("read timeout")]
    ReadTimeout,
    #[error("write timeout")]
    WriteTimeout,
    #[error("flush timeout")]
    FlushTimeout,
    #[error("close timeout")]
    CloseTimeout,
    #[error("service unavailable")]
    ServiceUnavailable,
    /// First packet was not CONNECT, or a packet arrived in the wrong state
    #[error("invalid protocol")]
    InvalidProtocol,
    #[error("identifier rejected")]
    IdentifierRejected,
    #[error("unacceptable protocol version, level {0}")]
    UnacceptableProtocolVersion(u8),
    #[error("too many connections, max is {0}")]
    TooManyConnections(usize),
}

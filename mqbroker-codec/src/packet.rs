use std::fmt;
use std::num::NonZeroU16;

use bytes::Bytes;
use bytestring::ByteString;
use serde::{Deserialize, Serialize};

use crate::types::{packet_type, Protocol, Publish, QoS};

prim_enum! {
    /// CONNACK return code.
    #[derive(Deserialize, Serialize)]
    pub enum ConnectAckReason {
        ConnectionAccepted = 0,
        /// level byte is neither 3 nor 4
        UnacceptableProtocolVersion = 1,
        IdentifierRejected = 2,
        ServiceUnavailable = 3,
        BadUserNameOrPassword = 4,
        NotAuthorized = 5
    }
}

impl From<ConnectAckReason> for u8 {
    fn from(code: ConnectAckReason) -> u8 {
        code as u8
    }
}

impl ConnectAckReason {
    #[inline]
    pub fn is_accepted(self) -> bool {
        self == ConnectAckReason::ConnectionAccepted
    }
}

impl fmt::Display for ConnectAckReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            ConnectAckReason::ConnectionAccepted => "accepted",
            ConnectAckReason::UnacceptableProtocolVersion => "refused: unacceptable protocol version",
            ConnectAckReason::IdentifierRejected => "refused: client identifier rejected",
            ConnectAckReason::ServiceUnavailable => "refused: server unavailable",
            ConnectAckReason::BadUserNameOrPassword => "refused: bad username or password",
            ConnectAckReason::NotAuthorized => "refused: not authorized",
        };
        f.write_str(text)
    }
}

/// Message the broker publishes on the client's behalf when the connection
/// ends without a DISCONNECT.
#[derive(Debug, PartialEq, Eq, Clone, Deserialize, Serialize)]
pub struct LastWill {
    pub qos: QoS,
    pub retain: bool,
    pub topic: ByteString,
    pub message: Bytes,
}

#[derive(Default, Debug, PartialEq, Eq, Clone, Deserialize, Serialize)]
pub struct Connect {
    pub protocol: Protocol,
    pub clean_session: bool,
    /// seconds, 0 disables the keep-alive check.
    pub keep_alive: u16,
    pub last_will: Option<LastWill>,
    /// may be empty, in which case the server assigns one for clean sessions.
    pub client_id: ByteString,
    pub username: Option<ByteString>,
    pub password: Option<Bytes>,
}

impl Connect {
    pub fn client_id<T>(mut self, id: T) -> Self
    where
        ByteString: From<T>,
    {
        self.client_id = ByteString::from(id);
        self
    }

    pub fn clean_session(mut self, clean_session: bool) -> Self {
        self.clean_session = clean_session;
        self
    }

    pub fn keep_alive(mut self, secs: u16) -> Self {
        self.keep_alive = secs;
        self
    }

    pub fn last_will(mut self, will: LastWill) -> Self {
        self.last_will = Some(will);
        self
    }
}

#[derive(Debug, PartialEq, Eq, Copy, Clone, Deserialize, Serialize)]
pub struct ConnectAck {
    pub return_code: ConnectAckReason,
    pub session_present: bool,
}

/// Per-filter outcome carried by SUBACK.
#[derive(Debug, PartialEq, Eq, Copy, Clone, Deserialize, Serialize)]
pub enum SubscribeReturnCode {
    /// granted level
    Success(QoS),
    /// encoded as 0x80
    Failure,
}

#[derive(Debug, PartialEq, Eq, Clone)]
pub enum Packet {
    Connect(Box<Connect>),
    ConnectAck(ConnectAck),
    Publish(Publish),
    PublishAck {
        packet_id: NonZeroU16,
    },
    PublishReceived {
        packet_id: NonZeroU16,
    },
    PublishRelease {
        packet_id: NonZeroU16,
    },
    PublishComplete {
        packet_id: NonZeroU16,
    },
    Subscribe {
        packet_id: NonZeroU16,
        topic_filters: Vec<(ByteString, QoS)>,
    },
    SubscribeAck {
        packet_id: NonZeroU16,
        /// one entry per requested filter, in request order.
        status: Vec<SubscribeReturnCode>,
    },
    Unsubscribe {
        packet_id: NonZeroU16,
        topic_filters: Vec<ByteString>,
    },
    UnsubscribeAck {
        packet_id: NonZeroU16,
    },
    PingRequest,
    PingResponse,
    Disconnect,
}

impl From<Connect> for Packet {
    fn from(c: Connect) -> Self {
        Self::Connect(Box::new(c))
    }
}

impl From<Publish> for Packet {
    fn from(p: Publish) -> Self {
        Self::Publish(p)
    }
}

impl Packet {
    /// Fixed header byte with the mandatory flag bits and the control packet name.
    /// PUBLISH flags depend on the message and are filled in by the encoder.
    fn descriptor(&self) -> (u8, &'static str) {
        use packet_type::*;
        match self {
            Self::Connect(_) => (CONNECT, "CONNECT"),
            Self::ConnectAck(_) => (CONNACK, "CONNACK"),
            Self::Publish(_) => (PUBLISH_START, "PUBLISH"),
            Self::PublishAck { .. } => (PUBACK, "PUBACK"),
            Self::PublishReceived { .. } => (PUBREC, "PUBREC"),
            Self::PublishRelease { .. } => (PUBREL, "PUBREL"),
            Self::PublishComplete { .. } => (PUBCOMP, "PUBCOMP"),
            Self::Subscribe { .. } => (SUBSCRIBE, "SUBSCRIBE"),
            Self::SubscribeAck { .. } => (SUBACK, "SUBACK"),
            Self::Unsubscribe { .. } => (UNSUBSCRIBE, "UNSUBSCRIBE"),
            Self::UnsubscribeAck { .. } => (UNSUBACK, "UNSUBACK"),
            Self::PingRequest => (PINGREQ, "PINGREQ"),
            Self::PingResponse => (PINGRESP, "PINGRESP"),
            Self::Disconnect => (DISCONNECT, "DISCONNECT"),
        }
    }

    #[inline]
    pub fn packet_type(&self) -> u8 {
        self.descriptor().0
    }

    #[inline]
    pub fn name(&self) -> &'static str {
        self.descriptor().1
    }
}

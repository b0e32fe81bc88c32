use std::convert::From as _f;
use std::fmt;
use std::net::SocketAddr;
use std::ops::Deref;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytestring::ByteString;
use futures::channel::mpsc;
use serde::Serialize;
use tokio::sync::oneshot;

pub use mqbroker_codec::{Connect, ConnectAckReason, LastWill, Packet, Publish, QoS, SubscribeReturnCode};
pub use mqbroker_utils::TimestampMillis;

use crate::inflight::OutInflightMessage;

pub type DashMap<K, V> = dashmap::DashMap<K, V, ahash::RandomState>;
pub type HashMap<K, V> = std::collections::HashMap<K, V, ahash::RandomState>;

pub type ClientId = ByteString;
pub type UserName = ByteString;
pub type TopicName = ByteString;
///Topic filter, may carry `+` / `#` wildcards
pub type TopicFilter = ByteString;
pub type PacketId = u16;
pub type CleanStart = bool;

pub type Tx = mpsc::UnboundedSender<Message>;
pub type Rx = mpsc::UnboundedReceiver<Message>;

static ID_SEQ: AtomicU64 = AtomicU64::new(1);

/// Identity of one connection of a client.
///
/// Two connections of the same client id never compare equal, even when they
/// come from the same remote address, so a stale task cannot tear down the
/// session of its successor.
#[derive(Clone)]
pub struct Id(Arc<_Id>);

impl Id {
    #[inline]
    pub fn new(
        local_addr: Option<SocketAddr>,
        remote_addr: Option<SocketAddr>,
        client_id: ClientId,
        username: Option<UserName>,
    ) -> Self {
        Self(Arc::new(_Id {
            id: ByteString::from(format!(
                "{}/{}/{}/{}",
                local_addr.map(|addr| addr.to_string()).unwrap_or_default(),
                remote_addr.map(|addr| addr.to_string()).unwrap_or_default(),
                client_id,
                username.as_ref().map(<UserName as AsRef<str>>::as_ref).unwrap_or_default()
            )),
            seq: ID_SEQ.fetch_add(1, Ordering::Relaxed),
            local_addr,
            remote_addr,
            client_id,
            username: username.unwrap_or_else(|| "undefined".into()),
            create_time: chrono::Local::now().timestamp_millis(),
        }))
    }

    #[inline]
    pub fn as_str(&self) -> &str {
        &self.id
    }
}

impl AsRef<str> for Id {
    #[inline]
    fn as_ref(&self) -> &str {
        &self.id
    }
}

impl fmt::Display for Id {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.id)
    }
}

impl fmt::Debug for Id {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.id, self.create_time)
    }
}

impl PartialEq<Id> for Id {
    #[inline]
    fn eq(&self, other: &Id) -> bool {
        self.seq == other.seq && self.id == other.id
    }
}

impl Eq for Id {}

impl std::hash::Hash for Id {
    #[inline]
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl Deref for Id {
    type Target = _Id;
    #[inline]
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl Serialize for Id {
    #[inline]
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        _Id::serialize(self.0.as_ref(), serializer)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct _Id {
    id: ByteString,
    #[serde(skip)]
    seq: u64,
    pub local_addr: Option<SocketAddr>,
    pub remote_addr: Option<SocketAddr>,
    pub client_id: ClientId,
    pub username: UserName,
    pub create_time: TimestampMillis,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum FromType {
    Custom,
    LastWill,
}

impl fmt::Display for FromType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let typ = match self {
            FromType::Custom => "custom",
            FromType::LastWill => "lastwill",
        };
        write!(f, "{}", typ)
    }
}

/// Origin of a message: a client publish, or a will published on the
/// client's behalf.
#[derive(Clone, Serialize)]
pub struct From {
    typ: FromType,
    id: Id,
}

impl From {
    #[inline]
    pub fn from_custom(id: Id) -> From {
        From { typ: FromType::Custom, id }
    }

    #[inline]
    pub fn from_lastwill(id: Id) -> From {
        From { typ: FromType::LastWill, id }
    }

    #[inline]
    pub fn typ(&self) -> FromType {
        self.typ
    }

    #[inline]
    pub fn is_lastwill(&self) -> bool {
        matches!(self.typ, FromType::LastWill)
    }
}

impl Deref for From {
    type Target = Id;
    fn deref(&self) -> &Self::Target {
        &self.id
    }
}

impl fmt::Debug for From {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}-{}", self.id, self.typ)
    }
}

#[derive(Debug, Clone)]
pub struct Retain {
    pub from: From,
    pub publish: Publish,
}

pub type Subscriptions = Vec<(TopicFilter, QoS)>;

/// Everything a session hands over to the connection that takes it over.
#[derive(Debug)]
pub struct OfflineInfo {
    pub id: Id,
    pub subscriptions: Subscriptions,
    pub offline_messages: Vec<(From, Publish)>,
    pub inflight_messages: Vec<OutInflightMessage>,
    pub created_at: TimestampMillis,
}

/// Intents submitted to a session task. The task is the only party that
/// mutates its inflight window and message queue.
#[derive(Debug)]
pub enum Message {
    Forward(From, Publish),
    Kick(oneshot::Sender<OfflineInfo>, Id, CleanStart),
    Close,
}

bitflags::bitflags! {
    #[derive(Copy, Clone, Debug, PartialEq, Eq)]
    pub struct StateFlags: u8 {
        const Kicked = 0b0000_0001;
        const CleanStart = 0b0000_0010;
        const DisconnectReceived = 0b0000_0100;
        const Shutdown = 0b0000_1000;
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Reason {
    #[error("Disconnect")]
    ConnectDisconnect,
    #[error("Kicked")]
    ConnectKicked,
    #[error("KeepaliveTimeout")]
    ConnectKeepaliveTimeout,
    #[error("RemoteClose")]
    ConnectRemoteClose,
    #[error("ProtocolError, {0}")]
    ProtocolError(ByteString),
    #[error("InflightWindowFull")]
    InflightWindowFull,
    #[error("SessionExpiration")]
    SessionExpiration,
    #[error("ServerShutdown")]
    ServerShutdown,
    #[error("{0}")]
    Error(ByteString),
}

impl Reason {
    #[inline]
    pub fn protocol_error<S: Into<ByteString>>(msg: S) -> Self {
        Reason::ProtocolError(msg.into())
    }
}

impl std::convert::From<&str> for Reason {
    #[inline]
    fn from(r: &str) -> Self {
        Reason::Error(ByteString::from(r))
    }
}

impl std::convert::From<String> for Reason {
    #[inline]
    fn from(r: String) -> Self {
        Reason::Error(ByteString::from(r))
    }
}

impl std::convert::From<anyhow::Error> for Reason {
    #[inline]
    fn from(e: anyhow::Error) -> Self {
        Reason::Error(ByteString::from(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_id_identity() {
        let remote: SocketAddr = ([127, 0, 0, 1], 5000).into();
        let a = Id::new(None, Some(remote), "c1".into(), None);
        let b = Id::new(None, Some(remote), "c1".into(), None);
        assert_eq!(a.as_str(), "/127.0.0.1:5000/c1/");
        assert_eq!(a.as_str(), b.as_str());
        assert_ne!(a, b);
        assert_eq!(a, a.clone());
        assert_eq!(a.username, "undefined");
    }

    #[test]
    fn test_reason() {
        assert_eq!(Reason::protocol_error("bad topic").to_string(), "ProtocolError, bad topic");
        assert_eq!(Reason::from(anyhow::anyhow!("io")).to_string(), "io");
        let flags = StateFlags::Kicked | StateFlags::CleanStart;
        assert!(flags.contains(StateFlags::Kicked));
        assert!(!flags.contains(StateFlags::DisconnectReceived));
    }
}

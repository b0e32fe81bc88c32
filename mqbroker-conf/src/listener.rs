use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::num::NonZeroU16;
use std::time::Duration;

use nonzero_ext::nonzero;
use serde::Deserialize;

use mqbroker_utils::{deserialize_duration, Bytesize};

/// The single TCP listener and the per-connection protocol limits applied to
/// every client accepted on it.
#[derive(Debug, Clone, Deserialize)]
pub struct Listener {
    #[serde(default = "Listener::addr_default")]
    pub addr: IpAddr,
    #[serde(default = "Listener::port_default")]
    pub port: u16,
    #[serde(default = "Listener::backlog_default")]
    pub backlog: i32,
    #[serde(default)]
    pub nodelay: bool,
    #[serde(default = "Listener::reuseaddr_default")]
    pub reuseaddr: bool,
    #[serde(default = "Listener::max_connections_default")]
    pub max_connections: usize,
    /// 0 means unlimited
    #[serde(default = "Listener::max_packet_size_default")]
    pub max_packet_size: Bytesize,
    #[serde(default = "Listener::handshake_timeout_default", deserialize_with = "deserialize_duration")]
    pub handshake_timeout: Duration,
    #[serde(default = "Listener::send_timeout_default", deserialize_with = "deserialize_duration")]
    pub send_timeout: Duration,
    #[serde(default = "Listener::max_clientid_len_default")]
    pub max_clientid_len: usize,
    /// keep-alive timeout is `keep_alive * keepalive_backoff * 2`
    #[serde(default = "Listener::keepalive_backoff_default")]
    pub keepalive_backoff: f32,
    #[serde(default = "Listener::max_inflight_default")]
    pub max_inflight: NonZeroU16,
    #[serde(default = "Listener::max_mqueue_len_default")]
    pub max_mqueue_len: usize,
    /// QoS 1/2 resend interval, 0 disables resending
    #[serde(default = "Listener::message_retry_interval_default", deserialize_with = "deserialize_duration")]
    pub message_retry_interval: Duration,
    #[serde(default = "Listener::max_message_retries_default")]
    pub max_message_retries: u32,
    /// How long a persistent session outlives its connection, 0 keeps it forever
    #[serde(default, deserialize_with = "deserialize_duration")]
    pub session_expiry_interval: Duration,
}

impl Default for Listener {
    fn default() -> Self {
        Self {
            addr: Self::addr_default(),
            port: Self::port_default(),
            backlog: Self::backlog_default(),
            nodelay: false,
            reuseaddr: Self::reuseaddr_default(),
            max_connections: Self::max_connections_default(),
            max_packet_size: Self::max_packet_size_default(),
            handshake_timeout: Self::handshake_timeout_default(),
            send_timeout: Self::send_timeout_default(),
            max_clientid_len: Self::max_clientid_len_default(),
            keepalive_backoff: Self::keepalive_backoff_default(),
            max_inflight: Self::max_inflight_default(),
            max_mqueue_len: Self::max_mqueue_len_default(),
            message_retry_interval: Self::message_retry_interval_default(),
            max_message_retries: Self::max_message_retries_default(),
            session_expiry_interval: Duration::ZERO,
        }
    }
}

impl Listener {
    fn addr_default() -> IpAddr {
        IpAddr::V4(Ipv4Addr::UNSPECIFIED)
    }
    fn port_default() -> u16 {
        1883
    }
    fn backlog_default() -> i32 {
        512
    }
    fn reuseaddr_default() -> bool {
        true
    }
    fn max_connections_default() -> usize {
        1_000_000
    }
    fn max_packet_size_default() -> Bytesize {
        Bytesize::from(1024 * 1024)
    }
    fn handshake_timeout_default() -> Duration {
        Duration::from_secs(30)
    }
    fn send_timeout_default() -> Duration {
        Duration::from_secs(10)
    }
    fn max_clientid_len_default() -> usize {
        65535
    }
    fn keepalive_backoff_default() -> f32 {
        0.75
    }
    fn max_inflight_default() -> NonZeroU16 {
        nonzero!(16u16)
    }
    fn max_mqueue_len_default() -> usize {
        1000
    }
    fn message_retry_interval_default() -> Duration {
        Duration::from_secs(20)
    }
    fn max_message_retries_default() -> u32 {
        5
    }

    #[inline]
    pub fn laddr(&self) -> SocketAddr {
        SocketAddr::new(self.addr, self.port)
    }
}

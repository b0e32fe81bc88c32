use std::net::SocketAddr;
use std::num::NonZeroU16;
use std::sync::Arc;
use std::time::Duration;

use nonzero_ext::nonzero;
use socket2::{Domain, SockAddr, Socket, Type};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};

use crate::stream::MqttStream;
use crate::Result;

/// Listener socket options plus the per-connection limits every session
/// accepted on it inherits.
#[derive(Clone, Debug)]
pub struct Builder {
    /// Shown in logs only.
    pub name: String,
    pub laddr: SocketAddr,
    /// Pending connection queue passed to `listen(2)`.
    pub backlog: i32,
    pub nodelay: bool,
    /// SO_REUSEADDR, left untouched when `None`
    pub reuseaddr: Option<bool>,
    /// SO_REUSEPORT, ignored on windows
    pub reuseport: Option<bool>,
    /// Connections beyond this are dropped right after accept.
    pub max_connections: usize,
    /// Largest inbound packet in bytes, 0 disables the check.
    pub max_packet_size: u32,

    /// Keep-alive grace factor, a silent client is dropped after
    /// `keep_alive * keepalive_backoff * 2` seconds.
    pub keepalive_backoff: f32,
    /// Unacknowledged QoS 1/2 deliveries allowed per session.
    pub max_inflight: NonZeroU16,
    /// Time allowed for the CONNECT packet.
    pub handshake_timeout: Duration,
    /// Time allowed for one packet write, 0 waits forever.
    pub send_timeout: Duration,
    /// Messages held per session while the window is full or the client is away, 0 means no cap.
    pub max_mqueue_len: usize,
    pub max_clientid_len: usize,
    /// How long a disconnected persistent session is kept, 0 means forever
    pub session_expiry_interval: Duration,
    /// Resend delay of an unacknowledged QoS 1/2 delivery, 0 turns resending off.
    pub message_retry_interval: Duration,
    /// Resends of one delivery before it is given up, 0 means no limit.
    pub max_message_retries: u32,
}

impl Default for Builder {
    fn default() -> Self {
        Self::new()
    }
}

macro_rules! setters {
    ($($field:ident: $ty:ty),* $(,)?) => {
        $(
            pub fn $field(mut self, $field: $ty) -> Self {
                self.$field = $field;
                self
            }
        )*
    };
}

impl Builder {
    pub fn new() -> Builder {
        Builder {
            name: String::new(),
            laddr: ([0, 0, 0, 0], 1883).into(),
            backlog: 512,
            nodelay: false,
            reuseaddr: None,
            reuseport: None,
            max_connections: 1_000_000,
            max_packet_size: 1 << 20,

            keepalive_backoff: 0.75,
            max_inflight: nonzero!(16u16),
            handshake_timeout: Duration::from_secs(30),
            send_timeout: Duration::from_secs(10),
            max_mqueue_len: 1000,
            max_clientid_len: 65535,
            session_expiry_interval: Duration::ZERO,
            message_retry_interval: Duration::from_secs(20),
            max_message_retries: 5,
        }
    }

    pub fn name<N: Into<String>>(mut self, name: N) -> Self {
        self.name = name.into();
        self
    }

    setters! {
        laddr: SocketAddr,
        backlog: i32,
        nodelay: bool,
        reuseaddr: Option<bool>,
        reuseport: Option<bool>,
        max_connections: usize,
        max_packet_size: u32,
        keepalive_backoff: f32,
        max_inflight: NonZeroU16,
        handshake_timeout: Duration,
        send_timeout: Duration,
        max_mqueue_len: usize,
        max_clientid_len: usize,
        session_expiry_interval: Duration,
        message_retry_interval: Duration,
        max_message_retries: u32,
    }

    /// Keep-alive deadline for a client that announced `keep_alive` seconds,
    /// `None` when the client disabled keep-alive.
    #[inline]
    pub fn keepalive_timeout(&self, keep_alive: u16) -> Option<Duration> {
        if keep_alive == 0 {
            None
        } else {
            Some(Duration::from_millis((keep_alive as f32 * self.keepalive_backoff * 2000.0) as u64))
        }
    }

    pub fn bind(self) -> Result<Listener> {
        let domain = if self.laddr.is_ipv4() { Domain::IPV4 } else { Domain::IPV6 };
        let socket = Socket::new(domain, Type::STREAM, None)?;
        socket.set_nonblocking(true)?;
        socket.set_linger(Some(Duration::from_secs(10)))?;
        if let Some(on) = self.reuseaddr {
            socket.set_reuse_address(on)?;
        }
        #[cfg(not(windows))]
        if let Some(on) = self.reuseport {
            socket.set_reuse_port(on)?;
        }
        socket.bind(&SockAddr::from(self.laddr))?;
        socket.listen(self.backlog)?;

        let tcp_listener = TcpListener::from_std(socket.into())?;
        log::info!("{} listening on {}", self.name, tcp_listener.local_addr()?);
        Ok(Listener { cfg: Arc::new(self), tcp_listener })
    }
}

pub struct Listener {
    pub cfg: Arc<Builder>,
    tcp_listener: TcpListener,
}

impl Listener {
    /// The bound address, useful when `laddr` asked for port 0.
    #[inline]
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.tcp_listener.local_addr()?)
    }

    pub async fn accept(&self) -> Result<Acceptor<TcpStream>> {
        let (socket, remote_addr) = self.tcp_listener.accept().await?;
        socket.set_nodelay(self.cfg.nodelay)?;
        Ok(Acceptor { socket, remote_addr, cfg: self.cfg.clone() })
    }
}

pub struct Acceptor<S> {
    pub(crate) socket: S,
    pub remote_addr: SocketAddr,
    pub cfg: Arc<Builder>,
}

impl<S> Acceptor<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    #[inline]
    pub fn new(socket: S, remote_addr: SocketAddr, cfg: Arc<Builder>) -> Self {
        Acceptor { socket, remote_addr, cfg }
    }

    #[inline]
    pub fn tcp(self) -> MqttStream<S> {
        MqttStream::new(self.socket, self.remote_addr, self.cfg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keepalive_timeout() {
        let b = Builder::new();
        assert_eq!(b.keepalive_timeout(0), None);
        assert_eq!(b.keepalive_timeout(10), Some(Duration::from_secs(15)));
        let b = b.keepalive_backoff(1.0);
        assert_eq!(b.keepalive_timeout(60), Some(Duration::from_secs(120)));
    }

    #[tokio::test]
    async fn test_bind_and_accept() {
        let listener = Builder::new()
            .name("test")
            .laddr(([127, 0, 0, 1], 0).into())
            .reuseaddr(Some(true))
            .nodelay(true)
            .bind()
            .unwrap();
        let addr = listener.local_addr().unwrap();
        assert_ne!(addr.port(), 0);

        let client = tokio::spawn(async move { TcpStream::connect(addr).await.unwrap() });
        let acceptor = listener.accept().await.unwrap();
        assert!(acceptor.cfg.nodelay);
        assert_eq!(acceptor.remote_addr.ip(), addr.ip());
        let _ = client.await.unwrap();
    }
}

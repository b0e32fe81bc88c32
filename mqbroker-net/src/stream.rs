use std::future::Future;
use std::net::SocketAddr;
use std::num::NonZeroU16;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::Framed;

use mqbroker_codec::error::EncodeError;
use mqbroker_codec::{Codec, Connect, ConnectAck, ConnectAckReason, Packet, Publish, SubscribeReturnCode};

use crate::error::MqttError;
use crate::{Builder, Error, Result};

/// One framed client connection. Every write is bounded by `send_timeout`
/// (0 disables the bound), reads take an explicit timeout.
pub struct MqttStream<Io> {
    pub io: Framed<Io, Codec>,
    pub remote_addr: SocketAddr,
    pub cfg: Arc<Builder>,
}

impl<Io> MqttStream<Io>
where
    Io: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(io: Io, remote_addr: SocketAddr, cfg: Arc<Builder>) -> Self {
        let codec = Codec::new(cfg.max_packet_size);
        MqttStream { io: Framed::new(io, codec), remote_addr, cfg }
    }

    #[inline]
    pub async fn send_disconnect(&mut self) -> Result<()> {
        self.send(Packet::Disconnect).await
    }

    #[inline]
    pub async fn send_publish(&mut self, publish: Publish) -> Result<()> {
        self.send(Packet::Publish(publish)).await
    }

    #[inline]
    pub async fn send_publish_ack(&mut self, packet_id: NonZeroU16) -> Result<()> {
        self.send(Packet::PublishAck { packet_id }).await
    }

    #[inline]
    pub async fn send_publish_received(&mut self, packet_id: NonZeroU16) -> Result<()> {
        self.send(Packet::PublishReceived { packet_id }).await
    }

    #[inline]
    pub async fn send_publish_release(&mut self, packet_id: NonZeroU16) -> Result<()> {
        self.send(Packet::PublishRelease { packet_id }).await
    }

    #[inline]
    pub async fn send_publish_complete(&mut self, packet_id: NonZeroU16) -> Result<()> {
        self.send(Packet::PublishComplete { packet_id }).await
    }

    #[inline]
    pub async fn send_subscribe_ack(
        &mut self,
        packet_id: NonZeroU16,
        status: Vec<SubscribeReturnCode>,
    ) -> Result<()> {
        self.send(Packet::SubscribeAck { packet_id, status }).await
    }

    #[inline]
    pub async fn send_unsubscribe_ack(&mut self, packet_id: NonZeroU16) -> Result<()> {
        self.send(Packet::UnsubscribeAck { packet_id }).await
    }

    #[inline]
    pub async fn send_connect(&mut self, connect: Connect) -> Result<()> {
        self.send(Packet::Connect(Box::new(connect))).await
    }

    #[inline]
    pub async fn send_connect_ack(&mut self, return_code: ConnectAckReason, session_present: bool) -> Result<()> {
        self.send(Packet::ConnectAck(ConnectAck { session_present, return_code })).await
    }

    #[inline]
    pub async fn send_ping_request(&mut self) -> Result<()> {
        self.send(Packet::PingRequest).await
    }

    #[inline]
    pub async fn send_ping_response(&mut self) -> Result<()> {
        self.send(Packet::PingResponse).await
    }

    pub async fn send(&mut self, packet: Packet) -> Result<()> {
        let limit = self.cfg.send_timeout;
        bounded(limit, self.io.send(packet), MqttError::WriteTimeout).await
    }

    pub async fn flush(&mut self) -> Result<()> {
        let limit = self.cfg.send_timeout;
        bounded(limit, self.io.flush(), MqttError::FlushTimeout).await
    }

    pub async fn close(&mut self) -> Result<()> {
        let limit = self.cfg.send_timeout;
        bounded(limit, self.io.close(), MqttError::CloseTimeout).await
    }

    /// `Ok(None)` means the peer closed the connection.
    pub async fn recv(&mut self, tm: Duration) -> Result<Option<Packet>> {
        tokio::time::timeout(tm, self.next()).await.map_err(|_| MqttError::ReadTimeout)?.transpose()
    }

    /// The first packet must be CONNECT, anything else is a protocol violation.
    pub async fn recv_connect(&mut self, tm: Duration) -> Result<Box<Connect>> {
        match self.recv(tm).await? {
            Some(Packet::Connect(connect)) => Ok(connect),
            _ => Err(MqttError::InvalidProtocol.into()),
        }
    }
}

/// Runs a sink operation, failing with `on_timeout` once `limit` has passed.
/// A zero `limit` waits forever.
async fn bounded<F>(limit: Duration, op: F, on_timeout: MqttError) -> Result<()>
where
    F: Future<Output = std::result::Result<(), EncodeError>>,
{
    let res = if limit.is_zero() {
        op.await
    } else {
        tokio::time::timeout(limit, op).await.map_err(|_| on_timeout)?
    };
    res.map_err(|e| MqttError::Encode(e).into())
}

impl<Io> futures::Stream for MqttStream<Io>
where
    Io: AsyncRead + Unpin,
{
    type Item = Result<Packet>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let next = Pin::new(&mut self.io).poll_next(cx);
        Poll::Ready(match futures::ready!(next) {
            Some(Ok((packet, _))) => Some(Ok(packet)),
            Some(Err(e)) => Some(Err(Error::from(MqttError::Decode(e)))),
            None => None,
        })
    }
}

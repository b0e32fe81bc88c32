use std::future::Future;
use std::ops::Deref;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use itertools::Itertools;

use mqbroker_net::{Listener, MqttError};

use crate::context::ServerContext;
use crate::stats::ConnectionGuard;
use crate::v3;
use crate::Result;

pub struct MqttServerBuilder {
    scx: ServerContext,
    listeners: Vec<Listener>,
}

impl MqttServerBuilder {
    fn new(scx: ServerContext) -> Self {
        Self { scx, listeners: Vec::default() }
    }

    pub fn listener(mut self, listen: Listener) -> Self {
        self.listeners.push(listen);
        self
    }

    pub fn build(self) -> MqttServer {
        MqttServer { inner: Arc::new(MqttServerInner { scx: self.scx, listeners: self.listeners }) }
    }
}

#[derive(Clone)]
pub struct MqttServer {
    inner: Arc<MqttServerInner>,
}

pub struct MqttServerInner {
    scx: ServerContext,
    listeners: Vec<Listener>,
}

impl Deref for MqttServer {
    type Target = MqttServerInner;
    #[inline]
    fn deref(&self) -> &Self::Target {
        self.inner.as_ref()
    }
}

impl MqttServer {
    #[allow(clippy::new_ret_no_self)]
    pub fn new(scx: ServerContext) -> MqttServerBuilder {
        MqttServerBuilder::new(scx)
    }

    #[inline]
    pub fn context(&self) -> &ServerContext {
        &self.scx
    }

    /// Accepts connections on every listener until `shutdown` resolves, then
    /// asks all sessions to stop. Wills are not published on shutdown.
    pub async fn run<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let listens = futures::future::join_all(
            self.listeners.iter().map(|l| listen_tcp(self.scx.clone(), l).boxed()).collect_vec(),
        );

        tokio::select! {
            _ = listens => {}
            _ = shutdown => {}
        }

        let closeds = self.scx.registry.close_all();
        log::info!("shutting down, {} sessions asked to close", closeds);
        log::info!("stats: {}", self.scx.stats.to_json(&self.scx).await);
        log::info!("metrics: {}", self.scx.metrics.to_json());
        Ok(())
    }
}

async fn listen_tcp(scx: ServerContext, l: &Listener) {
    loop {
        match l.accept().await {
            Ok(accept) => {
                let max_connections = accept.cfg.max_connections;
                if scx.stats.connections.count() as usize >= max_connections {
                    log::warn!(
                        "{} refused, {}",
                        accept.remote_addr,
                        MqttError::TooManyConnections(max_connections)
                    );
                    continue;
                }
                // counted from here, a client still in its handshake takes a slot too
                let conn = ConnectionGuard::new(&scx);
                let scx = scx.clone();
                tokio::spawn(async move {
                    let remote_addr = accept.remote_addr;
                    log::debug!("TCP connection from {}", remote_addr);
                    if let Err(e) = v3::process(scx, accept.tcp(), conn).await {
                        log::info!("{} connection processing error: {:?}", remote_addr, e);
                    }
                });
            }
            Err(e) => {
                log::info!("TCP listener error: {:?}", e);
                tokio::time::sleep(Duration::from_millis(1000)).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use futures::{SinkExt, StreamExt};
    use simple_logger::SimpleLogger;
    use tokio::net::TcpStream;
    use tokio_util::codec::Framed;

    use mqbroker_codec::{Codec, Connect, ConnectAckReason, Packet};
    use mqbroker_net::Builder;

    use super::*;

    #[tokio::test]
    async fn test_serve_and_shutdown() {
        let _ = SimpleLogger::new().with_level(log::LevelFilter::Info).init();
        let scx = ServerContext::new().build();
        let listener = Builder::new().laddr(([127, 0, 0, 1], 0).into()).bind().unwrap();
        let addr = listener.local_addr().unwrap();
        let server = MqttServer::new(scx.clone()).listener(listener).build();

        let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
        let running = tokio::spawn(server.run(async move {
            let _ = stop_rx.await;
        }));

        let mut c = Framed::new(TcpStream::connect(addr).await.unwrap(), Codec::default());
        c.send(Packet::Connect(Box::new(Connect::default().client_id("tcp").clean_session(true)))).await.unwrap();
        match c.next().await {
            Some(Ok((Packet::ConnectAck(ack), _))) => {
                assert_eq!(ack.return_code, ConnectAckReason::ConnectionAccepted)
            }
            other => panic!("expected CONNACK, got {:?}", other),
        }

        stop_tx.send(()).unwrap();
        running.await.unwrap().unwrap();
        // the session task stops on shutdown and closes the connection
        assert!(matches!(
            tokio::time::timeout(Duration::from_secs(3), c.next()).await,
            Ok(None) | Ok(Some(Err(_)))
        ));
    }

    #[tokio::test]
    async fn test_max_connections_counts_handshaking_clients() {
        let scx = ServerContext::new().build();
        let listener = Builder::new().laddr(([127, 0, 0, 1], 0).into()).max_connections(1).bind().unwrap();
        let addr = listener.local_addr().unwrap();
        let server = MqttServer::new(scx.clone()).listener(listener).build();
        let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
        let running = tokio::spawn(server.run(async move {
            let _ = stop_rx.await;
        }));

        // accepted, CONNECT not sent yet
        let mut first = Framed::new(TcpStream::connect(addr).await.unwrap(), Codec::default());
        for _ in 0..300 {
            if scx.stats.connections.count() == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(scx.stats.connections.count(), 1);

        let mut second = Framed::new(TcpStream::connect(addr).await.unwrap(), Codec::default());
        assert!(matches!(
            tokio::time::timeout(Duration::from_secs(3), second.next()).await,
            Ok(None) | Ok(Some(Err(_)))
        ));
        assert_eq!(scx.stats.connections.count(), 1);

        first.send(Packet::Connect(Box::new(Connect::default().client_id("c1")))).await.unwrap();
        match first.next().await {
            Some(Ok((Packet::ConnectAck(ack), _))) => {
                assert_eq!(ack.return_code, ConnectAckReason::ConnectionAccepted)
            }
            other => panic!("expected CONNACK, got {:?}", other),
        }

        stop_tx.send(()).unwrap();
        running.await.unwrap().unwrap();
    }
}

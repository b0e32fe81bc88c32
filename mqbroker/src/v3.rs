use std::convert::From as _f;

use futures::channel::mpsc;
use tokio::io::{AsyncRead, AsyncWrite};
use uuid::Uuid;

use mqbroker_net::{MqttError, MqttStream};

use crate::context::ServerContext;
use crate::registry::Resolved;
use crate::session::{Session, SessionState};
use crate::stats::ConnectionGuard;
use crate::types::{ClientId, ConnectAckReason, Id};
use crate::{Error, Result};

/// Serves one client connection: the CONNECT handshake, then the session
/// task until the connection and, for persistent sessions, the offline
/// period are over. `conn` is released as soon as the connection closes.
pub async fn process<Io>(scx: ServerContext, mut sink: MqttStream<Io>, conn: ConnectionGuard) -> Result<()>
where
    Io: AsyncRead + AsyncWrite + Unpin,
{
    let state = match handshake(&scx, &mut sink).await {
        Ok(state) => state,
        Err((ack_code, e)) => {
            if let Some(ack_code) = ack_code {
                refused_ack(&scx, &mut sink, ack_code).await;
            }
            return Err(e);
        }
    };

    state.run(sink, conn).await
}

async fn handshake<Io>(
    scx: &ServerContext,
    sink: &mut MqttStream<Io>,
) -> std::result::Result<SessionState, (Option<ConnectAckReason>, Error)>
where
    Io: AsyncRead + AsyncWrite + Unpin,
{
    let mut c = match sink.recv_connect(sink.cfg.handshake_timeout).await {
        Ok(c) => c,
        Err(e) => {
            if matches!(e.downcast_ref::<MqttError>(), Some(MqttError::ReadTimeout)) {
                scx.metrics.client_handshaking_timeout_inc();
            }
            // nothing sensible to acknowledge without a CONNECT
            return Err((None, e));
        }
    };
    scx.metrics.client_connect_inc();

    log::debug!(
        "new connection: local_addr: {:?}, remote_addr: {:?}, client_id: {}, protocol level: {}",
        sink.cfg.laddr,
        sink.remote_addr,
        c.client_id,
        c.protocol.level()
    );

    if !c.protocol.is_supported() {
        return Err((
            Some(ConnectAckReason::UnacceptableProtocolVersion),
            MqttError::UnacceptableProtocolVersion(c.protocol.level()).into(),
        ));
    }

    if c.client_id.is_empty() {
        if !c.clean_session {
            log::info!("{:?} an empty client id requires clean session", sink.remote_addr);
            return Err((Some(ConnectAckReason::IdentifierRejected), MqttError::IdentifierRejected.into()));
        }
        c.client_id = ClientId::from(Uuid::new_v4().as_simple().to_string());
    } else if c.client_id.len() > sink.cfg.max_clientid_len {
        return Err((Some(ConnectAckReason::IdentifierRejected), MqttError::IdentifierRejected.into()));
    }

    if !scx.session_allowed(&c.client_id) {
        log::warn!("{:?} too many sessions, max is {}", c.client_id, scx.mqtt_max_sessions);
        return Err((Some(ConnectAckReason::ServiceUnavailable), MqttError::ServiceUnavailable.into()));
    }

    let id = Id::new(Some(sink.cfg.laddr), Some(sink.remote_addr), c.client_id.clone(), c.username.clone());

    let (tx, rx) = mpsc::unbounded();
    let Resolved { mut entry, offline, session_present } =
        scx.registry.resolve(id.clone(), c.clean_session, tx.clone()).await;

    let created_at = offline.as_ref().map(|o| o.created_at);
    let session = Session::new(
        id,
        scx.clone(),
        sink.cfg.clone(),
        c.last_will.take(),
        c.clean_session,
        c.keep_alive,
        created_at,
    );
    entry.set(session.clone(), tx.clone());
    drop(entry);

    if session_present {
        scx.metrics.session_resumed_inc();
    } else {
        scx.metrics.session_created_inc();
    }

    Ok(SessionState::new(session, tx, rx, offline))
}

async fn refused_ack<Io>(scx: &ServerContext, sink: &mut MqttStream<Io>, ack_code: ConnectAckReason)
where
    Io: AsyncRead + AsyncWrite + Unpin,
{
    scx.metrics.client_connack_error_inc();
    if let Err(e) = sink.send_connect_ack(ack_code, false).await {
        log::debug!("{:?} send CONNACK error, {:?}", sink.remote_addr, e);
    }
    if let Err(e) = sink.close().await {
        log::debug!("{:?} close error, {:?}", sink.remote_addr, e);
    }
}

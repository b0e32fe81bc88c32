use std::convert::From as _f;
use std::num::NonZeroU16;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use futures::StreamExt;
use parking_lot::RwLock;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::oneshot;
use tokio::time::Instant;

use mqbroker_net::{Builder, MqttStream};
use mqbroker_utils::timestamp_millis;

use crate::context::ServerContext;
use crate::inflight::{InInflight, MomentStatus, OutInflight, OutInflightMessage};
use crate::queue::{MessageQueue, Policy};
use crate::stats::ConnectionGuard;
use crate::topic::{is_valid_filter, is_valid_topic_name};
use crate::types::{
    ConnectAckReason, From, HashMap, Id, LastWill, Message, OfflineInfo, Packet, Publish, QoS, Reason, Retain,
    Rx, StateFlags, SubscribeReturnCode, Subscriptions, TimestampMillis, TopicFilter, Tx,
};
use crate::Result;

type DeliverQueue = MessageQueue<(From, Publish)>;

/// Server side mirror of a session's subscriptions, the registry keeps the
/// routing index in sync with it.
#[derive(Default)]
pub struct SessionSubs {
    subs: RwLock<HashMap<TopicFilter, QoS>>,
}

impl SessionSubs {
    #[inline]
    pub fn add(&self, topic_filter: TopicFilter, qos: QoS) -> Option<QoS> {
        self.subs.write().insert(topic_filter, qos)
    }

    #[inline]
    pub fn remove(&self, topic_filter: &str) -> Option<QoS> {
        self.subs.write().remove(topic_filter)
    }

    #[inline]
    pub fn get(&self, topic_filter: &str) -> Option<QoS> {
        self.subs.read().get(topic_filter).copied()
    }

    #[inline]
    pub fn extend(&self, subs: Subscriptions) {
        self.subs.write().extend(subs)
    }

    #[inline]
    pub fn drain(&self) -> Subscriptions {
        self.subs.write().drain().collect()
    }

    #[inline]
    pub fn to_vec(&self) -> Subscriptions {
        self.subs.read().iter().map(|(tf, qos)| (tf.clone(), *qos)).collect()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.subs.read().len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.subs.read().is_empty()
    }
}

/// The registry visible half of a session. Clones share the same state.
#[derive(Clone)]
pub struct Session(Arc<SessionInner>);

pub struct SessionInner {
    pub id: Id,
    pub scx: ServerContext,
    pub listen_cfg: Arc<Builder>,
    pub subscriptions: SessionSubs,
    pub last_will: Option<LastWill>,
    pub clean_session: bool,
    pub keep_alive: u16,
    pub created_at: TimestampMillis,
    pub connected_at: TimestampMillis,
    connected: AtomicBool,
    disconnected_at: AtomicI64,
}

impl Drop for SessionInner {
    fn drop(&mut self) {
        self.scx.stats.sessions.dec();
    }
}

impl Deref for Session {
    type Target = SessionInner;
    #[inline]
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl Session {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: Id,
        scx: ServerContext,
        listen_cfg: Arc<Builder>,
        last_will: Option<LastWill>,
        clean_session: bool,
        keep_alive: u16,
        created_at: Option<TimestampMillis>,
    ) -> Self {
        scx.stats.sessions.inc();
        let now = timestamp_millis();
        Self(Arc::new(SessionInner {
            id,
            scx,
            listen_cfg,
            subscriptions: SessionSubs::default(),
            last_will,
            clean_session,
            keep_alive,
            created_at: created_at.unwrap_or(now),
            connected_at: now,
            connected: AtomicBool::new(true),
            disconnected_at: AtomicI64::new(0),
        }))
    }

    #[inline]
    pub fn connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    #[inline]
    pub fn disconnected_at(&self) -> TimestampMillis {
        self.disconnected_at.load(Ordering::SeqCst)
    }

    #[inline]
    pub(crate) fn disconnected_set(&self) {
        self.connected.store(false, Ordering::SeqCst);
        self.disconnected_at.store(timestamp_millis(), Ordering::SeqCst);
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("clean_session", &self.clean_session)
            .field("subscriptions", &self.subscriptions.len())
            .field("connected", &self.connected())
            .finish()
    }
}

/// The task side of a session: the only owner of its inflight windows and
/// its message queue, fed through `rx`.
pub struct SessionState {
    session: Session,
    pub tx: Tx,
    rx: Rx,
    session_present: bool,
    out_inflight: OutInflight,
    in_inflight: InInflight,
    deliver_queue: DeliverQueue,
}

impl Deref for SessionState {
    type Target = Session;
    #[inline]
    fn deref(&self) -> &Self::Target {
        &self.session
    }
}

impl SessionState {
    /// `offline` is what the previous connection of this client left behind,
    /// it is in place before anything arriving through `rx`.
    pub fn new(session: Session, tx: Tx, rx: Rx, offline: Option<OfflineInfo>) -> Self {
        let scx = &session.scx;
        let cfg = &session.listen_cfg;

        let (scx1, scx2) = (scx.clone(), scx.clone());
        let deliver_queue = MessageQueue::new(cfg.max_mqueue_len)
            .policy(|(_, p): &(From, Publish)| -> Policy {
                if p.qos == QoS::AtMostOnce {
                    Policy::Current
                } else {
                    Policy::Early
                }
            })
            .on_push(move || scx1.stats.message_queues.inc())
            .on_pop(move || scx2.stats.message_queues.dec());

        let (scx1, scx2) = (scx.clone(), scx.clone());
        let out_inflight = OutInflight::new(
            cfg.max_inflight.get() as usize,
            cfg.message_retry_interval,
            cfg.max_message_retries,
        )
        .on_push(move || scx1.stats.out_inflights.inc())
        .on_pop(move || scx2.stats.out_inflights.dec());

        let (scx1, scx2) = (scx.clone(), scx.clone());
        let in_inflight = InInflight::new(cfg.max_inflight.get() as usize)
            .on_push(move || scx1.stats.in_inflights.inc())
            .on_pop(move || scx2.stats.in_inflights.dec());

        let session_present = offline.is_some();
        let mut state = Self { session, tx, rx, session_present, out_inflight, in_inflight, deliver_queue };
        if let Some(offline) = offline {
            state.transfer_session_state(offline);
        }
        state
    }

    #[inline]
    pub fn session(&self) -> &Session {
        &self.session
    }

    pub(crate) async fn run<Io>(mut self, mut sink: MqttStream<Io>, conn: ConnectionGuard) -> Result<()>
    where
        Io: AsyncRead + AsyncWrite + Unpin,
    {
        let mut flags = StateFlags::empty();
        let reason = match self.run_loop(&mut sink, &mut flags).await {
            Ok(()) => Reason::ConnectDisconnect,
            Err(reason) => reason,
        };
        self.scx.metrics.client_disconnected_inc();
        log::info!("{:?} exit online worker, flags: {:?}, reason: {}", self.id, flags, reason);

        if let Err(e) = sink.close().await {
            log::debug!("{:?} close connection error, {:?}", self.id, e);
        }
        drop(sink);
        drop(conn);

        if self.last_will_enable(flags) {
            if let Err(e) = self.process_last_will().await {
                log::warn!("{:?} process last will error, {:?}", self.id, e);
            }
        }

        if flags.intersects(StateFlags::Kicked | StateFlags::Shutdown) {
            return Ok(());
        }

        if self.clean_session {
            self.clean(reason);
        } else {
            self.scx.registry.detach(&self.id);
            self.offline_run_loop(&mut flags).await;
            log::debug!("{:?} exit offline worker, flags: {:?}", self.id, flags);
            if !flags.intersects(StateFlags::Kicked | StateFlags::Shutdown) {
                self.clean(Reason::SessionExpiration);
            }
        }
        Ok(())
    }

    async fn run_loop<Io>(
        &mut self,
        sink: &mut MqttStream<Io>,
        flags: &mut StateFlags,
    ) -> std::result::Result<(), Reason>
    where
        Io: AsyncRead + AsyncWrite + Unpin,
    {
        sink.send_connect_ack(ConnectAckReason::ConnectionAccepted, self.session_present).await?;
        self.scx.metrics.client_connack_inc();
        self.scx.metrics.client_connected_inc();

        if self.session_present {
            self.resend_inflights(sink).await?;
            self.deliver_queued(sink).await?;
        }

        let keep_alive = self.listen_cfg.keepalive_timeout(self.keep_alive);
        log::debug!("{:?} start online event loop, keep_alive: {:?}", self.id, keep_alive);

        let keep_alive_delay = tokio::time::sleep(keep_alive.unwrap_or_default());
        tokio::pin!(keep_alive_delay);

        let deliver_timeout_delay = tokio::time::sleep(Duration::from_secs(60));
        tokio::pin!(deliver_timeout_delay);

        loop {
            deliver_timeout_delay
                .as_mut()
                .reset(Instant::now() + self.out_inflight.get_timeout().unwrap_or(Duration::from_secs(120)));

            tokio::select! {
                _ = &mut keep_alive_delay, if keep_alive.is_some() => {
                    return Err(Reason::ConnectKeepaliveTimeout);
                }

                _ = &mut deliver_timeout_delay => {
                    self.reforward_timeouts(sink).await?;
                }

                msg = self.rx.next() => {
                    match msg {
                        Some(msg) => self.process_message(sink, msg, flags).await?,
                        None => return Err("session channel is closed".into()),
                    }
                }

                packet = sink.next() => {
                    if let Some(keep_alive) = keep_alive {
                        keep_alive_delay.as_mut().reset(Instant::now() + keep_alive);
                    }
                    match packet {
                        Some(Ok(packet)) => {
                            if !self.process_mqtt_message(sink, packet, flags).await? {
                                return Ok(());
                            }
                        }
                        Some(Err(e)) => return Err(Reason::from(e)),
                        None => return Err(Reason::ConnectRemoteClose),
                    }
                }
            }

            self.deliver_queued(sink).await?;
        }
    }

    async fn offline_run_loop(&mut self, flags: &mut StateFlags) {
        let session_expiry_interval = self.listen_cfg.session_expiry_interval;
        log::debug!("{:?} start offline event loop, session_expiry_interval: {:?}", self.id, session_expiry_interval);

        let session_expiry_delay = tokio::time::sleep(session_expiry_interval);
        tokio::pin!(session_expiry_delay);

        loop {
            tokio::select! {
                msg = self.rx.next() => {
                    match msg {
                        Some(Message::Forward(from, p)) => self.enqueue(from, p, false),
                        Some(Message::Kick(reply, by_id, clean_start)) => {
                            log::debug!("{:?} offline kicked by {:?}, clean_start: {}", self.id, by_id, clean_start);
                            self.kicked(reply, clean_start, flags);
                            break;
                        }
                        Some(Message::Close) => {
                            flags.insert(StateFlags::Shutdown);
                            break;
                        }
                        None => {
                            log::warn!("{:?} offline session channel is closed", self.id);
                            break;
                        }
                    }
                }

                _ = &mut session_expiry_delay, if !session_expiry_interval.is_zero() => {
                    log::debug!("{:?} session expired", self.id);
                    break;
                }
            }
        }
    }

    async fn process_message<Io>(
        &mut self,
        sink: &mut MqttStream<Io>,
        msg: Message,
        flags: &mut StateFlags,
    ) -> std::result::Result<(), Reason>
    where
        Io: AsyncRead + AsyncWrite + Unpin,
    {
        match msg {
            Message::Forward(from, p) => self.enqueue(from, p, true),
            Message::Kick(reply, by_id, clean_start) => {
                log::debug!("{:?} kicked by {:?}, clean_start: {}", self.id, by_id, clean_start);
                self.kicked(reply, clean_start, flags);
                return Err(Reason::ConnectKicked);
            }
            Message::Close => {
                flags.insert(StateFlags::Shutdown);
                return Err(Reason::ServerShutdown);
            }
        }
        Ok(())
    }

    /// Returns `Ok(false)` once the client has disconnected gracefully.
    async fn process_mqtt_message<Io>(
        &mut self,
        sink: &mut MqttStream<Io>,
        packet: Packet,
        flags: &mut StateFlags,
    ) -> std::result::Result<bool, Reason>
    where
        Io: AsyncRead + AsyncWrite + Unpin,
    {
        let name = packet.name();
        match packet {
            Packet::Publish(publish) => self.publish_received(sink, publish).await?,
            Packet::PublishAck { packet_id } => {
                self.acked(packet_id, MomentStatus::UnAck, name);
            }
            Packet::PublishReceived { packet_id } => match self.out_inflight.status(&packet_id.get()) {
                Some(MomentStatus::UnReceived) => {
                    self.out_inflight.update_status(&packet_id.get(), MomentStatus::UnComplete);
                    sink.send_publish_release(packet_id).await?;
                }
                // our PUBREL was lost, the retransmitted PUBREC asks for it again
                Some(MomentStatus::UnComplete) => sink.send_publish_release(packet_id).await?,
                Some(MomentStatus::UnAck) => {
                    log::debug!("{:?} PUBREC for QoS 1 packet_id {}, ignored", self.id, packet_id);
                }
                None => {
                    log::debug!("{:?} PUBREC for unknown packet_id {}", self.id, packet_id);
                    sink.send_publish_release(packet_id).await?;
                }
            },
            Packet::PublishRelease { packet_id } => {
                self.in_inflight.remove(&packet_id);
                sink.send_publish_complete(packet_id).await?;
            }
            Packet::PublishComplete { packet_id } => {
                self.acked(packet_id, MomentStatus::UnComplete, name);
            }
            Packet::Subscribe { packet_id, topic_filters } => {
                self.subscribe(sink, packet_id, topic_filters).await?
            }
            Packet::Unsubscribe { packet_id, topic_filters } => {
                for topic_filter in topic_filters {
                    self.scx.metrics.client_unsubscribe_inc();
                    self.scx.registry.unsubscribe(&self.session, &topic_filter);
                }
                sink.send_unsubscribe_ack(packet_id).await?;
            }
            Packet::PingRequest => sink.send_ping_response().await?,
            Packet::Disconnect => {
                flags.insert(StateFlags::DisconnectReceived);
                return Ok(false);
            }
            Packet::Connect(_)
            | Packet::ConnectAck(_)
            | Packet::SubscribeAck { .. }
            | Packet::UnsubscribeAck { .. }
            | Packet::PingResponse => {
                return Err(Reason::protocol_error(format!("unexpected {} packet", name)));
            }
        }
        Ok(true)
    }

    async fn publish_received<Io>(
        &mut self,
        sink: &mut MqttStream<Io>,
        publish: Publish,
    ) -> std::result::Result<(), Reason>
    where
        Io: AsyncRead + AsyncWrite + Unpin,
    {
        if !is_valid_topic_name(&publish.topic) {
            return Err(Reason::protocol_error(format!("invalid topic name: {}", publish.topic)));
        }

        match publish.qos {
            QoS::AtMostOnce => self.publish(publish).await,
            QoS::AtLeastOnce => {
                let packet_id = Self::packet_id(&publish)?;
                self.publish(publish).await;
                sink.send_publish_ack(packet_id).await?;
            }
            QoS::ExactlyOnce => {
                let packet_id = Self::packet_id(&publish)?;
                match self.in_inflight.add(packet_id) {
                    Ok(true) => self.publish(publish).await,
                    Ok(false) => {
                        log::debug!("{:?} duplicate QoS 2 PUBLISH, packet_id {}", self.id, packet_id);
                    }
                    Err(reason) => {
                        // no PUBREC, the publisher still owns the message and may send it again
                        self.scx.metrics.messages_dropped_inc();
                        log::warn!("{:?} QoS 2 PUBLISH dropped, packet_id {}, reason: {}", self.id, packet_id, reason);
                        return Ok(());
                    }
                }
                sink.send_publish_received(packet_id).await?;
            }
        }
        Ok(())
    }

    /// Completes an outbound message when `packet_id` is waiting for exactly
    /// this kind of ack, anything else is logged and ignored.
    fn acked(&mut self, packet_id: NonZeroU16, expected: MomentStatus, name: &str) {
        match self.out_inflight.status(&packet_id.get()) {
            Some(status) if status == expected => {
                self.out_inflight.remove(&packet_id.get());
                self.scx.metrics.messages_acked_inc();
            }
            Some(status) => {
                log::debug!("{:?} {} for packet_id {} in state {:?}, ignored", self.id, name, packet_id, status);
            }
            None => log::debug!("{:?} {} for unknown packet_id {}", self.id, name, packet_id),
        }
    }

    #[inline]
    fn packet_id(publish: &Publish) -> std::result::Result<NonZeroU16, Reason> {
        publish.packet_id.ok_or_else(|| Reason::protocol_error("packet_id is required for QoS > 0"))
    }

    #[inline]
    async fn publish(&self, publish: Publish) {
        if let Err(e) = forwards(&self.scx, From::from_custom(self.id.clone()), publish).await {
            log::warn!("{:?} publish error, {:?}", self.id, e);
        }
    }

    async fn subscribe<Io>(
        &mut self,
        sink: &mut MqttStream<Io>,
        packet_id: NonZeroU16,
        topic_filters: Vec<(TopicFilter, QoS)>,
    ) -> std::result::Result<(), Reason>
    where
        Io: AsyncRead + AsyncWrite + Unpin,
    {
        let mut status = Vec::with_capacity(topic_filters.len());
        let mut retains = Vec::new();
        for (topic_filter, qos) in topic_filters {
            self.scx.metrics.client_subscribe_inc();
            if !is_valid_filter(&topic_filter) {
                log::debug!("{:?} invalid topic filter: {}", self.id, topic_filter);
                status.push(SubscribeReturnCode::Failure);
                continue;
            }
            match self.scx.registry.subscribe(&self.session, topic_filter.clone(), qos) {
                Ok(_) => {
                    status.push(SubscribeReturnCode::Success(qos));
                    match self.scx.retain.get(&topic_filter).await {
                        Ok(rs) => retains.extend(rs.into_iter().map(|(_, r)| (r, qos))),
                        Err(e) => log::warn!("{:?} get retained messages error, {:?}", self.id, e),
                    }
                }
                Err(e) => {
                    log::warn!("{:?} subscribe {} error, {:?}", self.id, topic_filter, e);
                    status.push(SubscribeReturnCode::Failure);
                }
            }
        }
        sink.send_subscribe_ack(packet_id, status).await?;

        for (Retain { from, mut publish }, qos) in retains {
            publish.qos = publish.qos.downgrade(qos);
            publish.retain = true;
            publish.dup = false;
            publish.packet_id = None;
            self.enqueue(from, publish, true);
        }
        Ok(())
    }

    fn enqueue(&mut self, from: From, publish: Publish, online: bool) {
        if !online && publish.qos == QoS::AtMostOnce {
            log::trace!("{:?} offline, QoS 0 message dropped, {:?}", self.id, publish);
            self.scx.metrics.messages_dropped_inc();
            return;
        }
        if let Err((from, p)) = self.deliver_queue.push((from, publish)) {
            self.scx.metrics.messages_dropped_inc();
            log::warn!("{:?} message queue is full, dropped {:?} from {:?}", self.id, p, from);
        }
    }

    /// Sends queued messages while the inflight window has room. QoS 0
    /// messages take no slot and are never held back.
    async fn deliver_queued<Io>(&mut self, sink: &mut MqttStream<Io>) -> std::result::Result<(), Reason>
    where
        Io: AsyncRead + AsyncWrite + Unpin,
    {
        while let Some((_, p)) = self.deliver_queue.front() {
            if p.qos != QoS::AtMostOnce && !self.out_inflight.has_credit() {
                break;
            }
            if let Some((from, p)) = self.deliver_queue.pop() {
                self.deliver(sink, from, p).await?;
            }
        }
        Ok(())
    }

    async fn deliver<Io>(
        &mut self,
        sink: &mut MqttStream<Io>,
        from: From,
        mut publish: Publish,
    ) -> std::result::Result<(), Reason>
    where
        Io: AsyncRead + AsyncWrite + Unpin,
    {
        publish.dup = false;
        if publish.qos == QoS::AtMostOnce {
            publish.packet_id = None;
        } else {
            let packet_id = NonZeroU16::new(self.out_inflight.next_id()?)
                .ok_or_else(|| Reason::from("packet_id is zero"))?;
            publish.packet_id = Some(packet_id);
            let status = match publish.qos {
                QoS::AtLeastOnce => MomentStatus::UnAck,
                _ => MomentStatus::UnReceived,
            };
            // tracked before the write, so a broken connection keeps it for the next one
            self.out_inflight.push_back(OutInflightMessage::new(status, from, publish.clone()));
        }
        sink.send_publish(publish).await?;
        self.scx.metrics.messages_delivered_inc();
        Ok(())
    }

    async fn reforward_timeouts<Io>(&mut self, sink: &mut MqttStream<Io>) -> std::result::Result<(), Reason>
    where
        Io: AsyncRead + AsyncWrite + Unpin,
    {
        while let Some(mut iflt) = self.out_inflight.pop_front_timeout() {
            if self.out_inflight.retries_exhausted(&iflt) {
                self.scx.metrics.delivery_failures_inc();
                log::warn!(
                    "{:?} delivery failed after {} retries, dropped {:?} from {:?}",
                    self.id,
                    iflt.retries,
                    iflt.publish,
                    iflt.from
                );
                continue;
            }
            iflt.retries += 1;
            log::debug!("{:?} resend inflight message, retries: {}, {:?}", self.id, iflt.retries, iflt.publish);
            let packet = iflt.resend();
            self.out_inflight.push_back(iflt);
            if let Some(packet) = packet {
                sink.send(packet).await?;
            }
        }
        Ok(())
    }

    /// Resends everything in the outbound window, oldest first.
    async fn resend_inflights<Io>(&mut self, sink: &mut MqttStream<Io>) -> std::result::Result<(), Reason>
    where
        Io: AsyncRead + AsyncWrite + Unpin,
    {
        for mut iflt in self.out_inflight.to_inflight_messages() {
            let packet = iflt.resend();
            self.out_inflight.push_back(iflt);
            if let Some(packet) = packet {
                sink.send(packet).await?;
            }
        }
        Ok(())
    }

    /// Takes over what the previous connection of this client left behind.
    /// Unacknowledged messages go out again first, in their original order.
    fn transfer_session_state(&mut self, offline_info: OfflineInfo) {
        log::debug!(
            "{:?} session state transfer from {:?}, subscriptions: {}, offline messages: {}, inflight messages: {}",
            self.id,
            offline_info.id,
            offline_info.subscriptions.len(),
            offline_info.offline_messages.len(),
            offline_info.inflight_messages.len()
        );
        self.subscriptions.extend(offline_info.subscriptions);

        for iflt in offline_info.inflight_messages {
            self.out_inflight.push_back(iflt);
        }

        for (from, p) in offline_info.offline_messages {
            self.enqueue(from, p, true);
        }
    }

    fn kicked(&mut self, reply: oneshot::Sender<OfflineInfo>, clean_start: bool, flags: &mut StateFlags) {
        flags.insert(StateFlags::Kicked);
        if clean_start {
            flags.insert(StateFlags::CleanStart);
        }
        let mut offline_info = self.to_offline_info();
        // the registry routes to the successor by now, what is still queued here goes with the state
        self.rx.close();
        while let Ok(Some(msg)) = self.rx.try_next() {
            match msg {
                Message::Forward(from, p) => offline_info.offline_messages.push((from, p)),
                msg => log::debug!("{:?} dropped pending message on kick, {:?}", self.id, msg),
            }
        }
        if reply.send(offline_info).is_err() {
            log::warn!("{:?} kick reply failed, the new connection is gone", self.id);
        }
    }

    fn to_offline_info(&mut self) -> OfflineInfo {
        OfflineInfo {
            id: self.id.clone(),
            subscriptions: self.subscriptions.to_vec(),
            offline_messages: self.deliver_queue.drain(),
            inflight_messages: self.out_inflight.to_inflight_messages(),
            created_at: self.created_at,
        }
    }

    /// A will is published unless the client said goodbye, the server is
    /// stopping, or a persistent session is being resumed by a new connection.
    #[inline]
    fn last_will_enable(&self, flags: StateFlags) -> bool {
        !(flags.contains(StateFlags::DisconnectReceived)
            || flags.contains(StateFlags::Shutdown)
            || (flags.contains(StateFlags::Kicked) && !flags.contains(StateFlags::CleanStart) && !self.clean_session))
    }

    async fn process_last_will(&self) -> Result<()> {
        if let Some(lw) = self.last_will.as_ref() {
            if !is_valid_topic_name(&lw.topic) {
                return Err(anyhow!("invalid last will topic: {}", lw.topic));
            }
            let mut p = Publish::new(lw.topic.clone(), lw.qos, lw.message.clone());
            p.retain = lw.retain;
            self.scx.metrics.messages_publish_lastwill_inc();
            forwards(&self.scx, From::from_lastwill(self.id.clone()), p).await?;
        }
        Ok(())
    }

    fn clean(&mut self, reason: Reason) {
        // a kick that raced with the teardown gets its reply dropped and falls back
        self.rx.close();
        while let Ok(Some(msg)) = self.rx.try_next() {
            log::debug!("{:?} dropped pending message on clean, {:?}", self.id, msg);
        }

        let dropped = self.deliver_queue.drain().len() + self.out_inflight.to_inflight_messages().len();
        if dropped > 0 {
            self.scx.metrics.messages_dropped_incs(dropped);
            log::debug!("{:?} {} undelivered messages dropped", self.id, dropped);
        }

        self.scx.registry.destroy(&self.id);
        self.scx.metrics.session_terminated_inc();
        log::info!("{:?} session terminated, reason: {}", self.id, reason);
    }
}

/// Routes an application message: updates the retained store when the
/// RETAIN flag is set, then fans it out with RETAIN cleared.
pub(crate) async fn forwards(scx: &ServerContext, from: From, mut publish: Publish) -> Result<()> {
    scx.metrics.messages_publish_inc();
    publish.dup = false;
    publish.packet_id = None;

    if publish.retain {
        scx.metrics.messages_retained_inc();
        scx.retain.set(&publish.topic, Retain { from: from.clone(), publish: publish.clone() }).await?;
        publish.retain = false;
    }

    match scx.registry.forwards(from, publish) {
        Ok(0) => {
            scx.metrics.messages_nonsubscribed_inc();
        }
        Ok(_) => {}
        Err(droppeds) => {
            for (client_id, from, p, reason) in droppeds {
                scx.metrics.messages_dropped_inc();
                log::debug!("forward to {} dropped, from: {:?}, {:?}, reason: {}", client_id, from, p, reason);
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use futures::channel::mpsc;

    use super::*;

    fn state(scx: &ServerContext, client_id: &str, clean_session: bool, cfg: Builder) -> SessionState {
        let id = Id::new(None, None, client_id.into(), None);
        let s = Session::new(id, scx.clone(), Arc::new(cfg), None, clean_session, 60, None);
        let (tx, rx) = mpsc::unbounded();
        SessionState::new(s, tx, rx, None)
    }

    fn publish(topic: &str, qos: QoS) -> (From, Publish) {
        let from = From::from_custom(Id::new(None, None, "publisher".into(), None));
        (from, Publish::new(topic, qos, bytes::Bytes::from_static(b"p")))
    }

    #[tokio::test]
    async fn test_last_will_enable() {
        let scx = ServerContext::new().build();
        let persistent = state(&scx, "c1", false, Builder::new());
        let ephemeral = state(&scx, "c2", true, Builder::new());

        assert!(persistent.last_will_enable(StateFlags::empty()));
        assert!(!persistent.last_will_enable(StateFlags::DisconnectReceived));
        assert!(!persistent.last_will_enable(StateFlags::Shutdown));
        // resumed by a persistent connection
        assert!(!persistent.last_will_enable(StateFlags::Kicked));
        assert!(persistent.last_will_enable(StateFlags::Kicked | StateFlags::CleanStart));
        assert!(ephemeral.last_will_enable(StateFlags::Kicked));
    }

    #[tokio::test]
    async fn test_enqueue_offline_drops_qos0() {
        let scx = ServerContext::new().build();
        let mut s = state(&scx, "c1", false, Builder::new().max_mqueue_len(2));

        let (from, p) = publish("t", QoS::AtMostOnce);
        s.enqueue(from, p, false);
        assert!(s.deliver_queue.is_empty());
        assert_eq!(scx.metrics.messages_dropped(), 1);

        for i in 0..3 {
            let (from, mut p) = publish("t", QoS::AtLeastOnce);
            p.payload = bytes::Bytes::from(format!("{}", i));
            s.enqueue(from, p, false);
        }
        // the oldest one is evicted
        assert_eq!(s.deliver_queue.len(), 2);
        assert_eq!(scx.metrics.messages_dropped(), 2);
        assert_eq!(s.deliver_queue.front().map(|(_, p)| p.payload.clone()), Some(bytes::Bytes::from("1")));
        assert_eq!(scx.stats.message_queues.count(), 2);
    }

    #[tokio::test]
    async fn test_offline_info() {
        let scx = ServerContext::new().build();
        let mut s = state(&scx, "c1", false, Builder::new());
        s.subscriptions.add("a/#".into(), QoS::AtLeastOnce);
        let (from, p) = publish("a/b", QoS::ExactlyOnce);
        s.enqueue(from, p, true);

        let info = s.to_offline_info();
        assert_eq!(info.subscriptions, vec![(TopicFilter::from("a/#"), QoS::AtLeastOnce)]);
        assert_eq!(info.offline_messages.len(), 1);
        assert!(info.inflight_messages.is_empty());
        assert!(s.deliver_queue.is_empty());
    }

    #[tokio::test]
    async fn test_kicked_hands_over_pending_forwards() {
        let scx = ServerContext::new().build();
        let mut s = state(&scx, "c1", false, Builder::new());
        let (from, p) = publish("t", QoS::AtLeastOnce);
        s.enqueue(from, p, true);
        // routed before the kick, not yet picked up by the task
        let (from, p) = publish("t", QoS::ExactlyOnce);
        s.tx.unbounded_send(Message::Forward(from, p)).unwrap();

        let (reply, reply_rx) = oneshot::channel();
        let mut flags = StateFlags::empty();
        s.kicked(reply, false, &mut flags);
        assert!(flags.contains(StateFlags::Kicked));
        assert!(!flags.contains(StateFlags::CleanStart));

        let info = reply_rx.await.unwrap();
        let qos: Vec<_> = info.offline_messages.iter().map(|(_, p)| p.qos).collect();
        assert_eq!(qos, vec![QoS::AtLeastOnce, QoS::ExactlyOnce]);
        assert!(s.tx.unbounded_send(Message::Close).is_err());
    }

    #[tokio::test]
    async fn test_new_takes_over_offline_state() {
        let scx = ServerContext::new().build();
        let (from, mut p) = publish("a/b", QoS::AtLeastOnce);
        p.packet_id = NonZeroU16::new(5);
        let info = OfflineInfo {
            id: Id::new(None, None, "c1".into(), None),
            subscriptions: vec![(TopicFilter::from("a/#"), QoS::AtLeastOnce)],
            offline_messages: vec![publish("a/c", QoS::ExactlyOnce)],
            inflight_messages: vec![OutInflightMessage::new(MomentStatus::UnAck, from, p)],
            created_at: 1,
        };

        let id = Id::new(None, None, "c1".into(), None);
        let session = Session::new(id, scx.clone(), Arc::new(Builder::new()), None, false, 60, Some(info.created_at));
        let (tx, rx) = mpsc::unbounded();
        let s = SessionState::new(session, tx, rx, Some(info));
        assert!(s.session_present);
        assert_eq!(s.created_at, 1);
        assert_eq!(s.subscriptions.get("a/#"), Some(QoS::AtLeastOnce));
        assert_eq!(s.out_inflight.status(&5), Some(MomentStatus::UnAck));
        assert_eq!(s.deliver_queue.len(), 1);
        assert_eq!(scx.stats.out_inflights.count(), 1);

        // the window gives its slots back when the task goes away
        drop(s);
        assert_eq!(scx.stats.out_inflights.count(), 0);
        assert_eq!(scx.stats.message_queues.count(), 0);
    }
}

use std::convert::From as _f;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{oneshot, Mutex, OwnedMutexGuard};

use mqbroker_utils::Counter;

use crate::session::Session;
use crate::topic::Topic;
use crate::types::{
    ClientId, DashMap, From, HashMap, Id, Message, OfflineInfo, Publish, QoS, Reason, TopicFilter, Tx,
};
use crate::Result;

const KICK_TIMEOUT: Duration = Duration::from_secs(5);

pub struct EntryItem {
    pub s: Session,
    pub tx: Tx,
    /// `tx` already leads to the successor, `s` is on its way out
    handover: bool,
}

struct Relation {
    topic: Topic,
    subs: HashMap<ClientId, QoS>,
}

/// Client id keyed table of sessions plus the subscription index used for
/// fan-out. Sessions are owned by their tasks, the registry only keeps a
/// handle and the channel to reach them.
#[derive(Clone, Default)]
pub struct Registry {
    inner: Arc<RegistryInner>,
}

#[derive(Default)]
struct RegistryInner {
    lockers: DashMap<ClientId, Arc<Mutex<()>>>,
    peers: DashMap<ClientId, EntryItem>,
    relations: DashMap<TopicFilter, Relation>,
    subscriptions: Counter,
}

/// Outcome of a CONNECT: the still locked entry to publish the new session
/// into, and the state carried over from the previous session, if any.
pub struct Resolved {
    pub entry: LockEntry,
    pub offline: Option<OfflineInfo>,
    pub session_present: bool,
}

impl Registry {
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn entry(&self, id: Id) -> LockEntry {
        LockEntry { id, registry: self.clone(), locker: None }
    }

    /// Decides session continuity for a new connection of `id.client_id`.
    ///
    /// Concurrent calls for the same client id are serialized: the second one
    /// only proceeds after the first has published its session, and then
    /// evicts it. When the session carries over, messages routed from here on
    /// go to `tx`, the channel of the new connection.
    pub async fn resolve(&self, id: Id, clean_start: bool, tx: Tx) -> Resolved {
        let mut entry = self.entry(id);
        entry.lock().await;
        let offline = entry.kick(clean_start, tx).await;
        let session_present = offline.is_some();
        Resolved { entry, offline, session_present }
    }

    /// The connection of `id` is gone, its persistent session stays registered.
    pub fn detach(&self, id: &Id) -> bool {
        match self.inner.peers.get(&id.client_id) {
            Some(peer) if peer.s.id == *id && !peer.handover => {
                peer.s.disconnected_set();
                true
            }
            _ => false,
        }
    }

    /// Removes the session and its subscriptions, unless the client id has
    /// been taken over by another connection meanwhile.
    pub fn destroy(&self, id: &Id) -> bool {
        match self.inner.peers.remove_if(&id.client_id, |_, peer| peer.s.id == *id && !peer.handover) {
            Some((client_id, peer)) => {
                self.remove_subscriptions(&client_id, &peer.s);
                true
            }
            None => false,
        }
    }

    /// Returns the previous QoS when `topic_filter` was already subscribed.
    pub fn subscribe(&self, s: &Session, topic_filter: TopicFilter, qos: QoS) -> Result<Option<QoS>> {
        let topic = Topic::from_str(&topic_filter)?;
        let prev = self
            .inner
            .relations
            .entry(topic_filter.clone())
            .or_insert_with(|| Relation { topic, subs: HashMap::default() })
            .subs
            .insert(s.id.client_id.clone(), qos);
        s.subscriptions.add(topic_filter, qos);
        if prev.is_none() {
            self.inner.subscriptions.inc();
        }
        Ok(prev)
    }

    pub fn unsubscribe(&self, s: &Session, topic_filter: &str) -> bool {
        s.subscriptions.remove(topic_filter);
        self.relation_remove(&s.id.client_id, topic_filter)
    }

    fn relation_remove(&self, client_id: &str, topic_filter: &str) -> bool {
        let removed = match self.inner.relations.get_mut(topic_filter) {
            Some(mut relation) => relation.subs.remove(client_id).is_some(),
            None => false,
        };
        if removed {
            self.inner.subscriptions.dec();
            self.inner.relations.remove_if(topic_filter, |_, relation| relation.subs.is_empty());
        }
        removed
    }

    fn remove_subscriptions(&self, client_id: &str, s: &Session) {
        for (topic_filter, _) in s.subscriptions.drain() {
            self.relation_remove(client_id, &topic_filter);
        }
    }

    /// Fans `publish` out to every session with a matching subscription.
    ///
    /// A client with overlapping subscriptions receives one copy at the
    /// highest granted QoS. Returns the number of receiving clients, or the
    /// deliveries that could not be handed to their session.
    #[allow(clippy::type_complexity)]
    pub fn forwards(
        &self,
        from: From,
        publish: Publish,
    ) -> std::result::Result<usize, Vec<(ClientId, From, Publish, Reason)>> {
        let mut matched: HashMap<ClientId, QoS> = HashMap::default();
        for relation in self.inner.relations.iter() {
            if !relation.topic.matches_str(&publish.topic) {
                continue;
            }
            for (client_id, qos) in relation.subs.iter() {
                matched
                    .entry(client_id.clone())
                    .and_modify(|granted| {
                        if *qos > *granted {
                            *granted = *qos
                        }
                    })
                    .or_insert(*qos);
            }
        }

        let count = matched.len();
        let mut errs = Vec::new();
        for (client_id, qos) in matched {
            let mut p = publish.clone();
            p.qos = publish.qos.downgrade(qos);
            p.retain = false;
            p.dup = false;
            p.packet_id = None;

            // sent under the read guard, a handover cannot slip in between
            match self.inner.peers.get(&client_id) {
                Some(peer) => {
                    if let Err(e) = peer.tx.unbounded_send(Message::Forward(from.clone(), p)) {
                        if let Message::Forward(from, p) = e.into_inner() {
                            errs.push((client_id, from, p, Reason::from("session channel is closed")));
                        }
                    }
                }
                None => errs.push((client_id, from.clone(), p, Reason::from("session does not exist"))),
            }
        }

        if errs.is_empty() {
            Ok(count)
        } else {
            Err(errs)
        }
    }

    /// Asks every session task to stop, returns how many were asked.
    pub fn close_all(&self) -> usize {
        let mut n = 0;
        for peer in self.inner.peers.iter() {
            if peer.tx.unbounded_send(Message::Close).is_ok() {
                n += 1;
            }
        }
        n
    }

    #[inline]
    pub fn get(&self, client_id: &str) -> Option<Session> {
        self.inner.peers.get(client_id).map(|peer| peer.s.clone())
    }

    #[inline]
    pub fn exist(&self, client_id: &str) -> bool {
        self.inner.peers.contains_key(client_id)
    }

    #[inline]
    pub fn sessions(&self) -> usize {
        self.inner.peers.len()
    }

    #[inline]
    pub fn subscriptions(&self) -> isize {
        self.inner.subscriptions.count()
    }

    #[inline]
    pub fn topics(&self) -> usize {
        self.inner.relations.len()
    }
}

pub struct LockEntry {
    id: Id,
    registry: Registry,
    locker: Option<OwnedMutexGuard<()>>,
}

impl Drop for LockEntry {
    fn drop(&mut self) {
        if self.locker.take().is_some() {
            // only the map still holds the mutex when nobody waits on it
            self.registry.inner.lockers.remove_if(&self.id.client_id, |_, locker| Arc::strong_count(locker) == 1);
        }
    }
}

impl LockEntry {
    #[inline]
    pub fn id(&self) -> &Id {
        &self.id
    }

    /// Waits until no other connection of this client id is being resolved.
    pub async fn lock(&mut self) {
        if self.locker.is_some() {
            return;
        }
        let locker = self
            .registry
            .inner
            .lockers
            .entry(self.id.client_id.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .value()
            .clone();
        self.locker = Some(locker.lock_owned().await);
    }

    /// Evicts the current holder of the client id. Returns its state when it
    /// carries over, i.e. both the old and the new connection are persistent.
    ///
    /// A carried over entry is switched to `new_tx` before the kick is sent,
    /// so everything routed to the old channel is ahead of the kick and ends
    /// up in the returned state.
    async fn kick(&mut self, clean_start: bool, new_tx: Tx) -> Option<OfflineInfo> {
        let client_id = self.id.client_id.clone();
        let (s, tx) = self.registry.inner.peers.get(&client_id).map(|peer| (peer.s.clone(), peer.tx.clone()))?;
        let carry_over = !clean_start && !s.clean_session;
        log::debug!("{:?} kick {:?}, clean_start: {}, carry over: {}", self.id, s.id, clean_start, carry_over);

        if carry_over {
            if let Some(mut peer) = self.registry.inner.peers.get_mut(&client_id) {
                peer.tx = new_tx;
                peer.handover = true;
            }
        } else if let Some((_, peer)) = self.registry.inner.peers.remove_if(&client_id, |_, peer| peer.s.id == s.id) {
            self.registry.remove_subscriptions(&client_id, &peer.s);
        }

        let (reply_tx, reply_rx) = oneshot::channel();
        let reply = if tx.unbounded_send(Message::Kick(reply_tx, self.id.clone(), clean_start)).is_ok() {
            match tokio::time::timeout(KICK_TIMEOUT, reply_rx).await {
                Ok(Ok(offline)) => Some(offline),
                Ok(Err(_)) => {
                    log::debug!("{:?} the kicked session {:?} is already gone", self.id, s.id);
                    None
                }
                Err(_) => {
                    log::warn!("{:?} kick {:?} timeout", self.id, s.id);
                    None
                }
            }
        } else {
            None
        };

        if !carry_over {
            return None;
        }

        let mut offline = reply.unwrap_or_else(|| OfflineInfo {
            id: s.id.clone(),
            subscriptions: Vec::new(),
            offline_messages: Vec::new(),
            inflight_messages: Vec::new(),
            created_at: s.created_at,
        });
        // the registry side is authoritative, the old task may not have answered
        offline.subscriptions = s.subscriptions.to_vec();
        Some(offline)
    }

    /// Publishes the new session, the lock is released when the entry drops.
    pub fn set(&mut self, s: Session, tx: Tx) {
        self.registry.inner.peers.insert(self.id.client_id.clone(), EntryItem { s, tx, handover: false });
    }
}

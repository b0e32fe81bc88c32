use std::collections::BTreeSet;
use std::num::NonZeroU16;
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use rust_box::dequemap::DequeBTreeMap as DequeMap;

use mqbroker_utils::timestamp_millis;

use crate::queue::OnEventFn;
use crate::types::{From, Packet, PacketId, Publish, Reason, TimestampMillis};
use crate::Result;

type OutQueues = DequeMap<PacketId, OutInflightMessage>;

#[derive(Debug, Eq, PartialEq, Clone, Copy)]
pub enum MomentStatus {
    /// QoS 1, waiting for PUBACK
    UnAck,
    /// QoS 2, waiting for PUBREC
    UnReceived,
    /// QoS 2, PUBREL sent, waiting for PUBCOMP
    UnComplete,
}

#[derive(Debug, Clone)]
pub struct OutInflightMessage {
    pub publish: Publish,
    pub from: From,
    pub status: MomentStatus,
    pub retries: u32,
    pub update_time: TimestampMillis,
}

impl OutInflightMessage {
    #[inline]
    pub fn new(status: MomentStatus, from: From, publish: Publish) -> Self {
        Self { publish, from, status, retries: 0, update_time: timestamp_millis() }
    }

    #[inline]
    pub fn packet_id(&self) -> Option<NonZeroU16> {
        self.publish.packet_id
    }

    #[inline]
    pub(crate) fn touch(&mut self) {
        self.update_time = timestamp_millis();
    }

    #[inline]
    pub fn timeout(&self, interval_millis: TimestampMillis) -> bool {
        interval_millis > 0 && ((timestamp_millis() - self.update_time) >= interval_millis)
    }

    /// Marks the message as sent again and returns the packet to put on the
    /// wire: the PUBLISH with DUP set, or the PUBREL once PUBREC was seen.
    pub fn resend(&mut self) -> Option<Packet> {
        self.touch();
        match self.status {
            MomentStatus::UnAck | MomentStatus::UnReceived => {
                self.publish.dup = true;
                Some(Packet::Publish(self.publish.clone()))
            }
            MomentStatus::UnComplete => self.packet_id().map(|packet_id| Packet::PublishRelease { packet_id }),
        }
    }
}

/// Outbound QoS 1/2 messages waiting for their acknowledgment, in send order.
///
/// The front is always the message sent (or resent) longest ago, so the retry
/// timer only ever has to look at the front.
pub struct OutInflight {
    cap: usize,
    interval: TimestampMillis,
    max_retries: u32,
    next: PacketId,
    queues: OutQueues,
    on_push_fn: Option<Arc<dyn OnEventFn>>,
    on_pop_fn: Option<Arc<dyn OnEventFn>>,
}

impl Drop for OutInflight {
    fn drop(&mut self) {
        if let Some(f) = self.on_pop_fn.as_ref() {
            (0..self.queues.len()).for_each(|_| f());
        }
    }
}

impl OutInflight {
    #[inline]
    pub fn new(cap: usize, retry_interval: Duration, max_retries: u32) -> Self {
        Self {
            cap,
            interval: retry_interval.as_millis() as TimestampMillis,
            max_retries,
            next: 1,
            queues: OutQueues::default(),
            on_push_fn: None,
            on_pop_fn: None,
        }
    }

    #[inline]
    pub fn on_push<F>(mut self, f: F) -> Self
    where
        F: OnEventFn,
    {
        self.on_push_fn = Some(Arc::new(f));
        self
    }

    #[inline]
    pub fn on_pop<F>(mut self, f: F) -> Self
    where
        F: OnEventFn,
    {
        self.on_pop_fn = Some(Arc::new(f));
        self
    }

    /// Resends allowed per message, 0 means unlimited
    #[inline]
    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    #[inline]
    pub fn retries_exhausted(&self, m: &OutInflightMessage) -> bool {
        self.max_retries > 0 && m.retries >= self.max_retries
    }

    /// Time until the front message is due, `None` when resending is off or
    /// nothing is in flight.
    #[inline]
    pub fn get_timeout(&self) -> Option<Duration> {
        if self.interval == 0 {
            return None;
        }
        self.queues.front().map(|(_, m)| {
            let t = (self.interval - (timestamp_millis() - m.update_time)).max(1);
            Duration::from_millis(t as u64)
        })
    }

    #[inline]
    fn front_timeout(&self) -> bool {
        matches!(self.queues.front(), Some((_, m)) if m.timeout(self.interval))
    }

    #[inline]
    pub fn get(&self, packet_id: PacketId) -> Option<&OutInflightMessage> {
        self.queues.get(&packet_id)
    }

    #[inline]
    pub fn status(&self, packet_id: &PacketId) -> Option<MomentStatus> {
        self.queues.get(packet_id).map(|m| m.status)
    }

    #[inline]
    pub fn front(&self) -> Option<(&PacketId, &OutInflightMessage)> {
        self.queues.front()
    }

    #[inline]
    pub fn pop_front(&mut self) -> Option<OutInflightMessage> {
        let (_, msg) = self.queues.pop_front()?;
        if let Some(f) = self.on_pop_fn.as_ref() {
            f();
        }
        Some(msg)
    }

    #[inline]
    pub fn pop_front_timeout(&mut self) -> Option<OutInflightMessage> {
        if self.front_timeout() {
            self.pop_front()
        } else {
            None
        }
    }

    /// Appends `m`, replacing and returning a message with the same packet id.
    #[inline]
    pub fn push_back(&mut self, m: OutInflightMessage) -> Option<OutInflightMessage> {
        let packet_id = match m.publish.packet_id {
            Some(packet_id) => packet_id.get(),
            None => {
                log::warn!("packet_id is None, inflight message: {:?}", m);
                return None;
            }
        };
        let old = self.remove(&packet_id);
        if let Some(f) = self.on_push_fn.as_ref() {
            f();
        }
        self.queues.insert(packet_id, m);
        old
    }

    #[inline]
    pub fn remove(&mut self, packet_id: &PacketId) -> Option<OutInflightMessage> {
        let msg = self.queues.remove(packet_id)?;
        if let Some(f) = self.on_pop_fn.as_ref() {
            f();
        }
        Some(msg)
    }

    /// Moves the message to the next handshake step and to the back of the
    /// window, the retry clock restarts.
    #[inline]
    pub fn update_status(&mut self, packet_id: &PacketId, status: MomentStatus) -> bool {
        if let Some(mut m) = self.remove(packet_id) {
            m.status = status;
            m.retries = 0;
            m.touch();
            self.push_back(m);
            true
        } else {
            false
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.queues.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.queues.is_empty()
    }

    #[inline]
    pub fn exist(&self, packet_id: &PacketId) -> bool {
        self.queues.contains_key(packet_id)
    }

    #[inline]
    pub fn has_credit(&self) -> bool {
        self.queues.len() < self.cap
    }

    /// Next free packet id. Wraps around, never yields 0 or an id in flight.
    #[inline]
    pub fn next_id(&mut self) -> Result<PacketId> {
        for _ in 0..=u16::MAX {
            let packet_id = self.next;
            self.next = self.next.wrapping_add(1);
            if packet_id == 0 {
                continue;
            }
            if !self.queues.contains_key(&packet_id) {
                return Ok(packet_id);
            }
        }
        Err(anyhow!("no packet_id available"))
    }

    #[inline]
    pub fn to_inflight_messages(&mut self) -> Vec<OutInflightMessage> {
        let mut inflight_messages = Vec::with_capacity(self.len());
        while let Some(msg) = self.pop_front() {
            inflight_messages.push(msg);
        }
        inflight_messages
    }
}

/// Inbound QoS 2 packet ids received but not yet released by PUBREL.
pub struct InInflight {
    cached: BTreeSet<NonZeroU16>,
    max_inflight: usize,
    on_push_fn: Option<Arc<dyn OnEventFn>>,
    on_pop_fn: Option<Arc<dyn OnEventFn>>,
}

impl Drop for InInflight {
    fn drop(&mut self) {
        if let Some(f) = self.on_pop_fn.as_ref() {
            self.cached.iter().for_each(|_| f());
        }
    }
}

impl InInflight {
    pub fn new(max_inflight: usize) -> Self {
        Self { cached: BTreeSet::default(), max_inflight, on_push_fn: None, on_pop_fn: None }
    }

    #[inline]
    pub fn on_push<F: OnEventFn>(mut self, f: F) -> Self {
        self.on_push_fn = Some(Arc::new(f));
        self
    }

    #[inline]
    pub fn on_pop<F: OnEventFn>(mut self, f: F) -> Self {
        self.on_pop_fn = Some(Arc::new(f));
        self
    }

    #[inline]
    pub fn contains(&self, pid: &NonZeroU16) -> bool {
        self.cached.contains(pid)
    }

    /// `Ok(false)` when the id is already pending, i.e. a retransmitted PUBLISH.
    #[inline]
    pub fn add(&mut self, pid: NonZeroU16) -> std::result::Result<bool, Reason> {
        if self.cached.contains(&pid) {
            return Ok(false);
        }
        if self.cached.len() >= self.max_inflight {
            return Err(Reason::InflightWindowFull);
        }
        self.cached.insert(pid);
        if let Some(f) = self.on_push_fn.as_ref() {
            f();
        }
        Ok(true)
    }

    #[inline]
    pub fn remove(&mut self, pid: &NonZeroU16) -> bool {
        if self.cached.remove(pid) {
            if let Some(f) = self.on_pop_fn.as_ref() {
                f();
            }
            true
        } else {
            false
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.cached.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.cached.is_empty()
    }
}

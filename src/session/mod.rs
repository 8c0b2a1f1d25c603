//! Per-client session state.
//!
//! A session outlives its connection: it tracks in-flight QoS 1/2 deliveries
//! across three disjoint maps plus the set of QoS 2 publishes received but
//! not yet released, allocates packet identifiers, enforces the send quota,
//! and carries the will and expiry metadata used after disconnect.
//!
//! A packet id is "in use" iff it appears in `pending_send`, `pending_ack`,
//! or `pending_pubrel`; the allocator skips in-use ids and reports quota
//! exhaustion when all 65535 are taken.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use ahash::AHashMap;
use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::RwLock;

use crate::protocol::{Packet, Properties, ProtocolVersion, PubRel, Publish, QoS, ReasonCode};

/// Session expiry interval meaning "never expires".
pub const EXPIRY_NEVER: u32 = u32::MAX;

/// Will message held until disconnect.
#[derive(Debug, Clone)]
pub struct WillMessage {
    pub topic: String,
    pub payload: Bytes,
    pub qos: QoS,
    pub retain: bool,
    pub delay_interval: u32,
    pub properties: Properties,
}

/// A QoS >= 1 publish tracked by the session, stamped for message expiry.
#[derive(Debug, Clone)]
struct TrackedPublish {
    publish: Publish,
    queued_at: Instant,
}

impl TrackedPublish {
    fn new(publish: Publish) -> Self {
        Self {
            publish,
            queued_at: Instant::now(),
        }
    }

    /// Remaining-lifetime view of the publish: `None` when the message
    /// expiry elapsed while queued, otherwise the publish with its expiry
    /// decremented by the time spent queued.
    fn take_live(mut self) -> Option<Publish> {
        if let Some(expiry) = self.publish.properties.message_expiry_interval {
            let elapsed = self.queued_at.elapsed().as_secs() as u32;
            if elapsed >= expiry {
                return None;
            }
            self.publish.properties.message_expiry_interval = Some(expiry - elapsed);
        }
        Some(self.publish)
    }

    fn is_expired(&self) -> bool {
        match self.publish.properties.message_expiry_interval {
            Some(expiry) => self.queued_at.elapsed().as_secs() as u32 >= expiry,
            None => false,
        }
    }
}

pub struct Session {
    pub client_id: Arc<str>,
    pub protocol_version: ProtocolVersion,
    /// Clean start/clean session flag from the last CONNECT
    pub clean_start: bool,
    /// Seconds the session survives a disconnect (`EXPIRY_NEVER` = forever)
    pub session_expiry_interval: u32,
    pub keep_alive: u16,
    /// Peer-advertised maximum packet size for outbound encoding
    pub max_packet_size: usize,
    pub connected: bool,
    disconnected_at: Option<Instant>,
    last_activity: Instant,

    next_packet_id: u16,
    /// QoS >= 1 publishes queued awaiting flow-control credit, in insertion
    /// order (ordering guarantee for per-publisher delivery)
    pending_send: VecDeque<TrackedPublish>,
    /// Sent publishes awaiting PUBACK (QoS 1) or PUBREC (QoS 2)
    pending_ack: AHashMap<u16, TrackedPublish>,
    /// PUBRELs sent, awaiting PUBCOMP
    pending_pubrel: AHashMap<u16, PubRel>,
    /// QoS 2 publishes received, awaiting PUBREL
    received_qos2: AHashMap<u16, Publish>,

    /// Remaining flow-control credit
    send_quota: u16,
    /// Peer's receive maximum; `send_quota` saturates here
    max_send_quota: u16,

    pub will: Option<WillMessage>,
}

impl Session {
    pub fn new(client_id: Arc<str>, protocol_version: ProtocolVersion) -> Self {
        Self {
            client_id,
            protocol_version,
            clean_start: true,
            session_expiry_interval: 0,
            keep_alive: 60,
            max_packet_size: crate::codec::MAX_REMAINING_LENGTH,
            connected: true,
            disconnected_at: None,
            last_activity: Instant::now(),
            next_packet_id: 1,
            pending_send: VecDeque::new(),
            pending_ack: AHashMap::with_capacity(16),
            pending_pubrel: AHashMap::with_capacity(8),
            received_qos2: AHashMap::with_capacity(8),
            send_quota: u16::MAX,
            max_send_quota: u16::MAX,
            will: None,
        }
    }

    /// Set the peer's receive maximum; resets the available quota.
    pub fn set_max_send_quota(&mut self, quota: u16) {
        self.max_send_quota = quota;
        self.send_quota = quota;
    }

    pub fn send_quota(&self) -> u16 {
        self.send_quota
    }

    /// A packet id is in use iff it appears in `pending_send`,
    /// `pending_ack`, or `pending_pubrel`.
    pub fn packet_id_in_use(&self, id: u16) -> bool {
        self.id_in_use(id)
    }

    fn id_in_use(&self, id: u16) -> bool {
        self.pending_ack.contains_key(&id)
            || self.pending_pubrel.contains_key(&id)
            || self
                .pending_send
                .iter()
                .any(|p| p.publish.packet_id == Some(id))
    }

    /// Allocate the next free packet id, wrapping 65535 -> 1 and skipping
    /// ids still in flight. Fails with `QuotaExceeded` when every id is in
    /// use.
    pub fn generate_packet_id(&mut self) -> Result<u16, ReasonCode> {
        for _ in 0..u16::MAX {
            let id = self.next_packet_id;
            self.next_packet_id = if self.next_packet_id == u16::MAX {
                1
            } else {
                self.next_packet_id + 1
            };
            if !self.id_in_use(id) {
                return Ok(id);
            }
        }
        Err(ReasonCode::QuotaExceeded)
    }

    /// Whether `id` is currently tracked for an incoming QoS 2 exchange.
    pub fn has_received_qos2(&self, id: u16) -> bool {
        self.received_qos2.contains_key(&id)
    }

    pub fn received_qos2_len(&self) -> usize {
        self.received_qos2.len()
    }

    pub fn store_received_qos2(&mut self, id: u16, publish: Publish) {
        self.received_qos2.insert(id, publish);
    }

    pub fn take_received_qos2(&mut self, id: u16) -> Option<Publish> {
        self.received_qos2.remove(&id)
    }

    /// Accept a publish for this subscriber.
    ///
    /// Expired messages are dropped. QoS 0 goes straight out while
    /// connected and is dropped otherwise. QoS >= 1 is queued and, when the
    /// session is connected and has quota, immediately promoted to
    /// `pending_ack` with a fresh packet id; the returned publish is ready
    /// to transmit.
    pub fn publish(&mut self, mut publish: Publish) -> Result<Option<Publish>, ReasonCode> {
        if publish.qos == QoS::AtMostOnce {
            if self.connected {
                publish.packet_id = None;
                return Ok(Some(publish));
            }
            return Ok(None);
        }

        publish.dup = false;
        let id = self.generate_packet_id()?;
        publish.packet_id = Some(id);
        let tracked = TrackedPublish::new(publish);

        if self.connected && self.send_quota > 0 {
            self.send_quota -= 1;
            self.pending_ack.insert(id, tracked.clone());
            Ok(tracked.take_live())
        } else {
            self.pending_send.push_back(tracked);
            Ok(None)
        }
    }

    /// Drain `pending_send` into `pending_ack` while quota remains,
    /// returning the publishes to transmit in insertion order.
    pub fn send_pending(&mut self) -> Vec<Publish> {
        let mut out = Vec::new();
        while self.send_quota > 0 {
            let Some(tracked) = self.pending_send.pop_front() else {
                break;
            };
            if tracked.is_expired() {
                continue;
            }
            let Some(id) = tracked.publish.packet_id else {
                continue;
            };
            self.send_quota -= 1;
            self.pending_ack.insert(id, tracked.clone());
            if let Some(publish) = tracked.take_live() {
                out.push(publish);
            }
        }
        out
    }

    /// Packets to retransmit after a reconnect: every `pending_ack` entry
    /// as a duplicate PUBLISH, then every pending PUBREL, then whatever
    /// `pending_send` can newly go out.
    pub fn resend_pending(&mut self) -> Vec<Packet> {
        let mut publishes: Vec<&mut TrackedPublish> = self.pending_ack.values_mut().collect();
        publishes.sort_unstable_by_key(|t| t.publish.packet_id);

        let mut out: Vec<Packet> = Vec::with_capacity(publishes.len() + self.pending_pubrel.len());
        for tracked in publishes {
            tracked.publish.dup = true;
            if let Some(publish) = tracked.clone().take_live() {
                out.push(Packet::Publish(publish));
            }
        }

        let mut rels: Vec<&PubRel> = self.pending_pubrel.values().collect();
        rels.sort_unstable_by_key(|r| r.packet_id);
        for rel in rels {
            out.push(Packet::PubRel(rel.clone()));
        }

        out.extend(self.send_pending().into_iter().map(Packet::Publish));
        out
    }

    /// PUBACK (QoS 1) or negative PUBREC: the delivery is over.
    pub fn acknowledge_publish(&mut self, id: u16) -> bool {
        self.pending_ack.remove(&id).is_some()
    }

    /// Positive PUBREC: the publish leaves `pending_ack` and the PUBREL to
    /// send is tracked until PUBCOMP. Unknown ids still get a PUBREL, with
    /// reason `PacketIdentifierNotFound`.
    pub fn pubrec_received(&mut self, id: u16) -> PubRel {
        let known = self.pending_ack.remove(&id).is_some();
        let rel = if known {
            PubRel::new(id)
        } else {
            PubRel::with_reason(id, ReasonCode::PacketIdentifierNotFound)
        };
        self.pending_pubrel.insert(id, rel.clone());
        rel
    }

    /// PUBCOMP: the QoS 2 delivery is complete.
    pub fn acknowledge_pubrel(&mut self, id: u16) -> bool {
        self.pending_pubrel.remove(&id).is_some()
    }

    pub fn pending_ack_len(&self) -> usize {
        self.pending_ack.len()
    }

    pub fn pending_send_len(&self) -> usize {
        self.pending_send.len()
    }

    /// Restore one unit of flow-control credit, saturating at the peer's
    /// receive maximum.
    pub fn increment_send_quota(&mut self) {
        if self.send_quota < self.max_send_quota {
            self.send_quota += 1;
        }
    }

    pub fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    /// True once 1.5x the negotiated keep-alive has passed without traffic.
    pub fn keep_alive_expired(&self) -> bool {
        if self.keep_alive == 0 {
            return false;
        }
        let timeout = Duration::from_millis(self.keep_alive as u64 * 1500);
        self.last_activity.elapsed() > timeout
    }

    pub fn mark_connected(&mut self) {
        self.connected = true;
        self.disconnected_at = None;
        self.touch();
    }

    pub fn mark_disconnected(&mut self) {
        self.connected = false;
        self.disconnected_at = Some(Instant::now());
    }

    /// Instant at which the session should be evicted, or `None` while
    /// connected or when the expiry interval is "never".
    pub fn expiry_deadline(&self) -> Option<Instant> {
        if self.connected || self.session_expiry_interval == EXPIRY_NEVER {
            return None;
        }
        self.disconnected_at
            .map(|at| at + Duration::from_secs(self.session_expiry_interval as u64))
    }

    /// Instant at which a delayed will becomes due.
    pub fn will_deadline(&self) -> Option<Instant> {
        let will = self.will.as_ref()?;
        self.disconnected_at
            .map(|at| at + Duration::from_secs(will.delay_interval as u64))
    }

    /// Drop expired entries from the pending queue (housekeeping).
    pub fn drop_expired_pending(&mut self) {
        self.pending_send.retain(|t| !t.is_expired());
    }
}

/// Broker-owned session table.
pub struct SessionStore {
    sessions: DashMap<Arc<str>, Arc<RwLock<Session>>>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self {
            sessions: DashMap::new(),
        }
    }

    pub fn get(&self, client_id: &str) -> Option<Arc<RwLock<Session>>> {
        self.sessions.get(client_id).map(|s| s.clone())
    }

    pub fn contains(&self, client_id: &str) -> bool {
        self.sessions.contains_key(client_id)
    }

    /// Insert a fresh session, returning it (replaces any previous one).
    pub fn create(
        &self,
        client_id: Arc<str>,
        protocol_version: ProtocolVersion,
    ) -> Arc<RwLock<Session>> {
        let session = Arc::new(RwLock::new(Session::new(client_id.clone(), protocol_version)));
        self.sessions.insert(client_id, session.clone());
        session
    }

    pub fn remove(&self, client_id: &str) -> Option<Arc<RwLock<Session>>> {
        self.sessions.remove(client_id).map(|(_, s)| s)
    }

    /// Snapshot of all sessions, for fan-out and housekeeping sweeps.
    pub fn snapshot(&self) -> Vec<Arc<RwLock<Session>>> {
        self.sessions.iter().map(|e| e.value().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn qos1_publish(topic: &str) -> Publish {
        Publish {
            qos: QoS::AtLeastOnce,
            topic: Arc::from(topic),
            payload: Bytes::from_static(b"x"),
            ..Default::default()
        }
    }

    fn session() -> Session {
        Session::new(Arc::from("c1"), ProtocolVersion::V5)
    }

    #[test]
    fn packet_id_wraps_and_skips_in_use() {
        let mut s = session();
        s.next_packet_id = u16::MAX;

        let id = s.generate_packet_id().unwrap();
        assert_eq!(id, u16::MAX);

        // Occupy 1 so the wrap lands on 2.
        s.pending_pubrel.insert(1, PubRel::new(1));
        assert_eq!(s.generate_packet_id().unwrap(), 2);
    }

    #[test]
    fn quota_gates_immediate_send() {
        let mut s = session();
        s.set_max_send_quota(1);

        let sent = s.publish(qos1_publish("t")).unwrap();
        assert!(sent.is_some());
        assert_eq!(s.send_quota(), 0);
        assert_eq!(s.pending_ack_len(), 1);

        // Quota exhausted: the next publish queues instead of sending.
        let queued = s.publish(qos1_publish("t")).unwrap();
        assert!(queued.is_none());
        assert_eq!(s.pending_send_len(), 1);

        // Acknowledge the first; credit returns and the queue drains.
        let first_id = sent.unwrap().packet_id.unwrap();
        assert!(s.acknowledge_publish(first_id));
        s.increment_send_quota();
        let drained = s.send_pending();
        assert_eq!(drained.len(), 1);
        assert_eq!(s.pending_send_len(), 0);
        assert_eq!(s.pending_ack_len(), 1);
    }

    #[test]
    fn quota_saturates_at_maximum() {
        let mut s = session();
        s.set_max_send_quota(2);
        s.increment_send_quota();
        s.increment_send_quota();
        assert_eq!(s.send_quota(), 2);
    }

    #[test]
    fn inflight_maps_stay_disjoint() {
        let mut s = session();
        let sent = s.publish(qos1_publish("t")).unwrap().unwrap();
        let id = sent.packet_id.unwrap();

        let rel = s.pubrec_received(id);
        assert_eq!(rel.reason_code, ReasonCode::Success);
        assert_eq!(s.pending_ack_len(), 0);
        assert!(s.pending_pubrel.contains_key(&id));
        assert!(s.id_in_use(id));

        assert!(s.acknowledge_pubrel(id));
        assert!(!s.id_in_use(id));
    }

    #[test]
    fn disconnected_queues_and_resends_on_reconnect() {
        let mut s = session();
        s.mark_disconnected();

        assert!(s.publish(qos1_publish("t")).unwrap().is_none());
        assert_eq!(s.pending_send_len(), 1);

        s.mark_connected();
        let resent = s.resend_pending();
        assert_eq!(resent.len(), 1);
        match &resent[0] {
            Packet::Publish(p) => {
                // Fresh delivery off the queue, not a retransmission.
                assert!(!p.dup);
                assert!(p.packet_id.is_some());
            }
            other => panic!("expected publish, got {:?}", other.kind()),
        }
    }

    #[test]
    fn resend_marks_inflight_as_duplicate() {
        let mut s = session();
        let sent = s.publish(qos1_publish("t")).unwrap().unwrap();
        let id = sent.packet_id.unwrap();

        s.mark_disconnected();
        s.mark_connected();
        let resent = s.resend_pending();
        assert_eq!(resent.len(), 1);
        match &resent[0] {
            Packet::Publish(p) => {
                assert!(p.dup);
                assert_eq!(p.packet_id, Some(id));
            }
            other => panic!("expected publish, got {:?}", other.kind()),
        }
    }

    #[test]
    fn expiry_deadline_follows_disconnect() {
        let mut s = session();
        s.session_expiry_interval = 60;
        assert!(s.expiry_deadline().is_none());

        s.mark_disconnected();
        assert!(s.expiry_deadline().is_some());

        s.session_expiry_interval = EXPIRY_NEVER;
        assert!(s.expiry_deadline().is_none());
    }
}

//! Per-connection protocol state machine.
//!
//! States: waiting-for-connect -> authenticating (v5 enhanced auth only)
//! -> connected -> disconnected. The connection owns the socket, the codec
//! assembly buffer and the client->server topic-alias table; session state
//! lives in the broker's session table and survives the connection.
//!
//! Fault policy: before CONNACK a protocol fault answers with a CONNACK
//! carrying the reason code; after CONNACK a v5 connection gets a
//! DISCONNECT with the reason while v3.1.1 is closed without one.
//! Transport faults close silently; either way the session detaches and
//! the will is dispatched subject to its delay.

mod connect;
mod disconnect;
mod publish;
mod qos;
mod subscribe;

use std::net::SocketAddr;
use std::sync::Arc;

use ahash::AHashMap;
use bytes::{Buf, BytesMut};
use parking_lot::RwLock;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::broker::{BrokerState, ConnectionCommand};
use crate::codec::{Decoder, EncodeOutcome, Encoder};
use crate::protocol::{
    Disconnect, Packet, ProtocolError, ProtocolVersion, Publish, ReasonCode,
};
use crate::session::Session;

/// Why a connection ended.
#[derive(Debug)]
pub enum ConnectionError {
    Io(std::io::Error),
    Protocol(ProtocolError),
    /// No CONNECT within the allowed time, or keep-alive lapsed
    Timeout,
    /// Orderly close (client DISCONNECT, takeover, shutdown)
    Closed,
}

impl std::fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionError::Io(e) => write!(f, "io error: {}", e),
            ConnectionError::Protocol(e) => write!(f, "protocol error: {}", e),
            ConnectionError::Timeout => write!(f, "timed out"),
            ConnectionError::Closed => write!(f, "closed"),
        }
    }
}

impl From<std::io::Error> for ConnectionError {
    fn from(e: std::io::Error) -> Self {
        ConnectionError::Io(e)
    }
}

impl From<ProtocolError> for ConnectionError {
    fn from(e: ProtocolError) -> Self {
        ConnectionError::Protocol(e)
    }
}

pub(crate) enum ConnState {
    Handshake,
    Connected {
        client_id: Arc<str>,
        session: Arc<RwLock<Session>>,
    },
}

pub struct Connection<S> {
    pub(crate) stream: S,
    pub(crate) addr: SocketAddr,
    pub(crate) broker: Arc<BrokerState>,
    pub(crate) state: ConnState,
    pub(crate) decoder: Decoder,
    pub(crate) encoder: Encoder,
    pub(crate) read_buf: BytesMut,
    pub(crate) write_buf: BytesMut,
    pub(crate) outbound_tx: mpsc::Sender<ConnectionCommand>,
    pub(crate) outbound_rx: mpsc::Receiver<ConnectionCommand>,
    /// Identifies this connection's registration; a takeover replaces the
    /// registry entry with a later epoch.
    pub(crate) epoch: u64,
    pub(crate) connack_sent: bool,
    /// Client sent DISCONNECT
    pub(crate) graceful: bool,
    /// Will cleared per the DISCONNECT rules, or by a takeover/shutdown
    /// close; abnormal closes leave it unset so the will fires
    pub(crate) will_suppressed: bool,
    /// A fault reply already went out; don't send another
    pub(crate) fault_sent: bool,
    pub(crate) closed: bool,
    /// Client -> server topic alias bindings
    pub(crate) alias_table: AHashMap<u16, Arc<str>>,
    /// Peer-advertised maximum packet size for outbound encoding
    pub(crate) peer_max_packet: usize,
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(stream: S, addr: SocketAddr, broker: Arc<BrokerState>) -> Self {
        let max_packet_size = broker.config.max_packet_size;
        let (outbound_tx, outbound_rx) = mpsc::channel(broker.config.outbound_queue_capacity);
        Self {
            stream,
            addr,
            broker,
            state: ConnState::Handshake,
            decoder: Decoder::new().with_max_packet_size(max_packet_size),
            encoder: Encoder::default(),
            read_buf: BytesMut::with_capacity(4096),
            write_buf: BytesMut::with_capacity(4096),
            outbound_tx,
            outbound_rx,
            epoch: crate::broker::next_connection_epoch(),
            connack_sent: false,
            graceful: false,
            will_suppressed: false,
            fault_sent: false,
            closed: false,
            alias_table: AHashMap::new(),
            peer_max_packet: crate::codec::MAX_REMAINING_LENGTH,
        }
    }

    pub async fn run(&mut self) -> Result<(), ConnectionError> {
        let connect_timeout = self.broker.config.connect_timeout;
        let buffered = match timeout(connect_timeout, self.read_connect()).await {
            Ok(Ok(buffered)) => buffered,
            Ok(Err(e)) => {
                self.teardown().await;
                return Err(e);
            }
            Err(_) => {
                debug!(addr = %self.addr, "no CONNECT within the connect window");
                if self.decoder.protocol_version() == Some(ProtocolVersion::V5) {
                    let _ = self
                        .write_packet(&Packet::Disconnect(Disconnect::with_reason(
                            ReasonCode::MaximumConnectTime,
                        )))
                        .await;
                }
                self.teardown().await;
                return Err(ConnectionError::Timeout);
            }
        };

        // Packets that arrived during the enhanced-auth exchange.
        for packet in buffered {
            if let Err(e) = self.dispatch(packet).await {
                return self.finish(e).await;
            }
        }

        let result = self.run_connected().await;
        match result {
            Ok(()) => {
                self.teardown().await;
                Ok(())
            }
            Err(e) => self.finish(e).await,
        }
    }

    /// Apply the fault policy for `e`, tear the connection down, and turn
    /// orderly closes into `Ok`.
    async fn finish(&mut self, e: ConnectionError) -> Result<(), ConnectionError> {
        if let ConnectionError::Protocol(ref pe) = e {
            let reason = pe.reason_code();
            self.send_fault(reason).await;
        }
        self.teardown().await;
        match e {
            ConnectionError::Closed => Ok(()),
            other => Err(other),
        }
    }

    /// Protocol-fault reply per policy; transport faults never come here.
    async fn send_fault(&mut self, reason: ReasonCode) {
        if self.fault_sent {
            return;
        }
        if !self.connack_sent {
            let _ = self.refuse_connect(reason).await;
        } else if self.encoder_is_v5() {
            self.fault_sent = true;
            let _ = self
                .write_packet(&Packet::Disconnect(Disconnect::with_reason(reason)))
                .await;
        }
    }

    pub(crate) fn encoder_is_v5(&self) -> bool {
        self.decoder.protocol_version() == Some(ProtocolVersion::V5)
    }

    async fn run_connected(&mut self) -> Result<(), ConnectionError> {
        let (client_id, session) = match &self.state {
            ConnState::Connected { client_id, session } => (client_id.clone(), session.clone()),
            ConnState::Handshake => {
                return Err(ProtocolError::Violation(
                    ReasonCode::ProtocolError,
                    "not connected",
                )
                .into())
            }
        };

        let keep_alive_secs = session.read().keep_alive;
        let keep_alive = if keep_alive_secs > 0 {
            std::time::Duration::from_millis(keep_alive_secs as u64 * 1500)
        } else {
            std::time::Duration::from_secs(60 * 60 * 24 * 365)
        };
        let mut deadline = tokio::time::Instant::now() + keep_alive;

        loop {
            tokio::select! {
                read = self.stream.read_buf(&mut self.read_buf) => {
                    match read {
                        Ok(0) => {
                            debug!(client_id = %client_id, "connection closed by peer");
                            return Ok(());
                        }
                        Ok(n) => {
                            self.broker.hooks.on_bytes_received(&client_id, n);
                            deadline = tokio::time::Instant::now() + keep_alive;
                            loop {
                                let decoded = self
                                    .decoder
                                    .decode(&self.read_buf)
                                    .map_err(ProtocolError::from)?;
                                let Some((packet, consumed)) = decoded else { break };
                                self.read_buf.advance(consumed);
                                session.write().touch();
                                self.dispatch(packet).await?;
                            }
                        }
                        Err(e) => {
                            debug!(client_id = %client_id, %e, "read failed");
                            return Err(e.into());
                        }
                    }
                }

                queued = self.outbound_rx.recv() => {
                    // The sender half lives on self, so the channel never
                    // yields None.
                    match queued {
                        Some(ConnectionCommand::Deliver(packet)) => {
                            self.write_packet(&packet).await?;
                        }
                        Some(ConnectionCommand::Close { disconnect, dispatch_will }) => {
                            info!(
                                client_id = %client_id,
                                reason = %disconnect.reason_code,
                                "server-initiated disconnect"
                            );
                            // Takeover and shutdown clear the will; an
                            // abnormal close (keep-alive lapse) leaves it
                            // to fire from teardown. Decided before the
                            // write so a failed write cannot change it.
                            if !dispatch_will {
                                self.will_suppressed = true;
                            }
                            if self.encoder_is_v5() {
                                self.write_packet(&Packet::Disconnect(disconnect)).await?;
                            }
                            return Err(ConnectionError::Closed);
                        }
                        None => {}
                    }
                }

                _ = tokio::time::sleep_until(deadline) => {
                    info!(client_id = %client_id, "keep-alive lapsed");
                    return Err(ProtocolError::KeepAliveTimeout.into());
                }
            }
        }
    }

    /// Dispatch one inbound packet in the connected state.
    async fn dispatch(&mut self, packet: Packet) -> Result<(), ConnectionError> {
        let (client_id, session) = match &self.state {
            ConnState::Connected { client_id, session } => (client_id.clone(), session.clone()),
            ConnState::Handshake => {
                return Err(ProtocolError::Violation(
                    ReasonCode::ProtocolError,
                    "packet before CONNECT",
                )
                .into())
            }
        };

        match &packet {
            Packet::Connect(_) => {
                return Err(ProtocolError::Violation(
                    ReasonCode::ProtocolError,
                    "duplicate CONNECT",
                )
                .into());
            }
            Packet::Publish(publish) => {
                self.handle_publish(&client_id, &session, publish.clone()).await?
            }
            Packet::PubAck(ack) => self.handle_puback(&client_id, &session, ack.packet_id).await?,
            Packet::PubRec(rec) => {
                self.handle_pubrec(&client_id, &session, rec.packet_id, rec.reason_code)
                    .await?
            }
            Packet::PubRel(rel) => self.handle_pubrel(&client_id, &session, rel.packet_id).await?,
            Packet::PubComp(comp) => {
                self.handle_pubcomp(&client_id, &session, comp.packet_id).await?
            }
            Packet::Subscribe(subscribe) => {
                self.handle_subscribe(&client_id, &session, subscribe.clone()).await?
            }
            Packet::Unsubscribe(unsubscribe) => {
                self.handle_unsubscribe(&client_id, &session, unsubscribe.clone())
                    .await?
            }
            Packet::PingReq => self.write_packet(&Packet::PingResp).await?,
            Packet::Disconnect(disconnect) => {
                self.handle_disconnect(&session, disconnect.clone()).await?;
                self.broker.hooks.on_packet_received(&client_id, &packet).await;
                return Err(ConnectionError::Closed);
            }
            Packet::Auth(_) => {
                // Enhanced re-authentication is not offered; AUTH is legal
                // only inside the handshake.
                return Err(ProtocolError::Violation(
                    ReasonCode::ProtocolError,
                    "AUTH outside authentication exchange",
                )
                .into());
            }
            Packet::ConnAck(_) | Packet::SubAck(_) | Packet::UnsubAck(_) | Packet::PingResp => {
                return Err(ProtocolError::Violation(
                    ReasonCode::ProtocolError,
                    "server-to-client packet from client",
                )
                .into());
            }
        }

        self.broker.hooks.on_packet_received(&client_id, &packet).await;
        Ok(())
    }

    /// Encode (within the peer's maximum packet size) and write.
    pub(crate) async fn write_packet(&mut self, packet: &Packet) -> Result<(), ConnectionError> {
        self.write_buf.clear();
        let outcome = self
            .encoder
            .encode_within(packet, self.peer_max_packet, &mut self.write_buf)
            .map_err(ProtocolError::from)?;

        if outcome == EncodeOutcome::Omitted {
            warn!(
                addr = %self.addr,
                kind = ?packet.kind(),
                "packet exceeds peer maximum packet size, omitted"
            );
            return Ok(());
        }

        let n = self.write_buf.len();
        self.stream.write_all(&self.write_buf).await?;
        if let ConnState::Connected { client_id, .. } = &self.state {
            self.broker.hooks.on_bytes_sent(client_id, n);
        }
        Ok(())
    }

    /// Transmit everything the session wants resent after attach, in order:
    /// unacked publishes as duplicates, pending PUBRELs, then the queue.
    pub(crate) async fn flush_session(
        &mut self,
        session: &Arc<RwLock<Session>>,
    ) -> Result<(), ConnectionError> {
        let packets = session.write().resend_pending();
        for packet in packets {
            self.write_packet(&packet).await?;
        }
        Ok(())
    }

    /// Drain newly creditable queued publishes.
    pub(crate) async fn flush_pending(
        &mut self,
        session: &Arc<RwLock<Session>>,
    ) -> Result<(), ConnectionError> {
        let publishes: Vec<Publish> = session.write().send_pending();
        for publish in publishes {
            self.write_packet(&Packet::Publish(publish)).await?;
        }
        Ok(())
    }

    /// Detach from the session, settle the will, and deregister. Safe to
    /// call more than once; a taken-over connection leaves the session to
    /// its successor.
    pub(crate) async fn teardown(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;

        let _ = self.stream.flush().await;

        let ConnState::Connected { client_id, session } = &self.state else {
            return;
        };
        let client_id = client_id.clone();
        let session = session.clone();

        let owned = self
            .broker
            .connections
            .remove_if(&client_id, |_, handle| handle.epoch == self.epoch)
            .is_some();
        if !owned {
            debug!(client_id = %client_id, "session taken over, leaving state to successor");
            return;
        }

        let (due_will, expires_now, persist) = {
            let mut s = session.write();
            s.mark_disconnected();
            if self.will_suppressed {
                s.will = None;
            }

            let expires_now = s.session_expiry_interval == 0;
            // An immediate will goes out here; a delayed one waits for the
            // housekeeper unless the session ends with the connection.
            let due_will = match &s.will {
                Some(w) if w.delay_interval == 0 || expires_now => s.will.take(),
                _ => None,
            };
            let persist = !expires_now && !s.clean_start;
            (due_will, expires_now, persist)
        };

        if let Some(will) = due_will {
            self.broker.dispatch_will(&client_id, will);
        }

        if expires_now {
            self.broker.evict_session(&client_id).await;
        } else if persist {
            if let Some(ref storage) = self.broker.storage {
                let record = crate::persistence::SessionRecord::from_session(&session.read());
                if let Err(e) = storage.persist_session(&client_id, record).await {
                    warn!(client_id = %client_id, %e, "failed to persist session");
                }
            }
        }

        self.broker
            .hooks
            .on_client_disconnected(&client_id, self.graceful)
            .await;
        debug!(client_id = %client_id, graceful = self.graceful, "disconnected");
    }
}

/// Random server-assigned client id suffix.
pub(crate) fn random_id() -> u64 {
    use std::collections::hash_map::RandomState;
    use std::hash::{BuildHasher, Hasher};

    RandomState::new().build_hasher().finish()
}

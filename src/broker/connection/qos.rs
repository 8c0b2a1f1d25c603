//! QoS acknowledgement flows (PUBACK, PUBREC, PUBREL, PUBCOMP).

use std::sync::Arc;

use parking_lot::RwLock;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::trace;

use super::{Connection, ConnectionError};
use crate::protocol::{Packet, PubComp, ReasonCode};
use crate::session::Session;

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// PUBACK completes a QoS 1 delivery: return quota, drain the queue.
    pub(crate) async fn handle_puback(
        &mut self,
        _client_id: &Arc<str>,
        session: &Arc<RwLock<Session>>,
        packet_id: u16,
    ) -> Result<(), ConnectionError> {
        {
            let mut s = session.write();
            s.acknowledge_publish(packet_id);
            s.increment_send_quota();
        }
        self.flush_pending(session).await
    }

    /// PUBREC: a negative reason aborts the QoS 2 delivery (quota comes
    /// back); otherwise the session moves it to pending-PUBREL and we send
    /// the PUBREL (with "packet identifier not found" for unknown ids).
    pub(crate) async fn handle_pubrec(
        &mut self,
        _client_id: &Arc<str>,
        session: &Arc<RwLock<Session>>,
        packet_id: u16,
        reason_code: ReasonCode,
    ) -> Result<(), ConnectionError> {
        if self.encoder_is_v5() && reason_code.is_error() {
            trace!(packet_id, %reason_code, "negative PUBREC");
            {
                let mut s = session.write();
                s.acknowledge_publish(packet_id);
                s.increment_send_quota();
            }
            return self.flush_pending(session).await;
        }

        let pubrel = session.write().pubrec_received(packet_id);
        self.write_packet(&Packet::PubRel(pubrel)).await
    }

    /// PUBREL releases a stored inbound QoS 2 publish: acknowledge with
    /// PUBCOMP, then fan out. Unknown ids get PUBCOMP with "packet
    /// identifier not found" (v5 only; v3.1.1 sends a plain PUBCOMP).
    pub(crate) async fn handle_pubrel(
        &mut self,
        client_id: &Arc<str>,
        session: &Arc<RwLock<Session>>,
        packet_id: u16,
    ) -> Result<(), ConnectionError> {
        let stored = session.write().take_received_qos2(packet_id);

        let pubcomp = match stored {
            Some(_) => PubComp::new(packet_id),
            None if self.encoder_is_v5() => {
                PubComp::with_reason(packet_id, ReasonCode::PacketIdentifierNotFound)
            }
            None => PubComp::new(packet_id),
        };
        self.write_packet(&Packet::PubComp(pubcomp)).await?;

        if let Some(publish) = stored {
            self.broker.fan_out(client_id, &publish);
        }

        Ok(())
    }

    /// PUBCOMP completes a QoS 2 delivery.
    pub(crate) async fn handle_pubcomp(
        &mut self,
        _client_id: &Arc<str>,
        session: &Arc<RwLock<Session>>,
        packet_id: u16,
    ) -> Result<(), ConnectionError> {
        {
            let mut s = session.write();
            s.acknowledge_pubrel(packet_id);
            s.increment_send_quota();
        }
        self.flush_pending(session).await
    }
}

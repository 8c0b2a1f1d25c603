//! Inbound PUBLISH handling.
//!
//! Order of operations: resolve the topic alias, authorize, enforce the
//! QoS and retain caps, validate the payload format, update the retained
//! store, then acknowledge and fan out according to the QoS:
//! QoS 0 fans out immediately, QoS 1 fans out iff the PUBACK reason is
//! success, QoS 2 is stashed until PUBREL.

use std::sync::Arc;

use parking_lot::RwLock;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, trace};

use super::{Connection, ConnectionError};
use crate::protocol::{
    Packet, ProtocolError, PubAck, PubRec, Publish, QoS, ReasonCode,
};
use crate::session::Session;

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub(crate) async fn handle_publish(
        &mut self,
        client_id: &Arc<str>,
        session: &Arc<RwLock<Session>>,
        mut publish: Publish,
    ) -> Result<(), ConnectionError> {
        self.resolve_topic_alias(&mut publish)?;

        trace!(
            client_id = %client_id,
            topic = %publish.topic,
            qos = ?publish.qos,
            retain = publish.retain,
            "PUBLISH"
        );

        // Hard caps are protocol faults, not per-message refusals.
        if publish.qos > self.broker.config.max_qos {
            return Err(ProtocolError::Violation(
                ReasonCode::QosNotSupported,
                "publish QoS above cap",
            )
            .into());
        }
        if publish.retain && !self.broker.config.retain_available {
            return Err(ProtocolError::Violation(
                ReasonCode::RetainNotSupported,
                "retain unavailable",
            )
            .into());
        }

        let authorized = match self
            .broker
            .hooks
            .on_authorize(client_id, &publish.topic, false)
            .await
        {
            Ok(ok) => ok,
            Err(e) => {
                tracing::error!(client_id = %client_id, %e, "authorize hook failed");
                return Err(ProtocolError::HookFailure("authorize hook").into());
            }
        };

        // Reason code for the acknowledgement, evaluated in order.
        let reason = if !authorized {
            debug!(client_id = %client_id, topic = %publish.topic, "publish denied");
            ReasonCode::NotAuthorized
        } else if publish.qos != QoS::AtMostOnce
            && session.read().has_received_qos2(publish.packet_id.unwrap_or(0))
        {
            ReasonCode::PacketIdentifierInUse
        } else if !payload_format_valid(&publish) {
            ReasonCode::PayloadFormatInvalid
        } else if publish.qos == QoS::ExactlyOnce
            && session.read().received_qos2_len() + 1 > self.broker.config.receive_maximum as usize
        {
            ReasonCode::ReceiveMaximumExceeded
        } else {
            ReasonCode::Success
        };

        if reason.is_success() && publish.retain {
            self.broker.retained.set(&publish, client_id.clone());
        }

        match publish.qos {
            QoS::AtMostOnce => {
                if reason.is_success() {
                    self.broker.fan_out(client_id, &publish);
                }
            }
            QoS::AtLeastOnce => {
                let packet_id = publish.packet_id.expect("QoS 1 carries a packet id");
                self.write_packet(&Packet::PubAck(PubAck::with_reason(packet_id, reason)))
                    .await?;
                if reason.is_success() {
                    self.broker.fan_out(client_id, &publish);
                }
            }
            QoS::ExactlyOnce => {
                let packet_id = publish.packet_id.expect("QoS 2 carries a packet id");
                self.write_packet(&Packet::PubRec(PubRec::with_reason(packet_id, reason)))
                    .await?;
                // Fan-out waits for PUBREL.
                if reason.is_success() {
                    session.write().store_received_qos2(packet_id, publish);
                }
            }
        }

        Ok(())
    }

    /// v5 topic-alias resolution against the per-connection binding table.
    fn resolve_topic_alias(&mut self, publish: &mut Publish) -> Result<(), ConnectionError> {
        let alias = if self.encoder_is_v5() {
            publish.properties.topic_alias
        } else {
            None
        };

        if let Some(alias) = alias {
            if alias == 0 || alias > self.broker.config.max_topic_alias {
                return Err(ProtocolError::Violation(
                    ReasonCode::TopicAliasInvalid,
                    "topic alias out of range",
                )
                .into());
            }
            if publish.topic.is_empty() {
                match self.alias_table.get(&alias) {
                    Some(topic) => publish.topic = topic.clone(),
                    None => {
                        return Err(ProtocolError::Violation(
                            ReasonCode::ProtocolError,
                            "unknown topic alias",
                        )
                        .into());
                    }
                }
            } else {
                self.alias_table.insert(alias, publish.topic.clone());
            }
        } else if publish.topic.is_empty() {
            return Err(ProtocolError::Violation(
                ReasonCode::ProtocolError,
                "empty topic without alias",
            )
            .into());
        }

        Ok(())
    }
}

/// Payload-format-indicator 1 declares UTF-8 payload data.
fn payload_format_valid(publish: &Publish) -> bool {
    match publish.properties.payload_format_indicator {
        Some(1) => std::str::from_utf8(&publish.payload).is_ok(),
        _ => true,
    }
}

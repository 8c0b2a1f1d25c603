//! CONNECT handshake.
//!
//! Reads the first packet (which must be CONNECT), authenticates, runs
//! the v5 enhanced-auth exchange when an authentication method is present,
//! negotiates server caps into the CONNACK, locates or creates the session
//! (handling takeover and clean-start replacement), and finally
//! retransmits whatever the resumed session still has in flight.

use std::sync::Arc;

use bytes::Buf;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tracing::{debug, info};

use super::{random_id, Connection, ConnectionError, ConnState};
use crate::broker::ConnectionHandle;
use crate::hooks::AuthOutcome;
use crate::protocol::{
    Auth, ConnAck, Connect, Packet, Properties, ProtocolError, ProtocolVersion, QoS, ReasonCode,
};
use crate::session::{WillMessage, EXPIRY_NEVER};

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Read and process the CONNECT packet. Returns packets that arrived
    /// during the enhanced-auth exchange, to be dispatched after CONNACK.
    pub(crate) async fn read_connect(&mut self) -> Result<Vec<Packet>, ConnectionError> {
        loop {
            match self.decoder.decode(&self.read_buf) {
                Ok(Some((packet, consumed))) => {
                    self.read_buf.advance(consumed);
                    return match packet {
                        Packet::Connect(connect) => self.handle_connect(*connect).await,
                        other => {
                            debug!(addr = %self.addr, kind = ?other.kind(), "first packet was not CONNECT");
                            Err(ProtocolError::Violation(
                                ReasonCode::ProtocolError,
                                "first packet must be CONNECT",
                            )
                            .into())
                        }
                    };
                }
                Ok(None) => {}
                Err(e) => {
                    // An unsupported protocol level is refused before any
                    // version is negotiated; answer in the v3.1.1 shape.
                    if matches!(e, crate::protocol::DecodeError::InvalidProtocolVersion(_))
                        && !self.fault_sent
                    {
                        self.fault_sent = true;
                        use tokio::io::AsyncWriteExt;
                        let _ = self.stream.write_all(&[0x20, 0x02, 0x00, 0x01]).await;
                    } else {
                        self.refuse_connect(e.reason_code()).await?;
                    }
                    return Err(ProtocolError::from(e).into());
                }
            }

            let n = self.stream.read_buf(&mut self.read_buf).await?;
            if n == 0 {
                return Err(std::io::Error::from(std::io::ErrorKind::UnexpectedEof).into());
            }
        }
    }

    /// Send a refusal CONNACK carrying `reason` (when the protocol version
    /// is known) and remember that the fault was answered.
    pub(crate) async fn refuse_connect(
        &mut self,
        reason: ReasonCode,
    ) -> Result<(), ConnectionError> {
        if self.fault_sent {
            return Ok(());
        }
        self.fault_sent = true;

        if self.decoder.protocol_version().is_none() {
            return Ok(());
        }
        let connack = ConnAck {
            session_present: false,
            reason_code: reason,
            properties: Properties::default(),
        };
        self.write_packet(&Packet::ConnAck(connack)).await
    }

    async fn handle_connect(&mut self, connect: Connect) -> Result<Vec<Packet>, ConnectionError> {
        let version = connect.protocol_version;
        self.encoder.set_protocol_version(version);
        let is_v5 = version == ProtocolVersion::V5;
        let broker = self.broker.clone();
        let config = &broker.config;

        // A v3.1.1 client resuming a session must bring its own id.
        if connect.client_id.is_empty() && !is_v5 && !connect.clean_start {
            self.refuse_connect(ReasonCode::ClientIdentifierNotValid).await?;
            return Err(ProtocolError::Violation(
                ReasonCode::ClientIdentifierNotValid,
                "empty client id with clean-session=0",
            )
            .into());
        }

        let assigned_id = connect.client_id.is_empty();
        let client_id: Arc<str> = if assigned_id {
            loop {
                let candidate = format!("auto-{:016x}", random_id());
                if !self.broker.sessions.contains(&candidate) {
                    break candidate.into();
                }
            }
        } else {
            connect.client_id.as_str().into()
        };

        debug!(addr = %self.addr, client_id = %client_id, ?version, "CONNECT");

        // A retained will needs retain support; a will above the QoS cap is
        // equally unacceptable.
        if let Some(ref will) = connect.will {
            if will.retain && !config.retain_available {
                self.refuse_connect(ReasonCode::RetainNotSupported).await?;
                return Err(ProtocolError::Violation(
                    ReasonCode::RetainNotSupported,
                    "will retain with retain unavailable",
                )
                .into());
            }
            if will.qos > config.max_qos {
                self.refuse_connect(ReasonCode::QosNotSupported).await?;
                return Err(ProtocolError::Violation(
                    ReasonCode::QosNotSupported,
                    "will QoS above cap",
                )
                .into());
            }
        }

        match self
            .broker
            .hooks
            .on_authenticate(
                &client_id,
                connect.username.as_deref(),
                connect.password.as_deref(),
            )
            .await
        {
            Ok(true) => {}
            Ok(false) => {
                self.refuse_connect(ReasonCode::NotAuthorized).await?;
                return Err(ProtocolError::Violation(
                    ReasonCode::NotAuthorized,
                    "authentication failed",
                )
                .into());
            }
            Err(e) => {
                tracing::error!(client_id = %client_id, %e, "authentication hook failed");
                self.refuse_connect(ReasonCode::ImplementationSpecificError).await?;
                return Err(ProtocolError::HookFailure("authentication hook").into());
            }
        }

        // v5 enhanced authentication: run AUTH rounds with the provider
        // matching the client's method, buffering unrelated packets.
        let mut buffered = Vec::new();
        let mut connack_auth: Option<(String, Option<bytes::Bytes>)> = None;
        if is_v5 {
            if let Some(method) = connect.properties.authentication_method.clone() {
                let data = self
                    .run_enhanced_auth(&client_id, &method, &connect, &mut buffered)
                    .await?;
                connack_auth = Some((method, data));
            }
        }

        let is_takeover = self.broker.connections.contains_key(&client_id);
        if !is_takeover && self.broker.connections.len() >= config.max_connections {
            debug!(client_id = %client_id, "connection limit reached");
            self.refuse_connect(ReasonCode::ServerUnavailable).await?;
            return Err(ProtocolError::Violation(
                ReasonCode::ServerUnavailable,
                "connection limit reached",
            )
            .into());
        }

        if is_takeover {
            self.take_over_existing(&client_id, connect.clean_start);
        }

        // Locate or create the session.
        let existing = self.broker.sessions.get(&client_id);
        let (session, session_present) = match existing {
            Some(existing) if !connect.clean_start => {
                {
                    let mut s = existing.write();
                    s.protocol_version = version;
                    s.mark_connected();
                }
                (existing, true)
            }
            Some(_) => {
                // Clean start replaces the session; its index entries go
                // with it.
                self.broker.subscriptions.remove_client(&client_id);
                (self.broker.sessions.create(client_id.clone(), version), false)
            }
            None => (self.broker.sessions.create(client_id.clone(), version), false),
        };

        // Negotiate caps and stamp the session.
        let requested_expiry = if is_v5 {
            connect.properties.session_expiry_interval.unwrap_or(0)
        } else if connect.clean_start {
            0
        } else {
            EXPIRY_NEVER
        };
        let granted_expiry = requested_expiry.min(config.max_session_expiry);

        let requested_keep_alive = connect.keep_alive;
        let (keep_alive, advertise_keep_alive) = match config.server_keep_alive {
            Some(server)
                if is_v5 && (requested_keep_alive == 0 || server < requested_keep_alive) =>
            {
                (server, Some(server))
            }
            _ => (requested_keep_alive, None),
        };

        {
            let mut s = session.write();
            s.clean_start = connect.clean_start;
            s.session_expiry_interval = granted_expiry;
            s.keep_alive = keep_alive;
            if let Some(rm) = connect.properties.receive_maximum {
                s.set_max_send_quota(rm);
            }
            if let Some(size) = connect.properties.maximum_packet_size {
                s.max_packet_size = size as usize;
            }
            s.will = connect.will.as_ref().map(|will| WillMessage {
                topic: will.topic.clone(),
                payload: will.payload.clone(),
                qos: will.qos,
                retain: will.retain,
                delay_interval: will.properties.will_delay_interval.unwrap_or(0),
                properties: {
                    let mut p = will.properties.clone();
                    p.will_delay_interval = None;
                    p
                },
            });
            s.touch();
            self.peer_max_packet = s.max_packet_size;
        }

        if let Some(ref storage) = self.broker.storage {
            if !connect.clean_start || granted_expiry > 0 {
                let record = crate::persistence::SessionRecord::from_session(&session.read());
                if let Err(e) = storage.persist_session(&client_id, record).await {
                    tracing::error!(client_id = %client_id, %e, "failed to persist session");
                    self.refuse_connect(ReasonCode::ImplementationSpecificError).await?;
                    return Err(ProtocolError::HookFailure("session persistence").into());
                }
            }
        }

        // Attach to the session and register before CONNACK goes out, so a
        // failed write still tears the registration down.
        self.state = ConnState::Connected {
            client_id: client_id.clone(),
            session: session.clone(),
        };
        self.broker.connections.insert(
            client_id.clone(),
            ConnectionHandle {
                tx: self.outbound_tx.clone(),
                epoch: self.epoch,
            },
        );

        // CONNACK with the server's caps.
        let mut connack = ConnAck {
            session_present,
            reason_code: ReasonCode::Success,
            properties: Properties::default(),
        };
        if is_v5 {
            let props = &mut connack.properties;
            props.receive_maximum = Some(config.receive_maximum);
            // Only QoS 0 and 1 may be advertised; absence means QoS 2.
            if config.max_qos != QoS::ExactlyOnce {
                props.maximum_qos = Some(config.max_qos as u8);
            }
            props.retain_available = Some(config.retain_available as u8);
            props.maximum_packet_size = Some(config.max_packet_size as u32);
            props.topic_alias_maximum = Some(config.max_topic_alias);
            props.wildcard_subscription_available =
                Some(config.wildcard_subscription_available as u8);
            props.subscription_identifier_available =
                Some(config.subscription_identifiers_available as u8);
            props.shared_subscription_available = Some(config.shared_subscriptions_available as u8);
            if granted_expiry != requested_expiry {
                props.session_expiry_interval = Some(granted_expiry);
            }
            if let Some(server_keep_alive) = advertise_keep_alive {
                props.server_keep_alive = Some(server_keep_alive);
            }
            if connect.properties.request_response_information == Some(1) {
                props.response_information = config.response_information.clone();
            }
            if assigned_id {
                props.assigned_client_identifier = Some(client_id.to_string());
            }
            if let Some((method, data)) = connack_auth {
                props.authentication_method = Some(method);
                props.authentication_data = data;
            }
        }

        self.write_packet(&Packet::ConnAck(connack)).await?;
        self.connack_sent = true;

        info!(client_id = %client_id, session_present, "client connected");
        self.broker
            .hooks
            .on_client_connected(&client_id, connect.username.as_deref())
            .await;

        // Retransmit unacked in-flight state from the resumed session.
        self.flush_session(&session).await?;

        Ok(buffered)
    }

    /// Run the v5 enhanced-auth exchange. Returns the final server-side
    /// auth data for the CONNACK.
    async fn run_enhanced_auth(
        &mut self,
        client_id: &Arc<str>,
        method: &str,
        connect: &Connect,
        buffered: &mut Vec<Packet>,
    ) -> Result<Option<bytes::Bytes>, ConnectionError> {
        let Some(provider) = self.broker.hooks.enhanced_auth_provider(method) else {
            self.refuse_connect(ReasonCode::BadAuthenticationMethod).await?;
            return Err(ProtocolError::Violation(
                ReasonCode::BadAuthenticationMethod,
                "no provider for authentication method",
            )
            .into());
        };

        let mut data = connect.properties.authentication_data.clone();
        loop {
            match provider.auth_received(client_id, data.as_deref()).await {
                AuthOutcome::Success(server_data) => return Ok(server_data),
                AuthOutcome::Failure => {
                    self.refuse_connect(ReasonCode::NotAuthorized).await?;
                    return Err(ProtocolError::Violation(
                        ReasonCode::NotAuthorized,
                        "enhanced authentication failed",
                    )
                    .into());
                }
                AuthOutcome::Continue(server_data) => {
                    let mut auth = Auth {
                        reason_code: ReasonCode::ContinueAuthentication,
                        properties: Properties::default(),
                    };
                    auth.properties.authentication_method = Some(method.to_string());
                    auth.properties.authentication_data = server_data;
                    self.write_packet(&Packet::Auth(auth)).await?;

                    data = self.read_auth_round(method, buffered).await?;
                }
            }
        }
    }

    /// Wait for the client's next AUTH packet, buffering anything else
    /// that arrives meanwhile.
    async fn read_auth_round(
        &mut self,
        method: &str,
        buffered: &mut Vec<Packet>,
    ) -> Result<Option<bytes::Bytes>, ConnectionError> {
        loop {
            while let Some((packet, consumed)) = self
                .decoder
                .decode(&self.read_buf)
                .map_err(ProtocolError::from)?
            {
                self.read_buf.advance(consumed);
                match packet {
                    Packet::Auth(auth) => {
                        if auth.properties.authentication_method.as_deref() != Some(method) {
                            self.refuse_connect(ReasonCode::ProtocolError).await?;
                            return Err(ProtocolError::Violation(
                                ReasonCode::ProtocolError,
                                "authentication method changed mid-exchange",
                            )
                            .into());
                        }
                        return Ok(auth.properties.authentication_data);
                    }
                    Packet::Disconnect(_) => return Err(ConnectionError::Closed),
                    Packet::Connect(_) => {
                        return Err(ProtocolError::Violation(
                            ReasonCode::ProtocolError,
                            "duplicate CONNECT",
                        )
                        .into());
                    }
                    other => buffered.push(other),
                }
            }

            let n = self.stream.read_buf(&mut self.read_buf).await?;
            if n == 0 {
                return Err(std::io::Error::from(std::io::ErrorKind::UnexpectedEof).into());
            }
        }
    }

    /// Disconnect the session's current connection ("session taken over")
    /// and settle its will per the takeover rules.
    ///
    /// The old registration is removed here so the displaced connection's
    /// teardown finds itself deregistered and leaves the session alone.
    fn take_over_existing(&self, client_id: &Arc<str>, clean_start: bool) {
        info!(client_id = %client_id, "session taken over");

        if let Some((_, old)) = self.broker.connections.remove(client_id) {
            let _ = old.tx.try_send(crate::broker::ConnectionCommand::Close {
                disconnect: crate::protocol::Disconnect::with_reason(
                    ReasonCode::SessionTakenOver,
                ),
                // The takeover rules below decide the old will's fate.
                dispatch_will: false,
            });
        }

        // The old will fires now when it has no delay, or when the new
        // CONNECT wipes the session anyway.
        if let Some(session) = self.broker.sessions.get(client_id) {
            let due_will = {
                let mut s = session.write();
                match &s.will {
                    Some(w) if w.delay_interval == 0 || clean_start => s.will.take(),
                    _ => None,
                }
            };
            if let Some(will) = due_will {
                self.broker.dispatch_will(client_id, will);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::Session;

    fn will(delay: u32) -> WillMessage {
        WillMessage {
            topic: "w".into(),
            payload: bytes::Bytes::from_static(b"gone"),
            qos: QoS::AtMostOnce,
            retain: false,
            delay_interval: delay,
            properties: Properties::default(),
        }
    }

    #[test]
    fn takeover_will_rule() {
        // delay 0 -> dispatch; delayed -> dispatch only on clean start
        for (delay, clean_start, expect_dispatch) in
            [(0, false, true), (0, true, true), (5, false, false), (5, true, true)]
        {
            let mut session = Session::new("c1".into(), ProtocolVersion::V5);
            session.will = Some(will(delay));

            let due = match &session.will {
                Some(w) if w.delay_interval == 0 || clean_start => session.will.take(),
                _ => None,
            };
            assert_eq!(due.is_some(), expect_dispatch, "delay={delay} clean={clean_start}");
        }
    }
}

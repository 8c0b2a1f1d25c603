//! Broker core.
//!
//! Owns the session table, subscription index, retained store,
//! configuration and extension hooks; accepts connections and spawns one
//! task per socket; runs the housekeeper; exposes the fan-out publish path
//! used by connections, wills and the retained machinery.

mod connection;
mod housekeeper;
mod retained;
mod tls;

pub use connection::Connection;
pub use retained::RetainedStore;
pub use tls::{load_tls_acceptor, TlsError};

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use ahash::AHashMap;
use dashmap::DashMap;
use smallvec::SmallVec;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, warn};

use crate::hooks::{DefaultHooks, Hooks};
use crate::persistence::StorageBackend;
use crate::protocol::{Disconnect, Packet, Properties, Publish, QoS, ReasonCode};
use crate::session::{SessionStore, WillMessage};
use crate::topic::SubscriptionStore;

/// Redirect advertised at shutdown instead of "server shutting down".
#[derive(Debug, Clone)]
pub struct Redirect {
    /// `ServerMoved` (permanent) or `UseAnotherServer` (temporary)
    pub reason_code: ReasonCode,
    /// Goes out as the `server-reference` property
    pub server_reference: String,
}

/// Runtime broker configuration.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    pub bind_addr: SocketAddr,
    /// TLS listener; requires `key_store`
    pub tls_bind_addr: Option<SocketAddr>,
    /// PEM bundle (certificate chain + private key)
    pub key_store: Option<PathBuf>,
    pub key_store_password: Option<String>,
    pub max_connections: usize,
    /// Inbound and advertised maximum packet size
    pub max_packet_size: usize,
    /// Overrides client keep-alives above it (advertised via CONNACK)
    pub server_keep_alive: Option<u16>,
    /// Upper bound on the session expiry interval a client may request
    pub max_session_expiry: u32,
    /// Flow control window granted to each client, and the cap on
    /// concurrent inbound QoS 2 exchanges
    pub receive_maximum: u16,
    pub max_qos: QoS,
    pub retain_available: bool,
    pub wildcard_subscription_available: bool,
    pub subscription_identifiers_available: bool,
    pub shared_subscriptions_available: bool,
    pub max_topic_alias: u16,
    /// Returned when a client sets request-response-information
    pub response_information: Option<String>,
    pub redirect: Option<Redirect>,
    pub connect_timeout: Duration,
    pub housekeeper_interval: Duration,
    pub outbound_queue_capacity: usize,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 1883)),
            tls_bind_addr: None,
            key_store: None,
            key_store_password: None,
            max_connections: 100_000,
            max_packet_size: 1024 * 1024,
            server_keep_alive: None,
            max_session_expiry: crate::session::EXPIRY_NEVER,
            receive_maximum: 65_535,
            max_qos: QoS::ExactlyOnce,
            retain_available: true,
            wildcard_subscription_available: true,
            subscription_identifiers_available: true,
            shared_subscriptions_available: true,
            max_topic_alias: 65_535,
            response_information: None,
            redirect: None,
            connect_timeout: Duration::from_secs(30),
            housekeeper_interval: Duration::from_secs(1),
            outbound_queue_capacity: 1024,
        }
    }
}

/// Message on a connection's outbound queue.
#[derive(Debug, Clone)]
pub enum ConnectionCommand {
    /// Transmit a packet to the client.
    Deliver(Packet),
    /// Send `disconnect` (v5 only) and close. `dispatch_will` distinguishes
    /// abnormal closes like a keep-alive lapse, where the will must still
    /// fire, from takeover and shutdown, where it must not.
    Close {
        disconnect: Disconnect,
        dispatch_will: bool,
    },
}

/// Handle to a live connection: its outbound queue plus an epoch used to
/// tell a taken-over registration from the current one.
#[derive(Clone)]
pub struct ConnectionHandle {
    pub tx: mpsc::Sender<ConnectionCommand>,
    pub epoch: u64,
}

static CONNECTION_EPOCH: AtomicU64 = AtomicU64::new(1);

pub(crate) fn next_connection_epoch() -> u64 {
    CONNECTION_EPOCH.fetch_add(1, Ordering::Relaxed)
}

/// Shared broker state, reachable from every connection task.
pub struct BrokerState {
    pub config: BrokerConfig,
    pub sessions: SessionStore,
    pub subscriptions: SubscriptionStore,
    pub retained: RetainedStore,
    pub connections: DashMap<Arc<str>, ConnectionHandle>,
    pub hooks: Arc<dyn Hooks>,
    pub storage: Option<Arc<dyn StorageBackend>>,
}

impl BrokerState {
    /// Queue a packet on a connected client's outbound channel.
    pub fn deliver(&self, client_id: &str, packet: Packet) {
        if let Some(handle) = self.connections.get(client_id) {
            if handle.tx.try_send(ConnectionCommand::Deliver(packet)).is_err() {
                debug!(client_id, "outbound queue full, dropping packet");
            }
        }
    }

    /// Ask a live connection to send `disconnect` and close.
    /// `dispatch_will` must be true for abnormal closes so teardown still
    /// fires the will.
    pub fn close_connection(&self, client_id: &str, disconnect: Disconnect, dispatch_will: bool) {
        if let Some(handle) = self.connections.get(client_id) {
            let _ = handle.tx.try_send(ConnectionCommand::Close {
                disconnect,
                dispatch_will,
            });
        }
    }

    /// Fan a publish out to every matching subscriber.
    ///
    /// Shared subscriptions have already been collapsed to one member per
    /// group by the index. Multiple matching subscriptions of one client
    /// merge into a single delivery at the highest matching QoS with every
    /// subscription identifier attached.
    pub fn fan_out(&self, origin: &str, publish: &Publish) {
        struct Target {
            qos: QoS,
            retain_as_published: bool,
            subscription_ids: SmallVec<[u32; 4]>,
        }

        let matches = self.subscriptions.matches_for_delivery(&publish.topic);
        let mut targets: AHashMap<Arc<str>, Target> = AHashMap::with_capacity(matches.len());

        for sub in matches {
            if sub.options.no_local && sub.client_id.as_ref() == origin {
                continue;
            }
            let entry = sub.client_id.clone();
            let target = targets.entry(entry).or_insert_with(|| Target {
                qos: QoS::AtMostOnce,
                retain_as_published: false,
                subscription_ids: SmallVec::new(),
            });
            if sub.options.qos > target.qos {
                target.qos = sub.options.qos;
            }
            if sub.options.retain_as_published {
                target.retain_as_published = true;
            }
            if let Some(id) = sub.subscription_id {
                if !target.subscription_ids.contains(&id) {
                    target.subscription_ids.push(id);
                }
            }
        }

        for (client_id, target) in targets {
            let Some(session) = self.sessions.get(&client_id) else {
                continue;
            };

            let mut outgoing = publish.clone();
            outgoing.qos = publish.qos.min(target.qos);
            outgoing.retain = target.retain_as_published && publish.retain;
            outgoing.dup = false;
            outgoing.packet_id = None;
            // Aliases bind per connection; never forward the inbound one.
            outgoing.properties.topic_alias = None;
            outgoing.properties.subscription_identifiers =
                target.subscription_ids.into_iter().collect();

            match session.write().publish(outgoing) {
                Ok(Some(ready)) => self.deliver(&client_id, Packet::Publish(ready)),
                Ok(None) => {}
                Err(reason) => {
                    warn!(client_id = %client_id, %reason, "dropping publish for subscriber")
                }
            };
        }
    }

    /// Publish a will on the session's behalf: retained update, then the
    /// usual fan-out.
    pub fn dispatch_will(&self, client_id: &str, will: WillMessage) {
        debug!(client_id, topic = %will.topic, "dispatching will");

        let publish = Publish {
            dup: false,
            qos: will.qos.min(self.config.max_qos),
            retain: will.retain,
            topic: Arc::from(will.topic.as_str()),
            packet_id: None,
            payload: will.payload,
            properties: will.properties,
        };

        if publish.retain && self.config.retain_available {
            self.retained.set(&publish, Arc::from(client_id));
        }

        self.fan_out(client_id, &publish);
    }

    /// Delete a session and everything hanging off it.
    pub async fn evict_session(&self, client_id: &str) {
        self.sessions.remove(client_id);
        self.subscriptions.remove_client(client_id);
        if let Some(ref storage) = self.storage {
            if let Err(e) = storage.remove_session(client_id).await {
                warn!(client_id, %e, "failed to remove persisted session");
            }
        }
    }
}

/// The broker: shared state plus the accept/shutdown machinery.
pub struct Broker {
    state: Arc<BrokerState>,
    shutdown: broadcast::Sender<()>,
}

impl Broker {
    pub fn new(config: BrokerConfig) -> Self {
        Self::with_hooks(config, Arc::new(DefaultHooks))
    }

    pub fn with_hooks(config: BrokerConfig, hooks: Arc<dyn Hooks>) -> Self {
        Self::with_hooks_and_storage(config, hooks, None)
    }

    pub fn with_hooks_and_storage(
        config: BrokerConfig,
        hooks: Arc<dyn Hooks>,
        storage: Option<Arc<dyn StorageBackend>>,
    ) -> Self {
        let (shutdown, _) = broadcast::channel(1);
        Self {
            state: Arc::new(BrokerState {
                config,
                sessions: SessionStore::new(),
                subscriptions: SubscriptionStore::new(),
                retained: RetainedStore::new(),
                connections: DashMap::new(),
                hooks,
                storage,
            }),
            shutdown,
        }
    }

    pub fn state(&self) -> Arc<BrokerState> {
        self.state.clone()
    }

    pub fn session_count(&self) -> usize {
        self.state.sessions.len()
    }

    pub fn connection_count(&self) -> usize {
        self.state.connections.len()
    }

    pub fn retained_count(&self) -> usize {
        self.state.retained.len()
    }

    /// Run until shutdown. Binds the TCP listener (and the TLS listener
    /// when configured), starts the housekeeper, then accepts connections.
    pub async fn run(&self) -> std::io::Result<()> {
        let listener = TcpListener::bind(self.state.config.bind_addr).await?;
        info!("mqtt/tcp listening on {}", self.state.config.bind_addr);

        if let Some(tls_addr) = self.state.config.tls_bind_addr {
            let key_store = self.state.config.key_store.clone().ok_or_else(|| {
                std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    "tls listener configured without a key store",
                )
            })?;
            let acceptor =
                load_tls_acceptor(&key_store, self.state.config.key_store_password.as_deref())
                    .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;

            let tls_listener = TcpListener::bind(tls_addr).await?;
            info!("mqtt/tls listening on {}", tls_addr);

            let state = self.state.clone();
            let shutdown = self.shutdown.clone();
            tokio::spawn(async move {
                loop {
                    match tls_listener.accept().await {
                        Ok((stream, addr)) => {
                            let acceptor = acceptor.clone();
                            let state = state.clone();
                            let shutdown_rx = shutdown.subscribe();
                            tokio::spawn(async move {
                                match acceptor.accept(stream).await {
                                    Ok(tls_stream) => {
                                        drive_connection(tls_stream, addr, state, shutdown_rx)
                                            .await;
                                    }
                                    Err(e) => {
                                        debug!(%addr, %e, "tls handshake failed");
                                    }
                                }
                            });
                        }
                        Err(e) => error!(%e, "tls accept failed"),
                    }
                }
            });
        }

        // Housekeeper tick: session expiry, delayed wills, retained sweep.
        {
            let state = self.state.clone();
            let mut shutdown_rx = self.shutdown.subscribe();
            let interval = self.state.config.housekeeper_interval;
            tokio::spawn(async move {
                housekeeper::run(state, interval, &mut shutdown_rx).await;
            });
        }

        let mut shutdown_rx = self.shutdown.subscribe();
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, addr)) => {
                            debug!(%addr, "accepted connection");
                            let state = self.state.clone();
                            let shutdown_rx = self.shutdown.subscribe();
                            tokio::spawn(async move {
                                drive_connection(stream, addr, state, shutdown_rx).await;
                            });
                        }
                        Err(e) => error!(%e, "accept failed"),
                    }
                }
                _ = tokio::signal::ctrl_c() => {
                    info!("interrupt received, shutting down");
                    self.shutdown();
                    break;
                }
                _ = shutdown_rx.recv() => break,
            }
        }

        Ok(())
    }

    /// Broadcast shutdown: every connected session gets a DISCONNECT with
    /// "server shutting down" (or the configured redirect), then the accept
    /// loop and connection tasks stop.
    pub fn shutdown(&self) {
        let disconnect = match &self.state.config.redirect {
            Some(redirect) => {
                let mut properties = Properties::default();
                properties.server_reference = Some(redirect.server_reference.clone());
                Disconnect {
                    reason_code: redirect.reason_code,
                    properties,
                }
            }
            None => Disconnect::with_reason(ReasonCode::ServerShuttingDown),
        };

        for entry in self.state.connections.iter() {
            let _ = entry.value().tx.try_send(ConnectionCommand::Close {
                disconnect: disconnect.clone(),
                dispatch_will: false,
            });
        }

        let _ = self.shutdown.send(());
    }
}

impl Default for Broker {
    fn default() -> Self {
        Self::new(BrokerConfig::default())
    }
}

/// Run one connection to completion, racing it against broker shutdown.
async fn drive_connection<S>(
    stream: S,
    addr: SocketAddr,
    state: Arc<BrokerState>,
    mut shutdown_rx: broadcast::Receiver<()>,
) where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    let mut conn = Connection::new(stream, addr, state);
    let fut = conn.run();
    tokio::pin!(fut);

    loop {
        tokio::select! {
            biased;

            result = &mut fut => {
                if let Err(e) = result {
                    debug!(%addr, %e, "connection closed");
                }
                return;
            }
            result = shutdown_rx.recv() => match result {
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                // Give the connection a moment to flush the shutdown
                // DISCONNECT queued by Broker::shutdown.
                _ => {
                    let _ = tokio::time::timeout(Duration::from_millis(250), &mut fut).await;
                    return;
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::SubscriptionOptions;
    use crate::topic::Subscription;
    use bytes::Bytes;

    fn state() -> Arc<BrokerState> {
        Broker::new(BrokerConfig::default()).state()
    }

    fn subscription(client: &str, filter: &str, options: SubscriptionOptions) -> Subscription {
        let share_group = match crate::topic::parse_shared_filter(filter) {
            Ok(Some((group, _))) => Some(Arc::from(group)),
            _ => None,
        };
        Subscription {
            client_id: Arc::from(client),
            filter: Arc::from(filter),
            options,
            subscription_id: None,
            share_group,
        }
    }

    fn publish(topic: &str, qos: QoS) -> Publish {
        Publish {
            qos,
            topic: Arc::from(topic),
            payload: Bytes::from_static(b"x"),
            ..Default::default()
        }
    }

    #[test]
    fn fan_out_skips_no_local_and_caps_qos() {
        let state = state();
        state.sessions.create(Arc::from("origin"), crate::protocol::ProtocolVersion::V5);
        state.sessions.create(Arc::from("other"), crate::protocol::ProtocolVersion::V5);

        state.subscriptions.insert(subscription(
            "origin",
            "t/#",
            SubscriptionOptions {
                qos: QoS::AtLeastOnce,
                no_local: true,
                ..Default::default()
            },
        ));
        state.subscriptions.insert(subscription(
            "other",
            "t/#",
            SubscriptionOptions {
                qos: QoS::AtLeastOnce,
                ..Default::default()
            },
        ));

        state.fan_out("origin", &publish("t/x", QoS::ExactlyOnce));

        // No-local keeps the publisher's own session untouched.
        let origin = state.sessions.get("origin").unwrap();
        assert_eq!(origin.read().pending_ack_len(), 0);

        // The other session tracks one in-flight delivery at min QoS.
        let other = state.sessions.get("other").unwrap();
        assert_eq!(other.read().pending_ack_len(), 1);
    }

    #[test]
    fn fan_out_delivers_once_per_share_group() {
        let state = state();
        state.sessions.create(Arc::from("m1"), crate::protocol::ProtocolVersion::V5);
        state.sessions.create(Arc::from("m2"), crate::protocol::ProtocolVersion::V5);

        let options = SubscriptionOptions {
            qos: QoS::AtLeastOnce,
            ..Default::default()
        };
        state.subscriptions.insert(subscription("m1", "$share/g/t/#", options));
        state.subscriptions.insert(subscription("m2", "$share/g/t/#", options));

        for _ in 0..2 {
            state.fan_out("pub", &publish("t/x", QoS::AtLeastOnce));
        }

        let m1 = state.sessions.get("m1").unwrap().read().pending_ack_len();
        let m2 = state.sessions.get("m2").unwrap().read().pending_ack_len();
        assert_eq!(m1 + m2, 2, "one delivery per publish across the group");
        assert_eq!(m1, 1);
        assert_eq!(m2, 1);
    }

    #[test]
    fn dispatch_will_updates_retained_store() {
        let state = state();
        state.dispatch_will(
            "gone",
            WillMessage {
                topic: "status/gone".to_string(),
                payload: Bytes::from_static(b"offline"),
                qos: QoS::AtMostOnce,
                retain: true,
                delay_interval: 0,
                properties: Properties::default(),
            },
        );

        let retained = state.retained.matching("status/+");
        assert_eq!(retained.len(), 1);
        assert_eq!(retained[0].1.as_ref(), "gone");
        assert_eq!(&retained[0].0.payload[..], b"offline");
    }
}

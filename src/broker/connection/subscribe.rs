//! SUBSCRIBE and UNSUBSCRIBE handling.
//!
//! Each SUBSCRIBE entry runs through the check chain (authorization,
//! filter validity, packet-id reuse, shared-subscription availability and
//! rules, subscription-identifier availability, wildcard availability)
//! and collects one SUBACK reason code. Successful entries land in the
//! index, are persisted, and may trigger retained-message delivery
//! according to their retain-handling option.

use std::sync::Arc;

use parking_lot::RwLock;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, error};

use super::{Connection, ConnectionError};
use crate::persistence::SubscriptionRecord;
use crate::protocol::{
    Packet, Properties, ProtocolError, Publish, QoS, ReasonCode, RetainHandling, SubAck, Subscribe,
    UnsubAck, Unsubscribe,
};
use crate::session::Session;
use crate::topic::{parse_shared_filter, validate_topic_filter, Subscription};

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub(crate) async fn handle_subscribe(
        &mut self,
        client_id: &Arc<str>,
        session: &Arc<RwLock<Session>>,
        subscribe: Subscribe,
    ) -> Result<(), ConnectionError> {
        let config = &self.broker.config;
        let sub_id = subscribe.properties.subscription_identifiers.first().copied();

        let mut reason_codes = Vec::with_capacity(subscribe.filters.len());
        // (filter, granted options, replaced, shared) for entries that may
        // receive retained messages afterwards.
        let mut granted: Vec<(String, crate::protocol::SubscriptionOptions, bool, bool)> =
            Vec::new();

        for entry in &subscribe.filters {
            let authorized = match self
                .broker
                .hooks
                .on_authorize(client_id, &entry.filter, true)
                .await
            {
                Ok(ok) => ok,
                Err(e) => {
                    error!(client_id = %client_id, %e, "authorize hook failed");
                    return Err(ProtocolError::HookFailure("authorize hook").into());
                }
            };

            if !authorized {
                debug!(client_id = %client_id, filter = %entry.filter, "subscribe denied");
                reason_codes.push(ReasonCode::NotAuthorized);
                continue;
            }

            if validate_topic_filter(&entry.filter).is_err() {
                reason_codes.push(ReasonCode::TopicFilterInvalid);
                continue;
            }
            let shared = match parse_shared_filter(&entry.filter) {
                Ok(shared) => shared,
                Err(_) => {
                    reason_codes.push(ReasonCode::TopicFilterInvalid);
                    continue;
                }
            };

            if session.read().packet_id_in_use(subscribe.packet_id) {
                reason_codes.push(ReasonCode::PacketIdentifierInUse);
                continue;
            }

            if shared.is_some() {
                if !config.shared_subscriptions_available {
                    reason_codes.push(ReasonCode::SharedSubscriptionsNotSupported);
                    continue;
                }
                // No-local on a shared subscription is flat-out illegal.
                if entry.options.no_local {
                    return Err(ProtocolError::Violation(
                        ReasonCode::ProtocolError,
                        "no-local on shared subscription",
                    )
                    .into());
                }
            }

            if sub_id.is_some() && !config.subscription_identifiers_available {
                reason_codes.push(ReasonCode::SubscriptionIdentifiersNotSupported);
                continue;
            }

            let has_wildcard = entry.filter.contains('+') || entry.filter.contains('#');
            if has_wildcard && !config.wildcard_subscription_available {
                reason_codes.push(ReasonCode::WildcardSubscriptionsNotSupported);
                continue;
            }

            let granted_qos = entry.options.qos.min(config.max_qos);
            let mut options = entry.options;
            options.qos = granted_qos;

            let replaced = self.broker.subscriptions.insert(Subscription {
                client_id: client_id.clone(),
                filter: Arc::from(entry.filter.as_str()),
                options,
                subscription_id: sub_id,
                share_group: shared.map(|(group, _)| Arc::from(group)),
            });

            if let Some(ref storage) = self.broker.storage {
                let record = SubscriptionRecord::new(&entry.filter, options, sub_id);
                if let Err(e) = storage.persist_subscription(client_id, record).await {
                    error!(client_id = %client_id, %e, "failed to persist subscription");
                    return Err(ProtocolError::HookFailure("subscription persistence").into());
                }
            }

            debug!(
                client_id = %client_id,
                filter = %entry.filter,
                qos = ?granted_qos,
                replaced,
                "subscribed"
            );

            granted.push((
                entry.filter.clone(),
                options,
                replaced,
                shared.is_some(),
            ));
            reason_codes.push(match granted_qos {
                QoS::AtMostOnce => ReasonCode::Success,
                QoS::AtLeastOnce => ReasonCode::GrantedQos1,
                QoS::ExactlyOnce => ReasonCode::GrantedQos2,
            });
        }

        // The three v5 "feature not supported" grants require a disconnect
        // after the SUBACK goes out.
        let fatal = reason_codes.iter().copied().find(|rc| {
            matches!(
                rc,
                ReasonCode::SharedSubscriptionsNotSupported
                    | ReasonCode::SubscriptionIdentifiersNotSupported
                    | ReasonCode::WildcardSubscriptionsNotSupported
            )
        });

        let suback = SubAck {
            packet_id: subscribe.packet_id,
            reason_codes,
            properties: Properties::default(),
        };
        self.write_packet(&Packet::SubAck(suback)).await?;

        if let Some(reason) = fatal {
            return Err(ProtocolError::Violation(reason, "unsupported subscription feature").into());
        }

        // Retained delivery per retain-handling: 0 always, 1 only for new
        // subscriptions, 2 never. Shared subscriptions get none.
        for (filter, options, replaced, shared) in granted {
            let deliver = match options.retain_handling {
                RetainHandling::OnSubscribe => true,
                RetainHandling::OnNewSubscribe => !replaced,
                RetainHandling::Never => false,
            };
            if deliver && !shared {
                self.send_retained(client_id, session, &filter, options, sub_id).await?;
            }
        }

        Ok(())
    }

    /// Deliver the retained messages matching `filter` to this client.
    async fn send_retained(
        &mut self,
        client_id: &Arc<str>,
        session: &Arc<RwLock<Session>>,
        filter: &str,
        options: crate::protocol::SubscriptionOptions,
        subscription_id: Option<u32>,
    ) -> Result<(), ConnectionError> {
        for (stored, origin) in self.broker.retained.matching(filter) {
            // No-local applies to retained delivery too.
            if options.no_local && origin == *client_id {
                continue;
            }

            let mut publish = Publish {
                dup: false,
                qos: stored.qos.min(options.qos),
                retain: true,
                topic: stored.topic.clone(),
                packet_id: None,
                payload: stored.payload.clone(),
                properties: stored.properties.clone(),
            };
            if let Some(id) = subscription_id {
                publish.properties.subscription_identifiers = vec![id];
            }

            let ready = session
                .write()
                .publish(publish)
                .map_err(|rc| ProtocolError::Violation(rc, "packet ids exhausted"))?;
            if let Some(ready) = ready {
                self.write_packet(&Packet::Publish(ready)).await?;
            }
        }
        Ok(())
    }

    pub(crate) async fn handle_unsubscribe(
        &mut self,
        client_id: &Arc<str>,
        _session: &Arc<RwLock<Session>>,
        unsubscribe: Unsubscribe,
    ) -> Result<(), ConnectionError> {
        let mut reason_codes = Vec::with_capacity(unsubscribe.filters.len());

        for filter in &unsubscribe.filters {
            let removed = self.broker.subscriptions.remove(client_id, filter);
            debug!(client_id = %client_id, filter = %filter, removed, "unsubscribe");

            if let Some(ref storage) = self.broker.storage {
                if let Err(e) = storage.remove_subscription(client_id, filter).await {
                    error!(client_id = %client_id, %e, "failed to remove persisted subscription");
                    return Err(ProtocolError::HookFailure("subscription persistence").into());
                }
            }

            if self.encoder_is_v5() {
                reason_codes.push(if removed {
                    ReasonCode::Success
                } else {
                    ReasonCode::NoSubscriptionExisted
                });
            }
        }

        let unsuback = UnsubAck {
            packet_id: unsubscribe.packet_id,
            reason_codes,
            properties: Properties::default(),
        };
        self.write_packet(&Packet::UnsubAck(unsuback)).await
    }
}

//! Session persistence boundary.
//!
//! Best-effort key-value writes keyed by client id. The broker calls these
//! inline from the dispatch path; a failing backend surfaces to the client
//! as an implementation-specific error. The default backend keeps records
//! in memory; durable backends are supplied by the host.

use std::collections::HashMap;
use std::fmt;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::protocol::{ProtocolVersion, SubscriptionOptions};

/// Storage failure.
#[derive(Debug)]
pub struct StorageError(pub String);

impl fmt::Display for StorageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "storage error: {}", self.0)
    }
}

impl std::error::Error for StorageError {}

pub type StorageResult<T> = Result<T, StorageError>;

/// Durable view of a session, written on connect and disconnect.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRecord {
    pub client_id: String,
    pub protocol_level: u8,
    pub clean_start: bool,
    pub session_expiry_interval: u32,
}

impl SessionRecord {
    pub fn from_session(session: &crate::session::Session) -> Self {
        Self {
            client_id: session.client_id.to_string(),
            protocol_level: session.protocol_version as u8,
            clean_start: session.clean_start,
            session_expiry_interval: session.session_expiry_interval,
        }
    }

    pub fn protocol_version(&self) -> Option<ProtocolVersion> {
        ProtocolVersion::from_u8(self.protocol_level)
    }
}

/// Durable view of one subscription.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriptionRecord {
    pub filter: String,
    pub qos: u8,
    pub no_local: bool,
    pub retain_as_published: bool,
    pub retain_handling: u8,
    pub subscription_id: Option<u32>,
}

impl SubscriptionRecord {
    pub fn new(filter: &str, options: SubscriptionOptions, subscription_id: Option<u32>) -> Self {
        Self {
            filter: filter.to_string(),
            qos: options.qos as u8,
            no_local: options.no_local,
            retain_as_published: options.retain_as_published,
            retain_handling: options.retain_handling as u8,
            subscription_id,
        }
    }
}

/// Best-effort durable store, keyed by client id.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    async fn persist_session(&self, client_id: &str, session: SessionRecord) -> StorageResult<()>;

    async fn remove_session(&self, client_id: &str) -> StorageResult<()>;

    async fn persist_subscription(
        &self,
        client_id: &str,
        subscription: SubscriptionRecord,
    ) -> StorageResult<()>;

    async fn remove_subscription(&self, client_id: &str, filter: &str) -> StorageResult<()>;
}

/// In-memory backend; the default when no durable store is configured.
#[derive(Default)]
pub struct MemoryBackend {
    sessions: RwLock<HashMap<String, SessionRecord>>,
    subscriptions: RwLock<HashMap<String, Vec<SubscriptionRecord>>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn session(&self, client_id: &str) -> Option<SessionRecord> {
        self.sessions.read().get(client_id).cloned()
    }

    pub fn subscriptions(&self, client_id: &str) -> Vec<SubscriptionRecord> {
        self.subscriptions
            .read()
            .get(client_id)
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl StorageBackend for MemoryBackend {
    async fn persist_session(&self, client_id: &str, session: SessionRecord) -> StorageResult<()> {
        self.sessions
            .write()
            .insert(client_id.to_string(), session);
        Ok(())
    }

    async fn remove_session(&self, client_id: &str) -> StorageResult<()> {
        self.sessions.write().remove(client_id);
        self.subscriptions.write().remove(client_id);
        Ok(())
    }

    async fn persist_subscription(
        &self,
        client_id: &str,
        subscription: SubscriptionRecord,
    ) -> StorageResult<()> {
        let mut subs = self.subscriptions.write();
        let entries = subs.entry(client_id.to_string()).or_default();
        entries.retain(|s| s.filter != subscription.filter);
        entries.push(subscription);
        Ok(())
    }

    async fn remove_subscription(&self, client_id: &str, filter: &str) -> StorageResult<()> {
        if let Some(entries) = self.subscriptions.write().get_mut(client_id) {
            entries.retain(|s| s.filter != filter);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::QoS;

    #[tokio::test]
    async fn subscription_records_replace_by_filter() {
        let backend = MemoryBackend::new();
        let options = SubscriptionOptions {
            qos: QoS::AtLeastOnce,
            ..Default::default()
        };

        backend
            .persist_subscription("c1", SubscriptionRecord::new("a/+", options, None))
            .await
            .unwrap();
        backend
            .persist_subscription("c1", SubscriptionRecord::new("a/+", options, Some(7)))
            .await
            .unwrap();

        let subs = backend.subscriptions("c1");
        assert_eq!(subs.len(), 1);
        assert_eq!(subs[0].subscription_id, Some(7));

        backend.remove_subscription("c1", "a/+").await.unwrap();
        assert!(backend.subscriptions("c1").is_empty());
    }
}

//! Extension hooks.
//!
//! Host-supplied callbacks invoked inline from the dispatch path:
//! authentication, topic authorization, a packet interceptor, connection
//! lifecycle notifications, and per-client byte counters. Enhanced (v5)
//! authentication providers are looked up here by method name.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

use crate::protocol::Packet;

#[cfg(test)]
mod tests;

/// Hook failure; surfaces to the client as an implementation-specific error.
#[derive(Debug)]
pub enum HookError {
    Internal(String),
}

impl fmt::Display for HookError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HookError::Internal(msg) => write!(f, "internal hook error: {}", msg),
        }
    }
}

impl std::error::Error for HookError {}

pub type HookResult<T> = Result<T, HookError>;

/// Outcome of one enhanced-authentication round.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthOutcome {
    /// More rounds needed; the data goes out in an AUTH packet with reason
    /// "continue authentication".
    Continue(Option<Bytes>),
    /// Exchange complete; the data goes out in the CONNACK.
    Success(Option<Bytes>),
    /// Exchange failed; the client is disconnected with "not authorized".
    Failure,
}

/// One v5 enhanced-authentication method (e.g. SCRAM-SHA-1).
#[async_trait]
pub trait EnhancedAuthProvider: Send + Sync {
    /// Called for the CONNECT's authentication data and for every
    /// subsequent AUTH packet in the exchange.
    async fn auth_received(&self, client_id: &str, data: Option<&[u8]>) -> AuthOutcome;
}

/// Broker extension points. Every method has an allow-everything default.
#[async_trait]
pub trait Hooks: Send + Sync {
    /// Credential check, once per CONNECT. `username`/`password` are absent
    /// when the client supplied none; a provider that requires credentials
    /// returns `Ok(false)` in that case.
    async fn on_authenticate(
        &self,
        _client_id: &str,
        _username: Option<&str>,
        _password: Option<&[u8]>,
    ) -> HookResult<bool> {
        Ok(true)
    }

    /// Topic authorization, once per PUBLISH and per SUBSCRIBE entry.
    async fn on_authorize(
        &self,
        _client_id: &str,
        _topic: &str,
        _is_subscription: bool,
    ) -> HookResult<bool> {
        Ok(true)
    }

    /// Enhanced-auth provider lookup by method name. `None` rejects the
    /// CONNECT with "bad authentication method".
    fn enhanced_auth_provider(&self, _method: &str) -> Option<Arc<dyn EnhancedAuthProvider>> {
        None
    }

    /// Interceptor, called after every successfully dispatched inbound
    /// packet.
    async fn on_packet_received(&self, _client_id: &str, _packet: &Packet) {}

    /// Byte counters.
    fn on_bytes_received(&self, _client_id: &str, _n: usize) {}
    fn on_bytes_sent(&self, _client_id: &str, _n: usize) {}

    async fn on_client_connected(&self, _client_id: &str, _username: Option<&str>) {}

    /// `graceful` is true when the client sent DISCONNECT.
    async fn on_client_disconnected(&self, _client_id: &str, _graceful: bool) {}
}

/// Allow-everything hooks.
#[derive(Default)]
pub struct DefaultHooks;

#[async_trait]
impl Hooks for DefaultHooks {}

#[async_trait]
impl<T: Hooks + ?Sized> Hooks for Arc<T> {
    async fn on_authenticate(
        &self,
        client_id: &str,
        username: Option<&str>,
        password: Option<&[u8]>,
    ) -> HookResult<bool> {
        (**self).on_authenticate(client_id, username, password).await
    }

    async fn on_authorize(
        &self,
        client_id: &str,
        topic: &str,
        is_subscription: bool,
    ) -> HookResult<bool> {
        (**self).on_authorize(client_id, topic, is_subscription).await
    }

    fn enhanced_auth_provider(&self, method: &str) -> Option<Arc<dyn EnhancedAuthProvider>> {
        (**self).enhanced_auth_provider(method)
    }

    async fn on_packet_received(&self, client_id: &str, packet: &Packet) {
        (**self).on_packet_received(client_id, packet).await;
    }

    fn on_bytes_received(&self, client_id: &str, n: usize) {
        (**self).on_bytes_received(client_id, n);
    }

    fn on_bytes_sent(&self, client_id: &str, n: usize) {
        (**self).on_bytes_sent(client_id, n);
    }

    async fn on_client_connected(&self, client_id: &str, username: Option<&str>) {
        (**self).on_client_connected(client_id, username).await;
    }

    async fn on_client_disconnected(&self, client_id: &str, graceful: bool) {
        (**self).on_client_disconnected(client_id, graceful).await;
    }
}

/// Chains several hook implementations. Authentication and authorization
/// pass only when every member allows; events reach every member; the first
/// member claiming an enhanced-auth method wins.
pub struct CompositeHooks {
    hooks: Vec<Box<dyn Hooks>>,
}

impl CompositeHooks {
    pub fn new() -> Self {
        Self { hooks: Vec::new() }
    }

    pub fn with<H: Hooks + 'static>(mut self, hooks: H) -> Self {
        self.hooks.push(Box::new(hooks));
        self
    }
}

impl Default for CompositeHooks {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Hooks for CompositeHooks {
    async fn on_authenticate(
        &self,
        client_id: &str,
        username: Option<&str>,
        password: Option<&[u8]>,
    ) -> HookResult<bool> {
        for hooks in &self.hooks {
            if !hooks.on_authenticate(client_id, username, password).await? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    async fn on_authorize(
        &self,
        client_id: &str,
        topic: &str,
        is_subscription: bool,
    ) -> HookResult<bool> {
        for hooks in &self.hooks {
            if !hooks.on_authorize(client_id, topic, is_subscription).await? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn enhanced_auth_provider(&self, method: &str) -> Option<Arc<dyn EnhancedAuthProvider>> {
        self.hooks
            .iter()
            .find_map(|h| h.enhanced_auth_provider(method))
    }

    async fn on_packet_received(&self, client_id: &str, packet: &Packet) {
        for hooks in &self.hooks {
            hooks.on_packet_received(client_id, packet).await;
        }
    }

    fn on_bytes_received(&self, client_id: &str, n: usize) {
        for hooks in &self.hooks {
            hooks.on_bytes_received(client_id, n);
        }
    }

    fn on_bytes_sent(&self, client_id: &str, n: usize) {
        for hooks in &self.hooks {
            hooks.on_bytes_sent(client_id, n);
        }
    }

    async fn on_client_connected(&self, client_id: &str, username: Option<&str>) {
        for hooks in &self.hooks {
            hooks.on_client_connected(client_id, username).await;
        }
    }

    async fn on_client_disconnected(&self, client_id: &str, graceful: bool) {
        for hooks in &self.hooks {
            hooks.on_client_disconnected(client_id, graceful).await;
        }
    }
}

//! Hooks tests

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

use super::*;

struct DenyAll;

#[async_trait]
impl Hooks for DenyAll {
    async fn on_authenticate(
        &self,
        _client_id: &str,
        _username: Option<&str>,
        _password: Option<&[u8]>,
    ) -> HookResult<bool> {
        Ok(false)
    }

    async fn on_authorize(
        &self,
        _client_id: &str,
        _topic: &str,
        _is_subscription: bool,
    ) -> HookResult<bool> {
        Ok(false)
    }
}

struct Counting {
    packets: AtomicUsize,
    bytes_in: AtomicUsize,
}

#[async_trait]
impl Hooks for Counting {
    async fn on_packet_received(&self, _client_id: &str, _packet: &Packet) {
        self.packets.fetch_add(1, Ordering::Relaxed);
    }

    fn on_bytes_received(&self, _client_id: &str, n: usize) {
        self.bytes_in.fetch_add(n, Ordering::Relaxed);
    }
}

struct OneShotAuth;

#[async_trait]
impl EnhancedAuthProvider for OneShotAuth {
    async fn auth_received(&self, _client_id: &str, data: Option<&[u8]>) -> AuthOutcome {
        match data {
            Some(b"open-sesame") => AuthOutcome::Success(Some(Bytes::from_static(b"ok"))),
            Some(_) => AuthOutcome::Failure,
            None => AuthOutcome::Continue(None),
        }
    }
}

struct RegistryHooks;

#[async_trait]
impl Hooks for RegistryHooks {
    fn enhanced_auth_provider(&self, method: &str) -> Option<Arc<dyn EnhancedAuthProvider>> {
        (method == "sesame").then(|| Arc::new(OneShotAuth) as Arc<dyn EnhancedAuthProvider>)
    }
}

#[tokio::test]
async fn default_hooks_allow_everything() {
    let hooks = DefaultHooks;
    assert!(hooks.on_authenticate("c1", None, None).await.unwrap());
    assert!(hooks.on_authorize("c1", "any/topic", false).await.unwrap());
    assert!(hooks.enhanced_auth_provider("sesame").is_none());
}

#[tokio::test]
async fn composite_denies_when_any_member_denies() {
    let hooks = CompositeHooks::new().with(DefaultHooks).with(DenyAll);
    assert!(!hooks.on_authenticate("c1", Some("u"), None).await.unwrap());
    assert!(!hooks.on_authorize("c1", "t", true).await.unwrap());
}

#[tokio::test]
async fn composite_fans_events_to_all_members() {
    let counting = Arc::new(Counting {
        packets: AtomicUsize::new(0),
        bytes_in: AtomicUsize::new(0),
    });
    let hooks = CompositeHooks::new()
        .with(counting.clone())
        .with(DefaultHooks);

    hooks.on_packet_received("c1", &Packet::PingReq).await;
    hooks.on_bytes_received("c1", 42);

    assert_eq!(counting.packets.load(Ordering::Relaxed), 1);
    assert_eq!(counting.bytes_in.load(Ordering::Relaxed), 42);
}

#[tokio::test]
async fn composite_finds_enhanced_auth_provider() {
    let hooks = CompositeHooks::new().with(DefaultHooks).with(RegistryHooks);

    let provider = hooks.enhanced_auth_provider("sesame").expect("registered");
    assert_eq!(
        provider.auth_received("c1", None).await,
        AuthOutcome::Continue(None)
    );
    assert_eq!(
        provider.auth_received("c1", Some(b"open-sesame")).await,
        AuthOutcome::Success(Some(Bytes::from_static(b"ok")))
    );
    assert_eq!(
        provider.auth_received("c1", Some(b"wrong")).await,
        AuthOutcome::Failure
    );

    assert!(hooks.enhanced_auth_provider("other").is_none());
}

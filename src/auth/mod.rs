//! Authentication providers.
//!
//! `PasswordAuthProvider` checks CONNECT credentials against the users
//! configured in the TOML file. `EnhancedAuthRegistry` maps v5
//! authentication-method names to host-registered providers.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::config::AuthConfig;
use crate::hooks::{EnhancedAuthProvider, HookResult, Hooks};


/// Username/password authentication from configuration.
pub struct PasswordAuthProvider {
    enabled: bool,
    allow_anonymous: bool,
    /// username -> password
    users: HashMap<String, String>,
}

impl PasswordAuthProvider {
    pub fn new(config: &AuthConfig) -> Self {
        let users = config
            .users
            .iter()
            .map(|u| (u.username.clone(), u.password.clone()))
            .collect();
        Self {
            enabled: config.enabled,
            allow_anonymous: config.allow_anonymous,
            users,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    fn check(&self, username: &str, password: &[u8]) -> bool {
        match (self.users.get(username), std::str::from_utf8(password)) {
            (Some(stored), Ok(given)) => stored == given,
            _ => false,
        }
    }
}

#[async_trait]
impl Hooks for PasswordAuthProvider {
    async fn on_authenticate(
        &self,
        _client_id: &str,
        username: Option<&str>,
        password: Option<&[u8]>,
    ) -> HookResult<bool> {
        if !self.enabled {
            return Ok(true);
        }

        let Some(username) = username else {
            return Ok(self.allow_anonymous);
        };

        Ok(self.check(username, password.unwrap_or(&[])))
    }
}

/// Registry of enhanced-authentication providers, keyed by method name
/// (e.g. "SCRAM-SHA-256"). Installed as a hooks layer; a CONNECT naming a
/// method with no provider is refused with "bad authentication method".
#[derive(Default)]
pub struct EnhancedAuthRegistry {
    providers: RwLock<HashMap<String, Arc<dyn EnhancedAuthProvider>>>,
}

impl EnhancedAuthRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, method: impl Into<String>, provider: Arc<dyn EnhancedAuthProvider>) {
        self.providers.write().insert(method.into(), provider);
    }
}

#[async_trait]
impl Hooks for EnhancedAuthRegistry {
    fn enhanced_auth_provider(&self, method: &str) -> Option<Arc<dyn EnhancedAuthProvider>> {
        self.providers.read().get(method).cloned()
    }
}

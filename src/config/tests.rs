//! Config tests

use std::io::Write;
use std::path::PathBuf;

use super::*;
use crate::protocol::ReasonCode;

fn write_config(name: &str, contents: &str) -> PathBuf {
    let path = std::env::temp_dir().join(format!("lumenmq-test-{}-{}.toml", std::process::id(), name));
    let mut file = std::fs::File::create(&path).expect("create temp config");
    file.write_all(contents.as_bytes()).expect("write temp config");
    path
}

#[test]
fn defaults_are_sensible() {
    let config = Config::default();
    assert_eq!(config.server.bind.port(), 1883);
    assert_eq!(config.mqtt.max_qos, 2);
    assert!(config.mqtt.retain_available);
    assert!(!config.auth.enabled);
    assert!(config.redirect.is_none());
}

#[test]
fn full_file_parses() {
    let path = write_config(
        "full",
        r#"
[log]
level = "debug"

[server]
bind = "127.0.0.1:2883"

[limits]
max_connections = 64
max_packet_size = 4096

[session]
max_session_expiry = 3600
server_keep_alive = 30

[mqtt]
receive_maximum = 10
max_qos = 1
retain_available = false
shared_subscriptions = false
response_information = "reply/"

[auth]
enabled = true
allow_anonymous = false

[[auth.users]]
username = "alice"
password = "secret"

[redirect]
server_reference = "other.example:1883"
permanent = true
"#,
    );

    let config = Config::load(&path).expect("load config");
    std::fs::remove_file(&path).ok();

    assert_eq!(config.log.level, "debug");
    assert_eq!(config.server.bind.port(), 2883);
    assert_eq!(config.limits.max_connections, 64);
    assert_eq!(config.session.server_keep_alive, Some(30));
    assert_eq!(config.mqtt.receive_maximum, 10);
    assert!(!config.mqtt.retain_available);
    assert_eq!(config.auth.users.len(), 1);

    let broker = config.to_broker_config();
    assert_eq!(broker.max_qos as u8, 1);
    assert!(!broker.shared_subscriptions_available);
    assert_eq!(broker.response_information.as_deref(), Some("reply/"));
    let redirect = broker.redirect.expect("redirect configured");
    assert_eq!(redirect.reason_code, ReasonCode::ServerMoved);
    assert_eq!(redirect.server_reference, "other.example:1883");
}

#[test]
fn invalid_max_qos_is_rejected() {
    let path = write_config("badqos", "[mqtt]\nmax_qos = 3\n");
    let result = Config::load(&path);
    std::fs::remove_file(&path).ok();
    assert!(matches!(result, Err(ConfigError::Validation(_))));
}

#[test]
fn tls_bind_requires_key_store() {
    let path = write_config("tls", "[server]\ntls_bind = \"0.0.0.0:8883\"\n");
    let result = Config::load(&path);
    std::fs::remove_file(&path).ok();
    assert!(matches!(result, Err(ConfigError::Validation(_))));
}

#[test]
fn env_substitution_with_defaults() {
    let substituted = substitute_env_vars("bind = \"${LUMENMQ_TEST_UNSET_HOST:-0.0.0.0}:1883\"");
    assert_eq!(substituted, "bind = \"0.0.0.0:1883\"");
}

//! Configuration loading and validation tests
//!
//! Tests focus on BEHAVIOR of configuration loading: what a file on disk
//! resolves to and which mistakes are rejected.

use mqtt_session::config::{ConfigError, Endpoint, SessionConfig};
use mqtt_session::QoS;
use std::io::Write;
use std::path::Path;
use std::time::Duration;
use tempfile::NamedTempFile;

fn write_config(content: &str) -> NamedTempFile {
    let mut temp_file = NamedTempFile::new().unwrap();
    writeln!(temp_file, "{content}").unwrap();
    temp_file
}

#[test]
fn test_config_loads_successfully_from_valid_toml() {
    let temp_file = write_config(
        r#"
[broker]
url = "mqtts://broker.example.com"

[session]
client_id = "kitchen-sensor"
clean_session = false
keepalive_secs = 30
ping_timeout_ms = 5000
reconnect_period_ms = 2500
connect_timeout_ms = 8000
resubscribe = false
max_packet_size = 4096
"#,
    );

    let config = SessionConfig::load_from_file(temp_file.path()).unwrap();

    assert_eq!(config.endpoint, Endpoint::tls("broker.example.com", 8883));
    assert_eq!(config.client_id, "kitchen-sensor");
    assert!(!config.clean_session);
    assert_eq!(config.keepalive, Duration::from_secs(30));
    assert_eq!(config.ping_timeout, Duration::from_millis(5000));
    assert_eq!(config.reconnect_period, Some(Duration::from_millis(2500)));
    assert_eq!(config.connect_timeout, Duration::from_millis(8000));
    assert!(!config.resubscribe);
    assert_eq!(config.max_packet_size, 4096);
}

#[test]
fn test_credentials_come_from_named_environment_variables() {
    // Arrange: unique names so parallel tests cannot collide
    std::env::set_var("MQTT_SESSION_TEST_USER_1", "alice");
    std::env::set_var("MQTT_SESSION_TEST_PASS_1", "s3cret");
    let temp_file = write_config(
        r#"
[broker]
url = "mqtt://localhost:1883"
username_env = "MQTT_SESSION_TEST_USER_1"
password_env = "MQTT_SESSION_TEST_PASS_1"
"#,
    );

    // Act
    let config = SessionConfig::load_from_file(temp_file.path()).unwrap();

    // Assert
    assert_eq!(config.username.as_deref(), Some("alice"));
    assert_eq!(config.password.as_deref(), Some("s3cret"));
}

#[test]
fn test_missing_credential_variables_resolve_to_none() {
    let temp_file = write_config(
        r#"
[broker]
url = "mqtt://localhost:1883"
username_env = "MQTT_SESSION_TEST_UNSET_USER"
"#,
    );

    let config = SessionConfig::load_from_file(temp_file.path()).unwrap();
    assert_eq!(config.username, None);
    assert_eq!(config.password, None);
}

#[test]
fn test_will_is_loaded() {
    let temp_file = write_config(
        r#"
[broker]
url = "mqtt://localhost"

[will]
topic = "devices/kitchen/status"
payload = "offline"
qos = 2
"#,
    );

    let will = SessionConfig::load_from_file(temp_file.path())
        .unwrap()
        .last_will
        .unwrap();
    assert_eq!(will.topic, "devices/kitchen/status");
    assert_eq!(will.message.as_ref(), b"offline");
    assert_eq!(will.qos, QoS::ExactlyOnce);
    assert!(!will.retain);
}

#[test]
fn test_missing_file_is_a_read_error() {
    let result = SessionConfig::load_from_file(Path::new("/nonexistent/mqtt-session.toml"));
    assert!(matches!(result, Err(ConfigError::FileRead(_))));
}

#[test]
fn test_malformed_toml_is_a_parse_error() {
    let temp_file = write_config("[broker\nurl = ");
    let result = SessionConfig::load_from_file(temp_file.path());
    assert!(matches!(result, Err(ConfigError::TomlParse(_))));
}

#[test]
fn test_missing_broker_section_is_rejected() {
    let temp_file = write_config(
        r#"
[session]
client_id = "orphan"
"#,
    );
    let result = SessionConfig::load_from_file(temp_file.path());
    assert!(matches!(result, Err(ConfigError::TomlParse(_))));
}

#[test]
fn test_unsupported_scheme_is_rejected() {
    let temp_file = write_config(
        r#"
[broker]
url = "ws://localhost:9001"
"#,
    );
    let result = SessionConfig::load_from_file(temp_file.path());
    assert!(matches!(result, Err(ConfigError::InvalidBrokerUrl(_))));
}

#[test]
fn test_zero_max_packet_size_is_rejected() {
    let temp_file = write_config(
        r#"
[broker]
url = "mqtt://localhost"

[session]
max_packet_size = 0
"#,
    );
    let result = SessionConfig::load_from_file(temp_file.path());
    assert!(matches!(result, Err(ConfigError::InvalidConfig(_))));
}

#[test]
fn test_generated_client_ids_are_unique() {
    let temp_file = write_config(
        r#"
[broker]
url = "mqtt://localhost"
"#,
    );
    let first = SessionConfig::load_from_file(temp_file.path()).unwrap();
    let second = SessionConfig::load_from_file(temp_file.path()).unwrap();
    assert_ne!(first.client_id, second.client_id);
}

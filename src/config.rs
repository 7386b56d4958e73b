//! Session configuration
//!
//! [`SessionConfig`] is resolved once before the session starts and is
//! immutable afterwards. It can be built in code or loaded from a TOML file
//! whose `[broker]` section names environment variables for credentials,
//! following the same pattern for secrets as the rest of the deployment.

use crate::protocol::{qos_from_u8, LastWill, DEFAULT_MAX_PACKET_SIZE};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use url::Url;

pub const DEFAULT_PLAIN_PORT: u16 = 1883;
pub const DEFAULT_TLS_PORT: u16 = 8883;

/// Where the broker lives and whether the stream is encrypted
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
    pub tls: bool,
}

impl Endpoint {
    pub fn plain(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            tls: false,
        }
    }

    pub fn tls(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            tls: true,
        }
    }

    /// Parse `mqtt://`, `tcp://`, `mqtts://`, `ssl://` or `tls://` URLs
    pub fn parse(broker_url: &str) -> Result<Self, ConfigError> {
        let url = Url::parse(broker_url)
            .map_err(|_| ConfigError::InvalidBrokerUrl(broker_url.to_string()))?;

        let tls = match url.scheme() {
            "mqtt" | "tcp" => false,
            "mqtts" | "ssl" | "tls" => true,
            _ => return Err(ConfigError::InvalidBrokerUrl(broker_url.to_string())),
        };

        let host = url
            .host_str()
            .filter(|host| !host.is_empty())
            .ok_or_else(|| ConfigError::InvalidBrokerUrl(broker_url.to_string()))?;
        let port = url
            .port()
            .unwrap_or(if tls { DEFAULT_TLS_PORT } else { DEFAULT_PLAIN_PORT });

        Ok(Self {
            host: host.to_string(),
            port,
            tls,
        })
    }
}

/// Immutable settings for one session
#[derive(Debug, Clone, PartialEq)]
pub struct SessionConfig {
    pub endpoint: Endpoint,
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub clean_session: bool,
    /// Liveness interval; zero disables the ping cycle
    pub keepalive: Duration,
    /// How long to wait for a ping response
    pub ping_timeout: Duration,
    /// Minimum spacing between connection attempts; `None` disables reconnection
    pub reconnect_period: Option<Duration>,
    /// How long to wait for the handshake acknowledgement
    pub connect_timeout: Duration,
    /// Re-send remembered subscriptions after a reconnect
    pub resubscribe: bool,
    pub last_will: Option<LastWill>,
    /// Largest inbound frame accepted by the codec
    pub max_packet_size: usize,
    /// Capacity of the event broadcast channel
    pub event_capacity: usize,
}

impl SessionConfig {
    pub fn new(endpoint: Endpoint, client_id: impl Into<String>) -> Self {
        Self {
            endpoint,
            client_id: client_id.into(),
            username: None,
            password: None,
            clean_session: true,
            keepalive: Duration::from_secs(default_keepalive_secs()),
            ping_timeout: Duration::from_millis(default_ping_timeout_ms()),
            reconnect_period: Some(Duration::from_millis(default_reconnect_period_ms() as u64)),
            connect_timeout: Duration::from_millis(default_connect_timeout_ms()),
            resubscribe: true,
            last_will: None,
            max_packet_size: DEFAULT_MAX_PACKET_SIZE,
            event_capacity: 256,
        }
    }

    /// Load configuration from a TOML file, resolving credential environment variables
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let file: ConfigFile = toml::from_str(&content)?;
        file.resolve()
    }

    pub fn liveness_enabled(&self) -> bool {
        !self.keepalive.is_zero()
    }

    pub fn reconnect_enabled(&self) -> bool {
        self.reconnect_period.is_some()
    }
}

/// On-disk configuration layout
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConfigFile {
    pub broker: BrokerSection,
    #[serde(default)]
    pub session: SessionSection,
    pub will: Option<WillSection>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BrokerSection {
    /// Broker URL with protocol and optional port
    pub url: String,
    /// Environment variable containing username
    pub username_env: Option<String>,
    /// Environment variable containing password
    pub password_env: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionSection {
    /// Client identifier; generated when absent
    pub client_id: Option<String>,
    #[serde(default = "default_true")]
    pub clean_session: bool,
    #[serde(default = "default_keepalive_secs")]
    pub keepalive_secs: u64,
    #[serde(default = "default_ping_timeout_ms")]
    pub ping_timeout_ms: u64,
    /// Negative values disable reconnection
    #[serde(default = "default_reconnect_period_ms")]
    pub reconnect_period_ms: i64,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_true")]
    pub resubscribe: bool,
    #[serde(default = "default_max_packet_size")]
    pub max_packet_size: usize,
}

impl Default for SessionSection {
    fn default() -> Self {
        Self {
            client_id: None,
            clean_session: true,
            keepalive_secs: default_keepalive_secs(),
            ping_timeout_ms: default_ping_timeout_ms(),
            reconnect_period_ms: default_reconnect_period_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
            resubscribe: true,
            max_packet_size: default_max_packet_size(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WillSection {
    pub topic: String,
    #[serde(default)]
    pub payload: String,
    #[serde(default)]
    pub qos: u8,
    #[serde(default)]
    pub retain: bool,
}

fn default_true() -> bool {
    true
}

fn default_keepalive_secs() -> u64 {
    60
}

fn default_ping_timeout_ms() -> u64 {
    10_000
}

fn default_reconnect_period_ms() -> i64 {
    1_000
}

fn default_connect_timeout_ms() -> u64 {
    30_000
}

fn default_max_packet_size() -> usize {
    DEFAULT_MAX_PACKET_SIZE
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("Failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Invalid broker URL: {0}")]
    InvalidBrokerUrl(String),
    #[error("Invalid client ID: {0}")]
    InvalidClientId(String),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl ConfigFile {
    /// Turn the file layout into an immutable [`SessionConfig`]
    pub fn resolve(&self) -> Result<SessionConfig, ConfigError> {
        let endpoint = Endpoint::parse(&self.broker.url)?;

        let client_id = match &self.session.client_id {
            Some(id) => {
                validate_client_id(id)?;
                id.clone()
            }
            None => generate_client_id(),
        };

        if self.session.max_packet_size == 0 {
            return Err(ConfigError::InvalidConfig(
                "max_packet_size must be greater than 0".to_string(),
            ));
        }

        let last_will = match &self.will {
            Some(will) => {
                let qos = qos_from_u8(will.qos).ok_or_else(|| {
                    ConfigError::InvalidConfig(format!("will qos {} is not 0, 1 or 2", will.qos))
                })?;
                if will.topic.is_empty() {
                    return Err(ConfigError::InvalidConfig(
                        "will topic must not be empty".to_string(),
                    ));
                }
                Some(LastWill::new(
                    will.topic.clone(),
                    will.payload.clone().into_bytes(),
                    qos,
                    will.retain,
                ))
            }
            None => None,
        };

        let mut config = SessionConfig::new(endpoint, client_id);
        config.username = get_env_var_optional(self.broker.username_env.as_ref());
        config.password = get_env_var_optional(self.broker.password_env.as_ref());
        config.clean_session = self.session.clean_session;
        config.keepalive = Duration::from_secs(self.session.keepalive_secs);
        config.ping_timeout = Duration::from_millis(self.session.ping_timeout_ms);
        config.reconnect_period = u64::try_from(self.session.reconnect_period_ms)
            .ok()
            .map(Duration::from_millis);
        config.connect_timeout = Duration::from_millis(self.session.connect_timeout_ms);
        config.resubscribe = self.session.resubscribe;
        config.last_will = last_will;
        config.max_packet_size = self.session.max_packet_size;
        Ok(config)
    }
}

fn get_env_var_optional(env_var_name: Option<&String>) -> Option<String> {
    env_var_name.and_then(|name| std::env::var(name).ok())
}

fn generate_client_id() -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    format!("mqtt-session-{}", &id[..8])
}

/// Client ids must be 1..=65535 bytes and free of control characters
fn validate_client_id(client_id: &str) -> Result<(), ConfigError> {
    if client_id.is_empty() || client_id.len() > u16::MAX as usize {
        return Err(ConfigError::InvalidClientId(format!(
            "client ID '{client_id}' must be between 1 and 65535 bytes"
        )));
    }
    if client_id.chars().any(char::is_control) {
        return Err(ConfigError::InvalidClientId(format!(
            "client ID '{client_id}' contains control characters"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::QoS;

    #[test]
    fn test_endpoint_parsing() {
        assert_eq!(
            Endpoint::parse("mqtt://localhost").unwrap(),
            Endpoint::plain("localhost", 1883)
        );
        assert_eq!(
            Endpoint::parse("mqtts://broker.example.com").unwrap(),
            Endpoint::tls("broker.example.com", 8883)
        );
        assert_eq!(
            Endpoint::parse("tcp://10.0.0.2:1884").unwrap(),
            Endpoint::plain("10.0.0.2", 1884)
        );
        assert!(matches!(
            Endpoint::parse("http://localhost"),
            Err(ConfigError::InvalidBrokerUrl(_))
        ));
        assert!(matches!(
            Endpoint::parse("invalid-url"),
            Err(ConfigError::InvalidBrokerUrl(_))
        ));
    }

    #[test]
    fn test_minimal_config_uses_defaults() {
        let file: ConfigFile = toml::from_str(
            r#"
[broker]
url = "mqtt://localhost:1883"
"#,
        )
        .unwrap();
        let config = file.resolve().unwrap();

        assert!(config.client_id.starts_with("mqtt-session-"));
        assert_eq!(config.client_id.len(), "mqtt-session-".len() + 8);
        assert_eq!(config.keepalive, Duration::from_secs(60));
        assert_eq!(config.ping_timeout, Duration::from_secs(10));
        assert_eq!(config.reconnect_period, Some(Duration::from_secs(1)));
        assert_eq!(config.connect_timeout, Duration::from_secs(30));
        assert!(config.clean_session);
        assert!(config.resubscribe);
        assert!(config.last_will.is_none());
    }

    #[test]
    fn test_negative_reconnect_period_disables_reconnection() {
        let file: ConfigFile = toml::from_str(
            r#"
[broker]
url = "mqtt://localhost"

[session]
client_id = "no-retry"
reconnect_period_ms = -1
keepalive_secs = 0
"#,
        )
        .unwrap();
        let config = file.resolve().unwrap();

        assert_eq!(config.reconnect_period, None);
        assert!(!config.reconnect_enabled());
        assert!(!config.liveness_enabled());
    }

    #[test]
    fn test_will_section() {
        let file: ConfigFile = toml::from_str(
            r#"
[broker]
url = "mqtt://localhost"

[will]
topic = "clients/me/status"
payload = "gone"
qos = 1
retain = true
"#,
        )
        .unwrap();
        let will = file.resolve().unwrap().last_will.unwrap();
        assert_eq!(will.topic, "clients/me/status");
        assert_eq!(will.message.as_ref(), b"gone");
        assert_eq!(will.qos, QoS::AtLeastOnce);
        assert!(will.retain);
    }

    #[test]
    fn test_invalid_will_qos() {
        let file: ConfigFile = toml::from_str(
            r#"
[broker]
url = "mqtt://localhost"

[will]
topic = "t"
qos = 3
"#,
        )
        .unwrap();
        assert!(matches!(file.resolve(), Err(ConfigError::InvalidConfig(_))));
    }

    #[test]
    fn test_invalid_client_id() {
        assert!(validate_client_id("").is_err());
        assert!(validate_client_id("bad\nid").is_err());
        assert!(validate_client_id("sensor-01.kitchen").is_ok());
    }
}

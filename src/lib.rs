//! MQTT Session - client-side session manager for MQTT 3.1.1
//!
//! An event-driven session that owns connection establishment, the CONNECT
//! handshake, keepalive probing, reconnection with backoff and reassembly of
//! frames the transport splits or coalesces.
//!
//! # Overview
//!
//! - [`protocol`]: packet model, the [`Codec`] trait and the MQTT 3.1.1 codec
//! - [`transport`]: the [`Transport`] trait and a TCP/TLS implementation
//! - [`session`]: the session actor and its [`Session`] handle
//! - [`config`]: [`SessionConfig`] built in code or loaded from TOML
//!
//! # Quick Start
//!
//! ```no_run
//! use mqtt_session::{Endpoint, PublishOptions, QoS, Session, SessionConfig, SessionEvent};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let config = SessionConfig::new(Endpoint::plain("localhost", 1883), "sensor-7");
//! let session = Session::new(config);
//! let mut events = session.events();
//! session.connect()?;
//!
//! while let Ok(event) = events.recv().await {
//!     if let SessionEvent::Connect { .. } = event {
//!         let options = PublishOptions { qos: QoS::AtLeastOnce, ..Default::default() };
//!         session.publish("sensors/7/temperature", b"21.5", options)?;
//!         break;
//!     }
//! }
//! session.shutdown().await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod observability;
pub mod protocol;
pub mod session;
pub mod testing;
pub mod transport;

pub use config::{ConfigError, ConfigFile, Endpoint, SessionConfig};
pub use error::{SessionError, SessionResult};
pub use protocol::{Codec, CodecError, MqttCodec, PacketKind, PublishOptions, QoS, Subscription};
pub use session::{ConnectionState, InboundMessage, Session, SessionEvent};
pub use transport::{TcpTransport, Transport};

//! MQTT session command line client
//!
//! Subscribes and prints messages as JSON lines, publishes single messages,
//! and validates configuration files.

use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use mqtt_session::config::{BrokerSection, ConfigFile, SessionSection};
use mqtt_session::observability::{cli_span, init_default_logging, init_logging, LogFormat};
use mqtt_session::protocol::qos_from_u8;
use mqtt_session::{
    PacketKind, PublishOptions, QoS, Session, SessionConfig, SessionEvent, Subscription,
};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::process;
use std::time::Duration;
use tokio::signal;
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{error, info, warn, Instrument, Level};

type CliResult<T> = Result<T, Box<dyn std::error::Error>>;

/// Event-driven MQTT 3.1.1 client
#[derive(Parser)]
#[command(name = "mqtt-session")]
#[command(about = "MQTT 3.1.1 client with keepalive and automatic reconnection")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Broker URL, overriding the configuration file
    #[arg(short, long, env = "MQTT_BROKER_URL", value_name = "URL")]
    broker: Option<String>,

    /// Verbose logging (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Subscribe and print every message as a JSON line
    Subscribe {
        /// Topic filter, may be repeated
        #[arg(short, long = "topic", required = true)]
        topics: Vec<String>,
        #[arg(short, long, default_value_t = 0, value_parser = clap::value_parser!(u8).range(0..=2))]
        qos: u8,
    },
    /// Publish one message and exit
    Publish {
        #[arg(short, long)]
        topic: String,
        #[arg(short, long)]
        message: String,
        #[arg(short, long, default_value_t = 0, value_parser = clap::value_parser!(u8).range(0..=2))]
        qos: u8,
        #[arg(long)]
        retain: bool,
    },
    /// Validate configuration
    Config {
        /// Show current configuration
        #[arg(long)]
        show: bool,
    },
}

/// One received message as printed on stdout
#[derive(Serialize)]
struct MessageLine<'a> {
    received_at: DateTime<Utc>,
    topic: &'a str,
    qos: u8,
    retain: bool,
    payload: String,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    match cli.verbose {
        0 => init_default_logging(),
        n => {
            let format = std::env::var("LOG_FORMAT").unwrap_or_else(|_| "compact".to_string());
            let level = if n == 1 { Level::DEBUG } else { Level::TRACE };
            init_logging(level, LogFormat::parse(&format), false);
        }
    }

    let file = match load_configuration(cli.config.as_deref(), cli.broker) {
        Ok(file) => file,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            process::exit(1);
        }
    };

    let result = match cli.command {
        Commands::Subscribe { topics, qos } => {
            run_subscribe(&file, topics, qos)
                .instrument(cli_span!(command = "subscribe"))
                .await
        }
        Commands::Publish {
            topic,
            message,
            qos,
            retain,
        } => {
            run_publish(&file, &topic, message.as_bytes(), qos, retain)
                .instrument(cli_span!(command = "publish", topic = %topic))
                .await
        }
        Commands::Config { show } => handle_config_command(&file, show),
    };

    if let Err(e) = result {
        error!("Command failed: {}", e);
        process::exit(1);
    }
}

fn load_configuration(path: Option<&Path>, broker: Option<String>) -> CliResult<ConfigFile> {
    let mut file = match path {
        Some(path) => {
            info!("Loading configuration from: {}", path.display());
            read_config_file(path)?
        }
        None => {
            // Try default locations
            let found = ["mqtt-session.toml", "config/mqtt-session.toml"]
                .iter()
                .map(PathBuf::from)
                .find(|path| path.exists());

            match (found, &broker) {
                (Some(path), _) => {
                    info!("Loading configuration from: {}", path.display());
                    read_config_file(&path)?
                }
                (None, Some(url)) => ConfigFile {
                    broker: BrokerSection {
                        url: url.clone(),
                        username_env: None,
                        password_env: None,
                    },
                    session: SessionSection::default(),
                    will: None,
                },
                (None, None) => {
                    return Err(
                        "No configuration found. Pass -c/--config, --broker or create mqtt-session.toml"
                            .into(),
                    )
                }
            }
        }
    };

    if let Some(url) = broker {
        file.broker.url = url;
    }
    Ok(file)
}

fn read_config_file(path: &Path) -> CliResult<ConfigFile> {
    let content = std::fs::read_to_string(path)?;
    Ok(toml::from_str(&content)?)
}

fn parse_qos(qos: u8) -> CliResult<QoS> {
    qos_from_u8(qos).ok_or_else(|| format!("QoS must be 0, 1 or 2, got {qos}").into())
}

async fn run_subscribe(file: &ConfigFile, topics: Vec<String>, qos: u8) -> CliResult<()> {
    let config = file.resolve()?;
    let resubscribe = config.resubscribe;
    let qos = parse_qos(qos)?;
    let subscriptions: Vec<Subscription> = topics
        .iter()
        .map(|topic| Subscription::new(topic.clone(), qos))
        .collect();

    info!(client_id = %config.client_id, topics = ?topics, "Starting subscriber");
    let session = Session::new(config);
    let mut events = session.events();
    let mut messages = session
        .messages()
        .ok_or("message receiver already taken")?;
    session.connect()?;

    let shutdown = wait_for_shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!("Shutdown signal received, disconnecting");
                break;
            }
            event = events.recv() => match event {
                Ok(SessionEvent::Connect { session_present }) => {
                    info!(session_present, "Connected, subscribing");
                    if let Err(e) = session.subscribe(subscriptions.clone()) {
                        warn!("Subscribe failed: {}", e);
                    }
                }
                // The session restores its own subscriptions when resubscribe is on
                Ok(SessionEvent::Reconnect) if !resubscribe => {
                    if let Err(e) = session.subscribe(subscriptions.clone()) {
                        warn!("Subscribe failed: {}", e);
                    }
                }
                Ok(SessionEvent::Error(e)) => warn!("Session error: {}", e),
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "Event receiver lagged"),
                Err(RecvError::Closed) => break,
            },
            message = messages.recv() => match message {
                Some(message) => {
                    let line = MessageLine {
                        received_at: Utc::now(),
                        topic: &message.topic,
                        qos: message.qos as u8,
                        retain: message.retain,
                        payload: String::from_utf8_lossy(&message.payload).into_owned(),
                    };
                    println!("{}", serde_json::to_string(&line)?);
                }
                None => break,
            },
        }
    }

    session.shutdown().await?;
    Ok(())
}

async fn run_publish(
    file: &ConfigFile,
    topic: &str,
    payload: &[u8],
    qos: u8,
    retain: bool,
) -> CliResult<()> {
    let config = file.resolve()?;
    let deadline = config.connect_timeout + Duration::from_secs(5);
    let options = PublishOptions {
        qos: parse_qos(qos)?,
        retain,
        dup: false,
    };

    let session = Session::new(config);
    let mut events = session.events();
    session.connect()?;

    let connected = wait_for(&mut events, deadline, |event| {
        matches!(event, SessionEvent::Connect { .. })
    })
    .await;
    if !connected {
        session.shutdown().await?;
        return Err("Timed out waiting for the broker to accept the connection".into());
    }

    let message_id = session.publish(topic, payload, options)?;
    info!(message_id, qos = ?options.qos, "Message published");

    // Qos 1 completes on PUBACK, qos 2 on PUBCOMP
    let completion = match options.qos {
        QoS::AtMostOnce => None,
        QoS::AtLeastOnce => Some(PacketKind::PubAck),
        QoS::ExactlyOnce => Some(PacketKind::PubComp),
    };
    if let Some(expected) = completion {
        let acknowledged = wait_for(&mut events, deadline, |event| {
            matches!(event, SessionEvent::Acknowledged { kind, message_id: id }
                if *kind == expected && *id == message_id)
        })
        .await;
        if !acknowledged {
            warn!(message_id, "Broker did not acknowledge the publish in time");
        }
    }

    session.disconnect(true).await?;
    session.shutdown().await?;
    Ok(())
}

/// Wait until `accept` returns true for an event. False on timeout or closed channel.
async fn wait_for<F>(
    events: &mut broadcast::Receiver<SessionEvent>,
    timeout: Duration,
    mut accept: F,
) -> bool
where
    F: FnMut(&SessionEvent) -> bool,
{
    let wait = async {
        loop {
            match events.recv().await {
                Ok(event) if accept(&event) => return true,
                Ok(SessionEvent::Error(e)) => warn!("Session error: {}", e),
                Ok(_) | Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => return false,
            }
        }
    };
    tokio::time::timeout(timeout, wait).await.unwrap_or(false)
}

fn handle_config_command(file: &ConfigFile, show: bool) -> CliResult<()> {
    let config: SessionConfig = file.resolve()?;
    if show {
        println!("Current configuration:");
        println!("{}", toml::to_string_pretty(file)?);
    }

    info!(
        client_id = %config.client_id,
        host = %config.endpoint.host,
        port = config.endpoint.port,
        tls = config.endpoint.tls,
        "Configuration validation complete"
    );
    Ok(())
}

async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal as unix_signal, SignalKind};
        match unix_signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = signal::ctrl_c() => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                let _ = signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = signal::ctrl_c().await;
    }
}

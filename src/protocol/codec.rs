//! Wire codec for MQTT 3.1.1 control packets
//!
//! Packet layouts are handled by `rumqttc::mqttbytes::v4`. This module adapts
//! them to the session's [`Codec`] seam: every encoder turns an intent into
//! bytes ready for the transport, and [`Codec::decode_frame`] inspects a
//! buffer and reports either one complete frame with the number of bytes it
//! occupied, or how many more bytes are needed. Buffering across reads
//! belongs to the [`StreamReassembler`](crate::session::StreamReassembler).

use super::packet::{Frame, PacketKind, PublishOptions, Subscription};
use crate::config::SessionConfig;
use bytes::{Bytes, BytesMut};
use rumqttc::mqttbytes::v4::{
    ConnAck, Connect, Disconnect, Login, Packet, PingReq, PubAck, PubComp, PubRec, PubRel, Publish,
    Subscribe, SubscribeFilter, Unsubscribe,
};
use rumqttc::mqttbytes::{self, QoS};
use thiserror::Error;

/// Largest value the remaining-length field can express
pub const MAX_REMAINING_LENGTH: usize = 268_435_455;

/// Default ceiling on inbound frame size (256 KiB)
pub const DEFAULT_MAX_PACKET_SIZE: usize = 256 * 1024;

/// Errors raised while encoding or decoding frames
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("Packet of {size} bytes exceeds maximum of {max} bytes")]
    PayloadTooLarge { size: usize, max: usize },
    #[error("Unexpected {actual} packet, expected {expected}")]
    UnexpectedPacket {
        expected: PacketKind,
        actual: PacketKind,
    },
    #[error("Invalid topic: {0}")]
    InvalidTopic(String),
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
    #[error("Malformed packet: {0}")]
    Packet(#[from] mqttbytes::Error),
}

/// Outcome of inspecting a buffer for one frame
#[derive(Debug, Clone, PartialEq)]
pub enum Decoded {
    /// A complete frame occupying the first `consumed` bytes of the buffer
    Frame { frame: Frame, consumed: usize },
    /// At least `missing` more bytes are needed
    Incomplete { missing: usize },
}

/// Translates between session intents and wire frames
pub trait Codec: Send + Sync + 'static {
    fn encode_handshake(&self, config: &SessionConfig) -> Result<Bytes, CodecError>;

    fn decode_frame(&self, buf: &[u8]) -> Result<Decoded, CodecError>;

    fn decode_publish_body(&self, frame: &Frame) -> Result<Publish, CodecError>;

    fn decode_connack(&self, frame: &Frame) -> Result<ConnAck, CodecError>;

    /// Acknowledge an inbound publish: PUBACK for qos 1, PUBREC for qos 2
    fn encode_ack(&self, message_id: u16, qos: QoS) -> Result<Bytes, CodecError>;

    fn encode_pubrel(&self, message_id: u16) -> Result<Bytes, CodecError>;

    fn encode_pubcomp(&self, message_id: u16) -> Result<Bytes, CodecError>;

    fn encode_ping(&self) -> Result<Bytes, CodecError>;

    fn encode_publish(
        &self,
        topic: &str,
        payload: &[u8],
        options: PublishOptions,
        message_id: Option<u16>,
    ) -> Result<Bytes, CodecError>;

    fn encode_subscribe(
        &self,
        subscriptions: &[Subscription],
        message_id: u16,
    ) -> Result<Bytes, CodecError>;

    fn encode_unsubscribe(&self, filters: &[String], message_id: u16)
        -> Result<Bytes, CodecError>;

    fn encode_disconnect(&self) -> Result<Bytes, CodecError>;
}

/// MQTT 3.1.1 (protocol level 4) codec
#[derive(Debug, Clone)]
pub struct MqttCodec {
    max_packet_size: usize,
}

impl Default for MqttCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_PACKET_SIZE)
    }
}

impl MqttCodec {
    pub fn new(max_packet_size: usize) -> Self {
        Self {
            max_packet_size: max_packet_size.min(MAX_REMAINING_LENGTH),
        }
    }

    pub fn max_packet_size(&self) -> usize {
        self.max_packet_size
    }
}

impl Codec for MqttCodec {
    fn encode_handshake(&self, config: &SessionConfig) -> Result<Bytes, CodecError> {
        let mut connect = Connect::new(config.client_id.as_str());
        connect.keep_alive = u16::try_from(config.keepalive.as_secs()).unwrap_or(u16::MAX);
        connect.clean_session = config.clean_session;

        if let Some(will) = &config.last_will {
            validate_topic_name(&will.topic)?;
            connect.last_will = Some(will.clone());
        }

        connect.login = match (&config.username, &config.password) {
            (Some(username), password) => Some(Login::new(
                username.as_str(),
                password.as_deref().unwrap_or_default(),
            )),
            (None, Some(_)) => {
                return Err(CodecError::InvalidArgument(
                    "a password requires a user name".to_string(),
                ))
            }
            (None, None) => None,
        };

        written(|buf| connect.write(buf))
    }

    fn decode_frame(&self, buf: &[u8]) -> Result<Decoded, CodecError> {
        let header = match mqttbytes::check(buf.iter(), self.max_packet_size) {
            Ok(header) => header,
            Err(mqttbytes::Error::InsufficientBytes(missing)) => {
                return Ok(Decoded::Incomplete { missing })
            }
            Err(mqttbytes::Error::PayloadSizeLimitExceeded(size)) => {
                return Err(CodecError::PayloadTooLarge {
                    size,
                    max: self.max_packet_size,
                })
            }
            Err(e) => return Err(e.into()),
        };

        // The frame is complete, so any failure below means it is malformed
        let consumed = header.frame_length();
        let mut bytes = BytesMut::from(&buf[..consumed]);
        let packet = rumqttc::mqttbytes::v4::read(&mut bytes, self.max_packet_size)?;

        Ok(Decoded::Frame {
            frame: Frame::from(packet),
            consumed,
        })
    }

    fn decode_publish_body(&self, frame: &Frame) -> Result<Publish, CodecError> {
        match &frame.packet {
            Packet::Publish(publish) => Ok(publish.clone()),
            _ => Err(unexpected(PacketKind::Publish, frame)),
        }
    }

    fn decode_connack(&self, frame: &Frame) -> Result<ConnAck, CodecError> {
        match &frame.packet {
            Packet::ConnAck(ack) => Ok(ack.clone()),
            _ => Err(unexpected(PacketKind::ConnAck, frame)),
        }
    }

    fn encode_ack(&self, message_id: u16, qos: QoS) -> Result<Bytes, CodecError> {
        require_message_id(message_id)?;
        match qos {
            QoS::AtMostOnce => Err(CodecError::InvalidArgument(
                "qos 0 publishes are not acknowledged".to_string(),
            )),
            QoS::AtLeastOnce => written(|buf| PubAck::new(message_id).write(buf)),
            QoS::ExactlyOnce => written(|buf| PubRec::new(message_id).write(buf)),
        }
    }

    fn encode_pubrel(&self, message_id: u16) -> Result<Bytes, CodecError> {
        require_message_id(message_id)?;
        written(|buf| PubRel::new(message_id).write(buf))
    }

    fn encode_pubcomp(&self, message_id: u16) -> Result<Bytes, CodecError> {
        require_message_id(message_id)?;
        written(|buf| PubComp::new(message_id).write(buf))
    }

    fn encode_ping(&self) -> Result<Bytes, CodecError> {
        written(|buf| PingReq.write(buf))
    }

    fn encode_publish(
        &self,
        topic: &str,
        payload: &[u8],
        options: PublishOptions,
        message_id: Option<u16>,
    ) -> Result<Bytes, CodecError> {
        validate_topic_name(topic)?;

        let mut publish = Publish::new(topic, options.qos, payload);
        publish.retain = options.retain;
        publish.dup = options.dup;
        match (options.qos, message_id) {
            (QoS::AtMostOnce, _) => {}
            (_, Some(id)) if id != 0 => publish.pkid = id,
            _ => {
                return Err(CodecError::InvalidArgument(
                    "qos 1 and 2 publishes need a non-zero message id".to_string(),
                ))
            }
        }

        written(|buf| publish.write(buf))
    }

    fn encode_subscribe(
        &self,
        subscriptions: &[Subscription],
        message_id: u16,
    ) -> Result<Bytes, CodecError> {
        if subscriptions.is_empty() {
            return Err(CodecError::InvalidArgument(
                "subscribe needs at least one topic filter".to_string(),
            ));
        }
        require_message_id(message_id)?;

        let mut filters = Vec::with_capacity(subscriptions.len());
        for subscription in subscriptions {
            validate_topic_filter(&subscription.filter)?;
            filters.push(SubscribeFilter::new(
                subscription.filter.clone(),
                subscription.qos,
            ));
        }
        let mut subscribe = Subscribe::new_many(filters);
        subscribe.pkid = message_id;

        written(|buf| subscribe.write(buf))
    }

    fn encode_unsubscribe(
        &self,
        filters: &[String],
        message_id: u16,
    ) -> Result<Bytes, CodecError> {
        if filters.is_empty() {
            return Err(CodecError::InvalidArgument(
                "unsubscribe needs at least one topic filter".to_string(),
            ));
        }
        require_message_id(message_id)?;
        for filter in filters {
            validate_topic_filter(filter)?;
        }

        let unsubscribe = Unsubscribe {
            pkid: message_id,
            topics: filters.to_vec(),
        };
        written(|buf| unsubscribe.write(buf))
    }

    fn encode_disconnect(&self) -> Result<Bytes, CodecError> {
        written(|buf| Disconnect.write(buf))
    }
}

/// Run one mqttbytes writer into a fresh buffer
fn written<F>(write: F) -> Result<Bytes, CodecError>
where
    F: FnOnce(&mut BytesMut) -> Result<usize, mqttbytes::Error>,
{
    let mut buf = BytesMut::new();
    write(&mut buf)?;
    Ok(buf.freeze())
}

fn unexpected(expected: PacketKind, frame: &Frame) -> CodecError {
    CodecError::UnexpectedPacket {
        expected,
        actual: frame.kind,
    }
}

fn require_message_id(message_id: u16) -> Result<(), CodecError> {
    if message_id == 0 {
        return Err(CodecError::InvalidArgument(
            "message id 0 is reserved".to_string(),
        ));
    }
    Ok(())
}

/// Topic names used for publishing must be non-empty and wildcard free
pub fn validate_topic_name(topic: &str) -> Result<(), CodecError> {
    if topic.is_empty() || !mqttbytes::valid_topic(topic) {
        return Err(CodecError::InvalidTopic(format!(
            "'{topic}' is empty or contains a wildcard"
        )));
    }
    Ok(())
}

/// Topic filters may use `+` for a whole level and `#` as the last level
pub fn validate_topic_filter(filter: &str) -> Result<(), CodecError> {
    if !mqttbytes::valid_filter(filter) {
        return Err(CodecError::InvalidTopic(format!(
            "'{filter}' is not a valid topic filter"
        )));
    }
    Ok(())
}

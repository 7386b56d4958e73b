//! Session-side view of MQTT 3.1.1 packets
//!
//! Packet structs come from `rumqttc::mqttbytes::v4`. A [`Frame`] is the unit
//! the stream reassembler produces: the decoded packet plus its kind and
//! message id, which the session dispatches on.

use rumqttc::mqttbytes::v4::Packet;
use rumqttc::mqttbytes::QoS;
use std::fmt;

/// Parse a QoS level from its wire value
pub fn qos_from_u8(value: u8) -> Option<QoS> {
    match value {
        0 => Some(QoS::AtMostOnce),
        1 => Some(QoS::AtLeastOnce),
        2 => Some(QoS::ExactlyOnce),
        _ => None,
    }
}

/// Control packet type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PacketKind {
    Connect,
    ConnAck,
    Publish,
    PubAck,
    PubRec,
    PubRel,
    PubComp,
    Subscribe,
    SubAck,
    Unsubscribe,
    UnsubAck,
    PingReq,
    PingResp,
    Disconnect,
}

impl PacketKind {
    pub fn of(packet: &Packet) -> Self {
        match packet {
            Packet::Connect(_) => PacketKind::Connect,
            Packet::ConnAck(_) => PacketKind::ConnAck,
            Packet::Publish(_) => PacketKind::Publish,
            Packet::PubAck(_) => PacketKind::PubAck,
            Packet::PubRec(_) => PacketKind::PubRec,
            Packet::PubRel(_) => PacketKind::PubRel,
            Packet::PubComp(_) => PacketKind::PubComp,
            Packet::Subscribe(_) => PacketKind::Subscribe,
            Packet::SubAck(_) => PacketKind::SubAck,
            Packet::Unsubscribe(_) => PacketKind::Unsubscribe,
            Packet::UnsubAck(_) => PacketKind::UnsubAck,
            Packet::PingReq => PacketKind::PingReq,
            Packet::PingResp => PacketKind::PingResp,
            Packet::Disconnect => PacketKind::Disconnect,
        }
    }
}

impl fmt::Display for PacketKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PacketKind::Connect => "CONNECT",
            PacketKind::ConnAck => "CONNACK",
            PacketKind::Publish => "PUBLISH",
            PacketKind::PubAck => "PUBACK",
            PacketKind::PubRec => "PUBREC",
            PacketKind::PubRel => "PUBREL",
            PacketKind::PubComp => "PUBCOMP",
            PacketKind::Subscribe => "SUBSCRIBE",
            PacketKind::SubAck => "SUBACK",
            PacketKind::Unsubscribe => "UNSUBSCRIBE",
            PacketKind::UnsubAck => "UNSUBACK",
            PacketKind::PingReq => "PINGREQ",
            PacketKind::PingResp => "PINGRESP",
            PacketKind::Disconnect => "DISCONNECT",
        };
        f.write_str(name)
    }
}

/// One complete frame recovered from the byte stream
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub kind: PacketKind,
    pub message_id: Option<u16>,
    pub packet: Packet,
}

impl From<Packet> for Frame {
    fn from(packet: Packet) -> Self {
        let message_id = match &packet {
            Packet::Publish(publish) if publish.qos != QoS::AtMostOnce => Some(publish.pkid),
            Packet::PubAck(ack) => Some(ack.pkid),
            Packet::PubRec(rec) => Some(rec.pkid),
            Packet::PubRel(rel) => Some(rel.pkid),
            Packet::PubComp(comp) => Some(comp.pkid),
            Packet::Subscribe(subscribe) => Some(subscribe.pkid),
            Packet::SubAck(ack) => Some(ack.pkid),
            Packet::Unsubscribe(unsubscribe) => Some(unsubscribe.pkid),
            Packet::UnsubAck(ack) => Some(ack.pkid),
            _ => None,
        };
        Self {
            kind: PacketKind::of(&packet),
            message_id,
            packet,
        }
    }
}

/// Options for an outbound PUBLISH
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PublishOptions {
    pub qos: QoS,
    pub retain: bool,
    pub dup: bool,
}

impl Default for PublishOptions {
    fn default() -> Self {
        Self {
            qos: QoS::AtMostOnce,
            retain: false,
            dup: false,
        }
    }
}

/// A topic filter the session subscribes to and restores after reconnects
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    pub filter: String,
    pub qos: QoS,
}

impl Subscription {
    pub fn new(filter: impl Into<String>, qos: QoS) -> Self {
        Self {
            filter: filter.into(),
            qos,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rumqttc::mqttbytes::v4::{PubAck, Publish};

    #[test]
    fn test_qos_parsing() {
        assert_eq!(qos_from_u8(1), Some(QoS::AtLeastOnce));
        assert_eq!(qos_from_u8(2), Some(QoS::ExactlyOnce));
        assert_eq!(qos_from_u8(3), None);
    }

    #[test]
    fn test_frame_carries_message_id_by_kind() {
        let ack = Frame::from(Packet::PubAck(PubAck::new(7)));
        assert_eq!(ack.kind, PacketKind::PubAck);
        assert_eq!(ack.message_id, Some(7));

        let ping = Frame::from(Packet::PingResp);
        assert_eq!(ping.kind, PacketKind::PingResp);
        assert_eq!(ping.message_id, None);
    }

    #[test]
    fn test_qos0_publish_has_no_message_id() {
        let mut publish = Publish::new("a/b", QoS::AtMostOnce, "x");
        publish.pkid = 12;
        assert_eq!(Frame::from(Packet::Publish(publish)).message_id, None);

        let mut publish = Publish::new("a/b", QoS::AtLeastOnce, "x");
        publish.pkid = 12;
        assert_eq!(Frame::from(Packet::Publish(publish)).message_id, Some(12));
    }
}

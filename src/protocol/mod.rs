//! MQTT 3.1.1 packet model and wire codec
//!
//! The session treats the codec as an opaque collaborator behind the
//! [`Codec`] trait; [`MqttCodec`] is the implementation used by default and
//! delegates packet layouts to `rumqttc::mqttbytes::v4`.

pub mod codec;
pub mod packet;

pub use codec::{
    validate_topic_filter, validate_topic_name, Codec, CodecError, Decoded, MqttCodec,
    DEFAULT_MAX_PACKET_SIZE, MAX_REMAINING_LENGTH,
};
pub use packet::{qos_from_u8, Frame, PacketKind, PublishOptions, Subscription};
pub use rumqttc::mqttbytes::v4::{ConnAck, ConnectReturnCode, LastWill, Packet, Publish};
pub use rumqttc::mqttbytes::QoS;

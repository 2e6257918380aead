//! MQTT 3.1.1 wire support for the local broker.
//!
//! Packets are `rumqttc`'s v4 `mqttbytes` types, the same ones the upstream
//! relay speaks. This module adds the `tokio-util` framing codec and the
//! broker's topic-filter matching.

use std::io;

use bytes::Bytes;
use thiserror::Error;

pub mod codec;
pub mod filter;

pub use codec::MqttCodec;
pub use filter::{matches as filter_matches, valid_filter, valid_topic};
pub use rumqttc::mqttbytes::v4::{
    ConnAck, Connect, ConnectReturnCode, LastWill, Login, Packet, PubAck, PubComp, PubRec, PubRel,
    Publish, SubAck, Subscribe, SubscribeFilter, SubscribeReasonCode, UnsubAck, Unsubscribe,
};
pub use rumqttc::mqttbytes::{Protocol, QoS};

/// Packet framing and decoding errors
#[derive(Error, Debug)]
pub enum PacketError {
    #[error("Malformed packet: {0}")]
    Mqtt(#[from] rumqttc::mqttbytes::Error),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// The lower of two QoS levels.
pub fn min_qos(a: QoS, b: QoS) -> QoS {
    if (a as u8) <= (b as u8) {
        a
    } else {
        b
    }
}

/// The highest of `levels`, if there is any.
pub fn max_qos(levels: impl IntoIterator<Item = QoS>) -> Option<QoS> {
    levels.into_iter().max_by_key(|qos| *qos as u8)
}

/// A new outgoing PUBLISH; the packet id is assigned at delivery.
pub fn message(topic: impl Into<String>, qos: QoS, retain: bool, payload: Bytes) -> Publish {
    let mut publish = Publish::from_bytes(topic, qos, payload);
    publish.retain = retain;
    publish
}

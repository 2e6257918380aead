//! `tokio-util` framing for MQTT packets.

use bytes::BytesMut;
use rumqttc::mqttbytes::v4::{self, Disconnect, PingReq, PingResp};
use rumqttc::mqttbytes::Error as MqttError;
use tokio_util::codec::{Decoder, Encoder};

use super::{Packet, PacketError};

/// Default cap on the remaining length of a single packet.
pub const DEFAULT_MAX_PACKET_SIZE: usize = 256 * 1024;

/// Splits a byte stream into MQTT packets and encodes outgoing ones.
#[derive(Debug, Clone, Copy)]
pub struct MqttCodec {
    max_packet_size: usize,
}

impl MqttCodec {
    pub fn new(max_packet_size: usize) -> Self {
        MqttCodec { max_packet_size }
    }
}

impl Default for MqttCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_PACKET_SIZE)
    }
}

impl Decoder for MqttCodec {
    type Item = Packet;
    type Error = PacketError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Packet>, PacketError> {
        match v4::read(src, self.max_packet_size) {
            Ok(packet) => Ok(Some(packet)),
            Err(MqttError::InsufficientBytes(required)) => {
                src.reserve(required);
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }
}

impl Encoder<Packet> for MqttCodec {
    type Error = PacketError;

    fn encode(&mut self, packet: Packet, dst: &mut BytesMut) -> Result<(), PacketError> {
        match &packet {
            Packet::Connect(connect) => connect.write(dst),
            Packet::ConnAck(ack) => ack.write(dst),
            Packet::Publish(publish) => publish.write(dst),
            Packet::PubAck(ack) => ack.write(dst),
            Packet::PubRec(rec) => rec.write(dst),
            Packet::PubRel(rel) => rel.write(dst),
            Packet::PubComp(comp) => comp.write(dst),
            Packet::Subscribe(subscribe) => subscribe.write(dst),
            Packet::SubAck(ack) => ack.write(dst),
            Packet::Unsubscribe(unsubscribe) => unsubscribe.write(dst),
            Packet::UnsubAck(ack) => ack.write(dst),
            Packet::PingReq => PingReq.write(dst),
            Packet::PingResp => PingResp.write(dst),
            Packet::Disconnect => Disconnect.write(dst),
        }?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::{BufMut, Bytes};

    use crate::mqtt::{message, QoS};

    #[test]
    fn test_decode_partial_then_complete() {
        let mut codec = MqttCodec::default();
        let mut wire = BytesMut::new();
        codec
            .encode(
                Packet::Publish(message("t", QoS::AtMostOnce, false, Bytes::from_static(b"hello"))),
                &mut wire,
            )
            .unwrap();
        codec.encode(Packet::PingReq, &mut wire).unwrap();

        let mut src = BytesMut::new();
        src.put_slice(&wire[..4]);
        assert!(codec.decode(&mut src).unwrap().is_none());

        src.put_slice(&wire[4..]);
        let first = codec.decode(&mut src).unwrap().unwrap();
        assert!(matches!(first, Packet::Publish(ref p) if p.payload == Bytes::from_static(b"hello")));
        assert_eq!(codec.decode(&mut src).unwrap(), Some(Packet::PingReq));
        assert!(src.is_empty());
    }

    #[test]
    fn test_oversized_packet_rejected() {
        let mut codec = MqttCodec::new(16);
        let mut src = BytesMut::from(&[0x30u8, 0x7f][..]);
        assert!(matches!(
            codec.decode(&mut src),
            Err(PacketError::Mqtt(MqttError::PayloadSizeLimitExceeded(127)))
        ));
    }
}

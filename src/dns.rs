// =============================================================================
// ariproxy - DNS Responder
// =============================================================================
//
// Project: ariproxy - local MQTT gateway for Ariston Velis/Med water heaters
// License: Apache 2.0 / MIT
//
// Description:
//   Optional UDP DNS server that answers A lookups of the vendor broker's
//   hostname with the gateway's own address, so appliances on the local
//   network connect here instead of to the cloud. Every other name gets an
//   empty answer; nothing is forwarded.
//
// =============================================================================

use std::io;
use std::net::{Ipv4Addr, SocketAddr};

use ariproxy_common::GatewayError;
use hickory_proto::op::{Message, MessageType, OpCode};
use hickory_proto::rr::{rdata::A, Name, RData, Record, RecordType};
use tokio::net::UdpSocket;
use tracing::{debug, error, info, instrument, warn};

/// Hostname appliances look up to reach the vendor broker
pub const BROKER_HOSTNAME: &str = "broker-ari.everyware-cloud.com.";

/// TTL of the synthesized A record, in seconds
const ANSWER_TTL: u32 = 3600;

/// Largest datagram read; plain DNS over UDP stays within 512 bytes
const MAX_DATAGRAM: usize = 4096;

/// A bound responder, ready to [`run`](DnsResponder::run).
pub struct DnsResponder {
    socket: UdpSocket,
    hostname: Name,
    resolve_to: Ipv4Addr,
}

impl DnsResponder {
    #[instrument(level = "debug")]
    pub async fn bind(addr: SocketAddr, resolve_to: Ipv4Addr) -> Result<Self, GatewayError> {
        let hostname = Name::from_ascii(BROKER_HOSTNAME)
            .map_err(|e| GatewayError::Internal(format!("{}: {}", BROKER_HOSTNAME, e)))?;
        let socket = UdpSocket::bind(addr).await?;
        info!(
            "🚀 DNS listener on {}, resolving {} to {}",
            socket.local_addr()?,
            BROKER_HOSTNAME,
            resolve_to
        );
        Ok(DnsResponder {
            socket,
            hostname,
            resolve_to,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Serve queries until the task is dropped.
    pub async fn run(self) {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        loop {
            let (len, peer) = match self.socket.recv_from(&mut buf).await {
                Ok(received) => received,
                Err(e) => {
                    error!("❌ DNS receive failed: {}", e);
                    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                    continue;
                }
            };
            let Some(reply) = self.answer(&buf[..len]) else {
                continue;
            };
            if let Err(e) = self.socket.send_to(&reply, peer).await {
                warn!("⚠️ DNS reply to {} failed: {}", peer, e);
            }
        }
    }

    /// Reply to one request datagram; `None` when it does not parse.
    ///
    /// Questions are echoed back. Only A questions for the broker hostname
    /// get an answer, and only for standard queries.
    pub fn answer(&self, request: &[u8]) -> Option<Vec<u8>> {
        let request = match Message::from_vec(request) {
            Ok(request) => request,
            Err(e) => {
                debug!("Ignoring malformed DNS request: {}", e);
                return None;
            }
        };

        let mut reply = Message::new();
        reply
            .set_id(request.id())
            .set_message_type(MessageType::Response)
            .set_op_code(request.op_code())
            .set_recursion_desired(request.recursion_desired())
            .add_queries(request.queries().to_vec());

        if request.op_code() == OpCode::Query {
            for query in request.queries() {
                if query.query_type() != RecordType::A {
                    continue;
                }
                debug!("🔍 DNS query for {}", query.name());
                if *query.name() == self.hostname {
                    reply.add_answer(Record::from_rdata(
                        query.name().clone(),
                        ANSWER_TTL,
                        RData::A(A(self.resolve_to)),
                    ));
                }
            }
        }

        match reply.to_vec() {
            Ok(bytes) => Some(bytes),
            Err(e) => {
                warn!("⚠️ Encoding DNS reply failed: {}", e);
                None
            }
        }
    }
}

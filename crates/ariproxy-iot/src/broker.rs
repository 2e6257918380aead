//! # Local Broker Core
//!
//! The MQTT server appliances connect to in place of the vendor broker.
//!
//! Every connection runs in its own task. The four broker events that matter
//! to the gateway (connect, publish, subscribe, disconnect) are funnelled
//! through [`Broker::on_event`], which authenticates devices (opening their
//! upstream relay), decodes intercepted payloads into the [`SessionStore`] and
//! forwards device traffic upstream. Payloads are observed, never altered.
//!
//! [`Broker`] also implements [`MessagePublisher`], the single entry point for
//! injecting messages under the gateway's own identity (poll requests,
//! parameter writes, traffic arriving from the upstream broker).

use std::collections::HashSet;
use std::io;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::time::Instant;
use tokio_rustls::rustls::ServerConfig;
use tokio_rustls::TlsAcceptor;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::codec::{
    decode_consumption, decode_parameters, describe_payload, encode_write_request, project_birth,
    project_params,
};
use crate::mqtt::codec::DEFAULT_MAX_PACKET_SIZE;
use crate::mqtt::{
    filter_matches, max_qos, message, min_qos, valid_filter, valid_topic, ConnAck, Connect,
    ConnectReturnCode, MqttCodec, Packet, PacketError, Protocol, PubAck, PubComp, PubRec, Publish,
    QoS, SubAck, SubscribeFilter, SubscribeReasonCode, UnsubAck,
};
use crate::relay::{RelayConfig, UpstreamRelay};
use crate::session::{Session, SessionStore};
use crate::topics::{is_internal, write_request_topic, TopicKind};
use crate::{IoTError, INLINE_CLIENT_ID};

/// Time a new connection gets to send its CONNECT.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Highest QoS granted to local subscribers.
const MAX_GRANTED_QOS: QoS = QoS::AtLeastOnce;

/// Deliveries queued for one client before it is dropped as too slow.
const OUTBOUND_CAPACITY: usize = 64;

/// Write deadline for clients that disabled keep alive.
const WRITE_TIMEOUT: Duration = Duration::from_secs(30);

/// Local broker settings
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Upstream broker; `None` disables relaying
    pub relay: Option<RelayConfig>,
    pub max_packet_size: usize,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        BrokerConfig {
            relay: None,
            max_packet_size: DEFAULT_MAX_PACKET_SIZE,
        }
    }
}

// =============================================================================
// Events
// =============================================================================

/// Broker events the gateway reacts to.
#[derive(Debug)]
pub enum BrokerEvent<'a> {
    /// A CONNECT awaiting authentication; the will may be patched in place.
    Connect {
        connect: &'a mut Connect,
        connection_id: u64,
    },
    /// A message published by `client_id` (the inline identity included).
    Publish {
        client_id: &'a str,
        publish: &'a Publish,
    },
    /// Accepted subscription filters of `client_id`.
    Subscribe {
        client_id: &'a str,
        filters: &'a [SubscribeFilter],
    },
    /// The connection `connection_id` of `client_id` is gone, whatever the cause.
    Disconnect {
        client_id: &'a str,
        connection_id: u64,
    },
}

/// What the connection task should do after an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventOutcome {
    Accept,
    Reject(ConnectReturnCode),
    Continue,
}

/// Injects messages onto the local broker under the gateway's own identity.
#[async_trait]
pub trait MessagePublisher: Send + Sync {
    async fn publish(&self, topic: &str, payload: Bytes, qos: QoS, retain: bool) -> Result<(), IoTError>;
}

// =============================================================================
// Broker
// =============================================================================

struct ClientLink {
    connection_id: u64,
    tx: mpsc::Sender<Publish>,
    filters: Vec<(String, QoS)>,
    /// Cancelled when the client falls behind on its deliveries
    kick: CancellationToken,
    /// Cancelled when a newer connection claims the client id
    takeover: CancellationToken,
}

struct BrokerInner {
    config: BrokerConfig,
    sessions: Arc<SessionStore>,
    clients: DashMap<String, ClientLink>,
    retained: DashMap<String, Publish>,
    shutdown: CancellationToken,
}

/// The local MQTT broker; clones share the same broker.
#[derive(Clone)]
pub struct Broker {
    inner: Arc<BrokerInner>,
}

impl Broker {
    pub fn new(config: BrokerConfig, sessions: Arc<SessionStore>) -> Self {
        info!(
            "🔧 Initializing local broker (upstream relay: {})",
            config
                .relay
                .as_ref()
                .map(|r| format!("{}:{}", r.host, r.port))
                .unwrap_or_else(|| "disabled".to_string())
        );
        Broker {
            inner: Arc::new(BrokerInner {
                config,
                sessions,
                clients: DashMap::new(),
                retained: DashMap::new(),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    pub fn sessions(&self) -> &Arc<SessionStore> {
        &self.inner.sessions
    }

    /// Whether devices are relayed to an upstream broker.
    pub fn relay_enabled(&self) -> bool {
        self.inner.config.relay.is_some()
    }

    /// Number of open, accepted client connections.
    pub fn connected_clients(&self) -> usize {
        self.inner.clients.len()
    }

    /// Dispatch one broker event.
    pub async fn on_event(&self, event: BrokerEvent<'_>) -> EventOutcome {
        match event {
            BrokerEvent::Connect {
                connect,
                connection_id,
            } => self.authenticate(connect, connection_id).await,
            BrokerEvent::Publish { client_id, publish } => {
                self.intercept(client_id, publish);
                self.relay(client_id, publish);
                EventOutcome::Continue
            }
            BrokerEvent::Subscribe { client_id, filters } => {
                self.subscribe_upstream(client_id, filters);
                EventOutcome::Continue
            }
            BrokerEvent::Disconnect {
                client_id,
                connection_id,
            } => {
                if let Some(session) = self.inner.sessions.remove(client_id, connection_id) {
                    if let Some(upstream) = session.upstream {
                        upstream.close();
                    }
                }
                EventOutcome::Continue
            }
        }
    }

    #[instrument(level = "debug", skip(self, connect), fields(client_id = %connect.client_id))]
    async fn authenticate(&self, connect: &mut Connect, connection_id: u64) -> EventOutcome {
        if let Some(will) = connect.last_will.as_mut() {
            if will.message.is_empty() {
                debug!("🔧 Patching empty will payload of {}", connect.client_id);
                will.message = Bytes::from_static(&[0]);
            }
        }

        if connect.protocol != Protocol::V4 {
            warn!("⚠️ Rejecting {:?} connection of {}", connect.protocol, connect.client_id);
            return EventOutcome::Reject(ConnectReturnCode::RefusedProtocolVersion);
        }

        if connect.client_id.is_empty() || connect.client_id == INLINE_CLIENT_ID {
            warn!("⚠️ Rejecting connection with client id {:?}", connect.client_id);
            return EventOutcome::Reject(ConnectReturnCode::BadClientId);
        }

        let upstream = match &self.inner.config.relay {
            Some(relay) => {
                let publisher: Arc<dyn MessagePublisher> = Arc::new(self.clone());
                match UpstreamRelay::connect(relay, connect, publisher).await {
                    Ok(upstream) => Some(upstream),
                    Err(e) => {
                        error!("❌ {}", e);
                        return EventOutcome::Reject(ConnectReturnCode::NotAuthorized);
                    }
                }
            }
            None => None,
        };

        let session = Session::new(connect.client_id.clone(), connection_id, upstream);
        if let Some(displaced) = self.inner.sessions.insert(session) {
            info!("🔄 Session of {} taken over", displaced.id);
            if let Some(upstream) = displaced.upstream {
                upstream.close();
            }
        }
        EventOutcome::Accept
    }

    /// Decode a payload into session state according to its topic.
    fn intercept(&self, client_id: &str, publish: &Publish) {
        let sessions = &self.inner.sessions;
        let topic = publish.topic.as_str();

        match TopicKind::of(topic) {
            TopicKind::Birth => match decode_parameters(&publish.payload) {
                Ok(msg) => {
                    let birth = project_birth(&msg);
                    info!("📱 BIRTH from {}: {} fields", client_id, birth.len());
                    sessions.replace_birth(client_id, birth);
                }
                Err(e) => warn!("⚠️ {} on {}", e, topic),
            },
            TopicKind::ParamsReply => match decode_parameters(&publish.payload) {
                Ok(msg) => {
                    let (params, limits) = project_params(&msg);
                    debug!("📊 {} parameters from {}", params.len(), client_id);
                    sessions.replace_params(client_id, params, limits);
                }
                Err(e) => warn!("⚠️ {} on {}", e, topic),
            },
            TopicKind::ConsumptionsReply => match decode_consumption(&publish.payload) {
                Ok(msg) => {
                    debug!("📊 {} consumption series from {}", msg.consumptions.len(), client_id);
                    sessions.replace_consumption(client_id, msg.into());
                }
                Err(e) => warn!("⚠️ {} on {}", e, topic),
            },
            TopicKind::ErrorList => match decode_parameters(&publish.payload) {
                Ok(msg) => {
                    debug!("🚨 Error list from {}: {} entries", client_id, msg.params.len());
                    sessions.replace_errors(client_id, msg);
                }
                Err(e) => warn!("⚠️ {} on {}", e, topic),
            },
            TopicKind::Other => {
                debug!(
                    "📨 {} published on {}: {}",
                    client_id,
                    topic,
                    describe_payload(&publish.payload)
                );
            }
        }
    }

    /// Forward a device's publish to its upstream relay.
    fn relay(&self, client_id: &str, publish: &Publish) {
        if client_id == INLINE_CLIENT_ID || is_internal(&publish.topic) {
            return;
        }
        let Some(upstream) = self.inner.sessions.upstream(client_id) else {
            return;
        };
        if !upstream.is_connected() {
            debug!("Upstream of {} is down, not relaying {}", client_id, publish.topic);
            return;
        }
        if let Err(e) = upstream.publish(
            &publish.topic,
            publish.payload.clone(),
            publish.qos,
            publish.retain,
        ) {
            warn!("⚠️ Relay of {} failed: {}", client_id, e);
        }
    }

    /// Mirror accepted filters upstream; filters are recorded even while the
    /// relay is down and replayed once it reconnects.
    fn subscribe_upstream(&self, client_id: &str, filters: &[SubscribeFilter]) {
        let Some(upstream) = self.inner.sessions.upstream(client_id) else {
            return;
        };
        for filter in filters {
            debug!("📡 Subscribing {} upstream to {}", client_id, filter.path);
            if let Err(e) = upstream.subscribe(&filter.path, filter.qos) {
                warn!("⚠️ Upstream subscribe of {} failed: {}", client_id, e);
            }
        }
    }

    /// Deliver a publish to every matching local subscriber and keep it if retained.
    fn route(&self, publish: &Publish) {
        if publish.retain {
            if publish.payload.is_empty() {
                self.inner.retained.remove(&publish.topic);
            } else {
                self.inner.retained.insert(publish.topic.clone(), publish.clone());
            }
        }

        for link in self.inner.clients.iter() {
            let granted = max_qos(
                link.filters
                    .iter()
                    .filter(|(filter, _)| filter_matches(&publish.topic, filter))
                    .map(|(_, qos)| *qos),
            );
            let Some(granted) = granted else {
                continue;
            };
            let delivery = message(
                publish.topic.clone(),
                min_qos(publish.qos, granted),
                false,
                publish.payload.clone(),
            );
            match link.tx.try_send(delivery) {
                Ok(()) | Err(TrySendError::Closed(_)) => {}
                Err(TrySendError::Full(_)) => {
                    if !link.kick.is_cancelled() {
                        warn!("🐢 {} is not keeping up with its deliveries, disconnecting", link.key());
                        link.kick.cancel();
                    }
                }
            }
        }
    }

    /// Publish `key = value` to a device and record it before the device confirms.
    ///
    /// The session reads as written until the next parameter reply replaces it.
    #[instrument(level = "debug", skip(self))]
    pub async fn write_parameter(&self, device_id: &str, key: &str, value: i32) -> Result<(), IoTError> {
        if !self.inner.sessions.contains(device_id) {
            return Err(IoTError::SessionNotFound {
                device_id: device_id.to_string(),
            });
        }

        let payload = encode_write_request(key, value);
        self.publish(&write_request_topic(device_id), payload, QoS::AtMostOnce, false)
            .await?;
        self.inner.sessions.update_param(device_id, key, value);
        info!("✏️ {} set {} = {}", device_id, key, value);
        Ok(())
    }

    // =========================================================================
    // Listeners
    // =========================================================================

    /// Accept plaintext MQTT connections on `addr`; returns the bound address.
    pub async fn listen_tcp(&self, addr: SocketAddr) -> Result<SocketAddr, IoTError> {
        let listener = TcpListener::bind(addr).await?;
        let local = listener.local_addr()?;
        info!("🚀 MQTT listener on {}", local);
        tokio::spawn(self.clone().accept_loop(listener, None));
        Ok(local)
    }

    /// Accept MQTT over TLS on `addr` with a PEM certificate chain and key.
    pub async fn listen_tls(
        &self,
        addr: SocketAddr,
        certificate_path: &Path,
        private_key_path: &Path,
    ) -> Result<SocketAddr, IoTError> {
        let acceptor = load_tls_acceptor(certificate_path, private_key_path)?;
        let listener = TcpListener::bind(addr).await?;
        let local = listener.local_addr()?;
        info!("🚀 MQTT TLS listener on {}", local);
        tokio::spawn(self.clone().accept_loop(listener, Some(acceptor)));
        Ok(local)
    }

    async fn accept_loop(self, listener: TcpListener, tls: Option<TlsAcceptor>) {
        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let _ = stream.set_nodelay(true);
                        let broker = self.clone();
                        match tls.clone() {
                            Some(acceptor) => {
                                tokio::spawn(async move {
                                    match acceptor.accept(stream).await {
                                        Ok(stream) => broker.serve(stream, peer.to_string()).await,
                                        Err(e) => debug!("TLS handshake with {} failed: {}", peer, e),
                                    }
                                });
                            }
                            None => {
                                tokio::spawn(broker.serve(stream, peer.to_string()));
                            }
                        }
                    }
                    Err(e) => {
                        error!("❌ Accept failed: {}", e);
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                },
                _ = self.inner.shutdown.cancelled() => break,
            }
        }
    }

    /// Stop accepting, close every connection and every upstream relay.
    pub fn shutdown(&self) {
        info!("🛑 Shutting down local broker");
        self.inner.shutdown.cancel();
        for session in self.inner.sessions.drain() {
            if let Some(upstream) = session.upstream {
                upstream.close();
            }
        }
    }

    // =========================================================================
    // Connections
    // =========================================================================

    /// Run one client connection to completion.
    pub async fn serve<S>(self, stream: S, peer: String)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let mut framed = Framed::new(stream, MqttCodec::new(self.inner.config.max_packet_size));

        let mut connect = match tokio::time::timeout(CONNECT_TIMEOUT, framed.next()).await {
            Ok(Some(Ok(Packet::Connect(connect)))) => connect,
            Ok(Some(Ok(other))) => {
                debug!("{} sent {:?} before CONNECT", peer, other);
                return;
            }
            Ok(Some(Err(PacketError::Mqtt(
                rumqttc::mqttbytes::Error::InvalidProtocol | rumqttc::mqttbytes::Error::InvalidProtocolLevel(_),
            )))) => {
                debug!("{} speaks an unsupported protocol version", peer);
                let refused = ConnAck::new(ConnectReturnCode::RefusedProtocolVersion, false);
                let _ = send_within(&mut framed, Packet::ConnAck(refused), CONNECT_TIMEOUT).await;
                return;
            }
            Ok(Some(Err(e))) => {
                debug!("Bad CONNECT from {}: {}", peer, e);
                return;
            }
            Ok(None) => return,
            Err(_) => {
                debug!("{} sent no CONNECT in time", peer);
                return;
            }
        };

        let connection_id = self.inner.sessions.next_connection_id();
        let outcome = self
            .on_event(BrokerEvent::Connect {
                connect: &mut connect,
                connection_id,
            })
            .await;
        if let EventOutcome::Reject(code) = outcome {
            let _ = send_within(&mut framed, Packet::ConnAck(ConnAck::new(code, false)), CONNECT_TIMEOUT).await;
            return;
        }

        let (tx, rx) = mpsc::channel(OUTBOUND_CAPACITY);
        let kick = CancellationToken::new();
        let takeover = CancellationToken::new();
        let link = ClientLink {
            connection_id,
            tx,
            filters: Vec::new(),
            kick: kick.clone(),
            takeover: takeover.clone(),
        };
        if let Some(old) = self.inner.clients.insert(connect.client_id.clone(), link) {
            old.takeover.cancel();
        }

        info!("📱 {} connected from {} (connection {})", connect.client_id, peer, connection_id);
        // Clients get one and a half keep-alive periods between packets
        let grace = Duration::from_millis(u64::from(connect.keep_alive) * 1500);
        let mut conn = Connection {
            client_id: connect.client_id.clone(),
            connection_id,
            next_pkid: 0,
            qos2_pending: HashSet::new(),
            clean_exit: false,
            taken_over: false,
            write_timeout: if connect.keep_alive > 0 { grace } else { WRITE_TIMEOUT },
            kick,
            takeover,
        };

        let accepted = send_within(
            &mut framed,
            Packet::ConnAck(ConnAck::new(ConnectReturnCode::Success, false)),
            CONNECT_TIMEOUT,
        )
        .await;
        match accepted {
            Ok(()) => {
                if let Err(e) = self.run(&mut conn, &mut framed, rx, connect.keep_alive, grace).await {
                    debug!("Connection {} of {} ended: {}", connection_id, conn.client_id, e);
                }
            }
            Err(e) => debug!("CONNACK to {} failed: {}", conn.client_id, e),
        }

        self.teardown(&conn, connect).await;
    }

    async fn run<S>(
        &self,
        conn: &mut Connection,
        framed: &mut Framed<S, MqttCodec>,
        mut rx: mpsc::Receiver<Publish>,
        keep_alive: u16,
        grace: Duration,
    ) -> Result<(), IoTError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let idle = tokio::time::sleep(grace);
        tokio::pin!(idle);
        let kick = conn.kick.clone();
        let takeover = conn.takeover.clone();

        loop {
            tokio::select! {
                incoming = framed.next() => match incoming {
                    Some(Ok(packet)) => {
                        idle.as_mut().reset(Instant::now() + grace);
                        if !self.handle_packet(conn, framed, packet).await? {
                            return Ok(());
                        }
                    }
                    Some(Err(e)) => return Err(e.into()),
                    None => return Ok(()),
                },
                outbound = rx.recv() => match outbound {
                    Some(mut publish) => {
                        if publish.qos != QoS::AtMostOnce {
                            publish.pkid = conn.next_pkid();
                        }
                        conn.send(framed, Packet::Publish(publish)).await?;
                    }
                    None => {
                        conn.taken_over = true;
                        return Ok(());
                    }
                },
                _ = takeover.cancelled() => {
                    conn.taken_over = true;
                    return Ok(());
                }
                _ = kick.cancelled() => return Err(too_slow()),
                _ = &mut idle, if keep_alive > 0 => {
                    warn!("⏰ Keep alive of {} expired", conn.client_id);
                    return Ok(());
                }
                _ = self.inner.shutdown.cancelled() => return Ok(()),
            }
        }
    }

    /// Handle one packet; `false` ends the connection.
    async fn handle_packet<S>(
        &self,
        conn: &mut Connection,
        framed: &mut Framed<S, MqttCodec>,
        packet: Packet,
    ) -> Result<bool, IoTError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        match packet {
            Packet::Publish(publish) => {
                if !valid_topic(&publish.topic) {
                    warn!("⚠️ {} published to invalid topic {:?}", conn.client_id, publish.topic);
                    return Ok(false);
                }
                match publish.qos {
                    QoS::AtMostOnce => self.accept_publish(&conn.client_id, &publish).await,
                    QoS::AtLeastOnce => {
                        self.accept_publish(&conn.client_id, &publish).await;
                        conn.send(framed, Packet::PubAck(PubAck::new(publish.pkid))).await?;
                    }
                    QoS::ExactlyOnce => {
                        if conn.qos2_pending.insert(publish.pkid) {
                            self.accept_publish(&conn.client_id, &publish).await;
                        }
                        conn.send(framed, Packet::PubRec(PubRec::new(publish.pkid))).await?;
                    }
                }
            }
            Packet::PubRel(rel) => {
                conn.qos2_pending.remove(&rel.pkid);
                conn.send(framed, Packet::PubComp(PubComp::new(rel.pkid))).await?;
            }
            Packet::PubAck(_) | Packet::PubRec(_) | Packet::PubComp(_) => {}
            Packet::Subscribe(subscribe) => {
                let mut accepted = Vec::new();
                let return_codes = subscribe
                    .filters
                    .iter()
                    .map(|filter| {
                        if valid_filter(&filter.path) {
                            let qos = min_qos(filter.qos, MAX_GRANTED_QOS);
                            accepted.push(SubscribeFilter::new(filter.path.clone(), qos));
                            SubscribeReasonCode::Success(qos)
                        } else {
                            SubscribeReasonCode::Failure
                        }
                    })
                    .collect();

                self.add_filters(conn, &accepted);
                conn.send(framed, Packet::SubAck(SubAck::new(subscribe.pkid, return_codes)))
                    .await?;
                self.on_event(BrokerEvent::Subscribe {
                    client_id: &conn.client_id,
                    filters: &accepted,
                })
                .await;

                for mut publish in self.retained_for(&accepted) {
                    if publish.qos != QoS::AtMostOnce {
                        publish.pkid = conn.next_pkid();
                    }
                    conn.send(framed, Packet::Publish(publish)).await?;
                }
            }
            Packet::Unsubscribe(unsubscribe) => {
                if let Some(mut link) = self.inner.clients.get_mut(&conn.client_id) {
                    if link.connection_id == conn.connection_id {
                        link.filters.retain(|(f, _)| !unsubscribe.topics.contains(f));
                    }
                }
                if let Some(upstream) = self.inner.sessions.upstream(&conn.client_id) {
                    for topic in &unsubscribe.topics {
                        if let Err(e) = upstream.unsubscribe(topic) {
                            warn!("⚠️ Upstream unsubscribe of {} from {} failed: {}", conn.client_id, topic, e);
                        }
                    }
                }
                conn.send(framed, Packet::UnsubAck(UnsubAck::new(unsubscribe.pkid))).await?;
            }
            Packet::PingReq => conn.send(framed, Packet::PingResp).await?,
            Packet::Disconnect => {
                conn.clean_exit = true;
                return Ok(false);
            }
            other => {
                warn!("⚠️ Unexpected {:?} from {}", other, conn.client_id);
                return Ok(false);
            }
        }
        Ok(true)
    }

    async fn accept_publish(&self, client_id: &str, publish: &Publish) {
        self.on_event(BrokerEvent::Publish { client_id, publish }).await;
        self.route(publish);
    }

    fn add_filters(&self, conn: &Connection, filters: &[SubscribeFilter]) {
        let Some(mut link) = self.inner.clients.get_mut(&conn.client_id) else {
            return;
        };
        if link.connection_id != conn.connection_id {
            return;
        }
        for filter in filters {
            match link.filters.iter_mut().find(|(f, _)| *f == filter.path) {
                Some(existing) => existing.1 = filter.qos,
                None => link.filters.push((filter.path.clone(), filter.qos)),
            }
        }
    }

    fn retained_for(&self, filters: &[SubscribeFilter]) -> Vec<Publish> {
        self.inner
            .retained
            .iter()
            .filter_map(|entry| {
                let granted = max_qos(
                    filters
                        .iter()
                        .filter(|f| filter_matches(entry.key(), &f.path))
                        .map(|f| f.qos),
                )?;
                let mut publish = entry.value().clone();
                publish.qos = min_qos(publish.qos, granted);
                publish.retain = true;
                Some(publish)
            })
            .collect()
    }

    async fn teardown(&self, conn: &Connection, connect: Connect) {
        self.inner
            .clients
            .remove_if(&conn.client_id, |_, link| link.connection_id == conn.connection_id);

        if !conn.clean_exit && !conn.taken_over {
            if let Some(will) = connect.last_will {
                debug!("📨 Publishing will of {} on {}", conn.client_id, will.topic);
                self.route(&message(will.topic, will.qos, will.retain, will.message));
            }
        }

        self.on_event(BrokerEvent::Disconnect {
            client_id: &conn.client_id,
            connection_id: conn.connection_id,
        })
        .await;
        info!("👋 {} disconnected (connection {})", conn.client_id, conn.connection_id);
    }
}

#[async_trait]
impl MessagePublisher for Broker {
    async fn publish(&self, topic: &str, payload: Bytes, qos: QoS, retain: bool) -> Result<(), IoTError> {
        if !valid_topic(topic) {
            return Err(IoTError::Publish {
                topic: topic.to_string(),
                reason: "invalid topic".to_string(),
            });
        }
        let publish = message(topic, qos, retain, payload);
        self.accept_publish(INLINE_CLIENT_ID, &publish).await;
        Ok(())
    }
}

struct Connection {
    client_id: String,
    connection_id: u64,
    next_pkid: u16,
    qos2_pending: HashSet<u16>,
    clean_exit: bool,
    taken_over: bool,
    write_timeout: Duration,
    kick: CancellationToken,
    takeover: CancellationToken,
}

impl Connection {
    fn next_pkid(&mut self) -> u16 {
        self.next_pkid = self.next_pkid.wrapping_add(1);
        if self.next_pkid == 0 {
            self.next_pkid = 1;
        }
        self.next_pkid
    }

    /// Write one packet; a stalled peer or a kick ends the connection.
    async fn send<S>(&self, framed: &mut Framed<S, MqttCodec>, packet: Packet) -> Result<(), IoTError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        tokio::select! {
            sent = send_within(framed, packet, self.write_timeout) => sent,
            _ = self.kick.cancelled() => Err(too_slow()),
        }
    }
}

async fn send_within<S>(framed: &mut Framed<S, MqttCodec>, packet: Packet, deadline: Duration) -> Result<(), IoTError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    match tokio::time::timeout(deadline, framed.send(packet)).await {
        Ok(sent) => Ok(sent?),
        Err(_) => Err(IoTError::Io(io::Error::new(io::ErrorKind::TimedOut, "write timed out"))),
    }
}

fn too_slow() -> IoTError {
    IoTError::Io(io::Error::new(io::ErrorKind::TimedOut, "client too slow"))
}

fn load_tls_acceptor(certificate_path: &Path, private_key_path: &Path) -> Result<TlsAcceptor, IoTError> {
    let tls_error = |path: &Path, e: std::io::Error| IoTError::Tls(format!("{}: {}", path.display(), e));

    let certs = {
        let file = std::fs::File::open(certificate_path).map_err(|e| tls_error(certificate_path, e))?;
        rustls_pemfile::certs(&mut std::io::BufReader::new(file))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| tls_error(certificate_path, e))?
    };
    if certs.is_empty() {
        return Err(IoTError::Tls(format!(
            "{}: no certificates found",
            certificate_path.display()
        )));
    }

    let key = {
        let file = std::fs::File::open(private_key_path).map_err(|e| tls_error(private_key_path, e))?;
        rustls_pemfile::private_key(&mut std::io::BufReader::new(file))
            .map_err(|e| tls_error(private_key_path, e))?
            .ok_or_else(|| IoTError::Tls(format!("{}: no private key found", private_key_path.display())))?
    };

    let config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| IoTError::Tls(e.to_string()))?;
    Ok(TlsAcceptor::from(Arc::new(config)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    use prost::Message;
    use tokio::io::DuplexStream;

    use crate::codec::{Parameter, ParametersMsg};
    use crate::mqtt::{LastWill, PubRel, Subscribe};

    type Client = Framed<DuplexStream, MqttCodec>;

    fn connect_packet(client_id: &str, keep_alive: u16) -> Connect {
        let mut connect = Connect::new(client_id);
        connect.keep_alive = keep_alive;
        connect.set_login("user", "pwd");
        connect
    }

    async fn open(broker: &Broker, connect: Connect) -> (Client, ConnAck) {
        open_with_buffer(broker, connect, 64 * 1024).await
    }

    async fn open_with_buffer(broker: &Broker, connect: Connect, buffer: usize) -> (Client, ConnAck) {
        let (client, server) = tokio::io::duplex(buffer);
        tokio::spawn(broker.clone().serve(server, "test".to_string()));

        let mut client = Framed::new(client, MqttCodec::default());
        client.send(Packet::Connect(connect)).await.unwrap();
        match client.next().await {
            Some(Ok(Packet::ConnAck(ack))) => (client, ack),
            other => panic!("expected CONNACK, got {:?}", other),
        }
    }

    async fn publish(client: &mut Client, topic: &str, payload: Vec<u8>) {
        let publish = Publish::new(topic, QoS::AtMostOnce, payload);
        client.send(Packet::Publish(publish)).await.unwrap();
        // a round trip guarantees the publish was handled
        client.send(Packet::PingReq).await.unwrap();
        assert_eq!(client.next().await.unwrap().unwrap(), Packet::PingResp);
    }

    async fn subscribe(client: &mut Client, filter: &str, qos: QoS) -> Vec<SubscribeReasonCode> {
        let mut subscribe = Subscribe::new(filter, qos);
        subscribe.pkid = 1;
        client.send(Packet::Subscribe(subscribe)).await.unwrap();
        match client.next().await {
            Some(Ok(Packet::SubAck(ack))) => ack.return_codes,
            other => panic!("expected SUBACK, got {:?}", other),
        }
    }

    fn birth_payload(serial: &str) -> Vec<u8> {
        ParametersMsg {
            timestamp: 1,
            params: vec![Parameter::string("serial_number", serial)],
            param_limits: None,
        }
        .encode_to_vec()
    }

    fn broker() -> Broker {
        Broker::new(BrokerConfig::default(), Arc::new(SessionStore::new()))
    }

    async fn wait_for<F: Fn() -> bool>(condition: F) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    #[tokio::test]
    async fn test_birth_is_decoded_into_session() {
        let broker = broker();
        let (mut client, ack) = open(&broker, connect_packet("gw-1", 60)).await;
        assert_eq!(ack.code, ConnectReturnCode::Success);

        publish(&mut client, "$EDC/ari/gw-1/MQTT/BIRTH", birth_payload("SN123")).await;

        let session = broker.sessions().get("gw-1").unwrap();
        let mut expected = HashMap::new();
        expected.insert("serial_number".to_string(), "SN123".to_string());
        assert_eq!(session.birth, Some(expected));
        assert!(session.params.is_none());
    }

    #[tokio::test]
    async fn test_bad_birth_keeps_previous_state() {
        let broker = broker();
        let (mut client, _) = open(&broker, connect_packet("gw-1", 60)).await;

        publish(&mut client, "$EDC/ari/gw-1/MQTT/BIRTH", birth_payload("SN123")).await;
        publish(&mut client, "$EDC/ari/gw-1/MQTT/BIRTH", vec![0xff, 0xff, 0xff]).await;

        let session = broker.sessions().get("gw-1").unwrap();
        assert_eq!(session.birth.unwrap()["serial_number"], "SN123");
    }

    #[tokio::test]
    async fn test_params_reply_replaces_values_and_limits() {
        let broker = broker();
        let (mut client, _) = open(&broker, connect_packet("gw-1", 60)).await;

        let reply = ParametersMsg {
            timestamp: 1,
            params: vec![Parameter::int("T_22.1.3", 550), Parameter::int("T_22.0.3", 1)],
            param_limits: Some(crate::codec::ParameterLimitsMsg {
                limits: vec![crate::codec::ParameterLimit {
                    key: "T_22.1.3".to_string(),
                    min: 400,
                    max: 800,
                }],
            }),
        };
        publish(&mut client, "$EDC/ari/gw-1/ar1/REPLY/params", reply.encode_to_vec()).await;

        let session = broker.sessions().get("gw-1").unwrap();
        assert_eq!(session.params.unwrap()["T_22.1.3"], 550);
        let limits = session.param_limits.unwrap();
        assert_eq!((limits["T_22.1.3"].min, limits["T_22.1.3"].max), (400, 800));
    }

    #[tokio::test]
    async fn test_empty_client_id_rejected() {
        let broker = broker();
        let (_client, ack) = open(&broker, connect_packet("", 60)).await;
        assert_eq!(ack.code, ConnectReturnCode::BadClientId);
        assert!(broker.sessions().is_empty());
    }

    #[tokio::test]
    async fn test_unreachable_upstream_rejects_device() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let config = BrokerConfig {
            relay: Some(RelayConfig {
                host: "127.0.0.1".to_string(),
                port,
                tls: false,
                connect_timeout: Duration::from_secs(2),
            }),
            ..BrokerConfig::default()
        };
        let broker = Broker::new(config, Arc::new(SessionStore::new()));
        let (_client, ack) = open(&broker, connect_packet("gw-1", 60)).await;

        assert_eq!(ack.code, ConnectReturnCode::NotAuthorized);
        assert!(!broker.sessions().contains("gw-1"));
    }

    #[tokio::test]
    async fn test_empty_will_payload_is_patched() {
        let broker = broker();
        let mut connect = connect_packet("gw-1", 60);
        connect.last_will = Some(LastWill::new("$EDC/ari/gw-1/MQTT/LWT", Vec::new(), QoS::AtMostOnce, false));

        let outcome = broker
            .on_event(BrokerEvent::Connect {
                connect: &mut connect,
                connection_id: 1,
            })
            .await;
        assert_eq!(outcome, EventOutcome::Accept);
        assert_eq!(connect.last_will.unwrap().message, Bytes::from_static(&[0]));
    }

    #[tokio::test]
    async fn test_disconnect_removes_session_once() {
        let broker = broker();
        let (mut client, _) = open(&broker, connect_packet("gw-1", 60)).await;
        assert!(broker.sessions().contains("gw-1"));

        client.send(Packet::Disconnect).await.unwrap();
        let sessions = broker.sessions().clone();
        wait_for(|| !sessions.contains("gw-1")).await;

        // a duplicate disconnect event is harmless
        broker
            .on_event(BrokerEvent::Disconnect {
                client_id: "gw-1",
                connection_id: 1,
            })
            .await;
        assert!(broker.sessions().get("gw-1").is_none());
    }

    #[tokio::test]
    async fn test_write_parameter_is_visible_immediately() {
        let broker = broker();
        let (mut device, _) = open(&broker, connect_packet("gw-1", 60)).await;
        assert_eq!(
            subscribe(&mut device, "$EDC/ari/gw-1/ar1/PUT/#", QoS::AtMostOnce).await,
            vec![SubscribeReasonCode::Success(QoS::AtMostOnce)]
        );

        broker.write_parameter("gw-1", "T_22.1.3", 600).await.unwrap();
        assert_eq!(broker.sessions().get("gw-1").unwrap().params.unwrap()["T_22.1.3"], 600);

        let Some(Ok(Packet::Publish(request))) = device.next().await else {
            panic!("device should receive the write request");
        };
        assert_eq!(request.topic, "$EDC/ari/gw-1/ar1/PUT/Menu/Par");
        let msg = decode_parameters(&request.payload).unwrap();
        assert_eq!(msg.params[0].key, "T_22.1.3");
        assert_eq!(msg.params[0].as_int(), Some(600));

        assert!(matches!(
            broker.write_parameter("gw-2", "T_22.1.3", 600).await,
            Err(IoTError::SessionNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_subscription_qos_is_capped_and_retained_delivered() {
        let broker = broker();
        broker
            .publish("status/gw-1", Bytes::from_static(b"online"), QoS::ExactlyOnce, true)
            .await
            .unwrap();

        let (mut client, _) = open(&broker, connect_packet("viewer", 60)).await;
        assert_eq!(
            subscribe(&mut client, "status/+", QoS::ExactlyOnce).await,
            vec![SubscribeReasonCode::Success(QoS::AtLeastOnce)]
        );

        let Some(Ok(Packet::Publish(retained))) = client.next().await else {
            panic!("retained message expected");
        };
        assert!(retained.retain);
        assert_eq!(retained.qos, QoS::AtLeastOnce);
        assert_ne!(retained.pkid, 0);
        assert_eq!(retained.payload, Bytes::from_static(b"online"));

        assert_eq!(
            subscribe(&mut client, "bad/#/filter", QoS::AtMostOnce).await,
            vec![SubscribeReasonCode::Failure]
        );
    }

    #[tokio::test]
    async fn test_qos2_inbound_flow() {
        let broker = broker();
        let (mut client, _) = open(&broker, connect_packet("gw-1", 60)).await;

        let mut publish = Publish::new("a/b", QoS::ExactlyOnce, "x");
        publish.pkid = 3;
        client.send(Packet::Publish(publish)).await.unwrap();
        assert_eq!(client.next().await.unwrap().unwrap(), Packet::PubRec(PubRec::new(3)));
        client.send(Packet::PubRel(PubRel::new(3))).await.unwrap();
        assert_eq!(client.next().await.unwrap().unwrap(), Packet::PubComp(PubComp::new(3)));
    }

    #[tokio::test]
    async fn test_mqtt5_connect_refused() {
        let broker = broker();
        let mut connect = connect_packet("gw-1", 60);
        connect.protocol = Protocol::V5;

        let outcome = broker
            .on_event(BrokerEvent::Connect {
                connect: &mut connect,
                connection_id: 1,
            })
            .await;
        assert_eq!(outcome, EventOutcome::Reject(ConnectReturnCode::RefusedProtocolVersion));
        assert!(broker.sessions().is_empty());
    }

    #[tokio::test]
    async fn test_slow_subscriber_is_disconnected() {
        let broker = broker();
        let (mut reader, _) = open(&broker, connect_packet("reader", 60)).await;
        subscribe(&mut reader, "other/#", QoS::AtMostOnce).await;

        // a tiny transport buffer the client never drains
        let (mut slow, _) = open_with_buffer(&broker, connect_packet("slow", 60), 512).await;
        subscribe(&mut slow, "t/#", QoS::AtMostOnce).await;

        let chunk = Bytes::from(vec![0x55u8; 1024]);
        for _ in 0..200 {
            broker
                .publish("t/data", chunk.clone(), QoS::AtMostOnce, false)
                .await
                .unwrap();
        }

        let sessions = broker.sessions().clone();
        tokio::time::timeout(Duration::from_secs(4), async {
            while sessions.contains("slow") {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("slow subscriber should be dropped well before its keep alive");

        // other clients keep being served
        assert!(broker.sessions().contains("reader"));
        broker
            .publish("other/x", Bytes::from_static(b"ok"), QoS::AtMostOnce, false)
            .await
            .unwrap();
        let Some(Ok(Packet::Publish(delivered))) = reader.next().await else {
            panic!("reader should still receive deliveries");
        };
        assert_eq!(delivered.payload, Bytes::from_static(b"ok"));
        drop(slow);
    }

    #[tokio::test]
    async fn test_keep_alive_expiry_drops_session() {
        let broker = broker();
        let (_client, _) = open(&broker, connect_packet("gw-1", 1)).await;
        assert!(broker.sessions().contains("gw-1"));

        let sessions = broker.sessions().clone();
        wait_for(|| !sessions.contains("gw-1")).await;
    }

    #[tokio::test]
    async fn test_takeover_keeps_newer_session() {
        let broker = broker();
        let (mut old, _) = open(&broker, connect_packet("gw-1", 60)).await;
        let (mut new, ack) = open(&broker, connect_packet("gw-1", 60)).await;
        assert_eq!(ack.code, ConnectReturnCode::Success);

        // the older connection is closed by the broker
        assert!(old.next().await.is_none());

        publish(&mut new, "$EDC/ari/gw-1/MQTT/BIRTH", birth_payload("SN9")).await;
        let session = broker.sessions().get("gw-1").unwrap();
        assert_eq!(session.birth.unwrap()["serial_number"], "SN9");
        assert_eq!(broker.connected_clients(), 1);
    }

    #[tokio::test]
    async fn test_will_published_on_abnormal_disconnect() {
        let broker = broker();
        let (mut watcher, _) = open(&broker, connect_packet("watcher", 60)).await;
        subscribe(&mut watcher, "lwt/#", QoS::AtMostOnce).await;

        let mut connect = connect_packet("gw-1", 60);
        connect.last_will = Some(LastWill::new("lwt/gw-1", Vec::new(), QoS::AtMostOnce, false));
        let (device, _) = open(&broker, connect).await;
        drop(device);

        let Some(Ok(Packet::Publish(will))) = watcher.next().await else {
            panic!("will expected");
        };
        assert_eq!(will.topic, "lwt/gw-1");
        assert_eq!(will.payload, Bytes::from_static(&[0]));
    }

    #[tokio::test]
    async fn test_inline_publish_is_not_relayed_and_reaches_subscribers() {
        let broker = broker();
        let (mut device, _) = open(&broker, connect_packet("gw-1", 60)).await;
        subscribe(&mut device, "$EDC/ari/gw-1/ar1/GET/#", QoS::AtLeastOnce).await;

        broker
            .publish(
                "$EDC/ari/gw-1/ar1/GET/Menu/Par",
                Bytes::from_static(b"req"),
                QoS::AtMostOnce,
                false,
            )
            .await
            .unwrap();

        let Some(Ok(Packet::Publish(request))) = device.next().await else {
            panic!("request expected");
        };
        assert_eq!(request.qos, QoS::AtMostOnce);
        assert_eq!(request.payload, Bytes::from_static(b"req"));

        assert!(broker
            .publish("bad/+", Bytes::new(), QoS::AtMostOnce, false)
            .await
            .is_err());
    }

    #[test]
    fn test_tls_material_errors() {
        let dir = tempfile::tempdir().unwrap();
        let cert = dir.path().join("broker.crt");
        let key = dir.path().join("broker.key");

        let err = load_tls_acceptor(&cert, &key).err().unwrap();
        assert!(matches!(err, IoTError::Tls(ref m) if m.contains("broker.crt")));

        std::fs::write(&cert, "not a certificate\n").unwrap();
        let err = load_tls_acceptor(&cert, &key).err().unwrap();
        assert!(matches!(err, IoTError::Tls(ref m) if m.contains("no certificates found")));
    }
}

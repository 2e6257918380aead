//! # Upstream Relay
//!
//! One outbound MQTT client per device session, connected to the vendor's
//! cloud broker under the device's own identity. Everything the device
//! publishes locally is forwarded through it, and everything the cloud sends
//! back is republished on the local broker as gateway-internal traffic.
//!
//! The cloud broker presents a certificate for its public name while the
//! device is pointed at this gateway instead, so server certificates are not
//! verified on this link.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use rumqttc::{
    AsyncClient, Event, EventLoop, MqttOptions, Outgoing, Packet, TlsConfiguration, Transport,
};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{ring, WebPkiSupportedAlgorithms};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, SignatureScheme};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use crate::broker::MessagePublisher;
use crate::mqtt::{Connect, QoS};
use crate::IoTError;

/// Keep alive presented to the cloud broker, matching the appliance firmware.
pub const UPSTREAM_KEEP_ALIVE: Duration = Duration::from_secs(0xeb);

const DEFAULT_TLS_PORT: u16 = 8883;
const DEFAULT_TCP_PORT: u16 = 1883;
const RECONNECT_DELAY: Duration = Duration::from_secs(1);
/// Time a closing relay gets to flush its DISCONNECT before the task is aborted.
const CLOSE_GRACE: Duration = Duration::from_secs(2);
const REQUEST_CAPACITY: usize = 64;

// =============================================================================
// Configuration
// =============================================================================

/// Where and how to reach the upstream broker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayConfig {
    pub host: String,
    pub port: u16,
    /// TLS without server certificate verification
    pub tls: bool,
    /// How long a new session waits for the upstream CONNACK
    pub connect_timeout: Duration,
}

impl RelayConfig {
    /// Parse an upstream URL (`ssl://host:port`, `tcp://host:port` or `mqtt://host:port`).
    ///
    /// An empty URL disables relaying and yields `None`.
    pub fn from_url(url: &str) -> Result<Option<Self>, IoTError> {
        let url = url.trim();
        if url.is_empty() {
            return Ok(None);
        }

        let invalid = || IoTError::Configuration {
            parameter: format!("broker.upstream: invalid URL {:?}", url),
        };

        let (tls, rest) = if let Some(rest) = url.strip_prefix("ssl://") {
            (true, rest)
        } else if let Some(rest) = url.strip_prefix("tls://") {
            (true, rest)
        } else if let Some(rest) = url.strip_prefix("tcp://") {
            (false, rest)
        } else if let Some(rest) = url.strip_prefix("mqtt://") {
            (false, rest)
        } else {
            return Err(invalid());
        };

        let rest = rest.trim_end_matches('/');
        let (host, port) = match rest.rsplit_once(':') {
            Some((host, port)) => (host, port.parse::<u16>().map_err(|_| invalid())?),
            None if tls => (rest, DEFAULT_TLS_PORT),
            None => (rest, DEFAULT_TCP_PORT),
        };
        if host.is_empty() {
            return Err(invalid());
        }

        Ok(Some(RelayConfig {
            host: host.to_string(),
            port,
            tls,
            connect_timeout: Duration::from_secs(5),
        }))
    }
}

// =============================================================================
// Relay
// =============================================================================

struct RelayInner {
    device_id: String,
    client: AsyncClient,
    connected: AtomicBool,
    closed: AtomicBool,
    /// Subscriptions replayed after every reconnect (clean session)
    filters: Mutex<Vec<(String, QoS)>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

/// Handle to a device's upstream connection; clones share the connection.
#[derive(Clone)]
pub struct UpstreamRelay {
    inner: Arc<RelayInner>,
}

impl fmt::Debug for UpstreamRelay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UpstreamRelay")
            .field("device_id", &self.inner.device_id)
            .field("connected", &self.is_connected())
            .finish()
    }
}

impl UpstreamRelay {
    /// Open the upstream connection for a device, presenting its client id,
    /// credentials and will.
    ///
    /// Succeeds only once the upstream broker accepted the connection; after
    /// that a background task keeps it alive, reconnecting as needed, and hands
    /// every inbound message to `publisher`.
    #[instrument(level = "debug", skip(config, connect, publisher), fields(device_id = %connect.client_id))]
    pub async fn connect(
        config: &RelayConfig,
        connect: &Connect,
        publisher: Arc<dyn MessagePublisher>,
    ) -> Result<Self, IoTError> {
        let device_id = connect.client_id.clone();
        let failed = |reason: String| IoTError::UpstreamConnect {
            device_id: device_id.clone(),
            reason,
        };

        let mut options = MqttOptions::new(device_id.clone(), config.host.clone(), config.port);
        options.set_keep_alive(UPSTREAM_KEEP_ALIVE);
        options.set_clean_session(true);
        if let Some(login) = &connect.login {
            options.set_credentials(login.username.clone(), login.password.clone());
        }
        if let Some(will) = &connect.last_will {
            options.set_last_will(will.clone());
        }
        if config.tls {
            options.set_transport(Transport::tls_with_config(TlsConfiguration::Rustls(
                Arc::new(insecure_client_config()),
            )));
        }

        let (client, mut eventloop) = AsyncClient::new(options, REQUEST_CAPACITY);

        debug!("🔧 Connecting upstream {}:{} for {}", config.host, config.port, device_id);
        match tokio::time::timeout(config.connect_timeout, wait_for_connack(&mut eventloop)).await {
            Ok(Ok(())) => {}
            Ok(Err(reason)) => return Err(failed(reason)),
            Err(_) => return Err(failed("timed out waiting for CONNACK".to_string())),
        }

        let relay = UpstreamRelay {
            inner: Arc::new(RelayInner {
                device_id: device_id.clone(),
                client,
                connected: AtomicBool::new(true),
                closed: AtomicBool::new(false),
                filters: Mutex::new(Vec::new()),
                task: Mutex::new(None),
            }),
        };

        let task = tokio::spawn(drive(relay.clone(), eventloop, publisher));
        if let Ok(mut slot) = relay.inner.task.lock() {
            *slot = Some(task);
        }

        info!("✅ Upstream connected for {}", device_id);
        Ok(relay)
    }

    pub fn device_id(&self) -> &str {
        &self.inner.device_id
    }

    /// Whether the upstream link is currently up.
    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::Acquire) && !self.inner.closed.load(Ordering::Acquire)
    }

    /// Forward a publish upstream without waiting for it to be sent.
    pub fn publish(&self, topic: &str, payload: Bytes, qos: QoS, retain: bool) -> Result<(), IoTError> {
        self.inner
            .client
            .try_publish(topic, qos, retain, payload.to_vec())
            .map_err(|e| IoTError::Publish {
                topic: topic.to_string(),
                reason: e.to_string(),
            })
    }

    /// Subscribe upstream; the filter is replayed after reconnects.
    pub fn subscribe(&self, filter: &str, qos: QoS) -> Result<(), IoTError> {
        if let Ok(mut filters) = self.inner.filters.lock() {
            match filters.iter_mut().find(|(f, _)| f == filter) {
                Some(existing) => existing.1 = qos,
                None => filters.push((filter.to_string(), qos)),
            }
        }
        self.inner
            .client
            .try_subscribe(filter, qos)
            .map_err(|e| IoTError::Publish {
                topic: filter.to_string(),
                reason: e.to_string(),
            })
    }

    /// Drop the recorded filter and unsubscribe upstream.
    pub fn unsubscribe(&self, filter: &str) -> Result<(), IoTError> {
        if let Ok(mut filters) = self.inner.filters.lock() {
            filters.retain(|(f, _)| f != filter);
        }
        self.inner
            .client
            .try_unsubscribe(filter)
            .map_err(|e| IoTError::Publish {
                topic: filter.to_string(),
                reason: e.to_string(),
            })
    }

    /// Disconnect and stop the background task without waiting for either.
    /// Safe to call more than once.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.connected.store(false, Ordering::Release);
        let _ = self.inner.client.try_disconnect();

        let task = self.inner.task.lock().ok().and_then(|mut slot| slot.take());
        if let Some(task) = task {
            match tokio::runtime::Handle::try_current() {
                Ok(runtime) => {
                    runtime.spawn(async move {
                        tokio::time::sleep(CLOSE_GRACE).await;
                        task.abort();
                    });
                }
                Err(_) => task.abort(),
            }
        }
        info!("🛑 Upstream closed for {}", self.inner.device_id);
    }

    /// Filters replayed on every reconnect.
    pub fn filters(&self) -> Vec<(String, QoS)> {
        self.inner
            .filters
            .lock()
            .map(|f| f.clone())
            .unwrap_or_default()
    }
}

async fn wait_for_connack(eventloop: &mut EventLoop) -> Result<(), String> {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(_))) => return Ok(()),
            Ok(_) => continue,
            Err(e) => return Err(e.to_string()),
        }
    }
}

/// Background loop of one relay: keeps the link up and republishes inbound traffic.
async fn drive(relay: UpstreamRelay, mut eventloop: EventLoop, publisher: Arc<dyn MessagePublisher>) {
    let device_id = relay.device_id().to_string();

    while !relay.inner.closed.load(Ordering::Acquire) {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                if relay.inner.closed.load(Ordering::Acquire) {
                    break;
                }
                debug!("📥 Upstream message for {} on {}", device_id, publish.topic);
                if let Err(e) = publisher
                    .publish(&publish.topic, publish.payload, publish.qos, publish.retain)
                    .await
                {
                    warn!("⚠️ Republishing upstream message for {} failed: {}", device_id, e);
                }
            }
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                relay.inner.connected.store(true, Ordering::Release);
                info!("🔄 Upstream reconnected for {}", device_id);
                for (filter, qos) in relay.filters() {
                    if let Err(e) = relay.inner.client.try_subscribe(filter.clone(), qos) {
                        warn!("⚠️ Re-subscribing {} for {} failed: {}", filter, device_id, e);
                    }
                }
            }
            Ok(Event::Outgoing(Outgoing::Disconnect)) => break,
            Ok(_) => {}
            Err(e) => {
                if relay.inner.closed.load(Ordering::Acquire) {
                    break;
                }
                relay.inner.connected.store(false, Ordering::Release);
                error!("❌ Upstream connection lost for {}: {}", device_id, e);
                tokio::time::sleep(RECONNECT_DELAY).await;
            }
        }
    }
    debug!("Upstream task finished for {}", device_id);
}

// =============================================================================
// TLS
// =============================================================================

/// Accepts any server certificate; handshake signatures are still checked.
#[derive(Debug)]
struct AcceptAnyServerCert {
    algorithms: WebPkiSupportedAlgorithms,
}

impl ServerCertVerifier for AcceptAnyServerCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(message, cert, dss, &self.algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(message, cert, dss, &self.algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.algorithms.supported_schemes()
    }
}

fn insecure_client_config() -> ClientConfig {
    let verifier = AcceptAnyServerCert {
        algorithms: ring::default_provider().signature_verification_algorithms,
    };
    ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(verifier))
        .with_no_client_auth()
}

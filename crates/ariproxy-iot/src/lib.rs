//! # ariproxy IoT Core - Ariston Appliance MQTT Gateway
//!
//! **Module:** ariproxy-iot - local broker, upstream relay and parameter decoding
//! **License:** Apache 2.0 / MIT
//!
//! ## Description
//!
//! Ariston Velis/Med water heaters talk MQTT to the vendor's Everyware cloud
//! broker and carry their settings and telemetry in a protobuf parameter
//! format. This crate terminates those connections locally, optionally mirrors
//! every device's traffic to the real upstream broker, and decodes the
//! parameter payloads into per-device state that an HTTP façade can serve.
//!
//! ## Components
//!
//! - [`codec`] - parameter and consumption message encoding/decoding
//! - [`session`] - concurrency-safe store of per-device session state
//! - [`relay`] - one upstream MQTT client per device session
//! - [`broker`] - the local MQTT broker and its message interception
//! - [`poller`] - background loops that ask devices for fresh parameters
//!
//! ## Usage Examples
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use ariproxy_iot::{Broker, BrokerConfig, DeviceRegistry, Poller, PollerConfig, SessionStore};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let sessions = Arc::new(SessionStore::new());
//!     let broker = Broker::new(BrokerConfig::default(), sessions.clone());
//!     broker.listen_tcp("0.0.0.0:1883".parse()?).await?;
//!
//!     let poller = Poller::new(
//!         PollerConfig::default(),
//!         sessions,
//!         Arc::new(DeviceRegistry::default()),
//!         Arc::new(broker.clone()),
//!     );
//!     poller.spawn();
//!     Ok(())
//! }
//! ```

use thiserror::Error;

use ariproxy_common::GatewayError;

pub mod broker;
pub mod codec;
pub mod device;
pub mod mqtt;
pub mod poller;
pub mod relay;
pub mod session;
pub mod topics;

pub use broker::{Broker, BrokerConfig, BrokerEvent, EventOutcome, MessagePublisher};
pub use codec::{ConsumptionSnapshot, Parameter, ParameterLimits, ParametersMsg, ParameterValue};
pub use device::{ApplianceModel, DeviceDescriptor, DeviceRegistry, ModelKeys};
pub use mqtt::QoS;
pub use poller::{Poller, PollerConfig};
pub use relay::{RelayConfig, UpstreamRelay};
pub use session::{Session, SessionSnapshot, SessionStore};

/// Client id of the gateway's own publishing identity.
///
/// Messages published under this identity (poll requests, façade writes,
/// republished upstream traffic) are never relayed upstream.
pub const INLINE_CLIENT_ID: &str = "inline";

// =============================================================================
// Core IoT Error Types
// =============================================================================

/// Errors raised by the gateway core
#[derive(Error, Debug)]
pub enum IoTError {
    #[error("Failed to decode {what} payload: {source}")]
    Decode {
        what: &'static str,
        #[source]
        source: prost::DecodeError,
    },

    #[error("Upstream connection failed for {device_id}: {reason}")]
    UpstreamConnect { device_id: String, reason: String },

    #[error("Publish to {topic} failed: {reason}")]
    Publish { topic: String, reason: String },

    #[error("No session for device: {device_id}")]
    SessionNotFound { device_id: String },

    #[error("No descriptor for device: {device_id}")]
    UnknownDevice { device_id: String },

    #[error("MQTT protocol error: {0}")]
    Protocol(#[from] mqtt::PacketError),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {parameter}")]
    Configuration { parameter: String },
}

impl From<IoTError> for GatewayError {
    fn from(err: IoTError) -> Self {
        match err {
            IoTError::Io(e) => GatewayError::Io(e),
            IoTError::Configuration { parameter } => GatewayError::Config(parameter),
            IoTError::Tls(reason) => GatewayError::Config(format!("TLS: {}", reason)),
            IoTError::UpstreamConnect { .. } => GatewayError::Network(err.to_string()),
            IoTError::Publish { .. } => GatewayError::Network(err.to_string()),
            other => GatewayError::Protocol(other.to_string()),
        }
    }
}

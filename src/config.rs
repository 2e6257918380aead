// =============================================================================
// ariproxy - Configuration
// =============================================================================
//
// Project: ariproxy - local MQTT gateway for Ariston Velis/Med water heaters
// License: Apache 2.0 / MIT
//
// Description:
//   Gateway configuration: a TOML file merged with ARIPROXY_-prefixed
//   environment variables (a double underscore separates nested keys, e.g.
//   ARIPROXY_BROKER__UPSTREAM), extracted with figment.
//
// =============================================================================

use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use ariproxy_common::GatewayError;
use ariproxy_iot::{
    BrokerConfig, DeviceDescriptor, DeviceRegistry, ModelKeys, PollerConfig, RelayConfig,
};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};

/// Prefix of configuration environment variables
pub const ENV_PREFIX: &str = "ARIPROXY_";

/// Gateway configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// EnvFilter directive
    pub log: String,
    /// Force debug logging
    pub debug: bool,
    /// Seconds between parameter poll rounds
    pub poll_frequency: u64,
    /// Seconds between consumption poll rounds
    pub consumption_poll_frequency: u64,
    /// Seconds to wait after the first device is ready before polling
    pub poll_settle_delay: u64,
    pub broker: BrokerSection,
    pub api: ApiSection,
    pub dns: DnsSection,
    pub devices: Vec<DeviceDescriptor>,
    pub models: ModelKeys,
}

/// `[broker]` table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerSection {
    /// Plaintext MQTT listener; empty disables it
    pub clear_listener: String,
    /// TLS MQTT listener; empty disables it
    pub tls_listener: String,
    pub certificate_path: PathBuf,
    pub private_key_path: PathBuf,
    /// Upstream broker URL; empty disables relaying
    pub upstream: String,
}

/// `[api]` table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiSection {
    /// HTTP listener; empty disables the API
    pub listener: String,
    pub username: String,
    pub password: String,
    /// Log every request and response
    pub debug: bool,
}

/// `[dns]` table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DnsSection {
    /// Address the broker hostname resolves to; empty disables the responder
    pub resolve_to: String,
    /// UDP listener of the responder
    pub listener: String,
}

impl Default for DnsSection {
    fn default() -> Self {
        DnsSection {
            resolve_to: String::new(),
            listener: ":53".to_string(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            log: "info".to_string(),
            debug: false,
            poll_frequency: 60,
            consumption_poll_frequency: 3600,
            poll_settle_delay: 10,
            broker: BrokerSection::default(),
            api: ApiSection::default(),
            dns: DnsSection::default(),
            devices: Vec::new(),
            models: ModelKeys::default(),
        }
    }
}

impl Default for BrokerSection {
    fn default() -> Self {
        BrokerSection {
            clear_listener: String::new(),
            tls_listener: "0.0.0.0:8883".to_string(),
            certificate_path: PathBuf::from("/config/broker-ari.everyware-cloud.com.crt"),
            private_key_path: PathBuf::from("/config/broker-ari.everyware-cloud.com.key"),
            upstream: "ssl://broker-ari.everyware-cloud.com:8883".to_string(),
        }
    }
}

impl Default for ApiSection {
    fn default() -> Self {
        ApiSection {
            listener: "0.0.0.0:2080".to_string(),
            username: String::new(),
            password: String::new(),
            debug: false,
        }
    }
}

impl ApiSection {
    /// Token handed out by the login route and expected on every other route.
    pub fn token(&self) -> String {
        format!("{}:{}", self.username, self.password)
    }
}

impl Config {
    /// Load defaults, then the TOML file (if any), then the environment.
    #[instrument(level = "debug")]
    pub fn load(path: Option<&Path>) -> Result<Self, GatewayError> {
        let mut figment = Figment::from(Serialized::defaults(Config::default()));
        if let Some(path) = path {
            info!("📁 Using configuration file: {}", path.display());
            figment = figment.merge(Toml::file(path));
        }
        figment = figment.merge(Env::prefixed(ENV_PREFIX).split("__"));

        let config: Config = figment
            .extract()
            .map_err(|e| GatewayError::Config(e.to_string()))?;
        config.validate()?;
        debug!("✅ Configuration loaded: {} devices", config.devices.len());
        Ok(config)
    }

    fn validate(&self) -> Result<(), GatewayError> {
        if self.poll_frequency == 0 {
            return Err(GatewayError::Config("poll_frequency must be positive".to_string()));
        }
        if self.consumption_poll_frequency == 0 {
            return Err(GatewayError::Config(
                "consumption_poll_frequency must be positive".to_string(),
            ));
        }
        parse_listener("broker.clear_listener", &self.broker.clear_listener)?;
        parse_listener("broker.tls_listener", &self.broker.tls_listener)?;
        parse_listener("api.listener", &self.api.listener)?;
        self.dns_responder()?;
        self.relay()?;
        Ok(())
    }

    /// Filter directive for the tracing subscriber; an explicit override wins.
    pub fn log_filter(&self, cli_override: Option<&str>) -> String {
        match cli_override {
            Some(level) => level.to_string(),
            None if self.debug => "debug".to_string(),
            None => self.log.clone(),
        }
    }

    pub fn clear_listener(&self) -> Result<Option<SocketAddr>, GatewayError> {
        parse_listener("broker.clear_listener", &self.broker.clear_listener)
    }

    pub fn tls_listener(&self) -> Result<Option<SocketAddr>, GatewayError> {
        parse_listener("broker.tls_listener", &self.broker.tls_listener)
    }

    pub fn api_listener(&self) -> Result<Option<SocketAddr>, GatewayError> {
        parse_listener("api.listener", &self.api.listener)
    }

    /// DNS listener and answer address, when the responder is enabled.
    pub fn dns_responder(&self) -> Result<Option<(SocketAddr, Ipv4Addr)>, GatewayError> {
        let resolve_to = self.dns.resolve_to.trim();
        if resolve_to.is_empty() {
            return Ok(None);
        }
        let resolve_to = resolve_to.parse().map_err(|_| {
            GatewayError::Config(format!("dns.resolve_to: invalid IPv4 address {:?}", resolve_to))
        })?;
        match parse_listener("dns.listener", &self.dns.listener)? {
            Some(listener) => Ok(Some((listener, resolve_to))),
            None => Err(GatewayError::Config(
                "dns.listener is required when dns.resolve_to is set".to_string(),
            )),
        }
    }

    pub fn relay(&self) -> Result<Option<RelayConfig>, GatewayError> {
        RelayConfig::from_url(&self.broker.upstream).map_err(GatewayError::from)
    }

    pub fn broker_config(&self) -> Result<BrokerConfig, GatewayError> {
        Ok(BrokerConfig {
            relay: self.relay()?,
            ..BrokerConfig::default()
        })
    }

    /// Poller timing; the readiness gate waits for an upstream link only when relaying.
    pub fn poller_config(&self, relay_enabled: bool) -> PollerConfig {
        PollerConfig {
            poll_frequency: Duration::from_secs(self.poll_frequency),
            consumption_poll_frequency: Duration::from_secs(self.consumption_poll_frequency),
            settle_delay: Duration::from_secs(self.poll_settle_delay),
            require_upstream: relay_enabled,
        }
    }

    pub fn registry(&self) -> Arc<DeviceRegistry> {
        Arc::new(DeviceRegistry::new(self.devices.clone(), self.models.clone()))
    }
}

fn parse_listener(key: &str, value: &str) -> Result<Option<SocketAddr>, GatewayError> {
    let value = value.trim();
    if value.is_empty() {
        return Ok(None);
    }
    // ":2080" style addresses bind every interface
    let value = if value.starts_with(':') {
        format!("0.0.0.0{}", value)
    } else {
        value.to_string()
    };
    value
        .parse()
        .map(Some)
        .map_err(|_| GatewayError::Config(format!("{}: invalid address {:?}", key, value)))
}

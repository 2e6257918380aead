// =============================================================================
// ariproxy - Command Line Interface
// =============================================================================
//
// Project: ariproxy - local MQTT gateway for Ariston Velis/Med water heaters
// License: Apache 2.0 / MIT
//
// Description:
//   Command line flags. Flags override the matching configuration values.
//
// =============================================================================

use std::path::PathBuf;

use clap::Parser;
use tracing::debug;

use crate::config::Config;

/// Returns the current version of the crate with extra info if supplied
///
/// Set the environment variable `ARIPROXY_VERSION_EXTRA` at build time to any
/// UTF-8 string to include it in parenthesis after the SemVer version, e.g. a
/// git commit hash.
///
/// # Examples
/// ```
/// use ariproxy::clap::version;
///
/// let v = version();
/// assert!(v.contains(env!("CARGO_PKG_VERSION")));
/// ```
pub fn version() -> String {
    let cargo_pkg_version = env!("CARGO_PKG_VERSION");

    match option_env!("ARIPROXY_VERSION_EXTRA") {
        Some(x) => format!("{} ({})", cargo_pkg_version, x),
        None => cargo_pkg_version.to_owned(),
    }
}

/// ariproxy - local MQTT gateway and cloud API stand-in for Ariston water heaters
#[derive(Parser, Debug, Clone, PartialEq, Eq)]
#[clap(about, version, name = "ariproxy")]
pub struct Args {
    /// Path to configuration file
    #[clap(short, long, env = "ARIPROXY_CONFIG", help = "Path to configuration file")]
    pub config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[clap(short, long, help = "Log level override")]
    pub log_level: Option<String>,

    /// Seconds between parameter polls
    #[clap(long, help = "Parameter poll frequency in seconds")]
    pub poll_frequency: Option<u64>,

    /// Do not relay devices to the upstream broker
    #[clap(long, help = "Disable the upstream relay")]
    pub no_upstream: bool,

    /// Start the DNS responder, resolving the broker hostname to this address
    #[clap(long, help = "Resolve the vendor broker hostname to this IPv4 address")]
    pub dns_resolve_to: Option<String>,
}

impl Args {
    /// Apply flag overrides onto a loaded configuration.
    pub fn apply(&self, config: &mut Config) {
        if let Some(frequency) = self.poll_frequency.filter(|f| *f > 0) {
            debug!("🔧 Poll frequency overridden: {}s", frequency);
            config.poll_frequency = frequency;
        }
        if self.no_upstream {
            debug!("🔧 Upstream relay disabled from the command line");
            config.broker.upstream.clear();
        }
        if let Some(address) = &self.dns_resolve_to {
            debug!("🔧 DNS responder address set from the command line: {}", address);
            config.dns.resolve_to = address.clone();
        }
    }
}

/// Parse command line arguments into structured data
pub fn parse() -> Args {
    Args::parse()
}

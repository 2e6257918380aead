// =============================================================================
// ariproxy - Library Crate
// =============================================================================
//
// Project: ariproxy - local MQTT gateway for Ariston Velis/Med water heaters
// License: Apache 2.0 / MIT
//
// Description:
//   Process-level pieces of the gateway: configuration loading, command line
//   flags, the HTTP façade and the optional DNS responder. The broker, relay and parameter decoding live
//   in the ariproxy-iot crate.
//
// =============================================================================

pub mod api;
pub mod clap;
pub mod config;
pub mod dns;

// Re-export workspace crates
pub use ariproxy_common as common;
pub use ariproxy_iot as iot;

pub use api::{router, ApiState};
pub use config::Config;

//! Common types shared by the ariproxy crates.

pub mod error;

pub use error::{GatewayError, Result};

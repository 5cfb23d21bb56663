//! Gateway configuration.
//!
//! The configuration is read from TOML:
//!
//! ```toml
//! listen = "0.0.0.0:13400"
//! logical_address = 0x0e00
//! response_timeout_ms = 1000
//!
//! [[routes]]
//! logical_address = 0x0205
//! request_id = 0x600
//! response_id = 0x601
//! bus = "body"
//! ```

use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::message::LogicalAddress;
use crate::router::{AddressRouter, RouterError, RoutingEntry};

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration file cannot be read.
    #[error("cannot read configuration: {0}")]
    Io(#[from] std::io::Error),
    /// The configuration is not valid TOML for [`GatewayConfig`].
    #[error("cannot parse configuration: {0}")]
    Parse(#[from] toml::de::Error),
    /// The routes are inconsistent.
    #[error("invalid routing table: {0}")]
    Routing(#[from] RouterError),
}

#[derive(Clone, Debug, PartialEq, Eq)]
/// Timings
///
/// Timeouts applied by the gateway and by testers.
pub struct Timings {
    /// Deadline of a routed request, from the moment it is routed until the
    /// ECU response. Requests whose deadline elapses are answered with
    /// [`NoResponseFromSubnet`](crate::NegativeResponseCode::NoResponseFromSubnet).
    pub response_timeout: Duration,
    /// Maximum time for a tester TCP connection to be established.
    pub tcp_connect: Duration,
}

impl Default for Timings {
    fn default() -> Self {
        Self {
            response_timeout: Duration::from_millis(default_response_timeout_ms()),
            tcp_connect: Duration::from_millis(default_connect_timeout_ms()),
        }
    }
}

/// Configuration of a gateway instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// TCP address testers connect to.
    #[serde(default = "default_listen")]
    pub listen: SocketAddr,
    /// Logical address of the gateway itself.
    #[serde(default = "default_logical_address")]
    pub logical_address: LogicalAddress,
    /// See [`Timings::response_timeout`].
    #[serde(default = "default_response_timeout_ms")]
    pub response_timeout_ms: u64,
    /// See [`Timings::tcp_connect`].
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// Largest DoIP payload accepted from a tester.
    #[serde(default = "default_max_payload_length")]
    pub max_payload_length: usize,
    /// Routing table.
    #[serde(default)]
    pub routes: Vec<RoutingEntry>,
}

fn default_listen() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 13400))
}

fn default_logical_address() -> LogicalAddress {
    0x0e00
}

fn default_response_timeout_ms() -> u64 {
    1000
}

fn default_connect_timeout_ms() -> u64 {
    1000
}

fn default_max_payload_length() -> usize {
    4096
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            logical_address: default_logical_address(),
            response_timeout_ms: default_response_timeout_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
            max_payload_length: default_max_payload_length(),
            routes: vec![],
        }
    }
}

impl GatewayConfig {
    /// Parse a TOML configuration.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    /// Read and parse a TOML configuration file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Runtime timings.
    pub fn timings(&self) -> Timings {
        Timings {
            response_timeout: Duration::from_millis(self.response_timeout_ms),
            tcp_connect: Duration::from_millis(self.connect_timeout_ms),
        }
    }

    /// Routing table built from the configured routes.
    pub fn router(&self) -> Result<AddressRouter, ConfigError> {
        Ok(AddressRouter::new(self.routes.iter().cloned())?)
    }
}

//! gRPC listener configuration.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use serde::Deserialize;

use super::ConfigError;

/// Default port of the ingestion service.
pub const DEFAULT_PORT: u16 = 50001;

/// Listener configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host to bind to.
    pub host: String,
    /// Port for the LoggerService.
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: DEFAULT_PORT,
        }
    }
}

impl ServerConfig {
    /// Socket address to bind. `localhost` means the IPv4 loopback.
    pub fn addr(&self) -> Result<SocketAddr, ConfigError> {
        let ip = if self.host == "localhost" {
            IpAddr::V4(Ipv4Addr::LOCALHOST)
        } else {
            self.host
                .parse()
                .map_err(|e| ConfigError::Invalid(format!("server.host '{}': {}", self.host, e)))?
        };
        Ok(SocketAddr::new(ip, self.port))
    }
}

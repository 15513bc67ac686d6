//! Server configuration module.
//!
//! Handles loading configuration from environment variables with sensible defaults.

use anyhow::Result;
use std::net::SocketAddr;

/// Server configuration.
///
/// Configuration values can be set via environment variables:
/// - `LOGSIEVE_HOST`: The host address to bind to (default: "127.0.0.1")
/// - `LOGSIEVE_PORT`: The port to listen on (default: 7070)
/// - `LOGSIEVE_DOCKER`: Whether the docker log provider is enabled (default: true)
/// - `LOGSIEVE_LOKI_URL`: Base URL of a Loki-compatible backend to query (optional)
#[derive(Debug, Clone)]
pub struct Config {
    /// The host address to bind to.
    pub host: String,
    /// The port to listen on.
    pub port: u16,
    /// Whether container logs are queried via the docker CLI.
    pub docker_enabled: bool,
    /// Base URL of a Loki-compatible remote backend, when configured.
    pub loki_url: Option<String>,
}

impl Config {
    /// Creates a new configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - `LOGSIEVE_PORT` is set but cannot be parsed as a valid port number
    pub fn from_env() -> Result<Self> {
        let host = std::env::var("LOGSIEVE_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());

        let port = std::env::var("LOGSIEVE_PORT")
            .ok()
            .map(|p| p.parse::<u16>())
            .transpose()?
            .unwrap_or(7070);

        let docker_enabled = std::env::var("LOGSIEVE_DOCKER")
            .map(|v| !matches!(v.as_str(), "0" | "false" | "off"))
            .unwrap_or(true);

        let loki_url = std::env::var("LOGSIEVE_LOKI_URL").ok();

        Ok(Self {
            host,
            port,
            docker_enabled,
            loki_url,
        })
    }

    /// Returns the socket address for binding.
    ///
    /// # Panics
    ///
    /// Panics if the host and port combination cannot be parsed as a valid socket address.
    #[must_use]
    pub fn socket_addr(&self) -> SocketAddr {
        format!("{}:{}", self.host, self.port)
            .parse()
            .expect("Invalid socket address from config")
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 7070,
            docker_enabled: true,
            loki_url: None,
        }
    }
}

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde::Deserialize;

/// Default number of upstream chunks allowed in flight between the origin and a slow caller.
pub const RELAY_CHANNEL_CAPACITY: usize = 8;

/// Default bound on establishing the TCP/TLS connection to the origin.
pub const UPSTREAM_CONNECT_TIMEOUT_SECS: u64 = 10;

/// Default bound on waiting for the origin's response headers once connected.
pub const UPSTREAM_HEADER_TIMEOUT_SECS: u64 = 30;

/// Default listening port (matches the legacy API server).
pub const DEFAULT_PORT: u16 = 8000;

/// Headers exposed to browser players on relayed responses.
pub const EXPOSED_HEADERS: &str = "Content-Length, Content-Range, Accept-Ranges";

/// Top-level configuration for the streaming server.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Interface to bind.
    pub bind_addr: IpAddr,
    /// Listening port; 0 picks a free one.
    pub port: u16,
    /// HMAC secret used to verify bearer tokens.
    pub jwt_secret: String,
    /// Value stamped into `Access-Control-Allow-Origin`.
    pub client_url: String,
    /// JSON document seeding the catalog and subscription stores.
    pub catalog_path: Option<PathBuf>,
    pub upstream_connect_timeout_secs: u64,
    pub upstream_header_timeout_secs: u64,
    pub relay_channel_capacity: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: DEFAULT_PORT,
            jwt_secret: String::new(),
            client_url: "*".to_string(),
            catalog_path: None,
            upstream_connect_timeout_secs: UPSTREAM_CONNECT_TIMEOUT_SECS,
            upstream_header_timeout_secs: UPSTREAM_HEADER_TIMEOUT_SECS,
            relay_channel_capacity: RELAY_CHANNEL_CAPACITY,
        }
    }
}

impl ServerConfig {
    /// Build the configuration from the process environment, reading `.env` first if present.
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build the configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(v) = lookup("BIND_ADDR") {
            config.bind_addr = v
                .parse()
                .with_context(|| format!("invalid BIND_ADDR: {}", v))?;
        }
        if let Some(v) = lookup("SERVER_PORT") {
            config.port = v
                .parse()
                .with_context(|| format!("invalid SERVER_PORT: {}", v))?;
        }
        if let Some(v) = lookup("JWT_SECRET") {
            config.jwt_secret = v;
        }
        if let Some(v) = lookup("CLIENT_URL").filter(|v| !v.trim().is_empty()) {
            config.client_url = v;
        }
        if let Some(v) = lookup("CATALOG_PATH").filter(|v| !v.trim().is_empty()) {
            config.catalog_path = Some(PathBuf::from(v));
        }
        if let Some(v) = lookup("UPSTREAM_CONNECT_TIMEOUT_SECS") {
            config.upstream_connect_timeout_secs = v
                .parse()
                .with_context(|| format!("invalid UPSTREAM_CONNECT_TIMEOUT_SECS: {}", v))?;
        }
        if let Some(v) = lookup("UPSTREAM_HEADER_TIMEOUT_SECS") {
            config.upstream_header_timeout_secs = v
                .parse()
                .with_context(|| format!("invalid UPSTREAM_HEADER_TIMEOUT_SECS: {}", v))?;
        }
        if let Some(v) = lookup("RELAY_CHANNEL_CAPACITY") {
            config.relay_channel_capacity = v
                .parse()
                .with_context(|| format!("invalid RELAY_CHANNEL_CAPACITY: {}", v))?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject settings the proxy cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.relay_channel_capacity == 0 {
            return Err(anyhow!("relay_channel_capacity must be at least 1"));
        }
        if self.upstream_connect_timeout_secs == 0 || self.upstream_header_timeout_secs == 0 {
            return Err(anyhow!("upstream timeouts must be at least 1 second"));
        }
        Ok(())
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_addr, self.port)
    }

    /// The subset of settings the streaming core needs.
    pub fn proxy_config(&self) -> ProxyConfig {
        ProxyConfig {
            allow_origin: self.client_url.clone(),
            connect_timeout: Duration::from_secs(self.upstream_connect_timeout_secs),
            header_timeout: Duration::from_secs(self.upstream_header_timeout_secs),
            channel_capacity: self.relay_channel_capacity,
        }
    }
}

/// Runtime settings for the stream proxy core.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    pub allow_origin: String,
    pub connect_timeout: Duration,
    pub header_timeout: Duration,
    pub channel_capacity: usize,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        ServerConfig::default().proxy_config()
    }
}

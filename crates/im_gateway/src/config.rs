//! Gateway configuration from environment variables.

use crate::endpoint::EndpointConfig;
use crate::presence::DEFAULT_PRESENCE_PREFIX;
use crate::router::RouterConfig;
use crate::subscription::DEFAULT_SUBJECT_PREFIX;
use crate::ws_server::SessionConfig;
use anyhow::{Context, Result};
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;
use std::time::Duration;

/// Process configuration.
///
/// Unset `REDIS_URL` selects the in-memory store and unset `NATS_URL` the
/// in-process bus, which together give a self-contained single node.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub http_addr: SocketAddr,
    pub metrics_port: Option<u16>,
    pub redis_url: Option<String>,
    pub nats_url: Option<String>,
    pub nats_subject_prefix: String,
    pub nats_presence_prefix: String,
    pub store_timeout: Duration,
    /// Upper bound on a cross-process presence request.
    pub presence_timeout: Duration,
    pub ping_interval: Duration,
    pub endpoint_idle: Duration,
    pub client_buffer_size: usize,
    pub shutdown_grace: Duration,
}

impl GatewayConfig {
    /// Read configuration from the process environment.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read configuration through `lookup`; empty values count as unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let host = get("HTTP_HOST").unwrap_or_else(|| "0.0.0.0".to_string());
        let ip: IpAddr = host
            .trim()
            .trim_start_matches('[')
            .trim_end_matches(']')
            .parse()
            .with_context(|| format!("HTTP_HOST '{}' is not a valid IP address", host))?;
        let port: u16 = parse_or(&get, "HTTP_PORT", 8080)?;
        let http_addr = SocketAddr::new(ip, port);

        let metrics_port = match get("METRICS_PORT") {
            Some(raw) => Some(
                raw.parse::<u16>()
                    .with_context(|| format!("METRICS_PORT must be a port number, got '{}'", raw))?,
            ),
            None => None,
        };

        Ok(Self {
            http_addr,
            metrics_port,
            redis_url: get("REDIS_URL"),
            nats_url: get("NATS_URL"),
            nats_subject_prefix: get("NATS_SUBJECT_PREFIX")
                .unwrap_or_else(|| DEFAULT_SUBJECT_PREFIX.to_string()),
            nats_presence_prefix: get("NATS_PRESENCE_PREFIX")
                .unwrap_or_else(|| DEFAULT_PRESENCE_PREFIX.to_string()),
            store_timeout: Duration::from_millis(parse_or(&get, "STORE_TIMEOUT_MS", 2000)?),
            presence_timeout: Duration::from_millis(parse_or(&get, "PRESENCE_TIMEOUT_MS", 1000)?),
            ping_interval: Duration::from_secs(parse_or(&get, "PING_INTERVAL_SECS", 30)?),
            endpoint_idle: Duration::from_secs(parse_or(&get, "ENDPOINT_IDLE_SECS", 300)?),
            client_buffer_size: parse_or(&get, "CLIENT_BUFFER_SIZE", 1000)?,
            shutdown_grace: Duration::from_secs(parse_or(&get, "SHUTDOWN_GRACE_SECS", 5)?),
        })
    }

    pub fn router_config(&self) -> RouterConfig {
        RouterConfig {
            store_timeout: self.store_timeout,
        }
    }

    pub fn endpoint_config(&self) -> EndpointConfig {
        EndpointConfig {
            idle_timeout: self.endpoint_idle,
            ..Default::default()
        }
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            ping_interval: self.ping_interval,
            buffer_size: self.client_buffer_size.max(1),
        }
    }
}

fn parse_or<T>(get: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match get(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("{} must be a number, got '{}'", key, raw)),
        None => Ok(default),
    }
}

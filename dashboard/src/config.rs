use crate::errors::{Error, Result};
use std::env;
use std::net::SocketAddr;
use std::time::Duration;

pub const DEFAULT_API_URL: &str = "http://localhost:8000/api/v1";
pub const DEFAULT_WS_URL: &str = "ws://localhost:8000/api/v1/ws";
pub const DEFAULT_RECONNECT_INTERVAL_MS: u64 = 3000;

/// Runtime configuration, read from the environment.
#[derive(Debug, Clone)]
pub struct Config {
    pub api_url: String,
    pub ws_url: String,
    pub reconnect_interval: Duration,
    pub http_addr: SocketAddr,
    pub acknowledged_by: String,
    pub events_limit: u32,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let api_url = lookup("API_URL").unwrap_or_else(|| DEFAULT_API_URL.to_string());
        let ws_url = lookup("WS_URL").unwrap_or_else(|| DEFAULT_WS_URL.to_string());
        let reconnect_ms: u64 = lookup("RECONNECT_INTERVAL_MS")
            .unwrap_or_else(|| DEFAULT_RECONNECT_INTERVAL_MS.to_string())
            .parse()
            .unwrap_or(DEFAULT_RECONNECT_INTERVAL_MS);
        let http_addr = lookup("HTTP_ADDR").unwrap_or_else(|| "0.0.0.0:8090".to_string());
        let http_addr = http_addr
            .parse()
            .map_err(|e| Error::Config(format!("invalid HTTP_ADDR {}: {}", http_addr, e)))?;
        let acknowledged_by = lookup("ACKNOWLEDGED_BY").unwrap_or_else(|| "admin".to_string());
        let events_limit: u32 = lookup("EVENTS_LIMIT")
            .unwrap_or_else(|| "50".to_string())
            .parse()
            .unwrap_or(50);

        Ok(Self {
            api_url: api_url.trim_end_matches('/').to_string(),
            ws_url,
            reconnect_interval: Duration::from_millis(reconnect_ms),
            http_addr,
            acknowledged_by,
            events_limit,
        })
    }
}

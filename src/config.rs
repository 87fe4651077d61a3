//! Connection endpoint and retry configuration.
//!
//! The control socket address and the connect retry policy are fixed for
//! the lifetime of a session; reconnecting means constructing a new one.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Default control port the emulator listens on.
pub const DEFAULT_PORT: u16 = 4444;

/// Default control host (local loopback).
pub const DEFAULT_HOST: &str = "127.0.0.1";

/// Network address of the emulator's control socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Create from environment variables, falling back to defaults.
    ///
    /// Reads `EMUCTL_HOST` and `EMUCTL_PORT`.
    pub fn from_env() -> Self {
        let host = std::env::var("EMUCTL_HOST").unwrap_or_else(|_| DEFAULT_HOST.to_string());
        let port = std::env::var("EMUCTL_PORT")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_PORT);
        Self { host, port }
    }
}

impl Default for Endpoint {
    fn default() -> Self {
        Self::new(DEFAULT_HOST, DEFAULT_PORT)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl FromStr for Endpoint {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| format!("expected host:port, got {s:?}"))?;
        if host.is_empty() {
            return Err(format!("empty host in {s:?}"));
        }
        let port = port
            .parse()
            .map_err(|_| format!("invalid port in {s:?}"))?;
        Ok(Self::new(host, port))
    }
}

/// Bounded connect retry with a fixed delay between attempts.
///
/// Models the emulator not having opened its control listener yet: the
/// client keeps knocking instead of failing on the first refusal.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total connection attempts before giving up.
    pub max_attempts: u32,

    /// Sleep between failed attempts.
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            delay: Duration::from_millis(default_retry_delay_ms()),
        }
    }
}

impl RetryPolicy {
    pub const fn new(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            delay,
        }
    }
}

const fn default_max_attempts() -> u32 {
    5
}

const fn default_retry_delay_ms() -> u64 {
    1000
}

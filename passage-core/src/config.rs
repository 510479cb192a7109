//! Configuration types for Passage Core

use std::time::Duration;

use crate::error::{PassageError, Result};

/// Engine configuration.
///
/// Immutable for the lifetime of an initialized core; replacing it requires
/// a shutdown followed by a fresh init.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// SOCKS5 server host (IP literal or hostname)
    pub server_host: String,
    /// SOCKS5 server port
    pub server_port: u16,
    /// Optional username for RFC 1929 authentication
    pub username: Option<String>,
    /// Optional password for RFC 1929 authentication
    pub password: Option<String>,
    /// Upper bound on concurrent tracked flows
    pub max_connections: usize,
    /// Capacity of each packet queue (rx and tx)
    pub queue_capacity: usize,
    /// Device MTU
    pub mtu: usize,
    /// Whether IPv6 flows are forwarded (parsed either way)
    pub ipv6_enabled: bool,
    /// Idle timeout for UDP conversations
    pub udp_idle_timeout: Duration,
    /// Grace period before a Closed entry is reclaimed
    pub linger: Duration,
    /// SOCKS5 handshake timeout
    pub handshake_timeout: Duration,
}

impl EngineConfig {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            server_host: host.into(),
            server_port: port,
            username: None,
            password: None,
            max_connections: 100,
            queue_capacity: 256,
            mtu: crate::device::MTU,
            ipv6_enabled: false,
            udp_idle_timeout: Duration::from_secs(60),
            linger: Duration::from_secs(2),
            handshake_timeout: Duration::from_secs(10),
        }
    }

    pub fn with_auth(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    pub fn with_max_connections(mut self, max: usize) -> Self {
        self.max_connections = max;
        self
    }

    pub fn with_ipv6(mut self, enabled: bool) -> Self {
        self.ipv6_enabled = enabled;
        self
    }

    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    /// Validate the record before the engine accepts it.
    pub fn validate(&self) -> Result<()> {
        if self.server_host.is_empty() {
            return Err(PassageError::InvalidConfig("empty server host".into()));
        }
        if self.server_port == 0 {
            return Err(PassageError::InvalidConfig("server port is zero".into()));
        }
        if self.username.is_some() != self.password.is_some() {
            return Err(PassageError::InvalidConfig(
                "username and password must be set together".into(),
            ));
        }
        if self.max_connections == 0 {
            return Err(PassageError::InvalidConfig("max_connections is zero".into()));
        }
        if self.queue_capacity == 0 {
            return Err(PassageError::InvalidConfig("queue_capacity is zero".into()));
        }
        Ok(())
    }

    pub fn has_auth(&self) -> bool {
        self.username.is_some() && self.password.is_some()
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::new("127.0.0.1", 1080)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_default() {
        let config = EngineConfig::default();
        assert_eq!(config.server_host, "127.0.0.1");
        assert_eq!(config.server_port, 1080);
        assert!(config.username.is_none());
        assert_eq!(config.max_connections, 100);
        assert_eq!(config.queue_capacity, 256);
        assert!(!config.ipv6_enabled);
        assert_eq!(config.udp_idle_timeout, Duration::from_secs(60));
        assert_eq!(config.linger, Duration::from_secs(2));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_with_auth() {
        let config = EngineConfig::new("proxy.example.com", 8080).with_auth("user", "pass");
        assert_eq!(config.username, Some("user".to_string()));
        assert_eq!(config.password, Some("pass".to_string()));
        assert!(config.has_auth());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_rejects_empty_host() {
        let config = EngineConfig::new("", 1080);
        assert!(matches!(
            config.validate(),
            Err(PassageError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_config_rejects_zero_port() {
        let config = EngineConfig::new("127.0.0.1", 0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_rejects_half_credentials() {
        let mut config = EngineConfig::default();
        config.username = Some("user".into());
        assert!(config.validate().is_err());
    }
}

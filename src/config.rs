//! Proxy configuration.

use std::net::Ipv4Addr;

use serde::{Deserialize, Serialize};

/// Runtime configuration for the proxy.
///
/// All fields have defaults matching the classic deployment: SOCKS on
/// port 8080, TUN interface `lwip0` at 10.0.0.100/8 with gateway 10.0.0.1.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Listen address for the SOCKS server
    pub listen_addr: String,
    /// Listen port for the SOCKS server
    pub listen_port: u16,
    /// Name of the TUN interface to create
    pub tun_name: String,
    /// Address of the embedded stack on the TUN network
    pub stack_addr: Ipv4Addr,
    /// Prefix length of the TUN network
    pub stack_prefix: u8,
    /// Default gateway for the embedded stack
    pub gateway: Ipv4Addr,
    /// Interface MTU; also the size of the TUN staging buffer
    pub mtu: usize,
    /// Packet-buffer pool capacity in segments
    pub pool_segments: usize,
    /// Per-connection TCP send/receive buffer size in the stack
    pub tcp_buffer: usize,
    /// Per-session staging buffer size
    pub session_buffer: usize,
    /// Stack timer tick period in milliseconds
    pub tick_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0".into(),
            listen_port: 8080,
            tun_name: "lwip0".into(),
            stack_addr: Ipv4Addr::new(10, 0, 0, 100),
            stack_prefix: 8,
            gateway: Ipv4Addr::new(10, 0, 0, 1),
            mtu: crate::MTU,
            pool_segments: 1024,
            tcp_buffer: 64 * 1024,
            session_buffer: crate::SESSION_BUFFER_SIZE,
            tick_ms: crate::STACK_TICK_MS,
        }
    }
}

impl Config {
    /// Load configuration from a JSON file.
    pub fn load(path: &str) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&content)
            .map_err(|e| crate::Error::config(format!("{}: {}", path, e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> crate::Result<()> {
        if self.listen_addr.is_empty() {
            return Err(crate::Error::config("listen_addr cannot be empty"));
        }
        if self.tun_name.is_empty() || self.tun_name.len() >= 16 {
            return Err(crate::Error::config(
                "tun_name must be 1..=15 characters (IFNAMSIZ)",
            ));
        }
        if self.stack_prefix > 32 {
            return Err(crate::Error::config("stack_prefix must be <= 32"));
        }
        if self.mtu < 576 || self.mtu > 65535 {
            return Err(crate::Error::config("mtu must be within 576..=65535"));
        }
        if self.pool_segments == 0 {
            return Err(crate::Error::config("pool_segments cannot be zero"));
        }
        if self.tcp_buffer == 0 {
            return Err(crate::Error::config("tcp_buffer cannot be zero"));
        }
        // The largest negotiation frame is 5 + 255 + 2 bytes; leave room.
        if self.session_buffer < 512 {
            return Err(crate::Error::config("session_buffer must be >= 512"));
        }
        if self.tick_ms == 0 {
            return Err(crate::Error::config("tick_ms cannot be zero"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = Config::default();
        assert_eq!(config.listen_port, 8080);
        assert_eq!(config.tun_name, "lwip0");
        assert_eq!(config.stack_addr, Ipv4Addr::new(10, 0, 0, 100));
        assert_eq!(config.gateway, Ipv4Addr::new(10, 0, 0, 1));
        assert_eq!(config.mtu, 1500);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = Config::default();
        config.tun_name = "a-name-that-is-way-too-long".into();
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.mtu = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.pool_segments = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_serialization() {
        let config = Config::default();
        let json = serde_json::to_string(&config).unwrap();
        let restored: Config = serde_json::from_str(&json).unwrap();

        assert_eq!(config.listen_port, restored.listen_port);
        assert_eq!(config.stack_addr, restored.stack_addr);
        assert_eq!(config.tick_ms, restored.tick_ms);
    }

    #[test]
    fn test_partial_config_file() {
        // Unspecified fields fall back to defaults.
        let config: Config = serde_json::from_str(r#"{"listen_port": 1080}"#).unwrap();
        assert_eq!(config.listen_port, 1080);
        assert_eq!(config.tun_name, "lwip0");
    }
}

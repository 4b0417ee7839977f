//! Configuration management

use crate::Result;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Server identity
    #[serde(default)]
    pub server: ServerConfig,
    /// Client listener settings
    #[serde(default)]
    pub listen: ListenConfig,
    /// DNS resolver settings
    #[serde(default)]
    pub dns: DnsConfig,
    /// Operator accounts
    #[serde(default)]
    pub operators: Vec<OperatorConfig>,
    /// Module configuration blocks
    #[serde(default, rename = "module")]
    pub modules: Vec<ModuleBlock>,
}

/// Server identity configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Server name presented to clients
    pub name: String,
    /// Server description
    pub description: String,
    /// Network name
    pub network: String,
    /// Creation date string shown in RPL_CREATED
    pub created: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            name: "irc.example.net".to_string(),
            description: "ferricd IRC server".to_string(),
            network: "ExampleNet".to_string(),
            created: "2026-01-01".to_string(),
        }
    }
}

/// Client listener configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListenConfig {
    /// Bind address for the client listener
    pub address: String,
    /// Maximum bytes buffered for one client before messages drop
    pub sendq_max: usize,
    /// Maximum bytes of unparsed input buffered for one client
    pub recvq_max: usize,
}

impl Default for ListenConfig {
    fn default() -> Self {
        Self {
            address: "127.0.0.1:6667".to_string(),
            sendq_max: 256 * 1024,
            recvq_max: 4 * 1024,
        }
    }
}

/// DNS resolver configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DnsConfig {
    /// Whether lookups are performed at all
    pub enabled: bool,
    /// Nameserver address
    pub server: String,
    /// Nameserver port
    pub port: u16,
    /// Seconds before an unanswered request times out
    pub timeout_secs: u64,
    /// Accept replies from any source (required for IPv4-mapped IPv6
    /// nameserver addresses, where the source check cannot work)
    pub ip6munge: bool,
}

impl Default for DnsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            server: "127.0.0.1".to_string(),
            port: 53,
            timeout_secs: 5,
            ip6munge: false,
        }
    }
}

/// One operator account
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperatorConfig {
    /// Login name for OPER
    pub name: String,
    /// Password for OPER
    pub password: String,
}

/// One module block with free-form settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModuleBlock {
    /// Module name
    pub name: String,
    /// Module-specific settings
    #[serde(default)]
    pub settings: HashMap<String, String>,
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Serialize the configuration to TOML
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self)
            .map_err(|e| crate::Error::Config(format!("failed to serialize config: {}", e)))
    }

    /// Basic sanity checks
    pub fn validate(&self) -> Result<()> {
        if self.server.name.is_empty() {
            return Err(crate::Error::Config("server.name must not be empty".to_string()));
        }
        if self.dns.enabled && self.dns.server.parse::<std::net::IpAddr>().is_err() {
            return Err(crate::Error::Config(format!(
                "dns.server is not a valid IP address: {}",
                self.dns.server
            )));
        }
        if self.dns.timeout_secs == 0 {
            return Err(crate::Error::Config(
                "dns.timeout_secs must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Look up a module block by name
    pub fn module_block(&self, name: &str) -> Option<&ModuleBlock> {
        self.modules.iter().find(|block| block.name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.dns.port, 53);
        assert_eq!(config.dns.timeout_secs, 5);
        assert!(!config.dns.ip6munge);
    }

    #[test]
    fn parses_module_blocks() {
        let config: Config = toml::from_str(
            r#"
            [server]
            name = "irc.test.net"
            description = "test"
            network = "TestNet"
            created = "2026-01-01"

            [dns]
            enabled = true
            server = "192.0.2.53"
            port = 5353
            timeout_secs = 2
            ip6munge = false

            [[module]]
            name = "away"
            settings = { max-length = "200" }
        "#,
        )
        .unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.dns.port, 5353);
        let block = config.module_block("away").unwrap();
        assert_eq!(block.settings["max-length"], "200");
        assert!(config.module_block("missing").is_none());
    }

    #[test]
    fn rejects_bad_nameserver() {
        let mut config = Config::default();
        config.dns.server = "not-an-ip".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn config_roundtrips_through_toml() {
        let config = Config::default();
        let rendered = config.to_toml().unwrap();
        let reparsed: Config = toml::from_str(&rendered).unwrap();
        assert_eq!(reparsed.server.name, config.server.name);
        assert_eq!(reparsed.dns.port, config.dns.port);
    }
}

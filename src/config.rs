//! Daemon configuration.
//!
//! The configuration tree lives at `<CONFDIR>/tinc[/<net>]/tincd.conf`
//! and is TOML. The daemon core consumes the parsed [`Config`] value;
//! reload re-parses the same file and keeps the old configuration when
//! parsing fails.

use crate::error::{Error, Result};
use ipnet::IpNet;
use serde::Deserialize;
use std::collections::HashSet;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};

/// Default TCP port for meta-connections.
pub const DEFAULT_PORT: u16 = 655;

/// One known peer of this net.
#[derive(Debug, Clone, Deserialize)]
pub struct PeerConfig {
    /// Peer name, unique within the net.
    pub name: String,
    /// Address the peer listens on for meta-connections.
    pub address: Option<IpAddr>,
    /// Meta-connection port.
    #[serde(default = "default_port")]
    pub port: u16,
    /// Peer public key, base64.
    pub public_key: String,
    /// Subnets the peer claims.
    #[serde(default)]
    pub subnets: Vec<IpNet>,
    /// Edge weight toward this peer.
    #[serde(default = "default_weight")]
    pub weight: u32,
}

impl PeerConfig {
    /// Socket address for an outgoing meta-connection, when configured.
    pub fn meta_addr(&self) -> Option<SocketAddr> {
        self.address.map(|ip| SocketAddr::new(ip, self.port))
    }
}

/// Parsed daemon configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// This node's name.
    pub name: String,
    /// Address to bind the meta listener to.
    #[serde(default = "default_listen")]
    pub listen: IpAddr,
    /// Meta listener port.
    #[serde(default = "default_port")]
    pub port: u16,
    /// Subnets this node claims.
    #[serde(default)]
    pub subnets: Vec<IpNet>,
    /// Peers to open outgoing meta-connections to.
    #[serde(default)]
    pub connect_to: Vec<String>,
    /// All known peers of the net.
    #[serde(default)]
    pub peers: Vec<PeerConfig>,
    /// Private key file; defaults to `priv.key` under the config base.
    pub key_file: Option<PathBuf>,
    /// Shell command run after the daemon comes up.
    pub up_script: Option<String>,
    /// Shell command run during shutdown.
    pub down_script: Option<String>,
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_weight() -> u32 {
    1
}

fn default_listen() -> IpAddr {
    IpAddr::from([0, 0, 0, 0])
}

impl Config {
    /// Load and validate the configuration file.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("Failed to read config file {}: {e}", path.display()))
        })?;
        let config: Config = toml::from_str(&contents).map_err(|e| {
            Error::Config(format!(
                "Failed to parse config file {}: {e}",
                path.display()
            ))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Validate cross-field constraints.
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(Error::Config("'name' is required".to_string()));
        }
        if !valid_name(&self.name) {
            return Err(Error::Config(format!(
                "Node name '{}' may only contain letters, digits and underscores",
                self.name
            )));
        }

        let mut seen = HashSet::new();
        for peer in &self.peers {
            if !valid_name(&peer.name) {
                return Err(Error::Config(format!(
                    "Peer name '{}' may only contain letters, digits and underscores",
                    peer.name
                )));
            }
            if peer.name == self.name {
                return Err(Error::Config(format!(
                    "Peer '{}' has the same name as this node",
                    peer.name
                )));
            }
            if !seen.insert(peer.name.as_str()) {
                return Err(Error::Config(format!(
                    "Peer '{}' is listed more than once",
                    peer.name
                )));
            }
        }

        for target in &self.connect_to {
            let peer = self
                .peers
                .iter()
                .find(|p| &p.name == target)
                .ok_or_else(|| {
                    Error::Config(format!("connect_to names unknown peer '{target}'"))
                })?;
            if peer.address.is_none() {
                return Err(Error::Config(format!(
                    "connect_to peer '{target}' has no address"
                )));
            }
        }

        Ok(())
    }

    /// Look up a peer block by name.
    pub fn peer(&self, name: &str) -> Option<&PeerConfig> {
        self.peers.iter().find(|p| p.name == name)
    }

    /// The private key file location, resolved against the config base.
    pub fn key_file_in(&self, config_base: &Path) -> PathBuf {
        match &self.key_file {
            Some(path) if path.is_absolute() => path.clone(),
            Some(path) => config_base.join(path),
            None => config_base.join("priv.key"),
        }
    }
}

/// Names appear as bare tokens on the wire, so keep them word-shaped.
pub fn valid_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_toml() -> &'static str {
        r#"
            name = "alpha"
            subnets = ["10.1.0.0/16"]
            connect_to = ["bravo"]

            [[peers]]
            name = "bravo"
            address = "192.0.2.10"
            port = 655
            public_key = "q83vASNFZ4mrze8BI0VniavN7wEjRWeJq83vASNFZ4k="
            subnets = ["10.2.0.0/16"]
        "#
    }

    #[test]
    fn test_load_minimal_config() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("tincd.conf");
        std::fs::write(&path, minimal_toml()).expect("write config");

        let config = Config::load(&path).expect("load config");
        assert_eq!(config.name, "alpha");
        assert_eq!(config.port, DEFAULT_PORT);
        assert_eq!(config.connect_to, vec!["bravo".to_string()]);
        let bravo = config.peer("bravo").expect("peer bravo");
        assert_eq!(
            bravo.meta_addr(),
            Some("192.0.2.10:655".parse().expect("socket addr"))
        );
        assert_eq!(bravo.subnets.len(), 1);
    }

    #[test]
    fn test_connect_to_unknown_peer_rejected() {
        let toml = r#"
            name = "alpha"
            connect_to = ["ghost"]
        "#;
        let config: Config = toml::from_str(toml).expect("parse");
        let err = config.validate().expect_err("unknown peer");
        assert!(err.to_string().contains("ghost"));
    }

    #[test]
    fn test_duplicate_peer_rejected() {
        let toml = r#"
            name = "alpha"

            [[peers]]
            name = "bravo"
            public_key = "AA=="

            [[peers]]
            name = "bravo"
            public_key = "BB=="
        "#;
        let config: Config = toml::from_str(toml).expect("parse");
        let err = config.validate().expect_err("duplicate peer");
        assert!(err.to_string().contains("more than once"));
    }

    #[test]
    fn test_wire_unsafe_names_rejected() {
        let toml = r#"
            name = "al pha"
        "#;
        let config: Config = toml::from_str(toml).expect("parse");
        assert!(config.validate().is_err());
        assert!(valid_name("alpha_2"));
        assert!(!valid_name("al pha"));
        assert!(!valid_name(""));
    }

    #[test]
    fn test_key_file_resolution() {
        let config: Config = toml::from_str("name = \"alpha\"").expect("parse");
        assert_eq!(
            config.key_file_in(Path::new("/etc/tinc/v1")),
            PathBuf::from("/etc/tinc/v1/priv.key")
        );
    }
}

//! Demo server configuration.
//!
//! Read from the TOML file named by `$GRAPHWIRE_CONFIG`, otherwise from:
//! - Linux: `~/.config/graphwire/server.toml`
//! - Windows: `%APPDATA%/graphwire/server.toml`
//!
//! A missing file means defaults; a partial file fills in the rest.

use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use graphwire_protocol::constants::WS_MAX_MESSAGE_SIZE;
use graphwire_server::ServerConfig;
use serde::{Deserialize, Serialize};

/// Which transport adapter serves connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    /// tokio tasks per connection.
    #[default]
    Async,
    /// One OS thread per connection.
    Blocking,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: IpAddr,

    /// WebSocket server port (0 = auto-assign).
    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default)]
    pub transport: Transport,

    /// Seconds a client has to send `connection_init`.
    #[serde(default = "default_init_timeout")]
    pub connection_init_timeout_secs: u64,

    /// Seconds between server pings (0 = disabled).
    #[serde(default)]
    pub keep_alive_secs: u64,

    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,

    /// When set, `connection_init` must carry `{"token": "<value>"}`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_token: Option<String>,
}

fn default_bind_addr() -> IpAddr {
    IpAddr::from([127, 0, 0, 1])
}

fn default_port() -> u16 {
    4000
}

fn default_init_timeout() -> u64 {
    60
}

fn default_max_message_size() -> usize {
    WS_MAX_MESSAGE_SIZE
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            port: default_port(),
            transport: Transport::default(),
            connection_init_timeout_secs: default_init_timeout(),
            keep_alive_secs: 0,
            max_message_size: default_max_message_size(),
            auth_token: None,
        }
    }
}

impl Config {
    /// Loads the configuration file, or defaults if there is none.
    pub fn load() -> anyhow::Result<Self> {
        let path = config_path();
        if path.exists() {
            Self::load_from(&path)
        } else {
            tracing::debug!(path = %path.display(), "no config file, using defaults");
            Ok(Self::default())
        }
    }

    pub fn load_from(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let config = toml::from_str(&content)
            .with_context(|| format!("parsing {}", path.display()))?;
        tracing::debug!(path = %path.display(), "configuration loaded");
        Ok(config)
    }

    /// Library settings derived from this file.
    pub fn server_config(&self) -> ServerConfig {
        ServerConfig {
            bind_addr: self.bind_addr,
            port: self.port,
            connection_init_timeout: Duration::from_secs(self.connection_init_timeout_secs),
            keep_alive: (self.keep_alive_secs > 0)
                .then(|| Duration::from_secs(self.keep_alive_secs)),
            max_message_size: self.max_message_size,
            ..ServerConfig::default()
        }
    }
}

/// Returns the configuration file path.
fn config_path() -> PathBuf {
    if let Some(path) = std::env::var_os("GRAPHWIRE_CONFIG") {
        return PathBuf::from(path);
    }

    #[cfg(target_os = "windows")]
    {
        let appdata =
            std::env::var("APPDATA").unwrap_or_else(|_| "C:\\Users\\Default\\AppData".into());
        PathBuf::from(appdata).join("graphwire").join("server.toml")
    }

    #[cfg(not(target_os = "windows"))]
    {
        let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".into());
        PathBuf::from(home)
            .join(".config")
            .join("graphwire")
            .join("server.toml")
    }
}

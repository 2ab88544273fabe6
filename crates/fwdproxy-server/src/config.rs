//! Server configuration: TOML file + CLI overrides.
//!
//! Missing keys in the file are filled with defaults and written back, so
//! after the first start the file documents the effective listen settings.
//! CLI overrides apply to the running process only and are never persisted.

use fwdproxy_core::{ProxyError, ProxyResult};
use serde::Deserialize;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Default config file, relative to the working directory.
pub const DEFAULT_CONFIG_PATH: &str = "proxy-settings.toml";

const LISTEN_SECTION: &str = "listen";
const ADDRESS_KEY: &str = "address";
const PORT_KEY: &str = "port";

/// `[listen]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct ListenSection {
    #[serde(default = "default_address")]
    pub address: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_address() -> String {
    Ipv4Addr::UNSPECIFIED.to_string()
}
fn default_port() -> u16 {
    8888
}

/// Resolved server configuration (path expanded, CLI overrides applied).
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub address: IpAddr,
    pub port: u16,
    /// The config file that was read (or created).
    pub config_path: PathBuf,
}

impl ServerConfig {
    /// Load config from a TOML file, write back any missing defaults, then
    /// apply CLI overrides.
    ///
    /// # Errors
    ///
    /// Returns [`ProxyError::Config`] if the file exists but cannot be read
    /// or parsed, or if the address is not an IP address. Failing to write
    /// defaults back is only logged.
    pub fn load(
        config_path: &Path,
        cli_address: Option<IpAddr>,
        cli_port: Option<u16>,
    ) -> ProxyResult<Self> {
        let expanded = expand_tilde(config_path);

        let mut doc: toml::Table = if expanded.exists() {
            info!(path = %expanded.display(), "loading config file");
            let content = std::fs::read_to_string(&expanded).map_err(|e| {
                ProxyError::Config(format!("cannot read {}: {e}", expanded.display()))
            })?;
            toml::from_str(&content)
                .map_err(|e| ProxyError::Config(format!("config parse error: {e}")))?
        } else {
            info!(path = %expanded.display(), "config file not found, using defaults");
            toml::Table::new()
        };

        let filled = fill_defaults(&mut doc)?;
        let listen: ListenSection = doc
            .get(LISTEN_SECTION)
            .cloned()
            .unwrap_or_else(|| toml::Value::Table(toml::Table::new()))
            .try_into::<ListenSection>()
            .map_err(|e| ProxyError::Config(format!("invalid [listen] section: {e}")))?;

        if filled {
            if let Err(e) = write_back(&expanded, &doc) {
                warn!(path = %expanded.display(), error = %e, "could not write config defaults");
            }
        }

        let file_address = parse_address(&listen.address)?;

        Ok(Self {
            address: cli_address.unwrap_or(file_address),
            port: cli_port.unwrap_or(listen.port),
            config_path: expanded,
        })
    }

    /// The socket address to bind.
    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.address, self.port)
    }
}

/// Insert default `[listen]` keys that are missing. Returns `true` if the
/// document changed.
fn fill_defaults(doc: &mut toml::Table) -> ProxyResult<bool> {
    let section = doc
        .entry(LISTEN_SECTION)
        .or_insert(toml::Value::Table(toml::Table::new()))
        .as_table_mut()
        .ok_or_else(|| ProxyError::Config("[listen] must be a table".to_string()))?;

    let mut changed = false;
    if !section.contains_key(ADDRESS_KEY) {
        section.insert(ADDRESS_KEY.to_string(), toml::Value::String(default_address()));
        changed = true;
    }
    if !section.contains_key(PORT_KEY) {
        section.insert(
            PORT_KEY.to_string(),
            toml::Value::Integer(i64::from(default_port())),
        );
        changed = true;
    }
    Ok(changed)
}

fn write_back(path: &Path, doc: &toml::Table) -> ProxyResult<()> {
    let content = toml::to_string_pretty(doc)
        .map_err(|e| ProxyError::Config(format!("config serialize error: {e}")))?;
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    std::fs::write(path, content)?;
    info!(path = %path.display(), "wrote config defaults");
    Ok(())
}

/// Parse a bind address. `"any"` is accepted as the IPv4 wildcard.
fn parse_address(s: &str) -> ProxyResult<IpAddr> {
    if s.eq_ignore_ascii_case("any") {
        return Ok(IpAddr::V4(Ipv4Addr::UNSPECIFIED));
    }
    s.parse()
        .map_err(|_| ProxyError::Config(format!("invalid listen address: {s}")))
}

/// Expand `~` to the user's home directory.
fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    if let Some(rest) = s.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    path.to_path_buf()
}

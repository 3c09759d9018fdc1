//! Load config from file and environment.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use anyhow::Context;
use loralink_core::ProtocolConfig;
use serde::Deserialize;

/// Daemon configuration. File: ~/.config/loralink/config.toml or /etc/loralink/config.toml.
/// Env overrides: LORALINK_BIND, LORALINK_AIR (comma separated), LORALINK_KEYSTORE.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Local UDP address the air socket binds to (default 0.0.0.0:47000).
    #[serde(default = "default_bind")]
    pub bind: SocketAddr,
    /// Destinations every outbound packet is sent to (default: IPv4 broadcast on 47000).
    #[serde(default = "default_air")]
    pub air: Vec<SocketAddr>,
    /// Key store file.
    #[serde(default = "default_keystore")]
    pub keystore: PathBuf,
    #[serde(default)]
    pub protocol: ProtocolConfig,
}

fn default_bind() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 47000))
}
fn default_air() -> Vec<SocketAddr> {
    vec![SocketAddr::from(([255, 255, 255, 255], 47000))]
}
fn default_keystore() -> PathBuf {
    match std::env::var_os("HOME") {
        Some(h) => PathBuf::from(h).join(".local/share/loralink/keystore.bin"),
        None => PathBuf::from("loralink-keystore.bin"),
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            air: default_air(),
            keystore: default_keystore(),
            protocol: ProtocolConfig::default(),
        }
    }
}

/// Load config: defaults, then the config file, then env vars. An explicit
/// `path` must exist and parse; the well-known locations are best effort.
pub fn load(path: Option<&Path>) -> anyhow::Result<Config> {
    let mut c = match path {
        Some(p) => parse_file(p)?,
        None => load_file().unwrap_or_default(),
    };
    apply_env(&mut c, |name| std::env::var(name).ok());
    Ok(c)
}

/// Apply `LORALINK_*` overrides. Unparsable values are ignored with a warning.
pub fn apply_env(c: &mut Config, var: impl Fn(&str) -> Option<String>) {
    if let Some(s) = var("LORALINK_BIND") {
        match s.trim().parse() {
            Ok(addr) => c.bind = addr,
            Err(e) => tracing::warn!("ignoring LORALINK_BIND={}: {}", s, e),
        }
    }
    if let Some(s) = var("LORALINK_AIR") {
        match parse_addr_list(&s) {
            Ok(addrs) => c.air = addrs,
            Err(e) => tracing::warn!("ignoring LORALINK_AIR={}: {}", s, e),
        }
    }
    if let Some(s) = var("LORALINK_KEYSTORE") {
        if !s.is_empty() {
            c.keystore = PathBuf::from(s);
        }
    }
}

/// Comma separated socket addresses; at least one.
pub fn parse_addr_list(s: &str) -> anyhow::Result<Vec<SocketAddr>> {
    let addrs = s
        .split(',')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(|p| p.parse::<SocketAddr>().with_context(|| format!("bad address {:?}", p)))
        .collect::<anyhow::Result<Vec<_>>>()?;
    if addrs.is_empty() {
        anyhow::bail!("no addresses given");
    }
    Ok(addrs)
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/loralink/config.toml"));
    }
    out.push(PathBuf::from("/etc/loralink/config.toml"));
    out
}

fn load_file() -> Option<Config> {
    for p in config_paths() {
        if p.exists() {
            match parse_file(&p) {
                Ok(c) => return Some(c),
                Err(e) => tracing::warn!("{:#}, using defaults", e),
            }
            break;
        }
    }
    None
}

fn parse_file(path: &Path) -> anyhow::Result<Config> {
    let s = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    toml::from_str(&s).with_context(|| format!("parsing {}", path.display()))
}

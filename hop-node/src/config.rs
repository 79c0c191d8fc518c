//! Load config from file and environment.

use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use hop_core::MeshConfig;
use serde::Deserialize;

/// Node configuration. File: ~/.config/hopchat/config.toml or /etc/hopchat/config.toml.
/// Env overrides: HOPCHAT_NICKNAME, HOPCHAT_PORT, HOPCHAT_MAX_FRAME_LEN, HOPCHAT_COVER_TRAFFIC.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NodeConfig {
    #[serde(default = "default_nickname")]
    pub nickname: String,
    /// UDP port of the LAN link layer (default 45680).
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_multicast_group")]
    pub multicast_group: Ipv4Addr,
    /// Period of the housekeeping tick (default 1000 ms).
    #[serde(default = "default_housekeeping_ms")]
    pub housekeeping_interval_ms: u64,
    /// Where settings persist. In memory only when unset.
    #[serde(default)]
    pub settings_path: Option<PathBuf>,
    #[serde(default)]
    pub mesh: MeshConfig,
}

fn default_nickname() -> String {
    "anon".to_string()
}
fn default_port() -> u16 {
    45680
}
fn default_multicast_group() -> Ipv4Addr {
    Ipv4Addr::new(239, 255, 60, 61)
}
fn default_housekeeping_ms() -> u64 {
    1000
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            nickname: default_nickname(),
            port: default_port(),
            multicast_group: default_multicast_group(),
            housekeeping_interval_ms: default_housekeeping_ms(),
            settings_path: None,
            mesh: MeshConfig::default(),
        }
    }
}

impl NodeConfig {
    pub fn housekeeping_interval(&self) -> Duration {
        Duration::from_millis(self.housekeeping_interval_ms.max(1))
    }

    /// Apply `HOPCHAT_*` overrides from `lookup`. Unparseable values are ignored.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(s) = lookup("HOPCHAT_NICKNAME") {
            if !s.trim().is_empty() {
                self.nickname = s.trim().to_string();
            }
        }
        if let Some(p) = lookup("HOPCHAT_PORT").and_then(|s| s.parse::<u16>().ok()) {
            self.port = p;
        }
        if let Some(n) = lookup("HOPCHAT_MAX_FRAME_LEN").and_then(|s| s.parse::<usize>().ok()) {
            self.mesh.max_frame_len = n;
        }
        if let Some(b) = lookup("HOPCHAT_COVER_TRAFFIC").and_then(|s| parse_bool(&s)) {
            self.mesh.cover_traffic = b;
        }
    }
}

fn parse_bool(s: &str) -> Option<bool> {
    match s.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("reading {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("parsing {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}

/// Load config: merge default, then config file (if present), then env vars.
pub fn load() -> Result<NodeConfig, ConfigError> {
    let mut c = match config_paths().into_iter().find(|p| p.exists()) {
        Some(path) => load_file(&path)?,
        None => NodeConfig::default(),
    };
    c.apply_env(|key| std::env::var(key).ok());
    Ok(c)
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/hopchat/config.toml"));
    }
    out.push(PathBuf::from("/etc/hopchat/config.toml"));
    out
}

pub fn load_file(path: &Path) -> Result<NodeConfig, ConfigError> {
    let s = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    toml::from_str(&s).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    #[test]
    fn partial_file_keeps_defaults() {
        let c: NodeConfig = toml::from_str(
            r#"
            nickname = "alice"
            [mesh]
            max_frame_len = 180
            cover_traffic = true
            "#,
        )
        .unwrap();
        assert_eq!(c.nickname, "alice");
        assert_eq!(c.port, 45680);
        assert_eq!(c.mesh.max_frame_len, 180);
        assert!(c.mesh.cover_traffic);
        assert_eq!(c.mesh.regular_cache_capacity, 100);
        assert_eq!(c.mesh.favorite_cache_capacity, 1000);
    }

    #[test]
    fn unknown_keys_rejected() {
        assert!(toml::from_str::<NodeConfig>("colour = \"red\"").is_err());
        assert!(toml::from_str::<NodeConfig>("[mesh]\nmax_hops = 3").is_err());
    }

    #[test]
    fn env_overrides_file() {
        let env: HashMap<&str, &str> = [
            ("HOPCHAT_NICKNAME", "bob"),
            ("HOPCHAT_PORT", "5000"),
            ("HOPCHAT_MAX_FRAME_LEN", "not a number"),
            ("HOPCHAT_COVER_TRAFFIC", "on"),
        ]
        .into_iter()
        .collect();
        let mut c = NodeConfig::default();
        c.apply_env(|k| env.get(k).map(|v| v.to_string()));
        assert_eq!(c.nickname, "bob");
        assert_eq!(c.port, 5000);
        assert_eq!(c.mesh.max_frame_len, 512);
        assert!(c.mesh.cover_traffic);
    }

    #[test]
    fn bad_file_reports_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "port = \"high\"").unwrap();
        assert!(matches!(load_file(&path), Err(ConfigError::Parse { .. })));
    }
}

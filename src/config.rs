use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::{MoguraError, MoguraResult};
use crate::target::TargetType;

const DEFAULT_BASTION_PORT: u16 = 22;
const DEFAULT_KEY_PATH: &str = "~/.ssh/id_rsa";
pub(crate) const DEFAULT_FORWARDING_TIMEOUT: Duration = Duration::from_secs(600);

/// Top-level `$HOME/.mogura/config.yml` document.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub bastion: BastionConfig,
    #[serde(default)]
    pub tunnels: Vec<TunnelConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BastionConfig {
    #[serde(default)]
    pub name: String,
    pub host: String,
    #[serde(default = "default_bastion_port")]
    pub port: u16,
    pub user: String,
    #[serde(default = "default_key_path")]
    pub key_path: String,
    #[serde(default)]
    pub remote_dns: Option<String>,
}

fn default_bastion_port() -> u16 {
    DEFAULT_BASTION_PORT
}

fn default_key_path() -> String {
    DEFAULT_KEY_PATH.to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct TunnelConfig {
    pub name: String,
    pub local_bind_port: u16,
    #[serde(default)]
    pub target_type: TargetType,
    pub target: String,
    #[serde(default)]
    pub target_port: u16,
    #[serde(default)]
    pub forwarding_timeout: Option<String>,
}

/// Resolved, immutable bastion connection parameters.
#[derive(Debug, Clone)]
pub struct BastionSpec {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub key_path: PathBuf,
    pub passphrase: Option<String>,
    pub remote_dns: Option<String>,
}

impl BastionSpec {
    pub fn from_config(config: &BastionConfig) -> MoguraResult<Self> {
        Ok(Self {
            host: config.host.clone(),
            port: config.port,
            user: config.user.clone(),
            key_path: expand_home(&config.key_path)?,
            passphrase: std::env::var("MOGURA_PASSPHRASE").ok(),
            remote_dns: config.remote_dns.clone(),
        })
    }
}

/// Loads and parses the YAML config at `path`, or the default
/// `$HOME/.mogura/config.yml` location if `path` is `None`.
pub fn load(path: Option<&Path>) -> MoguraResult<Config> {
    let resolved = match path {
        Some(p) => p.to_path_buf(),
        None => default_config_path()?,
    };

    let content = std::fs::read_to_string(&resolved).map_err(|e| {
        MoguraError::Config(format!("failed to read config at {}: {}", resolved.display(), e))
    })?;

    serde_yaml::from_str(&content)
        .map_err(|e| MoguraError::Config(format!("failed to parse config: {}", e)))
}

fn default_config_path() -> MoguraResult<PathBuf> {
    let home = dirs::home_dir()
        .ok_or_else(|| MoguraError::Config("could not determine home directory".to_string()))?;
    Ok(home.join(".mogura").join("config.yml"))
}

/// Expands a leading `~/` against the current user's home directory.
fn expand_home(raw: &str) -> MoguraResult<PathBuf> {
    if let Some(rest) = raw.strip_prefix("~/") {
        let home = dirs::home_dir().ok_or_else(|| {
            MoguraError::Config("could not determine home directory".to_string())
        })?;
        Ok(home.join(rest))
    } else {
        Ok(PathBuf::from(raw))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_document() {
        let yaml = r#"
bastion:
  host: bastion.example.com
  user: deploy
tunnels:
  - name: web
    local_bind_port: 8080
    target_type: HOST-PORT
    target: 10.0.0.5
    target_port: 80
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.bastion.port, DEFAULT_BASTION_PORT);
        assert_eq!(config.bastion.key_path, DEFAULT_KEY_PATH);
        assert_eq!(config.tunnels.len(), 1);
        assert_eq!(config.tunnels[0].local_bind_port, 8080);
    }

    #[test]
    fn parses_missing_target_type_as_host_port() {
        let yaml = r#"
bastion:
  host: bastion.example.com
  user: deploy
tunnels:
  - name: web
    local_bind_port: 8080
    target: 10.0.0.5
    target_port: 80
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.tunnels[0].target_type, TargetType::HostPort);
    }

    #[test]
    fn expand_home_leaves_absolute_paths_untouched() {
        let p = expand_home("/etc/mogura/key").unwrap();
        assert_eq!(p, PathBuf::from("/etc/mogura/key"));
    }
}

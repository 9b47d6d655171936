use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

const DEFAULT_SERVER_URL: &str = "http://localhost:10509";

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    #[serde(default)]
    pub debug: bool,
    #[serde(default)]
    pub verbose: bool,
    #[serde(default)]
    pub server: ServerConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Directory of the configuration file; relative paths below resolve
    /// against it.
    #[serde(skip)]
    pub base_path: PathBuf,
    #[serde(default = "default_server_url")]
    pub server_url: String,
    #[serde(default = "default_store_path")]
    pub store_path: PathBuf,
    #[serde(default = "default_state_path")]
    pub state_path: PathBuf,
    #[serde(default = "default_acme_config")]
    pub acme_config: PathBuf,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            base_path: PathBuf::new(),
            server_url: default_server_url(),
            store_path: default_store_path(),
            state_path: default_state_path(),
            acme_config: default_acme_config(),
        }
    }
}

fn default_server_url() -> String {
    DEFAULT_SERVER_URL.to_string()
}

fn default_store_path() -> PathBuf {
    PathBuf::from("store")
}

fn default_state_path() -> PathBuf {
    PathBuf::from("state")
}

fn default_acme_config() -> PathBuf {
    PathBuf::from("acme.yaml")
}

impl Config {
    /// Load configuration from a YAML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let config_str = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let mut config: Config =
            serde_yaml::from_str(&config_str).context("Failed to parse config file")?;
        config.server.base_path = path.parent().unwrap_or(Path::new(".")).to_path_buf();
        Ok(config)
    }
}

impl ServerConfig {
    pub fn resolved_store_path(&self) -> PathBuf {
        resolve_config_path(&self.base_path, &self.store_path)
    }

    pub fn resolved_state_path(&self) -> PathBuf {
        resolve_config_path(&self.base_path, &self.state_path)
    }

    pub fn resolved_acme_config(&self) -> PathBuf {
        resolve_config_path(&self.base_path, &self.acme_config)
    }

    /// The `host:port` part of the configured server URL.
    pub fn listen_address(&self) -> Result<String> {
        let url = self.server_url.trim();
        let rest = url
            .strip_prefix("http://")
            .or_else(|| url.strip_prefix("https://"))
            .unwrap_or(url);
        let address = rest.split('/').next().unwrap_or_default();
        if address.is_empty() || !address.contains(':') {
            bail!("invalid server_url '{}': expected host:port", self.server_url);
        }
        Ok(address.to_string())
    }
}

pub fn resolve_config_path(base_path: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base_path.join(path)
    }
}

//! Configuration types and loading
//!
//! Config precedence: CLI args > env vars > config file > defaults.
//! API keys come from GEMINI_API_KEYS, then GEMINI_API_KEY, then the
//! configured api_keys_file, and are never stored in the TOML itself.

use backend::gemini::{DEFAULT_BASE_URL, DEFAULT_MODEL};
use common::Secret;
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

/// Environment variables checked for API keys, in order.
const API_KEY_VARS: &[&str] = &["GEMINI_API_KEYS", "GEMINI_API_KEY"];

/// Root configuration
#[derive(Debug, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub gemini: GeminiConfig,
    #[serde(default)]
    pub dispatch: DispatchConfig,
    /// Resolved after parsing; never read from the file
    #[serde(skip)]
    pub api_keys: Vec<Secret<String>>,
}

/// HTTP listener settings
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

/// Upstream Gemini API settings
#[derive(Debug, Deserialize)]
pub struct GeminiConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
    /// File with comma- or newline-separated keys (alternative to env vars)
    #[serde(default)]
    pub api_keys_file: Option<PathBuf>,
}

/// Key rotation settings
#[derive(Debug, Deserialize)]
pub struct DispatchConfig {
    /// Extra passes over the whole pool after the first fails on quota
    #[serde(default = "default_max_pool_retries")]
    pub max_pool_retries: u32,
}

fn default_listen_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8080))
}

fn default_max_connections() -> usize {
    256
}

fn default_base_url() -> String {
    DEFAULT_BASE_URL.to_string()
}

fn default_model() -> String {
    DEFAULT_MODEL.to_string()
}

fn default_timeout() -> u64 {
    60
}

fn default_max_pool_retries() -> u32 {
    1
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            max_connections: default_max_connections(),
        }
    }
}

impl Default for GeminiConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            model: default_model(),
            timeout_secs: default_timeout(),
            api_keys_file: None,
        }
    }
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_pool_retries: default_max_pool_retries(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file, validate it, then resolve API keys.
    pub fn load(path: &Path) -> common::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        config.finish()
    }

    /// Like `load`, but a missing file means "all defaults".
    pub fn load_or_default(path: &Path) -> common::Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Config::default().finish()
        }
    }

    fn finish(mut self) -> common::Result<Self> {
        self.validate()?;
        self.api_keys = self.resolve_api_keys()?;
        Ok(self)
    }

    fn validate(&self) -> common::Result<()> {
        if !self.gemini.base_url.starts_with("http://")
            && !self.gemini.base_url.starts_with("https://")
        {
            return Err(common::Error::Config(format!(
                "base_url must start with http:// or https://, got: {}",
                self.gemini.base_url
            )));
        }

        if self.gemini.model.trim().is_empty() {
            return Err(common::Error::Config("model must not be empty".into()));
        }

        if self.gemini.timeout_secs == 0 {
            return Err(common::Error::Config(
                "timeout_secs must be greater than 0".into(),
            ));
        }

        if self.server.max_connections == 0 {
            return Err(common::Error::Config(
                "max_connections must be greater than 0".into(),
            ));
        }

        Ok(())
    }

    /// Resolve API keys: GEMINI_API_KEYS > GEMINI_API_KEY > api_keys_file.
    ///
    /// A variable that is set but yields no keys falls through to the next
    /// source. No keys at all is not an error here.
    fn resolve_api_keys(&self) -> common::Result<Vec<Secret<String>>> {
        for var in API_KEY_VARS {
            if let Ok(raw) = std::env::var(var) {
                let keys = key_pool::split_credentials(&raw);
                if !keys.is_empty() {
                    return Ok(keys);
                }
            }
        }

        if let Some(ref keys_file) = self.gemini.api_keys_file {
            let raw = std::fs::read_to_string(keys_file).map_err(|e| {
                common::Error::Config(format!(
                    "failed to read api_keys_file {}: {e}",
                    keys_file.display()
                ))
            })?;
            return Ok(key_pool::split_credentials(&raw.replace('\n', ",")));
        }

        Ok(Vec::new())
    }

    /// Resolve config file path from CLI arg or CONFIG_PATH env var.
    pub fn resolve_path(cli_path: Option<&str>) -> PathBuf {
        if let Some(p) = cli_path {
            return PathBuf::from(p);
        }
        if let Ok(p) = std::env::var("CONFIG_PATH") {
            return PathBuf::from(p);
        }
        PathBuf::from("gemini-gateway.toml")
    }
}

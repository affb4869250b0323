use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::ConfigError;

pub const DEFAULT_BATCH_CEILING: usize = 100;
const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 10;

#[derive(Clone, Debug)]
pub struct Config {
    pub gateway_url: String,
    pub api_base_url: String,
    pub token: Option<String>,
    pub data_dir: PathBuf,
    pub config_path: PathBuf,
    pub profiles_path: PathBuf,
    pub state_path: PathBuf,
    pub batch_ceiling: usize,
    pub adapters: Vec<AdapterConfig>,
}

impl Config {
    /// Environment first, then the YAML file, then built-in defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let debug = cfg!(debug_assertions);
        let config_path = env::var("TGPIPE_CONFIG_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("config.yaml"));
        let file = FileConfig::load(&config_path)?;

        let gateway_url = env::var("TGPIPE_GATEWAY_URL")
            .ok()
            .or(file.gateway.url)
            .unwrap_or_else(|| {
                if debug {
                    "ws://localhost:8080/realtime".to_string()
                } else {
                    "wss://localhost:8443/realtime".to_string()
                }
            });
        let gateway_url = gateway_url.trim_end_matches('/').to_string();

        let api_base_url = env::var("TGPIPE_API_URL")
            .ok()
            .or(file.gateway.api_url)
            .unwrap_or_else(|| derive_api_url(&gateway_url));
        let api_base_url = api_base_url.trim_end_matches('/').to_string();

        let token = env::var("TGPIPE_TOKEN")
            .ok()
            .or(file.gateway.token)
            .filter(|token| !token.trim().is_empty());

        let data_dir = env::var("TGPIPE_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| default_data_dir());
        let profiles_path = env::var("TGPIPE_PROFILES_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("profiles.json"));
        let state_path = env::var("TGPIPE_STATE_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_dir.join("state.json"));

        if file.history.batch_ceiling == 0 {
            return Err(ConfigError::InvalidBatchCeiling);
        }

        Ok(Self {
            gateway_url,
            api_base_url,
            token,
            data_dir,
            config_path,
            profiles_path,
            state_path,
            batch_ceiling: file.history.batch_ceiling,
            adapters: file.adapters,
        })
    }

    pub fn require_token(&self) -> Result<&str, ConfigError> {
        self.token.as_deref().ok_or(ConfigError::MissingToken)
    }
}

/// Contents of `config.yaml`.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct FileConfig {
    pub gateway: GatewaySection,
    pub history: HistorySection,
    pub adapters: Vec<AdapterConfig>,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct GatewaySection {
    pub url: Option<String>,
    pub api_url: Option<String>,
    pub token: Option<String>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct HistorySection {
    pub batch_ceiling: usize,
}

impl Default for HistorySection {
    fn default() -> Self {
        Self {
            batch_ceiling: DEFAULT_BATCH_CEILING,
        }
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum AdapterConfig {
    Stdout {
        #[serde(default)]
        pretty: bool,
    },
    Http {
        url: String,
        #[serde(default = "default_method")]
        method: String,
        #[serde(default)]
        headers: BTreeMap<String, String>,
        #[serde(default = "default_timeout")]
        timeout: u64,
        #[serde(default = "default_enabled")]
        enabled: bool,
    },
}

fn default_method() -> String {
    "POST".to_string()
}

fn default_timeout() -> u64 {
    DEFAULT_HTTP_TIMEOUT_SECS
}

fn default_enabled() -> bool {
    true
}

impl FileConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = match fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(source) => {
                return Err(ConfigError::Read {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };
        Self::parse(&contents).map_err(|source| ConfigError::File {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn parse(contents: &str) -> Result<Self, serde_yaml::Error> {
        if contents.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(contents)
    }
}

fn derive_api_url(gateway_url: &str) -> String {
    let base = gateway_url
        .replacen("wss://", "https://", 1)
        .replacen("ws://", "http://", 1);
    let base = base.trim_end_matches("/realtime");
    format!("{base}/v1")
}

fn default_data_dir() -> PathBuf {
    let base = env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("."));
    base.join(".local").join("share").join("tgpipe")
}

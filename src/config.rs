use std::{
    collections::BTreeMap,
    env, fs,
    path::{Path, PathBuf},
    time::Duration,
};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

pub const DEFAULT_CONFIG_PATH: &str = "config/config.yaml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_yaml::Error,
    },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub server: ServerConfig,
    pub logging: LoggingConfig,
    pub auth: AuthConfig,
    pub rate_limit: RateLimitConfig,
    pub health_check_interval_secs: u64,
    pub default_backend: String,
    pub backends: BTreeMap<String, BackendConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub request_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    pub enabled: bool,
    pub keys: Vec<String>,
    pub keys_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub enabled: bool,
    pub requests_per_minute: u32,
    pub redis_url: Option<String>,
    pub redis_prefix: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Opencode,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(rename = "type", default = "default_backend_kind")]
    pub kind: String,
    pub host: String,
    pub port: u16,
    #[serde(default = "default_backend_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub models: Vec<ModelConfig>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelConfig {
    pub id: String,
    #[serde(default)]
    pub aliases: Vec<String>,
    #[serde(default)]
    pub free: bool,
}

#[derive(Debug, Deserialize)]
struct KeysFile {
    #[serde(default)]
    keys: Vec<KeyEntry>,
}

#[derive(Debug, Deserialize)]
struct KeyEntry {
    key: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default = "default_true")]
    enabled: bool,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        let mut backends = BTreeMap::new();
        backends.insert(
            "opencode".to_owned(),
            BackendConfig {
                enabled: true,
                kind: default_backend_kind(),
                host: "localhost".to_owned(),
                port: 3001,
                timeout_secs: default_backend_timeout_secs(),
                models: vec![
                    model("big-pickle", &["pickle", "bp"]),
                    model("grok-code-fast-1", &["grok", "grok-fast"]),
                    model("glm-4.7", &["glm", "glm4"]),
                    model("minimax-m2.1", &["minimax", "mm"]),
                ],
            },
        );

        Self {
            server: ServerConfig::default(),
            logging: LoggingConfig::default(),
            auth: AuthConfig::default(),
            rate_limit: RateLimitConfig::default(),
            health_check_interval_secs: 30,
            default_backend: "opencode".to_owned(),
            backends,
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_owned(),
            port: 8080,
            request_timeout_secs: 300,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_owned(),
            format: "json".to_owned(),
        }
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            keys: Vec::new(),
            keys_file: None,
        }
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            requests_per_minute: 60,
            redis_url: None,
            redis_prefix: "gateway".to_owned(),
        }
    }
}

impl GatewayConfig {
    /// Loads defaults, then the YAML file named by `CONFIG_PATH`, then `.env`
    /// and process environment overrides.
    pub fn load() -> Result<Self, ConfigError> {
        if let Err(error) = dotenvy::dotenv() {
            if !error.not_found() {
                warn!(error = %error, "failed to read .env file");
            }
        }

        let path = env::var("CONFIG_PATH").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_owned());
        let mut config = Self::from_path(Path::new(&path))?;
        config.apply_env_overrides();
        config.load_keys_file()?;
        config.validate()?;
        Ok(config)
    }

    /// A missing file yields the defaults.
    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let raw = match fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
                info!(path = %path.display(), "config file not found, using defaults");
                return Ok(Self::default());
            }
            Err(source) => {
                return Err(ConfigError::Read {
                    path: path.to_owned(),
                    source,
                })
            }
        };

        Self::from_yaml(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_owned(),
            source,
        })
    }

    pub fn from_yaml(raw: &str) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(raw)
    }

    pub fn apply_env_overrides(&mut self) {
        if let Some(host) = read_string("HOST") {
            self.server.host = host;
        }
        if let Some(port) = read_parsed::<u16>("PORT") {
            self.server.port = port;
        }
        if let Some(enabled) = read_bool("AUTH_ENABLED") {
            self.auth.enabled = enabled;
        }
        for name in ["API_KEY", "AI_GATEWAY_API_KEY"] {
            if let Some(key) = read_string(name) {
                self.auth.keys.push(key);
            }
        }
        if let Some(backend) = self.backends.get_mut("opencode") {
            if let Some(host) = read_string("OPENCODE_HOST") {
                backend.host = host;
            }
            if let Some(port) = read_parsed::<u16>("OPENCODE_PORT") {
                backend.port = port;
            }
        }
        if let Some(enabled) = read_bool("RATE_LIMIT_ENABLED") {
            self.rate_limit.enabled = enabled;
        }
        if let Some(rpm) = read_parsed::<u32>("RATE_LIMIT_RPM") {
            self.rate_limit.requests_per_minute = rpm;
        }
        if let Some(url) = read_string("REDIS_URL") {
            self.rate_limit.redis_url = Some(url);
        }
        if let Some(level) = read_string("LOG_LEVEL") {
            self.logging.level = level;
        }
    }

    fn load_keys_file(&mut self) -> Result<(), ConfigError> {
        let Some(path) = self.auth.keys_file.clone() else {
            return Ok(());
        };
        let raw = fs::read_to_string(&path).map_err(|source| ConfigError::Read {
            path: path.clone(),
            source,
        })?;
        let keys_file: KeysFile = serde_yaml::from_str(&raw)
            .map_err(|source| ConfigError::Parse { path, source })?;

        for entry in keys_file.keys.into_iter().filter(|entry| entry.enabled) {
            info!(
                name = %entry.name.as_deref().unwrap_or("unnamed"),
                "api key loaded from keys file"
            );
            self.auth.keys.push(entry.key);
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.port == 0 {
            return Err(ConfigError::Invalid("server.port must be non-zero".to_owned()));
        }
        for (id, backend) in self.backends.iter().filter(|(_, backend)| backend.enabled) {
            if backend.host.trim().is_empty() {
                return Err(ConfigError::Invalid(format!("backend '{id}' has no host")));
            }
        }
        Ok(())
    }

    pub fn health_check_interval(&self) -> Option<Duration> {
        (self.health_check_interval_secs > 0)
            .then(|| Duration::from_secs(self.health_check_interval_secs))
    }
}

impl BackendConfig {
    pub fn backend_kind(&self) -> Option<BackendKind> {
        match self.kind.trim().to_ascii_lowercase().as_str() {
            "opencode" => Some(BackendKind::Opencode),
            _ => None,
        }
    }

    pub fn base_url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

fn model(id: &str, aliases: &[&str]) -> ModelConfig {
    ModelConfig {
        id: id.to_owned(),
        aliases: aliases.iter().map(|alias| (*alias).to_owned()).collect(),
        free: true,
    }
}

fn default_true() -> bool {
    true
}

fn default_backend_kind() -> String {
    "opencode".to_owned()
}

fn default_backend_timeout_secs() -> u64 {
    60
}

fn read_string(name: &str) -> Option<String> {
    env::var(name)
        .ok()
        .map(|value| value.trim().to_owned())
        .filter(|value| !value.is_empty())
}

fn read_parsed<T: std::str::FromStr>(name: &str) -> Option<T> {
    read_string(name).and_then(|value| value.parse::<T>().ok())
}

fn read_bool(name: &str) -> Option<bool> {
    read_string(name).map(|value| value == "true" || value == "1")
}

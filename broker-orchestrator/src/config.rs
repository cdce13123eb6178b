use crate::error::{BrokerError, Result};
use broker_storage::EncryptionPassword;
use broker_workspace::EngineVersion;
use serde::Deserialize;
use serde_json::{Map, Value};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
pub struct BrokerConfig {
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,

    #[serde(default = "default_terraform_binary")]
    pub terraform_binary: PathBuf,

    #[serde(default = "default_plugin_dir")]
    pub plugin_dir: PathBuf,

    /// Engine version used for workspaces without recorded state.
    #[serde(default = "default_terraform_version")]
    pub terraform_version: String,

    /// Per-operation engine timeout in seconds; 0 disables it.
    #[serde(default = "default_operation_timeout")]
    pub operation_timeout_secs: u64,

    /// Directory of service definition YAML files.
    #[serde(default = "default_services_dir")]
    pub services_dir: Option<PathBuf>,

    /// Broker-wide values merged into every operation's variables.
    #[serde(default)]
    pub brokerpak_config: Map<String, Value>,

    #[serde(default)]
    pub encryption_enabled: bool,

    #[serde(default)]
    pub encryption_passwords: Vec<EncryptionPassword>,
}

fn default_db_path() -> PathBuf {
    if let Ok(path) = std::env::var("BROKER_DB_PATH") {
        return PathBuf::from(path);
    }

    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    PathBuf::from(home).join(".broker").join("broker.db")
}

fn default_terraform_binary() -> PathBuf {
    std::env::var("BROKER_TERRAFORM_BINARY")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("terraform"))
}

fn default_plugin_dir() -> PathBuf {
    std::env::var("BROKER_PLUGIN_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/usr/local/share/terraform/plugins"))
}

fn default_terraform_version() -> String {
    std::env::var("BROKER_TERRAFORM_VERSION").unwrap_or_else(|_| "1.1.4".to_string())
}

fn default_operation_timeout() -> u64 {
    std::env::var("BROKER_OPERATION_TIMEOUT")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(3600) // 1 hour
}

fn default_services_dir() -> Option<PathBuf> {
    std::env::var("BROKER_SERVICES_DIR").ok().map(PathBuf::from)
}

fn env_bool(name: &str) -> bool {
    std::env::var(name)
        .map(|v| matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
        .unwrap_or(false)
}

fn env_json<T: serde::de::DeserializeOwned + Default>(name: &str) -> Result<T> {
    match std::env::var(name) {
        Ok(raw) if !raw.trim().is_empty() => serde_json::from_str(&raw)
            .map_err(|e| BrokerError::Config(format!("{name} is not valid JSON: {e}"))),
        _ => Ok(T::default()),
    }
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            terraform_binary: default_terraform_binary(),
            plugin_dir: default_plugin_dir(),
            terraform_version: default_terraform_version(),
            operation_timeout_secs: default_operation_timeout(),
            services_dir: default_services_dir(),
            brokerpak_config: Map::new(),
            encryption_enabled: false,
            encryption_passwords: Vec::new(),
        }
    }
}

impl BrokerConfig {
    /// Read configuration from `BROKER_*` environment variables.
    pub fn from_env() -> Result<Self> {
        let config = Self {
            brokerpak_config: env_json("BROKER_BROKERPAK_CONFIG")?,
            encryption_enabled: env_bool("BROKER_ENCRYPTION_ENABLED"),
            encryption_passwords: env_json("BROKER_ENCRYPTION_PASSWORDS")?,
            ..Self::default()
        };
        config.engine_version()?;
        Ok(config)
    }

    pub fn engine_version(&self) -> Result<EngineVersion> {
        self.terraform_version.parse().map_err(|_| {
            BrokerError::Config(format!(
                "invalid terraform version {:?}",
                self.terraform_version
            ))
        })
    }

    pub fn operation_timeout(&self) -> Option<Duration> {
        (self.operation_timeout_secs > 0).then(|| Duration::from_secs(self.operation_timeout_secs))
    }
}

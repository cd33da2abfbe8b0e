use crate::alerts::{default_rules, Rule};
use crate::collectors::PluginKind;
use crate::docker::DEFAULT_SOCKET;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    #[serde(default = "default_listen")]
    pub listen: String,
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,
    #[serde(default = "default_cycle_timeout_ms")]
    pub cycle_timeout_ms: u64,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default = "default_plugins")]
    pub plugins: Vec<PluginKind>,
    #[serde(default)]
    pub docker: DockerConfig,
    #[serde(default)]
    pub alerts: AlertsConfig,
    #[serde(default)]
    pub history: HistoryConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AuthConfig {
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default = "default_token_env")]
    pub token_env: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DockerConfig {
    #[serde(default = "default_docker_socket")]
    pub socket: PathBuf,
    #[serde(default = "default_true")]
    pub include_stopped: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AlertsConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Minimum time between two firings of the same rule, e.g. `5m`.
    #[serde(default = "default_cooldown")]
    pub cooldown: String,
    #[serde(default = "default_rules")]
    pub rules: Vec<Rule>,
    #[serde(default)]
    pub webhook: WebhookConfig,
    #[serde(default)]
    pub telegram: TelegramConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WebhookConfig {
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_webhook_url_env")]
    pub url_env: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TelegramConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_bot_token_env")]
    pub bot_token_env: String,
    #[serde(default)]
    pub bot_token: Option<String>,
    #[serde(default)]
    pub chat_ids: Vec<i64>,
    #[serde(default = "default_rate_limit_per_minute")]
    pub rate_limit_per_minute: u32,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HistoryConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_history_path")]
    pub path: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            interval_ms: default_interval_ms(),
            cycle_timeout_ms: default_cycle_timeout_ms(),
            auth: AuthConfig::default(),
            plugins: default_plugins(),
            docker: DockerConfig::default(),
            alerts: AlertsConfig::default(),
            history: HistoryConfig::default(),
        }
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            token: None,
            token_env: default_token_env(),
        }
    }
}

impl Default for DockerConfig {
    fn default() -> Self {
        Self {
            socket: default_docker_socket(),
            include_stopped: true,
        }
    }
}

impl Default for AlertsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            cooldown: default_cooldown(),
            rules: default_rules(),
            webhook: WebhookConfig::default(),
            telegram: TelegramConfig::default(),
        }
    }
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            url: None,
            url_env: default_webhook_url_env(),
        }
    }
}

impl Default for TelegramConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            bot_token_env: default_bot_token_env(),
            bot_token: None,
            chat_ids: Vec::new(),
            rate_limit_per_minute: default_rate_limit_per_minute(),
        }
    }
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            path: default_history_path(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to parse YAML in {path}: {source}")]
    Parse {
        path: String,
        source: serde_yaml::Error,
    },
    #[error("invalid configuration: {0}")]
    Validation(String),
}

impl Config {
    /// Loads and validates the file at `path`. A missing file yields the
    /// built-in defaults.
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path_ref = path.as_ref();
        let path_display = path_ref.display().to_string();
        let text = match fs::read_to_string(path_ref) {
            Ok(text) => text,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                warn!(path = %path_display, "config file not found, using defaults");
                let cfg = Config::default();
                cfg.validate()?;
                return Ok(cfg);
            }
            Err(source) => {
                return Err(ConfigError::Read {
                    path: path_display,
                    source,
                })
            }
        };

        let cfg: Config = serde_yaml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path_display,
            source,
        })?;

        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.listen.trim().is_empty() {
            return Err(ConfigError::Validation("listen is required".to_string()));
        }
        if SocketAddr::from_str(&self.listen).is_err() {
            return Err(ConfigError::Validation(
                "listen must be a valid host:port address".to_string(),
            ));
        }
        if self.interval_ms < 100 {
            return Err(ConfigError::Validation(
                "interval_ms must be >= 100".to_string(),
            ));
        }
        if self.cycle_timeout_ms == 0 || self.cycle_timeout_ms >= self.interval_ms {
            return Err(ConfigError::Validation(
                "cycle_timeout_ms must be > 0 and lower than interval_ms".to_string(),
            ));
        }

        validate_alerts(&self.alerts)?;

        if self.history.enabled && self.history.path.as_os_str().is_empty() {
            return Err(ConfigError::Validation(
                "history.path must not be empty when history is enabled".to_string(),
            ));
        }

        Ok(())
    }

    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn cycle_timeout(&self) -> Duration {
        Duration::from_millis(self.cycle_timeout_ms)
    }

    pub fn example_yaml() -> &'static str {
        include_str!("../config.yaml.example")
    }
}

impl AuthConfig {
    /// Inline token first, then the environment. Empty means no gate.
    pub fn resolve_token(&self) -> Option<String> {
        resolve_secret(self.token.as_deref(), &self.token_env)
    }
}

impl AlertsConfig {
    pub fn cooldown(&self) -> Result<Duration, ConfigError> {
        humantime::parse_duration(self.cooldown.trim()).map_err(|err| {
            ConfigError::Validation(format!("alerts.cooldown '{}': {err}", self.cooldown))
        })
    }
}

impl WebhookConfig {
    pub fn resolve_url(&self) -> Option<String> {
        resolve_secret(self.url.as_deref(), &self.url_env)
    }
}

impl TelegramConfig {
    pub fn resolve_token(&self) -> Option<String> {
        resolve_secret(self.bot_token.as_deref(), &self.bot_token_env)
    }
}

fn resolve_secret(inline: Option<&str>, env_name: &str) -> Option<String> {
    inline
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .or_else(|| {
            std::env::var(env_name)
                .ok()
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        })
}

fn validate_alerts(cfg: &AlertsConfig) -> Result<(), ConfigError> {
    if cfg.cooldown()? < Duration::from_secs(1) {
        return Err(ConfigError::Validation(
            "alerts.cooldown must be at least 1s".to_string(),
        ));
    }

    let mut ids = HashSet::new();
    for rule in &cfg.rules {
        if rule.id.trim().is_empty() {
            return Err(ConfigError::Validation(
                "alerts.rules[*].id must not be empty".to_string(),
            ));
        }
        if !ids.insert(rule.id.as_str()) {
            return Err(ConfigError::Validation(format!(
                "alert rule id '{}' must be unique",
                rule.id
            )));
        }
        if !(0.0..=100.0).contains(&rule.threshold) {
            return Err(ConfigError::Validation(format!(
                "alert rule '{}' threshold must be in 0..100",
                rule.id
            )));
        }
    }

    if cfg.telegram.rate_limit_per_minute < 1 {
        return Err(ConfigError::Validation(
            "alerts.telegram.rate_limit_per_minute must be >= 1".to_string(),
        ));
    }

    Ok(())
}

fn default_listen() -> String {
    "0.0.0.0:8080".to_string()
}

const fn default_interval_ms() -> u64 {
    1000
}

const fn default_cycle_timeout_ms() -> u64 {
    800
}

fn default_plugins() -> Vec<PluginKind> {
    PluginKind::ALL.to_vec()
}

fn default_token_env() -> String {
    "AEGIS_TOKEN".to_string()
}

fn default_docker_socket() -> PathBuf {
    PathBuf::from(DEFAULT_SOCKET)
}

const fn default_true() -> bool {
    true
}

fn default_cooldown() -> String {
    "5m".to_string()
}

fn default_webhook_url_env() -> String {
    "AEGIS_WEBHOOK_URL".to_string()
}

fn default_bot_token_env() -> String {
    "TELEGRAM_BOT_TOKEN".to_string()
}

const fn default_rate_limit_per_minute() -> u32 {
    30
}

fn default_history_path() -> PathBuf {
    PathBuf::from("./aegis_history.db")
}

use serde::Deserialize;
use std::{env, path::Path, path::PathBuf, time::Duration};
use thiserror::Error;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct Config {
    pub app: AppConfig,
    pub paths: PathsConfig,
    pub telemetry: TelemetryConfig,
    pub model: ModelConfig,
    pub imap: ImapConfig,
    #[serde(default)]
    pub scan: ScanSettings,
    #[serde(default)]
    pub organizer: OrganizerSettings,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct AppConfig {
    pub service_name: String,
    pub env: String,
}

/// Locations of the JSON stores kept next to the mailbox.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct PathsConfig {
    pub senders: PathBuf,
    pub sender_labels: PathBuf,
    pub unsubscribed: PathBuf,
    pub categories: PathBuf,
    pub diagnostics: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct TelemetryConfig {
    pub otlp_endpoint: Option<String>,
    pub export_traces: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct ModelConfig {
    pub provider: String,
    pub model: String,
    pub temperature: f32,
    pub max_output_tokens: u32,
    /// Optional file holding a system instruction and a user template separated by
    /// a `PROMPT_TEMPLATE` line.
    #[serde(default)]
    pub prompt_template: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct ImapConfig {
    pub host: String,
    #[serde(default = "default_imap_port")]
    pub port: u16,
    pub username: String,
    pub password: String,
    #[serde(default = "default_folder")]
    pub folder: String,
    #[serde(default = "default_connect_attempts")]
    pub connect_attempts: u32,
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
}

impl ImapConfig {
    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct ScanSettings {
    pub batch_size: usize,
    pub workers: usize,
}

impl Default for ScanSettings {
    fn default() -> Self {
        Self {
            batch_size: 10,
            workers: 10,
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct OrganizerSettings {
    pub summary_char_budget: usize,
}

impl Default for OrganizerSettings {
    fn default() -> Self {
        Self {
            summary_char_budget: 2500,
        }
    }
}

fn default_imap_port() -> u16 {
    993
}

fn default_folder() -> String {
    "[Gmail]/All Mail".to_string()
}

fn default_connect_attempts() -> u32 {
    3
}

fn default_retry_backoff_ms() -> u64 {
    500
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read configuration file: {0}")]
    ConfigBuild(config::ConfigError),
    #[error("failed to parse configuration: {0}")]
    Deserialize(config::ConfigError),
    #[error("missing required environment variable {0}")]
    MissingEnvVar(String),
    #[error("invalid configuration value for {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },
}

impl Config {
    /// Load configuration from the provided path, apply environment overrides, and
    /// resolve any `env:` indirections.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = config::Config::builder()
            .add_source(config::File::from(path.as_ref()))
            .build()
            .map_err(ConfigError::ConfigBuild)?;

        let mut cfg: Config = raw.try_deserialize().map_err(ConfigError::Deserialize)?;
        cfg.apply_env_overrides();
        cfg.resolve_env_markers()?;
        cfg.expand_paths();
        cfg.validate()?;
        Ok(cfg)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(host) = env::var("TIDYMAIL_IMAP_HOST") {
            self.imap.host = host;
        }

        if let Ok(username) = env::var("TIDYMAIL_IMAP_USERNAME") {
            self.imap.username = username;
        }

        if let Ok(password) = env::var("TIDYMAIL_IMAP_PASSWORD") {
            self.imap.password = password;
        }

        if let Ok(otlp) = env::var("OTLP_ENDPOINT") {
            self.telemetry.otlp_endpoint = Some(otlp);
        }

        if let Ok(model) = env::var("MODEL") {
            self.model.model = model;
        }
    }

    fn resolve_env_markers(&mut self) -> Result<(), ConfigError> {
        apply_env_marker(&mut self.app.service_name)?;
        apply_env_marker(&mut self.app.env)?;
        apply_env_marker(&mut self.model.provider)?;
        apply_env_marker(&mut self.model.model)?;
        apply_env_marker(&mut self.imap.host)?;
        apply_env_marker(&mut self.imap.username)?;
        apply_env_marker(&mut self.imap.password)?;
        apply_env_marker(&mut self.imap.folder)?;
        if let Some(endpoint) = &mut self.telemetry.otlp_endpoint {
            apply_env_marker(endpoint)?;
        }
        for path in self.data_paths_mut() {
            apply_env_marker_path(path)?;
        }
        if let Some(template) = &mut self.model.prompt_template {
            apply_env_marker_path(template)?;
        }
        Ok(())
    }

    fn expand_paths(&mut self) {
        for path in self.data_paths_mut() {
            expand_tilde(path);
        }
        if let Some(template) = &mut self.model.prompt_template {
            expand_tilde(template);
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.scan.batch_size == 0 {
            return Err(ConfigError::InvalidValue {
                field: "scan.batch_size",
                reason: "must be at least 1".into(),
            });
        }
        if self.scan.workers == 0 {
            return Err(ConfigError::InvalidValue {
                field: "scan.workers",
                reason: "must be at least 1".into(),
            });
        }
        if self.imap.connect_attempts == 0 {
            return Err(ConfigError::InvalidValue {
                field: "imap.connect_attempts",
                reason: "must be at least 1".into(),
            });
        }
        Ok(())
    }

    fn data_paths_mut(&mut self) -> [&mut PathBuf; 5] {
        [
            &mut self.paths.senders,
            &mut self.paths.sender_labels,
            &mut self.paths.unsubscribed,
            &mut self.paths.categories,
            &mut self.paths.diagnostics,
        ]
    }
}

fn apply_env_marker(value: &mut String) -> Result<(), ConfigError> {
    if let Some(rest) = value.strip_prefix("env:") {
        let resolved = env::var(rest).map_err(|_| ConfigError::MissingEnvVar(rest.to_string()))?;
        *value = resolved;
    }
    Ok(())
}

fn apply_env_marker_path(path: &mut PathBuf) -> Result<(), ConfigError> {
    let mut value = path.to_string_lossy().to_string();
    apply_env_marker(&mut value)?;
    *path = PathBuf::from(value);
    Ok(())
}

fn expand_tilde(path: &mut PathBuf) {
    let raw = path.to_string_lossy().to_string();
    let expanded = shellexpand::tilde(&raw);
    *path = PathBuf::from(expanded.as_ref());
}

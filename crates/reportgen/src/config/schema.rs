use serde::{Deserialize, Serialize};

use crate::coordinator::TARGETS_PER_REQUEST;
use crate::report::{DuplicatePolicy, TargetKind};
use crate::secrets::SecretSource;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub version: String,
    #[serde(default)]
    pub database: DatabaseConfig,
    pub targets: TargetsConfig,
    #[serde(default)]
    pub dispatch: DispatchConfig,
    #[serde(default)]
    pub pending: PendingConfig,
    #[serde(default)]
    pub duplicates: DuplicatesConfig,
    #[serde(default)]
    pub notification: NotificationConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// SQLite file path; `":memory:"` for an in-memory database. Defaults to
    /// `~/.reportgen/data/reportgen.db`.
    #[serde(default)]
    pub path: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetsConfig {
    pub pdf: TargetConfig,
    pub excel: TargetConfig,
}

impl TargetsConfig {
    pub fn get(&self, kind: TargetKind) -> &TargetConfig {
        match kind {
            TargetKind::Pdf => &self.pdf,
            TargetKind::Excel => &self.excel,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetConfig {
    pub base_url: String,
    #[serde(default)]
    pub path: Option<String>,
}

impl TargetConfig {
    pub fn path_for(&self, kind: TargetKind) -> &str {
        self.path.as_deref().unwrap_or(kind.default_path())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchConfig {
    #[serde(default = "default_target_timeout_secs")]
    pub target_timeout_secs: u64,
    /// Upper bound on concurrent target calls. A synchronous request holds
    /// one per target, so at least two are needed.
    #[serde(default = "default_worker_count")]
    pub worker_count: usize,
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

fn default_target_timeout_secs() -> u64 {
    60
}

fn default_worker_count() -> usize {
    num_cpus::get().max(TARGETS_PER_REQUEST as usize)
}

fn default_channel_capacity() -> usize {
    64
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            target_timeout_secs: default_target_timeout_secs(),
            worker_count: default_worker_count(),
            channel_capacity: default_channel_capacity(),
        }
    }
}

/// Stale PENDING policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingConfig {
    /// Age after which a PENDING sub-report is failed. `null` keeps it
    /// PENDING indefinitely.
    #[serde(default = "default_pending_timeout_secs")]
    pub timeout_secs: Option<u64>,
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

fn default_pending_timeout_secs() -> Option<u64> {
    Some(1800)
}

fn default_sweep_interval_secs() -> u64 {
    60
}

impl Default for PendingConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_pending_timeout_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DuplicatesConfig {
    #[serde(default)]
    pub policy: DuplicatePolicy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationConfig {
    #[serde(default = "default_recipient")]
    pub recipient: String,
    #[serde(default)]
    pub webhook: Option<WebhookConfig>,
}

fn default_recipient() -> String {
    "reports@localhost".to_string()
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            recipient: default_recipient(),
            webhook: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookConfig {
    pub url: String,
    /// Bearer token given inline (for local testing).
    #[serde(default)]
    pub token: Option<String>,
    /// Path to a file holding the bearer token.
    #[serde(default)]
    pub token_file: Option<String>,
    /// Environment variable holding the bearer token.
    #[serde(default)]
    pub token_env_var: Option<String>,
    #[serde(default = "default_webhook_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_webhook_timeout_secs() -> u64 {
    10
}

impl WebhookConfig {
    pub fn token_source(&self) -> SecretSource<'_> {
        SecretSource {
            value: self.token.as_deref(),
            file: self.token_file.as_deref(),
            env_var: self.token_env_var.as_deref(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub format: LogFormat,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Compact,
    Pretty,
    Json,
}

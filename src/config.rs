use crate::core::backends::BackendOptions;
use crate::core::coordinator::RetryPolicy;
use crate::utils::{get_data_dir, get_state_dir};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Complete application configuration: command timeouts, retry policy,
/// backend targets and connector credentials
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Hard timeout for every native command
    pub command_timeout_secs: u64,
    /// Attempts for transient failures, including the first (clamped to 1..=10)
    pub max_retries: u32,
    pub retry_backoff_ms: u64,
    pub nft_family: String,
    pub nft_table: String,
    /// `None` targets firewalld's default zone
    pub firewalld_zone: Option<String>,
    pub docker_enabled: bool,
    /// Nginx Proxy Manager base URL; empty disables the connector
    pub npm_url: String,
    pub npm_email: String,
    pub npm_password: String,
    pub npm_accept_invalid_certs: bool,
    pub http_timeout_secs: u64,
    /// `None` writes the audit log to the state directory
    pub audit_log_path: Option<PathBuf>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            command_timeout_secs: 10,
            max_retries: 3,
            retry_backoff_ms: 200,
            nft_family: "inet".to_string(),
            nft_table: "filter".to_string(),
            firewalld_zone: None,
            docker_enabled: true,
            npm_url: String::new(),
            npm_email: String::new(),
            npm_password: String::new(),
            npm_accept_invalid_certs: false,
            http_timeout_secs: 30,
            audit_log_path: None,
        }
    }
}

/// Credentials for the proxy manager connector
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NpmSettings {
    pub url: String,
    pub email: String,
    pub password: String,
    pub accept_invalid_certs: bool,
    pub timeout: Duration,
}

impl AppConfig {
    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs.max(1))
    }

    pub fn backend_options(&self) -> BackendOptions {
        BackendOptions {
            timeout: self.command_timeout(),
            nft_family: self.nft_family.clone(),
            nft_table: self.nft_table.clone(),
            firewalld_zone: self.firewalld_zone.clone().filter(|z| !z.is_empty()),
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_retries.clamp(1, 10),
            base_backoff: Duration::from_millis(self.retry_backoff_ms),
        }
    }

    /// `None` until a URL and both credentials are configured
    pub fn npm_settings(&self) -> Option<NpmSettings> {
        if self.npm_url.is_empty() || self.npm_email.is_empty() || self.npm_password.is_empty() {
            return None;
        }
        Some(NpmSettings {
            url: self.npm_url.trim_end_matches('/').to_string(),
            email: self.npm_email.clone(),
            password: self.npm_password.clone(),
            accept_invalid_certs: self.npm_accept_invalid_certs,
            timeout: Duration::from_secs(self.http_timeout_secs.max(1)),
        })
    }

    pub fn audit_log_path(&self) -> Option<PathBuf> {
        self.audit_log_path
            .clone()
            .or_else(|| get_state_dir().map(|d| d.join("audit.log")))
    }

    /// Applies `UNIFW_NPM_*` overrides from `lookup`.
    ///
    /// Elevation variables are read by the runner itself.
    pub fn apply_env_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup("UNIFW_NPM_URL") {
            self.npm_url = url;
        }
        if let Some(email) = lookup("UNIFW_NPM_EMAIL") {
            self.npm_email = email;
        }
        if let Some(password) = lookup("UNIFW_NPM_PASSWORD") {
            self.npm_password = password;
        }
    }
}

pub fn config_path() -> Option<PathBuf> {
    get_data_dir().map(|d| d.join("config.json"))
}

/// Saves the app config to disk using an atomic write pattern.
/// 1. Writes to a temporary file.
/// 2. Sets restrictive permissions (0o600).
/// 3. Atomically renames to the target path.
///
/// # Security
///
/// The file holds proxy manager credentials, so on Unix it is created with
/// mode 0o600 (user read/write only).
pub async fn save_config(config: &AppConfig) -> std::io::Result<()> {
    match config_path() {
        Some(path) => save_config_to(config, &path).await,
        None => Ok(()),
    }
}

pub async fn save_config_to(config: &AppConfig, path: &Path) -> std::io::Result<()> {
    let json = serde_json::to_string_pretty(config)?;
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let temp_path = path.with_extension("json.tmp");

    // Create file with restrictive permissions from the start so it is
    // never briefly world-readable
    #[cfg(unix)]
    {
        use tokio::fs::OpenOptions;
        use tokio::io::AsyncWriteExt;

        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .mode(0o600)
            .open(&temp_path)
            .await?;

        file.write_all(json.as_bytes()).await?;
        file.sync_all().await?;
    }

    #[cfg(not(unix))]
    {
        use tokio::io::AsyncWriteExt;

        let mut file = tokio::fs::File::create(&temp_path).await?;
        file.write_all(json.as_bytes()).await?;
        file.sync_all().await?;
    }

    tokio::fs::rename(&temp_path, path).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::StorageFull {
            std::io::Error::new(
                std::io::ErrorKind::StorageFull,
                "Disk full: cannot save configuration. Free up space and try again.",
            )
        } else {
            e
        }
    })
}

/// Loads the app config with environment overrides applied, or defaults if
/// no config file exists.
pub async fn load_config() -> AppConfig {
    let mut config = match config_path() {
        Some(path) => load_config_from(&path).await,
        None => AppConfig::default(),
    };
    config.apply_env_overrides(|key| std::env::var(key).ok().filter(|v| !v.is_empty()));
    config
}

/// Reads `path`, falling back to defaults when it is missing or unreadable.
pub async fn load_config_from(path: &Path) -> AppConfig {
    match tokio::fs::read_to_string(path).await {
        Ok(json) => match serde_json::from_str::<AppConfig>(&json) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Ignoring malformed config file");
                AppConfig::default()
            }
        },
        Err(_) => AppConfig::default(),
    }
}

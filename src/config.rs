use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::env;
use std::fmt;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const API_KEY_ENV: &str = "ANTHROPIC_API_KEY";
pub const CONFIG_PATH_ENV: &str = "TOKEN_METER_CONFIG";

pub const DEFAULT_REFRESH_SECONDS: u64 = 60;
pub const MIN_REFRESH_SECONDS: u64 = 30;
pub const REFRESH_PRESETS: [u64; 4] = [30, 60, 300, 900];

// Probe timeout must stay below the shortest refresh interval.
pub const DEFAULT_TIMEOUT_SECS: u64 = 15;
pub const MAX_TIMEOUT_SECS: u64 = 25;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("no API key configured (set ANTHROPIC_API_KEY or add api_key to the config file)")]
    MissingCredential,
    #[error("could not determine home directory for the config file")]
    NoHomeDir,
    #[error("failed to access {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("malformed config file {}: {source}", .path.display())]
    Malformed {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("refresh interval must be positive")]
    InvalidRefresh,
}

/// API credential. Debug output is redacted and there is no Display impl,
/// so the key cannot end up in a log line by accident.
#[derive(Clone, PartialEq, Eq)]
pub struct ApiKey(String);

impl ApiKey {
    /// Trims surrounding whitespace; empty input yields `None`.
    pub fn parse(raw: &str) -> Option<Self> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(Self(trimmed.to_string()))
        }
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for ApiKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ApiKey(<redacted>)")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CredentialSource {
    Override,
    Environment,
    File,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub api_key: ApiKey,
    pub refresh_seconds: u64,
    pub key_source: CredentialSource,
}

impl Config {
    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_seconds)
    }
}

// On-disk shape. Both fields optional so a partially written file by hand
// still loads; keys we don't know are carried through rewrites.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
struct ConfigFile {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    api_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    refresh_seconds: Option<u64>,
    #[serde(flatten)]
    extra: serde_json::Map<String, serde_json::Value>,
}

/// 0 is rejected; anything below the minimum is raised to it.
pub fn normalize_refresh(secs: u64) -> Result<u64, ConfigError> {
    if secs == 0 {
        return Err(ConfigError::InvalidRefresh);
    }
    if secs < MIN_REFRESH_SECONDS {
        warn!(
            "refresh_seconds={} below minimum, using {}",
            secs, MIN_REFRESH_SECONDS
        );
        return Ok(MIN_REFRESH_SECONDS);
    }
    if !REFRESH_PRESETS.contains(&secs) {
        info!("refresh_seconds={} is a custom interval", secs);
    }
    Ok(secs)
}

/// `$TOKEN_METER_CONFIG`, else `~/.config/token-meter/config.json`.
pub fn default_config_path() -> Result<PathBuf, ConfigError> {
    if let Some(p) = env::var_os(CONFIG_PATH_ENV).filter(|p| !p.is_empty()) {
        return Ok(PathBuf::from(p));
    }
    let home = dirs::home_dir().ok_or(ConfigError::NoHomeDir)?;
    Ok(home.join(".config").join("token-meter").join("config.json"))
}

/// Precedence: runtime overrides, then the environment (key only), then the
/// config file, then defaults. The file is re-read on every `resolve`.
#[derive(Debug, Clone)]
pub struct ConfigResolver {
    path: PathBuf,
    env_api_key: Option<ApiKey>,
    api_key_override: Option<ApiKey>,
    refresh_override: Option<u64>,
}

impl ConfigResolver {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            env_api_key: None,
            api_key_override: None,
            refresh_override: None,
        }
    }

    /// Resolver for the default path with the key taken from `ANTHROPIC_API_KEY`.
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self::new(default_config_path()?).with_env_api_key(env::var(API_KEY_ENV).ok()))
    }

    pub fn with_env_api_key(mut self, raw: Option<String>) -> Self {
        self.env_api_key = raw.as_deref().and_then(ApiKey::parse);
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn resolve(&self) -> Result<Config, ConfigError> {
        let file = self.read_file()?;
        let (api_key, key_source) = if let Some(k) = &self.api_key_override {
            (k.clone(), CredentialSource::Override)
        } else if let Some(k) = &self.env_api_key {
            (k.clone(), CredentialSource::Environment)
        } else if let Some(k) = file.api_key.as_deref().and_then(ApiKey::parse) {
            (k, CredentialSource::File)
        } else {
            return Err(ConfigError::MissingCredential);
        };
        let refresh_seconds = self.refresh_from(&file)?;
        Ok(Config {
            api_key,
            refresh_seconds,
            key_source,
        })
    }

    /// Interval only; usable before any key exists.
    pub fn refresh_seconds(&self) -> Result<u64, ConfigError> {
        let file = self.read_file()?;
        self.refresh_from(&file)
    }

    /// The override only takes effect once the file write succeeded.
    pub fn update_refresh_seconds(&mut self, secs: u64) -> Result<u64, ConfigError> {
        let secs = normalize_refresh(secs)?;
        self.persist(None, Some(secs))?;
        self.refresh_override = Some(secs);
        info!("refresh interval changed refresh_seconds={}", secs);
        Ok(secs)
    }

    pub fn update_api_key(&mut self, key: ApiKey) -> Result<(), ConfigError> {
        self.persist(Some(&key), None)?;
        self.api_key_override = Some(key);
        info!("api key updated path={}", self.path.display());
        Ok(())
    }

    fn refresh_from(&self, file: &ConfigFile) -> Result<u64, ConfigError> {
        match self.refresh_override.or(file.refresh_seconds) {
            Some(secs) => normalize_refresh(secs),
            None => Ok(DEFAULT_REFRESH_SECONDS),
        }
    }

    fn read_file(&self) -> Result<ConfigFile, ConfigError> {
        let raw = match std::fs::read_to_string(&self.path) {
            Ok(s) => s,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(ConfigFile::default());
            }
            Err(source) => {
                return Err(ConfigError::Io {
                    path: self.path.clone(),
                    source,
                })
            }
        };
        if raw.trim().is_empty() {
            return Ok(ConfigFile::default());
        }
        serde_json::from_str(&raw).map_err(|source| ConfigError::Malformed {
            path: self.path.clone(),
            source,
        })
    }

    // Writes the merged file/override view plus the pending change. A key
    // that only exists in the environment is never copied into the file.
    fn persist(&self, api_key: Option<&ApiKey>, refresh: Option<u64>) -> Result<(), ConfigError> {
        let current = self.read_file()?;
        let out = ConfigFile {
            api_key: api_key
                .or(self.api_key_override.as_ref())
                .map(|k| k.expose().to_string())
                .or(current.api_key),
            refresh_seconds: refresh.or(self.refresh_override).or(current.refresh_seconds),
            extra: current.extra,
        };
        write_atomic(&self.path, &out)
    }
}

// Temp file in the target directory + rename. The temp file is removed on
// drop if anything fails before `persist`, so the existing config is either
// fully replaced or untouched.
fn write_atomic(path: &Path, contents: &ConfigFile) -> Result<(), ConfigError> {
    let io_err = |source: std::io::Error| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    };
    let dir = match path.parent() {
        Some(d) if !d.as_os_str().is_empty() => d.to_path_buf(),
        _ => PathBuf::from("."),
    };
    std::fs::create_dir_all(&dir).map_err(io_err)?;

    // NamedTempFile is created 0600 on unix, which is what a key file wants.
    let mut tmp = tempfile::NamedTempFile::new_in(&dir).map_err(io_err)?;
    serde_json::to_writer_pretty(tmp.as_file_mut(), contents).map_err(|source| {
        ConfigError::Malformed {
            path: path.to_path_buf(),
            source,
        }
    })?;
    tmp.write_all(b"\n").map_err(io_err)?;
    tmp.as_file().sync_all().map_err(io_err)?;
    tmp.persist(path).map_err(|e| io_err(e.error))?;
    Ok(())
}

/// Provider endpoint settings for the probe.
/// Values are sourced from environment variables with sensible defaults.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub api_url: String,
    pub api_version: String,
    pub model: String,
    pub user_agent: String,
    pub timeout_secs: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            api_url: "https://api.anthropic.com".to_string(),
            api_version: "2023-06-01".to_string(),
            model: "claude-sonnet-4-5-20250929".to_string(),
            user_agent: format!("token-meter/{}", env!("CARGO_PKG_VERSION")),
            timeout_secs: DEFAULT_TIMEOUT_SECS,
        }
    }
}

impl ClientConfig {
    /// Load configuration from environment.
    ///
    /// Env vars:
    /// - TOKEN_METER_API_URL (default: https://api.anthropic.com)
    /// - TOKEN_METER_API_VERSION (default: 2023-06-01)
    /// - TOKEN_METER_MODEL (default: claude-sonnet-4-5-20250929)
    /// - TOKEN_METER_HTTP_TIMEOUT_SECS (default: 15, capped at 25)
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let api_url = env::var("TOKEN_METER_API_URL")
            .map(|s| s.trim_end_matches('/').to_string())
            .unwrap_or(defaults.api_url);
        let api_version = env::var("TOKEN_METER_API_VERSION").unwrap_or(defaults.api_version);
        let model = env::var("TOKEN_METER_MODEL").unwrap_or(defaults.model);
        let timeout_secs = env::var("TOKEN_METER_HTTP_TIMEOUT_SECS")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
            .unwrap_or(defaults.timeout_secs);
        Self {
            api_url,
            api_version,
            model,
            user_agent: defaults.user_agent,
            timeout_secs,
        }
        .clamped()
    }

    pub fn with_api_url(mut self, url: impl Into<String>) -> Self {
        self.api_url = url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs.clamp(1, MAX_TIMEOUT_SECS))
    }

    fn clamped(mut self) -> Self {
        if self.timeout_secs > MAX_TIMEOUT_SECS {
            warn!(
                "probe timeout {}s exceeds maximum, using {}s",
                self.timeout_secs, MAX_TIMEOUT_SECS
            );
        }
        self.timeout_secs = self.timeout_secs.clamp(1, MAX_TIMEOUT_SECS);
        self
    }
}

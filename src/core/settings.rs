use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const API_KEY_VAR: &str = "ELECTRICITY_MAPS_API_KEY";
pub const API_BASE_VAR: &str = "ELECTRICITY_MAPS_API_BASE";
pub const POLL_INTERVAL_VAR: &str = "POLL_INTERVAL_MINUTES";
pub const CACHE_FILE_VAR: &str = "CACHE_FILE";
pub const CACHE_TTL_VAR: &str = "CACHE_TTL_MINUTES";
pub const ZONES_VAR: &str = "ZONES";

pub const DEFAULT_API_BASE: &str = "https://api.electricitymap.org";
pub const DEFAULT_CACHE_FILE: &str = "cache/carbon_cache.json";

/// US balancing authorities polled when no override is configured.
pub const DEFAULT_ZONES: [&str; 5] = [
    "US-CAL-CISO",
    "US-TEX-ERCO",
    "US-NY-NYIS",
    "US-MIDA-PJM",
    "US-MIDW-MISO",
];

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub api: ApiSettings,
    pub poll: PollSettings,
    pub cache: CacheSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            api: ApiSettings::default(),
            poll: PollSettings::default(),
            cache: CacheSettings::default(),
        }
    }
}

#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiSettings {
    pub key: Option<String>,
    pub base_url: String,
}

impl Default for ApiSettings {
    fn default() -> Self {
        Self {
            key: None,
            base_url: DEFAULT_API_BASE.to_string(),
        }
    }
}

impl std::fmt::Debug for ApiSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiSettings")
            .field("key", &self.key.as_ref().map(|_| "<redacted>"))
            .field("base_url", &self.base_url)
            .finish()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PollSettings {
    pub interval_minutes: u64,
    pub zones: Vec<String>,
}

impl Default for PollSettings {
    fn default() -> Self {
        Self {
            interval_minutes: 5,
            zones: DEFAULT_ZONES.iter().map(|z| z.to_string()).collect(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    pub file: PathBuf,
    pub ttl_minutes: u64,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            file: PathBuf::from(DEFAULT_CACHE_FILE),
            ttl_minutes: 10,
        }
    }
}

impl Settings {
    pub fn config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("carbon-poller").join("config.toml"))
    }

    /// Defaults, then the TOML file, then the process environment.
    pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
        let mut settings = match explicit_path {
            Some(path) => Self::from_file(path)?,
            None => match Self::config_path() {
                Some(path) if path.exists() => Self::from_file(&path)?,
                path => {
                    tracing::info!(?path, "Config file not found, using defaults");
                    Self::default()
                }
            },
        };

        settings.apply_env(
            std::env::vars_os()
                .filter_map(|(k, v)| Some((k.into_string().ok()?, v.into_string().ok()?))),
        );
        Ok(settings)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let settings: Settings = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        tracing::info!(?path, "Loaded config");
        Ok(settings)
    }

    /// Overlays recognised environment-style keys. Takes any key/value source
    /// so callers never have to touch the real process environment.
    pub fn apply_env<I, K, V>(&mut self, vars: I)
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let vars: HashMap<String, String> = vars
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();

        if let Some(key) = vars.get(API_KEY_VAR) {
            self.api.key = Some(key.clone());
        }
        if let Some(base) = vars.get(API_BASE_VAR).filter(|b| !b.trim().is_empty()) {
            self.api.base_url = base.trim().to_string();
        }
        if let Some(minutes) = parse_minutes(&vars, POLL_INTERVAL_VAR) {
            self.poll.interval_minutes = minutes;
        }
        if let Some(file) = vars.get(CACHE_FILE_VAR).filter(|f| !f.trim().is_empty()) {
            self.cache.file = PathBuf::from(file.trim());
        }
        if let Some(minutes) = parse_minutes(&vars, CACHE_TTL_VAR) {
            self.cache.ttl_minutes = minutes;
        }
        if let Some(raw) = vars.get(ZONES_VAR) {
            let zones = parse_zone_list(raw);
            if !zones.is_empty() {
                self.poll.zones = zones;
            }
        }
    }

    /// The credential, if one was configured and is not blank.
    pub fn api_key(&self) -> Option<&str> {
        self.api
            .key
            .as_deref()
            .map(str::trim)
            .filter(|key| !key.is_empty())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll.interval_minutes.saturating_mul(60))
    }

    pub fn validate(&self) -> Result<()> {
        if self.poll.interval_minutes == 0 {
            anyhow::bail!("poll.interval_minutes must be at least 1");
        }
        if self.cache.ttl_minutes == 0 {
            anyhow::bail!("cache.ttl_minutes must be at least 1");
        }
        if self.poll.zones.is_empty() {
            anyhow::bail!("poll.zones must name at least one zone");
        }
        if self.api.base_url.is_empty() {
            anyhow::bail!("api.base_url must not be empty");
        }
        Ok(())
    }
}

fn parse_minutes(vars: &HashMap<String, String>, key: &str) -> Option<u64> {
    let raw = vars.get(key)?;
    match raw.trim().parse::<u64>() {
        Ok(0) => {
            tracing::warn!(key, value = %raw, "Ignoring zero, must be at least 1 minute");
            None
        }
        Ok(minutes) => Some(minutes),
        Err(e) => {
            tracing::warn!(key, value = %raw, error = %e, "Ignoring invalid number");
            None
        }
    }
}

pub fn parse_zone_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|zone| !zone.is_empty())
        .map(str::to_string)
        .collect()
}

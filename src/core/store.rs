use crate::core::models::{CacheEnvelope, PollResult};
use chrono::{DateTime, Duration, Local};
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache I/O failed for {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to serialize cache document: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("failed to move cache into place at {path}: {source}")]
    Persist {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

// A century; keeps the chrono duration in range.
const MAX_TTL_MINUTES: u64 = 100 * 365 * 24 * 60;

/// Outcome of reading the cache file.
#[derive(Debug, Clone, PartialEq)]
pub enum CacheRead {
    Valid(CacheEnvelope),
    Expired,
    Absent,
}

impl CacheRead {
    #[allow(dead_code)]
    pub fn into_valid(self) -> Option<CacheEnvelope> {
        match self {
            CacheRead::Valid(envelope) => Some(envelope),
            _ => None,
        }
    }
}

/// Single JSON document on disk, stamped with its write time and judged
/// against a TTL when read back.
#[derive(Debug, Clone)]
pub struct CacheStore {
    path: PathBuf,
    ttl: Duration,
    ttl_minutes: u64,
}

impl CacheStore {
    pub fn new(path: impl Into<PathBuf>, ttl_minutes: u64) -> Self {
        Self {
            path: path.into(),
            ttl: Duration::minutes(ttl_minutes.min(MAX_TTL_MINUTES) as i64),
            ttl_minutes,
        }
    }

    #[allow(dead_code)]
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn ttl_minutes(&self) -> u64 {
        self.ttl_minutes
    }

    pub fn read(&self) -> CacheRead {
        self.read_at(Local::now())
    }

    /// Expired once the age reaches the TTL; a write time in the future or one
    /// that cannot be parsed is also expired.
    pub fn read_at(&self, now: DateTime<Local>) -> CacheRead {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = ?self.path, "No cache file");
                return CacheRead::Absent;
            }
            Err(e) => {
                tracing::error!(path = ?self.path, error = %e, "Error reading cache");
                return CacheRead::Absent;
            }
        };

        let envelope = match parse_envelope(&content) {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::error!(path = ?self.path, error = %e, "Cache file is not a valid document");
                return CacheRead::Absent;
            }
        };

        let Some(age) = envelope.age(now) else {
            tracing::warn!(timestamp = %envelope.timestamp, "Cache timestamp unparsable, treating as expired");
            return CacheRead::Expired;
        };

        if age < Duration::zero() {
            tracing::warn!(timestamp = %envelope.timestamp, "Cache timestamp is in the future, treating as expired");
            return CacheRead::Expired;
        }

        if age >= self.ttl {
            tracing::info!(age_secs = age.num_seconds(), "Cache expired");
            return CacheRead::Expired;
        }

        tracing::info!(age_secs = age.num_seconds(), "Cache valid");
        CacheRead::Valid(envelope)
    }

    pub fn write(&self, result: &PollResult) -> Result<CacheEnvelope, CacheError> {
        self.write_at(result, Local::now())
    }

    /// Writes to a sibling temp file and renames it over the destination so a
    /// reader sees either the old document or the new one.
    pub fn write_at(
        &self,
        result: &PollResult,
        now: DateTime<Local>,
    ) -> Result<CacheEnvelope, CacheError> {
        let envelope = CacheEnvelope::new(result.clone(), now, self.ttl_minutes);

        if let Err(e) = self.persist(&envelope) {
            tracing::error!(path = ?self.path, error = %e, "Error writing cache");
            return Err(e);
        }

        tracing::info!(path = ?self.path, zones = result.regions.len(), "Cache written");
        Ok(envelope)
    }

    fn persist(&self, envelope: &CacheEnvelope) -> Result<(), CacheError> {
        let json = serde_json::to_string_pretty(envelope)?;

        let dir = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };

        std::fs::create_dir_all(&dir).map_err(|source| CacheError::Io {
            path: dir.clone(),
            source,
        })?;

        let io_err = |source: std::io::Error| CacheError::Io {
            path: dir.clone(),
            source,
        };

        let mut temp = NamedTempFile::new_in(&dir).map_err(io_err)?;
        temp.write_all(json.as_bytes()).map_err(io_err)?;
        temp.as_file().sync_all().map_err(io_err)?;

        temp.persist(&self.path)
            .map_err(|e| CacheError::Persist {
                path: self.path.clone(),
                source: e.error,
            })?;

        Ok(())
    }
}

/// Older writers nested the result one level deeper under `regions.regions`.
fn parse_envelope(content: &str) -> Result<CacheEnvelope, serde_json::Error> {
    let mut value: serde_json::Value = serde_json::from_str(content)?;

    if let Some(regions) = value.get_mut("regions") {
        if let Some(nested) = regions.get("regions").filter(|n| n.is_object()).cloned() {
            *regions = nested;
        }
    }

    serde_json::from_value(value)
}

mod electricity_maps;

use crate::core::models::ZoneReading;
use async_trait::async_trait;
use std::collections::BTreeSet;
use thiserror::Error;

pub use electricity_maps::ElectricityMapsClient;

/// Why a zone produced no reading this cycle. The poller treats every variant
/// the same way; they differ only in how they are logged.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("no carbon intensity reported for zone {zone}")]
    NoData { zone: String },

    #[error("zone {zone} is not known upstream")]
    ZoneNotFound { zone: String },

    #[error("upstream returned {status}: {body}")]
    Status {
        status: reqwest::StatusCode,
        body: String,
    },

    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("failed to parse response: {0}")]
    Decode(#[from] serde_json::Error),
}

#[async_trait]
pub trait IntensitySource: Send + Sync {
    fn name(&self) -> &'static str;

    /// One bounded request for the latest reading of `zone`, no retries.
    async fn fetch_intensity(&self, zone: &str) -> Result<ZoneReading, FetchError>;

    /// Every zone the upstream knows about. Used for troubleshooting only.
    async fn list_zones(&self) -> Result<BTreeSet<String>, FetchError>;
}

use crate::core::models::{PollResult, ZoneReading};
use crate::core::settings::Settings;
use crate::core::store::{CacheRead, CacheStore};
use crate::providers::IntensitySource;
use anyhow::{Context, Result};
use futures::FutureExt;
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

pub const INTER_ZONE_PAUSE: Duration = Duration::from_millis(500);
pub const FAILURE_COOLDOWN: Duration = Duration::from_secs(60);
const ZONE_SAMPLE_SIZE: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollerState {
    Idle,
    Polling,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CycleOutcome {
    Written { zones: usize, best: Option<String> },
    WriteFailed { zones: usize },
    NoData,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollTiming {
    pub interval: Duration,
    pub zone_pause: Duration,
    pub cooldown: Duration,
}

impl PollTiming {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            zone_pause: INTER_ZONE_PAUSE,
            cooldown: FAILURE_COOLDOWN,
        }
    }
}

/// Drives poll cycles: every configured zone once, rank what came back, then
/// replace the cache file. One cycle at a time.
pub struct Poller {
    source: Arc<dyn IntensitySource>,
    store: CacheStore,
    zones: Vec<String>,
    timing: PollTiming,
    state: PollerState,
}

impl Poller {
    pub fn new(
        source: Arc<dyn IntensitySource>,
        store: CacheStore,
        zones: Vec<String>,
        timing: PollTiming,
    ) -> Self {
        Self {
            source,
            store,
            zones,
            timing,
            state: PollerState::Idle,
        }
    }

    pub fn from_settings(source: Arc<dyn IntensitySource>, settings: &Settings) -> Self {
        Self::new(
            source,
            CacheStore::new(&settings.cache.file, settings.cache.ttl_minutes),
            settings.poll.zones.clone(),
            PollTiming::new(settings.poll_interval()),
        )
    }

    pub fn state(&self) -> PollerState {
        self.state
    }

    #[allow(dead_code)]
    pub fn store(&self) -> &CacheStore {
        &self.store
    }

    pub fn log_cache_state(&self) {
        match self.store.read() {
            CacheRead::Valid(envelope) => {
                tracing::info!(
                    written = %envelope.timestamp,
                    best = ?envelope.result.best_region,
                    zones = envelope.result.regions.len(),
                    "Existing cache is still valid"
                );
            }
            CacheRead::Expired => {
                tracing::info!(ttl_minutes = self.store.ttl_minutes(), "Existing cache has expired")
            }
            CacheRead::Absent => tracing::info!("No usable cache yet"),
        }
    }

    /// Polls until `shutdown` resolves. The first cycle starts immediately.
    pub async fn run<F>(&mut self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);

        loop {
            let delay = tokio::select! {
                delay = self.guarded_cycle() => delay,
                _ = &mut shutdown => break,
            };

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = &mut shutdown => break,
            }
        }

        self.state = PollerState::Idle;
        tracing::info!("Poller stopped");
    }

    /// Runs one cycle and decides how long to wait before the next. Errors and
    /// panics out of the cycle get the short cool-down instead of the interval.
    async fn guarded_cycle(&mut self) -> Duration {
        let outcome = AssertUnwindSafe(self.run_cycle()).catch_unwind().await;
        if self.state() == PollerState::Polling {
            tracing::debug!("Cycle unwound mid-poll, resetting poller to idle");
            self.state = PollerState::Idle;
        }

        match outcome {
            Ok(Ok(outcome)) => {
                tracing::debug!(?outcome, next_in_secs = self.timing.interval.as_secs(), "Cycle finished");
                self.timing.interval
            }
            Ok(Err(e)) => {
                tracing::error!(
                    error = ?e,
                    cooldown_secs = self.timing.cooldown.as_secs(),
                    "Poll cycle failed"
                );
                self.timing.cooldown
            }
            Err(panic) => {
                tracing::error!(
                    panic = %panic_message(panic.as_ref()),
                    cooldown_secs = self.timing.cooldown.as_secs(),
                    "Poll cycle panicked"
                );
                self.timing.cooldown
            }
        }
    }

    pub async fn run_cycle(&mut self) -> Result<CycleOutcome> {
        self.state = PollerState::Polling;
        let outcome = self.poll_zones().await;
        self.state = PollerState::Idle;
        outcome
    }

    async fn poll_zones(&self) -> Result<CycleOutcome> {
        tracing::info!(count = self.zones.len(), zones = ?self.zones, "Polling carbon intensity");

        let readings = self.collect_readings().await;

        if readings.is_empty() {
            tracing::error!("No data retrieved, cache not updated");
            return Ok(CycleOutcome::NoData);
        }

        let result = PollResult::from_readings(readings);
        let zones = result.regions.len();
        let best = result.best_region.clone();

        if let (Some(best), Some(worst)) = (result.best_reading(), result.worst_reading()) {
            tracing::info!(
                best = %best.zone,
                best_intensity = best.carbon_intensity,
                worst = %worst.zone,
                worst_intensity = worst.carbon_intensity,
                "Ranked zones"
            );
        }

        let store = self.store.clone();
        let written = tokio::task::spawn_blocking(move || store.write(&result))
            .await
            .context("Cache write task did not complete")?;

        match written {
            Ok(_) => {
                tracing::info!(zones, best = ?best, "Cache updated");
                Ok(CycleOutcome::Written { zones, best })
            }
            Err(_) => Ok(CycleOutcome::WriteFailed { zones }),
        }
    }

    async fn collect_readings(&self) -> Vec<ZoneReading> {
        let mut readings = Vec::with_capacity(self.zones.len());
        let mut diagnosed = false;

        for (index, zone) in self.zones.iter().enumerate() {
            if index > 0 {
                tokio::time::sleep(self.timing.zone_pause).await;
            }

            match self.source.fetch_intensity(zone).await {
                Ok(reading) => {
                    tracing::info!(
                        zone = %zone,
                        intensity = reading.carbon_intensity,
                        "Carbon intensity (gCO2eq/kWh)"
                    );
                    readings.push(reading);
                }
                Err(e) => {
                    tracing::warn!(zone = %zone, error = %e, "Failed to fetch data for zone");
                    if !diagnosed {
                        diagnosed = true;
                        self.log_known_zones().await;
                    }
                }
            }
        }

        readings
    }

    async fn log_known_zones(&self) {
        match self.source.list_zones().await {
            Ok(zones) => {
                let sample: Vec<&str> = zones
                    .iter()
                    .take(ZONE_SAMPLE_SIZE)
                    .map(String::as_str)
                    .collect();
                tracing::info!(
                    source = self.source.name(),
                    total = zones.len(),
                    ?sample,
                    "Known zones, see https://portal.electricitymaps.com/zones for the full list"
                );
            }
            Err(e) => {
                tracing::debug!(error = %e, "Could not fetch zone list");
            }
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

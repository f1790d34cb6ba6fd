use chrono::{DateTime, Local, NaiveDateTime, SecondsFormat, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;

/// Latest carbon intensity for one zone, as fetched during a single cycle.
///
/// Field names follow the upstream camelCase shape because the downstream
/// scheduler reads them from the cache file as-is.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ZoneReading {
    pub zone: String,
    /// gCO2eq/kWh
    pub carbon_intensity: f64,
    #[serde(default)]
    pub datetime: Option<DateTime<Utc>>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub emission_factor_type: Option<String>,
    #[serde(default)]
    pub is_estimated: bool,
    #[serde(default)]
    pub estimation_method: Option<String>,
    #[serde(rename = "timestamp", with = "local_timestamp")]
    pub retrieved_at: DateTime<Local>,
}

/// One cycle's readings plus the derived cleanliness ranking.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PollResult {
    pub regions: BTreeMap<String, ZoneReading>,
    pub sorted_by_carbon: Vec<String>,
    pub best_region: Option<String>,
    pub worst_region: Option<String>,
}

impl PollResult {
    /// Ranks readings ascending by intensity. Ties keep the order in which the
    /// readings were collected; a repeated zone keeps its first reading.
    pub fn from_readings(readings: Vec<ZoneReading>) -> Self {
        let mut regions = BTreeMap::new();
        let mut ranked: Vec<(String, f64)> = Vec::with_capacity(readings.len());

        for reading in readings {
            if regions.contains_key(&reading.zone) {
                tracing::debug!(zone = %reading.zone, "Duplicate zone reading ignored");
                continue;
            }
            ranked.push((reading.zone.clone(), reading.carbon_intensity));
            regions.insert(reading.zone.clone(), reading);
        }

        // slice::sort_by is stable
        ranked.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(Ordering::Equal));

        let sorted_by_carbon: Vec<String> = ranked.into_iter().map(|(zone, _)| zone).collect();

        Self {
            best_region: sorted_by_carbon.first().cloned(),
            worst_region: sorted_by_carbon.last().cloned(),
            regions,
            sorted_by_carbon,
        }
    }

    pub fn best_reading(&self) -> Option<&ZoneReading> {
        self.best_region.as_ref().and_then(|zone| self.regions.get(zone))
    }

    pub fn worst_reading(&self) -> Option<&ZoneReading> {
        self.worst_region.as_ref().and_then(|zone| self.regions.get(zone))
    }
}

/// The document written to the cache file. The poll result is flattened so
/// `regions` and the ranking sit at the top level next to `timestamp`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEnvelope {
    pub timestamp: String,
    pub ttl_minutes: u64,
    #[serde(flatten)]
    pub result: PollResult,
}

impl CacheEnvelope {
    pub fn new(result: PollResult, written_at: DateTime<Local>, ttl_minutes: u64) -> Self {
        Self {
            timestamp: format_local_timestamp(&written_at),
            ttl_minutes,
            result,
        }
    }

    pub fn written_at(&self) -> Option<DateTime<Local>> {
        parse_local_timestamp(&self.timestamp)
    }

    /// `None` when the timestamp cannot be parsed.
    pub fn age(&self, now: DateTime<Local>) -> Option<chrono::Duration> {
        self.written_at().map(|written| now.signed_duration_since(written))
    }
}

pub fn format_local_timestamp(at: &DateTime<Local>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, false)
}

/// Accepts RFC 3339 as well as offset-less ISO-8601 local times, which older
/// cache files carry.
pub fn parse_local_timestamp(value: &str) -> Option<DateTime<Local>> {
    if let Ok(parsed) = DateTime::parse_from_rfc3339(value) {
        return Some(parsed.with_timezone(&Local));
    }

    let naive = NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S%.f").ok()?;
    Local.from_local_datetime(&naive).earliest()
}

mod local_timestamp {
    use super::{format_local_timestamp, parse_local_timestamp};
    use chrono::{DateTime, Local};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(at: &DateTime<Local>, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format_local_timestamp(at))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<DateTime<Local>, D::Error> {
        let raw = String::deserialize(deserializer)?;
        parse_local_timestamp(&raw)
            .ok_or_else(|| serde::de::Error::custom(format!("invalid timestamp: {raw}")))
    }
}

#[cfg(test)]
pub(crate) fn test_reading(zone: &str, carbon_intensity: f64) -> ZoneReading {
    ZoneReading {
        zone: zone.to_string(),
        carbon_intensity,
        datetime: Some(Utc.with_ymd_and_hms(2026, 1, 18, 15, 0, 0).unwrap()),
        updated_at: None,
        created_at: None,
        emission_factor_type: Some("lifecycle".to_string()),
        is_estimated: false,
        estimation_method: None,
        retrieved_at: Local.with_ymd_and_hms(2026, 1, 18, 10, 0, 5).unwrap(),
    }
}

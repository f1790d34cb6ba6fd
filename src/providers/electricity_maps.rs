use crate::core::models::ZoneReading;
use crate::providers::{FetchError, IntensitySource};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Local, SubsecRound, Utc};
use reqwest::header::{HeaderMap, HeaderValue};
use reqwest::StatusCode;
use serde::{Deserialize, Deserializer};
use std::collections::{BTreeSet, HashMap};
use std::time::Duration;

const AUTH_HEADER: &str = "auth-token";
const LATEST_PATH: &str = "/v3/carbon-intensity/latest";
const ZONES_PATH: &str = "/v3/zones";
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LatestResponse {
    #[serde(default)]
    carbon_intensity: Option<f64>,
    #[serde(default, deserialize_with = "lenient_timestamp")]
    datetime: Option<DateTime<Utc>>,
    #[serde(default, deserialize_with = "lenient_timestamp")]
    updated_at: Option<DateTime<Utc>>,
    #[serde(default, deserialize_with = "lenient_timestamp")]
    created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    emission_factor_type: Option<String>,
    #[serde(default)]
    is_estimated: Option<bool>,
    #[serde(default)]
    estimation_method: Option<String>,
}

/// Upstream timestamps are informational. One that is not RFC 3339 is
/// dropped rather than failing the whole reading.
fn lenient_timestamp<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(match raw {
        Some(serde_json::Value::String(text)) => DateTime::parse_from_rfc3339(&text)
            .map(|parsed| parsed.with_timezone(&Utc))
            .ok(),
        _ => None,
    })
}

impl LatestResponse {
    fn into_reading(
        self,
        zone: &str,
        retrieved_at: DateTime<Local>,
    ) -> Result<ZoneReading, FetchError> {
        let carbon_intensity = match self.carbon_intensity {
            Some(value) if value.is_finite() && value >= 0.0 => value,
            _ => {
                return Err(FetchError::NoData {
                    zone: zone.to_string(),
                })
            }
        };

        Ok(ZoneReading {
            zone: zone.to_string(),
            carbon_intensity,
            datetime: self.datetime,
            updated_at: self.updated_at,
            created_at: self.created_at,
            emission_factor_type: self.emission_factor_type,
            is_estimated: self.is_estimated.unwrap_or(false),
            estimation_method: self.estimation_method,
            retrieved_at,
        })
    }
}

/// Electricity Maps client. Holds one connection pool with the credential
/// header baked in.
pub struct ElectricityMapsClient {
    client: reqwest::Client,
    base_url: String,
}

impl ElectricityMapsClient {
    pub fn new(api_key: &str, base_url: &str) -> Result<Self> {
        Self::with_timeout(api_key, base_url, REQUEST_TIMEOUT)
    }

    pub fn with_timeout(api_key: &str, base_url: &str, timeout: Duration) -> Result<Self> {
        let mut token =
            HeaderValue::from_str(api_key).context("API key is not a valid header value")?;
        token.set_sensitive(true);

        let mut headers = HeaderMap::new();
        headers.insert(AUTH_HEADER, token);

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(timeout)
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    async fn request_latest(&self, zone: &str) -> Result<ZoneReading, FetchError> {
        let response = self
            .client
            .get(format!("{}{}", self.base_url, LATEST_PATH))
            .query(&[("zone", zone)])
            .send()
            .await?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Err(FetchError::ZoneNotFound {
                zone: zone.to_string(),
            });
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(FetchError::Status { status, body });
        }

        let body = response.text().await?;
        let latest: LatestResponse = serde_json::from_str(&body)?;

        // Micro precision matches what the cache file can carry.
        latest.into_reading(zone, Local::now().trunc_subsecs(6))
    }
}

#[async_trait]
impl IntensitySource for ElectricityMapsClient {
    fn name(&self) -> &'static str {
        "Electricity Maps"
    }

    async fn fetch_intensity(&self, zone: &str) -> Result<ZoneReading, FetchError> {
        let result = self.request_latest(zone).await;

        match &result {
            Ok(reading) => {
                tracing::debug!(zone, intensity = reading.carbon_intensity, "Fetched carbon intensity");
            }
            Err(FetchError::NoData { .. }) => {
                tracing::warn!(zone, "No carbon intensity data for zone");
            }
            Err(FetchError::ZoneNotFound { .. }) => {
                tracing::warn!(zone, "Zone not found upstream, check the zone code");
            }
            Err(e) => {
                tracing::error!(zone, error = %e, "Error fetching carbon intensity");
            }
        }

        result
    }

    async fn list_zones(&self) -> Result<BTreeSet<String>, FetchError> {
        let response = self
            .client
            .get(format!("{}{}", self.base_url, ZONES_PATH))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(FetchError::Status { status, body });
        }

        let body = response.text().await?;
        let zones: HashMap<String, serde_json::Value> = serde_json::from_str(&body)?;

        tracing::info!(count = zones.len(), "Retrieved zone list");
        Ok(zones.into_keys().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;
    use serde_json::json;

    fn client_for(server: &MockServer) -> ElectricityMapsClient {
        ElectricityMapsClient::new("test-key", &server.base_url()).unwrap()
    }

    #[tokio::test]
    async fn test_fetch_intensity_success() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(GET)
                    .path("/v3/carbon-intensity/latest")
                    .query_param("zone", "US-CAL-CISO")
                    .header("auth-token", "test-key");
                then.status(200).json_body(json!({
                    "zone": "US-CAL-CISO",
                    "carbonIntensity": 215,
                    "datetime": "2026-01-18T15:00:00.000Z",
                    "updatedAt": "2026-01-18T14:52:10.120Z",
                    "createdAt": "2026-01-15T15:01:02.000Z",
                    "emissionFactorType": "lifecycle",
                    "isEstimated": true,
                    "estimationMethod": "TIME_SLICER_AVERAGE"
                }));
            })
            .await;

        let reading = client_for(&server)
            .fetch_intensity("US-CAL-CISO")
            .await
            .expect("Reading should be returned");

        mock.assert_async().await;
        assert_eq!(reading.zone, "US-CAL-CISO");
        assert!((reading.carbon_intensity - 215.0).abs() < f64::EPSILON);
        assert!(reading.is_estimated);
        assert_eq!(reading.estimation_method.as_deref(), Some("TIME_SLICER_AVERAGE"));
        assert_eq!(reading.emission_factor_type.as_deref(), Some("lifecycle"));
        assert!(reading.datetime.is_some());
        assert!(reading.updated_at.is_some());
    }

    #[tokio::test]
    async fn test_null_intensity_is_no_data() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/v3/carbon-intensity/latest");
                then.status(200).json_body(json!({
                    "zone": "US-NY-NYIS",
                    "carbonIntensity": null,
                    "datetime": "2026-01-18T15:00:00.000Z"
                }));
            })
            .await;

        let result = client_for(&server).fetch_intensity("US-NY-NYIS").await;
        assert!(matches!(result, Err(FetchError::NoData { .. })));
    }

    #[tokio::test]
    async fn test_missing_intensity_is_no_data() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/v3/carbon-intensity/latest");
                then.status(200).json_body(json!({ "zone": "DE" }));
            })
            .await;

        let result = client_for(&server).fetch_intensity("DE").await;
        assert!(matches!(result, Err(FetchError::NoData { .. })));
    }

    #[tokio::test]
    async fn test_negative_intensity_is_no_data() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/v3/carbon-intensity/latest");
                then.status(200).json_body(json!({ "carbonIntensity": -4.0 }));
            })
            .await;

        let result = client_for(&server).fetch_intensity("DE").await;
        assert!(matches!(result, Err(FetchError::NoData { .. })));
    }

    #[tokio::test]
    async fn test_odd_timestamps_keep_reading() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/v3/carbon-intensity/latest");
                then.status(200).json_body(json!({
                    "carbonIntensity": 98.5,
                    "datetime": "18/01/2026 15:00",
                    "updatedAt": 1768748400,
                    "createdAt": "2026-01-15T15:01:02.000Z"
                }));
            })
            .await;

        let reading = client_for(&server)
            .fetch_intensity("FR")
            .await
            .expect("Intensity should survive a bad timestamp");

        assert!((reading.carbon_intensity - 98.5).abs() < f64::EPSILON);
        assert!(reading.datetime.is_none());
        assert!(reading.updated_at.is_none());
        assert!(reading.created_at.is_some());
    }

    #[tokio::test]
    async fn test_not_found_is_zone_not_found() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/v3/carbon-intensity/latest");
                then.status(404).body("zone not found");
            })
            .await;

        let result = client_for(&server).fetch_intensity("US-TEX-ERCOT").await;
        match result {
            Err(FetchError::ZoneNotFound { zone }) => assert_eq!(zone, "US-TEX-ERCOT"),
            other => panic!("expected ZoneNotFound, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_server_error_is_status() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/v3/carbon-intensity/latest");
                then.status(503).body("maintenance");
            })
            .await;

        let result = client_for(&server).fetch_intensity("DE").await;
        match result {
            Err(FetchError::Status { status, body }) => {
                assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
                assert_eq!(body, "maintenance");
            }
            other => panic!("expected Status, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_malformed_body_is_decode_error() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/v3/carbon-intensity/latest");
                then.status(200).body("<html>oops</html>");
            })
            .await;

        let result = client_for(&server).fetch_intensity("DE").await;
        assert!(matches!(result, Err(FetchError::Decode(_))));
    }

    #[tokio::test]
    async fn test_slow_upstream_times_out() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/v3/carbon-intensity/latest");
                then.status(200)
                    .delay(Duration::from_secs(2))
                    .json_body(json!({ "carbonIntensity": 100.0 }));
            })
            .await;

        let client = ElectricityMapsClient::with_timeout(
            "test-key",
            &server.base_url(),
            Duration::from_millis(200),
        )
        .unwrap();

        let result = client.fetch_intensity("DE").await;
        match result {
            Err(FetchError::Request(e)) => assert!(e.is_timeout()),
            other => panic!("expected timeout, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_list_zones_returns_keys() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(GET).path("/v3/zones").header("auth-token", "test-key");
                then.status(200).json_body(json!({
                    "DE": { "zoneName": "Germany" },
                    "FR": { "zoneName": "France" },
                    "US-CAL-CISO": { "zoneName": "California ISO" }
                }));
            })
            .await;

        let zones = client_for(&server).list_zones().await.unwrap();

        mock.assert_async().await;
        let zones: Vec<String> = zones.into_iter().collect();
        assert_eq!(zones, vec!["DE", "FR", "US-CAL-CISO"]);
    }

    #[tokio::test]
    async fn test_list_zones_error_status() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/v3/zones");
                then.status(401).body("bad token");
            })
            .await;

        let result = client_for(&server).list_zones().await;
        assert!(matches!(result, Err(FetchError::Status { .. })));
    }

    #[test]
    fn test_invalid_api_key_is_rejected() {
        assert!(ElectricityMapsClient::new("bad\nkey", "http://localhost").is_err());
    }

    #[test]
    fn test_base_url_trailing_slash_is_trimmed() {
        let client = ElectricityMapsClient::new("k", "http://localhost:9000/").unwrap();
        assert_eq!(client.base_url, "http://localhost:9000");
    }
}

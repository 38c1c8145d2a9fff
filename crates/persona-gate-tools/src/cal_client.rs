//! Scheduling-provider REST client with a bounded retry policy.

use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::{anyhow, Context};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use persona_gate_core::config::Config;

const DEFAULT_BASE_URL: &str = "https://api.cal.com/v2";
const API_VERSION_HEADER: &str = "cal-api-version";
const API_VERSION: &str = "2024-08-13";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Explicit bounded-retry policy, parameterized per client.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Retries beyond the first attempt.
    pub max_retries: u32,
    pub base_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_backoff: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    /// Exponential backoff: 2x, 4x, 8x the base.
    fn backoff(&self, attempt: u32) -> Duration {
        self.base_backoff * 2u32.saturating_pow(attempt + 1)
    }
}

pub struct CalendarClient {
    base_url: String,
    api_key: Option<String>,
    event_type_id: Option<u64>,
    retry: RetryPolicy,
    http: reqwest::Client,
}

impl CalendarClient {
    pub fn new(
        base_url: impl Into<String>,
        api_key: Option<String>,
        event_type_id: Option<u64>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key,
            event_type_id,
            retry,
            http: reqwest::Client::new(),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        let calendar = config.calendar.as_ref();
        Self::new(
            calendar
                .and_then(|c| c.base_url.clone())
                .unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            calendar.and_then(|c| c.resolve_api_key()),
            calendar.and_then(|c| c.event_type_id),
            RetryPolicy::default(),
        )
    }

    fn api_key(&self) -> anyhow::Result<&str> {
        self.api_key
            .as_deref()
            .ok_or_else(|| anyhow!("scheduling API key is not configured"))
    }

    fn event_type_id(&self) -> anyhow::Result<u64> {
        self.event_type_id
            .ok_or_else(|| anyhow!("scheduling event type id is not configured"))
    }

    /// Send a request, retrying timeouts and connection failures with
    /// exponential backoff. Other failures are returned immediately.
    async fn send_with_retry(
        &self,
        request: reqwest::RequestBuilder,
    ) -> anyhow::Result<reqwest::Response> {
        let mut last_err: Option<reqwest::Error> = None;

        for attempt in 0..=self.retry.max_retries {
            let attempt_request = request
                .try_clone()
                .context("scheduling API request is not retryable")?;

            match attempt_request.send().await {
                Ok(response) => return Ok(response),
                Err(e) if (e.is_timeout() || e.is_connect()) && attempt < self.retry.max_retries => {
                    let backoff = self.retry.backoff(attempt);
                    warn!(
                        attempt = attempt + 1,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %e,
                        "Scheduling API request failed, retrying"
                    );
                    last_err = Some(e);
                    tokio::time::sleep(backoff).await;
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(anyhow!(
            "scheduling API request failed after {} attempts: {}",
            self.retry.max_retries + 1,
            last_err.map(|e| e.to_string()).unwrap_or_default()
        ))
    }

    async fn read_json<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> anyhow::Result<T> {
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let message = serde_json::from_str::<serde_json::Value>(&body)
                .ok()
                .and_then(|v| {
                    v.get("message")
                        .or_else(|| v.get("error"))
                        .and_then(|m| m.as_str().map(String::from))
                })
                .unwrap_or(body);
            return Err(anyhow!("scheduling API error: {status} - {message}"));
        }
        Ok(response.json().await?)
    }

    /// Fetch available slots between two UTC instants (RFC 3339 strings).
    pub async fn available_slots(
        &self,
        start: &str,
        end: &str,
    ) -> anyhow::Result<SlotsResponse> {
        let key = self.api_key()?.to_string();
        let event_type_id = self.event_type_id()?;

        debug!(%start, %end, event_type_id, "Requesting scheduling slots");

        let request = self
            .http
            .get(format!("{}/slots/available", self.base_url))
            .timeout(REQUEST_TIMEOUT)
            .bearer_auth(key)
            .header(API_VERSION_HEADER, API_VERSION)
            .query(&[
                ("eventTypeId", event_type_id.to_string()),
                ("startTime", start.to_string()),
                ("endTime", end.to_string()),
                ("format", "range".to_string()),
            ]);

        let response = self.send_with_retry(request).await?;
        Self::read_json(response).await
    }

    /// Create a booking.
    pub async fn create_booking(
        &self,
        booking: &BookingRequest,
    ) -> anyhow::Result<BookingResponse> {
        let key = self.api_key()?.to_string();

        debug!(start = %booking.start, "Creating booking");

        let request = self
            .http
            .post(format!("{}/bookings", self.base_url))
            .timeout(REQUEST_TIMEOUT)
            .bearer_auth(key)
            .header(API_VERSION_HEADER, API_VERSION)
            .json(booking);

        let response = self.send_with_retry(request).await?;
        Self::read_json(response).await
    }
}

// --- Wire types ---

#[derive(Debug, Deserialize)]
pub struct SlotsResponse {
    pub status: String,
    #[serde(default)]
    pub data: Option<SlotsData>,
}

impl SlotsResponse {
    /// Slots keyed by provider-reported date, or empty when absent.
    pub fn slots(&self) -> BTreeMap<String, Vec<Slot>> {
        self.data.as_ref().map(|d| d.slots.clone()).unwrap_or_default()
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct SlotsData {
    #[serde(default)]
    pub slots: BTreeMap<String, Vec<Slot>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Slot {
    pub time: String,
}

#[derive(Debug, Serialize)]
pub struct BookingRequest {
    pub start: String,
    #[serde(rename = "eventTypeId")]
    pub event_type_id: u64,
    pub attendee: Attendee,
    pub metadata: serde_json::Value,
}

#[derive(Debug, Serialize)]
pub struct Attendee {
    pub name: String,
    pub email: String,
    #[serde(rename = "timeZone")]
    pub time_zone: String,
}

#[derive(Debug, Deserialize)]
pub struct BookingResponse {
    pub status: String,
    #[serde(default)]
    pub data: Option<BookingData>,
}

#[derive(Debug, Deserialize)]
pub struct BookingData {
    pub uid: String,
    #[serde(default)]
    pub start: Option<String>,
}

impl CalendarClient {
    pub fn booking_request(
        &self,
        start: String,
        attendee: Attendee,
        metadata: serde_json::Value,
    ) -> anyhow::Result<BookingRequest> {
        Ok(BookingRequest {
            start,
            event_type_id: self.event_type_id()?,
            attendee,
            metadata,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_per_attempt() {
        let policy = RetryPolicy {
            max_retries: 3,
            base_backoff: Duration::from_secs(1),
        };
        assert_eq!(policy.backoff(0), Duration::from_secs(2));
        assert_eq!(policy.backoff(1), Duration::from_secs(4));
        assert_eq!(policy.backoff(2), Duration::from_secs(8));
    }

    #[test]
    fn slots_response_defaults_to_empty() {
        let response: SlotsResponse =
            serde_json::from_str(r#"{"status": "success"}"#).unwrap();
        assert!(response.slots().is_empty());
    }

    #[test]
    fn slots_response_parses_provider_shape() {
        let raw = r#"{
            "status": "success",
            "data": {
                "slots": {
                    "2030-01-10": [
                        {"time": "2030-01-10T01:00:00.000Z"},
                        {"time": "2030-01-10T01:15:00.000Z"}
                    ]
                }
            }
        }"#;
        let response: SlotsResponse = serde_json::from_str(raw).unwrap();
        let slots = response.slots();
        assert_eq!(slots.len(), 1);
        assert_eq!(slots["2030-01-10"].len(), 2);
    }

    #[test]
    fn missing_api_key_is_a_configuration_error() {
        let client = CalendarClient::new(DEFAULT_BASE_URL, None, Some(1), RetryPolicy::default());
        assert!(client.api_key().is_err());
    }
}

//! Scheduling-provider webhook receiver.
//!
//! Bookings can change outside any chat turn (reschedules, cancellations),
//! so the provider pushes events here. Signature verification is
//! HMAC-SHA256 over the raw body. Log fields carry booking uids, never
//! attendee names or emails.

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use hmac::{Hmac, Mac};
use serde::Deserialize;
use serde_json::json;
use sha2::Sha256;
use tracing::{debug, info, warn};

use crate::state::AppState;

type HmacSha256 = Hmac<Sha256>;

const SIGNATURE_HEADER: &str = "x-cal-signature-256";

#[derive(Debug, Deserialize)]
struct WebhookPayload {
    #[serde(rename = "triggerEvent")]
    trigger_event: String,
    #[serde(default)]
    payload: serde_json::Value,
}

/// POST /webhooks/calendar
pub async fn calendar_webhook(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let Some(secret) = state
        .config
        .calendar
        .as_ref()
        .and_then(|c| c.resolve_webhook_secret())
    else {
        warn!("Webhook received but no webhook secret is configured");
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": "Webhook secret not configured" })),
        )
            .into_response();
    };

    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|value| value.to_str().ok());
    if !verify_signature(&body, signature, &secret) {
        warn!("Webhook signature verification failed");
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({ "error": "Invalid signature" })),
        )
            .into_response();
    }

    let payload: WebhookPayload = match serde_json::from_slice(&body) {
        Ok(payload) => payload,
        Err(e) => {
            warn!(error = %e, "Webhook payload did not parse");
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({ "error": "Invalid payload" })),
            )
                .into_response();
        }
    };

    handle_event(&payload);
    (StatusCode::OK, Json(json!({ "received": true }))).into_response()
}

fn verify_signature(body: &[u8], signature: Option<&str>, secret: &str) -> bool {
    let Some(signature) = signature else {
        return false;
    };

    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key length");
    mac.update(body);
    let digest = hex::encode(mac.finalize().into_bytes());
    digest == signature
}

fn handle_event(event: &WebhookPayload) {
    let booking_uid = event
        .payload
        .pointer("/booking/uid")
        .and_then(|value| value.as_str())
        .unwrap_or("unknown");
    let start = event
        .payload
        .pointer("/booking/start")
        .and_then(|value| value.as_str())
        .unwrap_or("unknown");

    match event.trigger_event.as_str() {
        "BOOKING_CREATED" => info!(%booking_uid, %start, "Booking created"),
        "BOOKING_RESCHEDULED" => info!(%booking_uid, %start, "Booking rescheduled"),
        "BOOKING_CANCELLED" => info!(%booking_uid, "Booking cancelled"),
        other => debug!(event = %other, %booking_uid, "Unhandled webhook event"),
    }
}

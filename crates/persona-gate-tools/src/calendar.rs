//! Calendar bridge operations — current time, availability, booking.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Duration, NaiveDate, SecondsFormat, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::debug;

use crate::cal_client::{Attendee, Slot};
use crate::{Tool, ToolContext, ToolOutput};

/// Availability result with the conversational summary and the exact UTC
/// timestamps kept as two separate fields. `display` is what the agent
/// relays to the user; `booking_refs` exist only so the agent can copy an
/// exact timestamp into a later `book_meeting` call. The fields are never
/// merged into one string.
#[derive(Debug, Serialize)]
pub struct SlotListing {
    pub display: String,
    pub booking_refs: Vec<BookingRef>,
}

#[derive(Debug, Serialize)]
pub struct BookingRef {
    pub day: String,
    pub local_time: String,
    pub utc: String,
}

/// Tool: current date/time in the display timezone.
pub struct CurrentDateTimeTool;

#[async_trait]
impl Tool for CurrentDateTimeTool {
    fn name(&self) -> &str {
        "get_current_datetime"
    }

    fn description(&self) -> &str {
        "Get the current date and time in the host's timezone. Use this to \
         know what 'today' is before checking availability or booking meetings."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {}
        })
    }

    async fn execute(
        &self,
        _params: serde_json::Value,
        context: &ToolContext,
    ) -> anyhow::Result<ToolOutput> {
        let tz = context.display_timezone();
        let now = Utc::now().with_timezone(&tz);

        // Safe window hints: start two days out so the minimum-notice rule
        // can never reject a suggested date.
        let safe_start = now + Duration::days(2);
        let suggested_end = safe_start + Duration::days(14);

        let payload = json!({
            "current_date": now.format("%Y-%m-%d").to_string(),
            "current_time": now.format("%H:%M:%S").to_string(),
            "timezone": tz.name(),
            "current_date_time": now.format("%A, %-d %B %Y at %-I:%M %P").to_string(),
            "safe_start_date": safe_start.format("%Y-%m-%d").to_string(),
            "suggested_end_date": suggested_end.format("%Y-%m-%d").to_string(),
        });

        Ok(ToolOutput::text(serde_json::to_string(&payload)?))
    }
}

/// Tool: check meeting availability.
pub struct CheckAvailabilityTool;

#[derive(Deserialize)]
struct AvailabilityParams {
    #[serde(default)]
    start_date: Option<String>,
    #[serde(default)]
    end_date: Option<String>,
    #[serde(default)]
    timezone: Option<String>,
}

#[async_trait]
impl Tool for CheckAvailabilityTool {
    fn name(&self) -> &str {
        "check_meeting_availability"
    }

    fn description(&self) -> &str {
        "Check available meeting slots. By default checks the next two weeks \
         starting just past the minimum-notice window. Only provide dates if \
         the user requests a specific range."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "start_date": {
                    "type": "string",
                    "description": "Optional start date in YYYY-MM-DD format. Defaults to the earliest bookable day."
                },
                "end_date": {
                    "type": "string",
                    "description": "Optional end date in YYYY-MM-DD format. Defaults to two weeks from start."
                },
                "timezone": {
                    "type": "string",
                    "description": "Optional IANA timezone for displaying slots."
                }
            }
        })
    }

    async fn execute(
        &self,
        params: serde_json::Value,
        context: &ToolContext,
    ) -> anyhow::Result<ToolOutput> {
        let p: AvailabilityParams = serde_json::from_value(params)?;
        let tz = p
            .timezone
            .as_deref()
            .and_then(|t| t.parse::<Tz>().ok())
            .unwrap_or_else(|| context.display_timezone());

        let now = Utc::now();
        let min_lead_hours = context.config.min_lead_hours();

        let start = match p.start_date.as_deref() {
            Some(raw) => match parse_day(raw) {
                Some(date) => date,
                None => {
                    return Ok(ToolOutput::error(format!(
                        "Invalid start date \"{raw}\". Please use YYYY-MM-DD format."
                    )));
                }
            },
            // One hour past the minimum notice, so every returned slot is bookable.
            None => now + Duration::hours(min_lead_hours + 1),
        };
        let end = match p.end_date.as_deref() {
            Some(raw) => match parse_day(raw) {
                Some(date) => date + Duration::days(1) - Duration::milliseconds(1),
                None => {
                    return Ok(ToolOutput::error(format!(
                        "Invalid end date \"{raw}\". Please use YYYY-MM-DD format."
                    )));
                }
            },
            None => start + Duration::days(14),
        };

        let response = match context
            .calendar
            .available_slots(&to_utc_string(start), &to_utc_string(end))
            .await
        {
            Ok(response) => response,
            Err(e) => {
                return Ok(ToolOutput::error(format!(
                    "I encountered an error while checking availability: {e}. Please try again."
                )));
            }
        };

        if response.status != "success" {
            return Ok(ToolOutput::error(
                "I encountered an issue checking availability. Please try again later.",
            ));
        }

        let slots = response.slots();
        if slots.values().all(|day| day.is_empty()) {
            return Ok(ToolOutput::text(format!(
                "No available slots found between {} and {}. All times in this \
                 range may be inside the {}-hour minimum notice period.",
                to_utc_string(start),
                to_utc_string(end),
                min_lead_hours
            )));
        }

        let listing = build_slot_listing(&slots, &tz, context.config.slot_minutes());
        Ok(ToolOutput::text(serde_json::to_string(&listing)?))
    }
}

/// Tool: book a meeting at an exact UTC timestamp.
pub struct BookMeetingTool;

#[derive(Deserialize)]
struct BookingParams {
    datetime: String,
    attendee_name: String,
    attendee_email: String,
    #[serde(default)]
    attendee_timezone: Option<String>,
    #[serde(default)]
    notes: Option<String>,
}

#[async_trait]
impl Tool for BookMeetingTool {
    fn name(&self) -> &str {
        "book_meeting"
    }

    fn description(&self) -> &str {
        "Book a meeting at a specific date and time. Always confirm the \
         attendee name and email with the user first, and use the EXACT UTC \
         timestamp from the availability results' booking_refs — do not \
         construct or convert timestamps."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "datetime": {
                    "type": "string",
                    "description": "Meeting start — the exact UTC timestamp from check_meeting_availability (e.g. \"2030-01-10T01:00:00.000Z\")."
                },
                "attendee_name": {
                    "type": "string",
                    "description": "Full name of the person booking the meeting"
                },
                "attendee_email": {
                    "type": "string",
                    "description": "Email address of the person booking the meeting"
                },
                "attendee_timezone": {
                    "type": "string",
                    "description": "IANA timezone of the attendee"
                },
                "notes": {
                    "type": "string",
                    "description": "Optional notes or agenda for the meeting"
                }
            },
            "required": ["datetime", "attendee_name", "attendee_email"]
        })
    }

    async fn execute(
        &self,
        params: serde_json::Value,
        context: &ToolContext,
    ) -> anyhow::Result<ToolOutput> {
        let p: BookingParams = serde_json::from_value(params)?;
        let tz = p
            .attendee_timezone
            .as_deref()
            .and_then(|t| t.parse::<Tz>().ok())
            .unwrap_or_else(|| context.display_timezone());

        // Strict format: exact UTC with Z suffix, copied from booking_refs.
        if !p.datetime.ends_with('Z') {
            return Ok(ToolOutput::error(format!(
                "Invalid datetime format: \"{}\". The time MUST be in UTC format \
                 with a \"Z\" suffix (e.g. \"2030-01-10T01:00:00.000Z\"). Copy \
                 the exact timestamp from the availability booking_refs.",
                p.datetime
            )));
        }

        let start = match DateTime::parse_from_rfc3339(&p.datetime) {
            Ok(parsed) => parsed.with_timezone(&Utc),
            Err(_) => {
                return Ok(ToolOutput::error(format!(
                    "Invalid datetime: \"{}\" is not a valid ISO 8601 timestamp. \
                     Please use the exact UTC timestamp from the availability results.",
                    p.datetime
                )));
            }
        };

        let min_lead_hours = context.config.min_lead_hours();
        let hours_until = (start - Utc::now()).num_minutes() as f64 / 60.0;
        if hours_until < min_lead_hours as f64 {
            return Ok(ToolOutput::error(format!(
                "I cannot book meetings less than {} hours in advance. The \
                 requested time ({}) is only {:.1} hours away. Please choose a \
                 later slot.",
                min_lead_hours,
                format_local(start, &tz),
                hours_until
            )));
        }

        let normalized = to_utc_string(start);

        // Re-validate the slot just before committing: another booking may
        // have taken it since availability was shown.
        let window_start = to_utc_string(start - Duration::minutes(30));
        let window_end = to_utc_string(start + Duration::minutes(30));
        let check = match context
            .calendar
            .available_slots(&window_start, &window_end)
            .await
        {
            Ok(response) => response,
            Err(e) => {
                return Ok(ToolOutput::error(format!(
                    "I couldn't verify the slot is still available: {e}. Please try again."
                )));
            }
        };

        let still_available = check
            .slots()
            .values()
            .flatten()
            .any(|slot| slot.time == normalized);
        if !still_available {
            return Ok(ToolOutput::error(format!(
                "The requested time slot ({}) is no longer available. It may \
                 have just been booked. Please check availability again and \
                 choose a different time.",
                format_local(start, &tz)
            )));
        }

        let attendee = Attendee {
            name: p.attendee_name.clone(),
            email: p.attendee_email.clone(),
            time_zone: tz.name().to_string(),
        };
        let metadata = json!({
            "user_id": context
                .caller
                .as_ref()
                .map(|c| c.user_id.as_str())
                .unwrap_or("unknown"),
            "source": "persona-gate-chat",
            "notes": p.notes.clone().unwrap_or_default(),
        });

        let booking = match context.calendar.booking_request(normalized, attendee, metadata) {
            Ok(request) => request,
            Err(e) => return Ok(ToolOutput::error(format!("Booking is not configured: {e}"))),
        };

        let response = match context.calendar.create_booking(&booking).await {
            Ok(response) => response,
            Err(e) => {
                return Ok(ToolOutput::error(format!(
                    "I encountered an error while booking the meeting: {e}. Please try again."
                )));
            }
        };

        if response.status != "success" {
            return Ok(ToolOutput::error(
                "I encountered an issue creating the booking. The time slot may \
                 no longer be available. Please check availability again.",
            ));
        }

        let uid = response.data.map(|d| d.uid).unwrap_or_default();
        debug!(booking_uid = %uid, "Booking created");

        Ok(ToolOutput::text(format!(
            "Meeting successfully booked!\n\n**Details:**\n- Date & time: {}\n- \
             Duration: {} minutes\n- Attendee: {} ({})\n- Booking ID: {}\n\nA \
             confirmation email with the calendar invite is on its way to {}.",
            format_local(start, &tz),
            context.config.slot_minutes(),
            p.attendee_name,
            p.attendee_email,
            uid,
            p.attendee_email
        )))
    }
}

// --- Helpers ---

fn parse_day(raw: &str) -> Option<DateTime<Utc>> {
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|d| d.and_utc())
}

fn to_utc_string(instant: DateTime<Utc>) -> String {
    instant.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn format_local(instant: DateTime<Utc>, tz: &Tz) -> String {
    instant
        .with_timezone(tz)
        .format("%A, %-d %B %Y at %-I:%M %P")
        .to_string()
}

/// Regroup provider slots by local date and build the display/reference pair.
pub fn build_slot_listing(
    slots: &BTreeMap<String, Vec<Slot>>,
    tz: &Tz,
    slot_minutes: u32,
) -> SlotListing {
    let mut by_local_date: BTreeMap<NaiveDate, Vec<DateTime<Utc>>> = BTreeMap::new();

    for day_slots in slots.values() {
        for slot in day_slots {
            if let Ok(parsed) = DateTime::parse_from_rfc3339(&slot.time) {
                let utc = parsed.with_timezone(&Utc);
                by_local_date
                    .entry(utc.with_timezone(tz).date_naive())
                    .or_default()
                    .push(utc);
            } else {
                debug!(time = %slot.time, "Skipping unparseable slot");
            }
        }
    }

    let mut lines = Vec::new();
    let mut booking_refs = Vec::new();

    for times in by_local_date.values_mut() {
        times.sort();
        times.dedup();

        let day_label = times[0].with_timezone(tz).format("%a %-d %b").to_string();
        lines.push(format!(
            "**{}**: {}",
            day_label,
            format_ranges(times, tz, slot_minutes)
        ));

        for time in times.iter() {
            booking_refs.push(BookingRef {
                day: day_label.clone(),
                local_time: format_time(*time, tz),
                utc: to_utc_string(*time),
            });
        }
    }

    SlotListing {
        display: format!("Here is the current availability:\n\n{}", lines.join("\n")),
        booking_refs,
    }
}

fn format_time(instant: DateTime<Utc>, tz: &Tz) -> String {
    instant.with_timezone(tz).format("%-I:%M %P").to_string()
}

/// Collapse consecutive slots (one slot-length apart) into ranges.
fn format_ranges(times: &[DateTime<Utc>], tz: &Tz, slot_minutes: u32) -> String {
    let step = Duration::minutes(slot_minutes as i64);
    let mut ranges = Vec::new();

    let mut range_start = times[0];
    let mut range_end = times[0];
    for time in &times[1..] {
        if *time - range_end == step {
            range_end = *time;
        } else {
            ranges.push(render_range(range_start, range_end, tz, step));
            range_start = *time;
            range_end = *time;
        }
    }
    ranges.push(render_range(range_start, range_end, tz, step));

    ranges.join(", ")
}

fn render_range(start: DateTime<Utc>, end: DateTime<Utc>, tz: &Tz, step: Duration) -> String {
    if start == end {
        format_time(start, tz)
    } else {
        // The displayed range ends when the last slot finishes.
        format!("{}-{}", format_time(start, tz), format_time(end + step, tz))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cal_client::{CalendarClient, RetryPolicy};
    use persona_gate_core::config::Config;
    use std::sync::Arc;

    fn test_context() -> ToolContext {
        // Unroutable base URL: tests below never reach the network because
        // validation rejects the input first.
        let calendar = CalendarClient::new(
            "http://127.0.0.1:9",
            Some("test-key".into()),
            Some(1),
            RetryPolicy {
                max_retries: 0,
                base_backoff: std::time::Duration::from_millis(1),
            },
        );
        ToolContext {
            caller: Some(crate::CallerIdentity {
                user_id: "u1".into(),
                name: Some("Test User".into()),
                email: Some("test@example.com".into()),
            }),
            calendar: Arc::new(calendar),
            config: Arc::new(Config::default()),
        }
    }

    fn sample_slots() -> BTreeMap<String, Vec<Slot>> {
        let mut slots = BTreeMap::new();
        slots.insert(
            "2030-01-10".to_string(),
            vec![
                Slot { time: "2030-01-09T22:00:00.000Z".into() },
                Slot { time: "2030-01-09T22:15:00.000Z".into() },
                Slot { time: "2030-01-09T22:30:00.000Z".into() },
                Slot { time: "2030-01-10T03:00:00.000Z".into() },
            ],
        );
        slots
    }

    #[test]
    fn slot_listing_groups_consecutive_times_into_ranges() {
        let tz: Tz = "Australia/Sydney".parse().unwrap();
        let listing = build_slot_listing(&sample_slots(), &tz, 15);

        // 22:00 UTC on Jan 9 is 9:00 am on Jan 10 in Sydney (AEDT, +11).
        assert!(listing.display.contains("9:00 am-9:45 am"), "{}", listing.display);
        assert!(listing.display.contains("2:00 pm"), "{}", listing.display);
        assert_eq!(listing.booking_refs.len(), 4);
        assert_eq!(listing.booking_refs[0].utc, "2030-01-09T22:00:00.000Z");
    }

    #[test]
    fn slot_listing_keeps_display_and_refs_separate() {
        let tz: Tz = "Australia/Sydney".parse().unwrap();
        let listing = build_slot_listing(&sample_slots(), &tz, 15);

        // The UTC reference timestamps never leak into the display text.
        assert!(!listing.display.contains("2030-01-09T22:00:00.000Z"));
        let serialized = serde_json::to_value(&listing).unwrap();
        assert!(serialized["display"].is_string());
        assert!(serialized["booking_refs"].is_array());
    }

    #[tokio::test]
    async fn booking_rejects_timestamps_without_utc_suffix() {
        let output = BookMeetingTool
            .execute(
                json!({
                    "datetime": "2030-01-10T01:00:00",
                    "attendee_name": "Jess",
                    "attendee_email": "jess@example.com"
                }),
                &test_context(),
            )
            .await
            .unwrap();

        assert!(output.is_error);
        assert!(output.content.contains("UTC format"));
    }

    #[tokio::test]
    async fn booking_rejects_sub_minimum_lead_time() {
        let soon = to_utc_string(Utc::now() + Duration::hours(10));
        let output = BookMeetingTool
            .execute(
                json!({
                    "datetime": soon,
                    "attendee_name": "Jess",
                    "attendee_email": "jess@example.com"
                }),
                &test_context(),
            )
            .await
            .unwrap();

        assert!(output.is_error);
        assert!(output.content.contains("24 hours in advance"));
    }

    #[tokio::test]
    async fn booking_rejects_unparseable_timestamps() {
        let output = BookMeetingTool
            .execute(
                json!({
                    "datetime": "not-a-timeZ",
                    "attendee_name": "Jess",
                    "attendee_email": "jess@example.com"
                }),
                &test_context(),
            )
            .await
            .unwrap();

        assert!(output.is_error);
        assert!(output.content.contains("not a valid ISO 8601"));
    }

    #[tokio::test]
    async fn current_datetime_reports_safe_window() {
        let output = CurrentDateTimeTool
            .execute(json!({}), &test_context())
            .await
            .unwrap();

        assert!(!output.is_error);
        let payload: serde_json::Value = serde_json::from_str(&output.content).unwrap();
        assert_eq!(payload["timezone"], "Australia/Sydney");
        assert!(payload["safe_start_date"].is_string());
        assert!(payload["suggested_end_date"].is_string());
    }

    #[test]
    fn day_parsing_accepts_iso_dates_only() {
        assert!(parse_day("2030-01-10").is_some());
        assert!(parse_day("10/01/2030").is_none());
        assert!(parse_day("").is_none());
    }
}

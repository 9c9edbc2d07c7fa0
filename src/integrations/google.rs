use axum::{extract::State, routing::get, Json, Router};
use chrono::{DateTime, Duration as ChronoDuration, NaiveDate, SecondsFormat, Utc};
use serde_json::{json, Value};
use std::time::Duration;

use crate::{
    error::Result,
    integrations::{str_field, unauthenticated_as},
    provider::Integration,
    upstream::UpstreamRequest,
    AppState,
};

const GOOGLE: Integration = Integration::Google;
const DATA_TTL: Duration = Duration::from_secs(5 * 60);
const INBOX_SIZE: u32 = 3;
const CALENDAR_DAYS: i64 = 7;

pub fn routes() -> Router<AppState> {
    Router::new().route("/data", get(data))
}

async fn data(State(state): State<AppState>) -> Result<Json<Value>> {
    let result = state
        .cache
        .get_or_fetch("google:data", DATA_TTL, || async {
            let emails = inbox(&state).await?;
            let calendar = upcoming_events(&state).await?;
            Ok(json!({
                "authenticated": true,
                "emails": emails,
                "calendar": calendar,
            }))
        })
        .await;

    Ok(Json(unauthenticated_as(json!({ "authenticated": false }), result)?))
}

async fn inbox(state: &AppState) -> Result<Vec<Value>> {
    let listing = state
        .upstream
        .get_json(
            GOOGLE,
            UpstreamRequest::get("gmail/v1/users/me/messages")
                .query("labelIds", "INBOX")
                .query("maxResults", INBOX_SIZE),
        )
        .await?;

    let ids: Vec<&str> = listing["messages"]
        .as_array()
        .map(|messages| messages.iter().filter_map(|m| m["id"].as_str()).collect())
        .unwrap_or_default();

    let mut emails = Vec::with_capacity(ids.len());
    for id in ids {
        let message = state
            .upstream
            .get_json(
                GOOGLE,
                UpstreamRequest::get(format!("gmail/v1/users/me/messages/{id}"))
                    .query("format", "metadata")
                    .query("metadataHeaders", "Subject")
                    .query("metadataHeaders", "From"),
            )
            .await?;
        emails.push(email_summary(id, &message));
    }
    Ok(emails)
}

async fn upcoming_events(state: &AppState) -> Result<Vec<Value>> {
    let now = Utc::now();
    let until = now + ChronoDuration::days(CALENDAR_DAYS);

    let events = state
        .upstream
        .get_json(
            GOOGLE,
            UpstreamRequest::get("calendar/v3/calendars/primary/events")
                .query("timeMin", now.to_rfc3339_opts(SecondsFormat::Secs, true))
                .query("timeMax", until.to_rfc3339_opts(SecondsFormat::Secs, true))
                .query("singleEvents", true)
                .query("orderBy", "startTime"),
        )
        .await?;

    Ok(events["items"]
        .as_array()
        .map(|items| items.iter().filter_map(calendar_entry).collect())
        .unwrap_or_default())
}

fn header_value<'a>(message: &'a Value, name: &str) -> Option<&'a str> {
    message
        .pointer("/payload/headers")?
        .as_array()?
        .iter()
        .find(|h| h["name"].as_str().is_some_and(|n| n.eq_ignore_ascii_case(name)))
        .and_then(|h| h["value"].as_str())
}

/// `"Amazon" <noreply@amazon.com>` becomes `Amazon`.
fn display_sender(from: &str) -> String {
    match from.split_once('<') {
        Some((name, _)) => name.trim().replace('"', ""),
        None => from.to_string(),
    }
}

fn email_summary(id: &str, message: &Value) -> Value {
    json!({
        "id": id,
        "from": display_sender(header_value(message, "From").unwrap_or("Unknown")),
        "subject": header_value(message, "Subject").unwrap_or("No Subject"),
        "time": "recent",
        "important": false,
    })
}

fn calendar_entry(event: &Value) -> Option<Value> {
    let (time, date, day) = if let Some(start) = str_field(event, "/start/dateTime") {
        let start = DateTime::parse_from_rfc3339(start).ok()?;
        (
            start.format("%H:%M").to_string(),
            start.format("%Y-%m-%d").to_string(),
            start.format("%A").to_string(),
        )
    } else {
        let start = NaiveDate::parse_from_str(str_field(event, "/start/date")?, "%Y-%m-%d").ok()?;
        (
            "All day".to_string(),
            start.to_string(),
            start.format("%A").to_string(),
        )
    };

    Some(json!({
        "id": event["id"],
        "title": str_field(event, "/summary").unwrap_or("(No title)"),
        "time": time,
        "date": date,
        "day": day,
        "type": "personal",
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sender_is_reduced_to_display_name() {
        assert_eq!(display_sender("\"Amazon\" <noreply@amazon.com>"), "Amazon");
        assert_eq!(display_sender("Jane Doe <jane@example.com>"), "Jane Doe");
        assert_eq!(display_sender("plain@example.com"), "plain@example.com");
    }

    #[test]
    fn email_headers_fall_back_when_missing() {
        let message = json!({
            "payload": { "headers": [{ "name": "From", "value": "Bank <no-reply@bank.test>" }] }
        });

        let summary = email_summary("m1", &message);

        assert_eq!(summary["from"], "Bank");
        assert_eq!(summary["subject"], "No Subject");
        assert_eq!(summary["id"], "m1");
    }

    #[test]
    fn timed_and_all_day_events_are_formatted() {
        let timed = json!({
            "id": "e1",
            "summary": "Standup",
            "start": { "dateTime": "2024-03-04T09:30:00+00:00" }
        });
        let all_day = json!({
            "id": "e2",
            "summary": "Holiday",
            "start": { "date": "2024-03-05" }
        });

        let timed = calendar_entry(&timed).unwrap();
        assert_eq!(timed["time"], "09:30");
        assert_eq!(timed["date"], "2024-03-04");
        assert_eq!(timed["day"], "Monday");

        let all_day = calendar_entry(&all_day).unwrap();
        assert_eq!(all_day["time"], "All day");
        assert_eq!(all_day["day"], "Tuesday");

        assert!(calendar_entry(&json!({ "id": "e3", "start": {} })).is_none());
    }
}

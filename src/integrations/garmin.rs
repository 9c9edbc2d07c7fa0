use axum::{
    extract::{Query, State},
    routing::get,
    Json, Router,
};
use chrono::{Duration as ChronoDuration, Local, NaiveDate};
use futures::future::join_all;
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::warn;

use crate::{
    cache::daily_key,
    error::{AppError, Result},
    provider::Integration,
    upstream::UpstreamRequest,
    AppState,
};

const GARMIN: Integration = Integration::Garmin;
const GARMIN_TTL: Duration = Duration::from_secs(10 * 60);
const HEART_RATE_TTL: Duration = Duration::from_secs(60);

#[derive(Debug, Deserialize)]
pub struct SleepQuery {
    #[serde(default = "default_days")]
    pub days: u32,
}

#[derive(Debug, Deserialize)]
pub struct ActivitiesQuery {
    #[serde(default = "default_limit")]
    pub limit: u32,
}

fn default_days() -> u32 {
    7
}

fn default_limit() -> u32 {
    5
}

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/stats", get(stats))
        .route("/sleep", get(sleep))
        .route("/activities", get(activities))
        .route("/heart-rate", get(heart_rate))
        .route("/body", get(body))
}

async fn stats(State(state): State<AppState>) -> Result<Json<Value>> {
    let today = Local::now().date_naive();
    let payload = state
        .cache
        .get_or_fetch(&daily_key("garmin:stats", &[]), GARMIN_TTL, || async {
            let raw = state
                .upstream
                .get_json(
                    GARMIN,
                    UpstreamRequest::get("usersummary-service/usersummary/daily")
                        .query("calendarDate", today),
                )
                .await?;
            Ok(daily_stats(&raw))
        })
        .await?;
    Ok(Json(payload))
}

async fn sleep(
    State(state): State<AppState>,
    Query(query): Query<SleepQuery>,
) -> Result<Json<Value>> {
    if !(1..=31).contains(&query.days) {
        return Err(AppError::BadRequest("days must be between 1 and 31".into()));
    }
    let days = query.days.to_string();
    let key = daily_key("garmin:sleep", &[("days", &days)]);

    let payload = state
        .cache
        .get_or_fetch(&key, GARMIN_TTL, || async {
            let today = Local::now().date_naive();
            let dates: Vec<NaiveDate> = (0..query.days)
                .map(|offset| today - ChronoDuration::days(i64::from(offset)))
                .collect();
            let nights = join_all(dates.iter().map(|date| {
                state.upstream.get_json(
                    GARMIN,
                    UpstreamRequest::get("wellness-service/wellness/dailySleepData")
                        .query("date", date),
                )
            }))
            .await;

            let mut history = Vec::new();
            for (date, night) in dates.into_iter().zip(nights) {
                let raw = match night {
                    Ok(raw) => raw,
                    Err(e @ (AppError::Authentication(_) | AppError::Refresh(_))) => return Err(e),
                    // One missing night should not blank the whole chart.
                    Err(e) => {
                        warn!("Skipping Garmin sleep for {}: {}", date, e);
                        continue;
                    }
                };
                if let Some(night) = sleep_night(date, &raw) {
                    history.push(night);
                }
            }
            Ok(Value::Array(history))
        })
        .await?;
    Ok(Json(payload))
}

async fn activities(
    State(state): State<AppState>,
    Query(query): Query<ActivitiesQuery>,
) -> Result<Json<Value>> {
    if !(1..=50).contains(&query.limit) {
        return Err(AppError::BadRequest("limit must be between 1 and 50".into()));
    }
    let limit = query.limit.to_string();
    let key = daily_key("garmin:activities", &[("limit", &limit)]);

    let payload = state
        .cache
        .get_or_fetch(&key, GARMIN_TTL, || async {
            let raw = state
                .upstream
                .get_json(
                    GARMIN,
                    UpstreamRequest::get("activitylist-service/activities/search/activities")
                        .query("start", 0)
                        .query("limit", query.limit),
                )
                .await?;
            Ok(Value::Array(recent_activities(&raw)))
        })
        .await?;
    Ok(Json(payload))
}

async fn heart_rate(State(state): State<AppState>) -> Result<Json<Value>> {
    let today = Local::now().date_naive();
    let payload = state
        .cache
        .get_or_fetch(&daily_key("garmin:heart-rate", &[]), HEART_RATE_TTL, || async {
            let raw = state
                .upstream
                .get_json(
                    GARMIN,
                    UpstreamRequest::get("wellness-service/wellness/dailyHeartRate")
                        .query("date", today),
                )
                .await?;
            Ok(heart_rate_summary(&raw))
        })
        .await?;
    Ok(Json(payload))
}

async fn body(State(state): State<AppState>) -> Result<Json<Value>> {
    let today = Local::now().date_naive();
    let payload = state
        .cache
        .get_or_fetch(&daily_key("garmin:body", &[]), GARMIN_TTL, || async {
            let (weight, stress) = tokio::join!(
                state.upstream.get_json(
                    GARMIN,
                    UpstreamRequest::get("weight-service/weight/dateRange")
                        .query("startDate", today)
                        .query("endDate", today),
                ),
                state.upstream.get_json(
                    GARMIN,
                    UpstreamRequest::get(format!("wellness-service/wellness/dailyStress/{today}")),
                ),
            );
            Ok(body_metrics(&optional(weight)?, &optional(stress)?))
        })
        .await?;
    Ok(Json(payload))
}

// A failed metric shows as missing; a dead session still fails the request.
fn optional(result: Result<Value>) -> Result<Value> {
    match result {
        Ok(raw) => Ok(raw),
        Err(e @ (AppError::Authentication(_) | AppError::Refresh(_))) => Err(e),
        Err(e) => {
            warn!("Garmin body metric unavailable: {}", e);
            Ok(Value::Null)
        }
    }
}

fn kilometres(meters: Option<f64>) -> Option<f64> {
    meters.map(|m| (m / 10.0).round() / 100.0)
}

fn daily_stats(raw: &Value) -> Value {
    let count = |field: &str| raw[field].as_i64().unwrap_or(0);

    json!({
        "steps": count("totalSteps"),
        "calories": raw["totalKilocalories"].as_f64().unwrap_or(0.0),
        "distance_km": kilometres(raw["totalDistanceMeters"].as_f64()).unwrap_or(0.0),
        "active_minutes": count("moderateIntensityMinutes") + count("vigorousIntensityMinutes"),
        "floors": raw["floorsAscended"].as_f64().unwrap_or(0.0),
        "resting_hr": raw["restingHeartRate"],
        "max_hr": raw["maxHeartRate"],
        "min_hr": raw["minHeartRate"],
    })
}

fn sleep_night(date: NaiveDate, raw: &Value) -> Option<Value> {
    let night = &raw["dailySleepDTO"];
    let total = night["sleepTimeSeconds"].as_i64().unwrap_or(0);
    if total <= 0 {
        return None;
    }
    let seconds = |field: &str| night[field].as_i64().unwrap_or(0);

    Some(json!({
        "date": date.to_string(),
        "total_sleep_seconds": total,
        "deep_sleep_seconds": seconds("deepSleepSeconds"),
        "light_sleep_seconds": seconds("lightSleepSeconds"),
        "rem_sleep_seconds": seconds("remSleepSeconds"),
        "awake_seconds": seconds("awakeSleepSeconds"),
        "sleep_score": night.pointer("/sleepScores/overall/value"),
        "sleep_start": night["sleepStartTimestampLocal"],
        "sleep_end": night["sleepEndTimestampLocal"],
    }))
}

fn heart_rate_summary(raw: &Value) -> Value {
    // Samples are `[timestamp, bpm]` pairs; bpm is null while the watch is off
    let current = raw["heartRateValues"].as_array().and_then(|samples| {
        samples
            .iter()
            .rev()
            .find_map(|sample| sample.get(1).and_then(Value::as_i64))
    });

    json!({
        "current": current,
        "resting": raw["restingHeartRate"],
        "max_today": raw["maxHeartRate"],
        "min_today": raw["minHeartRate"],
    })
}

fn body_metrics(weight: &Value, stress: &Value) -> Value {
    // Garmin reports grams
    let grams = weight
        .pointer("/totalAverage/weight")
        .or_else(|| weight.get("weight"))
        .and_then(Value::as_f64)
        .filter(|grams| *grams > 0.0);

    json!({
        "weight_kg": grams.map(|g| (g / 100.0).round() / 10.0),
        "avg_stress": stress["avgStressLevel"],
        "max_stress": stress["maxStressLevel"],
    })
}

fn recent_activities(raw: &Value) -> Vec<Value> {
    raw.as_array()
        .map(|activities| {
            activities
                .iter()
                .map(|activity| {
                    json!({
                        "id": activity["activityId"],
                        "name": activity["activityName"],
                        "type": activity.pointer("/activityType/typeKey"),
                        "start_time": activity["startTimeLocal"],
                        "duration_seconds": activity["duration"],
                        "distance_km": kilometres(
                            activity["distance"].as_f64().filter(|d| *d > 0.0)
                        ),
                        "calories": activity["calories"],
                        "avg_hr": activity["averageHR"],
                        "max_hr": activity["maxHR"],
                    })
                })
                .collect()
        })
        .unwrap_or_default()
}

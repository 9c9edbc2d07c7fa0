use axum::{
    extract::{Query, State},
    routing::get,
    Json, Router,
};
use chrono::{DateTime, Duration as ChronoDuration, NaiveDate, Utc};
use std::collections::HashMap;
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;

use crate::{
    error::{AppError, Result},
    integrations::str_field,
    provider::Integration,
    upstream::UpstreamRequest,
    AppState,
};

const MONZO: Integration = Integration::Monzo;
const BALANCE_TTL: Duration = Duration::from_secs(30);
const TRANSACTIONS_TTL: Duration = Duration::from_secs(60);
const CHART_TTL: Duration = Duration::from_secs(60);

#[derive(Debug, Deserialize)]
pub struct AccountQuery {
    pub account_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct TransactionsQuery {
    pub account_id: Option<String>,
    #[serde(default = "default_days")]
    pub days: u32,
}

fn default_days() -> u32 {
    7
}

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/whoami", get(whoami))
        .route("/accounts", get(accounts))
        .route("/balance", get(balance))
        .route("/transactions", get(transactions))
        .route("/balance-chart", get(balance_chart))
}

async fn whoami(State(state): State<AppState>) -> Result<Json<Value>> {
    let body = state
        .upstream
        .get_json(MONZO, UpstreamRequest::get("ping/whoami"))
        .await?;
    Ok(Json(body))
}

async fn accounts(State(state): State<AppState>) -> Result<Json<Value>> {
    let body = state
        .upstream
        .get_json(MONZO, UpstreamRequest::get("accounts"))
        .await?;
    Ok(Json(body))
}

async fn balance(
    State(state): State<AppState>,
    Query(query): Query<AccountQuery>,
) -> Result<Json<Value>> {
    let account_id = query.account_id.filter(|id| !id.is_empty());
    let key = format!(
        "monzo:balance:{}",
        account_id.as_deref().unwrap_or("default")
    );

    let payload = state
        .cache
        .get_or_fetch(&key, BALANCE_TTL, || async {
            let account_id = resolve_account(&state, account_id).await?;
            let raw = state
                .upstream
                .get_json(
                    MONZO,
                    UpstreamRequest::get("balance").query("account_id", &account_id),
                )
                .await?;
            Ok(summarize_balance(&raw))
        })
        .await?;

    Ok(Json(payload))
}

async fn transactions(
    State(state): State<AppState>,
    Query(query): Query<TransactionsQuery>,
) -> Result<Json<Value>> {
    if !(1..=90).contains(&query.days) {
        return Err(AppError::BadRequest("days must be between 1 and 90".into()));
    }
    let account_id = query.account_id.filter(|id| !id.is_empty());
    let key = format!(
        "monzo:transactions:{}:{}",
        account_id.as_deref().unwrap_or("default"),
        query.days
    );

    let payload = state
        .cache
        .get_or_fetch(&key, TRANSACTIONS_TTL, || async {
            let account_id = resolve_account(&state, account_id).await?;
            // Monzo wants RFC 3339 with an explicit zone
            let since = (Utc::now() - ChronoDuration::days(i64::from(query.days)))
                .format("%Y-%m-%dT%H:%M:%SZ")
                .to_string();
            let raw = state
                .upstream
                .get_json(
                    MONZO,
                    UpstreamRequest::get("transactions")
                        .query("account_id", &account_id)
                        .query("since", since)
                        .query("expand[]", "merchant"),
                )
                .await?;
            Ok(json!({ "transactions": spending(&raw) }))
        })
        .await?;

    Ok(Json(payload))
}

async fn balance_chart(
    State(state): State<AppState>,
    Query(query): Query<TransactionsQuery>,
) -> Result<Json<Value>> {
    if !(1..=31).contains(&query.days) {
        return Err(AppError::BadRequest("days must be between 1 and 31".into()));
    }
    let account_id = query.account_id.filter(|id| !id.is_empty());
    let key = format!(
        "monzo:balance-chart:{}:{}",
        account_id.as_deref().unwrap_or("default"),
        query.days
    );

    let payload = state
        .cache
        .get_or_fetch(&key, CHART_TTL, || async {
            let account_id = resolve_account(&state, account_id).await?;
            let now = Utc::now();
            let since = (now - ChronoDuration::days(i64::from(query.days)))
                .format("%Y-%m-%dT%H:%M:%SZ")
                .to_string();
            let (transactions, balance) = tokio::try_join!(
                state.upstream.get_json(
                    MONZO,
                    UpstreamRequest::get("transactions")
                        .query("account_id", &account_id)
                        .query("since", since),
                ),
                state.upstream.get_json(
                    MONZO,
                    UpstreamRequest::get("balance").query("account_id", &account_id),
                ),
            )?;

            let current = balance.get("balance").and_then(Value::as_i64).unwrap_or(0);
            Ok(json!({
                "chart_data": daily_balances(current, &transactions, now.date_naive(), query.days),
                "current_balance": current as f64 / 100.0,
            }))
        })
        .await?;

    Ok(Json(payload))
}

async fn resolve_account(state: &AppState, account_id: Option<String>) -> Result<String> {
    if let Some(account_id) = account_id {
        return Ok(account_id);
    }

    let accounts = state
        .upstream
        .get_json(MONZO, UpstreamRequest::get("accounts"))
        .await?;
    first_active_account(&accounts)
        .ok_or_else(|| AppError::NotFound("no active Monzo accounts".into()))
}

fn first_active_account(accounts: &Value) -> Option<String> {
    accounts
        .get("accounts")?
        .as_array()?
        .iter()
        .find(|account| !account.get("closed").and_then(Value::as_bool).unwrap_or(false))
        .and_then(|account| str_field(account, "/id"))
        .map(str::to_string)
}

// Monzo reports minor units
fn pounds(value: Option<&Value>) -> f64 {
    value.and_then(Value::as_i64).unwrap_or(0) as f64 / 100.0
}

fn summarize_balance(raw: &Value) -> Value {
    json!({
        "balance": pounds(raw.get("balance")),
        "total_balance": pounds(raw.get("total_balance")),
        "currency": raw.get("currency").cloned().unwrap_or(Value::Null),
        "spend_today": pounds(raw.get("spend_today")),
    })
}

/// End-of-day balances for the last `days` days, oldest first, rebuilt by
/// walking back from the current balance through each day's settled
/// movements.
fn daily_balances(current_pence: i64, raw: &Value, today: NaiveDate, days: u32) -> Vec<Value> {
    let mut movement: HashMap<NaiveDate, i64> = HashMap::new();
    for t in raw
        .get("transactions")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
    {
        // Declined payments never touched the balance
        if t.get("decline_reason").is_some_and(|reason| !reason.is_null()) {
            continue;
        }
        let Some(created) = str_field(t, "/created")
            .and_then(|created| DateTime::parse_from_rfc3339(created).ok())
        else {
            continue;
        };
        let amount = t.get("amount").and_then(Value::as_i64).unwrap_or(0);
        *movement.entry(created.with_timezone(&Utc).date_naive()).or_default() += amount;
    }

    let mut chart = Vec::with_capacity(days as usize);
    let mut balance = current_pence;
    for offset in 0..days {
        let date = today - ChronoDuration::days(i64::from(offset));
        chart.push(json!({
            "name": date.format("%a").to_string(),
            "date": date.to_string(),
            "balance": balance as f64 / 100.0,
        }));
        balance -= movement.get(&date).copied().unwrap_or(0);
    }
    chart.reverse();
    chart
}

/// Outgoing transactions only, amounts as positive pounds.
fn spending(raw: &Value) -> Vec<Value> {
    let Some(transactions) = raw.get("transactions").and_then(Value::as_array) else {
        return Vec::new();
    };

    transactions
        .iter()
        .filter(|t| t.get("amount").and_then(Value::as_i64).unwrap_or(0) < 0)
        .map(|t| {
            json!({
                "id": t.get("id"),
                "amount": pounds(t.get("amount")).abs(),
                "currency": t.get("currency"),
                "description": t.get("description"),
                "merchant": str_field(t, "/merchant/name").unwrap_or("Unknown"),
                "category": t.get("category"),
                "created": t.get("created"),
                "notes": str_field(t, "/notes").unwrap_or(""),
            })
        })
        .collect()
}

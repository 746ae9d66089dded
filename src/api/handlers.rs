//! HTTP analytics endpoints (§6: the read-only surface plus manual refresh).

use crate::api::auth::extract_bearer;
use crate::api::ApiState;
use crate::core::{CoreError, PortfolioSnapshot};
use crate::services::broker::BrokerClient;
use axum::extract::{Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Json};
use chrono::NaiveDate;
use serde::Deserialize;
use serde_json::json;

fn authenticate<B: BrokerClient>(state: &ApiState<B>, headers: &HeaderMap) -> Result<String, StatusCode> {
    let token = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(extract_bearer)
        .ok_or(StatusCode::UNAUTHORIZED)?;
    state.token_verifier.verify(token).map_err(|_| StatusCode::UNAUTHORIZED)
}

fn map_core_error(err: CoreError) -> StatusCode {
    match err {
        CoreError::Authorization(_) => StatusCode::FORBIDDEN,
        CoreError::AccountNotFound(_) => StatusCode::NOT_FOUND,
        CoreError::RateLimited(_) => StatusCode::TOO_MANY_REQUESTS,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

#[derive(Deserialize)]
pub struct ValueQuery {
    account_id: String,
}

/// `account_id` is only ever used for selecting *which* of the caller's own
/// accounts to return — ownership is always re-derived from the verified
/// token, never trusted from the query string alone.
pub async fn get_portfolio_value<B: BrokerClient>(
    State(state): State<ApiState<B>>,
    headers: HeaderMap,
    Query(query): Query<ValueQuery>,
) -> impl IntoResponse {
    let user_id = match authenticate(&state, &headers) {
        Ok(u) => u,
        Err(code) => return code.into_response(),
    };

    if let Err(e) = state.portfolio_mode.authorize_account_access(&user_id, &query.account_id).await {
        return map_core_error(e).into_response();
    }

    if query.account_id == "aggregated" {
        return match state.calculator.recompute_aggregated(&user_id).await {
            Ok(snapshot) => Json(snapshot).into_response(),
            Err(_) => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
        };
    }

    match state.db.redis.get_last_portfolio::<PortfolioSnapshot>(&query.account_id).await {
        Ok(Some(snapshot)) => Json(snapshot).into_response(),
        Ok(None) => StatusCode::NOT_FOUND.into_response(),
        Err(_) => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
    }
}

#[derive(Deserialize)]
pub struct HistoryQuery {
    user_id: String,
    range: Option<String>,
}

fn parse_range(range: &Option<String>) -> (NaiveDate, NaiveDate) {
    let today = chrono::Utc::now().date_naive();
    let days = match range.as_deref() {
        Some("7d") => 7,
        Some("90d") => 90,
        Some("1y") => 365,
        _ => 30,
    };
    (today - chrono::Duration::days(days), today)
}

pub async fn get_portfolio_history<B: BrokerClient>(
    State(state): State<ApiState<B>>,
    headers: HeaderMap,
    Query(query): Query<HistoryQuery>,
) -> impl IntoResponse {
    let authed_user = match authenticate(&state, &headers) {
        Ok(u) => u,
        Err(code) => return code.into_response(),
    };
    if authed_user != query.user_id {
        return StatusCode::FORBIDDEN.into_response();
    }

    let (start, end) = parse_range(&query.range);
    match state.snapshot_store.read_history(&query.user_id, start, end).await {
        Ok(rows) => Json(rows).into_response(),
        Err(_) => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
    }
}

#[derive(Deserialize)]
pub struct RefreshRequest {
    account_id: String,
}

pub async fn post_portfolio_refresh<B: BrokerClient>(
    State(state): State<ApiState<B>>,
    headers: HeaderMap,
    Json(body): Json<RefreshRequest>,
) -> impl IntoResponse {
    let user_id = match authenticate(&state, &headers) {
        Ok(u) => u,
        Err(code) => return code.into_response(),
    };
    if let Err(e) = state.portfolio_mode.authorize_account_access(&user_id, &body.account_id).await {
        return map_core_error(e).into_response();
    }
    if let Err(e) = state.rate_limiter.check_and_record(&user_id, "portfolio_refresh").await {
        return map_core_error(e).into_response();
    }

    let result = if body.account_id == "aggregated" {
        state.calculator.recompute_aggregated(&user_id).await
    } else {
        state.calculator.force_recompute(&body.account_id).await
    };

    match result {
        Ok(snapshot) => Json(snapshot).into_response(),
        Err(_) => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
    }
}

pub async fn health_handler<B: BrokerClient>(State(state): State<ApiState<B>>) -> impl IntoResponse {
    let db_health = state.db.health_check().await;
    Json(json!({
        "status": if db_health.redis_ok && db_health.postgres_ok { "healthy" } else { "degraded" },
        "cache_reachable": db_health.redis_ok,
        "database_reachable": db_health.postgres_ok,
        "connection_count": state.connections.connection_count().await,
        "distinct_account_count": state.connections.distinct_account_count().await,
        "timestamp": chrono::Utc::now().to_rfc3339(),
    }))
}

pub async fn metrics_handler<B: BrokerClient>(State(state): State<ApiState<B>>) -> impl IntoResponse {
    use prometheus::Encoder;
    let encoder = prometheus::TextEncoder::new();
    let metric_families = state.metrics.registry.gather();
    let mut buffer = Vec::new();
    if encoder.encode(&metric_families, &mut buffer).is_err() {
        return (StatusCode::INTERNAL_SERVER_ERROR, "failed to encode metrics").into_response();
    }
    (StatusCode::OK, buffer).into_response()
}

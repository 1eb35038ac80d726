//! HTTP query and export surface over the signal store

use axum::{
    extract::{Query, State},
    http::{header, StatusCode},
    response::IntoResponse,
    Json,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::store::{SessionRow, SignalQuery, SignalRow, SignalStatsRow};
use crate::types::AppState;

#[derive(Serialize)]
pub struct SignalsResponse {
    pub signals: Vec<SignalRow>,
    pub total: u32,
}

#[derive(Serialize)]
pub struct SessionsResponse {
    pub sessions: Vec<SessionRow>,
}

#[derive(Serialize)]
pub struct StatsResponse {
    pub stats: Vec<SignalStatsRow>,
    #[serde(rename = "droppedWrites")]
    pub dropped_writes: u64,
}

#[derive(Debug, Deserialize)]
pub struct SessionsQueryParams {
    pub limit: Option<u32>,
}

#[derive(Debug, Deserialize)]
pub struct ExportParams {
    pub format: Option<String>,
    pub limit: Option<u32>,
    pub offset: Option<u32>,
    pub signal_type: Option<String>,
    pub direction: Option<String>,
    pub outcome: Option<String>,
    pub start_date: Option<String>,
    pub end_date: Option<String>,
}

impl ExportParams {
    fn query(&self) -> SignalQuery {
        SignalQuery {
            // Exports default to the full filtered set, not a page
            limit: Some(self.limit.unwrap_or(10_000)),
            offset: self.offset,
            signal_type: self.signal_type.clone(),
            direction: self.direction.clone(),
            outcome: self.outcome.clone(),
            start_date: self.start_date.clone(),
            end_date: self.end_date.clone(),
        }
    }
}

/// GET /api/signals - filtered signal list with pagination
pub async fn get_signals(
    State(state): State<Arc<AppState>>,
    Query(query): Query<SignalQuery>,
) -> impl IntoResponse {
    let (signals, total) = {
        let signals = state.store.query_signals(&query);
        let total = state.store.count_signals(&query);
        (signals, total)
    };

    match (signals, total) {
        (Ok(signals), Ok(total)) => (
            StatusCode::OK,
            Json(serde_json::json!(SignalsResponse { signals, total })),
        ),
        (Err(e), _) | (_, Err(e)) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(serde_json::json!({"error": e.to_string()})),
        ),
    }
}

/// GET /api/stats - aggregate stats by type and direction
pub async fn get_stats(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match state.store.signal_stats() {
        Ok(stats) => (
            StatusCode::OK,
            Json(serde_json::json!(StatsResponse {
                stats,
                dropped_writes: state.store.dropped_writes(),
            })),
        ),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(serde_json::json!({"error": e.to_string()})),
        ),
    }
}

/// GET /api/sessions - recent sessions
pub async fn get_sessions(
    State(state): State<Arc<AppState>>,
    Query(params): Query<SessionsQueryParams>,
) -> impl IntoResponse {
    let limit = params.limit.unwrap_or(20);
    match state.store.query_sessions(limit) {
        Ok(sessions) => (
            StatusCode::OK,
            Json(serde_json::json!(SessionsResponse { sessions })),
        ),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(serde_json::json!({"error": e.to_string()})),
        ),
    }
}

/// GET /api/signals/export - downloadable CSV or JSON of the filtered set
pub async fn export_signals(
    State(state): State<Arc<AppState>>,
    Query(params): Query<ExportParams>,
) -> impl IntoResponse {
    let format = params.format.as_deref().unwrap_or("csv");

    match format {
        "json" => match state.store.query_signals(&params.query()) {
            Ok(signals) => (
                StatusCode::OK,
                [
                    (header::CONTENT_TYPE, "application/json".to_string()),
                    (
                        header::CONTENT_DISPOSITION,
                        "attachment; filename=\"signals.json\"".to_string(),
                    ),
                ],
                serde_json::to_string(&signals).unwrap_or_else(|_| "[]".to_string()),
            )
                .into_response(),
            Err(e) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({"error": e.to_string()})),
            )
                .into_response(),
        },
        "csv" => match state.store.export_csv(&params.query()) {
            Ok(csv_text) => (
                StatusCode::OK,
                [
                    (header::CONTENT_TYPE, "text/csv".to_string()),
                    (
                        header::CONTENT_DISPOSITION,
                        "attachment; filename=\"signals.csv\"".to_string(),
                    ),
                ],
                csv_text,
            )
                .into_response(),
            Err(e) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({"error": e.to_string()})),
            )
                .into_response(),
        },
        other => (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({
                "error": format!("Unknown export format: {}", other)
            })),
        )
            .into_response(),
    }
}

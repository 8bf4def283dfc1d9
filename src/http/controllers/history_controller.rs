use crate::history::HistoryRecord;
use crate::http::controllers::{parse_site_id, require_signature};
use crate::http::error::ApiError;
use crate::http::models::HistoryParams;
use crate::signature::history_message;
use crate::CounterEngine;
use axum::{
    extract::{Path, Query, State},
    Json,
};
use chrono::NaiveDate;
use std::sync::Arc;

/// Handler for GET /history/{site_id}?begin=YYYY-MM-DD&end=YYYY-MM-DD
#[tracing::instrument(name = "handler_history", skip(engine, params), fields(webcounter.site_id = %site_id))]
pub async fn history_handler(
    State(engine): State<Arc<CounterEngine>>,
    Path(site_id): Path<String>,
    Query(params): Query<HistoryParams>,
) -> Result<Json<Vec<HistoryRecord>>, ApiError> {
    let raw_begin = required("begin", params.begin.as_deref())?;
    let raw_end = required("end", params.end.as_deref())?;
    require_signature(
        &engine,
        &history_message(&site_id, raw_begin, raw_end),
        params.sig.as_deref(),
    )?;
    let site_id = parse_site_id(&site_id)?;
    let begin = parse_date("begin", raw_begin)?;
    let end = parse_date("end", raw_end)?;

    let rows = engine.query_history(site_id, begin, end).await?;
    Ok(Json(rows))
}

fn required<'a>(name: &str, value: Option<&'a str>) -> Result<&'a str, ApiError> {
    value.ok_or_else(|| ApiError::bad_request(format!("missing query parameter '{}'", name)))
}

fn parse_date(name: &str, value: &str) -> Result<NaiveDate, ApiError> {
    NaiveDate::parse_from_str(value, "%Y-%m-%d").map_err(|_| {
        ApiError::bad_request(format!("{} must be a YYYY-MM-DD date, got '{}'", name, value))
    })
}

use crate::history::RunningTotal;
use crate::http::controllers::{parse_site_id, require_signature};
use crate::http::error::ApiError;
use crate::http::models::SignedParams;
use crate::signature::site_message;
use crate::CounterEngine;
use axum::{
    extract::{Path, Query, State},
    Json,
};
use std::sync::Arc;

/// Handler for GET /totals/{site_id}
#[tracing::instrument(name = "handler_totals", skip(engine, params), fields(webcounter.site_id = %site_id))]
pub async fn totals_handler(
    State(engine): State<Arc<CounterEngine>>,
    Path(site_id): Path<String>,
    Query(params): Query<SignedParams>,
) -> Result<Json<RunningTotal>, ApiError> {
    require_signature(&engine, &site_message(&site_id), params.sig.as_deref())?;
    let site_id = parse_site_id(&site_id)?;

    engine
        .running_total(site_id)
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::not_found(format!("No running total for site {}", site_id)))
}

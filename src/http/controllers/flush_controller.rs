use crate::http::controllers::require_signature;
use crate::http::error::ApiError;
use crate::http::models::SignedParams;
use crate::reconcile::ReconciliationReport;
use crate::signature::FLUSH_MESSAGE;
use crate::CounterEngine;
use axum::{
    extract::{Query, State},
    Json,
};
use chrono::Utc;
use std::sync::Arc;

/// Handler for POST /flush
///
/// Runs one reconciliation cycle now. Safe to call while the daily flush runs:
/// each dirty mark is consumed by exactly one drain.
#[tracing::instrument(name = "handler_flush", skip(engine, params))]
pub async fn flush_handler(
    State(engine): State<Arc<CounterEngine>>,
    Query(params): Query<SignedParams>,
) -> Result<Json<ReconciliationReport>, ApiError> {
    require_signature(&engine, FLUSH_MESSAGE, params.sig.as_deref())?;
    let report = engine.flush(Utc::now()).await?;
    Ok(Json(report))
}

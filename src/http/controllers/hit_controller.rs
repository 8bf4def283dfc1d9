use crate::http::controllers::{parse_site_id, require_signature};
use crate::http::cookies::{request_tokens, set_cookie};
use crate::http::error::ApiError;
use crate::http::models::SignedParams;
use crate::signature::site_message;
use crate::CounterEngine;
use axum::{
    extract::{Path, Query, State},
    http::{header, HeaderMap, HeaderValue},
    response::{IntoResponse, Response},
    Json,
};
use chrono::Utc;
use std::sync::Arc;

/// Handler for GET /hit/{site_id}
///
/// Records one hit and answers with the counters as of that hit. New
/// visitor tokens come back as cookies.
#[tracing::instrument(name = "handler_hit", skip(engine, params, headers), fields(webcounter.site_id = %site_id))]
pub async fn hit_handler(
    State(engine): State<Arc<CounterEngine>>,
    Path(site_id): Path<String>,
    Query(params): Query<SignedParams>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    require_signature(&engine, &site_message(&site_id), params.sig.as_deref())?;
    let site_id = parse_site_id(&site_id)?;

    let now = Utc::now();
    let outcome = engine
        .record_hit(site_id, &request_tokens(&headers), now)
        .await?;

    let mut response_headers = HeaderMap::new();
    response_headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-store"));
    for token in outcome.issued_tokens() {
        let cookie = HeaderValue::from_str(&set_cookie(token, now.timestamp()))
            .map_err(|e| ApiError::internal_error(format!("Invalid cookie value: {}", e)))?;
        response_headers.append(header::SET_COOKIE, cookie);
    }

    Ok((response_headers, Json(outcome.snapshot)).into_response())
}

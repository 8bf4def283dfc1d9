use serde::{Deserialize, Serialize};

/// Query string carrying only a request signature.
#[derive(Debug, Deserialize)]
pub struct SignedParams {
    pub sig: Option<String>,
}

/// Query string for GET /history/{site_id}
#[derive(Debug, Deserialize)]
pub struct HistoryParams {
    pub begin: Option<String>,
    pub end: Option<String>,
    pub sig: Option<String>,
}

/// Response body for GET /health
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub service: String,
}

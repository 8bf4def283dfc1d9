pub mod flush_controller;
pub mod health_controller;
pub mod history_controller;
pub mod hit_controller;
pub mod totals_controller;

pub use flush_controller::flush_handler;
pub use health_controller::health_handler;
pub use history_controller::history_handler;
pub use hit_controller::hit_handler;
pub use totals_controller::totals_handler;

use crate::error::CounterError;
use crate::http::error::ApiError;
use crate::CounterEngine;

/// Reject the request unless `sig` is a valid signature of `message`.
pub(crate) fn require_signature(
    engine: &CounterEngine,
    message: &str,
    sig: Option<&str>,
) -> Result<(), ApiError> {
    match sig {
        Some(sig) if engine.verifier().verify(message, sig) => Ok(()),
        _ => {
            tracing::debug!("Rejected request with missing or invalid signature");
            Err(CounterError::Unauthorized.into())
        }
    }
}

pub(crate) fn parse_site_id(raw: &str) -> Result<i64, ApiError> {
    match raw.parse::<i64>() {
        Ok(id) if id > 0 => Ok(id),
        _ => Err(ApiError::bad_request(format!(
            "site id must be a positive integer, got '{}'",
            raw
        ))),
    }
}

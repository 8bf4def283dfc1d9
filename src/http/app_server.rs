use crate::http::access_log_middleware::access_log_middleware;
use crate::http::controllers::{
    flush_handler, health_handler, history_handler, hit_handler, totals_handler,
};
use crate::CounterEngine;
use axum::routing::{get, post};
use axum::{middleware, Router};
use std::sync::Arc;

pub struct AppServer {
    pub router: Router,
    pub engine: Arc<CounterEngine>,
}

pub const PATH_HEALTH: &str = "/health";
pub const PATH_HIT: &str = "/hit/{site_id}";
pub const PATH_HISTORY: &str = "/history/{site_id}";
pub const PATH_FLUSH: &str = "/flush";
pub const PATH_TOTALS: &str = "/totals/{site_id}";

impl AppServer {
    pub fn new(engine: CounterEngine) -> Self {
        Self::from_shared(Arc::new(engine))
    }

    pub fn from_shared(engine: Arc<CounterEngine>) -> Self {
        AppServer {
            router: Router::new()
                .route(PATH_HEALTH, get(health_handler))
                .route(PATH_HIT, get(hit_handler))
                .route(PATH_HISTORY, get(history_handler))
                .route(PATH_FLUSH, post(flush_handler))
                .route(PATH_TOTALS, get(totals_handler))
                .layer(middleware::from_fn(access_log_middleware))
                .with_state(engine.clone()),
            engine,
        }
    }
}

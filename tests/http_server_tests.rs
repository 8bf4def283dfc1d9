use anyhow::Result;
use axum::response::Response;
use axum::{
    body::Body,
    http::{header, Request, StatusCode},
    Router,
};
use chrono::{Duration, Utc};
use std::sync::Arc;
use tempfile::TempDir;
use tower::util::ServiceExt;
use webcounter::counter::MemoryCounterStore;
use webcounter::history::SqliteHistoryStore;
use webcounter::http::app_server::{AppServer, PATH_FLUSH, PATH_HEALTH};
use webcounter::signature::{history_message, site_message, HmacVerifier, FLUSH_MESSAGE};
use webcounter::CounterEngine;

const SECRET: &str = "test-secret";

struct TestApp {
    router: Router,
    engine: Arc<CounterEngine>,
    store: Arc<MemoryCounterStore>,
    signer: HmacVerifier,
    _dir: TempDir,
}

async fn setup_test() -> Result<TestApp> {
    let dir = tempfile::tempdir()?;
    let db_path = dir.path().join("history.db");
    let history = SqliteHistoryStore::new(db_path.to_str().unwrap()).await?;
    let store = Arc::new(MemoryCounterStore::new());

    // Long window so a test never straddles an online-window boundary.
    let engine = CounterEngine::builder()
        .counter_store(store.clone())
        .history_store(Arc::new(history))
        .hmac_secret(SECRET)?
        .online_window_secs(3600)
        .build()
        .await?;

    let app = AppServer::new(engine);
    Ok(TestApp {
        router: app.router,
        engine: app.engine,
        store,
        signer: HmacVerifier::new(SECRET)?,
        _dir: dir,
    })
}

impl TestApp {
    fn hit_uri(&self, site_id: i64) -> String {
        format!(
            "/hit/{}?sig={}",
            site_id,
            self.signer.sign(&site_message(site_id))
        )
    }

    async fn get(&self, uri: &str, cookies: Option<&str>) -> Result<Response> {
        let mut request = Request::builder().method("GET").uri(uri);
        if let Some(cookies) = cookies {
            request = request.header(header::COOKIE, cookies);
        }
        Ok(self
            .router
            .clone()
            .oneshot(request.body(Body::empty())?)
            .await?)
    }

    async fn post(&self, uri: &str) -> Result<Response> {
        Ok(self
            .router
            .clone()
            .oneshot(Request::builder().method("POST").uri(uri).body(Body::empty())?)
            .await?)
    }
}

async fn json_body(response: Response) -> Result<serde_json::Value> {
    let body = axum::body::to_bytes(response.into_body(), usize::MAX).await?;
    Ok(serde_json::from_slice(&body)?)
}

/// `name=value` pairs from every Set-Cookie header, joined like a browser would send them.
fn cookie_jar(response: &Response) -> String {
    response
        .headers()
        .get_all(header::SET_COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .filter_map(|v| v.split(';').next())
        .collect::<Vec<_>>()
        .join("; ")
}

#[tokio::test(flavor = "multi_thread")]
async fn test_health_endpoint() -> Result<()> {
    let app = setup_test().await?;
    let response = app.get(PATH_HEALTH, None).await?;

    assert_eq!(response.status(), StatusCode::OK);
    let json = json_body(response).await?;
    assert_eq!(json["status"], "ok");
    assert_eq!(json["service"], "webcounter");
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn test_first_hit_counts_and_sets_cookies() -> Result<()> {
    let app = setup_test().await?;
    let response = app.get(&app.hit_uri(42), None).await?;

    assert_eq!(response.status(), StatusCode::OK);
    let cookies: Vec<String> = response
        .headers()
        .get_all(header::SET_COOKIE)
        .iter()
        .map(|v| v.to_str().unwrap().to_string())
        .collect();
    assert_eq!(cookies.len(), 2);
    assert!(cookies.iter().any(|c| c.starts_with("oid=") && c.contains("Max-Age=")));
    assert!(cookies.iter().any(|c| c.starts_with("sid=") && !c.contains("Max-Age=")));
    assert_eq!(response.headers()[header::CACHE_CONTROL], "no-store");

    let json = json_body(response).await?;
    assert_eq!(json["all_hits"], 1);
    assert_eq!(json["today_hits"], 1);
    assert_eq!(json["online"], 1);
    assert_eq!(json["all_visits"], 1);
    assert_eq!(json["today_visits"], 1);
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn test_returning_visitor_is_not_recounted() -> Result<()> {
    let app = setup_test().await?;
    let first = app.get(&app.hit_uri(42), None).await?;
    let jar = cookie_jar(&first);

    let second = app.get(&app.hit_uri(42), Some(&jar)).await?;
    assert_eq!(second.status(), StatusCode::OK);
    assert!(second.headers().get(header::SET_COOKIE).is_none());

    let json = json_body(second).await?;
    assert_eq!(json["all_hits"], 2);
    assert_eq!(json["today_hits"], 2);
    assert_eq!(json["online"], 1);
    assert_eq!(json["all_visits"], 1);
    assert_eq!(json["today_visits"], 1);
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn test_hit_rejects_missing_or_wrong_signature() -> Result<()> {
    let app = setup_test().await?;

    let missing = app.get("/hit/42", None).await?;
    assert_eq!(missing.status(), StatusCode::UNAUTHORIZED);
    let json = json_body(missing).await?;
    assert_eq!(json["error"]["code"], "UNAUTHORIZED");

    // Signed for a different site.
    let uri = format!("/hit/42?sig={}", app.signer.sign(&site_message(43)));
    let wrong = app.get(&uri, None).await?;
    assert_eq!(wrong.status(), StatusCode::UNAUTHORIZED);

    assert_eq!(app.store.batch_count(), 0, "rejected requests must not touch counters");
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn test_hit_rejects_bad_site_id() -> Result<()> {
    let app = setup_test().await?;
    for raw in ["abc", "0", "-5"] {
        let uri = format!("/hit/{}?sig={}", raw, app.signer.sign(raw));
        let response = app.get(&uri, None).await?;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST, "site id {}", raw);
        let json = json_body(response).await?;
        assert_eq!(json["error"]["code"], "BAD_REQUEST");
    }
    assert_eq!(app.store.batch_count(), 0);
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn test_hit_reports_unavailable_store() -> Result<()> {
    let app = setup_test().await?;
    app.store.set_unavailable(true);

    let response = app.get(&app.hit_uri(42), None).await?;
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert!(response.headers().get(header::SET_COOKIE).is_none());
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn test_flush_then_history_and_totals() -> Result<()> {
    let app = setup_test().await?;
    let totals_uri = format!("/totals/42?sig={}", app.signer.sign(&site_message(42)));

    let before = app.get(&totals_uri, None).await?;
    assert_eq!(before.status(), StatusCode::NOT_FOUND);

    for _ in 0..3 {
        let response = app.get(&app.hit_uri(42), None).await?;
        assert_eq!(response.status(), StatusCode::OK);
    }

    // Reconcile the day the hits landed on.
    let hit_day = app.engine.keys().day_of(Utc::now());
    let report = app.engine.flush(Utc::now() + Duration::days(1)).await?;
    assert_eq!(report.date, hit_day);
    assert_eq!(report.sites_succeeded, 1);

    let day = hit_day.format("%Y-%m-%d").to_string();
    let uri = format!(
        "/history/42?begin={}&end={}&sig={}",
        day,
        day,
        app.signer.sign(&history_message(42, &day, &day))
    );
    let response = app.get(&uri, None).await?;
    assert_eq!(response.status(), StatusCode::OK);
    let json = json_body(response).await?;
    let rows = json.as_array().unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["site_id"], 42);
    assert_eq!(rows[0]["date"], day);
    assert_eq!(rows[0]["all_hits"], 3);
    assert_eq!(rows[0]["day_hits"], 3);
    assert_eq!(rows[0]["all_visits"], 3);

    let totals = app.get(&totals_uri, None).await?;
    assert_eq!(totals.status(), StatusCode::OK);
    let json = json_body(totals).await?;
    assert_eq!(json["all_hits"], 3);
    assert_eq!(json["all_visits"], 3);
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn test_history_validates_range() -> Result<()> {
    let app = setup_test().await?;

    let (begin, end) = ("2024-02-01", "2024-01-01");
    let uri = format!(
        "/history/42?begin={}&end={}&sig={}",
        begin,
        end,
        app.signer.sign(&history_message(42, begin, end))
    );
    let inverted = app.get(&uri, None).await?;
    assert_eq!(inverted.status(), StatusCode::BAD_REQUEST);

    let (begin, end) = ("2024-1-1", "2024-01-31");
    let uri = format!(
        "/history/42?begin={}&end={}&sig={}",
        begin,
        end,
        app.signer.sign(&history_message(42, begin, end))
    );
    let malformed = app.get(&uri, None).await?;
    assert_eq!(malformed.status(), StatusCode::BAD_REQUEST);

    // Signature covers the dates.
    let uri = format!(
        "/history/42?begin=2024-01-01&end=2024-12-31&sig={}",
        app.signer.sign(&history_message(42, "2024-01-01", "2024-01-31"))
    );
    let tampered = app.get(&uri, None).await?;
    assert_eq!(tampered.status(), StatusCode::UNAUTHORIZED);
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn test_history_missing_dates_use_json_error() -> Result<()> {
    let app = setup_test().await?;

    for uri in [
        "/history/42?end=2024-01-31&sig=00",
        "/history/42?begin=2024-01-01&sig=00",
        "/history/42",
    ] {
        let response = app.get(uri, None).await?;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST, "{}", uri);
        let json = json_body(response).await?;
        assert_eq!(json["error"]["code"], "BAD_REQUEST");
        assert!(json["error"]["message"]
            .as_str()
            .unwrap()
            .contains("missing query parameter"));
    }
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn test_flush_endpoint_requires_signature() -> Result<()> {
    let app = setup_test().await?;
    app.get(&app.hit_uri(7), None).await?;

    let unsigned = app.post(PATH_FLUSH).await?;
    assert_eq!(unsigned.status(), StatusCode::UNAUTHORIZED);

    let uri = format!("{}?sig={}", PATH_FLUSH, app.signer.sign(FLUSH_MESSAGE));
    let response = app.post(&uri).await?;
    assert_eq!(response.status(), StatusCode::OK);
    let json = json_body(response).await?;
    assert_eq!(json["sites_processed"], 1);
    assert_eq!(json["outcomes"][0]["site_id"], 7);
    Ok(())
}

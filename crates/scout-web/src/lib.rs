//! Axum JSON admin surface for Scout: markets, jobs and the listing read contract.

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use scout_core::{JobStatus, Listing, MarketUpdate, NewMarket, ScrapeJob, MAX_SCRAPE_INTERVAL_HOURS};
use scout_storage::{JobLedger, JobQuery, ListingQuery, ListingStore, MarketRegistry, Page, StoreError};
use scout_sync::{Engine, EngineError, OrchestratorError};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::net::TcpListener;
use tracing::{error, info};
use uuid::Uuid;

pub const CRATE_NAME: &str = "scout-web";

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<Engine>,
}

impl AppState {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self { engine }
    }
}

#[derive(Debug, Deserialize, Default)]
struct JobsParams {
    market: Option<String>,
    status: Option<String>,
    page: Option<u32>,
    per_page: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
struct ListingsParams {
    market: Option<String>,
    min_confidence: Option<u8>,
    active: Option<bool>,
    page: Option<u32>,
    per_page: Option<u32>,
}

#[derive(Debug, Serialize)]
struct JobView {
    #[serde(flatten)]
    job: ScrapeJob,
    duration_seconds: i64,
}

impl From<ScrapeJob> for JobView {
    fn from(job: ScrapeJob) -> Self {
        Self {
            duration_seconds: job.duration_seconds(Utc::now()),
            job,
        }
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz_handler))
        .route("/markets", get(list_markets_handler).post(create_market_handler))
        .route("/markets/{id}", get(get_market_handler).patch(update_market_handler))
        .route("/markets/{id}/scrape", post(trigger_scrape_handler))
        .route("/jobs", get(list_jobs_handler))
        .route("/jobs/{id}", get(get_job_handler))
        .route("/listings", get(list_listings_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(state: AppState, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "admin server listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn healthz_handler() -> Response {
    Json(json!({ "status": "ok" })).into_response()
}

async fn list_markets_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.engine.stores().markets.list_markets().await {
        Ok(markets) => Json(markets).into_response(),
        Err(err) => store_error(err),
    }
}

async fn create_market_handler(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<NewMarket>,
) -> Response {
    if let Some(problem) = validate_new_market(&payload) {
        return unprocessable(problem);
    }
    let market = payload.into_market(Utc::now());
    match state.engine.stores().markets.create_market(market).await {
        Ok(market) => {
            info!(market_id = %market.id, "market created");
            (StatusCode::CREATED, Json(market)).into_response()
        }
        Err(err) => store_error(err),
    }
}

async fn get_market_handler(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> Response {
    match state.engine.stores().markets.get_market(&id).await {
        Ok(Some(market)) => Json(market).into_response(),
        Ok(None) => not_found(format!("market {id} not found")),
        Err(err) => store_error(err),
    }
}

async fn update_market_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(update): Json<MarketUpdate>,
) -> Response {
    if update.is_empty() {
        return unprocessable("update contains no fields".to_string());
    }
    if let Some(problem) = validate_update(&update) {
        return unprocessable(problem);
    }
    match state.engine.stores().markets.update_config(&id, &update).await {
        Ok(Some(market)) => Json(market).into_response(),
        Ok(None) => not_found(format!("market {id} not found")),
        Err(err) => store_error(err),
    }
}

async fn trigger_scrape_handler(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> Response {
    match state.engine.enqueue_manual_scrape(&id).await {
        Ok(()) => (
            StatusCode::ACCEPTED,
            Json(json!({ "market_id": id, "status": "queued" })),
        )
            .into_response(),
        Err(EngineError::Orchestrator(OrchestratorError::MarketNotFound(_))) => {
            not_found(format!("market {id} not found"))
        }
        Err(err) => server_error(err.to_string()),
    }
}

async fn list_jobs_handler(State(state): State<Arc<AppState>>, Query(params): Query<JobsParams>) -> Response {
    let status = match params.status.as_deref().map(str::parse::<JobStatus>).transpose() {
        Ok(status) => status,
        Err(err) => return unprocessable(err.to_string()),
    };
    let query = JobQuery {
        market_id: params.market,
        status,
        page: params.page.unwrap_or(1),
        per_page: params.per_page.unwrap_or(0),
    };
    match state.engine.stores().jobs.list_jobs(&query).await {
        Ok(page) => Json(Page {
            items: page.items.into_iter().map(JobView::from).collect::<Vec<_>>(),
            total: page.total,
            page: page.page,
            per_page: page.per_page,
        })
        .into_response(),
        Err(err) => store_error(err),
    }
}

async fn get_job_handler(State(state): State<Arc<AppState>>, Path(id): Path<Uuid>) -> Response {
    match state.engine.stores().jobs.get_job(id).await {
        Ok(Some(job)) => Json(JobView::from(job)).into_response(),
        Ok(None) => not_found(format!("job {id} not found")),
        Err(err) => store_error(err),
    }
}

async fn list_listings_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<ListingsParams>,
) -> Response {
    if params.min_confidence.is_some_and(|c| c > 100) {
        return unprocessable("min_confidence must be between 0 and 100".to_string());
    }
    let query = ListingQuery {
        market_id: params.market,
        min_confidence: params.min_confidence,
        active: params.active,
        page: params.page.unwrap_or(1),
        per_page: params.per_page.unwrap_or(0),
    };
    let result: Result<Page<Listing>, StoreError> = state.engine.stores().listings.search_listings(&query).await;
    match result {
        Ok(page) => Json(page).into_response(),
        Err(err) => store_error(err),
    }
}

fn validate_new_market(market: &NewMarket) -> Option<String> {
    for (field, value) in [
        ("id", &market.id),
        ("display_name", &market.display_name),
        ("city", &market.city),
        ("state", &market.state),
    ] {
        if value.trim().is_empty() {
            return Some(format!("`{field}` must not be empty"));
        }
    }
    positive_fields(
        market.max_items_per_scrape,
        market.scrape_interval_hours,
        market.decay_rate_per_hour,
    )
}

fn validate_update(update: &MarketUpdate) -> Option<String> {
    for (field, value) in [
        ("display_name", &update.display_name),
        ("city", &update.city),
        ("state", &update.state),
    ] {
        if value.as_deref().is_some_and(|v| v.trim().is_empty()) {
            return Some(format!("`{field}` must not be empty"));
        }
    }
    positive_fields(
        update.max_items_per_scrape,
        update.scrape_interval_hours,
        update.decay_rate_per_hour,
    )
}

fn positive_fields(max_items: Option<u32>, interval: Option<u32>, decay: Option<u32>) -> Option<String> {
    if let Some(zero) = [
        ("max_items_per_scrape", max_items),
        ("scrape_interval_hours", interval),
        ("decay_rate_per_hour", decay),
    ]
    .into_iter()
    .find(|(_, value)| *value == Some(0))
    {
        return Some(format!("`{}` must be positive", zero.0));
    }
    interval
        .filter(|hours| *hours > MAX_SCRAPE_INTERVAL_HOURS)
        .map(|_| format!("`scrape_interval_hours` must be at most {MAX_SCRAPE_INTERVAL_HOURS}"))
}

fn not_found(message: String) -> Response {
    (StatusCode::NOT_FOUND, Json(json!({ "error": message }))).into_response()
}

fn unprocessable(message: String) -> Response {
    (StatusCode::UNPROCESSABLE_ENTITY, Json(json!({ "error": message }))).into_response()
}

fn server_error(message: String) -> Response {
    error!(error = %message, "request failed");
    (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({ "error": message }))).into_response()
}

fn store_error(err: StoreError) -> Response {
    match err {
        StoreError::Conflict(message) => (StatusCode::CONFLICT, Json(json!({ "error": message }))).into_response(),
        other => server_error(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::{header, Request};
    use http_body_util::BodyExt;
    use scout_connectors::{BasicNormalizer, ConnectorError, ListingProbe, ProbeError, ScraperConnector};
    use scout_core::{MarketLocator, RawListing, Verdict};
    use scout_storage::MemoryStore;
    use scout_sync::{BufferedQueue, Collaborators, EngineSettings, RetryPolicy, Stores, WorkItem};
    use serde_json::Value;
    use tower::ServiceExt;

    struct NoListings;

    #[async_trait]
    impl ScraperConnector for NoListings {
        fn source_id(&self) -> &str {
            "test_source"
        }

        async fn fetch(&self, _: &MarketLocator, _: u32) -> Result<Vec<RawListing>, ConnectorError> {
            Ok(vec![])
        }
    }

    struct Live;

    #[async_trait]
    impl ListingProbe for Live {
        async fn probe(&self, _: &str) -> Result<Verdict, ProbeError> {
            Ok(Verdict::Verified)
        }
    }

    fn test_app() -> (Router, Arc<BufferedQueue>) {
        let store = Arc::new(MemoryStore::new());
        let queue = Arc::new(BufferedQueue::new());
        let engine = Engine::new(
            Stores::shared(store),
            queue.clone(),
            Collaborators {
                connector: Arc::new(NoListings),
                normalizer: Arc::new(BasicNormalizer::new()),
                probe: Arc::new(Live),
            },
            EngineSettings {
                retry: RetryPolicy::immediate(),
                max_stagger: Duration::ZERO,
                ..EngineSettings::default()
            },
        );
        (app(AppState::new(Arc::new(engine))), queue)
    }

    fn json_request(method: &str, uri: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    async fn body_json(resp: Response) -> Value {
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn boston() -> Value {
        json!({
            "id": "boston",
            "display_name": "Boston",
            "city": "Boston",
            "state": "MA",
            "tier": "hot"
        })
    }

    #[tokio::test]
    async fn healthz_reports_ok() {
        let (app, _) = test_app();
        let resp = app.oneshot(get("/healthz")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_json(resp).await["status"], "ok");
    }

    #[tokio::test]
    async fn market_lifecycle_create_conflict_update() {
        let (app, _) = test_app();

        let created = app.clone().oneshot(json_request("POST", "/markets", boston())).await.unwrap();
        assert_eq!(created.status(), StatusCode::CREATED);
        let market = body_json(created).await;
        assert_eq!(market["scrape_interval_hours"], 6);
        assert_eq!(market["enabled"], true);

        let dup = app.clone().oneshot(json_request("POST", "/markets", boston())).await.unwrap();
        assert_eq!(dup.status(), StatusCode::CONFLICT);

        let patched = app
            .clone()
            .oneshot(json_request("PATCH", "/markets/boston", json!({ "tier": "cool" })))
            .await
            .unwrap();
        assert_eq!(patched.status(), StatusCode::OK);
        let market = body_json(patched).await;
        assert_eq!(market["tier"], "cool");
        assert_eq!(market["scrape_interval_hours"], 24);

        let listed = app.oneshot(get("/markets")).await.unwrap();
        assert_eq!(body_json(listed).await.as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn invalid_payloads_are_unprocessable() {
        let (app, _) = test_app();
        let mut blank = boston();
        blank["city"] = json!("  ");
        let resp = app.clone().oneshot(json_request("POST", "/markets", blank)).await.unwrap();
        assert_eq!(resp.status(), StatusCode::UNPROCESSABLE_ENTITY);
        assert!(body_json(resp).await["error"].as_str().unwrap().contains("city"));

        let empty = app
            .clone()
            .oneshot(json_request("PATCH", "/markets/boston", json!({})))
            .await
            .unwrap();
        assert_eq!(empty.status(), StatusCode::UNPROCESSABLE_ENTITY);

        let huge_interval = app
            .clone()
            .oneshot(json_request(
                "PATCH",
                "/markets/boston",
                json!({ "scrape_interval_hours": u32::MAX }),
            ))
            .await
            .unwrap();
        assert_eq!(huge_interval.status(), StatusCode::UNPROCESSABLE_ENTITY);
        assert!(body_json(huge_interval)
            .await["error"]
            .as_str()
            .unwrap()
            .contains("scrape_interval_hours"));

        let bad_status = app.oneshot(get("/jobs?status=exploded")).await.unwrap();
        assert_eq!(bad_status.status(), StatusCode::UNPROCESSABLE_ENTITY);
    }

    #[tokio::test]
    async fn unknown_resources_are_not_found() {
        let (app, _) = test_app();
        let market = app.clone().oneshot(get("/markets/atlantis")).await.unwrap();
        assert_eq!(market.status(), StatusCode::NOT_FOUND);

        let job = app
            .clone()
            .oneshot(get(&format!("/jobs/{}", Uuid::new_v4())))
            .await
            .unwrap();
        assert_eq!(job.status(), StatusCode::NOT_FOUND);

        let scrape = app
            .oneshot(Request::builder().method("POST").uri("/markets/atlantis/scrape").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(scrape.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn manual_scrape_is_accepted_and_queued() {
        let (app, queue) = test_app();
        app.clone().oneshot(json_request("POST", "/markets", boston())).await.unwrap();

        let resp = app
            .oneshot(Request::builder().method("POST").uri("/markets/boston/scrape").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::ACCEPTED);
        assert!(matches!(
            queue.take().as_slice(),
            [WorkItem::Scrape { market_id, .. }] if market_id == "boston"
        ));
    }

    #[tokio::test]
    async fn listings_and_jobs_are_paginated() {
        let (app, _) = test_app();
        let listings = app.clone().oneshot(get("/listings?min_confidence=40&active=true")).await.unwrap();
        assert_eq!(listings.status(), StatusCode::OK);
        let page = body_json(listings).await;
        assert_eq!(page["total"], 0);
        assert_eq!(page["page"], 1);

        let jobs = app.oneshot(get("/jobs?market=boston&per_page=10")).await.unwrap();
        assert_eq!(jobs.status(), StatusCode::OK);
        assert_eq!(body_json(jobs).await["per_page"], 10);
    }
}

mod batch;
mod coverage;
mod export;
mod http;
mod idempotency;
mod jobs;
mod llm;
mod metrics;
mod models;
mod phases;
mod poller;
mod scraper;
mod security;
mod store;
mod supabase;

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use batch::BatchError;
use llm::{LlmClient, LlmConfig};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use models::{
    ApiError, BatchLookupRequest, BatchReport, CreateListingRequest, IntelJobRequest, JobKind,
    ListingJob, ReviewsJobRequest, Review, SectionEditRequest, SelectionRequest,
};
use phases::{LlmPhaseGenerator, PhaseError, PhaseErrorKind};
use poller::{PollEvent, Poller};
use scraper::ScraperClient;
use security::{AuthState, require_api_auth};
use serde::Serialize;
use serde_json::json;
use std::{collections::HashMap, net::SocketAddr, sync::Arc};
use store::{JobStore, ListingStore, StoreError};
use supabase::SupabaseClient;
use tokio::sync::Mutex;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, fmt};

#[tokio::main]
async fn main() {
    let _ = dotenvy::dotenv();
    if let Err(err) = run().await {
        error!(target = "listforge.api", "server crashed: {err}");
    }
}

async fn run() -> eyre::Result<()> {
    init_tracing();

    let auth_state = AuthState::from_env();
    let listing_store = ListingStore::default();
    let job_store = JobStore::default();
    let scraper = ScraperClient::new();
    let llm = Arc::new(LlmClient::new(LlmConfig::from_env()));
    let generator = Arc::new(LlmPhaseGenerator::new(llm.clone()));
    let (queue, _worker) = jobs::JobQueue::spawn(job_store.clone(), scraper.clone(), llm);

    let (poller, events) = Poller::spawn(job_store.clone(), poller::poll_interval_from_env());
    let poller = Arc::new(poller);
    poller.resume(&job_store.non_terminal_ids().await).await;
    spawn_notification_sink(events);

    let openapi: serde_json::Value =
        serde_yaml::from_str(include_str!("../docs/openapi.yaml"))
            .unwrap_or(json!({"openapi":"3.0.3"}));
    let prometheus_handle = PrometheusBuilder::new()
        .install_recorder()
        .expect("prom recorder");
    let redis = std::env::var("REDIS_URL")
        .ok()
        .and_then(|u| redis::Client::open(u).ok());

    let state = AppState {
        listing_store,
        job_store,
        queue,
        poller,
        scraper,
        generator,
        supabase: SupabaseClient::from_env(),
        openapi: Arc::new(openapi),
        idempotency: Arc::new(Mutex::new(HashMap::new())),
        prometheus_handle,
        redis,
    };

    let cors = CorsLayer::new()
        .allow_headers(Any)
        .allow_methods(Any)
        .allow_origin(Any);

    let protected = Router::new()
        .route("/asins/lookup", post(batch_lookup))
        .route("/listings", post(create_listing))
        .route("/listings/{id}", get(get_listing))
        .route("/listings/{id}/sections", post(edit_section))
        .route("/listings/{id}/advance", post(advance_listing))
        .route("/listings/{id}/retry", post(retry_listing))
        .route("/listings/{id}/reset", post(reset_listing))
        .route("/listings/{id}/export", get(export_listing))
        .nest(
            "/jobs",
            Router::new()
                .route("/reviews", post(enqueue_reviews_job))
                .route("/intel", post(enqueue_intel_job))
                .route("/{id}", get(get_job).patch(patch_job))
                .route("/{id}/select", post(select_job_asins))
                .route("/{id}/reviews.csv", get(job_reviews_csv)),
        )
        .route_layer(middleware::from_fn_with_state(auth_state, require_api_auth));

    let app = Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics_endpoint))
        .route("/openapi.json", get(openapi_json))
        .route("/docs", get(swagger_ui))
        .merge(protected)
        .with_state(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .layer(axum::extract::DefaultBodyLimit::max(body_limit_from_env()));

    let port: u16 = std::env::var("PORT")
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(8000);
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    info!(target = "listforge.api", "listening on {addr}");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app.into_make_service()).await?;
    Ok(())
}

#[derive(Clone)]
struct AppState {
    listing_store: ListingStore,
    job_store: JobStore,
    queue: jobs::JobQueue,
    poller: Arc<Poller>,
    scraper: ScraperClient,
    generator: Arc<LlmPhaseGenerator>,
    supabase: Option<SupabaseClient>,
    openapi: Arc<serde_json::Value>,
    idempotency: Arc<Mutex<HashMap<String, BatchReport>>>,
    prometheus_handle: PrometheusHandle,
    redis: Option<redis::Client>,
}

/// Drains poller events so each terminal notification is surfaced exactly
/// once in the logs even when no websocket client is attached.
fn spawn_notification_sink(mut events: tokio::sync::mpsc::Receiver<PollEvent>) {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                PollEvent::Progress { id, status, progress } => {
                    info!(
                        target = "listforge.poller",
                        job_id = %id,
                        status = ?status,
                        step = %progress.step,
                        current = progress.current,
                        total = progress.total,
                        "job progress"
                    );
                }
                PollEvent::Completed { id } => {
                    info!(target = "listforge.poller", job_id = %id, "job completed");
                }
                PollEvent::Failed { id, error } => {
                    warn!(target = "listforge.poller", job_id = %id, error = %error, "job failed");
                }
            }
        }
    });
}

/// Health and readiness check.
///
/// - Method: `GET`
/// - Path: `/health`
/// - Auth: none
async fn health() -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "service": "listforge-api-rs",
    }))
}

async fn openapi_json(
    State(state): State<AppState>,
    headers: axum::http::HeaderMap,
) -> Result<Json<serde_json::Value>, AppError> {
    if let Ok(key) = std::env::var("OPENAPI_KEY") {
        let presented = headers
            .get("X-Docs-Key")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        if presented != key {
            return Err(AppError::Phase(PhaseError::invalid_input(
                "docs",
                "unauthorized",
            )));
        }
    }
    Ok(Json((*state.openapi).clone()))
}

async fn swagger_ui() -> axum::http::Response<String> {
    let html = r#"<!doctype html>
<html>
<head>
  <meta charset='utf-8'/>
  <title>Listforge API Docs</title>
  <link rel="stylesheet" href="https://unpkg.com/swagger-ui-dist@5/swagger-ui.css" />
</head>
<body>
  <div id="swagger-ui"></div>
  <script src="https://unpkg.com/swagger-ui-dist@5/swagger-ui-bundle.js"></script>
  <script>
    window.onload = () => {
      window.ui = SwaggerUIBundle({ url: '/openapi.json', dom_id: '#swagger-ui' });
    };
  </script>
</body>
</html>"#;
    axum::http::Response::builder()
        .header("Content-Type", "text/html; charset=utf-8")
        .body(html.to_string())
        .unwrap()
}

async fn metrics_endpoint(
    State(state): State<AppState>,
    headers: axum::http::HeaderMap,
) -> axum::http::Response<String> {
    if let Ok(secret) = std::env::var("METRICS_KEY") {
        let presented = headers
            .get("X-Metrics-Key")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        if presented != secret {
            return axum::http::Response::builder()
                .status(StatusCode::UNAUTHORIZED)
                .body("unauthorized".into())
                .unwrap();
        }
    }
    let body = state.prometheus_handle.render();
    axum::http::Response::builder()
        .header("Content-Type", "text/plain; version=0.0.4")
        .body(body)
        .unwrap()
}

fn body_limit_from_env() -> usize {
    std::env::var("REQUEST_MAX_BYTES")
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(256 * 1024)
}

/// Look up up to ten ASINs in one call.
///
/// - Method: `POST`
/// - Path: `/asins/lookup`
/// - Auth: `Authorization: Bearer <key>` or `X-Listforge-Key: <key>`
/// - Body: `BatchLookupRequest`
/// - Response: `BatchReport` with one entry per key, successes and
///   failures side by side
async fn batch_lookup(
    State(state): State<AppState>,
    headers: axum::http::HeaderMap,
    Json(payload): Json<BatchLookupRequest>,
) -> Result<Json<BatchReport>, AppError> {
    metrics::inc_requests("/asins/lookup");

    if let Some(key) = headers
        .get("Idempotency-Key")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
    {
        if let Some(client) = &state.redis {
            if let Some(existing) = idempotency::redis_get(client, &key).await {
                return Ok(Json(existing));
            }
            let report = run_batch_lookup(&state, &payload).await?;
            let ttl = std::env::var("IDEMPOTENCY_TTL_SECS")
                .ok()
                .and_then(|v| v.parse::<usize>().ok())
                .unwrap_or(3600);
            idempotency::redis_set(client, &key, &report, ttl).await;
            return Ok(Json(report));
        }
        if let Some(existing) = state.idempotency.lock().await.get(&key).cloned() {
            return Ok(Json(existing));
        }
        let report = run_batch_lookup(&state, &payload).await?;
        state.idempotency.lock().await.insert(key, report.clone());
        return Ok(Json(report));
    }

    let report = run_batch_lookup(&state, &payload).await?;
    Ok(Json(report))
}

async fn run_batch_lookup(
    state: &AppState,
    payload: &BatchLookupRequest,
) -> Result<BatchReport, AppError> {
    let scraper = state.scraper.clone();
    let marketplace = payload.marketplace;
    let report = batch::fetch_batch(
        &payload.keys,
        |key| {
            let scraper = scraper.clone();
            async move { scraper.lookup_product(&key, marketplace).await }
        },
        |_key, _data| async {},
    )
    .await?;
    Ok(report)
}

/// Start a new listing from product details and scored keywords. The
/// listing is created in the `pending` phase; drive it forward with
/// `/listings/{id}/advance`.
async fn create_listing(
    State(state): State<AppState>,
    Json(payload): Json<CreateListingRequest>,
) -> Result<(StatusCode, Json<ListingJob>), AppError> {
    metrics::inc_requests("/listings");
    if payload.product.name.trim().is_empty() {
        return Err(AppError::Phase(PhaseError::invalid_input(
            "pending",
            "product name is required",
        )));
    }
    let job = ListingJob::new(payload.product.clone(), payload.keywords.clone(), payload.marketplace);
    state.listing_store.insert(job.clone()).await;
    if let Some(supabase) = &state.supabase {
        supabase.upsert_listing(&job).await;
    }
    info!(target = "listforge.api", listing_id = %job.id, "listing created");
    Ok((StatusCode::CREATED, Json(job)))
}

async fn get_listing(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ListingJob>, AppError> {
    let id = parse_id(&id)?;
    let job = state
        .listing_store
        .get(id)
        .await
        .ok_or(AppError::NotFound("listing"))?;
    Ok(Json(job))
}

/// Generate the next phase's sections and confirm the current ones.
///
/// Fails with 400 when a visible section of the current phase still has
/// empty final text; with 502/504 when the provider errors or times out,
/// in which case the listing keeps its phase and records the error for
/// `/retry`.
async fn advance_listing(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ListingJob>, AppError> {
    metrics::inc_requests("/listings/advance");
    let id = parse_id(&id)?;
    let mut job = state
        .listing_store
        .get(id)
        .await
        .ok_or(AppError::NotFound("listing"))?;

    let started = std::time::Instant::now();
    let outcome = phases::advance(&mut job, state.generator.as_ref()).await;
    metrics::phase_elapsed(job.phase.label(), started.elapsed().as_millis());

    // Provider failures still mutate the record (generation_error), so the
    // write-back happens on both paths.
    persist_listing(&state, &job).await;
    outcome?;
    Ok(Json(job))
}

async fn retry_listing(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ListingJob>, AppError> {
    metrics::inc_requests("/listings/retry");
    let id = parse_id(&id)?;
    let mut job = state
        .listing_store
        .get(id)
        .await
        .ok_or(AppError::NotFound("listing"))?;
    let outcome = phases::retry(&mut job, state.generator.as_ref()).await;
    persist_listing(&state, &job).await;
    outcome?;
    Ok(Json(job))
}

async fn reset_listing(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ListingJob>, AppError> {
    metrics::inc_requests("/listings/reset");
    let id = parse_id(&id)?;
    let mut job = state
        .listing_store
        .get(id)
        .await
        .ok_or(AppError::NotFound("listing"))?;
    phases::reset(&mut job);
    persist_listing(&state, &job).await;
    Ok(Json(job))
}

/// Select a variation or write final text for one unapproved section.
async fn edit_section(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(payload): Json<SectionEditRequest>,
) -> Result<Json<ListingJob>, AppError> {
    metrics::inc_requests("/listings/sections");
    let id = parse_id(&id)?;
    let mut job = state
        .listing_store
        .get(id)
        .await
        .ok_or(AppError::NotFound("listing"))?;
    phases::edit_section(&mut job, &payload)?;
    persist_listing(&state, &job).await;
    Ok(Json(job))
}

#[derive(Debug, serde::Deserialize)]
struct ExportParams {
    #[serde(default)]
    format: Option<String>,
}

/// Plain-text listing export; `?format=csv` returns the keyword coverage
/// table instead.
async fn export_listing(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(params): Query<ExportParams>,
) -> Result<Response, AppError> {
    metrics::inc_requests("/listings/export");
    let id = parse_id(&id)?;
    let job = state
        .listing_store
        .get(id)
        .await
        .ok_or(AppError::NotFound("listing"))?;
    if params.format.as_deref() == Some("csv") {
        let body = export::coverage_csv(&job.coverage);
        return Ok((
            [(axum::http::header::CONTENT_TYPE, "text/csv; charset=utf-8")],
            body,
        )
            .into_response());
    }
    let body = export::listing_text(&job);
    Ok((
        [(axum::http::header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        body,
    )
        .into_response())
}

async fn persist_listing(state: &AppState, job: &ListingJob) {
    state.listing_store.insert(job.clone()).await;
    if let Some(supabase) = &state.supabase {
        supabase.upsert_listing(job).await;
    }
}

#[derive(Debug, Serialize)]
struct EnqueueResponse {
    job_id: String,
}

/// Collect customer reviews for up to ten ASINs in the background; watch
/// progress via `GET /jobs/{id}`.
async fn enqueue_reviews_job(
    State(state): State<AppState>,
    Json(payload): Json<ReviewsJobRequest>,
) -> Result<(StatusCode, Json<EnqueueResponse>), AppError> {
    metrics::inc_requests("/jobs/reviews");
    let id = state
        .queue
        .enqueue_reviews(payload)
        .await
        .map_err(AppError::from_api)?;
    state.poller.track(id).await;
    Ok((
        StatusCode::ACCEPTED,
        Json(EnqueueResponse {
            job_id: id.to_string(),
        }),
    ))
}

/// Start a market-intel job from a seed keyword. The job parks in
/// `awaiting_selection` once candidates are found; resume it with
/// `POST /jobs/{id}/select`.
async fn enqueue_intel_job(
    State(state): State<AppState>,
    Json(payload): Json<IntelJobRequest>,
) -> Result<(StatusCode, Json<EnqueueResponse>), AppError> {
    metrics::inc_requests("/jobs/intel");
    let id = state
        .queue
        .enqueue_intel(payload)
        .await
        .map_err(AppError::from_api)?;
    state.poller.track(id).await;
    Ok((
        StatusCode::ACCEPTED,
        Json(EnqueueResponse {
            job_id: id.to_string(),
        }),
    ))
}

async fn select_job_asins(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(payload): Json<SelectionRequest>,
) -> Result<StatusCode, AppError> {
    metrics::inc_requests("/jobs/select");
    let id = parse_id(&id)?;
    state
        .queue
        .submit_selection(id, payload.asins)
        .await
        .map_err(AppError::from_api)?;
    state.poller.track(id).await;
    Ok(StatusCode::ACCEPTED)
}

async fn get_job(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<models::BackgroundJob>, AppError> {
    let id = parse_id(&id)?;
    let job = state
        .job_store
        .get(id)
        .await
        .ok_or(AppError::NotFound("job"))?;
    Ok(Json(job))
}

/// RFC 7386 merge-patch against the stored job record. Replaying the
/// same patch is a no-op; the response says whether anything changed.
async fn patch_job(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(patch): Json<serde_json::Value>,
) -> Result<Json<serde_json::Value>, AppError> {
    metrics::inc_requests("/jobs/patch");
    let id = parse_id(&id)?;
    let changed = state.job_store.merge_patch(id, &patch).await?;
    if changed
        && let Some(supabase) = &state.supabase
        && let Some(job) = state.job_store.get(id).await
    {
        supabase.upsert_background_job(&job).await;
    }
    Ok(Json(json!({ "changed": changed })))
}

async fn job_reviews_csv(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response, AppError> {
    metrics::inc_requests("/jobs/reviews.csv");
    let id = parse_id(&id)?;
    let job = state
        .job_store
        .get(id)
        .await
        .ok_or(AppError::NotFound("job"))?;
    if job.kind != JobKind::Reviews {
        return Err(AppError::Phase(PhaseError::invalid_input(
            "jobs",
            "CSV export applies to review jobs only",
        )));
    }
    let reviews: Vec<Review> = job
        .result
        .as_ref()
        .and_then(|value| value.get("reviews").cloned())
        .and_then(|value| serde_json::from_value(value).ok())
        .unwrap_or_default();
    let body = export::reviews_csv(&reviews);
    Ok((
        [
            (axum::http::header::CONTENT_TYPE, "text/csv; charset=utf-8"),
            (
                axum::http::header::CONTENT_DISPOSITION,
                "attachment; filename=\"reviews.csv\"",
            ),
        ],
        body,
    )
        .into_response())
}

fn parse_id(raw: &str) -> Result<uuid::Uuid, AppError> {
    uuid::Uuid::parse_str(raw).map_err(|_| {
        AppError::Phase(PhaseError::invalid_input("routing", "invalid id"))
    })
}

#[derive(Debug)]
enum AppError {
    Phase(PhaseError),
    Store(StoreError),
    Batch(BatchError),
    NotFound(&'static str),
    BadRequest(ApiError),
}

impl AppError {
    fn from_api(err: ApiError) -> Self {
        if err.error == "not_found" {
            AppError::NotFound("job")
        } else {
            AppError::BadRequest(err)
        }
    }
}

impl From<PhaseError> for AppError {
    fn from(value: PhaseError) -> Self {
        Self::Phase(value)
    }
}

impl From<StoreError> for AppError {
    fn from(value: StoreError) -> Self {
        Self::Store(value)
    }
}

impl From<BatchError> for AppError {
    fn from(value: BatchError) -> Self {
        Self::Batch(value)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        match self {
            AppError::Phase(err) => {
                let status = match err.kind() {
                    PhaseErrorKind::InvalidInput => StatusCode::BAD_REQUEST,
                    PhaseErrorKind::Provider => StatusCode::BAD_GATEWAY,
                    PhaseErrorKind::Timeout => StatusCode::GATEWAY_TIMEOUT,
                };
                let payload = ApiError {
                    error: err.phase().to_string(),
                    detail: Some(err.detail().to_string()),
                };
                (status, Json(payload)).into_response()
            }
            AppError::Store(err) => {
                let status = match err {
                    StoreError::NotFound => StatusCode::NOT_FOUND,
                    StoreError::InvalidPatch(_) => StatusCode::BAD_REQUEST,
                };
                let payload = ApiError {
                    error: "store".into(),
                    detail: Some(err.to_string()),
                };
                (status, Json(payload)).into_response()
            }
            AppError::Batch(err) => {
                let payload = ApiError {
                    error: "batch".into(),
                    detail: Some(err.to_string()),
                };
                (StatusCode::BAD_REQUEST, Json(payload)).into_response()
            }
            AppError::NotFound(what) => {
                let payload = ApiError {
                    error: "not_found".into(),
                    detail: Some(format!("{what} not found")),
                };
                (StatusCode::NOT_FOUND, Json(payload)).into_response()
            }
            AppError::BadRequest(payload) => {
                (StatusCode::BAD_REQUEST, Json(payload)).into_response()
            }
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,tower_http=debug"));
    let _ = fmt().with_env_filter(filter).try_init();
}

//! HTTP API.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET`  | `/health` | Health check (returns version) |
//! | `POST` | `/api/chat` | Answer a question, JSON response |
//! | `POST` | `/api/chat/stream` | Answer a question as Server-Sent Events |
//! | `POST` | `/api/messages/{id}/reaction` | Thumbs up/down on an answer |
//! | `GET`  | `/api/chatbots/{id}/config` | Widget name and welcome message |
//! | `POST` | `/api/tenants/{tenant}/data-sources/file` | Upload a file (raw body) |
//! | `POST` | `/api/tenants/{tenant}/data-sources/url` | Submit a URL to crawl |
//! | `GET`  | `/api/tenants/{tenant}/data-sources` | List a tenant's data sources |
//! | `GET`  | `/api/data-sources/{id}` | Poll one data source |
//! | `POST` | `/api/data-sources/{id}/resync` | Re-crawl a URL data source |
//! | `DELETE` | `/api/data-sources/{id}` | Delete a data source and its content |
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "not_found", "message": "chatbot 42 not found" } }
//! ```
//!
//! Status codes: 400 invalid input, 404 not found, 409 already processing,
//! 413 upload too large, 415 unsupported format, 429 quota or rate limit,
//! 502 embedding or generation failure, 500 storage failure.
//!
//! # Streaming
//!
//! `/api/chat/stream` emits `data:` lines in this order: one metadata
//! frame, content frames, the stored message id, an optional error, and
//! `[DONE]`. Closing the connection stops the upstream model call.
//!
//! # CORS
//!
//! Only origins listed in `[server] allowed_origins` may call the API from a
//! browser. An empty list denies every cross-origin request.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{ConnectInfo, DefaultBodyLimit, Path, Query, Request, State},
    http::{header, HeaderMap, HeaderValue, Method, StatusCode},
    middleware::{self, Next},
    response::{
        sse::{Event, KeepAlive},
        IntoResponse, Response, Sse,
    },
    routing::{get, post},
    Json, Router,
};
use futures::Stream;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::mpsc;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tracing::{info, warn};

use docent_core::frame::StreamFrame;
use docent_core::models::{DataSource, DataSourceStatus, Reaction};
use docent_core::store::{ChatStore, KnowledgeStore};
use docent_core::Error;

use crate::chat::{ChatQuery, ChatService};
use crate::config::Config;
use crate::crawl;
use crate::db;
use crate::extract;
use crate::ingest::{IngestInput, IngestJob, IngestQueue, Ingestor};
use crate::migrate;
use crate::rate_limit::{Decision, RateLimiter};
use crate::sqlite_store::SqliteStore;

/// Shared application state passed to all route handlers via Axum's `State` extractor.
#[derive(Clone)]
pub struct AppState {
    config: Arc<Config>,
    knowledge: Arc<dyn KnowledgeStore>,
    chat: ChatService,
    queue: Arc<IngestQueue>,
    limiter: RateLimiter,
}

impl AppState {
    /// Assemble state and start the ingestion workers. Must be called
    /// inside a Tokio runtime.
    pub fn new(
        config: Config,
        knowledge: Arc<dyn KnowledgeStore>,
        chat: ChatService,
        ingestor: Ingestor,
    ) -> Self {
        let queue = IngestQueue::start(ingestor, config.ingest.workers);
        let limiter = RateLimiter::from_config(&config.rate_limit);
        Self {
            config: Arc::new(config),
            knowledge,
            chat,
            queue: Arc::new(queue),
            limiter,
        }
    }
}

/// Starts the HTTP server on `[server].bind` backed by the SQLite store.
///
/// Runs until the process is terminated.
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    let pool = db::connect(config).await?;
    migrate::apply(&pool).await?;
    let store = Arc::new(SqliteStore::new(pool));

    let knowledge: Arc<dyn KnowledgeStore> = store.clone();
    let chats: Arc<dyn ChatStore> = store;
    let chat = ChatService::from_config(config, knowledge.clone(), chats)?;
    let ingestor = Ingestor::from_config(
        config,
        knowledge.clone(),
        crate::embedding::create_client(&config.embedding)?,
    );

    let state = AppState::new(config.clone(), knowledge, chat, ingestor);
    let app = router(state);

    let listener = tokio::net::TcpListener::bind(&config.server.bind).await?;
    info!(bind = %config.server.bind, "docent server listening");
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;

    Ok(())
}

/// Build the router. Serve it with connect info so the rate limiter can
/// key on the client address.
pub fn router(state: AppState) -> Router {
    let chat_routes = Router::new()
        .route("/api/chat", post(handle_chat))
        .route("/api/chat/stream", post(handle_chat_stream))
        .route_layer(middleware::from_fn_with_state(
            state.limiter.clone(),
            enforce_rate_limit,
        ));

    Router::new()
        .route("/health", get(handle_health))
        .merge(chat_routes)
        .route("/api/messages/{id}/reaction", post(handle_reaction))
        .route("/api/chatbots/{id}/config", get(handle_widget_config))
        .route(
            "/api/tenants/{tenant}/data-sources/file",
            post(handle_upload_file),
        )
        .route(
            "/api/tenants/{tenant}/data-sources/url",
            post(handle_submit_url),
        )
        .route(
            "/api/tenants/{tenant}/data-sources",
            get(handle_list_sources),
        )
        .route(
            "/api/data-sources/{id}",
            get(handle_get_source).delete(handle_delete_source),
        )
        .route("/api/data-sources/{id}/resync", post(handle_resync))
        .layer(DefaultBodyLimit::max(state.config.ingest.max_upload_bytes))
        .layer(cors_layer(&state.config.server.allowed_origins))
        .with_state(state)
}

fn cors_layer(allowed: &[String]) -> CorsLayer {
    let origins: Vec<HeaderValue> = allowed
        .iter()
        .filter_map(|o| match HeaderValue::from_str(o) {
            Ok(v) => Some(v),
            Err(_) => {
                warn!(origin = %o, "ignoring invalid allowed origin");
                None
            }
        })
        .collect();
    CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods([Method::GET, Method::POST, Method::DELETE])
        .allow_headers([header::CONTENT_TYPE])
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

/// Internal error type that converts into an Axum HTTP response.
struct AppError {
    status: StatusCode,
    code: String,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code,
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

impl From<Error> for AppError {
    fn from(err: Error) -> Self {
        let status = match &err {
            Error::InvalidInput(_) | Error::ParseFailed(_) => StatusCode::BAD_REQUEST,
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::UnsupportedFormat(_) => StatusCode::UNSUPPORTED_MEDIA_TYPE,
            Error::AlreadyProcessing(_) => StatusCode::CONFLICT,
            Error::QuotaExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
            Error::EmbeddingFailed(_) | Error::GenerationFailed(_) => StatusCode::BAD_GATEWAY,
            Error::StorageFailed(_) | Error::RetrievalUnavailable(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        if status.is_server_error() {
            warn!(code = err.code(), error = %err, "request failed");
        }
        AppError {
            status,
            code: err.code().to_string(),
            message: err.to_string(),
        }
    }
}

fn storage(err: anyhow::Error) -> AppError {
    Error::storage(format!("{:#}", err)).into()
}

// ============ Rate limiting ============

async fn enforce_rate_limit(State(limiter): State<RateLimiter>, req: Request, next: Next) -> Response {
    let caller = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string());

    match limiter.check(&caller).await {
        Decision::Allowed { .. } => next.run(req).await,
        Decision::Limited { retry_after } => {
            let secs = retry_after.as_secs().max(1);
            let body = ErrorBody {
                error: ErrorDetail {
                    code: "rate_limited".to_string(),
                    message: format!("too many requests, retry in {}s", secs),
                },
            };
            (
                StatusCode::TOO_MANY_REQUESTS,
                [(header::RETRY_AFTER, secs.to_string())],
                Json(body),
            )
                .into_response()
        }
    }
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

// ============ Chat ============

async fn handle_chat(
    State(state): State<AppState>,
    Json(query): Json<ChatQuery>,
) -> Result<Json<serde_json::Value>, AppError> {
    let answer = state.chat.answer(&query).await?;
    Ok(Json(json!({ "message": answer })))
}

/// Everything before the first frame (quota, retrieval, opening the
/// upstream) fails with a status code; later failures arrive as frames.
async fn handle_chat_stream(
    State(state): State<AppState>,
    Json(query): Json<ChatQuery>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, AppError> {
    let prepared = state.chat.prepare(&query).await?;
    let (tx, rx) = mpsc::channel::<StreamFrame>(32);

    tokio::spawn(async move {
        let mut tx = tx;
        if let Err(e) = prepared.relay(&mut tx).await {
            warn!(error = %e, "streamed answer was not stored");
        }
    });

    let events = futures::stream::unfold(rx, |mut rx| async move {
        let frame = rx.recv().await?;
        Some((Ok(Event::default().data(frame.to_sse_data())), rx))
    });
    Ok(Sse::new(events).keep_alive(KeepAlive::default()))
}

#[derive(Deserialize)]
struct ReactionBody {
    reaction: Reaction,
}

async fn handle_reaction(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<ReactionBody>,
) -> Result<StatusCode, AppError> {
    state.chat.react(&id, body.reaction).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn handle_widget_config(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<crate::chat::WidgetConfig>, AppError> {
    Ok(Json(state.chat.widget_config(&id).await?))
}

// ============ Data sources ============

#[derive(Deserialize)]
struct UploadParams {
    name: Option<String>,
}

async fn handle_upload_file(
    State(state): State<AppState>,
    Path(tenant): Path<String>,
    Query(params): Query<UploadParams>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<(StatusCode, Json<DataSource>), AppError> {
    let mime = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(extract::normalize_mime)
        .unwrap_or_default();
    if !extract::is_supported(&mime) {
        return Err(Error::UnsupportedFormat(if mime.is_empty() {
            "missing Content-Type".to_string()
        } else {
            mime
        })
        .into());
    }
    if body.is_empty() {
        return Err(Error::InvalidInput("upload body is empty".to_string()).into());
    }

    let file_name = params.name.unwrap_or_else(|| "upload".to_string());
    let ds = DataSource::new_file(&tenant, &file_name, &file_name, &mime, body.len() as u64);
    state.knowledge.create_data_source(&ds).await.map_err(storage)?;

    let input = IngestInput::File {
        bytes: body.to_vec(),
        mime,
    };
    state
        .queue
        .submit(IngestJob::ingest(&ds.id, input))
        .await
        .map_err(storage)?;
    info!(tenant = %tenant, data_source = %ds.id, "file queued for ingestion");
    Ok((StatusCode::ACCEPTED, Json(ds)))
}

#[derive(Deserialize)]
struct SubmitUrlBody {
    url: String,
    name: Option<String>,
}

async fn handle_submit_url(
    State(state): State<AppState>,
    Path(tenant): Path<String>,
    Json(body): Json<SubmitUrlBody>,
) -> Result<(StatusCode, Json<DataSource>), AppError> {
    let url = crawl::validate_url(&body.url).map_err(Error::from)?;
    let name = body.name.unwrap_or_else(|| url.to_string());
    let ds = DataSource::new_url(&tenant, &name, url.as_str());
    state.knowledge.create_data_source(&ds).await.map_err(storage)?;

    let input = IngestInput::Crawl {
        url: url.to_string(),
    };
    state
        .queue
        .submit(IngestJob::ingest(&ds.id, input))
        .await
        .map_err(storage)?;
    info!(tenant = %tenant, data_source = %ds.id, url = %url, "url queued for ingestion");
    Ok((StatusCode::ACCEPTED, Json(ds)))
}

async fn handle_list_sources(
    State(state): State<AppState>,
    Path(tenant): Path<String>,
) -> Result<Json<Vec<DataSource>>, AppError> {
    let sources = state
        .knowledge
        .list_data_sources(&tenant)
        .await
        .map_err(storage)?;
    Ok(Json(sources))
}

async fn load_source(state: &AppState, id: &str) -> Result<DataSource, AppError> {
    state
        .knowledge
        .get_data_source(id)
        .await
        .map_err(storage)?
        .ok_or_else(|| Error::NotFound(format!("data source {}", id)).into())
}

async fn handle_get_source(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<DataSource>, AppError> {
    Ok(Json(load_source(&state, &id).await?))
}

async fn handle_resync(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<(StatusCode, Json<DataSource>), AppError> {
    let ds = load_source(&state, &id).await?;
    if ds.url().is_none() {
        return Err(Error::InvalidInput(
            "file data sources are resynced by uploading the file again".to_string(),
        )
        .into());
    }
    if ds.status == DataSourceStatus::Processing {
        return Err(Error::AlreadyProcessing(ds.id).into());
    }
    state
        .queue
        .submit(IngestJob::resync(&ds.id, None))
        .await
        .map_err(storage)?;
    Ok((StatusCode::ACCEPTED, Json(ds)))
}

async fn handle_delete_source(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, AppError> {
    let ds = load_source(&state, &id).await?;
    if ds.status == DataSourceStatus::Processing {
        return Err(Error::AlreadyProcessing(ds.id).into());
    }
    state
        .knowledge
        .delete_data_source(&ds.id)
        .await
        .map_err(storage)?;
    info!(data_source = %ds.id, "data source deleted");
    Ok(StatusCode::NO_CONTENT)
}

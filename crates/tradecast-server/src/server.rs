//! HTTP surface: the event stream, the publish trigger, chart uploads and health.

use std::sync::Arc;
use std::time::Duration;

use axum::body::{Body, Bytes};
use axum::extract::multipart::MultipartRejection;
use axum::extract::{DefaultBodyLimit, Multipart, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use serde_json::{json, Value};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::channel::BroadcastChannel;
use crate::gateway::{PublishGateway, PublishOutcome};
use crate::registry::RelayRegistry;
use crate::relay::{RelayConfig, RelaySession};
use crate::upload::{require_multipart, UploadError, UploadForwarder, UploadedFile};

/// Largest accepted upload body.
const MAX_UPLOAD_BYTES: usize = 20 * 1024 * 1024;

/// Server configuration.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub topic: String,
    pub keep_alive: Option<Duration>,
    pub send_queue: usize,
    pub upload_url: String,
    pub upload_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 3000,
            topic: "analysis_results".into(),
            keep_alive: Some(Duration::from_secs(15)),
            send_queue: 64,
            upload_url: "http://localhost:5678/webhook-test/upload-file".into(),
            upload_timeout: Duration::from_secs(60),
        }
    }
}

impl ServerConfig {
    fn relay_config(&self) -> RelayConfig {
        RelayConfig {
            topic: self.topic.clone(),
            keep_alive: self.keep_alive,
            send_queue: self.send_queue,
        }
    }
}

/// Shared application state passed to Axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub channel: Arc<dyn BroadcastChannel>,
    pub gateway: PublishGateway,
    pub uploader: UploadForwarder,
    pub registry: Arc<RelayRegistry>,
    pub relay_config: RelayConfig,
    /// Cancelled on shutdown; every relay runs under a child token.
    pub shutdown: CancellationToken,
}

impl AppState {
    pub fn new(
        config: &ServerConfig,
        channel: Arc<dyn BroadcastChannel>,
    ) -> Result<Self, UploadError> {
        let uploader = UploadForwarder::new(config.upload_url.clone(), config.upload_timeout)?;
        Ok(Self {
            gateway: PublishGateway::new(Arc::clone(&channel), config.topic.clone()),
            channel,
            uploader,
            registry: Arc::new(RelayRegistry::new()),
            relay_config: config.relay_config(),
            shutdown: CancellationToken::new(),
        })
    }
}

/// Build the Axum router with all routes.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/api/sse", get(sse_handler).post(sse_handler))
        .route("/api/analyzer", post(analyzer_handler))
        .route(
            "/api/files",
            post(files_handler).layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES)),
        )
        .route("/health", get(health_handler))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

/// Bind and serve. Port 0 picks a free port, reported on the handle.
pub async fn start(
    config: ServerConfig,
    channel: Arc<dyn BroadcastChannel>,
) -> Result<ServerHandle, std::io::Error> {
    let state = AppState::new(&config, channel).map_err(std::io::Error::other)?;
    let registry = Arc::clone(&state.registry);
    let shutdown = state.shutdown.clone();
    let channel_name = state.channel.name();

    let router = build_router(state);
    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    let local_addr = listener.local_addr()?;

    info!(
        port = local_addr.port(),
        topic = %config.topic,
        channel = channel_name,
        "tradecast server started"
    );

    let signal = shutdown.clone();
    let server = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, router)
            .with_graceful_shutdown(signal.cancelled_owned())
            .await
        {
            warn!(error = %e, "server exited with error");
        }
    });

    Ok(ServerHandle {
        port: local_addr.port(),
        registry,
        shutdown,
        server,
    })
}

/// Handle returned by `start()`. Dropping it leaves the server running.
pub struct ServerHandle {
    pub port: u16,
    registry: Arc<RelayRegistry>,
    shutdown: CancellationToken,
    server: JoinHandle<()>,
}

impl ServerHandle {
    /// Live relays.
    pub fn registry(&self) -> &Arc<RelayRegistry> {
        &self.registry
    }

    /// Stop accepting connections, end every relay, and wait for the server task.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        if let Err(e) = self.server.await {
            warn!(error = %e, "server task did not finish cleanly");
        }
        info!("tradecast server stopped");
    }
}

/// GET|POST /api/sse
async fn sse_handler(State(state): State<AppState>) -> Response {
    let (relay, body) = RelaySession::open_child(
        Arc::clone(&state.channel),
        state.relay_config.clone(),
        &state.shutdown,
    );
    let relay = relay.with_registry(Arc::clone(&state.registry));
    let _ = tokio::spawn(relay.run());

    (
        [
            (header::CONTENT_TYPE, "text/event-stream"),
            (header::CACHE_CONTROL, "no-cache"),
            (header::CONNECTION, "keep-alive"),
        ],
        Body::from_stream(body),
    )
        .into_response()
}

/// POST /api/analyzer
async fn analyzer_handler(State(state): State<AppState>, body: Bytes) -> Response {
    let outcome = match serde_json::from_slice::<Value>(&body) {
        Ok(payload) => state.gateway.publish(&payload).await,
        Err(e) => {
            warn!(error = %e, "analyzer request body is not JSON");
            PublishOutcome::Error {
                message: format!("invalid JSON body: {e}"),
            }
        }
    };
    let status = if outcome.is_success() {
        StatusCode::OK
    } else {
        StatusCode::INTERNAL_SERVER_ERROR
    };
    (status, Json(outcome)).into_response()
}

/// POST /api/files
async fn files_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    multipart: Result<Multipart, MultipartRejection>,
) -> Response {
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok());

    let result = async {
        require_multipart(content_type)?;
        let multipart = multipart.map_err(|e| UploadError::Multipart(e.body_text()))?;
        let file = read_file_field(multipart).await?;
        state.uploader.forward(file).await
    }
    .await;

    match result {
        Ok(receipt) => (StatusCode::OK, Json(receipt)).into_response(),
        Err(e) => {
            if e.is_client_error() {
                warn!(error = %e, "upload rejected");
            } else {
                tracing::error!(error = %e, url = state.uploader.url(), "upload failed");
            }
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "message": e.to_string(), "status": "error" })),
            )
                .into_response()
        }
    }
}

/// Take the first form field named `file`.
async fn read_file_field(mut multipart: Multipart) -> Result<UploadedFile, UploadError> {
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| UploadError::Multipart(e.to_string()))?
    {
        if field.name() != Some("file") {
            continue;
        }
        let file_name = field.file_name().unwrap_or("upload").to_string();
        let content_type = field.content_type().map(str::to_owned);
        let bytes = field
            .bytes()
            .await
            .map_err(|e| UploadError::Multipart(e.to_string()))?;
        return Ok(UploadedFile {
            file_name,
            content_type,
            bytes,
        });
    }
    Err(UploadError::MissingFile)
}

/// GET /health
async fn health_handler(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "channel": state.channel.name(),
        "topic": state.relay_config.topic,
        "activeStreams": state.registry.count(),
        "topicStreams": state.registry.count_for_topic(&state.relay_config.topic),
    }))
}

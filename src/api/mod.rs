//! HTTP API.
//!
//! Provides endpoints for:
//! - raw repository files with content-hash `ETag`s
//! - merged per-key translations of a file
//! - suggestion submission, moderation and history
//! - the NDJSON staleness stream
//! - batch hashing and validation helpers

mod files;
pub mod payload;
mod translations;

use crate::cache::{etag_header, hash_value, Conditional};
use crate::config::Config;
use crate::db::Database;
use crate::error::{AppError, AppResult};
use crate::host::{HostClient, LoadedFile};
use crate::model::SourceString;
use crate::moderation::{Actor, SuggestionStore};
use crate::security::api_key_allows;
use crate::staleness::StalenessTracker;
use axum::{
    async_trait,
    extract::{FromRequest, FromRequestParts, Request, State},
    http::{header, request::Parts, HeaderMap, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use payload::HealthResponse;
use serde::{de::DeserializeOwned, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

pub const USER_ID_HEADER: &str = "x-user-id";
pub const API_KEY_HEADER: &str = "x-api-key";

/// Shared state for API handlers.
pub struct AppState {
    pub config: Config,
    pub suggestions: SuggestionStore,
    pub staleness: StalenessTracker,
    pub host: HostClient,
    /// Store streams whose producer is still running.
    active_streams: AtomicUsize,
}

impl AppState {
    pub fn new(config: Config, db: Database, host: HostClient) -> Self {
        let suggestions = SuggestionStore::new(db.clone(), &config.project_id);
        let staleness = StalenessTracker::new(db, &config.project_id);
        Self {
            config,
            suggestions,
            staleness,
            host,
            active_streams: AtomicUsize::new(0),
        }
    }

    pub fn active_streams(&self) -> usize {
        self.active_streams.load(Ordering::SeqCst)
    }

    /// Target languages must be allowed by configuration.
    fn check_target_language(&self, language: &str) -> AppResult<()> {
        payload::validate_language(language)?;
        if self.config.allows_language(language) {
            Ok(())
        } else {
            Err(AppError::Validation(format!(
                "{} is not a target language of this project",
                language
            )))
        }
    }

    /// Source-language strings of `filename`. A missing source file is `NotFound`.
    async fn source_file(&self, filename: &str) -> AppResult<LoadedFile> {
        payload::validate_filename(filename)?;
        self.host
            .load_strings(&self.config.source_language, filename)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("source file {}", filename)))
    }

    /// Target strings of `filename`, absent when the language has no such file yet.
    async fn target_file(&self, language: &str, filename: &str) -> AppResult<Option<LoadedFile>> {
        self.host.load_strings(language, filename).await
    }
}

/// Live content hash of every source key.
fn live_hashes(source: &[SourceString]) -> HashMap<String, String> {
    source
        .iter()
        .map(|s| (s.key.clone(), hash_value(&s.value)))
        .collect()
}

/// The caller, as identified by the fronting auth layer.
pub struct Identity(pub Actor);

#[async_trait]
impl FromRequestParts<Arc<AppState>> for Identity {
    type Rejection = AppError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        let user_id = parts
            .headers
            .get(USER_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .ok_or_else(|| AppError::Unauthorized(format!("missing {} header", USER_ID_HEADER)))?;

        let actor = Actor {
            user_id: user_id.to_string(),
            can_moderate: state.config.is_moderator(user_id),
        };
        Ok(Identity(actor))
    }
}

/// `Json` whose rejections are reported as validation errors.
pub struct ValidJson<T>(pub T);

#[async_trait]
impl<S, T> FromRequest<S> for ValidJson<T>
where
    S: Send + Sync,
    T: DeserializeOwned,
{
    type Rejection = AppError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let Json(value) = Json::<T>::from_request(req, state)
            .await
            .map_err(|rejection| AppError::Validation(rejection.body_text()))?;
        Ok(ValidJson(value))
    }
}

fn if_none_match(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::IF_NONE_MATCH)
        .and_then(|v| v.to_str().ok())
}

/// `304` when the client's `If-None-Match` matches `fingerprint`, otherwise
/// the JSON body with a fresh `ETag`.
pub(crate) fn conditional_json<T: Serialize>(
    headers: &HeaderMap,
    fingerprint: String,
    body: T,
) -> Response {
    match Conditional::evaluate(if_none_match(headers), fingerprint, body) {
        Conditional::NotModified { fingerprint } => (
            StatusCode::NOT_MODIFIED,
            [(header::ETAG, etag_header(&fingerprint))],
        )
            .into_response(),
        Conditional::Modified { fingerprint, body } => {
            ([(header::ETAG, etag_header(&fingerprint))], Json(body)).into_response()
        }
    }
}

async fn require_api_key(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Response {
    let presented = request
        .headers()
        .get(API_KEY_HEADER)
        .and_then(|v| v.to_str().ok());
    if api_key_allows(state.config.api_key.as_deref(), presented) {
        next.run(request).await
    } else {
        AppError::Unauthorized("invalid or missing API key".to_string()).into_response()
    }
}

async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        active_streams: state.active_streams(),
    })
}

/// Build the API router with all routes.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        // Files and the staleness store. Static segments win over `:lang`.
        .route("/files/store/stream/:lang", get(files::stream_store))
        .route("/files/store/refresh/:lang", post(files::refresh_store))
        .route("/files/:lang/*filename", get(files::raw_file))
        // Suggestions
        .route("/translations", post(translations::submit))
        .route("/translations/suggestions", get(translations::list_suggestions))
        .route("/translations/history", get(translations::list_history))
        .route("/translations/committed", post(translations::mark_committed))
        .route("/translations/file/:lang/*filename", get(translations::file))
        .route("/translations/merged/:lang/*filename", get(translations::merged))
        .route(
            "/translations/:id",
            axum::routing::patch(translations::moderate).delete(translations::delete),
        )
        // Batch helpers
        .route("/hash", post(translations::hash_values))
        .route("/validate", post(translations::validate))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_api_key))
        // Health checks stay reachable without a key.
        .route("/health", get(health))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(|request: &axum::http::Request<_>| {
                    tracing::info_span!(
                        "request",
                        method = %request.method(),
                        uri = %request.uri(),
                    )
                })
                .on_request(())
                // Only log client and server errors; 304 is routine.
                .on_response(
                    |response: &axum::http::Response<_>,
                     latency: std::time::Duration,
                     _span: &tracing::Span| {
                        let status = response.status();
                        if status.is_client_error() || status.is_server_error() {
                            tracing::warn!(
                                status = %status,
                                latency_ms = latency.as_millis(),
                                "request failed"
                            );
                        }
                    },
                ),
        )
        .with_state(state)
}

/// Start the API server.
pub async fn serve(state: Arc<AppState>, bind_addr: &str) -> anyhow::Result<()> {
    let app = router(state);
    let listener = tokio::net::TcpListener::bind(bind_addr).await?;

    tracing::info!("Translation API listening on {}", bind_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Translation API stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
}

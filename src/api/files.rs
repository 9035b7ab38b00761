//! Raw files and the staleness store.

use super::payload::{validate_filename, validate_language, RefreshResponse};
use super::{AppState, Identity};
use crate::cache::{etag_header, hash_value, Conditional};
use crate::error::{AppError, AppResult};
use crate::staleness::StalenessTracker;
use crate::stream::{encode_line, StoreEncoder, StreamRecord, NDJSON_CONTENT_TYPE};
use axum::{
    body::Body,
    extract::{Path, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use std::convert::Infallible;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

const STREAM_BUFFER: usize = 16;

pub async fn raw_file(
    State(state): State<Arc<AppState>>,
    Path((language, filename)): Path<(String, String)>,
    headers: HeaderMap,
) -> AppResult<Response> {
    validate_language(&language)?;
    validate_filename(&filename)?;

    let file = state
        .host
        .fetch_raw(&language, &filename)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("{}/{}", language, filename)))?;

    let known = headers
        .get(header::IF_NONE_MATCH)
        .and_then(|v| v.to_str().ok());
    let response = match Conditional::evaluate(known, hash_value(&file.text), file.text) {
        Conditional::NotModified { fingerprint } => {
            (StatusCode::NOT_MODIFIED, [(header::ETAG, etag_header(&fingerprint))]).into_response()
        }
        Conditional::Modified { fingerprint, body } => (
            [
                (header::ETAG, etag_header(&fingerprint)),
                (header::CONTENT_TYPE, "text/plain; charset=utf-8".to_string()),
            ],
            body,
        )
            .into_response(),
    };
    Ok(response)
}

/// Push one record to the response body. `false` once the client is gone.
async fn send_record(
    tx: &mpsc::Sender<Result<String, Infallible>>,
    record: &StreamRecord,
) -> AppResult<bool> {
    let line = encode_line(record)?;
    Ok(tx.send(Ok(line)).await.is_ok())
}

/// Counts a running stream producer in [`AppState`] until dropped.
struct ActiveStream(Arc<AppState>);

impl ActiveStream {
    fn start(state: Arc<AppState>) -> Self {
        state.active_streams.fetch_add(1, Ordering::SeqCst);
        Self(state)
    }
}

impl Drop for ActiveStream {
    fn drop(&mut self) {
        self.0.active_streams.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Write the whole stream into `tx`, one file at a time.
/// Returns how many records were delivered before the stream ended or the client left.
async fn produce_records(
    staleness: &StalenessTracker,
    encoder: &StoreEncoder,
    files: &[(String, usize)],
    tx: &mpsc::Sender<Result<String, Infallible>>,
) -> AppResult<usize> {
    if !send_record(tx, &encoder.header(files)).await? {
        return Ok(0);
    }
    let mut sent = 1;

    for (filepath, _) in files {
        let entries = staleness.file_entries(encoder.language(), filepath).await?;
        for record in encoder.file_records(filepath, entries) {
            if !send_record(tx, &record).await? {
                debug!(
                    "Stream client for {} went away at {} after {} record(s)",
                    encoder.language(),
                    filepath,
                    sent
                );
                return Ok(sent);
            }
            sent += 1;
        }
    }
    Ok(sent)
}

/// Stream every store entry of a language as NDJSON.
///
/// Records are produced on a separate task into a bounded channel, so a slow
/// client applies backpressure and a disconnected one stops production.
pub async fn stream_store(
    State(state): State<Arc<AppState>>,
    Path(language): Path<String>,
) -> AppResult<Response> {
    state.check_target_language(&language)?;
    let files = state.staleness.files(&language).await?;
    info!(
        "Streaming store for {}: {} file(s), {} key(s)",
        language,
        files.len(),
        files.iter().map(|(_, n)| n).sum::<usize>()
    );

    let (tx, rx) = mpsc::channel(STREAM_BUFFER);
    let encoder = StoreEncoder::new(&language, state.config.stream_chunk_size);
    let active = ActiveStream::start(state.clone());
    tokio::spawn(async move {
        let state = &active.0;
        match produce_records(&state.staleness, &encoder, &files, &tx).await {
            Ok(sent) => debug!("Store stream for {} ended after {} record(s)", language, sent),
            Err(e) => warn!("Store stream for {} ended early: {}", language, e),
        }
    });

    let body = futures::stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|item| (item, rx))
    });

    Ok((
        [(header::CONTENT_TYPE, NDJSON_CONTENT_TYPE)],
        Body::from_stream(body),
    )
        .into_response())
}

/// Re-derive the store entries of every configured file of a language.
pub async fn refresh_store(
    State(state): State<Arc<AppState>>,
    Identity(actor): Identity,
    Path(language): Path<String>,
) -> AppResult<Json<RefreshResponse>> {
    if !actor.can_moderate {
        return Err(AppError::Forbidden(format!(
            "user {} cannot refresh the store",
            actor.user_id
        )));
    }
    state.check_target_language(&language)?;

    let mut files = 0;
    let mut keys = 0;
    for filename in &state.config.translation_files {
        let source = match state.source_file(filename).await {
            Ok(source) => source,
            Err(AppError::NotFound(_)) => {
                warn!("Configured file {} has no source, skipping", filename);
                continue;
            }
            Err(e) => return Err(e),
        };
        let target = state.target_file(&language, filename).await?;
        let entries = state
            .staleness
            .refresh_file(
                &language,
                filename,
                &source.strings,
                target.as_ref().map(|t| t.strings.as_slice()),
            )
            .await?;
        files += 1;
        keys += entries.len();
    }

    info!("Refreshed store for {}: {} files, {} keys", language, files, keys);
    Ok(Json(RefreshResponse { files, keys }))
}

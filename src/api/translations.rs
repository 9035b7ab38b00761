//! Suggestion endpoints and the merged view of a file.

use super::payload::{
    validate_batch, validate_filename, CommitRequest, CommitResponse, FileTranslations,
    HashRequest, HashResponse, ListQuery, ModerateRequest, SubmitRequest, SubmitResponse,
    ValidateRequest, ValidateResponse,
};
use super::{conditional_json, live_hashes, AppState, Identity, ValidJson};
use crate::cache::{
    batch_hash_values, fingerprint, hash_value, history_marker, merged_marker, suggestion_marker,
};
use crate::db::{NewSuggestion, SuggestionFilter};
use crate::error::{AppError, AppResult};
use crate::model::{Suggestion, SuggestionStatus};
use crate::moderation::batch_validate_translations;
use crate::reconcile::{apply_store_entries, merge_with_blame};
use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::Response,
    Json,
};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use tracing::{debug, warn};

const VISIBLE: &[SuggestionStatus] = &[
    SuggestionStatus::Pending,
    SuggestionStatus::Approved,
    SuggestionStatus::Rejected,
    SuggestionStatus::Committed,
];

fn filter_for(state: &AppState, query: &ListQuery) -> SuggestionFilter {
    SuggestionFilter {
        language: query.language.clone(),
        filename: query.filename.clone(),
        key: query.key.clone(),
        ..state.suggestions.filter()
    }
}

/// Suggestions of one file, re-validated against its live source.
async fn validated_for_file(
    state: &AppState,
    filter: &SuggestionFilter,
    filename: &str,
) -> AppResult<Vec<Suggestion>> {
    let source = state.source_file(filename).await?;
    state
        .suggestions
        .list_validated(filter, &live_hashes(&source.strings))
        .await
}

/// Re-check suggestions against the live source of every file they belong to.
/// A file gone from the source language invalidates its suggestions. Files
/// whose source cannot be fetched keep their stored validity.
async fn revalidated(state: &AppState, suggestions: Vec<Suggestion>) -> AppResult<Vec<Suggestion>> {
    let filenames: BTreeSet<&str> = suggestions.iter().map(|s| s.filename.as_str()).collect();
    let mut live = HashMap::new();
    for filename in filenames {
        let hashes = match state.source_file(filename).await {
            Ok(source) => live_hashes(&source.strings),
            Err(AppError::NotFound(_)) => HashMap::new(),
            Err(e) => {
                warn!("Cannot re-validate suggestions of {}: {}", filename, e);
                continue;
            }
        };
        live.insert(filename.to_string(), hashes);
    }
    state.suggestions.revalidate(suggestions, &live).await
}

/// [`revalidated`] for a single record.
async fn revalidated_one(state: &AppState, suggestion: Suggestion) -> AppResult<Suggestion> {
    let id = suggestion.id;
    revalidated(state, vec![suggestion])
        .await?
        .pop()
        .ok_or_else(|| AppError::NotFound(format!("suggestion {}", id)))
}

pub async fn submit(
    State(state): State<Arc<AppState>>,
    Identity(actor): Identity,
    ValidJson(request): ValidJson<SubmitRequest>,
) -> AppResult<(StatusCode, Json<SubmitResponse>)> {
    request.validate()?;
    state.check_target_language(&request.language)?;

    let source = state.source_file(&request.filename).await?;
    let source_string = source
        .strings
        .iter()
        .find(|s| s.key == request.key)
        .ok_or_else(|| {
            AppError::NotFound(format!("key {} in {}", request.key, request.filename))
        })?;

    let created = state
        .suggestions
        .submit(
            &actor,
            NewSuggestion {
                project_id: state.config.project_id.clone(),
                language: request.language,
                filename: request.filename,
                key: request.key,
                value: request.value,
                user_id: actor.user_id.clone(),
                source_hash: hash_value(&source_string.value),
            },
        )
        .await?;

    Ok((StatusCode::CREATED, Json(SubmitResponse { id: created.id })))
}

pub async fn moderate(
    State(state): State<Arc<AppState>>,
    Identity(actor): Identity,
    Path(id): Path<i64>,
    ValidJson(request): ValidJson<ModerateRequest>,
) -> AppResult<Json<Suggestion>> {
    let updated = state.suggestions.moderate(&actor, id, request.status).await?;
    Ok(Json(revalidated_one(&state, updated).await?))
}

pub async fn delete(
    State(state): State<Arc<AppState>>,
    Identity(actor): Identity,
    Path(id): Path<i64>,
) -> AppResult<Json<Suggestion>> {
    let deleted = state.suggestions.delete(&actor, id).await?;
    Ok(Json(revalidated_one(&state, deleted).await?))
}

/// Newest first, re-validated against the live source. With a filename the
/// source file must exist.
pub async fn list_suggestions(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListQuery>,
    headers: HeaderMap,
) -> AppResult<Response> {
    query.validate()?;
    let filter = SuggestionFilter {
        statuses: Some(VISIBLE.to_vec()),
        ..filter_for(&state, &query)
    };

    let suggestions = match &query.filename {
        Some(filename) => validated_for_file(&state, &filter, filename).await?,
        None => {
            let suggestions = state.suggestions.list(&filter).await?;
            revalidated(&state, suggestions).await?
        }
    };

    let fp = fingerprint(&suggestions, suggestion_marker);
    Ok(conditional_json(&headers, fp, suggestions))
}

pub async fn list_history(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListQuery>,
    headers: HeaderMap,
) -> AppResult<Response> {
    query.validate()?;
    let filter = filter_for(&state, &query);
    let history = state
        .suggestions
        .history(&filter, query.translation_id)
        .await?;

    let fp = fingerprint(&history, history_marker);
    Ok(conditional_json(&headers, fp, history))
}

pub async fn mark_committed(
    State(state): State<Arc<AppState>>,
    Identity(actor): Identity,
    ValidJson(request): ValidJson<CommitRequest>,
) -> AppResult<Json<CommitResponse>> {
    request.validate()?;
    validate_batch(&request.ids)?;

    let committed = state
        .suggestions
        .mark_committed(&actor, &request.ids, &request.commit_sha)
        .await?;

    // The pushed revision changes the target files on the host.
    for s in &committed {
        state.host.invalidate(&s.language, &s.filename).await;
    }
    let committed = revalidated(&state, committed).await?;
    Ok(Json(CommitResponse { committed }))
}

pub async fn file(
    State(state): State<Arc<AppState>>,
    Path((language, filename)): Path<(String, String)>,
) -> AppResult<Json<FileTranslations>> {
    state.check_target_language(&language)?;
    validate_filename(&filename)?;

    let source = state.source_file(&filename).await?;
    let target = state.target_file(&language, &filename).await?;

    let filter = SuggestionFilter {
        language: Some(language.clone()),
        filename: Some(filename.clone()),
        statuses: Some(vec![SuggestionStatus::Pending, SuggestionStatus::Approved]),
        ..state.suggestions.filter()
    };
    let suggestions = state
        .suggestions
        .list_validated(&filter, &live_hashes(&source.strings))
        .await?;
    let (approved, pending): (Vec<Suggestion>, Vec<Suggestion>) = suggestions
        .into_iter()
        .partition(|s| s.status == SuggestionStatus::Approved);

    let commit_sha = target
        .as_ref()
        .and_then(|t| t.commit_sha.clone())
        .or(source.commit_sha);

    Ok(Json(FileTranslations {
        source: source.strings,
        target: target.map(|t| t.strings),
        pending,
        approved,
        source_language: state.config.source_language.clone(),
        target_language: language,
        filename,
        commit_sha,
    }))
}

/// Merged view of a file. Also refreshes the file's store entries so that
/// values from the repository carry their current staleness.
pub async fn merged(
    State(state): State<Arc<AppState>>,
    Path((language, filename)): Path<(String, String)>,
    headers: HeaderMap,
) -> AppResult<Response> {
    state.check_target_language(&language)?;
    validate_filename(&filename)?;

    let source = state.source_file(&filename).await?;
    let target = state.target_file(&language, &filename).await?;
    let blame = match &target {
        Some(_) => state.host.fetch_blame(&language, &filename).await?,
        None => Vec::new(),
    };

    let filter = SuggestionFilter {
        language: Some(language.clone()),
        filename: Some(filename.clone()),
        statuses: Some(vec![SuggestionStatus::Pending, SuggestionStatus::Approved]),
        ..state.suggestions.filter()
    };
    let suggestions = state
        .suggestions
        .list_validated(&filter, &live_hashes(&source.strings))
        .await?;

    let target_strings = target.as_ref().map(|t| t.strings.as_slice());
    let mut rows = merge_with_blame(&source.strings, target_strings, &suggestions, &blame);

    let entries: BTreeMap<_, _> = state
        .staleness
        .refresh_file(&language, &filename, &source.strings, target_strings)
        .await?
        .into_iter()
        .map(|e| (e.key.clone(), e))
        .collect();
    let patched = apply_store_entries(&mut rows, &entries);
    debug!(
        "Merged {}/{}: {} rows, {} marked outdated",
        language,
        filename,
        rows.len(),
        patched
    );

    let fp = fingerprint(&rows, merged_marker);
    Ok(conditional_json(&headers, fp, rows))
}

pub async fn hash_values(
    ValidJson(request): ValidJson<HashRequest>,
) -> AppResult<Json<HashResponse>> {
    validate_batch(&request.values)?;
    Ok(Json(HashResponse {
        hashes: batch_hash_values(&request.values),
    }))
}

pub async fn validate(
    ValidJson(request): ValidJson<ValidateRequest>,
) -> AppResult<Json<ValidateResponse>> {
    validate_batch(&request.translations)?;
    Ok(Json(ValidateResponse {
        results: batch_validate_translations(&request.translations, &request.source_hashes),
    }))
}

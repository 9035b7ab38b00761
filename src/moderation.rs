//! Suggestion lifecycle: submit, approve, reject, delete, commit and
//! read-time invalidation against the live source.
//!
//! Every mutation of one `(project, language, key)` group runs under that
//! group's lock and inside one transaction, and the final status write is
//! conditioned on the status read at the start. Two approvals racing for the
//! same key therefore cannot both succeed.

use crate::db::{self, Database, NewSuggestion, SuggestionFilter};
use crate::error::{AppError, AppResult};
use crate::model::{HistoryAction, Suggestion, SuggestionHistoryEntry, SuggestionStatus};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, info};

/// Who is performing an operation. Authentication happens upstream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Actor {
    pub user_id: String,
    pub can_moderate: bool,
}

impl Actor {
    pub fn contributor(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            can_moderate: false,
        }
    }

    pub fn moderator(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            can_moderate: true,
        }
    }
}

/// Target states a moderator may request directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModerationDecision {
    Approved,
    Rejected,
}

/// Async mutexes keyed by suggestion group, created on demand.
#[derive(Default)]
pub struct KeyedLocks {
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl KeyedLocks {
    pub async fn lock(&self, key: String) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
            // Drop locks nobody holds or waits on.
            locks.retain(|_, l| Arc::strong_count(l) > 1);
            locks.entry(key).or_default().clone()
        };
        lock.lock_owned().await
    }
}

fn group_key(s: &Suggestion) -> String {
    format!("{}\u{1f}{}\u{1f}{}", s.project_id, s.language, s.key)
}

/// Why a suggestion no longer matches the live source, if it doesn't.
pub fn invalid_reason(
    source_hash: Option<&str>,
    live_hash: Option<&str>,
) -> Option<&'static str> {
    match (live_hash, source_hash) {
        (None, _) => Some("Key no longer exists in source"),
        (Some(_), None) => Some("Translation missing source tracking"),
        (Some(live), Some(stored)) if live != stored => Some("Source value changed"),
        _ => None,
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TranslationToValidate {
    pub id: String,
    pub key: String,
    #[serde(default)]
    pub source_hash: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationResult {
    pub id: String,
    pub is_valid: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Check stored source hashes against the live hash of each key.
pub fn batch_validate_translations(
    translations: &[TranslationToValidate],
    source_hashes: &HashMap<String, String>,
) -> Vec<ValidationResult> {
    translations
        .iter()
        .map(|t| {
            let reason = invalid_reason(
                t.source_hash.as_deref(),
                source_hashes.get(&t.key).map(String::as_str),
            );
            ValidationResult {
                id: t.id.clone(),
                is_valid: reason.is_none(),
                reason: reason.map(str::to_string),
            }
        })
        .collect()
}

pub struct SuggestionStore {
    db: Database,
    project_id: String,
    locks: KeyedLocks,
}

impl SuggestionStore {
    pub fn new(db: Database, project_id: impl Into<String>) -> Self {
        Self {
            db,
            project_id: project_id.into(),
            locks: KeyedLocks::default(),
        }
    }

    pub fn project_id(&self) -> &str {
        &self.project_id
    }

    pub fn filter(&self) -> SuggestionFilter {
        SuggestionFilter::project(&self.project_id)
    }

    /// Fetch a suggestion of this project that has not been deleted.
    async fn live_suggestion(&self, id: i64) -> AppResult<Suggestion> {
        let mut conn = self.db.acquire().await?;
        let found = db::get_suggestion(&mut conn, id).await?;
        match found {
            Some(s) if s.project_id == self.project_id && s.status != SuggestionStatus::Deleted => {
                Ok(s)
            }
            _ => Err(AppError::NotFound(format!("suggestion {}", id))),
        }
    }

    /// Create a pending suggestion written against `source_hash`.
    pub async fn submit(&self, actor: &Actor, new: NewSuggestion) -> AppResult<Suggestion> {
        let now = Utc::now();
        let new = NewSuggestion {
            project_id: self.project_id.clone(),
            user_id: actor.user_id.clone(),
            ..new
        };

        let mut tx = self.db.begin().await?;
        let id = db::insert_suggestion(&mut tx, &new, now).await?;
        let created = db::get_suggestion(&mut tx, id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("suggestion {}", id)))?;
        db::append_history(&mut tx, &created, &actor.user_id, HistoryAction::Submitted, now).await?;
        tx.commit().await?;

        info!(
            "Suggestion {} submitted for {}/{} by {}",
            created.id, created.language, created.key, actor.user_id
        );
        Ok(created)
    }

    pub async fn moderate(
        &self,
        actor: &Actor,
        id: i64,
        decision: ModerationDecision,
    ) -> AppResult<Suggestion> {
        match decision {
            ModerationDecision::Approved => self.approve(actor, id).await,
            ModerationDecision::Rejected => self.reject(actor, id).await,
        }
    }

    /// Approve `id`, rejecting every other pending or approved suggestion for
    /// the same key first. Each cascaded sibling gets its own `rejected`
    /// history entry.
    pub async fn approve(&self, actor: &Actor, id: i64) -> AppResult<Suggestion> {
        let target = self.live_suggestion(id).await?;
        if !actor.can_moderate {
            return Err(AppError::Forbidden(format!(
                "user {} cannot approve suggestions",
                actor.user_id
            )));
        }

        let _guard = self.locks.lock(group_key(&target)).await;
        let now = Utc::now();
        let mut tx = self.db.begin().await?;

        let current = match db::get_suggestion(&mut tx, id).await? {
            Some(s) if s.status != SuggestionStatus::Deleted => s,
            _ => return Err(AppError::NotFound(format!("suggestion {}", id))),
        };
        match current.status {
            SuggestionStatus::Approved => return Ok(current),
            SuggestionStatus::Pending => {}
            other => {
                return Err(AppError::InvalidTransition(format!(
                    "cannot approve a {} suggestion",
                    other
                )))
            }
        }

        let siblings = db::active_siblings(&mut tx, &current).await?;
        for sibling in &siblings {
            let changed = db::transition_status(
                &mut tx,
                sibling.id,
                &[SuggestionStatus::Pending, SuggestionStatus::Approved],
                SuggestionStatus::Rejected,
                now,
            )
            .await?;
            if changed {
                db::append_history(&mut tx, sibling, &actor.user_id, HistoryAction::Rejected, now)
                    .await?;
            }
        }

        let changed = db::transition_status(
            &mut tx,
            id,
            &[SuggestionStatus::Pending],
            SuggestionStatus::Approved,
            now,
        )
        .await?;
        if !changed {
            return Err(AppError::InvalidTransition(format!(
                "suggestion {} changed during approval",
                id
            )));
        }
        db::append_history(&mut tx, &current, &actor.user_id, HistoryAction::Approved, now).await?;

        let approved = db::get_suggestion(&mut tx, id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("suggestion {}", id)))?;
        tx.commit().await?;

        info!(
            "Suggestion {} approved by {} ({} sibling(s) rejected)",
            id,
            actor.user_id,
            siblings.len()
        );
        Ok(approved)
    }

    pub async fn reject(&self, actor: &Actor, id: i64) -> AppResult<Suggestion> {
        let target = self.live_suggestion(id).await?;
        if !actor.can_moderate {
            return Err(AppError::Forbidden(format!(
                "user {} cannot reject suggestions",
                actor.user_id
            )));
        }

        let _guard = self.locks.lock(group_key(&target)).await;
        self.transition(
            actor,
            id,
            &[SuggestionStatus::Pending, SuggestionStatus::Approved],
            SuggestionStatus::Rejected,
            HistoryAction::Rejected,
        )
        .await
    }

    /// Soft-delete. Moderators may delete anything; owners only their own pending rows.
    pub async fn delete(&self, actor: &Actor, id: i64) -> AppResult<Suggestion> {
        let target = self.live_suggestion(id).await?;
        let owns_pending =
            target.user_id == actor.user_id && target.status == SuggestionStatus::Pending;
        if !actor.can_moderate && !owns_pending {
            return Err(AppError::Forbidden(format!(
                "user {} cannot delete suggestion {}",
                actor.user_id, id
            )));
        }

        let _guard = self.locks.lock(group_key(&target)).await;
        let allowed: &[SuggestionStatus] = if actor.can_moderate {
            &[
                SuggestionStatus::Pending,
                SuggestionStatus::Approved,
                SuggestionStatus::Rejected,
                SuggestionStatus::Committed,
            ]
        } else {
            &[SuggestionStatus::Pending]
        };
        self.transition(actor, id, allowed, SuggestionStatus::Deleted, HistoryAction::Deleted)
            .await
    }

    async fn transition(
        &self,
        actor: &Actor,
        id: i64,
        from: &[SuggestionStatus],
        to: SuggestionStatus,
        action: HistoryAction,
    ) -> AppResult<Suggestion> {
        let now = Utc::now();
        let mut tx = self.db.begin().await?;

        let current = match db::get_suggestion(&mut tx, id).await? {
            Some(s) if s.status != SuggestionStatus::Deleted => s,
            _ => return Err(AppError::NotFound(format!("suggestion {}", id))),
        };
        if current.status == to {
            return Ok(current);
        }
        if !db::transition_status(&mut tx, id, from, to, now).await? {
            return Err(AppError::InvalidTransition(format!(
                "cannot move a {} suggestion to {}",
                current.status, to
            )));
        }
        db::append_history(&mut tx, &current, &actor.user_id, action, now).await?;
        let updated = db::get_suggestion(&mut tx, id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("suggestion {}", id)))?;
        tx.commit().await?;

        info!("Suggestion {} {} by {}", id, to, actor.user_id);
        Ok(updated)
    }

    /// Mark approved suggestions as committed by the commit pipeline.
    /// Ids that are not currently approved are skipped.
    pub async fn mark_committed(
        &self,
        actor: &Actor,
        ids: &[i64],
        commit_sha: &str,
    ) -> AppResult<Vec<Suggestion>> {
        if !actor.can_moderate {
            return Err(AppError::Forbidden(format!(
                "user {} cannot record commits",
                actor.user_id
            )));
        }

        let mut committed = Vec::new();
        for &id in ids {
            let target = match self.live_suggestion(id).await {
                Ok(s) => s,
                Err(AppError::NotFound(_)) => continue,
                Err(e) => return Err(e),
            };
            if target.status != SuggestionStatus::Approved {
                debug!("Skipping commit of suggestion {} in state {}", id, target.status);
                continue;
            }
            let _guard = self.locks.lock(group_key(&target)).await;
            match self
                .transition(
                    actor,
                    id,
                    &[SuggestionStatus::Approved],
                    SuggestionStatus::Committed,
                    HistoryAction::Committed,
                )
                .await
            {
                Ok(s) => committed.push(s),
                Err(AppError::InvalidTransition(_)) => continue,
                Err(e) => return Err(e),
            }
        }
        info!(
            "Recorded commit {}: {} of {} suggestion(s) committed",
            commit_sha,
            committed.len(),
            ids.len()
        );
        Ok(committed)
    }

    /// List suggestions newest first.
    pub async fn list(&self, filter: &SuggestionFilter) -> AppResult<Vec<Suggestion>> {
        let mut conn = self.db.acquire().await?;
        Ok(db::list_suggestions(&mut conn, filter).await?)
    }

    /// List suggestions of one file, re-checking each against the live source
    /// hashes (`key -> hash`). Rows whose validity changed are written back.
    pub async fn list_validated(
        &self,
        filter: &SuggestionFilter,
        live_hashes: &HashMap<String, String>,
    ) -> AppResult<Vec<Suggestion>> {
        let suggestions = self.list(filter).await?;
        self.apply_validity(suggestions, move |_| Some(live_hashes))
            .await
    }

    /// Re-check suggestions spanning several files. `live_hashes` maps a
    /// filename to its `key -> hash` map; rows of files absent from it are
    /// returned unchanged.
    pub async fn revalidate(
        &self,
        suggestions: Vec<Suggestion>,
        live_hashes: &HashMap<String, HashMap<String, String>>,
    ) -> AppResult<Vec<Suggestion>> {
        self.apply_validity(suggestions, move |s| live_hashes.get(&s.filename))
            .await
    }

    async fn apply_validity<'a, F>(
        &self,
        mut suggestions: Vec<Suggestion>,
        live_for: F,
    ) -> AppResult<Vec<Suggestion>>
    where
        F: Fn(&Suggestion) -> Option<&'a HashMap<String, String>>,
    {
        let mut conn = self.db.acquire().await?;
        let now = Utc::now();

        let mut flipped = 0usize;
        for s in suggestions.iter_mut() {
            let Some(live) = live_for(s) else {
                continue;
            };
            let is_valid =
                invalid_reason(Some(s.source_hash.as_str()), live.get(&s.key).map(String::as_str))
                    .is_none();
            if is_valid != s.is_valid {
                db::set_validity(&mut conn, s.id, is_valid, now).await?;
                s.is_valid = is_valid;
                s.updated_at = now;
                flipped += 1;
            }
        }
        if flipped > 0 {
            info!("Re-validated suggestions: {} changed validity", flipped);
        }
        Ok(suggestions)
    }

    pub async fn history(
        &self,
        filter: &SuggestionFilter,
        translation_id: Option<i64>,
    ) -> AppResult<Vec<SuggestionHistoryEntry>> {
        let mut conn = self.db.acquire().await?;
        Ok(db::list_history(&mut conn, filter, translation_id).await?)
    }
}

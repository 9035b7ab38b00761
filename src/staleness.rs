//! Tracks whether each committed target value is still aligned with its source.

use crate::cache::hash_value;
use crate::db::{self, Database};
use crate::error::AppResult;
use crate::model::{SourceString, StoreEntry, StoreStatus, TargetString};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tracing::debug;

/// Result of re-deriving one file's entries.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RefreshPlan {
    /// Every live key's entry, in source order.
    pub entries: Vec<StoreEntry>,
    /// Entries whose stored row must be written.
    pub changed: Vec<StoreEntry>,
    /// Keys that vanished from the source.
    pub removed: Vec<String>,
}

/// Derive the next entry for a key from its stored entry and the live hashes.
pub fn next_entry(
    key: &str,
    previous: Option<&StoreEntry>,
    src_hash: &str,
    tgt_hash: Option<&str>,
    now: DateTime<Utc>,
) -> StoreEntry {
    let fresh = |status: StoreStatus, src: &str, tgt: Option<&str>| StoreEntry {
        key: key.to_string(),
        src_hash: src.to_string(),
        tgt_hash: tgt.map(str::to_string),
        updated_at: now,
        status,
    };

    let Some(tgt_hash) = tgt_hash else {
        return match previous {
            Some(p) if p.status == StoreStatus::Pending && p.src_hash == src_hash => p.clone(),
            _ => fresh(StoreStatus::Pending, src_hash, None),
        };
    };

    match previous {
        Some(p) if p.tgt_hash.as_deref() == Some(tgt_hash) => {
            if p.src_hash == src_hash {
                if p.status == StoreStatus::Verified {
                    p.clone()
                } else {
                    fresh(StoreStatus::Verified, src_hash, Some(tgt_hash))
                }
            } else if p.status == StoreStatus::Outdated {
                p.clone()
            } else {
                // Keep the hash the target was written against.
                fresh(StoreStatus::Outdated, &p.src_hash, Some(tgt_hash))
            }
        }
        _ => fresh(StoreStatus::Verified, src_hash, Some(tgt_hash)),
    }
}

/// Compute the refreshed entries of a file without touching storage.
pub fn plan_refresh(
    existing: &[StoreEntry],
    source: &[SourceString],
    target: Option<&[TargetString]>,
    now: DateTime<Utc>,
) -> RefreshPlan {
    let previous: HashMap<&str, &StoreEntry> =
        existing.iter().map(|e| (e.key.as_str(), e)).collect();
    let targets: HashMap<&str, &TargetString> = target
        .unwrap_or_default()
        .iter()
        .map(|t| (t.key.as_str(), t))
        .collect();

    let mut plan = RefreshPlan::default();
    for src in source {
        let key = src.key.as_str();
        let src_hash = hash_value(&src.value);
        let tgt_hash = targets.get(key).map(|t| hash_value(&t.value));
        let prev = previous.get(key).copied();

        let entry = next_entry(key, prev, &src_hash, tgt_hash.as_deref(), now);
        if prev != Some(&entry) {
            plan.changed.push(entry.clone());
        }
        plan.entries.push(entry);
    }

    let live: std::collections::HashSet<&str> = source.iter().map(|s| s.key.as_str()).collect();
    plan.removed = existing
        .iter()
        .filter(|e| !live.contains(e.key.as_str()))
        .map(|e| e.key.clone())
        .collect();

    plan
}

/// Persistent view of store entries per project, language and file.
#[derive(Clone)]
pub struct StalenessTracker {
    db: Database,
    project_id: String,
}

impl StalenessTracker {
    pub fn new(db: Database, project_id: impl Into<String>) -> Self {
        Self {
            db,
            project_id: project_id.into(),
        }
    }

    /// Re-derive and persist the entries of one file. Returns every live entry.
    pub async fn refresh_file(
        &self,
        language: &str,
        filepath: &str,
        source: &[SourceString],
        target: Option<&[TargetString]>,
    ) -> AppResult<Vec<StoreEntry>> {
        let mut tx = self.db.begin().await?;
        let existing = db::load_store_entries(&mut tx, &self.project_id, language, filepath).await?;
        let plan = plan_refresh(&existing, source, target, Utc::now());

        for entry in &plan.changed {
            db::upsert_store_entry(&mut tx, &self.project_id, language, filepath, entry).await?;
        }
        for key in &plan.removed {
            db::delete_store_entry(&mut tx, &self.project_id, language, filepath, key).await?;
        }
        tx.commit().await?;

        debug!(
            "Refreshed store for {}/{}: {} keys, {} changed, {} removed",
            language,
            filepath,
            plan.entries.len(),
            plan.changed.len(),
            plan.removed.len()
        );
        Ok(plan.entries)
    }

    pub async fn file_entries(&self, language: &str, filepath: &str) -> AppResult<Vec<StoreEntry>> {
        let mut conn = self.db.acquire().await?;
        Ok(db::load_store_entries(&mut conn, &self.project_id, language, filepath).await?)
    }

    /// Tracked files of a language with their key counts.
    pub async fn files(&self, language: &str) -> AppResult<Vec<(String, usize)>> {
        let mut conn = self.db.acquire().await?;
        Ok(db::store_files(&mut conn, &self.project_id, language).await?)
    }
}

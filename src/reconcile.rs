//! Merge of source strings, repository target strings and moderated suggestions.
//!
//! Everything here is a pure function of its inputs, so concurrent requests
//! for the same file can reconcile in parallel without coordination.

use crate::model::{
    GitBlame, MergedTranslation, SourceString, StoreEntry, StoreStatus, Suggestion,
    SuggestionStatus, TargetString, WebTranslation,
};
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};

/// Newest first; equal timestamps fall back to the higher id.
fn newest_first(a: &&Suggestion, b: &&Suggestion) -> Ordering {
    b.created_at
        .cmp(&a.created_at)
        .then_with(|| b.id.cmp(&a.id))
}

fn web_translation(s: &Suggestion) -> WebTranslation {
    WebTranslation {
        id: s.id,
        status: s.status,
        user_id: s.user_id.clone(),
        updated_at: s.updated_at,
    }
}

/// Produce one merged record per source key, in source order.
pub fn merge(
    source: &[SourceString],
    target: Option<&[TargetString]>,
    suggestions: &[Suggestion],
) -> Vec<MergedTranslation> {
    merge_with_blame(source, target, suggestions, &[])
}

/// [`merge`], additionally attaching blame for the target line each value came from.
pub fn merge_with_blame(
    source: &[SourceString],
    target: Option<&[TargetString]>,
    suggestions: &[Suggestion],
    blame: &[GitBlame],
) -> Vec<MergedTranslation> {
    let targets: HashMap<&str, &TargetString> = target
        .unwrap_or_default()
        .iter()
        .map(|t| (t.key.as_str(), t))
        .collect();

    let mut approved: HashMap<&str, &Suggestion> = HashMap::new();
    let mut pending: HashMap<&str, Vec<&Suggestion>> = HashMap::new();
    for s in suggestions {
        match s.status {
            SuggestionStatus::Approved => {
                // More than one approved row would violate the store invariant;
                // prefer the newest if it ever happens.
                approved
                    .entry(s.key.as_str())
                    .and_modify(|current| {
                        if newest_first(&s, current) == Ordering::Less {
                            *current = s;
                        }
                    })
                    .or_insert(s);
            }
            SuggestionStatus::Pending => pending.entry(s.key.as_str()).or_default().push(s),
            _ => {}
        }
    }
    for list in pending.values_mut() {
        list.sort_by(newest_first);
    }

    source
        .iter()
        .map(|src| {
            let key = src.key.as_str();
            let target_string = targets.get(key).copied();
            let winner = approved
                .get(key)
                .copied()
                .or_else(|| pending.get(key).and_then(|list| list.first().copied()));

            let (current_value, is_valid) = match winner {
                Some(s) => (s.value.clone(), s.is_valid),
                None => (
                    target_string.map(|t| t.value.clone()).unwrap_or_default(),
                    true,
                ),
            };

            let git_blame = target_string.and_then(|t| {
                let line = t.char_range.start_line();
                blame
                    .iter()
                    .find(|b| b.start_line <= line && line <= b.end_line)
                    .cloned()
            });

            MergedTranslation {
                key: src.key.clone(),
                source_value: src.value.clone(),
                current_value,
                is_valid,
                git_blame,
                web_translation: winner.map(web_translation),
                char_range: src.char_range,
            }
        })
        .collect()
}

/// Patch staleness results onto already-merged rows.
///
/// Only rows whose value comes from the repository file are affected; a row
/// carried by a suggestion keeps the suggestion's own validity. Returns the
/// number of rows changed.
pub fn apply_store_entries(
    rows: &mut [MergedTranslation],
    entries: &BTreeMap<String, StoreEntry>,
) -> usize {
    let mut patched = 0;
    for row in rows.iter_mut() {
        if row.web_translation.is_some() {
            continue;
        }
        let Some(entry) = entries.get(&row.key) else {
            continue;
        };
        let is_valid = entry.status != StoreStatus::Outdated;
        if row.is_valid != is_valid {
            row.is_valid = is_valid;
            patched += 1;
        }
    }
    patched
}

//! Content hashes and collection fingerprints.

use crate::model::{MergedTranslation, Suggestion, SuggestionHistoryEntry};
use chrono::SecondsFormat;
use sha2::{Digest, Sha256};

/// Content hash used for source and target values: SHA-256, hex, first 16 chars.
pub fn hash_value(value: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(value.as_bytes());
    let hex_string = hex::encode(hasher.finalize());
    hex_string[..16].to_string()
}

pub fn batch_hash_values(values: &[String]) -> Vec<String> {
    values.iter().map(|v| hash_value(v)).collect()
}

/// Stable fingerprint over the mutation markers of a collection.
///
/// Markers are sorted before hashing, so the fingerprint does not depend on
/// the order in which rows were fetched.
pub fn fingerprint<T, F, M>(records: &[T], marker: F) -> String
where
    F: Fn(&T) -> M,
    M: Into<String>,
{
    let mut markers: Vec<String> = records.iter().map(|r| marker(r).into()).collect();
    markers.sort_unstable();

    let mut hasher = Sha256::new();
    hasher.update(markers.len().to_le_bytes());
    for m in &markers {
        hasher.update(m.as_bytes());
        hasher.update([0u8]);
    }
    hex::encode(hasher.finalize())[..32].to_string()
}

pub fn suggestion_marker(s: &Suggestion) -> String {
    format!(
        "{}:{}:{}:{}",
        s.id,
        s.status,
        s.is_valid,
        s.updated_at.to_rfc3339_opts(SecondsFormat::Nanos, true)
    )
}

/// History rows never change, so their id is a sufficient marker.
pub fn history_marker(h: &SuggestionHistoryEntry) -> String {
    h.id.to_string()
}

pub fn merged_marker(m: &MergedTranslation) -> String {
    let web = m
        .web_translation
        .as_ref()
        .map(|w| {
            format!(
                "{}@{}",
                w.id,
                w.updated_at.to_rfc3339_opts(SecondsFormat::Nanos, true)
            )
        })
        .unwrap_or_default();
    let blame = m
        .git_blame
        .as_ref()
        .map(|b| b.commit.as_str())
        .unwrap_or_default();
    format!(
        "{}:{}:{}:{}:{}:{}",
        m.key,
        hash_value(&m.source_value),
        hash_value(&m.current_value),
        m.is_valid,
        web,
        blame
    )
}

/// Whether an `If-None-Match` header value matches `fingerprint`.
///
/// Accepts weak validators, comma-separated lists and `*`.
pub fn etag_matches(if_none_match: &str, fingerprint: &str) -> bool {
    if_none_match.split(',').map(str::trim).any(|candidate| {
        if candidate == "*" {
            return true;
        }
        let candidate = candidate.strip_prefix("W/").unwrap_or(candidate);
        candidate.trim_matches('"') == fingerprint
    })
}

/// Quoted strong `ETag` header value for a fingerprint.
pub fn etag_header(fingerprint: &str) -> String {
    format!("\"{}\"", fingerprint)
}

//! Core records exchanged between the extractor, the store, the reconciler and clients.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Half-open span into raw file text. Lines are 1-indexed, columns are
/// 0-indexed character offsets, the end column is exclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CharRange {
    pub start: (usize, usize),
    pub end: (usize, usize),
}

impl CharRange {
    pub fn new(start: (usize, usize), end: (usize, usize)) -> Self {
        Self { start, end }
    }

    pub fn start_line(&self) -> usize {
        self.start.0
    }
}

/// A translatable entry of either the source file or a target file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileString {
    pub key: String,
    pub value: String,
    pub char_range: CharRange,
}

pub type SourceString = FileString;
pub type TargetString = FileString;

/// Lifecycle of a suggestion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SuggestionStatus {
    Pending,
    Approved,
    Rejected,
    Committed,
    Deleted,
}

impl SuggestionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SuggestionStatus::Pending => "pending",
            SuggestionStatus::Approved => "approved",
            SuggestionStatus::Rejected => "rejected",
            SuggestionStatus::Committed => "committed",
            SuggestionStatus::Deleted => "deleted",
        }
    }
}

impl fmt::Display for SuggestionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SuggestionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(SuggestionStatus::Pending),
            "approved" => Ok(SuggestionStatus::Approved),
            "rejected" => Ok(SuggestionStatus::Rejected),
            "committed" => Ok(SuggestionStatus::Committed),
            "deleted" => Ok(SuggestionStatus::Deleted),
            other => Err(format!("unknown suggestion status '{}'", other)),
        }
    }
}

/// A contributor-submitted candidate translation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Suggestion {
    pub id: i64,
    pub project_id: String,
    pub language: String,
    pub filename: String,
    pub key: String,
    pub value: String,
    pub user_id: String,
    pub status: SuggestionStatus,
    pub source_hash: String,
    pub is_valid: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// What happened to a suggestion in one transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HistoryAction {
    Submitted,
    Approved,
    Rejected,
    Deleted,
    Committed,
}

impl HistoryAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            HistoryAction::Submitted => "submitted",
            HistoryAction::Approved => "approved",
            HistoryAction::Rejected => "rejected",
            HistoryAction::Deleted => "deleted",
            HistoryAction::Committed => "committed",
        }
    }
}

impl FromStr for HistoryAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "submitted" => Ok(HistoryAction::Submitted),
            "approved" => Ok(HistoryAction::Approved),
            "rejected" => Ok(HistoryAction::Rejected),
            "deleted" => Ok(HistoryAction::Deleted),
            "committed" => Ok(HistoryAction::Committed),
            other => Err(format!("unknown history action '{}'", other)),
        }
    }
}

/// Append-only audit record, one per suggestion transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SuggestionHistoryEntry {
    pub id: i64,
    pub translation_id: i64,
    pub project_id: String,
    pub language: String,
    pub filename: String,
    pub key: String,
    pub value: String,
    pub user_id: String,
    pub action: HistoryAction,
    pub source_hash: String,
    pub created_at: DateTime<Utc>,
}

/// Blame metadata for a range of lines in a target file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GitBlame {
    pub start_line: usize,
    pub end_line: usize,
    pub commit: String,
    pub author: String,
    pub date: String,
}

/// The suggestion that supplied a merged value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebTranslation {
    pub id: i64,
    pub status: SuggestionStatus,
    pub user_id: String,
    pub updated_at: DateTime<Utc>,
}

/// The reconciler's resolved record for one source key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MergedTranslation {
    pub key: String,
    pub source_value: String,
    pub current_value: String,
    pub is_valid: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub git_blame: Option<GitBlame>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub web_translation: Option<WebTranslation>,
    pub char_range: CharRange,
}

/// Alignment of a committed target value with the current source value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreStatus {
    Verified,
    Outdated,
    Pending,
}

impl StoreStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StoreStatus::Verified => "verified",
            StoreStatus::Outdated => "outdated",
            StoreStatus::Pending => "pending",
        }
    }
}

impl FromStr for StoreStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "verified" => Ok(StoreStatus::Verified),
            "outdated" => Ok(StoreStatus::Outdated),
            "pending" => Ok(StoreStatus::Pending),
            other => Err(format!("unknown store status '{}'", other)),
        }
    }
}

/// The staleness tracker's per-key record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreEntry {
    pub key: String,
    pub src_hash: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tgt_hash: Option<String>,
    pub updated_at: DateTime<Utc>,
    pub status: StoreStatus,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_char_range_serializes_as_pairs() {
        let range = CharRange::new((3, 12), (3, 19));
        let json = serde_json::to_value(range).expect("serialize");
        assert_eq!(json, serde_json::json!({"start": [3, 12], "end": [3, 19]}));
    }

    #[test]
    fn test_status_from_str() {
        assert_eq!("approved".parse::<SuggestionStatus>(), Ok(SuggestionStatus::Approved));
        assert!("accepted".parse::<SuggestionStatus>().is_err());
        assert!("Approved".parse::<SuggestionStatus>().is_err());
    }

    #[test]
    fn test_store_entry_omits_missing_target_hash() {
        let entry = StoreEntry {
            key: "greeting".to_string(),
            src_hash: "abc".to_string(),
            tgt_hash: None,
            updated_at: "2024-01-15T10:30:00Z".parse().expect("date"),
            status: StoreStatus::Pending,
        };
        let json = serde_json::to_value(&entry).expect("serialize");
        assert_eq!(json["status"], "pending");
        assert_eq!(json["srcHash"], "abc");
        assert!(json.get("tgtHash").is_none());
    }

    #[test]
    fn test_suggestion_uses_camel_case() {
        let now: DateTime<Utc> = "2024-01-15T10:30:00Z".parse().expect("date");
        let suggestion = Suggestion {
            id: 7,
            project_id: "p".to_string(),
            language: "fr".to_string(),
            filename: "common.json".to_string(),
            key: "greeting".to_string(),
            value: "Salut".to_string(),
            user_id: "u1".to_string(),
            status: SuggestionStatus::Pending,
            source_hash: "h".to_string(),
            is_valid: true,
            created_at: now,
            updated_at: now,
        };
        let json = serde_json::to_value(&suggestion).expect("serialize");
        assert_eq!(json["projectId"], "p");
        assert_eq!(json["isValid"], true);
        assert_eq!(json["status"], "pending");
    }
}

//! Request and response bodies of the HTTP API, shared with [`crate::client`].

use crate::error::{AppError, AppResult};
use crate::moderation::{ModerationDecision, TranslationToValidate, ValidationResult};
use crate::model::{SourceString, Suggestion, TargetString};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::OnceLock;

const MAX_KEY_CHARS: usize = 512;
const MAX_VALUE_CHARS: usize = 10_000;
const MAX_BATCH: usize = 10_000;

static LANGUAGE_REGEX: OnceLock<Regex> = OnceLock::new();
static FILENAME_REGEX: OnceLock<Regex> = OnceLock::new();

pub fn validate_language(language: &str) -> AppResult<()> {
    let regex = LANGUAGE_REGEX
        .get_or_init(|| Regex::new(r"^[A-Za-z]{2,3}([-_][A-Za-z0-9]{2,8})*$").expect("static regex"));
    if regex.is_match(language) {
        Ok(())
    } else {
        Err(AppError::Validation(format!("invalid language code {:?}", language)))
    }
}

/// Relative path inside the repository's translation directory.
pub fn validate_filename(filename: &str) -> AppResult<()> {
    let regex = FILENAME_REGEX
        .get_or_init(|| Regex::new(r"^[A-Za-z0-9_][A-Za-z0-9_.\-]*(/[A-Za-z0-9_][A-Za-z0-9_.\-]*)*$").expect("static regex"));
    if regex.is_match(filename) && !filename.split('/').any(|part| part == "..") {
        Ok(())
    } else {
        Err(AppError::Validation(format!("invalid filename {:?}", filename)))
    }
}

fn validate_key(key: &str) -> AppResult<()> {
    if key.trim().is_empty() {
        return Err(AppError::Validation("key must not be empty".to_string()));
    }
    if key.chars().count() > MAX_KEY_CHARS {
        return Err(AppError::Validation(format!(
            "key exceeds {} characters",
            MAX_KEY_CHARS
        )));
    }
    Ok(())
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitRequest {
    pub language: String,
    pub filename: String,
    pub key: String,
    pub value: String,
}

impl SubmitRequest {
    pub fn validate(&self) -> AppResult<()> {
        validate_language(&self.language)?;
        validate_filename(&self.filename)?;
        validate_key(&self.key)?;
        if self.value.chars().count() > MAX_VALUE_CHARS {
            return Err(AppError::Validation(format!(
                "value exceeds {} characters",
                MAX_VALUE_CHARS
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitResponse {
    pub id: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ModerateRequest {
    pub status: ModerationDecision,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommitRequest {
    pub ids: Vec<i64>,
    pub commit_sha: String,
}

impl CommitRequest {
    pub fn validate(&self) -> AppResult<()> {
        if self.ids.is_empty() {
            return Err(AppError::Validation("ids must not be empty".to_string()));
        }
        if self.commit_sha.trim().is_empty() {
            return Err(AppError::Validation("commitSha must not be empty".to_string()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommitResponse {
    pub committed: Vec<Suggestion>,
}

/// Narrowing for suggestion and history listings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListQuery {
    pub language: Option<String>,
    pub filename: Option<String>,
    pub key: Option<String>,
    /// History only: entries of one suggestion.
    pub translation_id: Option<i64>,
}

impl ListQuery {
    pub fn validate(&self) -> AppResult<()> {
        if let Some(language) = &self.language {
            validate_language(language)?;
        }
        if let Some(filename) = &self.filename {
            validate_filename(filename)?;
        }
        Ok(())
    }

    /// Query-string pairs for the fields that are set.
    pub fn pairs(&self) -> Vec<(&'static str, String)> {
        let mut pairs = Vec::new();
        if let Some(v) = &self.language {
            pairs.push(("language", v.clone()));
        }
        if let Some(v) = &self.filename {
            pairs.push(("filename", v.clone()));
        }
        if let Some(v) = &self.key {
            pairs.push(("key", v.clone()));
        }
        if let Some(v) = self.translation_id {
            pairs.push(("translationId", v.to_string()));
        }
        pairs
    }
}

/// Everything a client needs to render one file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileTranslations {
    pub source: Vec<SourceString>,
    pub target: Option<Vec<TargetString>>,
    pub pending: Vec<Suggestion>,
    pub approved: Vec<Suggestion>,
    pub source_language: String,
    pub target_language: String,
    pub filename: String,
    pub commit_sha: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefreshResponse {
    pub files: usize,
    pub keys: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HashRequest {
    pub values: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HashResponse {
    pub hashes: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidateRequest {
    pub translations: Vec<TranslationToValidate>,
    pub source_hashes: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidateResponse {
    pub results: Vec<ValidationResult>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub active_streams: usize,
}

pub fn validate_batch<T>(items: &[T]) -> AppResult<()> {
    if items.len() > MAX_BATCH {
        return Err(AppError::Validation(format!(
            "batch of {} exceeds the limit of {}",
            items.len(),
            MAX_BATCH
        )));
    }
    Ok(())
}

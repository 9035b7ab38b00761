//! Client for the version-control host: raw file text, key ranges and blame.

use crate::cache::TtlCache;
use crate::config::Config;
use crate::error::{AppError, AppResult};
use crate::extract::extract_all;
use crate::model::{CharRange, FileString, GitBlame};
use crate::retry::{with_retry_if, RetryConfig};
use reqwest::header::{ETAG, IF_NONE_MATCH};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use std::collections::BTreeMap;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

const COMMIT_SHA_HEADER: &str = "x-commit-sha";

/// Raw text of one file at the configured ref, with the key ranges fetched
/// alongside that revision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawFile {
    pub text: String,
    pub etag: Option<String>,
    pub commit_sha: Option<String>,
    pub ranges: BTreeMap<String, CharRange>,
}

/// A file's strings after position extraction.
#[derive(Debug, Clone)]
pub struct LoadedFile {
    pub strings: Vec<FileString>,
    pub commit_sha: Option<String>,
}

#[derive(Debug, Error)]
enum HostError {
    /// Transport failure, 429 or 5xx. Worth one more read attempt.
    #[error("{0}")]
    Transient(String),
    #[error("{0}")]
    Rejected(String),
}

impl From<HostError> for AppError {
    fn from(e: HostError) -> Self {
        AppError::UpstreamUnavailable(e.to_string())
    }
}

fn classify(status: StatusCode, url: &str) -> HostError {
    let message = format!("host returned HTTP {} for {}", status, url);
    if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        HostError::Transient(message)
    } else {
        HostError::Rejected(message)
    }
}

enum RawResponse {
    Fresh(RawFile),
    NotModified,
    Missing,
}

type FileKey = (String, String);

pub struct HostClient {
    client: reqwest::Client,
    base_url: String,
    token: Option<String>,
    git_ref: String,
    retry: RetryConfig,
    files: TtlCache<FileKey, Option<RawFile>>,
}

impl HostClient {
    pub fn new(
        base_url: &str,
        token: Option<String>,
        git_ref: &str,
        cache_ttl: Duration,
    ) -> AppResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .user_agent(concat!("translation-reconciler/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| AppError::UpstreamUnavailable(format!("HTTP client setup failed: {}", e)))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
            git_ref: git_ref.to_string(),
            retry: RetryConfig::upstream_read(),
            files: TtlCache::new(cache_ttl),
        })
    }

    pub fn from_config(config: &Config) -> AppResult<Self> {
        Self::new(
            &config.host_api_url,
            config.host_api_token.clone(),
            &config.host_ref,
            config.file_cache_ttl,
        )
    }

    pub fn with_retry_config(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    fn url(&self, kind: &str, language: &str, filename: &str) -> String {
        format!(
            "{}/{}/{}/{}/{}",
            self.base_url, kind, self.git_ref, language, filename
        )
    }

    fn get(&self, url: &str) -> reqwest::RequestBuilder {
        let request = self.client.get(url);
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn request_raw(&self, url: &str, etag: Option<&str>) -> Result<RawResponse, HostError> {
        let mut request = self.get(url);
        if let Some(etag) = etag {
            request = request.header(IF_NONE_MATCH, etag);
        }
        let response = request
            .send()
            .await
            .map_err(|e| HostError::Transient(format!("request to {} failed: {}", url, e)))?;

        let status = response.status();
        if status == StatusCode::NOT_MODIFIED {
            return Ok(RawResponse::NotModified);
        }
        if status == StatusCode::NOT_FOUND {
            return Ok(RawResponse::Missing);
        }
        if !status.is_success() {
            return Err(classify(status, url));
        }

        let header = |name: &str| {
            response
                .headers()
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        };
        let etag = header(ETAG.as_str());
        let commit_sha = header(COMMIT_SHA_HEADER);
        let text = response
            .text()
            .await
            .map_err(|e| HostError::Transient(format!("reading {} failed: {}", url, e)))?;

        Ok(RawResponse::Fresh(RawFile {
            text,
            etag,
            commit_sha,
            ranges: BTreeMap::new(),
        }))
    }

    /// Raw text and key ranges of `language/filename`, or `None` when the host
    /// has no such file.
    ///
    /// Cached for the configured TTL; an expired copy is revalidated with
    /// `If-None-Match` instead of being downloaded again. Ranges are only
    /// re-fetched together with new text, so both always describe the same
    /// revision.
    pub async fn fetch_raw(&self, language: &str, filename: &str) -> AppResult<Option<RawFile>> {
        let key = (language.to_string(), filename.to_string());
        let url = self.url("raw", language, filename);
        let ranges_url = self.url("ranges", language, filename);

        self.files
            .get_or_fetch(key, |stale| self.revalidate(url, ranges_url, stale.flatten()))
            .await
    }

    async fn revalidate(
        &self,
        url: String,
        ranges_url: String,
        stale: Option<RawFile>,
    ) -> AppResult<Option<RawFile>> {
        let etag = stale.as_ref().and_then(|s| s.etag.clone());
        let response = with_retry_if(
            &self.retry,
            &format!("fetch {}", url),
            || self.request_raw(&url, etag.as_deref()),
            |e| matches!(e, HostError::Transient(_)),
        )
        .await?;

        match (response, stale) {
            (RawResponse::Fresh(mut file), _) => {
                file.ranges = self
                    .fetch_json::<BTreeMap<String, CharRange>>(&ranges_url)
                    .await?
                    .unwrap_or_default();
                debug!(
                    "Fetched {} ({} bytes, {} ranges)",
                    url,
                    file.text.len(),
                    file.ranges.len()
                );
                Ok(Some(file))
            }
            (RawResponse::NotModified, Some(stale)) => {
                debug!("{} not modified", url);
                Ok(Some(stale))
            }
            (RawResponse::NotModified, None) => Err(AppError::UpstreamUnavailable(format!(
                "host answered 304 for {} without a cached copy",
                url
            ))),
            (RawResponse::Missing, _) => Ok(None),
        }
    }

    async fn request_json<T: DeserializeOwned>(&self, url: &str) -> Result<Option<T>, HostError> {
        let response = self
            .get(url)
            .send()
            .await
            .map_err(|e| HostError::Transient(format!("request to {} failed: {}", url, e)))?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            return Err(classify(status, url));
        }
        response
            .json::<T>()
            .await
            .map(Some)
            .map_err(|e| HostError::Rejected(format!("invalid JSON from {}: {}", url, e)))
    }

    async fn fetch_json<T: DeserializeOwned>(&self, url: &str) -> AppResult<Option<T>> {
        Ok(with_retry_if(
            &self.retry,
            &format!("fetch {}", url),
            || self.request_json::<T>(url),
            |e| matches!(e, HostError::Transient(_)),
        )
        .await?)
    }

    /// Blame records of a file. Missing blame is not an error.
    pub async fn fetch_blame(&self, language: &str, filename: &str) -> AppResult<Vec<GitBlame>> {
        Ok(self
            .fetch_json(&self.url("blame", language, filename))
            .await?
            .unwrap_or_default())
    }

    /// Fetch a file and extract every key's value.
    pub async fn load_strings(
        &self,
        language: &str,
        filename: &str,
    ) -> AppResult<Option<LoadedFile>> {
        let Some(raw) = self.fetch_raw(language, filename).await? else {
            return Ok(None);
        };

        let strings = extract_all(&raw.text, &raw.ranges);
        debug!(
            "Loaded {}/{}: {} of {} keys extracted",
            language,
            filename,
            strings.len(),
            raw.ranges.len()
        );
        Ok(Some(LoadedFile {
            strings,
            commit_sha: raw.commit_sha,
        }))
    }

    /// Drop a cached file, e.g. after the commit pipeline pushed a new revision.
    pub async fn invalidate(&self, language: &str, filename: &str) {
        self.files
            .invalidate(&(language.to_string(), filename.to_string()))
            .await;
    }
}

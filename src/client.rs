//! HTTP client for the translation API.
//!
//! Identical GETs issued while one is already in flight share its result.
//! Every GET remembers the last `ETag` and body of its URL and revalidates
//! with `If-None-Match`. Reads retry once on transport failures; mutations
//! are sent exactly once.

use crate::api::payload::{
    FileTranslations, ListQuery, ModerateRequest, SubmitRequest, SubmitResponse,
};
use crate::api::{API_KEY_HEADER, USER_ID_HEADER};
use crate::error::ErrorBody;
use crate::model::{MergedTranslation, Suggestion, SuggestionHistoryEntry};
use crate::moderation::ModerationDecision;
use crate::retry::{with_retry_if, RetryConfig};
use crate::stream::{apply_record, spawn_decoder, RecordStream};
use futures::future::{BoxFuture, FutureExt, Shared};
use reqwest::header::{ETAG, IF_NONE_MATCH};
use reqwest::{Method, StatusCode, Url};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

const STREAM_CAPACITY: usize = 64;

#[derive(Debug, Clone, Error)]
pub enum ClientError {
    #[error("request failed: {0}")]
    Transport(String),

    #[error("{code} ({status}): {message}")]
    Api {
        status: u16,
        code: String,
        message: String,
    },

    #[error("invalid response: {0}")]
    Decode(String),
}

impl ClientError {
    pub fn status(&self) -> Option<u16> {
        match self {
            ClientError::Api { status, .. } => Some(*status),
            _ => None,
        }
    }

    fn is_retryable(&self) -> bool {
        matches!(self, ClientError::Transport(_))
    }
}

type SharedBody = Shared<BoxFuture<'static, Result<Arc<String>, ClientError>>>;

#[derive(Clone)]
struct Remembered {
    etag: String,
    body: Arc<String>,
}

#[derive(Clone)]
struct Inner {
    http: reqwest::Client,
    user_id: Option<String>,
    api_key: Option<String>,
    retry: RetryConfig,
    etags: Arc<Mutex<HashMap<String, Remembered>>>,
}

impl Inner {
    fn request(&self, method: Method, url: Url) -> reqwest::RequestBuilder {
        let mut request = self.http.request(method, url);
        if let Some(user_id) = &self.user_id {
            request = request.header(USER_ID_HEADER, user_id);
        }
        if let Some(api_key) = &self.api_key {
            request = request.header(API_KEY_HEADER, api_key);
        }
        request
    }

    fn remembered(&self, url: &str) -> Option<Remembered> {
        self.etags
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(url)
            .cloned()
    }

    async fn get_once(&self, url: Url) -> Result<Arc<String>, ClientError> {
        let key = url.to_string();
        let remembered = self.remembered(&key);

        let mut request = self.request(Method::GET, url);
        if let Some(r) = &remembered {
            request = request.header(IF_NONE_MATCH, &r.etag);
        }
        let response = request
            .send()
            .await
            .map_err(|e| ClientError::Transport(e.to_string()))?;

        if response.status() == StatusCode::NOT_MODIFIED {
            if let Some(r) = remembered {
                debug!("{} not modified", key);
                return Ok(r.body);
            }
            return Err(ClientError::Decode(format!("unexpected 304 for {}", key)));
        }

        let response = error_for_status(response).await?;
        let etag = response
            .headers()
            .get(ETAG)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body = Arc::new(
            response
                .text()
                .await
                .map_err(|e| ClientError::Transport(e.to_string()))?,
        );

        if let Some(etag) = etag {
            self.etags
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(
                    key,
                    Remembered {
                        etag,
                        body: body.clone(),
                    },
                );
        }
        Ok(body)
    }

    async fn get_with_retry(self, url: Url) -> Result<Arc<String>, ClientError> {
        let name = format!("GET {}", url.path());
        with_retry_if(
            &self.retry,
            &name,
            || self.get_once(url.clone()),
            ClientError::is_retryable,
        )
        .await
    }
}

async fn error_for_status(response: reqwest::Response) -> Result<reqwest::Response, ClientError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let text = response.text().await.unwrap_or_default();
    let (code, message) = match serde_json::from_str::<ErrorBody>(&text) {
        Ok(body) => (body.error, body.message),
        Err(_) => ("HTTP_ERROR".to_string(), text),
    };
    Err(ClientError::Api {
        status: status.as_u16(),
        code,
        message,
    })
}

fn decode<T: DeserializeOwned>(body: &str) -> Result<T, ClientError> {
    serde_json::from_str(body).map_err(|e| ClientError::Decode(e.to_string()))
}

pub struct ApiClient {
    base_url: Url,
    inner: Inner,
    in_flight: Mutex<HashMap<String, (u64, SharedBody)>>,
    generation: AtomicU64,
}

impl ApiClient {
    pub fn new(base_url: &str) -> Result<Self, ClientError> {
        let base = format!("{}/", base_url.trim_end_matches('/'));
        let base_url = Url::parse(&base).map_err(|e| ClientError::Decode(e.to_string()))?;
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| ClientError::Transport(e.to_string()))?;

        Ok(Self {
            base_url,
            inner: Inner {
                http,
                user_id: None,
                api_key: None,
                retry: RetryConfig::upstream_read(),
                etags: Arc::new(Mutex::new(HashMap::new())),
            },
            in_flight: Mutex::new(HashMap::new()),
            generation: AtomicU64::new(0),
        })
    }

    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.inner.user_id = Some(user_id.into());
        self
    }

    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.inner.api_key = Some(api_key.into());
        self
    }

    pub fn with_retry_config(mut self, retry: RetryConfig) -> Self {
        self.inner.retry = retry;
        self
    }

    fn url(&self, path: &str, query: &[(&str, String)]) -> Result<Url, ClientError> {
        let mut url = self
            .base_url
            .join(path.trim_start_matches('/'))
            .map_err(|e| ClientError::Decode(e.to_string()))?;
        if !query.is_empty() {
            url.query_pairs_mut()
                .extend_pairs(query.iter().map(|(k, v)| (*k, v.as_str())));
        }
        Ok(url)
    }

    /// GET `url`, joining an identical request that is already in flight.
    async fn get_shared(&self, url: Url) -> Result<Arc<String>, ClientError> {
        let key = url.to_string();
        let (generation, shared) = {
            let mut in_flight = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
            match in_flight.get(&key) {
                Some((generation, shared)) => {
                    debug!("Joining in-flight GET {}", key);
                    (*generation, shared.clone())
                }
                None => {
                    let generation = self.generation.fetch_add(1, Ordering::Relaxed);
                    let shared = self.inner.clone().get_with_retry(url).boxed().shared();
                    in_flight.insert(key.clone(), (generation, shared.clone()));
                    (generation, shared)
                }
            }
        };

        let result = shared.await;

        let mut in_flight = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
        if in_flight.get(&key).map(|(g, _)| *g) == Some(generation) {
            in_flight.remove(&key);
        }
        result
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<T, ClientError> {
        let body = self.get_shared(self.url(path, query)?).await?;
        decode(&body)
    }

    /// Mutations are never retried.
    async fn send_json<B: Serialize, T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: Option<&B>,
    ) -> Result<T, ClientError> {
        let url = self.url(path, &[])?;
        let name = format!("{} {}", method, url.path());
        let text = with_retry_if(
            &RetryConfig::none(),
            &name,
            || {
                let mut request = self.inner.request(method.clone(), url.clone());
                if let Some(body) = body {
                    request = request.json(body);
                }
                async move {
                    let response = request
                        .send()
                        .await
                        .map_err(|e| ClientError::Transport(e.to_string()))?;
                    let response = error_for_status(response).await?;
                    response
                        .text()
                        .await
                        .map_err(|e| ClientError::Transport(e.to_string()))
                }
            },
            ClientError::is_retryable,
        )
        .await?;
        decode(&text)
    }

    pub async fn merged(
        &self,
        language: &str,
        filename: &str,
    ) -> Result<Vec<MergedTranslation>, ClientError> {
        self.get_json(&format!("translations/merged/{}/{}", language, filename), &[])
            .await
    }

    pub async fn file(&self, language: &str, filename: &str) -> Result<FileTranslations, ClientError> {
        self.get_json(&format!("translations/file/{}/{}", language, filename), &[])
            .await
    }

    pub async fn suggestions(&self, query: &ListQuery) -> Result<Vec<Suggestion>, ClientError> {
        self.get_json("translations/suggestions", &query.pairs()).await
    }

    pub async fn history(
        &self,
        query: &ListQuery,
    ) -> Result<Vec<SuggestionHistoryEntry>, ClientError> {
        self.get_json("translations/history", &query.pairs()).await
    }

    pub async fn submit(&self, request: &SubmitRequest) -> Result<i64, ClientError> {
        let response: SubmitResponse = self
            .send_json(Method::POST, "translations", Some(request))
            .await?;
        Ok(response.id)
    }

    pub async fn moderate(
        &self,
        id: i64,
        status: ModerationDecision,
    ) -> Result<Suggestion, ClientError> {
        self.send_json(
            Method::PATCH,
            &format!("translations/{}", id),
            Some(&ModerateRequest { status }),
        )
        .await
    }

    pub async fn delete(&self, id: i64) -> Result<Suggestion, ClientError> {
        self.send_json::<(), _>(Method::DELETE, &format!("translations/{}", id), None)
            .await
    }

    /// Open the staleness stream of a language.
    pub async fn stream_store(&self, language: &str) -> Result<RecordStream, ClientError> {
        let url = self.url(&format!("files/store/stream/{}", language), &[])?;
        let response = self
            .inner
            .request(Method::GET, url)
            .send()
            .await
            .map_err(|e| ClientError::Transport(e.to_string()))?;
        let response = error_for_status(response).await?;
        Ok(spawn_decoder(response.bytes_stream(), STREAM_CAPACITY))
    }

    /// Patch already rendered `rows` of `filename` from the staleness stream.
    /// Files arrive in path order, so reading stops once the stream has moved past it.
    /// Returns how many rows changed validity.
    pub async fn patch_staleness(
        &self,
        language: &str,
        filename: &str,
        rows: &mut [MergedTranslation],
    ) -> Result<usize, ClientError> {
        let mut stream = self.stream_store(language).await?;
        let mut seen = false;
        let mut patched = 0;
        while let Some(record) = stream.recv().await {
            match record.filepath() {
                Some(path) if path == filename => {
                    seen = true;
                    patched += apply_record(rows, filename, &record);
                }
                Some(_) if seen => {
                    stream.cancel();
                    break;
                }
                _ => {}
            }
        }
        Ok(patched)
    }
}

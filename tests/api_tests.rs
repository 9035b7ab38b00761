//! End-to-end tests for the translation API
//!
//! Each test starts the router on an ephemeral port with an in-memory
//! database, a wiremock server standing in for the repository host, and
//! drives it over HTTP with reqwest and the crate's own client.

use reqwest::StatusCode;
use std::sync::Arc;
use std::time::Duration;
use translation_reconciler::{
    api::{self, payload::ListQuery, payload::SubmitRequest, AppState},
    client::{ApiClient, ClientError},
    config::Config,
    db::Database,
    host::HostClient,
    model::{StoreStatus, SuggestionStatus},
    moderation::ModerationDecision,
    stream::StreamRecord,
};
use wiremock::{
    matchers::{method, path},
    Mock, MockServer, ResponseTemplate,
};

// ==================== Test Helpers ====================

const SOURCE_FILE: &str = "{\n  \"greeting\": \"Hello\",\n  \"farewell\": \"Bye\"\n}\n";
const TARGET_FILE: &str = "{\n  \"greeting\": \"Bonjour\"\n}\n";

fn create_test_config(host_url: &str, api_key: Option<&str>) -> Config {
    Config {
        environment: "test".to_string(),
        port: 0,
        database_url: "sqlite::memory:".to_string(),
        project_id: "demo".to_string(),
        source_language: "en".to_string(),
        target_languages: vec!["fr".to_string(), "de".to_string()],
        translation_files: vec!["common.json".to_string()],
        host_api_url: host_url.to_string(),
        host_api_token: None,
        host_ref: "main".to_string(),
        moderator_ids: vec!["mod".to_string()],
        api_key: api_key.map(str::to_string),
        stream_chunk_size: 200,
        file_cache_ttl: Duration::ZERO,
    }
}

async fn mount_file(host: &MockServer, language: &str, text: &str, ranges: serde_json::Value) {
    Mock::given(method("GET"))
        .and(path(format!("/raw/main/{}/common.json", language)))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_string(text)
                .insert_header("x-commit-sha", "abc123"),
        )
        .mount(host)
        .await;
    Mock::given(method("GET"))
        .and(path(format!("/ranges/main/{}/common.json", language)))
        .respond_with(ResponseTemplate::new(200).set_body_json(ranges))
        .mount(host)
        .await;
}

async fn mount_repository(host: &MockServer) {
    mount_file(
        host,
        "en",
        SOURCE_FILE,
        serde_json::json!({
            "greeting": {"start": [2, 14], "end": [2, 21]},
            "farewell": {"start": [3, 14], "end": [3, 19]}
        }),
    )
    .await;
    mount_file(
        host,
        "fr",
        TARGET_FILE,
        serde_json::json!({
            "greeting": {"start": [2, 14], "end": [2, 23]}
        }),
    )
    .await;
}

/// Replace the source value of `greeting` with "Hi there".
async fn change_greeting_source(host: &MockServer) {
    host.reset().await;
    mount_file(
        host,
        "en",
        "{\n  \"greeting\": \"Hi there\",\n  \"farewell\": \"Bye\"\n}\n",
        serde_json::json!({
            "greeting": {"start": [2, 14], "end": [2, 24]},
            "farewell": {"start": [3, 14], "end": [3, 19]}
        }),
    )
    .await;
    mount_file(
        host,
        "fr",
        TARGET_FILE,
        serde_json::json!({"greeting": {"start": [2, 14], "end": [2, 23]}}),
    )
    .await;
}

struct TestApp {
    base_url: String,
    host: MockServer,
}

impl TestApp {
    async fn start(api_key: Option<&str>) -> Self {
        Self::start_with(api_key, |_| {}).await
    }

    async fn start_with(api_key: Option<&str>, configure: impl FnOnce(&mut Config)) -> Self {
        let host = MockServer::start().await;
        mount_repository(&host).await;

        let mut config = create_test_config(&host.uri(), api_key);
        configure(&mut config);
        let db = Database::in_memory().await.expect("database");
        let host_client = HostClient::from_config(&config).expect("host client");
        let state = Arc::new(AppState::new(config, db, host_client));

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let addr = listener.local_addr().expect("addr");
        tokio::spawn(async move {
            axum::serve(listener, api::router(state))
                .await
                .expect("server");
        });

        Self {
            base_url: format!("http://{}", addr),
            host,
        }
    }

    fn client(&self, user_id: &str) -> ApiClient {
        ApiClient::new(&self.base_url)
            .expect("client")
            .with_user(user_id)
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

fn submit_request(value: &str) -> SubmitRequest {
    SubmitRequest {
        language: "fr".to_string(),
        filename: "common.json".to_string(),
        key: "greeting".to_string(),
        value: value.to_string(),
    }
}

fn current_value(rows: &[translation_reconciler::model::MergedTranslation], key: &str) -> String {
    rows.iter()
        .find(|r| r.key == key)
        .map(|r| r.current_value.clone())
        .expect("key present")
}

// ==================== Reconciliation Scenario ====================

#[tokio::test]
async fn test_submit_approve_supersede_scenario() {
    let app = TestApp::start(None).await;
    let alice = app.client("alice");
    let moderator = app.client("mod");

    // Repository value, no suggestions
    let rows = alice.merged("fr", "common.json").await.expect("merged");
    assert_eq!(rows.len(), 2);
    assert_eq!(current_value(&rows, "greeting"), "Bonjour");
    assert_eq!(current_value(&rows, "farewell"), "");
    assert!(rows.iter().all(|r| r.is_valid));

    // Pending draft wins over the repository value
    let salut = alice.submit(&submit_request("Salut")).await.expect("submit");
    let rows = alice.merged("fr", "common.json").await.expect("merged");
    assert_eq!(current_value(&rows, "greeting"), "Salut");

    let approved = moderator
        .moderate(salut, ModerationDecision::Approved)
        .await
        .expect("approve");
    assert_eq!(approved.status, SuggestionStatus::Approved);

    // A later approval supersedes the first
    let coucou = alice.submit(&submit_request("Coucou")).await.expect("submit");
    moderator
        .moderate(coucou, ModerationDecision::Approved)
        .await
        .expect("approve");

    let rows = alice.merged("fr", "common.json").await.expect("merged");
    assert_eq!(current_value(&rows, "greeting"), "Coucou");

    let suggestions = alice
        .suggestions(&ListQuery {
            language: Some("fr".to_string()),
            key: Some("greeting".to_string()),
            ..Default::default()
        })
        .await
        .expect("list");
    let approved: Vec<_> = suggestions
        .iter()
        .filter(|s| s.status == SuggestionStatus::Approved)
        .collect();
    assert_eq!(approved.len(), 1);
    assert_eq!(approved[0].id, coucou);
    let first = suggestions.iter().find(|s| s.id == salut).expect("first");
    assert_eq!(first.status, SuggestionStatus::Rejected);

    // Newest first
    assert_eq!(suggestions[0].id, coucou);
}

#[tokio::test]
async fn test_file_endpoint_partitions_suggestions() {
    let app = TestApp::start(None).await;
    let alice = app.client("alice");
    let moderator = app.client("mod");

    let first = alice.submit(&submit_request("Salut")).await.expect("submit");
    alice.submit(&submit_request("Coucou")).await.expect("submit");
    moderator
        .moderate(first, ModerationDecision::Approved)
        .await
        .expect("approve");
    let pending = alice.submit(&submit_request("Allô")).await.expect("submit");

    let file = alice.file("fr", "common.json").await.expect("file");
    assert_eq!(file.source.len(), 2);
    assert_eq!(file.target.as_ref().map(Vec::len), Some(1));
    assert_eq!(file.approved.len(), 1);
    assert_eq!(file.approved[0].id, first);
    assert_eq!(file.pending.len(), 1);
    assert_eq!(file.pending[0].id, pending);
    assert_eq!(file.source_language, "en");
    assert_eq!(file.commit_sha.as_deref(), Some("abc123"));
}

#[tokio::test]
async fn test_history_records_every_transition() {
    let app = TestApp::start(None).await;
    let alice = app.client("alice");
    let moderator = app.client("mod");

    let id = alice.submit(&submit_request("Salut")).await.expect("submit");
    moderator
        .moderate(id, ModerationDecision::Rejected)
        .await
        .expect("reject");

    let history = alice
        .history(&ListQuery {
            translation_id: Some(id),
            ..Default::default()
        })
        .await
        .expect("history");
    let actions: Vec<&str> = history.iter().map(|h| h.action.as_str()).collect();
    assert_eq!(actions, vec!["rejected", "submitted"]);
    assert_eq!(history[0].user_id, "mod");
}

#[tokio::test]
async fn test_changed_source_invalidates_suggestions() {
    let app = TestApp::start(None).await;
    let alice = app.client("alice");
    let id = alice.submit(&submit_request("Salut")).await.expect("submit");

    change_greeting_source(&app.host).await;

    let suggestions = alice
        .suggestions(&ListQuery {
            language: Some("fr".to_string()),
            filename: Some("common.json".to_string()),
            ..Default::default()
        })
        .await
        .expect("list");
    let stale = suggestions.iter().find(|s| s.id == id).expect("still listed");
    assert!(!stale.is_valid);
    assert_eq!(stale.status, SuggestionStatus::Pending);

    let rows = alice.merged("fr", "common.json").await.expect("merged");
    let greeting = rows.iter().find(|r| r.key == "greeting").expect("greeting");
    assert_eq!(greeting.current_value, "Salut");
    assert!(!greeting.is_valid);
}

#[tokio::test]
async fn test_listing_without_filename_sees_changed_source() {
    let app = TestApp::start(None).await;
    let alice = app.client("alice");
    alice.submit(&submit_request("Salut")).await.expect("submit");

    change_greeting_source(&app.host).await;

    let suggestions = alice
        .suggestions(&ListQuery {
            language: Some("fr".to_string()),
            key: Some("greeting".to_string()),
            ..Default::default()
        })
        .await
        .expect("list");
    assert_eq!(suggestions.len(), 1);
    assert!(!suggestions[0].is_valid);
}

#[tokio::test]
async fn test_moderation_response_sees_changed_source() {
    let app = TestApp::start(None).await;
    let alice = app.client("alice");
    let moderator = app.client("mod");
    let salut = alice.submit(&submit_request("Salut")).await.expect("submit");
    let coucou = alice.submit(&submit_request("Coucou")).await.expect("submit");

    change_greeting_source(&app.host).await;

    let rejected = moderator
        .moderate(salut, ModerationDecision::Rejected)
        .await
        .expect("reject");
    assert!(!rejected.is_valid);
    let approved = moderator
        .moderate(coucou, ModerationDecision::Approved)
        .await
        .expect("approve");
    assert!(!approved.is_valid);
}

// ==================== Error Mapping ====================

#[tokio::test]
async fn test_missing_identity_is_unauthorized() {
    let app = TestApp::start(None).await;
    let anonymous = ApiClient::new(&app.base_url).expect("client");

    let err = anonymous.submit(&submit_request("Salut")).await.unwrap_err();
    assert_eq!(err.status(), Some(401));
}

#[tokio::test]
async fn test_contributor_cannot_moderate() {
    let app = TestApp::start(None).await;
    let alice = app.client("alice");
    let id = alice.submit(&submit_request("Salut")).await.expect("submit");

    let err = alice
        .moderate(id, ModerationDecision::Approved)
        .await
        .unwrap_err();
    assert!(matches!(err, ClientError::Api { status: 403, ref code, .. } if code == "FORBIDDEN"));
}

#[tokio::test]
async fn test_unknown_and_deleted_suggestions_are_not_found() {
    let app = TestApp::start(None).await;
    let alice = app.client("alice");
    let moderator = app.client("mod");

    let err = moderator
        .moderate(9999, ModerationDecision::Approved)
        .await
        .unwrap_err();
    assert_eq!(err.status(), Some(404));

    let id = alice.submit(&submit_request("Salut")).await.expect("submit");
    let deleted = alice.delete(id).await.expect("owner deletes pending");
    assert_eq!(deleted.status, SuggestionStatus::Deleted);

    let err = moderator
        .moderate(id, ModerationDecision::Approved)
        .await
        .unwrap_err();
    assert_eq!(err.status(), Some(404));
}

#[tokio::test]
async fn test_rejected_suggestion_cannot_be_approved() {
    let app = TestApp::start(None).await;
    let alice = app.client("alice");
    let moderator = app.client("mod");

    let id = alice.submit(&submit_request("Salut")).await.expect("submit");
    moderator
        .moderate(id, ModerationDecision::Rejected)
        .await
        .expect("reject");

    let err = moderator
        .moderate(id, ModerationDecision::Approved)
        .await
        .unwrap_err();
    assert_eq!(err.status(), Some(409));
}

#[tokio::test]
async fn test_unknown_status_is_a_validation_error() {
    let app = TestApp::start(None).await;
    let alice = app.client("alice");
    let id = alice.submit(&submit_request("Salut")).await.expect("submit");

    let response = reqwest::Client::new()
        .patch(app.url(&format!("/translations/{}", id)))
        .header("x-user-id", "mod")
        .json(&serde_json::json!({"status": "committed"}))
        .send()
        .await
        .expect("request");
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body: serde_json::Value = response.json().await.expect("json");
    assert_eq!(body["error"], "VALIDATION_ERROR");
}

#[tokio::test]
async fn test_submit_for_unknown_key_is_not_found() {
    let app = TestApp::start(None).await;
    let alice = app.client("alice");

    let mut request = submit_request("Salut");
    request.key = "missing".to_string();
    let err = alice.submit(&request).await.unwrap_err();
    assert_eq!(err.status(), Some(404));

    let mut request = submit_request("Salut");
    request.language = "it".to_string();
    let err = alice.submit(&request).await.unwrap_err();
    assert_eq!(err.status(), Some(400));
}

#[tokio::test]
async fn test_api_key_guards_everything_but_health() {
    let app = TestApp::start(Some("s3cret")).await;
    let http = reqwest::Client::new();

    let response = http
        .get(app.url("/translations/suggestions"))
        .send()
        .await
        .expect("request");
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let response = http
        .get(app.url("/translations/suggestions"))
        .header("x-api-key", "s3cret")
        .send()
        .await
        .expect("request");
    assert_eq!(response.status(), StatusCode::OK);

    let response = http.get(app.url("/health")).send().await.expect("request");
    assert_eq!(response.status(), StatusCode::OK);
    let body: serde_json::Value = response.json().await.expect("json");
    assert_eq!(body["status"], "ok");

    let keyed = app.client("alice").with_api_key("s3cret");
    keyed.submit(&submit_request("Salut")).await.expect("submit with key");
}

// ==================== Conditional Requests ====================

#[tokio::test]
async fn test_list_endpoints_honour_if_none_match() {
    let app = TestApp::start(None).await;
    let alice = app.client("alice");
    alice.submit(&submit_request("Salut")).await.expect("submit");
    let http = reqwest::Client::new();

    let first = http
        .get(app.url("/translations/suggestions?language=fr"))
        .send()
        .await
        .expect("request");
    assert_eq!(first.status(), StatusCode::OK);
    let etag = first
        .headers()
        .get("etag")
        .and_then(|v| v.to_str().ok())
        .expect("etag")
        .to_string();

    let second = http
        .get(app.url("/translations/suggestions?language=fr"))
        .header("if-none-match", &etag)
        .send()
        .await
        .expect("request");
    assert_eq!(second.status(), StatusCode::NOT_MODIFIED);

    // A mutation changes the fingerprint
    alice.submit(&submit_request("Coucou")).await.expect("submit");
    let third = http
        .get(app.url("/translations/suggestions?language=fr"))
        .header("if-none-match", &etag)
        .send()
        .await
        .expect("request");
    assert_eq!(third.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_raw_file_etag() {
    let app = TestApp::start(None).await;
    let http = reqwest::Client::new();

    let first = http
        .get(app.url("/files/fr/common.json"))
        .send()
        .await
        .expect("request");
    assert_eq!(first.status(), StatusCode::OK);
    let etag = first
        .headers()
        .get("etag")
        .and_then(|v| v.to_str().ok())
        .expect("etag")
        .to_string();
    assert_eq!(first.text().await.expect("body"), TARGET_FILE);

    let second = http
        .get(app.url("/files/fr/common.json"))
        .header("if-none-match", &etag)
        .send()
        .await
        .expect("request");
    assert_eq!(second.status(), StatusCode::NOT_MODIFIED);

    let missing = http
        .get(app.url("/files/de/common.json"))
        .send()
        .await
        .expect("request");
    assert_eq!(missing.status(), StatusCode::NOT_FOUND);
}

// ==================== Staleness Stream ====================

#[tokio::test]
async fn test_refresh_then_stream_store() {
    let app = TestApp::start(None).await;
    let http = reqwest::Client::new();

    let response = http
        .post(app.url("/files/store/refresh/fr"))
        .header("x-user-id", "alice")
        .send()
        .await
        .expect("request");
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    let response = http
        .post(app.url("/files/store/refresh/fr"))
        .header("x-user-id", "mod")
        .send()
        .await
        .expect("request");
    assert_eq!(response.status(), StatusCode::OK);
    let body: serde_json::Value = response.json().await.expect("json");
    assert_eq!(body["files"], 1);
    assert_eq!(body["keys"], 2);

    let records = app
        .client("alice")
        .stream_store("fr")
        .await
        .expect("stream")
        .collect()
        .await;
    assert_eq!(records.len(), 3);
    assert!(matches!(
        &records[0],
        StreamRecord::Header { language, total_files: 1, total_keys: 2 } if language == "fr"
    ));
    assert!(matches!(
        &records[1],
        StreamRecord::FileHeader { filepath, total_keys: 2 } if filepath == "common.json"
    ));
    match &records[2] {
        StreamRecord::Chunk {
            chunk_index,
            entries,
            ..
        } => {
            assert_eq!(*chunk_index, 0);
            assert_eq!(entries["greeting"].status, StoreStatus::Verified);
            assert_eq!(entries["farewell"].status, StoreStatus::Pending);
        }
        other => panic!("expected a chunk, got {:?}", other),
    }
}

#[tokio::test]
async fn test_stream_content_type_and_empty_store() {
    let app = TestApp::start(None).await;

    let response = reqwest::Client::new()
        .get(app.url("/files/store/stream/de"))
        .send()
        .await
        .expect("request");
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response
            .headers()
            .get("content-type")
            .and_then(|v| v.to_str().ok()),
        Some("application/x-ndjson")
    );
    let body = response.text().await.expect("body");
    let lines: Vec<&str> = body.lines().collect();
    assert_eq!(lines.len(), 1);
    assert!(lines[0].contains("\"type\":\"header\""));
}

/// Source file with `count` keys, one per line, and its ranges.
fn bulk_source(count: usize) -> (String, serde_json::Value) {
    let mut text = String::from("{\n");
    let mut ranges = serde_json::Map::new();
    for i in 0..count {
        let separator = if i + 1 < count { "," } else { "" };
        text.push_str(&format!("  \"key{:04}\": \"v{:04}\"{}\n", i, i, separator));
        ranges.insert(
            format!("key{:04}", i),
            serde_json::json!({"start": [i + 2, 13], "end": [i + 2, 20]}),
        );
    }
    text.push_str("}\n");
    (text, serde_json::Value::Object(ranges))
}

async fn active_streams(http: &reqwest::Client, app: &TestApp) -> u64 {
    let health: serde_json::Value = http
        .get(app.url("/health"))
        .send()
        .await
        .expect("request")
        .json()
        .await
        .expect("json");
    health["activeStreams"].as_u64().expect("activeStreams")
}

#[tokio::test]
async fn test_dropped_stream_stops_the_producer() {
    let app = TestApp::start_with(None, |config| config.stream_chunk_size = 1).await;
    app.host.reset().await;
    let (text, ranges) = bulk_source(2000);
    mount_file(&app.host, "en", &text, ranges).await;

    let http = reqwest::Client::new();
    let response = http
        .post(app.url("/files/store/refresh/fr"))
        .header("x-user-id", "mod")
        .send()
        .await
        .expect("request");
    assert_eq!(response.status(), StatusCode::OK);
    let body: serde_json::Value = response.json().await.expect("json");
    assert_eq!(body["keys"], 2000);
    assert_eq!(active_streams(&http, &app).await, 0);

    let stream_http = reqwest::Client::new();
    let mut response = stream_http
        .get(app.url("/files/store/stream/fr"))
        .send()
        .await
        .expect("request");
    let first = response.chunk().await.expect("read").expect("first chunk");
    assert!(String::from_utf8_lossy(&first).contains("\"type\":\"header\""));
    drop(response);
    drop(stream_http);

    let mut remaining = 100;
    while active_streams(&http, &app).await > 0 {
        remaining -= 1;
        assert!(remaining > 0, "stream producer still running after the client left");
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

// ==================== Batch Helpers ====================

#[tokio::test]
async fn test_hash_and_validate() {
    let app = TestApp::start(None).await;
    let http = reqwest::Client::new();

    let response = http
        .post(app.url("/hash"))
        .json(&serde_json::json!({"values": ["Hello", "Hello", "Bye"]}))
        .send()
        .await
        .expect("request");
    assert_eq!(response.status(), StatusCode::OK);
    let body: serde_json::Value = response.json().await.expect("json");
    let hashes = body["hashes"].as_array().expect("hashes");
    assert_eq!(hashes.len(), 3);
    assert_eq!(hashes[0], hashes[1]);
    assert_ne!(hashes[0], hashes[2]);

    let response = http
        .post(app.url("/validate"))
        .json(&serde_json::json!({
            "translations": [
                {"id": "1", "key": "greeting", "sourceHash": hashes[0]},
                {"id": "2", "key": "farewell", "sourceHash": "old"}
            ],
            "sourceHashes": {"greeting": hashes[0], "farewell": hashes[2]}
        }))
        .send()
        .await
        .expect("request");
    assert_eq!(response.status(), StatusCode::OK);
    let body: serde_json::Value = response.json().await.expect("json");
    assert_eq!(body["results"][0]["isValid"], true);
    assert_eq!(body["results"][1]["isValid"], false);
}

//! Integration tests using WireMock
//!
//! These tests drive the collector against a mock GitHub API: transport
//! retries and throttling, pagination over both surfaces, and whole runs
//! through the orchestrator with a temporary output directory.

pub mod orchestrator;
pub mod pagination;
pub mod transport;

use chrono::{DateTime, Duration as ChronoDuration, SecondsFormat, Utc};
use integrations_github_collector::config::{EndpointToggles, RetryConfig};
use integrations_github_collector::{CollectorConfig, CollectorConfigBuilder};
use serde_json::{json, Value};
use std::path::Path;
use std::time::Duration;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockBuilder, MockServer, ResponseTemplate};

pub const TEST_TOKEN: &str = "ghp_integration";

/// Helper to create a mock server
pub async fn setup_mock_server() -> MockServer {
    MockServer::start().await
}

/// Helper to create an authenticated mock
pub fn mock_with_auth(path_matcher: &str, method_matcher: &str) -> MockBuilder {
    Mock::given(method(method_matcher))
        .and(path(path_matcher))
        .and(header("Authorization", format!("Bearer {}", TEST_TOKEN).as_str()))
}

/// Helper to create success response templates
pub fn success_response(body: Value) -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_json(body)
}

/// Helper to create error response templates
pub fn error_response(status: u16, message: &str) -> ResponseTemplate {
    ResponseTemplate::new(status).set_body_json(json!({
        "message": message,
        "documentation_url": "https://docs.github.com/rest"
    }))
}

/// Retry settings that keep tests fast.
pub fn fast_retry() -> RetryConfig {
    RetryConfig {
        max_attempts: 3,
        initial_backoff: Duration::from_millis(10),
        max_backoff: Duration::from_millis(50),
        multiplier: 2.0,
        jitter: 0.0,
        max_throttle_waits: 3,
        min_throttle_wait: Duration::from_millis(10),
    }
}

/// Every phase off; tests switch on what they exercise.
pub fn no_endpoints() -> EndpointToggles {
    EndpointToggles {
        repo_metadata: false,
        pulls: false,
        issues: false,
        reviews: false,
        comments: false,
        commits: false,
        branch_protection: false,
        security_features: false,
    }
}

/// A window of the last thirty days.
pub fn window() -> (DateTime<Utc>, DateTime<Utc>) {
    let until = Utc::now();
    (until - ChronoDuration::days(30), until)
}

/// Formats a time the way the API does.
pub fn api_time(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Configuration pointed at the mock server and writing under `output`.
pub fn test_config(server: &MockServer, output: &Path) -> CollectorConfigBuilder {
    let (since, until) = window();
    CollectorConfig::builder()
        .base_url(server.uri())
        .pat(TEST_TOKEN)
        .retry(fast_retry())
        .window(since, until)
        .output_dir(output.to_path_buf())
}

/// Body of a healthy `GET /rate_limit`.
pub fn rate_limit_body() -> Value {
    let reset = (Utc::now() + ChronoDuration::hours(1)).timestamp();
    json!({
        "resources": {
            "core": {"limit": 5000, "used": 1, "remaining": 4999, "reset": reset},
            "graphql": {"limit": 5000, "used": 0, "remaining": 5000, "reset": reset}
        },
        "rate": {"limit": 5000, "used": 1, "remaining": 4999, "reset": reset}
    })
}

/// Mounts a healthy `GET /rate_limit`.
pub async fn mount_rate_limit(server: &MockServer) {
    mock_with_auth("/rate_limit", "GET")
        .respond_with(success_response(rate_limit_body()))
        .mount(server)
        .await;
}

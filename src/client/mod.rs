//! GitHub API transport.
//!
//! [`GitHubClient::send`] performs exactly one HTTP exchange and classifies it
//! into an [`Outcome`]; [`GitHubClient::execute`] drives the pace, send and
//! decide loop until the outcome is final.

use crate::auth::{AuthManager, AuthMethod};
use crate::config::{CollectorConfig, CollectorConfigBuilder, RateLimitConfig, RetryConfig};
use crate::errors::{CollectorError, CollectorErrorKind, CollectorResult};
use crate::observability::{Metrics, TracingHooks};
use crate::pagination::PaginationLinks;
use crate::resilience::{AdaptiveThrottle, AttemptState, QuotaHeaders, RetryDecision, RetryPolicy};
use crate::services::{data_is_empty, parse_errors, GraphQLError};
use crate::types::{EndpointKind, Surface};
use chrono::{DateTime, Utc};
use reqwest::{
    header::{HeaderMap, CONTENT_TYPE},
    Client, Method,
};
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Classification of a single HTTP exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// 2xx/3xx, or a GraphQL payload without blocking errors.
    Success,
    /// Primary or secondary rate limit hit.
    Throttled {
        /// HTTP status.
        status: u16,
        /// When the quota resets, if advertised.
        reset_at: Option<DateTime<Utc>>,
        /// `retry-after` seconds, if advertised.
        retry_after: Option<u64>,
    },
    /// 5xx.
    ServerError {
        /// HTTP status.
        status: u16,
    },
    /// The resource does not exist or is not visible to the token.
    NotFoundOrForbidden {
        /// HTTP status.
        status: u16,
    },
    /// Any other 4xx. Never retried.
    ClientError {
        /// HTTP status.
        status: u16,
        /// Server-provided message.
        message: String,
    },
    /// Timeout, connection failure or a truncated body.
    Transient {
        /// `Timeout`, `ConnectionFailed` or `DeserializationError`.
        kind: CollectorErrorKind,
        /// What went wrong.
        message: String,
    },
}

impl Outcome {
    /// Short label used in logs.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Throttled { .. } => "throttled",
            Self::ServerError { .. } => "server_error",
            Self::NotFoundOrForbidden { .. } => "absent",
            Self::ClientError { .. } => "client_error",
            Self::Transient { .. } => "transient",
        }
    }

    /// The error a failed exchange stands for; `None` for success and absence.
    pub fn to_error(&self, surface: Surface) -> Option<CollectorError> {
        match self {
            Self::Success | Self::NotFoundOrForbidden { .. } => None,
            Self::Throttled {
                status,
                retry_after,
                ..
            } => {
                let kind = match surface {
                    Surface::GraphQl => CollectorErrorKind::GraphQlRateLimitExceeded,
                    Surface::Rest if *status == 429 || retry_after.is_some() => {
                        CollectorErrorKind::SecondaryRateLimitExceeded
                    }
                    Surface::Rest => CollectorErrorKind::PrimaryRateLimitExceeded,
                };
                Some(CollectorError::new(kind, format!("{} rate limit hit", surface)).with_status(*status))
            }
            Self::ServerError { status } => Some(CollectorError::from_response(
                *status,
                format!("Server error HTTP {}", status),
                None,
            )),
            Self::ClientError { status, message } => {
                Some(CollectorError::from_response(*status, message.clone(), None))
            }
            Self::Transient { kind, message } => Some(CollectorError::new(kind.clone(), message.clone())),
        }
    }
}

/// One request to either surface.
#[derive(Debug, Clone)]
pub struct ApiRequest {
    /// Surface the request is throttled against.
    pub surface: Surface,
    /// HTTP method.
    pub method: Method,
    /// Path relative to the base URL, or an absolute URL.
    pub target: String,
    /// Query parameters.
    pub query: Vec<(String, String)>,
    /// JSON body.
    pub body: Option<Value>,
    /// Endpoint the request is counted against.
    pub endpoint: Option<EndpointKind>,
}

impl ApiRequest {
    /// Creates a REST GET request.
    pub fn get(target: impl Into<String>) -> Self {
        Self {
            surface: Surface::Rest,
            method: Method::GET,
            target: target.into(),
            query: Vec::new(),
            body: None,
            endpoint: None,
        }
    }

    /// Creates a GraphQL request.
    pub fn graphql(target: impl Into<String>, query: &str, variables: Value) -> Self {
        Self {
            surface: Surface::GraphQl,
            method: Method::POST,
            target: target.into(),
            query: Vec::new(),
            body: Some(json!({ "query": query, "variables": variables })),
            endpoint: None,
        }
    }

    /// Adds a query parameter.
    pub fn with_query(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.query.push((key.into(), value.to_string()));
        self
    }

    /// Adds every field of a serializable value as query parameters.
    pub fn with_params<P: Serialize>(mut self, params: &P) -> CollectorResult<Self> {
        let encoded = serde_urlencoded::to_string(params).map_err(|e| {
            CollectorError::new(
                CollectorErrorKind::InvalidParameter,
                format!("Failed to serialize parameters: {}", e),
            )
        })?;
        self.query
            .extend(url::form_urlencoded::parse(encoded.as_bytes()).into_owned());
        Ok(self)
    }

    /// Tags the request with the endpoint it collects.
    pub fn for_endpoint(mut self, endpoint: EndpointKind) -> Self {
        self.endpoint = Some(endpoint);
        self
    }
}

/// A parsed response.
#[derive(Debug, Clone)]
pub struct ApiResponse {
    /// HTTP status.
    pub status: u16,
    /// JSON body (`Null` when empty).
    pub body: Value,
    /// Link header.
    pub links: PaginationLinks,
    /// `x-github-request-id`, if sent.
    pub request_id: Option<String>,
    /// Request id, or a generated id when the server sent none.
    pub correlation_id: String,
    /// Quota headers.
    pub quota: QuotaHeaders,
}

/// Result of one exchange.
#[derive(Debug, Clone)]
pub struct Attempt {
    /// Classification.
    pub outcome: Outcome,
    /// Parsed response, absent for transport failures.
    pub response: Option<ApiResponse>,
}

/// Final result of a request after retries.
#[derive(Debug, Clone)]
pub enum Fetch {
    /// The resource was returned.
    Found(ApiResponse),
    /// The resource does not exist or is inaccessible.
    Absent {
        /// HTTP status that signalled absence.
        status: u16,
    },
}

impl Fetch {
    /// Returns the response, if found.
    pub fn into_found(self) -> Option<ApiResponse> {
        match self {
            Self::Found(response) => Some(response),
            Self::Absent { .. } => None,
        }
    }

    /// Returns true if the resource was absent.
    pub fn is_absent(&self) -> bool {
        matches!(self, Self::Absent { .. })
    }
}

/// GitHub API client shared by every collector of a run.
pub struct GitHubClient {
    /// HTTP client.
    http: Client,
    /// Configuration.
    config: Arc<CollectorConfig>,
    /// Authentication manager.
    auth: Arc<AuthManager>,
    /// Adaptive throttle.
    throttle: Arc<AdaptiveThrottle>,
    /// Retry policy.
    retry: RetryPolicy,
    /// Run metrics.
    metrics: Arc<Metrics>,
}

impl GitHubClient {
    /// Creates a new GitHub client.
    pub fn new(config: CollectorConfig) -> CollectorResult<Self> {
        config.validate()?;

        let http = Client::builder()
            .timeout(config.timeout)
            .connect_timeout(config.connect_timeout)
            .pool_max_idle_per_host(config.pool.max_idle_per_host)
            .pool_idle_timeout(config.pool.idle_timeout)
            .build()
            .map_err(|e| {
                CollectorError::new(
                    CollectorErrorKind::InvalidConfiguration,
                    format!("Failed to create HTTP client: {}", e),
                )
            })?;

        let auth = Arc::new(AuthManager::new(config.auth.clone().ok_or_else(|| {
            CollectorError::new(CollectorErrorKind::MissingAuth, "Authentication required")
        })?));

        Ok(Self {
            http,
            throttle: Arc::new(AdaptiveThrottle::new(&config.rate_limit)),
            retry: RetryPolicy::new(&config.retry),
            metrics: Arc::new(Metrics::new()),
            auth,
            config: Arc::new(config),
        })
    }

    /// Creates a new client builder.
    pub fn builder() -> GitHubClientBuilder {
        GitHubClientBuilder::new()
    }

    /// Gets the configuration.
    pub fn config(&self) -> &CollectorConfig {
        &self.config
    }

    /// Gets the base URL.
    pub fn base_url(&self) -> &str {
        &self.config.base_url
    }

    /// Gets the shared throttle.
    pub fn throttle(&self) -> &Arc<AdaptiveThrottle> {
        &self.throttle
    }

    /// Gets the run metrics.
    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    /// Checks the token with `GET /rate_limit` and seeds both surfaces' quota.
    ///
    /// Bad credentials come back as a fatal error. Servers with rate limiting
    /// disabled answer 404, which is accepted.
    pub async fn verify_authentication(&self) -> CollectorResult<()> {
        let fetch = self.execute(&ApiRequest::get("/rate_limit")).await?;
        let response = match fetch {
            Fetch::Found(response) => response,
            Fetch::Absent { status } => {
                info!(status = status, "Rate limit endpoint unavailable, quota unknown");
                return Ok(());
            }
        };

        for (surface, resource) in [(Surface::Rest, "core"), (Surface::GraphQl, "graphql")] {
            if let Some(headers) = quota_from_resource(&response.body["resources"][resource]) {
                self.throttle.update(surface, &headers);
            }
        }

        info!(
            auth = self.auth.method().token_prefix(),
            core_remaining = response.body["resources"]["core"]["remaining"].as_i64(),
            graphql_remaining = response.body["resources"]["graphql"]["remaining"].as_i64(),
            "Authenticated against GitHub API"
        );
        Ok(())
    }

    /// GETs a REST resource.
    pub async fn get_json(&self, path: &str, endpoint: EndpointKind) -> CollectorResult<Fetch> {
        self.execute(&ApiRequest::get(path).for_endpoint(endpoint)).await
    }

    /// Runs a GraphQL query.
    ///
    /// Blocking GraphQL errors are classified like HTTP statuses; the
    /// `data` member is returned as the response body.
    pub async fn graphql(
        &self,
        query: &str,
        variables: Value,
        endpoint: EndpointKind,
    ) -> CollectorResult<Fetch> {
        let request =
            ApiRequest::graphql(self.config.graphql_path.clone(), query, variables).for_endpoint(endpoint);
        Ok(match self.execute(&request).await? {
            Fetch::Found(mut response) => {
                response.body = response.body["data"].take();
                Fetch::Found(response)
            }
            absent => absent,
        })
    }

    /// Sends a request, pacing and retrying until the outcome is final.
    pub async fn execute(&self, request: &ApiRequest) -> CollectorResult<Fetch> {
        let mut state = AttemptState::default();
        let method = request.method.as_str();

        loop {
            self.throttle.pace(request.surface).await;
            let attempt = self.send(request).await?;

            match self.retry.decide(&attempt.outcome, &mut state, Utc::now()) {
                RetryDecision::Done => return self.finish(request, attempt),
                RetryDecision::Retry { delay, throttled } => {
                    if throttled {
                        let status = attempt.response.as_ref().map(|r| r.status).unwrap_or(0);
                        self.metrics.record_throttle_wait(request.endpoint, delay);
                        TracingHooks::on_throttled(request.surface, &request.target, status, delay);
                    } else {
                        self.metrics.record_retry(request.endpoint);
                        TracingHooks::on_retry(
                            method,
                            &request.target,
                            state.failures,
                            delay,
                            attempt.outcome.label(),
                        );
                    }
                    tokio::time::sleep(delay).await;
                }
                RetryDecision::Exhausted => {
                    self.metrics.record_failure(request.endpoint);
                    let mut error = CollectorError::retry_exhausted(format!(
                        "Giving up on {} {} after {} failures and {} throttled waits ({})",
                        method,
                        request.target,
                        state.failures,
                        state.throttle_waits,
                        attempt.outcome.label()
                    ));
                    if let Some(cause) = attempt.outcome.to_error(request.surface) {
                        error = error.with_cause(cause);
                    }
                    if let Some(response) = attempt.response {
                        error = error.with_status(response.status);
                        if let Some(info) = response.quota.to_rate_limit_info() {
                            error = error.with_rate_limit(info);
                        }
                        if let Some(id) = response.request_id {
                            error = error.with_request_id(id);
                        }
                    }
                    TracingHooks::on_request_error(method, &request.target, &error.to_string());
                    return Err(error);
                }
            }
        }
    }

    fn finish(&self, request: &ApiRequest, attempt: Attempt) -> CollectorResult<Fetch> {
        match (attempt.outcome, attempt.response) {
            (Outcome::Success, Some(response)) => {
                self.metrics.record_success();
                Ok(Fetch::Found(response))
            }
            (Outcome::NotFoundOrForbidden { status }, _) => {
                debug!(url = %request.target, status = status, "Resource absent");
                Ok(Fetch::Absent { status })
            }
            (Outcome::ClientError { status, message }, response) => {
                self.metrics.record_failure(request.endpoint);
                let query_rejected = request.surface == Surface::GraphQl
                    && response.as_ref().map_or(false, |r| !parse_errors(&r.body).is_empty());
                let request_id = response.and_then(|r| r.request_id);
                if query_rejected {
                    let mut error = CollectorError::query(message).with_status(status);
                    if let Some(id) = request_id {
                        error = error.with_request_id(id);
                    }
                    return Err(error);
                }
                Err(CollectorError::from_response(status, message, request_id))
            }
            (outcome, _) => Err(CollectorError::new(
                CollectorErrorKind::Unknown,
                format!("Unexpected final outcome: {}", outcome.label()),
            )),
        }
    }

    /// Performs one HTTP exchange and classifies it.
    ///
    /// Transport failures come back as [`Outcome::Transient`]; only local
    /// problems (missing token, unusable URL) are errors.
    pub async fn send(&self, request: &ApiRequest) -> CollectorResult<Attempt> {
        let auth_header = self.auth.auth_header()?;
        let url = self.build_url(&request.target)?;
        let method = request.method.as_str();

        let headers = [
            ("authorization", auth_header.as_str()),
            ("user-agent", self.config.user_agent.as_str()),
            ("accept", "application/vnd.github+json"),
            ("x-github-api-version", self.config.api_version.as_str()),
        ];
        let mut builder = self.http.request(request.method.clone(), url.clone());
        for (name, value) in headers {
            builder = builder.header(name, value);
        }

        if !request.query.is_empty() {
            builder = builder.query(&request.query);
        }
        if let Some(body) = &request.body {
            let bytes = serde_json::to_vec(body)?;
            builder = builder.header(CONTENT_TYPE, "application/json").body(bytes);
        }

        TracingHooks::on_request_start(request.surface, method, url.as_str());
        TracingHooks::on_request_headers(&headers);
        self.metrics.record_request(request.endpoint);
        let started = Instant::now();

        let response = match builder.send().await {
            Ok(response) => response,
            Err(e) => {
                let (kind, message) = if e.is_timeout() {
                    (CollectorErrorKind::Timeout, format!("Request timed out: {}", e))
                } else if e.is_connect() {
                    (CollectorErrorKind::ConnectionFailed, format!("Connection failed: {}", e))
                } else {
                    (CollectorErrorKind::ConnectionFailed, format!("Request failed: {}", e))
                };
                return Ok(Attempt {
                    outcome: Outcome::Transient { kind, message },
                    response: None,
                });
            }
        };

        let status = response.status().as_u16();
        let headers = response.headers().clone();
        let quota = extract_quota(&headers);
        self.throttle.update(request.surface, &quota);
        if let Some(info) = quota.to_rate_limit_info() {
            TracingHooks::on_rate_limit_update(&info);
        }

        let request_id = header_str(&headers, "x-github-request-id").map(String::from);
        let correlation_id = request_id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let links = PaginationLinks::from_headers(&headers);

        let bytes = match response.bytes().await {
            Ok(bytes) => bytes,
            Err(e) => {
                return Ok(Attempt {
                    outcome: Outcome::Transient {
                        kind: if e.is_timeout() {
                            CollectorErrorKind::Timeout
                        } else {
                            CollectorErrorKind::ConnectionFailed
                        },
                        message: format!("Failed to read response body: {}", e),
                    },
                    response: None,
                })
            }
        };

        let elapsed = started.elapsed();
        self.metrics.record_latency(elapsed);
        TracingHooks::on_request_complete(method, url.as_str(), status, elapsed, &correlation_id);

        let body = if bytes.is_empty() {
            Value::Null
        } else {
            match serde_json::from_slice::<Value>(&bytes) {
                Ok(value) => value,
                Err(_) if (200..300).contains(&status) => {
                    return Ok(Attempt {
                        outcome: Outcome::Transient {
                            kind: CollectorErrorKind::DeserializationError,
                            message: format!("Malformed JSON body from {}", url),
                        },
                        response: None,
                    });
                }
                Err(_) => Value::String(String::from_utf8_lossy(&bytes).into_owned()),
            }
        };

        let outcome = classify(status, &quota, &body);
        Ok(Attempt {
            outcome,
            response: Some(ApiResponse {
                status,
                body,
                links,
                request_id,
                correlation_id,
                quota,
            }),
        })
    }

    fn build_url(&self, target: &str) -> CollectorResult<url::Url> {
        let raw = if target.starts_with("http://") || target.starts_with("https://") {
            target.to_string()
        } else {
            let base = self.config.base_url.trim_end_matches('/');
            let path = target.trim_start_matches('/');
            format!("{}/{}", base, path)
        };
        url::Url::parse(&raw).map_err(|e| {
            CollectorError::new(
                CollectorErrorKind::InvalidParameter,
                format!("Invalid request URL '{}': {}", raw, e),
            )
        })
    }
}

/// Classifies a response.
pub fn classify(status: u16, quota: &QuotaHeaders, body: &Value) -> Outcome {
    match status {
        429 => throttled(status, quota),
        403 if quota.is_exhausted()
            || quota.retry_after.is_some()
            || mentions_rate_limit(&error_message(status, body)) =>
        {
            throttled(status, quota)
        }
        403 | 404 | 409 | 410 => Outcome::NotFoundOrForbidden { status },
        500..=599 => Outcome::ServerError { status },
        400..=499 => Outcome::ClientError {
            status,
            message: error_message(status, body),
        },
        _ => classify_graphql_errors(status, quota, body),
    }
}

/// Classifies the `errors` member of a GraphQL payload.
fn classify_graphql_errors(status: u16, quota: &QuotaHeaders, body: &Value) -> Outcome {
    let errors = parse_errors(body);
    if errors.is_empty() {
        return Outcome::Success;
    }

    if errors.iter().any(GraphQLError::is_rate_limited) {
        return throttled(status, quota);
    }

    let empty = data_is_empty(body);
    if empty && errors.iter().all(GraphQLError::is_absent) {
        return Outcome::NotFoundOrForbidden { status: 404 };
    }

    if !empty {
        // Partial data with field-level errors is still usable.
        return Outcome::Success;
    }

    let message = errors
        .iter()
        .map(|e| e.message.as_str())
        .filter(|m| !m.is_empty())
        .collect::<Vec<_>>()
        .join("; ");
    Outcome::ClientError {
        status: 422,
        message: if message.is_empty() {
            "GraphQL query failed".to_string()
        } else {
            message
        },
    }
}

fn throttled(status: u16, quota: &QuotaHeaders) -> Outcome {
    Outcome::Throttled {
        status,
        reset_at: quota.reset_at,
        retry_after: quota.retry_after,
    }
}

fn mentions_rate_limit(message: &str) -> bool {
    let lower = message.to_lowercase();
    lower.contains("secondary rate limit") || lower.contains("rate limit exceeded") || lower.contains("abuse")
}

fn error_message(status: u16, body: &Value) -> String {
    body.get("message")
        .and_then(Value::as_str)
        .map(String::from)
        .unwrap_or_else(|| format!("HTTP {} error", status))
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// Extracts quota headers from a response.
pub fn extract_quota(headers: &HeaderMap) -> QuotaHeaders {
    QuotaHeaders {
        limit: header_str(headers, "x-ratelimit-limit").and_then(|v| v.trim().parse().ok()),
        remaining: header_str(headers, "x-ratelimit-remaining").and_then(|v| v.trim().parse().ok()),
        reset_at: header_str(headers, "x-ratelimit-reset")
            .and_then(|v| v.trim().parse::<i64>().ok())
            .and_then(|ts| DateTime::from_timestamp(ts, 0)),
        retry_after: header_str(headers, "retry-after").and_then(|v| v.trim().parse().ok()),
        resource: header_str(headers, "x-ratelimit-resource").map(String::from),
    }
}

/// Reads one `resources.*` entry of the `/rate_limit` body.
fn quota_from_resource(resource: &Value) -> Option<QuotaHeaders> {
    Some(QuotaHeaders {
        limit: resource.get("limit")?.as_u64().map(|v| v.min(u32::MAX as u64) as u32),
        remaining: resource.get("remaining")?.as_i64(),
        reset_at: resource
            .get("reset")?
            .as_i64()
            .and_then(|ts| DateTime::from_timestamp(ts, 0)),
        retry_after: None,
        resource: None,
    })
}

/// Builder for GitHubClient.
pub struct GitHubClientBuilder {
    config_builder: CollectorConfigBuilder,
}

impl GitHubClientBuilder {
    /// Creates a new builder.
    pub fn new() -> Self {
        Self {
            config_builder: CollectorConfig::builder(),
        }
    }

    /// Sets the base URL.
    pub fn base_url(mut self, url: impl Into<String>) -> Self {
        self.config_builder = self.config_builder.base_url(url);
        self
    }

    /// Sets the authentication method.
    pub fn auth(mut self, auth: AuthMethod) -> Self {
        self.config_builder = self.config_builder.auth(auth);
        self
    }

    /// Sets a personal access token.
    pub fn pat(self, token: impl Into<String>) -> Self {
        self.auth(AuthMethod::pat(token))
    }

    /// Sets the organization being collected.
    pub fn organization(mut self, login: impl Into<String>) -> Self {
        self.config_builder = self.config_builder.organization(login);
        self
    }

    /// Sets the timeout.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.config_builder = self.config_builder.timeout(timeout);
        self
    }

    /// Sets the User-Agent.
    pub fn user_agent(mut self, ua: impl Into<String>) -> Self {
        self.config_builder = self.config_builder.user_agent(ua);
        self
    }

    /// Sets the retry configuration.
    pub fn retry(mut self, config: RetryConfig) -> Self {
        self.config_builder = self.config_builder.retry(config);
        self
    }

    /// Sets the rate limit configuration.
    pub fn rate_limit(mut self, config: RateLimitConfig) -> Self {
        self.config_builder = self.config_builder.rate_limit(config);
        self
    }

    /// Builds the client.
    pub fn build(self) -> CollectorResult<GitHubClient> {
        let config = self.config_builder.build()?;
        GitHubClient::new(config)
    }
}

impl Default for GitHubClientBuilder {
    fn default() -> Self {
        Self::new()
    }
}

//! Error types for the collection engine.

use chrono::{DateTime, Utc};
use std::fmt;
use thiserror::Error;

/// Result type alias for collector operations.
pub type CollectorResult<T> = Result<T, CollectorError>;

/// Error kinds for categorizing collector errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CollectorErrorKind {
    // Configuration errors
    /// Missing authentication configuration.
    MissingAuth,
    /// Invalid base URL.
    InvalidBaseUrl,
    /// Invalid configuration.
    InvalidConfiguration,

    // Authentication errors
    /// Bad credentials (401).
    BadCredentials,

    // Request errors
    /// Request validation failed (400).
    ValidationError,
    /// Invalid parameter.
    InvalidParameter,
    /// Unprocessable entity (422).
    UnprocessableEntity,

    // Resource errors
    /// Access forbidden.
    Forbidden,
    /// Resource not found (404).
    NotFound,
    /// Resource is gone (410).
    Gone,
    /// Resource conflict (409).
    Conflict,

    // Rate limit errors
    /// Primary rate limit exceeded.
    PrimaryRateLimitExceeded,
    /// Secondary rate limit exceeded.
    SecondaryRateLimitExceeded,
    /// GraphQL point budget exceeded.
    GraphQlRateLimitExceeded,

    // Network errors
    /// Connection failed.
    ConnectionFailed,
    /// Request timeout.
    Timeout,

    // Server errors
    /// Internal server error (500).
    InternalError,
    /// Bad gateway (502).
    BadGateway,
    /// Service unavailable (503).
    ServiceUnavailable,

    // Response errors
    /// Failed to deserialize response.
    DeserializationError,

    // GraphQL errors
    /// The GraphQL query was rejected.
    QueryError,

    // Storage errors
    /// Filesystem error while reading or writing state.
    Io,
    /// Persisted state could not be parsed.
    CorruptState,

    // Retry
    /// The retry ceiling for a single request was reached.
    RetryExhausted,

    // Generic
    /// Unknown error.
    Unknown,
}

impl fmt::Display for CollectorErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingAuth => write!(f, "missing_auth"),
            Self::InvalidBaseUrl => write!(f, "invalid_base_url"),
            Self::InvalidConfiguration => write!(f, "invalid_configuration"),
            Self::BadCredentials => write!(f, "bad_credentials"),
            Self::ValidationError => write!(f, "validation_error"),
            Self::InvalidParameter => write!(f, "invalid_parameter"),
            Self::UnprocessableEntity => write!(f, "unprocessable_entity"),
            Self::Forbidden => write!(f, "forbidden"),
            Self::NotFound => write!(f, "not_found"),
            Self::Gone => write!(f, "gone"),
            Self::Conflict => write!(f, "conflict"),
            Self::PrimaryRateLimitExceeded => write!(f, "primary_rate_limit_exceeded"),
            Self::SecondaryRateLimitExceeded => write!(f, "secondary_rate_limit_exceeded"),
            Self::GraphQlRateLimitExceeded => write!(f, "graphql_rate_limit_exceeded"),
            Self::ConnectionFailed => write!(f, "connection_failed"),
            Self::Timeout => write!(f, "timeout"),
            Self::InternalError => write!(f, "internal_error"),
            Self::BadGateway => write!(f, "bad_gateway"),
            Self::ServiceUnavailable => write!(f, "service_unavailable"),
            Self::DeserializationError => write!(f, "deserialization_error"),
            Self::QueryError => write!(f, "query_error"),
            Self::Io => write!(f, "io"),
            Self::CorruptState => write!(f, "corrupt_state"),
            Self::RetryExhausted => write!(f, "retry_exhausted"),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}

/// Rate limit information extracted from response headers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitInfo {
    /// Maximum requests allowed.
    pub limit: u32,
    /// Remaining requests in current window, clamped at zero.
    pub remaining: u32,
    /// Time when the rate limit resets.
    pub reset_at: DateTime<Utc>,
    /// Retry-After header value in seconds (if present).
    pub retry_after: Option<u64>,
    /// Resource category.
    pub resource: Option<String>,
}

/// Collector error with detailed information.
#[derive(Error, Debug)]
pub struct CollectorError {
    /// Error kind.
    kind: CollectorErrorKind,
    /// Error message.
    message: String,
    /// HTTP status code.
    status_code: Option<u16>,
    /// GitHub request ID.
    request_id: Option<String>,
    /// Rate limit info (if applicable).
    rate_limit: Option<RateLimitInfo>,
    /// Underlying cause.
    #[source]
    cause: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl fmt::Display for CollectorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.kind, self.message)?;
        if let Some(code) = self.status_code {
            write!(f, " (HTTP {})", code)?;
        }
        if let Some(ref id) = self.request_id {
            write!(f, " [request_id: {}]", id)?;
        }
        Ok(())
    }
}

impl CollectorError {
    /// Creates a new collector error.
    pub fn new(kind: CollectorErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            status_code: None,
            request_id: None,
            rate_limit: None,
            cause: None,
        }
    }

    /// Sets the HTTP status code.
    pub fn with_status(mut self, code: u16) -> Self {
        self.status_code = Some(code);
        self
    }

    /// Sets the GitHub request ID.
    pub fn with_request_id(mut self, id: impl Into<String>) -> Self {
        self.request_id = Some(id.into());
        self
    }

    /// Sets the rate limit info.
    pub fn with_rate_limit(mut self, info: RateLimitInfo) -> Self {
        self.rate_limit = Some(info);
        self
    }

    /// Sets the underlying cause.
    pub fn with_cause(mut self, cause: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.cause = Some(Box::new(cause));
        self
    }

    /// Gets the error kind.
    pub fn kind(&self) -> &CollectorErrorKind {
        &self.kind
    }

    /// Gets the error message.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Gets the HTTP status code.
    pub fn status_code(&self) -> Option<u16> {
        self.status_code
    }

    /// Gets the request ID.
    pub fn request_id(&self) -> Option<&str> {
        self.request_id.as_deref()
    }

    /// Gets the rate limit info.
    pub fn rate_limit(&self) -> Option<&RateLimitInfo> {
        self.rate_limit.as_ref()
    }

    /// Returns true if a unit that failed with this error may succeed on a later run.
    ///
    /// Client errors are permanent; everything the transport gave up on after
    /// retrying, and local storage failures, are not.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind,
            CollectorErrorKind::PrimaryRateLimitExceeded
                | CollectorErrorKind::SecondaryRateLimitExceeded
                | CollectorErrorKind::GraphQlRateLimitExceeded
                | CollectorErrorKind::ConnectionFailed
                | CollectorErrorKind::Timeout
                | CollectorErrorKind::InternalError
                | CollectorErrorKind::BadGateway
                | CollectorErrorKind::ServiceUnavailable
                | CollectorErrorKind::RetryExhausted
                | CollectorErrorKind::Io
                | CollectorErrorKind::Unknown
        )
    }

    /// Returns true if this error must abort the whole run.
    pub fn is_fatal_global(&self) -> bool {
        matches!(
            self.kind,
            CollectorErrorKind::BadCredentials | CollectorErrorKind::MissingAuth
        )
    }

    /// Creates an error from an HTTP status code and GitHub error response.
    pub fn from_response(status: u16, message: String, request_id: Option<String>) -> Self {
        let kind = Self::kind_from_status(status);
        let mut error = Self::new(kind, message).with_status(status);
        if let Some(id) = request_id {
            error = error.with_request_id(id);
        }
        error
    }

    /// Maps HTTP status code to error kind.
    fn kind_from_status(status: u16) -> CollectorErrorKind {
        match status {
            400 => CollectorErrorKind::ValidationError,
            401 => CollectorErrorKind::BadCredentials,
            403 => CollectorErrorKind::Forbidden,
            404 => CollectorErrorKind::NotFound,
            409 => CollectorErrorKind::Conflict,
            410 => CollectorErrorKind::Gone,
            422 => CollectorErrorKind::UnprocessableEntity,
            429 => CollectorErrorKind::SecondaryRateLimitExceeded,
            500 => CollectorErrorKind::InternalError,
            502 => CollectorErrorKind::BadGateway,
            503 => CollectorErrorKind::ServiceUnavailable,
            _ => CollectorErrorKind::Unknown,
        }
    }

    // Convenience constructors

    /// Creates a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::new(CollectorErrorKind::InvalidConfiguration, message)
    }

    /// Creates a timeout error.
    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(CollectorErrorKind::Timeout, message)
    }

    /// Creates a GraphQL query error.
    pub fn query(message: impl Into<String>) -> Self {
        Self::new(CollectorErrorKind::QueryError, message)
    }

    /// Creates a retry-exhausted error.
    pub fn retry_exhausted(message: impl Into<String>) -> Self {
        Self::new(CollectorErrorKind::RetryExhausted, message)
    }

    /// Creates a corrupt-state error.
    pub fn corrupt_state(message: impl Into<String>) -> Self {
        Self::new(CollectorErrorKind::CorruptState, message)
    }
}

impl From<std::io::Error> for CollectorError {
    fn from(err: std::io::Error) -> Self {
        CollectorError::new(CollectorErrorKind::Io, format!("I/O error: {}", err)).with_cause(err)
    }
}

impl From<serde_json::Error> for CollectorError {
    fn from(err: serde_json::Error) -> Self {
        CollectorError::new(
            CollectorErrorKind::DeserializationError,
            format!("JSON error: {}", err),
        )
        .with_cause(err)
    }
}

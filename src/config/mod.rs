//! Configuration types for the collection engine.
//!
//! The engine never parses configuration text; it consumes an already-built
//! [`CollectorConfig`], produced either through [`CollectorConfigBuilder`] or by
//! deserializing it with `serde`.

use crate::auth::AuthMethod;
use crate::errors::{CollectorError, CollectorErrorKind};
use crate::types::{Phase, TargetMode};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::PathBuf;
use std::time::Duration;

/// Default GitHub API base URL.
pub const DEFAULT_BASE_URL: &str = "https://api.github.com";

/// Default GraphQL endpoint path, relative to the base URL.
pub const DEFAULT_GRAPHQL_PATH: &str = "/graphql";

/// Default GitHub API version (date-based).
pub const DEFAULT_API_VERSION: &str = "2022-11-28";

/// Default request timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Default connect timeout.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Default User-Agent header.
pub const DEFAULT_USER_AGENT: &str = concat!("integrations-github-collector/", env!("CARGO_PKG_VERSION"));

/// Default collection window length.
pub const DEFAULT_WINDOW_DAYS: i64 = 90;

/// Default output directory.
pub const DEFAULT_OUTPUT_DIR: &str = "collector-data";

/// Retry configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Maximum attempts for transient and server errors.
    pub max_attempts: u32,
    /// Initial backoff delay.
    pub initial_backoff: Duration,
    /// Maximum backoff delay.
    pub max_backoff: Duration,
    /// Backoff multiplier.
    pub multiplier: f64,
    /// Jitter factor (0.0 to 1.0).
    pub jitter: f64,
    /// Maximum throttled waits for one request before giving up.
    pub max_throttle_waits: u32,
    /// Floor applied to every server-dictated throttle wait.
    pub min_throttle_wait: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(60),
            multiplier: 2.0,
            jitter: 0.1,
            max_throttle_waits: 10,
            min_throttle_wait: Duration::from_secs(1),
        }
    }
}

/// Rate limit and concurrency tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Token bucket capacity.
    pub burst_capacity: u32,
    /// Token bucket refill rate, in requests per second.
    pub sustained_rate: f64,
    /// Request rate the secondary limit is measured against.
    pub max_requests_per_minute: u32,
    /// Fraction of `max_requests_per_minute` that counts as a violation.
    pub secondary_threshold: f64,
    /// Rolling window used for secondary limit detection.
    pub secondary_window: Duration,
    /// Delay at the 20% quota mark.
    pub min_sleep: Duration,
    /// Delay at quota exhaustion.
    pub max_sleep: Duration,
    /// Growth factor of the secondary backoff multiplier per violation.
    pub backoff_growth: f64,
    /// Cap on the secondary backoff multiplier.
    pub max_backoff_multiplier: f64,
    /// Maximum repositories processed concurrently within a phase.
    pub max_concurrent_repos: usize,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            burst_capacity: 20,
            sustained_rate: 10.0,
            max_requests_per_minute: 90,
            secondary_threshold: 0.8,
            secondary_window: Duration::from_secs(60),
            min_sleep: Duration::from_secs(1),
            max_sleep: Duration::from_secs(60),
            backoff_growth: 2.0,
            max_backoff_multiplier: 8.0,
            max_concurrent_repos: 4,
        }
    }
}

impl RateLimitConfig {
    /// Number of requests inside the window above which the secondary limit trips.
    pub fn secondary_limit(&self) -> f64 {
        self.max_requests_per_minute as f64 * self.secondary_threshold
    }
}

/// Connection pool configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Maximum idle connections per host.
    pub max_idle_per_host: usize,
    /// Idle connection timeout.
    pub idle_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_idle_per_host: 20,
            idle_timeout: Duration::from_secs(90),
        }
    }
}

/// Who is being collected.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TargetConfig {
    /// Organization or user login.
    pub login: String,
    /// Organization or individual account.
    pub mode: TargetMode,
    /// Explicit `owner/name` list; when non-empty, discovery is skipped.
    pub repositories: Vec<String>,
}

/// Fixed time window of the run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectionWindow {
    /// Inclusive lower bound.
    pub since: DateTime<Utc>,
    /// Inclusive upper bound.
    pub until: DateTime<Utc>,
}

impl Default for CollectionWindow {
    fn default() -> Self {
        let until = Utc::now();
        Self {
            since: until - ChronoDuration::days(DEFAULT_WINDOW_DAYS),
            until,
        }
    }
}

impl CollectionWindow {
    /// Returns true if the timestamp falls inside the window.
    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        at >= self.since && at <= self.until
    }
}

/// Per-phase enable flags. Discovery is governed by [`TargetConfig::repositories`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EndpointToggles {
    /// Repository metadata.
    pub repo_metadata: bool,
    /// Pull requests.
    pub pulls: bool,
    /// Issues.
    pub issues: bool,
    /// Reviews.
    pub reviews: bool,
    /// Issue and review comments.
    pub comments: bool,
    /// Commits.
    pub commits: bool,
    /// Branch protection.
    pub branch_protection: bool,
    /// Security features.
    pub security_features: bool,
}

impl Default for EndpointToggles {
    fn default() -> Self {
        Self {
            repo_metadata: true,
            pulls: true,
            issues: true,
            reviews: true,
            comments: true,
            commits: true,
            branch_protection: true,
            security_features: true,
        }
    }
}

/// Visibility accepted by discovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VisibilityFilter {
    /// Any visibility.
    #[default]
    All,
    /// Public repositories only.
    Public,
    /// Private and internal repositories only.
    Private,
}

/// Discovery filter settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// Keep forks.
    pub include_forks: bool,
    /// Keep archived repositories.
    pub include_archived: bool,
    /// Visibility to keep.
    pub visibility: VisibilityFilter,
    /// Require a push within this many days before the window end.
    pub active_within_days: Option<u32>,
    /// Minimum size in KB.
    pub min_size_kb: Option<u64>,
    /// Maximum size in KB.
    pub max_size_kb: Option<u64>,
    /// Primary languages to keep (case-insensitive, empty means any).
    pub languages_allow: Vec<String>,
    /// Primary languages to drop.
    pub languages_deny: Vec<String>,
    /// Topics of which at least one must be present (empty means any).
    pub topics_allow: Vec<String>,
    /// Topics that drop a repository.
    pub topics_deny: Vec<String>,
    /// Name regexes of which at least one must match (empty means any).
    pub name_include: Vec<String>,
    /// Name regexes that drop a repository.
    pub name_exclude: Vec<String>,
}

/// Output location and batching.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    /// Root directory for raw streams, checkpoint and manifest.
    pub output_dir: PathBuf,
    /// Records buffered before a stream is flushed.
    pub flush_every: usize,
    /// Page size requested from REST list endpoints.
    pub per_page: u32,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from(DEFAULT_OUTPUT_DIR),
            flush_every: 100,
            per_page: 100,
        }
    }
}

/// Resolved collector configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CollectorConfig {
    /// API base URL.
    pub base_url: String,
    /// GraphQL path relative to the base URL.
    pub graphql_path: String,
    /// API version header.
    pub api_version: String,
    /// Authentication method. Never serialized.
    #[serde(skip)]
    pub auth: Option<AuthMethod>,
    /// Request timeout.
    pub timeout: Duration,
    /// Connect timeout.
    pub connect_timeout: Duration,
    /// User-Agent header.
    pub user_agent: String,
    /// Retry configuration.
    pub retry: RetryConfig,
    /// Rate limit configuration.
    pub rate_limit: RateLimitConfig,
    /// Connection pool configuration.
    pub pool: PoolConfig,
    /// Collection target.
    pub target: TargetConfig,
    /// Collection window.
    pub window: CollectionWindow,
    /// Phase enable flags.
    pub endpoints: EndpointToggles,
    /// Discovery filters.
    pub discovery: DiscoveryConfig,
    /// Output settings.
    pub output: OutputConfig,
    /// Source-control revision of the tool, recorded in the manifest.
    pub source_revision: Option<String>,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            graphql_path: DEFAULT_GRAPHQL_PATH.to_string(),
            api_version: DEFAULT_API_VERSION.to_string(),
            auth: None,
            timeout: DEFAULT_TIMEOUT,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            user_agent: DEFAULT_USER_AGENT.to_string(),
            retry: RetryConfig::default(),
            rate_limit: RateLimitConfig::default(),
            pool: PoolConfig::default(),
            target: TargetConfig::default(),
            window: CollectionWindow::default(),
            endpoints: EndpointToggles::default(),
            discovery: DiscoveryConfig::default(),
            output: OutputConfig::default(),
            source_revision: None,
        }
    }
}

impl CollectorConfig {
    /// Creates a new configuration builder.
    pub fn builder() -> CollectorConfigBuilder {
        CollectorConfigBuilder::new()
    }

    /// Returns true if the phase should run under this configuration.
    pub fn is_phase_enabled(&self, phase: Phase) -> bool {
        let e = &self.endpoints;
        match phase {
            Phase::Discovery => self.target.repositories.is_empty(),
            Phase::RepoMetadata => e.repo_metadata,
            Phase::Pulls => e.pulls,
            Phase::Issues => e.issues,
            Phase::Reviews => e.reviews,
            Phase::Comments => e.comments,
            Phase::Commits => e.commits,
            Phase::BranchProtection => e.branch_protection,
            Phase::SecurityFeatures => e.security_features,
        }
    }

    /// SHA-256 of the serialized configuration, hex encoded.
    pub fn config_digest(&self) -> String {
        let bytes = serde_json::to_vec(self).unwrap_or_default();
        hex::encode(Sha256::digest(&bytes))
    }

    /// Validates the configuration.
    pub fn validate(&self) -> Result<(), CollectorError> {
        if self.base_url.is_empty() {
            return Err(CollectorError::new(
                CollectorErrorKind::InvalidBaseUrl,
                "Base URL cannot be empty",
            ));
        }

        if !self.base_url.starts_with("http://") && !self.base_url.starts_with("https://") {
            return Err(CollectorError::new(
                CollectorErrorKind::InvalidBaseUrl,
                "Base URL must start with http:// or https://",
            ));
        }

        if self.user_agent.is_empty() {
            return Err(CollectorError::configuration("User-Agent is required by GitHub API"));
        }

        if self.target.login.is_empty() && self.target.repositories.is_empty() {
            return Err(CollectorError::configuration(
                "A target login or an explicit repository list is required",
            ));
        }

        if let Some(bad) = self
            .target
            .repositories
            .iter()
            .find(|r| crate::types::RepoTarget::parse(r).is_none())
        {
            return Err(CollectorError::configuration(format!(
                "Repository '{}' is not in owner/name form",
                bad
            )));
        }

        if self.window.since > self.window.until {
            return Err(CollectorError::configuration(
                "Collection window 'since' must not be after 'until'",
            ));
        }

        let rl = &self.rate_limit;
        if rl.min_sleep > rl.max_sleep {
            return Err(CollectorError::configuration("min_sleep must not exceed max_sleep"));
        }
        if !(0.0..=1.0).contains(&rl.secondary_threshold) || rl.secondary_threshold == 0.0 {
            return Err(CollectorError::configuration(
                "secondary_threshold must be in (0, 1]",
            ));
        }
        if rl.backoff_growth < 1.0 || rl.max_backoff_multiplier < 1.0 {
            return Err(CollectorError::configuration(
                "backoff_growth and max_backoff_multiplier must be at least 1.0",
            ));
        }
        if rl.max_concurrent_repos == 0 {
            return Err(CollectorError::configuration("max_concurrent_repos must be positive"));
        }
        if rl.burst_capacity == 0 || rl.sustained_rate <= 0.0 {
            return Err(CollectorError::configuration(
                "burst_capacity and sustained_rate must be positive",
            ));
        }

        if self.retry.max_attempts == 0 {
            return Err(CollectorError::configuration("retry.max_attempts must be positive"));
        }

        if self.output.flush_every == 0 || self.output.per_page == 0 {
            return Err(CollectorError::configuration(
                "output.flush_every and output.per_page must be positive",
            ));
        }

        for pattern in self
            .discovery
            .name_include
            .iter()
            .chain(self.discovery.name_exclude.iter())
        {
            regex::Regex::new(pattern).map_err(|e| {
                CollectorError::configuration(format!("Invalid name pattern '{}': {}", pattern, e))
            })?;
        }

        Ok(())
    }
}

/// Builder for CollectorConfig.
#[derive(Debug, Default)]
pub struct CollectorConfigBuilder {
    config: CollectorConfig,
}

impl CollectorConfigBuilder {
    /// Creates a new builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the base URL.
    pub fn base_url(mut self, url: impl Into<String>) -> Self {
        self.config.base_url = url.into();
        self
    }

    /// Sets the GraphQL path.
    pub fn graphql_path(mut self, path: impl Into<String>) -> Self {
        self.config.graphql_path = path.into();
        self
    }

    /// Sets the API version.
    pub fn api_version(mut self, version: impl Into<String>) -> Self {
        self.config.api_version = version.into();
        self
    }

    /// Sets the authentication method.
    pub fn auth(mut self, auth: AuthMethod) -> Self {
        self.config.auth = Some(auth);
        self
    }

    /// Sets a personal access token.
    pub fn pat(self, token: impl Into<String>) -> Self {
        self.auth(AuthMethod::pat(token))
    }

    /// Sets the request timeout.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.config.timeout = timeout;
        self
    }

    /// Sets the connect timeout.
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.connect_timeout = timeout;
        self
    }

    /// Sets the User-Agent header.
    pub fn user_agent(mut self, ua: impl Into<String>) -> Self {
        self.config.user_agent = ua.into();
        self
    }

    /// Sets the retry configuration.
    pub fn retry(mut self, config: RetryConfig) -> Self {
        self.config.retry = config;
        self
    }

    /// Sets the rate limit configuration.
    pub fn rate_limit(mut self, config: RateLimitConfig) -> Self {
        self.config.rate_limit = config;
        self
    }

    /// Sets the connection pool configuration.
    pub fn pool(mut self, config: PoolConfig) -> Self {
        self.config.pool = config;
        self
    }

    /// Targets an organization.
    pub fn organization(mut self, login: impl Into<String>) -> Self {
        self.config.target.login = login.into();
        self.config.target.mode = TargetMode::Organization;
        self
    }

    /// Targets an individual account.
    pub fn user(mut self, login: impl Into<String>) -> Self {
        self.config.target.login = login.into();
        self.config.target.mode = TargetMode::User;
        self
    }

    /// Collects an explicit repository list instead of running discovery.
    pub fn repositories<I, S>(mut self, repos: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config.target.repositories = repos.into_iter().map(Into::into).collect();
        self
    }

    /// Sets the collection window.
    pub fn window(mut self, since: DateTime<Utc>, until: DateTime<Utc>) -> Self {
        self.config.window = CollectionWindow { since, until };
        self
    }

    /// Sets the phase enable flags.
    pub fn endpoints(mut self, toggles: EndpointToggles) -> Self {
        self.config.endpoints = toggles;
        self
    }

    /// Sets the discovery filters.
    pub fn discovery(mut self, config: DiscoveryConfig) -> Self {
        self.config.discovery = config;
        self
    }

    /// Sets the output directory.
    pub fn output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.output.output_dir = dir.into();
        self
    }

    /// Sets the output configuration.
    pub fn output(mut self, config: OutputConfig) -> Self {
        self.config.output = config;
        self
    }

    /// Sets the source-control revision recorded in the manifest.
    pub fn source_revision(mut self, rev: impl Into<String>) -> Self {
        self.config.source_revision = Some(rev.into());
        self
    }

    /// Builds the configuration.
    pub fn build(self) -> Result<CollectorConfig, CollectorError> {
        self.config.validate()?;
        Ok(self.config)
    }
}

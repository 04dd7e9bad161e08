//! Collectors: one per endpoint kind.
//!
//! A collector runs one unit of work for one repository: it opens the unit's
//! stream (discarding earlier partial output), pages through the endpoint,
//! keeps what falls inside the collection window and reports what it wrote.
//! Checkpointing is the orchestrator's job.

mod activity;
mod conversation;
mod discovery;
mod repository;

pub use activity::{CommitsCollector, IssuesCollector, PullsCollector};
pub use conversation::{IssueCommentsCollector, ReviewCommentsCollector, ReviewsCollector};
pub use discovery::{DiscoveryCollector, DiscoveryOutcome};
pub use repository::{BranchProtectionCollector, RepoMetadataCollector, SecurityFeaturesCollector};

use crate::client::{ApiResponse, GitHubClient};
use crate::config::CollectionWindow;
use crate::errors::CollectorResult;
use crate::pagination::Page;
use crate::storage::{RawStore, RecordWriter};
use crate::types::{EndpointKind, RepoTarget, Surface};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// Shared resources handed to every collector.
#[derive(Clone)]
pub struct CollectContext {
    /// Transport shared by the whole run.
    pub client: Arc<GitHubClient>,
    /// Output location.
    pub store: RawStore,
    /// Collection window.
    pub window: CollectionWindow,
    /// Records buffered per stream before a flush.
    pub flush_every: usize,
}

impl CollectContext {
    /// Creates a context from the client's configuration.
    pub fn new(client: Arc<GitHubClient>, store: RawStore) -> Self {
        let window = client.config().window.clone();
        let flush_every = client.config().output.flush_every;
        Self {
            client,
            store,
            window,
            flush_every,
        }
    }

    /// Opens (and truncates) the stream of a unit.
    pub async fn writer(&self, owner: &str, endpoint: EndpointKind) -> CollectorResult<RecordWriter> {
        self.store.open_writer(owner, endpoint, self.flush_every).await
    }

    /// Window lower bound formatted for `since` parameters.
    pub fn since_param(&self) -> String {
        self.window.since.to_rfc3339_opts(SecondsFormat::Secs, true)
    }

    /// Window upper bound formatted for `until` parameters.
    pub fn until_param(&self) -> String {
        self.window.until.to_rfc3339_opts(SecondsFormat::Secs, true)
    }
}

/// `/repos/{owner}/{name}{suffix}`.
pub fn repo_path(repo: &RepoTarget, suffix: &str) -> String {
    format!("/repos/{}/{}{}", repo.owner, repo.name, suffix)
}

/// Parses an RFC 3339 timestamp field of a raw item.
pub fn timestamp(item: &Value, field: &str) -> Option<DateTime<Utc>> {
    item.get(field)
        .and_then(Value::as_str)
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|at| at.with_timezone(&Utc))
}

/// Wraps a single-object response as page 1.
pub(crate) fn single_page(response: &ApiResponse, surface: Surface, item: Value) -> Page {
    Page {
        items: vec![item],
        number: 1,
        surface,
        correlation_id: response.correlation_id.clone(),
    }
}

/// What one unit produced.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UnitReport {
    /// Records persisted.
    pub records: u64,
    /// Pages fetched.
    pub pages: u32,
    /// The resource was absent; the unit is complete with no data.
    pub absent: bool,
}

impl UnitReport {
    /// A unit whose resource does not exist.
    pub fn absent() -> Self {
        Self {
            absent: true,
            ..Self::default()
        }
    }
}

/// Collects one endpoint kind for one repository.
#[async_trait]
pub trait UnitCollector: Send + Sync {
    /// Endpoint kind this collector owns.
    fn endpoint(&self) -> EndpointKind;

    /// Runs the unit from scratch.
    async fn collect(&self, ctx: &CollectContext, repo: &RepoTarget) -> CollectorResult<UnitReport>;
}

/// Per-repository collectors by endpoint kind.
#[derive(Clone)]
pub struct CollectorRegistry {
    collectors: HashMap<EndpointKind, Arc<dyn UnitCollector>>,
}

impl CollectorRegistry {
    /// An empty registry.
    pub fn empty() -> Self {
        Self {
            collectors: HashMap::new(),
        }
    }

    /// The collectors for every per-repository endpoint kind.
    pub fn standard() -> Self {
        let mut registry = Self::empty();
        registry.register(Arc::new(RepoMetadataCollector));
        registry.register(Arc::new(PullsCollector));
        registry.register(Arc::new(IssuesCollector));
        registry.register(Arc::new(ReviewsCollector));
        registry.register(Arc::new(IssueCommentsCollector));
        registry.register(Arc::new(ReviewCommentsCollector));
        registry.register(Arc::new(CommitsCollector));
        registry.register(Arc::new(BranchProtectionCollector));
        registry.register(Arc::new(SecurityFeaturesCollector));
        registry
    }

    /// Adds or replaces a collector.
    pub fn register(&mut self, collector: Arc<dyn UnitCollector>) {
        self.collectors.insert(collector.endpoint(), collector);
    }

    /// Collector for an endpoint kind.
    pub fn get(&self, endpoint: EndpointKind) -> Option<Arc<dyn UnitCollector>> {
        self.collectors.get(&endpoint).cloned()
    }
}

impl Default for CollectorRegistry {
    fn default() -> Self {
        Self::standard()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_standard_registry_covers_repository_endpoints() {
        let registry = CollectorRegistry::standard();
        for kind in EndpointKind::ALL {
            let collector = registry.get(kind);
            if kind == EndpointKind::Discovery {
                assert!(collector.is_none());
            } else {
                assert_eq!(collector.map(|c| c.endpoint()), Some(kind));
            }
        }
    }

    #[test]
    fn test_timestamp() {
        let item = json!({"updated_at": "2024-03-01T12:00:00Z", "bad": "yesterday"});
        assert_eq!(
            timestamp(&item, "updated_at").map(|t| t.to_rfc3339()),
            Some("2024-03-01T12:00:00+00:00".to_string())
        );
        assert!(timestamp(&item, "bad").is_none());
        assert!(timestamp(&item, "missing").is_none());
    }

    #[test]
    fn test_repo_path() {
        let repo = RepoTarget::new("acme", "widgets");
        assert_eq!(repo_path(&repo, "/pulls"), "/repos/acme/widgets/pulls");
    }
}

//! Run manifest: the summary document downstream stages read first.

use super::{atomic_write, RawStore};
use crate::config::CollectorConfig;
use crate::discovery::FilterStats;
use crate::errors::{CollectorError, CollectorErrorKind, CollectorResult};
use crate::observability::EndpointMetrics;
use crate::types::EndpointKind;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Counters of one endpoint kind across every run of a collection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EndpointCounters {
    /// Records persisted.
    pub records: u64,
    /// Requests sent.
    pub requests: u64,
    /// Pages fetched.
    pub pages: u64,
    /// Requests that failed for good.
    pub failures: u64,
    /// Retries after transient failures.
    pub retries: u64,
    /// Waits on throttled responses.
    pub throttle_waits: u64,
}

impl EndpointCounters {
    /// Adds a metrics snapshot to these counters.
    pub fn add(&mut self, metrics: &EndpointMetrics) {
        self.records += metrics.records;
        self.requests += metrics.requests;
        self.pages += metrics.pages;
        self.failures += metrics.failures;
        self.retries += metrics.retries;
        self.throttle_waits += metrics.throttle_waits;
    }
}

/// Run manifest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunManifest {
    /// Run id; kept across resumed runs.
    pub run_id: String,
    /// Version of this crate.
    pub tool_version: String,
    /// Source-control revision, when the caller supplied one.
    #[serde(default)]
    pub source_revision: Option<String>,
    /// SHA-256 of the configuration.
    pub config_digest: String,
    /// Target login (empty for an explicit repository list).
    pub target: String,
    /// Window lower bound.
    pub window_since: DateTime<Utc>,
    /// Window upper bound.
    pub window_until: DateTime<Utc>,
    /// Start of the first run.
    pub started_at: DateTime<Utc>,
    /// End of the last run, if one finished.
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
    /// Repositories selected for collection.
    #[serde(default)]
    pub repositories: Vec<String>,
    /// Per-endpoint counters.
    #[serde(default)]
    pub endpoints: BTreeMap<EndpointKind, EndpointCounters>,
    /// Discovery filter statistics.
    #[serde(default)]
    pub filter_stats: FilterStats,
}

impl RunManifest {
    /// Starts a manifest for a new run.
    pub fn new(config: &CollectorConfig, run_id: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            tool_version: env!("CARGO_PKG_VERSION").to_string(),
            source_revision: config.source_revision.clone(),
            config_digest: config.config_digest(),
            target: config.target.login.clone(),
            window_since: config.window.since,
            window_until: config.window.until,
            started_at: Utc::now(),
            finished_at: None,
            repositories: Vec::new(),
            endpoints: BTreeMap::new(),
            filter_stats: FilterStats::default(),
        }
    }

    /// Continues a previous run's manifest: keeps its identity and start time,
    /// and refreshes everything derived from the current configuration.
    pub fn resume(previous: RunManifest, config: &CollectorConfig) -> Self {
        Self {
            tool_version: env!("CARGO_PKG_VERSION").to_string(),
            source_revision: config.source_revision.clone(),
            config_digest: config.config_digest(),
            finished_at: None,
            ..previous
        }
    }

    /// Counters of `baseline` plus `current`.
    pub fn combine_counters(
        baseline: &BTreeMap<EndpointKind, EndpointCounters>,
        current: &[EndpointMetrics],
    ) -> BTreeMap<EndpointKind, EndpointCounters> {
        let mut combined = baseline.clone();
        for metrics in current {
            combined.entry(metrics.endpoint).or_default().add(metrics);
        }
        combined.retain(|_, c| *c != EndpointCounters::default());
        combined
    }
}

impl RawStore {
    /// Writes the manifest atomically.
    pub async fn write_manifest(&self, manifest: &RunManifest) -> CollectorResult<()> {
        let bytes = serde_json::to_vec_pretty(manifest)?;
        let path = self.manifest_path();
        tokio::task::spawn_blocking(move || atomic_write(&path, &bytes))
            .await
            .map_err(|e| {
                CollectorError::new(
                    CollectorErrorKind::Io,
                    format!("Manifest write task failed: {}", e),
                )
            })?
    }

    /// Reads the manifest of a previous run, if any.
    pub async fn read_manifest(&self) -> CollectorResult<Option<RunManifest>> {
        let path = self.manifest_path();
        match tokio::fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice(&bytes).map(Some).map_err(|e| {
                CollectorError::corrupt_state(format!("Manifest {} is unreadable: {}", path.display(), e))
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

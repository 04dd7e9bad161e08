//! Phase orchestration.
//!
//! Phases run in [`Phase::ORDER`]. Within a phase, repositories run
//! concurrently up to `rate_limit.max_concurrent_repos`; the units of one
//! repository run one after another. A phase is checkpointed only when every
//! one of its units is complete or failed for good.

use crate::checkpoint::{CheckpointStore, UnitStatus};
use crate::client::GitHubClient;
use crate::collectors::{CollectContext, CollectorRegistry, DiscoveryCollector, UnitCollector};
use crate::errors::{CollectorError, CollectorErrorKind, CollectorResult};
use crate::observability::TracingHooks;
use crate::storage::{RawStore, RunManifest};
use crate::types::{EndpointKind, Phase, RepoTarget};
use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};

/// How a phase ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseStatus {
    /// Ran and every unit settled; checkpointed.
    Completed,
    /// Checkpointed by an earlier run; nothing was done.
    AlreadyComplete,
    /// Turned off by configuration.
    Disabled,
    /// Some units still need work; a later run will re-enter the phase.
    Incomplete,
}

impl PhaseStatus {
    /// Stable name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::AlreadyComplete => "already_complete",
            Self::Disabled => "disabled",
            Self::Incomplete => "incomplete",
        }
    }
}

impl fmt::Display for PhaseStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Statistics of one phase.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PhaseReport {
    /// Phase.
    pub phase: Phase,
    /// Final status.
    pub status: PhaseStatus,
    /// Units that ran and produced data.
    pub processed: usize,
    /// Units that ran and found the resource absent.
    pub skipped: usize,
    /// Units left alone because an earlier run settled them.
    pub already_complete: usize,
    /// Units that failed in this run.
    pub errored: usize,
    /// Units re-run after a retryable failure in an earlier run.
    pub resumed: usize,
    /// Units held back because their inputs are not settled yet.
    pub deferred: usize,
    /// Records written.
    pub records: u64,
}

impl PhaseReport {
    fn new(phase: Phase, status: PhaseStatus) -> Self {
        Self {
            phase,
            status,
            processed: 0,
            skipped: 0,
            already_complete: 0,
            errored: 0,
            resumed: 0,
            deferred: 0,
            records: 0,
        }
    }

    fn absorb(&mut self, result: &UnitResult) {
        match result {
            UnitResult::AlreadySettled => self.already_complete += 1,
            UnitResult::Deferred => self.deferred += 1,
            UnitResult::Processed { records, resumed } => {
                self.processed += 1;
                self.records += records;
                self.resumed += usize::from(*resumed);
            }
            UnitResult::Absent { resumed } => {
                self.skipped += 1;
                self.resumed += usize::from(*resumed);
            }
            UnitResult::Failed { resumed } => {
                self.errored += 1;
                self.resumed += usize::from(*resumed);
            }
        }
    }
}

/// Summary of one run.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    /// Run id shared with the manifest.
    pub run_id: String,
    /// Start of this process's run.
    pub started_at: DateTime<Utc>,
    /// End of this process's run.
    pub finished_at: DateTime<Utc>,
    /// Repositories targeted.
    pub repositories: usize,
    /// One report per phase, in execution order.
    pub phases: Vec<PhaseReport>,
}

impl RunSummary {
    /// Units that failed in this run.
    pub fn errored(&self) -> usize {
        self.phases.iter().map(|p| p.errored).sum()
    }

    /// Returns true if every phase is checkpointed (or disabled).
    pub fn is_complete(&self) -> bool {
        self.phases.iter().all(|p| p.status != PhaseStatus::Incomplete)
    }

    /// Report of one phase.
    pub fn phase(&self, phase: Phase) -> Option<&PhaseReport> {
        self.phases.iter().find(|p| p.phase == phase)
    }
}

/// Outcome of one unit as seen by the orchestrator.
#[derive(Debug, Clone, PartialEq, Eq)]
enum UnitResult {
    AlreadySettled,
    Deferred,
    Processed { records: u64, resumed: bool },
    Absent { resumed: bool },
    Failed { resumed: bool },
}

/// Drives a collection run.
pub struct Orchestrator {
    client: Arc<GitHubClient>,
    store: RawStore,
    checkpoint: Arc<CheckpointStore>,
    registry: CollectorRegistry,
}

impl Orchestrator {
    /// Creates an orchestrator writing under the client's configured output directory.
    pub async fn new(client: GitHubClient) -> CollectorResult<Self> {
        let store = RawStore::new(client.config().output.output_dir.clone());
        let checkpoint = CheckpointStore::open(store.checkpoint_path()).await?;
        Ok(Self {
            client: Arc::new(client),
            store,
            checkpoint: Arc::new(checkpoint),
            registry: CollectorRegistry::standard(),
        })
    }

    /// Replaces the collector registry.
    pub fn with_registry(mut self, registry: CollectorRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// The checkpoint store.
    pub fn checkpoint(&self) -> &Arc<CheckpointStore> {
        &self.checkpoint
    }

    /// The raw output store.
    pub fn store(&self) -> &RawStore {
        &self.store
    }

    /// The shared client.
    pub fn client(&self) -> &Arc<GitHubClient> {
        &self.client
    }

    /// Runs every phase.
    ///
    /// Only authentication failures are returned as errors (and local
    /// checkpoint write failures, which make resuming impossible). Everything
    /// else ends up in the summary.
    pub async fn run(&self) -> CollectorResult<RunSummary> {
        let started_at = Utc::now();
        let config = self.client.config();

        match self.client.verify_authentication().await {
            Ok(()) => {}
            Err(e) if e.is_fatal_global() => {
                error!(error = %e, "Authentication failed, aborting run");
                return Err(e);
            }
            Err(e) => warn!(error = %e, "Authentication pre-flight inconclusive, continuing"),
        }

        let (mut manifest, baseline) = match self.store.read_manifest().await? {
            Some(previous) => {
                let baseline = previous.endpoints.clone();
                info!(run_id = %previous.run_id, "Resuming previous run");
                (RunManifest::resume(previous, config), baseline)
            }
            None => (
                RunManifest::new(config, uuid::Uuid::new_v4().to_string()),
                BTreeMap::new(),
            ),
        };

        let ctx = CollectContext::new(self.client.clone(), self.store.clone());
        let mut phases = Vec::with_capacity(Phase::ORDER.len());

        let (discovery_report, targets) = self.resolve_targets(&ctx, &mut manifest).await?;
        phases.push(discovery_report);

        match &targets {
            Some(targets) => {
                manifest.repositories = targets.iter().map(RepoTarget::full_name).collect();
                self.store.write_manifest(&manifest).await?;

                for phase in Phase::ORDER.iter().skip(1).copied() {
                    phases.push(self.run_phase(phase, &ctx, targets).await?);
                }
            }
            None => {
                warn!("Target list unavailable, later phases deferred to the next run");
                for phase in Phase::ORDER.iter().skip(1).copied() {
                    phases.push(PhaseReport::new(phase, PhaseStatus::Incomplete));
                }
            }
        }

        self.checkpoint.compact().await?;

        let finished_at = Utc::now();
        manifest.finished_at = Some(finished_at);
        manifest.endpoints =
            RunManifest::combine_counters(&baseline, &self.client.metrics().snapshot().endpoints);
        self.store.write_manifest(&manifest).await?;

        let summary = RunSummary {
            run_id: manifest.run_id.clone(),
            started_at,
            finished_at,
            repositories: manifest.repositories.len(),
            phases,
        };
        let metrics = self.client.metrics().snapshot();
        info!(
            run_id = %summary.run_id,
            repositories = summary.repositories,
            errored = summary.errored(),
            complete = summary.is_complete(),
            requests = metrics.requests_total,
            retried = metrics.requests_retried,
            throttled = metrics.requests_throttled,
            "Run finished"
        );
        Ok(summary)
    }

    /// Runs (or skips) discovery and returns the target list, if one is known.
    async fn resolve_targets(
        &self,
        ctx: &CollectContext,
        manifest: &mut RunManifest,
    ) -> CollectorResult<(PhaseReport, Option<Vec<RepoTarget>>)> {
        let config = self.client.config();
        let phase = Phase::Discovery;

        if !config.is_phase_enabled(phase) {
            let targets = config
                .target
                .repositories
                .iter()
                .filter_map(|name| RepoTarget::parse(name))
                .collect::<Vec<_>>();
            self.checkpoint.mark_phase_complete(phase).await?;
            TracingHooks::on_phase_finished(phase, PhaseStatus::Disabled.as_str(), 0, 0, 0);
            return Ok((PhaseReport::new(phase, PhaseStatus::Disabled), Some(dedup(targets))));
        }

        let login = config.target.login.clone();
        if self.checkpoint.is_phase_complete(phase).await {
            let targets = self.store.read_repo_targets(&login).await?;
            info!(target = %login, repositories = targets.len(), "Reusing discovered repositories");
            let mut report = PhaseReport::new(phase, PhaseStatus::AlreadyComplete);
            report.already_complete = 1;
            return Ok((report, Some(dedup(targets))));
        }

        TracingHooks::on_phase_start(phase, 1);
        let resumed = matches!(
            self.checkpoint.unit_status(&login, EndpointKind::Discovery).await,
            UnitStatus::Failed { .. }
        );
        let mut report = PhaseReport::new(phase, PhaseStatus::Incomplete);

        self.checkpoint.mark_in_progress(&login, EndpointKind::Discovery).await?;
        TracingHooks::on_unit_start(&login, EndpointKind::Discovery, resumed);
        let result = match DiscoveryCollector::from_config(config) {
            Ok(collector) => collector.discover(ctx, &config.target).await,
            Err(e) => Err(e),
        };

        let targets = match result {
            Ok(outcome) => {
                self.checkpoint.mark_complete(&login, EndpointKind::Discovery).await?;
                self.client
                    .metrics()
                    .record_records(EndpointKind::Discovery, outcome.report.records);
                TracingHooks::on_unit_complete(
                    &login,
                    EndpointKind::Discovery,
                    outcome.report.records,
                    outcome.report.absent,
                );
                report.absorb(&if outcome.report.absent {
                    UnitResult::Absent { resumed }
                } else {
                    UnitResult::Processed {
                        records: outcome.report.records,
                        resumed,
                    }
                });
                manifest.filter_stats = outcome.stats;
                self.checkpoint.mark_phase_complete(phase).await?;
                report.status = PhaseStatus::Completed;
                Some(dedup(outcome.repositories))
            }
            Err(e) => {
                record_failure(&self.checkpoint, &self.store, &login, EndpointKind::Discovery, &e).await?;
                if e.is_fatal_global() {
                    return Err(e);
                }
                report.absorb(&UnitResult::Failed { resumed });
                None
            }
        };

        TracingHooks::on_phase_finished(
            phase,
            report.status.as_str(),
            report.processed,
            report.skipped,
            report.errored,
        );
        Ok((report, targets))
    }

    /// Runs one per-repository phase.
    async fn run_phase(&self, phase: Phase, ctx: &CollectContext, targets: &[RepoTarget]) -> CollectorResult<PhaseReport> {
        let config = self.client.config();

        if !config.is_phase_enabled(phase) {
            self.checkpoint.mark_phase_complete(phase).await?;
            TracingHooks::on_phase_finished(phase, PhaseStatus::Disabled.as_str(), 0, 0, 0);
            return Ok(PhaseReport::new(phase, PhaseStatus::Disabled));
        }
        if self.checkpoint.is_phase_complete(phase).await {
            TracingHooks::on_phase_finished(phase, PhaseStatus::AlreadyComplete.as_str(), 0, 0, 0);
            return Ok(PhaseReport::new(phase, PhaseStatus::AlreadyComplete));
        }

        let collectors = phase
            .endpoints()
            .iter()
            .map(|kind| -> CollectorResult<(Arc<dyn UnitCollector>, Vec<EndpointKind>)> {
                let collector = self.registry.get(*kind).ok_or_else(|| {
                    CollectorError::configuration(format!("No collector registered for {}", kind))
                })?;
                let inputs = kind
                    .inputs()
                    .iter()
                    .copied()
                    .filter(|input| config.is_phase_enabled(input.phase()))
                    .collect();
                Ok((collector, inputs))
            })
            .collect::<CollectorResult<Vec<_>>>()?;

        TracingHooks::on_phase_start(phase, targets.len());
        let semaphore = Arc::new(Semaphore::new(config.rate_limit.max_concurrent_repos));
        let done = Arc::new(AtomicUsize::new(0));
        let total = targets.len();

        let mut handles = Vec::with_capacity(total);
        for repo in targets.iter().cloned() {
            let semaphore = Arc::clone(&semaphore);
            let done = Arc::clone(&done);
            let checkpoint = Arc::clone(&self.checkpoint);
            let collectors = collectors.clone();
            let ctx = ctx.clone();

            handles.push(tokio::spawn(async move {
                let _permit = semaphore.acquire_owned().await.map_err(|_| {
                    CollectorError::new(CollectorErrorKind::Unknown, "Semaphore closed unexpectedly")
                })?;

                let mut results = Vec::with_capacity(collectors.len());
                for (collector, inputs) in &collectors {
                    results.push(run_unit(&ctx, &checkpoint, collector.as_ref(), inputs, &repo).await?);
                }

                let finished = done.fetch_add(1, Ordering::Relaxed) + 1;
                TracingHooks::on_phase_progress(phase, finished, total);
                for snapshot in ctx.client.throttle().snapshots() {
                    TracingHooks::on_throttle_snapshot(&snapshot);
                }
                Ok::<_, CollectorError>(results)
            }));
        }

        let mut report = PhaseReport::new(phase, PhaseStatus::Incomplete);
        let mut abort: Option<CollectorError> = None;
        for joined in join_all(handles).await {
            match joined {
                Ok(Ok(results)) => results.iter().for_each(|r| report.absorb(r)),
                Ok(Err(e)) => {
                    if abort.is_none() {
                        abort = Some(e);
                    }
                }
                Err(e) => {
                    error!(phase = %phase, error = %e, "Repository task panicked");
                    report.errored += 1;
                }
            }
        }
        if let Some(e) = abort {
            return Err(e);
        }

        let repos: Vec<String> = targets.iter().map(RepoTarget::full_name).collect();
        if self.checkpoint.units_settled(phase.endpoints(), &repos).await {
            self.checkpoint.mark_phase_complete(phase).await?;
            report.status = PhaseStatus::Completed;
        }

        TracingHooks::on_phase_finished(
            phase,
            report.status.as_str(),
            report.processed,
            report.skipped,
            report.errored,
        );
        Ok(report)
    }
}

/// Records a failed unit and drops whatever partial stream it wrote.
///
/// Errors that stop the run put the unit back to `not_started` instead.
async fn record_failure(
    checkpoint: &CheckpointStore,
    store: &RawStore,
    key: &str,
    endpoint: EndpointKind,
    e: &CollectorError,
) -> CollectorResult<()> {
    let retryable = e.is_retryable();
    TracingHooks::on_unit_failed(key, endpoint, &e.to_string(), retryable);
    store.discard(key, endpoint).await?;
    if e.is_fatal_global() {
        checkpoint.reset_unit(key, endpoint).await
    } else {
        checkpoint
            .mark_failed(key, endpoint, e.to_string(), retryable)
            .await
    }
}

/// Runs one unit unless the checkpoint says it is settled.
///
/// A unit whose input units (same repository) are not settled yet is left
/// untouched so the phase stays open. Returns `Err` only for errors that must
/// stop the run.
async fn run_unit(
    ctx: &CollectContext,
    checkpoint: &CheckpointStore,
    collector: &dyn UnitCollector,
    inputs: &[EndpointKind],
    repo: &RepoTarget,
) -> CollectorResult<UnitResult> {
    let key = repo.full_name();
    let endpoint = collector.endpoint();

    let status = checkpoint.unit_status(&key, endpoint).await;
    if status.is_settled() {
        return Ok(UnitResult::AlreadySettled);
    }
    for input in inputs {
        if !checkpoint.unit_status(&key, *input).await.is_settled() {
            debug!(repository = %key, endpoint = %endpoint, input = %input, "Inputs not settled, deferring unit");
            return Ok(UnitResult::Deferred);
        }
    }
    let resumed = matches!(status, UnitStatus::Failed { .. });

    checkpoint.mark_in_progress(&key, endpoint).await?;
    TracingHooks::on_unit_start(&key, endpoint, resumed);

    match collector.collect(ctx, repo).await {
        Ok(report) => {
            checkpoint.mark_complete(&key, endpoint).await?;
            ctx.client.metrics().record_records(endpoint, report.records);
            TracingHooks::on_unit_complete(&key, endpoint, report.records, report.absent);
            Ok(if report.absent {
                UnitResult::Absent { resumed }
            } else {
                UnitResult::Processed {
                    records: report.records,
                    resumed,
                }
            })
        }
        Err(e) => {
            record_failure(checkpoint, &ctx.store, &key, endpoint, &e).await?;
            if e.is_fatal_global() {
                return Err(e);
            }
            Ok(UnitResult::Failed { resumed })
        }
    }
}

/// Drops repeated repositories, keeping the first occurrence.
fn dedup(targets: Vec<RepoTarget>) -> Vec<RepoTarget> {
    let mut seen = HashSet::new();
    targets
        .into_iter()
        .filter(|t| seen.insert(t.full_name()))
        .collect()
}

//! Repository discovery for the target login.

use super::{CollectContext, UnitReport};
use crate::config::{CollectorConfig, TargetConfig};
use crate::discovery::{FilterChain, FilterStats};
use crate::errors::CollectorResult;
use crate::pagination::PageStream;
use crate::types::{EndpointKind, RepoSummary, RepoTarget, TargetMode};
use tracing::{debug, info, warn};

/// Result of a discovery unit.
#[derive(Debug, Clone, Default)]
pub struct DiscoveryOutcome {
    /// Repositories accepted by the filter chain, in listing order.
    pub repositories: Vec<RepoTarget>,
    /// Filter statistics.
    pub stats: FilterStats,
    /// Unit report.
    pub report: UnitReport,
}

/// Lists the target's repositories and keeps those the filter chain accepts.
///
/// Only accepted repositories are persisted, so a later run can rebuild the
/// target list from the stream alone.
pub struct DiscoveryCollector {
    chain: FilterChain,
}

impl DiscoveryCollector {
    /// Creates a collector with an explicit chain.
    pub fn new(chain: FilterChain) -> Self {
        Self { chain }
    }

    /// Creates a collector with the configured chain.
    pub fn from_config(config: &CollectorConfig) -> CollectorResult<Self> {
        Ok(Self::new(FilterChain::from_config(&config.discovery, config.window.until)?))
    }

    /// Listing path for a target.
    pub fn listing_path(target: &TargetConfig) -> String {
        match target.mode {
            TargetMode::Organization => format!("/orgs/{}/repos", target.login),
            TargetMode::User => format!("/users/{}/repos", target.login),
        }
    }

    /// Runs discovery.
    pub async fn discover(&self, ctx: &CollectContext, target: &TargetConfig) -> CollectorResult<DiscoveryOutcome> {
        let path = Self::listing_path(target);
        let listing_type = match target.mode {
            TargetMode::Organization => "all",
            TargetMode::User => "owner",
        };
        let mut stream = PageStream::rest(&ctx.client, path.clone(), EndpointKind::Discovery)
            .with_query("type", listing_type)
            .with_query("sort", "full_name");
        let mut writer = ctx.writer(&target.login, EndpointKind::Discovery).await?;

        let mut outcome = DiscoveryOutcome::default();
        while let Some(page) = stream.next_page().await? {
            let mut kept = Vec::new();
            for item in &page.items {
                let repo: RepoSummary = match serde_json::from_value(item.clone()) {
                    Ok(repo) => repo,
                    Err(e) => {
                        warn!(error = %e, "Skipping unreadable repository listing entry");
                        continue;
                    }
                };
                let verdict = self.chain.evaluate(&repo);
                outcome.stats.record(&verdict);
                match verdict {
                    Ok(()) => {
                        outcome.repositories.push(RepoTarget::from(&repo));
                        kept.push(item);
                    }
                    Err(rejection) => {
                        debug!(repository = %repo.full_name, rejected_by = %rejection, "Repository filtered out");
                    }
                }
            }
            writer.append_items(&path, &page, kept).await?;
        }

        outcome.report = UnitReport {
            records: writer.finish().await?,
            pages: stream.pages_fetched(),
            absent: stream.was_absent(),
        };
        info!(
            target = %target.login,
            evaluated = outcome.stats.evaluated,
            accepted = outcome.stats.accepted,
            rejected = outcome.stats.rejected(),
            "Discovery finished"
        );
        Ok(outcome)
    }
}

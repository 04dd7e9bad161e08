//! Pull requests, issues and commits.

use super::{repo_path, timestamp, CollectContext, UnitCollector, UnitReport};
use crate::errors::CollectorResult;
use crate::pagination::PageStream;
use crate::types::{EndpointKind, RepoTarget};
use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use tracing::debug;

/// Parameters for listing pull requests.
#[derive(Debug, Clone, Serialize)]
pub struct ListPullsParams {
    /// State filter.
    pub state: &'static str,
    /// Sort field.
    pub sort: &'static str,
    /// Sort direction.
    pub direction: &'static str,
}

impl Default for ListPullsParams {
    fn default() -> Self {
        Self {
            state: "all",
            sort: "updated",
            direction: "desc",
        }
    }
}

/// Parameters for listing issues.
#[derive(Debug, Clone, Serialize)]
pub struct ListIssuesParams {
    /// State filter.
    pub state: &'static str,
    /// Sort field.
    pub sort: &'static str,
    /// Sort direction.
    pub direction: &'static str,
    /// Only issues updated at or after this time.
    pub since: String,
}

/// Parameters for listing commits.
#[derive(Debug, Clone, Serialize)]
pub struct ListCommitsParams {
    /// Branch to walk; the default branch when absent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sha: Option<String>,
    /// Lower bound.
    pub since: String,
    /// Upper bound.
    pub until: String,
}

/// Where an item sits relative to the window, judged by one timestamp field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WindowPosition {
    Before,
    Inside,
    After,
}

fn position(ctx: &CollectContext, item: &Value, field: &str) -> WindowPosition {
    match timestamp(item, field) {
        Some(at) if at < ctx.window.since => WindowPosition::Before,
        Some(at) if at > ctx.window.until => WindowPosition::After,
        _ => WindowPosition::Inside,
    }
}

/// Pull requests updated inside the window.
///
/// The listing is sorted by update time, newest first, so the stream stops at
/// the first page that reaches back past the window start.
pub struct PullsCollector;

#[async_trait]
impl UnitCollector for PullsCollector {
    fn endpoint(&self) -> EndpointKind {
        EndpointKind::Pulls
    }

    async fn collect(&self, ctx: &CollectContext, repo: &RepoTarget) -> CollectorResult<UnitReport> {
        let path = repo_path(repo, "/pulls");
        let mut stream =
            PageStream::rest(&ctx.client, path.clone(), self.endpoint()).with_params(&ListPullsParams::default())?;
        let mut writer = ctx.writer(&repo.full_name(), self.endpoint()).await?;

        while let Some(page) = stream.next_page().await? {
            let mut reached_start = false;
            let mut kept = Vec::with_capacity(page.len());
            for item in &page.items {
                match position(ctx, item, "updated_at") {
                    WindowPosition::Inside => kept.push(item),
                    WindowPosition::After => {}
                    WindowPosition::Before => reached_start = true,
                }
            }
            writer.append_items(&path, &page, kept).await?;
            if reached_start {
                debug!(repository = %repo, page = page.number, "Pull requests reached window start");
                stream.finish_early();
            }
        }

        Ok(UnitReport {
            records: writer.finish().await?,
            pages: stream.pages_fetched(),
            absent: stream.was_absent(),
        })
    }
}

/// Issues updated inside the window, pull requests excluded.
pub struct IssuesCollector;

#[async_trait]
impl UnitCollector for IssuesCollector {
    fn endpoint(&self) -> EndpointKind {
        EndpointKind::Issues
    }

    async fn collect(&self, ctx: &CollectContext, repo: &RepoTarget) -> CollectorResult<UnitReport> {
        let path = repo_path(repo, "/issues");
        let params = ListIssuesParams {
            state: "all",
            sort: "updated",
            direction: "desc",
            since: ctx.since_param(),
        };
        let mut stream = PageStream::rest(&ctx.client, path.clone(), self.endpoint()).with_params(&params)?;
        let mut writer = ctx.writer(&repo.full_name(), self.endpoint()).await?;

        while let Some(page) = stream.next_page().await? {
            let kept: Vec<&Value> = page
                .items
                .iter()
                .filter(|item| {
                    item.get("pull_request").is_none()
                        && position(ctx, item, "updated_at") == WindowPosition::Inside
                })
                .collect();
            writer.append_items(&path, &page, kept).await?;
        }

        Ok(UnitReport {
            records: writer.finish().await?,
            pages: stream.pages_fetched(),
            absent: stream.was_absent(),
        })
    }
}

/// Commits on the default branch authored inside the window.
///
/// Empty repositories answer 409, which ends the unit as absent.
pub struct CommitsCollector;

#[async_trait]
impl UnitCollector for CommitsCollector {
    fn endpoint(&self) -> EndpointKind {
        EndpointKind::Commits
    }

    async fn collect(&self, ctx: &CollectContext, repo: &RepoTarget) -> CollectorResult<UnitReport> {
        let path = repo_path(repo, "/commits");
        let params = ListCommitsParams {
            sha: repo.default_branch.clone(),
            since: ctx.since_param(),
            until: ctx.until_param(),
        };
        let mut stream = PageStream::rest(&ctx.client, path.clone(), self.endpoint()).with_params(&params)?;
        let mut writer = ctx.writer(&repo.full_name(), self.endpoint()).await?;

        while let Some(page) = stream.next_page().await? {
            writer.append_page(&path, &page).await?;
        }

        Ok(UnitReport {
            records: writer.finish().await?,
            pages: stream.pages_fetched(),
            absent: stream.was_absent(),
        })
    }
}

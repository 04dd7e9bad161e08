//! Reviews and comments.
//!
//! These units read the pull request and issue numbers persisted by earlier
//! phases, so they can be resumed by a process that never fetched them.

use super::{repo_path, timestamp, CollectContext, UnitCollector, UnitReport};
use crate::errors::CollectorResult;
use crate::pagination::PageStream;
use crate::storage::RecordWriter;
use crate::types::{EndpointKind, RepoTarget};
use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

/// Pages through `path` and appends everything to `writer`.
///
/// Returns pages fetched; an absent resource contributes nothing.
async fn drain(
    ctx: &CollectContext,
    endpoint: EndpointKind,
    path: String,
    since: Option<String>,
    writer: &mut RecordWriter,
) -> CollectorResult<u32> {
    let mut stream = PageStream::rest(&ctx.client, path.clone(), endpoint);
    if let Some(since) = since {
        stream = stream.with_query("since", since);
    }
    while let Some(page) = stream.next_page().await? {
        let kept: Vec<&Value> = page
            .items
            .iter()
            .filter(|item| timestamp(item, "created_at").map_or(true, |at| at <= ctx.window.until))
            .collect();
        writer.append_items(&path, &page, kept).await?;
    }
    if stream.was_absent() {
        debug!(path = %path, "Parent resource absent, nothing to collect");
    }
    Ok(stream.pages_fetched())
}

/// Fetches `suffix(number)` for every number and writes one stream.
async fn fan_out(
    ctx: &CollectContext,
    repo: &RepoTarget,
    endpoint: EndpointKind,
    numbers: Vec<u64>,
    suffix: impl Fn(u64) -> String + Send + Sync,
    since: Option<String>,
) -> CollectorResult<UnitReport> {
    let mut writer = ctx.writer(&repo.full_name(), endpoint).await?;
    let mut pages = 0;
    for number in numbers {
        pages += drain(ctx, endpoint, repo_path(repo, &suffix(number)), since.clone(), &mut writer).await?;
    }
    Ok(UnitReport {
        records: writer.finish().await?,
        pages,
        absent: false,
    })
}

/// Reviews of every collected pull request.
pub struct ReviewsCollector;

#[async_trait]
impl UnitCollector for ReviewsCollector {
    fn endpoint(&self) -> EndpointKind {
        EndpointKind::Reviews
    }

    async fn collect(&self, ctx: &CollectContext, repo: &RepoTarget) -> CollectorResult<UnitReport> {
        let numbers = ctx.store.read_numbers(&repo.full_name(), EndpointKind::Pulls).await?;
        debug!(repository = %repo, pulls = numbers.len(), "Collecting reviews");
        fan_out(
            ctx,
            repo,
            self.endpoint(),
            numbers,
            |n| format!("/pulls/{}/reviews", n),
            None,
        )
        .await
    }
}

/// Conversation comments of every collected issue and pull request.
pub struct IssueCommentsCollector;

#[async_trait]
impl UnitCollector for IssueCommentsCollector {
    fn endpoint(&self) -> EndpointKind {
        EndpointKind::IssueComments
    }

    async fn collect(&self, ctx: &CollectContext, repo: &RepoTarget) -> CollectorResult<UnitReport> {
        let owner = repo.full_name();
        let mut numbers = ctx.store.read_numbers(&owner, EndpointKind::Issues).await?;
        numbers.extend(ctx.store.read_numbers(&owner, EndpointKind::Pulls).await?);
        numbers.sort_unstable();
        numbers.dedup();
        debug!(repository = %repo, threads = numbers.len(), "Collecting issue comments");
        fan_out(
            ctx,
            repo,
            self.endpoint(),
            numbers,
            |n| format!("/issues/{}/comments", n),
            Some(ctx.since_param()),
        )
        .await
    }
}

/// Line comments of every collected pull request.
pub struct ReviewCommentsCollector;

#[async_trait]
impl UnitCollector for ReviewCommentsCollector {
    fn endpoint(&self) -> EndpointKind {
        EndpointKind::ReviewComments
    }

    async fn collect(&self, ctx: &CollectContext, repo: &RepoTarget) -> CollectorResult<UnitReport> {
        let numbers = ctx.store.read_numbers(&repo.full_name(), EndpointKind::Pulls).await?;
        debug!(repository = %repo, pulls = numbers.len(), "Collecting review comments");
        fan_out(
            ctx,
            repo,
            self.endpoint(),
            numbers,
            |n| format!("/pulls/{}/comments", n),
            None,
        )
        .await
    }
}

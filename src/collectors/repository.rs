//! Repository-level signals: metadata, branch protection and security features.

use super::{repo_path, single_page, CollectContext, UnitCollector, UnitReport};
use crate::client::Fetch;
use crate::errors::CollectorResult;
use crate::pagination::Page;
use crate::services::GraphQLService;
use crate::types::{EndpointKind, RepoTarget, Surface};
use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;

/// Repository metadata query.
pub const REPO_METADATA_QUERY: &str = r#"
query($owner: String!, $name: String!) {
  repository(owner: $owner, name: $name) {
    id
    name
    nameWithOwner
    description
    url
    createdAt
    updatedAt
    pushedAt
    isArchived
    isFork
    isPrivate
    isEmpty
    visibility
    diskUsage
    stargazerCount
    forkCount
    primaryLanguage { name }
    defaultBranchRef { name }
    licenseInfo { spdxId }
    repositoryTopics(first: 20) { nodes { topic { name } } }
    hasIssuesEnabled
    hasWikiEnabled
    deleteBranchOnMerge
    mergeCommitAllowed
    squashMergeAllowed
    rebaseMergeAllowed
  }
}
"#;

/// Repository metadata through one GraphQL query.
pub struct RepoMetadataCollector;

#[async_trait]
impl UnitCollector for RepoMetadataCollector {
    fn endpoint(&self) -> EndpointKind {
        EndpointKind::RepoMetadata
    }

    async fn collect(&self, ctx: &CollectContext, repo: &RepoTarget) -> CollectorResult<UnitReport> {
        let mut writer = ctx.writer(&repo.full_name(), self.endpoint()).await?;
        let variables = json!({ "owner": repo.owner, "name": repo.name });
        let fetch = GraphQLService::new(&ctx.client)
            .execute_raw(REPO_METADATA_QUERY, variables, self.endpoint())
            .await?;

        let response = match fetch {
            Fetch::Found(response) if !response.body["repository"].is_null() => response,
            _ => {
                writer.finish().await?;
                return Ok(UnitReport::absent());
            }
        };

        let page = single_page(&response, Surface::GraphQl, response.body["repository"].clone());
        writer.append_page(&ctx.client.config().graphql_path, &page).await?;
        Ok(UnitReport {
            records: writer.finish().await?,
            pages: 1,
            absent: false,
        })
    }
}

/// Looks up the default branch when discovery did not supply it.
///
/// `None` means the repository itself is absent.
async fn default_branch(ctx: &CollectContext, repo: &RepoTarget, endpoint: EndpointKind) -> CollectorResult<Option<String>> {
    if let Some(branch) = &repo.default_branch {
        return Ok(Some(branch.clone()));
    }
    Ok(ctx
        .client
        .get_json(&repo_path(repo, ""), endpoint)
        .await?
        .into_found()
        .and_then(|r| r.body["default_branch"].as_str().map(str::to_string)))
}

/// Protection settings of the default branch.
///
/// An unprotected branch (or one whose settings the token may not read) is
/// recorded as `protected: false` with the status GitHub returned.
pub struct BranchProtectionCollector;

impl BranchProtectionCollector {
    /// The branch is a single path segment, so `/` and other reserved
    /// characters in its name are percent-encoded.
    fn protection_path(repo: &RepoTarget, branch: &str) -> String {
        let segment: String = url::form_urlencoded::byte_serialize(branch.as_bytes()).collect();
        repo_path(repo, &format!("/branches/{}/protection", segment))
    }
}

#[async_trait]
impl UnitCollector for BranchProtectionCollector {
    fn endpoint(&self) -> EndpointKind {
        EndpointKind::BranchProtection
    }

    async fn collect(&self, ctx: &CollectContext, repo: &RepoTarget) -> CollectorResult<UnitReport> {
        let mut writer = ctx.writer(&repo.full_name(), self.endpoint()).await?;
        let Some(branch) = default_branch(ctx, repo, self.endpoint()).await? else {
            writer.finish().await?;
            return Ok(UnitReport::absent());
        };

        let path = Self::protection_path(repo, &branch);
        let page = match ctx.client.get_json(&path, self.endpoint()).await? {
            Fetch::Found(response) => single_page(
                &response,
                Surface::Rest,
                json!({ "branch": branch, "protected": true, "protection": response.body }),
            ),
            Fetch::Absent { status } => Page {
                items: vec![json!({ "branch": branch, "protected": false, "status": status })],
                number: 1,
                surface: Surface::Rest,
                correlation_id: uuid::Uuid::new_v4().to_string(),
            },
        };
        writer.append_page(&path, &page).await?;

        Ok(UnitReport {
            records: writer.finish().await?,
            pages: 1,
            absent: false,
        })
    }
}

/// Security and hygiene checks, one record per check.
pub const SECURITY_CHECKS: &[(&str, &str)] = &[
    ("vulnerability_alerts", "/vulnerability-alerts"),
    ("community_profile", "/community/profile"),
    ("dependabot_config", "/contents/.github/dependabot.yml"),
    ("codeowners", "/contents/.github/CODEOWNERS"),
    ("security_policy", "/contents/SECURITY.md"),
];

/// Security features: the repository's `security_and_analysis` settings
/// followed by presence checks for alerts, policy files and the community profile.
pub struct SecurityFeaturesCollector;

impl SecurityFeaturesCollector {
    fn check_record(check: &str, fetch: &Fetch) -> Value {
        match fetch {
            Fetch::Found(response) => json!({
                "check": check,
                "present": true,
                "status": response.status,
                "data": response.body,
            }),
            Fetch::Absent { status } => json!({
                "check": check,
                "present": false,
                "status": status,
            }),
        }
    }
}

#[async_trait]
impl UnitCollector for SecurityFeaturesCollector {
    fn endpoint(&self) -> EndpointKind {
        EndpointKind::SecurityFeatures
    }

    async fn collect(&self, ctx: &CollectContext, repo: &RepoTarget) -> CollectorResult<UnitReport> {
        let mut writer = ctx.writer(&repo.full_name(), self.endpoint()).await?;

        let repo_endpoint = repo_path(repo, "");
        let response = match ctx.client.get_json(&repo_endpoint, self.endpoint()).await? {
            Fetch::Found(response) => response,
            Fetch::Absent { .. } => {
                writer.finish().await?;
                return Ok(UnitReport::absent());
            }
        };
        let settings = json!({
            "check": "security_and_analysis",
            "present": !response.body["security_and_analysis"].is_null(),
            "status": response.status,
            "data": response.body["security_and_analysis"],
        });
        writer
            .append_page(&repo_endpoint, &single_page(&response, Surface::Rest, settings))
            .await?;

        let mut pages = 1;
        for (check, suffix) in SECURITY_CHECKS {
            let path = repo_path(repo, suffix);
            let fetch = ctx.client.get_json(&path, self.endpoint()).await?;
            let record = Self::check_record(check, &fetch);
            let correlation_id = match &fetch {
                Fetch::Found(response) => response.correlation_id.clone(),
                Fetch::Absent { .. } => uuid::Uuid::new_v4().to_string(),
            };
            pages += 1;
            let page = Page {
                items: vec![record],
                number: pages,
                surface: Surface::Rest,
                correlation_id,
            };
            writer.append_page(&path, &page).await?;
        }
        debug!(repository = %repo, checks = pages, "Security checks collected");

        Ok(UnitReport {
            records: writer.finish().await?,
            pages,
            absent: false,
        })
    }
}

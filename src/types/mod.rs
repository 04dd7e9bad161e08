//! Core data types shared across the collection engine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// The two API surfaces of the remote service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Surface {
    /// Paginated REST surface.
    Rest,
    /// Single-endpoint GraphQL surface.
    #[serde(rename = "graphql")]
    GraphQl,
}

impl Surface {
    /// Both surfaces, in display order.
    pub const ALL: [Surface; 2] = [Surface::Rest, Surface::GraphQl];

    /// Stable name used in persisted envelopes.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Rest => "rest",
            Self::GraphQl => "graphql",
        }
    }
}

impl fmt::Display for Surface {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind of endpoint a unit of work collects from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndpointKind {
    /// Repository discovery for the target.
    Discovery,
    /// Repository metadata (GraphQL).
    RepoMetadata,
    /// Pull requests.
    Pulls,
    /// Issues (pull requests excluded).
    Issues,
    /// Pull request reviews.
    Reviews,
    /// Issue comments.
    IssueComments,
    /// Pull request review comments.
    ReviewComments,
    /// Commits on the default branch.
    Commits,
    /// Default branch protection settings.
    BranchProtection,
    /// Security and hygiene signals.
    SecurityFeatures,
}

impl EndpointKind {
    /// Every endpoint kind.
    pub const ALL: [EndpointKind; 10] = [
        EndpointKind::Discovery,
        EndpointKind::RepoMetadata,
        EndpointKind::Pulls,
        EndpointKind::Issues,
        EndpointKind::Reviews,
        EndpointKind::IssueComments,
        EndpointKind::ReviewComments,
        EndpointKind::Commits,
        EndpointKind::BranchProtection,
        EndpointKind::SecurityFeatures,
    ];

    /// Stable name used in file names and checkpoint keys.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Discovery => "discovery",
            Self::RepoMetadata => "repo_metadata",
            Self::Pulls => "pulls",
            Self::Issues => "issues",
            Self::Reviews => "reviews",
            Self::IssueComments => "issue_comments",
            Self::ReviewComments => "review_comments",
            Self::Commits => "commits",
            Self::BranchProtection => "branch_protection",
            Self::SecurityFeatures => "security_features",
        }
    }

    /// Dense index for per-endpoint counter tables.
    pub fn index(&self) -> usize {
        *self as usize
    }

    /// Phase this endpoint's units belong to.
    pub fn phase(&self) -> Phase {
        match self {
            Self::Discovery => Phase::Discovery,
            Self::RepoMetadata => Phase::RepoMetadata,
            Self::Pulls => Phase::Pulls,
            Self::Issues => Phase::Issues,
            Self::Reviews => Phase::Reviews,
            Self::IssueComments | Self::ReviewComments => Phase::Comments,
            Self::Commits => Phase::Commits,
            Self::BranchProtection => Phase::BranchProtection,
            Self::SecurityFeatures => Phase::SecurityFeatures,
        }
    }

    /// Endpoints whose persisted output this endpoint reads.
    pub fn inputs(&self) -> &'static [EndpointKind] {
        match self {
            Self::Reviews | Self::ReviewComments => &[EndpointKind::Pulls],
            Self::IssueComments => &[EndpointKind::Issues, EndpointKind::Pulls],
            _ => &[],
        }
    }
}

impl fmt::Display for EndpointKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A named stage of the collection pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    /// Find the repositories to collect.
    Discovery,
    /// Repository metadata.
    RepoMetadata,
    /// Pull requests.
    Pulls,
    /// Issues.
    Issues,
    /// Reviews (reads persisted pull request numbers).
    Reviews,
    /// Issue and review comments (reads persisted numbers).
    Comments,
    /// Commits.
    Commits,
    /// Branch protection.
    BranchProtection,
    /// Security features.
    SecurityFeatures,
}

impl Phase {
    /// Fixed execution order.
    pub const ORDER: [Phase; 9] = [
        Phase::Discovery,
        Phase::RepoMetadata,
        Phase::Pulls,
        Phase::Issues,
        Phase::Reviews,
        Phase::Comments,
        Phase::Commits,
        Phase::BranchProtection,
        Phase::SecurityFeatures,
    ];

    /// Endpoint kinds whose units make up this phase.
    pub fn endpoints(&self) -> &'static [EndpointKind] {
        match self {
            Self::Discovery => &[EndpointKind::Discovery],
            Self::RepoMetadata => &[EndpointKind::RepoMetadata],
            Self::Pulls => &[EndpointKind::Pulls],
            Self::Issues => &[EndpointKind::Issues],
            Self::Reviews => &[EndpointKind::Reviews],
            Self::Comments => &[EndpointKind::IssueComments, EndpointKind::ReviewComments],
            Self::Commits => &[EndpointKind::Commits],
            Self::BranchProtection => &[EndpointKind::BranchProtection],
            Self::SecurityFeatures => &[EndpointKind::SecurityFeatures],
        }
    }

    /// Stable name used in the checkpoint document.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Discovery => "discovery",
            Self::RepoMetadata => "repo_metadata",
            Self::Pulls => "pulls",
            Self::Issues => "issues",
            Self::Reviews => "reviews",
            Self::Comments => "comments",
            Self::Commits => "commits",
            Self::BranchProtection => "branch_protection",
            Self::SecurityFeatures => "security_features",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether the target login is an organization or an individual account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetMode {
    /// `/orgs/{login}/repos`.
    #[default]
    Organization,
    /// `/users/{login}/repos`.
    User,
}

/// Repository owner (minimal representation).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Owner {
    /// Login of the owner.
    pub login: String,
}

/// Repository as returned by the repository listing endpoints.
///
/// Only the fields the discovery filters look at are typed; the raw payload is
/// persisted untouched.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RepoSummary {
    /// Repository ID.
    #[serde(default)]
    pub id: u64,
    /// Repository name.
    pub name: String,
    /// Full name (owner/repo).
    pub full_name: String,
    /// Owner.
    #[serde(default)]
    pub owner: Owner,
    /// Whether the repository is private.
    #[serde(default)]
    pub private: bool,
    /// Visibility (public, private, internal).
    #[serde(default)]
    pub visibility: Option<String>,
    /// Whether the repository is a fork.
    #[serde(default)]
    pub fork: bool,
    /// Whether the repository is archived.
    #[serde(default)]
    pub archived: bool,
    /// Whether the repository is disabled.
    #[serde(default)]
    pub disabled: bool,
    /// Size in KB.
    #[serde(default)]
    pub size: u64,
    /// Primary language.
    #[serde(default)]
    pub language: Option<String>,
    /// Topics.
    #[serde(default)]
    pub topics: Vec<String>,
    /// Default branch.
    #[serde(default)]
    pub default_branch: Option<String>,
    /// Last push.
    #[serde(default)]
    pub pushed_at: Option<DateTime<Utc>>,
    /// Last update.
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

impl RepoSummary {
    /// Effective visibility, falling back to the `private` flag.
    pub fn effective_visibility(&self) -> &str {
        match self.visibility.as_deref() {
            Some(v) => v,
            None if self.private => "private",
            None => "public",
        }
    }
}

/// A repository selected for collection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepoTarget {
    /// Owner login.
    pub owner: String,
    /// Repository name.
    pub name: String,
    /// Default branch, when known.
    pub default_branch: Option<String>,
}

impl RepoTarget {
    /// Creates a target from an owner and name.
    pub fn new(owner: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
            name: name.into(),
            default_branch: None,
        }
    }

    /// Parses `owner/name`.
    pub fn parse(full_name: &str) -> Option<Self> {
        let (owner, name) = full_name.split_once('/')?;
        if owner.is_empty() || name.is_empty() || name.contains('/') {
            return None;
        }
        Some(Self::new(owner, name))
    }

    /// Sets the default branch.
    pub fn with_default_branch(mut self, branch: impl Into<String>) -> Self {
        self.default_branch = Some(branch.into());
        self
    }

    /// `owner/name`.
    pub fn full_name(&self) -> String {
        format!("{}/{}", self.owner, self.name)
    }
}

impl From<&RepoSummary> for RepoTarget {
    fn from(repo: &RepoSummary) -> Self {
        let (owner, name) = match repo.full_name.split_once('/') {
            Some((owner, name)) => (owner.to_string(), name.to_string()),
            None => (repo.owner.login.clone(), repo.name.clone()),
        };
        Self {
            owner,
            name,
            default_branch: repo.default_branch.clone(),
        }
    }
}

impl fmt::Display for RepoTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.owner, self.name)
    }
}

//! Repository filter chain applied to discovery results.
//!
//! Filters run in a fixed order and the first rejection wins. Rejections are
//! counted per filter and end up in the run manifest.

use crate::config::{DiscoveryConfig, VisibilityFilter};
use crate::errors::{CollectorError, CollectorResult};
use crate::types::RepoSummary;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Verdict of one filter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FilterDecision {
    /// The repository passes.
    Pass,
    /// The repository is dropped.
    Reject {
        /// Machine-readable reason, e.g. `fork` or `language_denied:go`.
        reason: String,
    },
}

impl FilterDecision {
    fn reject(reason: impl Into<String>) -> Self {
        Self::Reject {
            reason: reason.into(),
        }
    }

    fn check(pass: bool, reason: impl FnOnce() -> String) -> Self {
        if pass {
            Self::Pass
        } else {
            Self::reject(reason())
        }
    }
}

/// A single discovery predicate.
pub trait RepoFilter: Send + Sync {
    /// Stable filter name used in statistics.
    fn name(&self) -> &'static str;

    /// Evaluates one repository.
    fn evaluate(&self, repo: &RepoSummary) -> FilterDecision;
}

/// Drops forks unless they are wanted.
pub struct ForkFilter {
    include_forks: bool,
}

impl RepoFilter for ForkFilter {
    fn name(&self) -> &'static str {
        "fork"
    }

    fn evaluate(&self, repo: &RepoSummary) -> FilterDecision {
        FilterDecision::check(self.include_forks || !repo.fork, || "fork".to_string())
    }
}

/// Drops archived and disabled repositories unless archived ones are wanted.
pub struct ArchivedFilter {
    include_archived: bool,
}

impl RepoFilter for ArchivedFilter {
    fn name(&self) -> &'static str {
        "archived"
    }

    fn evaluate(&self, repo: &RepoSummary) -> FilterDecision {
        if repo.disabled {
            return FilterDecision::reject("disabled");
        }
        FilterDecision::check(self.include_archived || !repo.archived, || "archived".to_string())
    }
}

/// Keeps one visibility class.
pub struct VisibilityRepoFilter {
    visibility: VisibilityFilter,
}

impl RepoFilter for VisibilityRepoFilter {
    fn name(&self) -> &'static str {
        "visibility"
    }

    fn evaluate(&self, repo: &RepoSummary) -> FilterDecision {
        let actual = repo.effective_visibility();
        let pass = match self.visibility {
            VisibilityFilter::All => true,
            VisibilityFilter::Public => actual == "public",
            VisibilityFilter::Private => actual != "public",
        };
        FilterDecision::check(pass, || format!("visibility:{}", actual))
    }
}

/// Requires recent activity (last push, else last update) before the window end.
pub struct ActivityFilter {
    cutoff: Option<DateTime<Utc>>,
}

impl RepoFilter for ActivityFilter {
    fn name(&self) -> &'static str {
        "activity"
    }

    fn evaluate(&self, repo: &RepoSummary) -> FilterDecision {
        let Some(cutoff) = self.cutoff else {
            return FilterDecision::Pass;
        };
        match repo.pushed_at.or(repo.updated_at) {
            Some(at) if at >= cutoff => FilterDecision::Pass,
            Some(_) => FilterDecision::reject("inactive"),
            None => FilterDecision::reject("no_activity"),
        }
    }
}

/// Bounds the repository size.
pub struct SizeFilter {
    min_kb: Option<u64>,
    max_kb: Option<u64>,
}

impl RepoFilter for SizeFilter {
    fn name(&self) -> &'static str {
        "size"
    }

    fn evaluate(&self, repo: &RepoSummary) -> FilterDecision {
        if self.min_kb.map_or(false, |min| repo.size < min) {
            return FilterDecision::reject("too_small");
        }
        if self.max_kb.map_or(false, |max| repo.size > max) {
            return FilterDecision::reject("too_large");
        }
        FilterDecision::Pass
    }
}

/// Language allow and deny lists, compared case-insensitively.
pub struct LanguageFilter {
    allow: Vec<String>,
    deny: Vec<String>,
}

impl RepoFilter for LanguageFilter {
    fn name(&self) -> &'static str {
        "language"
    }

    fn evaluate(&self, repo: &RepoSummary) -> FilterDecision {
        let language = repo.language.as_deref().map(str::to_lowercase);
        if let Some(lang) = &language {
            if self.deny.contains(lang) {
                return FilterDecision::reject(format!("language_denied:{}", lang));
            }
        }
        if self.allow.is_empty() {
            return FilterDecision::Pass;
        }
        match language {
            Some(lang) if self.allow.contains(&lang) => FilterDecision::Pass,
            Some(lang) => FilterDecision::reject(format!("language_not_allowed:{}", lang)),
            None => FilterDecision::reject("language_unknown"),
        }
    }
}

/// Topic allow and deny lists.
pub struct TopicFilter {
    allow: Vec<String>,
    deny: Vec<String>,
}

impl RepoFilter for TopicFilter {
    fn name(&self) -> &'static str {
        "topic"
    }

    fn evaluate(&self, repo: &RepoSummary) -> FilterDecision {
        let topics: Vec<String> = repo.topics.iter().map(|t| t.to_lowercase()).collect();
        if let Some(denied) = topics.iter().find(|t| self.deny.contains(t)) {
            return FilterDecision::reject(format!("topic_denied:{}", denied));
        }
        let pass = self.allow.is_empty() || topics.iter().any(|t| self.allow.contains(t));
        FilterDecision::check(pass, || "topic_not_allowed".to_string())
    }
}

/// Name pattern include and exclude lists, matched against the repository name.
pub struct NamePatternFilter {
    include: Vec<Regex>,
    exclude: Vec<Regex>,
}

impl RepoFilter for NamePatternFilter {
    fn name(&self) -> &'static str {
        "name_pattern"
    }

    fn evaluate(&self, repo: &RepoSummary) -> FilterDecision {
        if let Some(re) = self.exclude.iter().find(|re| re.is_match(&repo.name)) {
            return FilterDecision::reject(format!("name_excluded:{}", re.as_str()));
        }
        let pass = self.include.is_empty() || self.include.iter().any(|re| re.is_match(&repo.name));
        FilterDecision::check(pass, || "name_not_included".to_string())
    }
}

/// The filter that rejected a repository.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rejection {
    /// Filter name.
    pub filter: &'static str,
    /// Reason reported by the filter.
    pub reason: String,
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.filter, self.reason)
    }
}

/// Aggregate discovery statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterStats {
    /// Repositories evaluated.
    pub evaluated: u64,
    /// Repositories kept.
    pub accepted: u64,
    /// Rejections per filter name.
    pub rejected_by_filter: BTreeMap<String, u64>,
    /// Rejections per reason.
    pub rejected_by_reason: BTreeMap<String, u64>,
}

impl FilterStats {
    /// Records one verdict.
    pub fn record(&mut self, verdict: &Result<(), Rejection>) {
        self.evaluated += 1;
        match verdict {
            Ok(()) => self.accepted += 1,
            Err(rejection) => {
                *self
                    .rejected_by_filter
                    .entry(rejection.filter.to_string())
                    .or_default() += 1;
                *self
                    .rejected_by_reason
                    .entry(rejection.reason.clone())
                    .or_default() += 1;
            }
        }
    }

    /// Total rejections.
    pub fn rejected(&self) -> u64 {
        self.evaluated - self.accepted
    }
}

/// Ordered filter sequence.
pub struct FilterChain {
    filters: Vec<Box<dyn RepoFilter>>,
}

impl FilterChain {
    /// Creates a chain from explicit filters.
    pub fn new(filters: Vec<Box<dyn RepoFilter>>) -> Self {
        Self { filters }
    }

    /// Builds the standard chain. `until` anchors the activity cutoff.
    pub fn from_config(config: &DiscoveryConfig, until: DateTime<Utc>) -> CollectorResult<Self> {
        let lower = |items: &[String]| items.iter().map(|s| s.to_lowercase()).collect::<Vec<_>>();
        let compile = |patterns: &[String]| {
            patterns
                .iter()
                .map(|p| {
                    Regex::new(p).map_err(|e| {
                        CollectorError::configuration(format!("Invalid name pattern '{}': {}", p, e))
                    })
                })
                .collect::<CollectorResult<Vec<_>>>()
        };

        let cutoff = match config.active_within_days {
            Some(days) => Some(
                until
                    .checked_sub_signed(ChronoDuration::days(i64::from(days)))
                    .ok_or_else(|| {
                        CollectorError::configuration(format!(
                            "active_within_days {} reaches before the earliest representable time",
                            days
                        ))
                    })?,
            ),
            None => None,
        };

        Ok(Self::new(vec![
            Box::new(ForkFilter {
                include_forks: config.include_forks,
            }),
            Box::new(ArchivedFilter {
                include_archived: config.include_archived,
            }),
            Box::new(VisibilityRepoFilter {
                visibility: config.visibility,
            }),
            Box::new(ActivityFilter { cutoff }),
            Box::new(SizeFilter {
                min_kb: config.min_size_kb,
                max_kb: config.max_size_kb,
            }),
            Box::new(LanguageFilter {
                allow: lower(&config.languages_allow),
                deny: lower(&config.languages_deny),
            }),
            Box::new(TopicFilter {
                allow: lower(&config.topics_allow),
                deny: lower(&config.topics_deny),
            }),
            Box::new(NamePatternFilter {
                include: compile(&config.name_include)?,
                exclude: compile(&config.name_exclude)?,
            }),
        ]))
    }

    /// Filter names in evaluation order.
    pub fn names(&self) -> Vec<&'static str> {
        self.filters.iter().map(|f| f.name()).collect()
    }

    /// Runs the chain; the first rejecting filter is reported.
    pub fn evaluate(&self, repo: &RepoSummary) -> Result<(), Rejection> {
        for filter in &self.filters {
            if let FilterDecision::Reject { reason } = filter.evaluate(repo) {
                return Err(Rejection {
                    filter: filter.name(),
                    reason,
                });
            }
        }
        Ok(())
    }
}

//! # GitHub Activity Collector
//!
//! A resumable, quota-aware bulk collector for one organization or user:
//! - Adaptive throttling against the primary quota and the secondary limit
//! - REST and GraphQL transport with explicit retry decisions
//! - Lazy pagination over `Link` headers and GraphQL connections
//! - Durable per-unit checkpoints; interrupted runs resume where they stopped
//! - Line-delimited JSON output with a run manifest
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use integrations_github_collector::{CollectorConfig, GitHubClient, Orchestrator};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = CollectorConfig::builder()
//!         .pat("ghp_xxxxxxxxxxxx")
//!         .organization("acme")
//!         .output_dir("collector-data")
//!         .build()?;
//!
//!     let orchestrator = Orchestrator::new(GitHubClient::new(config)?).await?;
//!     let summary = orchestrator.run().await?;
//!     for phase in &summary.phases {
//!         println!("{}: {}", phase.phase, phase.status);
//!     }
//!
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

// Core modules
pub mod config;
pub mod errors;
pub mod types;

// Authentication
pub mod auth;

// HTTP client and transport
pub mod client;

// Pagination handling
pub mod pagination;

// GraphQL access
pub mod services;

// Rate limiting and retry
pub mod resilience;

// Observability
pub mod observability;

// Durable state
pub mod checkpoint;
pub mod storage;

// Collection
pub mod collectors;
pub mod discovery;
pub mod orchestrator;

// Re-exports for convenience
pub use auth::{AuthManager, AuthMethod};
pub use checkpoint::{CheckpointStore, UnitStatus};
pub use client::{ApiRequest, ApiResponse, Fetch, GitHubClient, GitHubClientBuilder, Outcome};
pub use config::{CollectorConfig, CollectorConfigBuilder};
pub use errors::{CollectorError, CollectorErrorKind, CollectorResult};
pub use orchestrator::{Orchestrator, PhaseReport, PhaseStatus, RunSummary};
pub use pagination::{Page, PageStream, PaginationLinks};
pub use resilience::AdaptiveThrottle;
pub use storage::{EnvelopedRecord, RawStore, RunManifest};
pub use types::*;

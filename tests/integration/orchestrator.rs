//! Whole runs: phases, checkpoints, resumption and the manifest.

use super::*;
use chrono::Duration as ChronoDuration;
use integrations_github_collector::config::{EndpointToggles, OutputConfig, RateLimitConfig};
use integrations_github_collector::{
    CheckpointStore, CollectorErrorKind, EndpointKind, GitHubClient, Orchestrator, Phase, PhaseStatus, RawStore,
    RepoTarget, UnitStatus,
};
use pretty_assertions::assert_eq;
use serde_json::json;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use wiremock::matchers::query_param;
use wiremock::{MockServer, Request, Respond, ResponseTemplate};

const REPO: &str = "acme/widgets";

async fn orchestrator(config: CollectorConfig) -> Orchestrator {
    Orchestrator::new(GitHubClient::new(config).unwrap()).await.unwrap()
}

fn explicit(server: &MockServer, output: &Path, endpoints: EndpointToggles) -> CollectorConfig {
    test_config(server, output)
        .repositories([REPO])
        .endpoints(endpoints)
        .build()
        .unwrap()
}

#[tokio::test]
async fn test_full_run_writes_streams_checkpoint_and_manifest() {
    let mock_server = setup_mock_server().await;
    let dir = tempfile::tempdir().unwrap();
    let endpoints = EndpointToggles {
        pulls: true,
        issues: true,
        reviews: true,
        comments: true,
        branch_protection: true,
        ..no_endpoints()
    };
    let config = explicit(&mock_server, dir.path(), endpoints);
    let (since, until) = (config.window.since, config.window.until);
    let inside = api_time(until - ChronoDuration::days(2));
    mount_rate_limit(&mock_server).await;

    mock_with_auth("/repos/acme/widgets/pulls", "GET")
        .respond_with(success_response(json!([
            {"number": 7, "title": "Add gear", "created_at": inside, "updated_at": inside}
        ])))
        .expect(1)
        .mount(&mock_server)
        .await;
    mock_with_auth("/repos/acme/widgets/issues", "GET")
        .and(query_param("since", api_time(since).as_str()))
        .respond_with(success_response(json!([
            {"number": 3, "title": "Gear squeaks", "updated_at": inside},
            {"number": 7, "title": "Add gear", "updated_at": inside, "pull_request": {"url": "https://example.test/pulls/7"}}
        ])))
        .expect(1)
        .mount(&mock_server)
        .await;
    mock_with_auth("/repos/acme/widgets/pulls/7/reviews", "GET")
        .respond_with(success_response(json!([{"id": 700, "state": "APPROVED"}])))
        .expect(1)
        .mount(&mock_server)
        .await;
    mock_with_auth("/repos/acme/widgets/issues/3/comments", "GET")
        .respond_with(success_response(json!([{"id": 30, "created_at": inside}])))
        .expect(1)
        .mount(&mock_server)
        .await;
    mock_with_auth("/repos/acme/widgets/issues/7/comments", "GET")
        .respond_with(success_response(json!([
            {"id": 71, "created_at": api_time(until + ChronoDuration::hours(2))}
        ])))
        .expect(1)
        .mount(&mock_server)
        .await;
    mock_with_auth("/repos/acme/widgets/pulls/7/comments", "GET")
        .respond_with(success_response(json!([])))
        .expect(1)
        .mount(&mock_server)
        .await;
    mock_with_auth("/repos/acme/widgets", "GET")
        .respond_with(success_response(json!({"full_name": REPO, "default_branch": "main"})))
        .expect(1)
        .mount(&mock_server)
        .await;
    mock_with_auth("/repos/acme/widgets/branches/main/protection", "GET")
        .respond_with(error_response(404, "Branch not protected"))
        .expect(1)
        .mount(&mock_server)
        .await;

    let summary = orchestrator(config.clone()).await.run().await.unwrap();

    assert!(summary.is_complete());
    assert_eq!(summary.errored(), 0);
    assert_eq!(summary.repositories, 1);
    assert_eq!(summary.phase(Phase::Discovery).unwrap().status, PhaseStatus::Disabled);
    assert_eq!(summary.phase(Phase::Commits).unwrap().status, PhaseStatus::Disabled);
    assert_eq!(summary.phase(Phase::Comments).unwrap().status, PhaseStatus::Completed);
    assert_eq!(summary.phase(Phase::Comments).unwrap().processed, 2);

    let store = RawStore::new(dir.path());
    let count = |endpoint: EndpointKind| {
        let store = store.clone();
        async move { store.read_records(REPO, endpoint).await.unwrap().len() }
    };
    assert_eq!(count(EndpointKind::Pulls).await, 1);
    assert_eq!(count(EndpointKind::Issues).await, 1);
    assert_eq!(count(EndpointKind::Reviews).await, 1);
    assert_eq!(count(EndpointKind::IssueComments).await, 1);
    assert_eq!(count(EndpointKind::ReviewComments).await, 0);

    let protection = store.read_records(REPO, EndpointKind::BranchProtection).await.unwrap();
    assert_eq!(protection.len(), 1);
    assert_eq!(protection[0].data["branch"], "main");
    assert_eq!(protection[0].data["protected"], false);
    assert_eq!(protection[0].data["status"], 404);
    assert!(store.stream_path(REPO, EndpointKind::Pulls).ends_with("raw/acme__widgets/pulls.jsonl"));

    let checkpoint = CheckpointStore::open(store.checkpoint_path()).await.unwrap();
    for phase in Phase::ORDER {
        assert!(checkpoint.is_phase_complete(phase).await, "phase {} not complete", phase);
    }
    assert_eq!(checkpoint.unit_status(REPO, EndpointKind::IssueComments).await, UnitStatus::Complete);

    let manifest = store.read_manifest().await.unwrap().unwrap();
    assert_eq!(manifest.run_id, summary.run_id);
    assert_eq!(manifest.repositories, vec![REPO.to_string()]);
    assert_eq!(manifest.config_digest, config.config_digest());
    assert!(manifest.finished_at.is_some());
    assert_eq!(manifest.endpoints[&EndpointKind::Pulls].records, 1);
    assert_eq!(manifest.endpoints[&EndpointKind::Pulls].requests, 1);

    // A second run over the same output finds everything checkpointed.
    let again = orchestrator(config).await.run().await.unwrap();
    assert!(again.is_complete());
    assert_eq!(again.run_id, summary.run_id);
    assert_eq!(again.phase(Phase::Pulls).unwrap().status, PhaseStatus::AlreadyComplete);
    let resumed = store.read_manifest().await.unwrap().unwrap();
    assert_eq!(resumed.started_at, manifest.started_at);
    assert_eq!(resumed.endpoints[&EndpointKind::Pulls].records, 1);
}

#[tokio::test]
async fn test_resume_reruns_only_unsettled_units() {
    let mock_server = setup_mock_server().await;
    let dir = tempfile::tempdir().unwrap();
    let (_, until) = window();
    mount_rate_limit(&mock_server).await;

    let store = RawStore::new(dir.path());
    {
        let checkpoint = CheckpointStore::open(store.checkpoint_path()).await.unwrap();
        checkpoint
            .mark_failed(REPO, EndpointKind::Pulls, "Giving up after 5 failures", true)
            .await
            .unwrap();
        checkpoint.mark_complete(REPO, EndpointKind::Issues).await.unwrap();
    }

    mock_with_auth("/repos/acme/widgets/pulls", "GET")
        .respond_with(success_response(json!([
            {"number": 4, "updated_at": api_time(until - ChronoDuration::hours(5))}
        ])))
        .expect(1)
        .mount(&mock_server)
        .await;
    mock_with_auth("/repos/acme/widgets/issues", "GET")
        .respond_with(success_response(json!([])))
        .expect(0)
        .mount(&mock_server)
        .await;

    let endpoints = EndpointToggles {
        pulls: true,
        issues: true,
        ..no_endpoints()
    };
    let orchestrator = orchestrator(explicit(&mock_server, dir.path(), endpoints)).await;
    let summary = orchestrator.run().await.unwrap();

    let pulls = summary.phase(Phase::Pulls).unwrap();
    assert_eq!(pulls.status, PhaseStatus::Completed);
    assert_eq!(pulls.processed, 1);
    assert_eq!(pulls.resumed, 1);
    assert_eq!(pulls.records, 1);

    let issues = summary.phase(Phase::Issues).unwrap();
    assert_eq!(issues.status, PhaseStatus::Completed);
    assert_eq!(issues.already_complete, 1);
    assert_eq!(issues.processed, 0);

    assert_eq!(
        orchestrator.checkpoint().unit_status(REPO, EndpointKind::Pulls).await,
        UnitStatus::Complete
    );
    assert_eq!(store.read_numbers(REPO, EndpointKind::Pulls).await.unwrap(), vec![4]);
}

#[tokio::test]
async fn test_dependent_units_wait_for_their_inputs() {
    let mock_server = setup_mock_server().await;
    let dir = tempfile::tempdir().unwrap();
    mount_rate_limit(&mock_server).await;

    mock_with_auth("/repos/acme/widgets/pulls", "GET")
        .respond_with(error_response(503, "Service Unavailable"))
        .expect(3)
        .mount(&mock_server)
        .await;
    mock_with_auth("/repos/acme/widgets/pulls/1/reviews", "GET")
        .respond_with(success_response(json!([])))
        .expect(0)
        .mount(&mock_server)
        .await;

    let endpoints = EndpointToggles {
        pulls: true,
        reviews: true,
        ..no_endpoints()
    };
    let orchestrator = orchestrator(explicit(&mock_server, dir.path(), endpoints)).await;
    let summary = orchestrator.run().await.unwrap();

    assert!(!summary.is_complete());
    assert_eq!(summary.errored(), 1);
    assert_eq!(summary.phase(Phase::Pulls).unwrap().status, PhaseStatus::Incomplete);
    let reviews = summary.phase(Phase::Reviews).unwrap();
    assert_eq!(reviews.status, PhaseStatus::Incomplete);
    assert_eq!(reviews.deferred, 1);

    let checkpoint = orchestrator.checkpoint();
    assert!(matches!(
        checkpoint.unit_status(REPO, EndpointKind::Pulls).await,
        UnitStatus::Failed { retryable: true, .. }
    ));
    assert_eq!(checkpoint.unit_status(REPO, EndpointKind::Reviews).await, UnitStatus::NotStarted);
    assert!(!checkpoint.is_phase_complete(Phase::Pulls).await);
    assert!(checkpoint.is_phase_complete(Phase::Commits).await);
}

#[tokio::test]
async fn test_bad_credentials_abort_the_run() {
    let mock_server = setup_mock_server().await;
    let dir = tempfile::tempdir().unwrap();

    mock_with_auth("/rate_limit", "GET")
        .respond_with(error_response(401, "Bad credentials"))
        .expect(1)
        .mount(&mock_server)
        .await;
    mock_with_auth("/repos/acme/widgets/pulls", "GET")
        .respond_with(success_response(json!([])))
        .expect(0)
        .mount(&mock_server)
        .await;

    let endpoints = EndpointToggles {
        pulls: true,
        ..no_endpoints()
    };
    let orchestrator = orchestrator(explicit(&mock_server, dir.path(), endpoints)).await;
    let err = orchestrator.run().await.unwrap_err();

    assert_eq!(*err.kind(), CollectorErrorKind::BadCredentials);
    assert!(orchestrator.store().read_manifest().await.unwrap().is_none());
}

#[tokio::test]
async fn test_discovery_filters_and_is_reused() {
    let mock_server = setup_mock_server().await;
    let dir = tempfile::tempdir().unwrap();
    mount_rate_limit(&mock_server).await;

    mock_with_auth("/orgs/acme/repos", "GET")
        .and(query_param("type", "all"))
        .and(query_param("sort", "full_name"))
        .respond_with(success_response(json!([
            {"id": 1, "name": "legacy", "full_name": "acme/legacy", "archived": true, "default_branch": "master"},
            {"id": 2, "name": "widgets", "full_name": "acme/widgets", "default_branch": "main", "language": "Rust"},
            {"id": 3, "name": "widgets-fork", "full_name": "acme/widgets-fork", "fork": true}
        ])))
        .expect(1)
        .mount(&mock_server)
        .await;

    let config = test_config(&mock_server, dir.path())
        .organization("acme")
        .endpoints(no_endpoints())
        .build()
        .unwrap();

    let summary = orchestrator(config.clone()).await.run().await.unwrap();
    assert!(summary.is_complete());
    assert_eq!(summary.repositories, 1);
    let discovery = summary.phase(Phase::Discovery).unwrap();
    assert_eq!(discovery.status, PhaseStatus::Completed);
    assert_eq!(discovery.records, 1);

    let store = RawStore::new(dir.path());
    assert_eq!(
        store.read_repo_targets("acme").await.unwrap(),
        vec![RepoTarget::new("acme", "widgets").with_default_branch("main")]
    );

    let manifest = store.read_manifest().await.unwrap().unwrap();
    assert_eq!(manifest.target, "acme");
    assert_eq!(manifest.filter_stats.evaluated, 3);
    assert_eq!(manifest.filter_stats.accepted, 1);
    assert_eq!(manifest.filter_stats.rejected_by_filter.get("fork"), Some(&1));
    assert_eq!(manifest.filter_stats.rejected_by_filter.get("archived"), Some(&1));

    let again = orchestrator(config).await.run().await.unwrap();
    assert_eq!(again.phase(Phase::Discovery).unwrap().status, PhaseStatus::AlreadyComplete);
    assert_eq!(again.repositories, 1);
    assert_eq!(
        store.read_manifest().await.unwrap().unwrap().filter_stats.accepted,
        1
    );
}

#[tokio::test]
async fn test_credentials_revoked_mid_run_leave_unit_for_next_run() {
    let mock_server = setup_mock_server().await;
    let dir = tempfile::tempdir().unwrap();
    let (_, until) = window();
    mount_rate_limit(&mock_server).await;

    mock_with_auth("/repos/acme/widgets/pulls", "GET")
        .respond_with(error_response(401, "Bad credentials"))
        .up_to_n_times(1)
        .expect(1)
        .mount(&mock_server)
        .await;

    let endpoints = EndpointToggles {
        pulls: true,
        ..no_endpoints()
    };
    let first = orchestrator(explicit(&mock_server, dir.path(), endpoints.clone())).await;
    let err = first.run().await.unwrap_err();
    assert_eq!(*err.kind(), CollectorErrorKind::BadCredentials);
    assert_eq!(
        first.checkpoint().unit_status(REPO, EndpointKind::Pulls).await,
        UnitStatus::NotStarted
    );
    assert!(!first.checkpoint().is_phase_complete(Phase::Pulls).await);
    drop(first);

    mock_with_auth("/repos/acme/widgets/pulls", "GET")
        .respond_with(success_response(json!([
            {"number": 5, "updated_at": api_time(until - ChronoDuration::hours(1))}
        ])))
        .expect(1)
        .mount(&mock_server)
        .await;

    let second = orchestrator(explicit(&mock_server, dir.path(), endpoints)).await;
    let summary = second.run().await.unwrap();

    let pulls = summary.phase(Phase::Pulls).unwrap();
    assert_eq!(pulls.status, PhaseStatus::Completed);
    assert_eq!(pulls.processed, 1);
    assert_eq!(pulls.already_complete, 0);
    assert_eq!(pulls.records, 1);
    assert_eq!(
        second.store().read_numbers(REPO, EndpointKind::Pulls).await.unwrap(),
        vec![5]
    );
}

#[tokio::test]
async fn test_permanent_failure_discards_partial_stream() {
    let mock_server = setup_mock_server().await;
    let dir = tempfile::tempdir().unwrap();
    let (_, until) = window();
    let route = "/repos/acme/widgets/pulls";
    mount_rate_limit(&mock_server).await;

    let next = format!(r#"<{}{}?per_page=100&page=2>; rel="next""#, mock_server.uri(), route);
    mock_with_auth(route, "GET")
        .and(query_param("page", "1"))
        .respond_with(
            success_response(json!([
                {"number": 8, "updated_at": api_time(until - ChronoDuration::hours(1))}
            ]))
            .insert_header("link", next.as_str()),
        )
        .expect(1)
        .mount(&mock_server)
        .await;
    mock_with_auth(route, "GET")
        .and(query_param("page", "2"))
        .respond_with(error_response(422, "Validation Failed"))
        .expect(1)
        .mount(&mock_server)
        .await;
    mock_with_auth("/repos/acme/widgets/pulls/8/reviews", "GET")
        .respond_with(success_response(json!([{"id": 80}])))
        .expect(0)
        .mount(&mock_server)
        .await;

    let config = test_config(&mock_server, dir.path())
        .repositories([REPO])
        .endpoints(EndpointToggles {
            pulls: true,
            reviews: true,
            ..no_endpoints()
        })
        .output(OutputConfig {
            output_dir: dir.path().to_path_buf(),
            flush_every: 1,
            per_page: 100,
        })
        .build()
        .unwrap();
    let orchestrator = orchestrator(config).await;
    let summary = orchestrator.run().await.unwrap();

    assert_eq!(summary.errored(), 1);
    assert!(matches!(
        orchestrator.checkpoint().unit_status(REPO, EndpointKind::Pulls).await,
        UnitStatus::Failed { retryable: false, .. }
    ));
    let reviews = summary.phase(Phase::Reviews).unwrap();
    assert_eq!(reviews.status, PhaseStatus::Completed);
    assert_eq!(reviews.records, 0);

    let store = orchestrator.store();
    assert!(!store.stream_path(REPO, EndpointKind::Pulls).exists());
    assert!(store.read_numbers(REPO, EndpointKind::Pulls).await.unwrap().is_empty());
}

/// Answers after a fixed delay and notes when each request arrived.
struct Timed {
    arrivals: Arc<Mutex<Vec<Instant>>>,
    delay: Duration,
    status: u16,
}

impl Respond for Timed {
    fn respond(&self, _request: &Request) -> ResponseTemplate {
        self.arrivals.lock().unwrap().push(Instant::now());
        let template = match self.status {
            200 => success_response(json!([])),
            status => error_response(status, "Validation Failed"),
        };
        template.set_delay(self.delay)
    }
}

#[tokio::test]
async fn test_repository_concurrency_is_bounded() {
    let mock_server = setup_mock_server().await;
    let dir = tempfile::tempdir().unwrap();
    let delay = Duration::from_millis(300);
    let arrivals = Arc::new(Mutex::new(Vec::new()));
    mount_rate_limit(&mock_server).await;

    let repos: Vec<String> = (0..5).map(|i| format!("acme/r{}", i)).collect();
    for (i, repo) in repos.iter().enumerate() {
        mock_with_auth(&format!("/repos/{}/pulls", repo), "GET")
            .respond_with(Timed {
                arrivals: Arc::clone(&arrivals),
                delay,
                status: if i == 1 { 422 } else { 200 },
            })
            .expect(1)
            .mount(&mock_server)
            .await;
    }

    let config = test_config(&mock_server, dir.path())
        .repositories(repos.clone())
        .endpoints(EndpointToggles {
            pulls: true,
            ..no_endpoints()
        })
        .rate_limit(RateLimitConfig {
            max_concurrent_repos: 2,
            ..Default::default()
        })
        .build()
        .unwrap();

    let started = Instant::now();
    let summary = orchestrator(config).await.run().await.unwrap();
    let elapsed = started.elapsed();

    let pulls = summary.phase(Phase::Pulls).unwrap();
    assert_eq!(pulls.processed, 4);
    assert_eq!(pulls.errored, 1);
    assert_eq!(pulls.status, PhaseStatus::Completed);
    assert!(elapsed >= delay * 3, "five repositories over two slots took {:?}", elapsed);

    let mut arrivals = arrivals.lock().unwrap().clone();
    arrivals.sort();
    assert_eq!(arrivals.len(), 5);
    let busiest = arrivals
        .iter()
        .map(|start| {
            arrivals
                .iter()
                .filter(|at| **at >= *start && **at < *start + delay / 2)
                .count()
        })
        .max()
        .unwrap();
    assert_eq!(busiest, 2);
}

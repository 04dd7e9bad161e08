//! Transport: retries, throttling and outcome classification.

use super::*;
use integrations_github_collector::services::GraphQLService;
use integrations_github_collector::{CollectorErrorKind, EndpointKind, Fetch, GitHubClient, Surface};
use serde_json::json;
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, ResponseTemplate};

fn client(server: &wiremock::MockServer) -> GitHubClient {
    let dir = tempfile::tempdir().unwrap();
    GitHubClient::new(
        test_config(server, dir.path())
            .organization("acme")
            .build()
            .unwrap(),
    )
    .unwrap()
}

#[tokio::test]
async fn test_sends_github_headers() {
    let mock_server = setup_mock_server().await;

    mock_with_auth("/repos/acme/widgets", "GET")
        .and(header("Accept", "application/vnd.github+json"))
        .and(header("X-GitHub-Api-Version", "2022-11-28"))
        .respond_with(success_response(json!({"full_name": "acme/widgets"})))
        .expect(1)
        .mount(&mock_server)
        .await;

    let fetch = client(&mock_server)
        .get_json("/repos/acme/widgets", EndpointKind::RepoMetadata)
        .await
        .unwrap();

    let response = fetch.into_found().unwrap();
    assert_eq!(response.status, 200);
    assert_eq!(response.body["full_name"], "acme/widgets");
    assert!(!response.correlation_id.is_empty());
}

#[tokio::test]
async fn test_retries_server_error_then_succeeds() {
    let mock_server = setup_mock_server().await;

    mock_with_auth("/repos/acme/widgets", "GET")
        .respond_with(error_response(502, "Bad Gateway"))
        .up_to_n_times(1)
        .mount(&mock_server)
        .await;
    mock_with_auth("/repos/acme/widgets", "GET")
        .respond_with(success_response(json!({"full_name": "acme/widgets"})))
        .mount(&mock_server)
        .await;

    let client = client(&mock_server);
    let fetch = client
        .get_json("/repos/acme/widgets", EndpointKind::RepoMetadata)
        .await
        .unwrap();

    assert!(!fetch.is_absent());
    assert_eq!(client.metrics().retried_requests(), 1);
    let counters = client.metrics().endpoint_snapshot(EndpointKind::RepoMetadata);
    assert_eq!(counters.requests, 2);
    assert_eq!(counters.retries, 1);
    assert_eq!(counters.failures, 0);
}

#[tokio::test]
async fn test_gives_up_after_max_attempts() {
    let mock_server = setup_mock_server().await;

    mock_with_auth("/repos/acme/widgets/pulls", "GET")
        .respond_with(error_response(503, "Service Unavailable"))
        .expect(3)
        .mount(&mock_server)
        .await;

    let client = client(&mock_server);
    let err = client
        .get_json("/repos/acme/widgets/pulls", EndpointKind::Pulls)
        .await
        .unwrap_err();

    assert_eq!(*err.kind(), CollectorErrorKind::RetryExhausted);
    assert_eq!(err.status_code(), Some(503));
    assert!(err.is_retryable());
    assert_eq!(client.metrics().endpoint_snapshot(EndpointKind::Pulls).failures, 1);
}

#[tokio::test]
async fn test_secondary_limit_waits_then_succeeds() {
    let mock_server = setup_mock_server().await;

    mock_with_auth("/repos/acme/widgets/issues", "GET")
        .respond_with(
            ResponseTemplate::new(429)
                .insert_header("retry-after", "0")
                .set_body_json(json!({"message": "You have exceeded a secondary rate limit."})),
        )
        .up_to_n_times(1)
        .mount(&mock_server)
        .await;
    mock_with_auth("/repos/acme/widgets/issues", "GET")
        .respond_with(success_response(json!([])))
        .mount(&mock_server)
        .await;

    let client = client(&mock_server);
    let fetch = client
        .get_json("/repos/acme/widgets/issues", EndpointKind::Issues)
        .await
        .unwrap();

    assert!(matches!(fetch, Fetch::Found(_)));
    assert_eq!(client.metrics().throttled_requests(), 1);
    assert_eq!(client.metrics().retried_requests(), 0);
    assert_eq!(client.metrics().endpoint_snapshot(EndpointKind::Issues).throttle_waits, 1);
}

#[tokio::test]
async fn test_missing_and_forbidden_resources_are_absent() {
    let mock_server = setup_mock_server().await;

    mock_with_auth("/repos/acme/gone/branches/main/protection", "GET")
        .respond_with(error_response(404, "Branch not protected"))
        .expect(1)
        .mount(&mock_server)
        .await;
    mock_with_auth("/repos/acme/widgets/vulnerability-alerts", "GET")
        .respond_with(error_response(403, "Must have admin rights to Repository."))
        .expect(1)
        .mount(&mock_server)
        .await;

    let client = client(&mock_server);
    let missing = client
        .get_json("/repos/acme/gone/branches/main/protection", EndpointKind::BranchProtection)
        .await
        .unwrap();
    let forbidden = client
        .get_json("/repos/acme/widgets/vulnerability-alerts", EndpointKind::SecurityFeatures)
        .await
        .unwrap();

    assert!(matches!(missing, Fetch::Absent { status: 404 }));
    assert!(matches!(forbidden, Fetch::Absent { status: 403 }));
    assert_eq!(client.metrics().retried_requests(), 0);
}

#[tokio::test]
async fn test_client_error_is_not_retried() {
    let mock_server = setup_mock_server().await;

    mock_with_auth("/repos/acme/widgets/commits", "GET")
        .respond_with(
            error_response(422, "Validation Failed").insert_header("x-github-request-id", "ABCD:1234"),
        )
        .expect(1)
        .mount(&mock_server)
        .await;

    let err = client(&mock_server)
        .get_json("/repos/acme/widgets/commits", EndpointKind::Commits)
        .await
        .unwrap_err();

    assert_eq!(*err.kind(), CollectorErrorKind::UnprocessableEntity);
    assert_eq!(err.message(), "Validation Failed");
    assert_eq!(err.request_id(), Some("ABCD:1234"));
    assert!(!err.is_retryable());
    assert!(!err.is_fatal_global());
}

#[tokio::test]
async fn test_bad_credentials_are_fatal() {
    let mock_server = setup_mock_server().await;

    Mock::given(method("GET"))
        .and(path("/rate_limit"))
        .respond_with(error_response(401, "Bad credentials"))
        .expect(1)
        .mount(&mock_server)
        .await;

    let err = client(&mock_server).verify_authentication().await.unwrap_err();

    assert_eq!(*err.kind(), CollectorErrorKind::BadCredentials);
    assert!(err.is_fatal_global());
}

#[tokio::test]
async fn test_authentication_seeds_quota() {
    let mock_server = setup_mock_server().await;
    mount_rate_limit(&mock_server).await;

    let client = client(&mock_server);
    client.verify_authentication().await.unwrap();

    let rest = client.throttle().snapshot(Surface::Rest).quota.unwrap();
    assert_eq!(rest.limit, 5000);
    assert_eq!(rest.remaining, 4999);
    let graphql = client.throttle().snapshot(Surface::GraphQl).quota.unwrap();
    assert_eq!(graphql.remaining, 5000);
}

#[tokio::test]
async fn test_rate_limit_endpoint_missing_is_accepted() {
    let mock_server = setup_mock_server().await;

    mock_with_auth("/rate_limit", "GET")
        .respond_with(error_response(404, "Rate limiting is not enabled."))
        .mount(&mock_server)
        .await;

    let client = client(&mock_server);
    client.verify_authentication().await.unwrap();
    assert!(client.throttle().snapshot(Surface::Rest).quota.is_none());
}

#[tokio::test]
async fn test_graphql_rate_limited_payload_is_retried() {
    let mock_server = setup_mock_server().await;

    mock_with_auth("/graphql", "POST")
        .respond_with(success_response(json!({
            "errors": [{"type": "RATE_LIMITED", "message": "API rate limit exceeded"}]
        })))
        .up_to_n_times(1)
        .mount(&mock_server)
        .await;
    mock_with_auth("/graphql", "POST")
        .and(body_partial_json(json!({"variables": {"owner": "acme", "name": "widgets"}})))
        .respond_with(success_response(json!({
            "data": {"repository": {"nameWithOwner": "acme/widgets"}}
        })))
        .mount(&mock_server)
        .await;

    let client = client(&mock_server);
    let fetch = client
        .graphql(
            "query($owner: String!, $name: String!) { repository(owner: $owner, name: $name) { nameWithOwner } }",
            json!({"owner": "acme", "name": "widgets"}),
            EndpointKind::RepoMetadata,
        )
        .await
        .unwrap();

    let response = fetch.into_found().unwrap();
    assert_eq!(response.body["repository"]["nameWithOwner"], "acme/widgets");
    assert_eq!(client.metrics().throttled_requests(), 1);
}

#[tokio::test]
async fn test_graphql_unresolvable_repository_is_absent() {
    let mock_server = setup_mock_server().await;

    mock_with_auth("/graphql", "POST")
        .respond_with(success_response(json!({
            "data": {"repository": null},
            "errors": [{
                "type": "NOT_FOUND",
                "path": ["repository"],
                "message": "Could not resolve to a Repository with the name 'acme/gone'."
            }]
        })))
        .mount(&mock_server)
        .await;

    let fetch = client(&mock_server)
        .graphql("query { repository(owner: \"acme\", name: \"gone\") { id } }", json!({}), EndpointKind::RepoMetadata)
        .await
        .unwrap();

    assert!(fetch.is_absent());
}

#[tokio::test]
async fn test_typed_graphql_query() {
    #[derive(serde::Deserialize)]
    #[serde(rename_all = "camelCase")]
    struct RepositoryData {
        repository: Option<Repository>,
    }

    #[derive(serde::Deserialize)]
    #[serde(rename_all = "camelCase")]
    struct Repository {
        name_with_owner: String,
        is_archived: bool,
    }

    let mock_server = setup_mock_server().await;

    mock_with_auth("/graphql", "POST")
        .respond_with(success_response(json!({
            "data": {"repository": {"nameWithOwner": "acme/widgets", "isArchived": false}}
        })))
        .expect(1)
        .mount(&mock_server)
        .await;

    let client = client(&mock_server);
    let data: RepositoryData = GraphQLService::new(&client)
        .query(
            "query { repository(owner: \"acme\", name: \"widgets\") { nameWithOwner isArchived } }",
            json!({}),
            EndpointKind::RepoMetadata,
        )
        .await
        .unwrap()
        .unwrap();

    let repository = data.repository.unwrap();
    assert_eq!(repository.name_with_owner, "acme/widgets");
    assert!(!repository.is_archived);
}

#[tokio::test]
async fn test_rejected_graphql_query_is_a_query_error() {
    let mock_server = setup_mock_server().await;

    mock_with_auth("/graphql", "POST")
        .respond_with(success_response(json!({
            "errors": [{"message": "Field 'nope' doesn't exist on type 'Repository'"}]
        })))
        .expect(1)
        .mount(&mock_server)
        .await;

    let err = client(&mock_server)
        .graphql("query { repository(owner: \"acme\", name: \"widgets\") { nope } }", json!({}), EndpointKind::RepoMetadata)
        .await
        .unwrap_err();

    assert_eq!(*err.kind(), CollectorErrorKind::QueryError);
    assert!(err.message().contains("nope"));
    assert!(!err.is_retryable());
}

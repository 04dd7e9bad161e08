//! Pagination over Link headers and GraphQL connections, and a collector
//! consuming a paged listing.

use super::*;
use integrations_github_collector::collectors::{CollectContext, PullsCollector, UnitCollector};
use integrations_github_collector::{EndpointKind, GitHubClient, PageStream, RawStore, RepoTarget, Surface};
use pretty_assertions::assert_eq;
use serde_json::json;
use std::sync::Arc;
use wiremock::matchers::{body_partial_json, query_param};
use wiremock::ResponseTemplate;

fn link_next(server: &wiremock::MockServer, route: &str, page: u32) -> String {
    format!(r#"<{}{}?per_page=100&page={}>; rel="next""#, server.uri(), route, page)
}

#[tokio::test]
async fn test_rest_stream_follows_link_headers() {
    let mock_server = setup_mock_server().await;
    let dir = tempfile::tempdir().unwrap();
    let route = "/repos/acme/widgets/commits";

    for (page, next) in [(1u32, Some(2u32)), (2, Some(3)), (3, None)] {
        let mut response = success_response(json!([
            {"sha": format!("a{}", page)},
            {"sha": format!("b{}", page)}
        ]));
        if let Some(next) = next {
            response = response.insert_header("link", link_next(&mock_server, route, next).as_str());
        }
        mock_with_auth(route, "GET")
            .and(query_param("page", page.to_string().as_str()))
            .respond_with(response)
            .expect(1)
            .mount(&mock_server)
            .await;
    }

    let client = GitHubClient::new(test_config(&mock_server, dir.path()).organization("acme").build().unwrap()).unwrap();
    let mut stream = PageStream::rest(&client, route, EndpointKind::Commits);

    let mut numbers = Vec::new();
    let mut shas = Vec::new();
    while let Some(page) = stream.next_page().await.unwrap() {
        assert_eq!(page.surface, Surface::Rest);
        numbers.push(page.number);
        shas.extend(page.items.iter().map(|c| c["sha"].as_str().unwrap().to_string()));
    }

    assert_eq!(numbers, vec![1, 2, 3]);
    assert_eq!(shas, vec!["a1", "b1", "a2", "b2", "a3", "b3"]);
    assert!(!stream.has_more());
    assert!(!stream.was_absent());
    assert_eq!(stream.pages_fetched(), 3);
    assert_eq!(client.metrics().endpoint_snapshot(EndpointKind::Commits).pages, 3);
}

#[tokio::test]
async fn test_rest_stream_absent_resource_yields_nothing() {
    let mock_server = setup_mock_server().await;
    let dir = tempfile::tempdir().unwrap();

    mock_with_auth("/repos/acme/private/pulls", "GET")
        .respond_with(error_response(404, "Not Found"))
        .expect(1)
        .mount(&mock_server)
        .await;

    let client = GitHubClient::new(test_config(&mock_server, dir.path()).organization("acme").build().unwrap()).unwrap();
    let mut stream = PageStream::rest(&client, "/repos/acme/private/pulls", EndpointKind::Pulls);

    assert!(stream.next_page().await.unwrap().is_none());
    assert!(stream.was_absent());
    assert_eq!(stream.pages_fetched(), 0);
    assert!(stream.next_page().await.unwrap().is_none());
}

#[tokio::test]
async fn test_rest_stream_vanishing_after_first_page_is_not_absent() {
    let mock_server = setup_mock_server().await;
    let dir = tempfile::tempdir().unwrap();
    let route = "/repos/acme/widgets/pulls";

    mock_with_auth(route, "GET")
        .and(query_param("page", "1"))
        .respond_with(
            success_response(json!([{"number": 1}, {"number": 2}]))
                .insert_header("link", link_next(&mock_server, route, 2).as_str()),
        )
        .expect(1)
        .mount(&mock_server)
        .await;
    mock_with_auth(route, "GET")
        .and(query_param("page", "2"))
        .respond_with(error_response(404, "Not Found"))
        .expect(1)
        .mount(&mock_server)
        .await;

    let client = GitHubClient::new(test_config(&mock_server, dir.path()).organization("acme").build().unwrap()).unwrap();
    let mut stream = PageStream::rest(&client, route, EndpointKind::Pulls);

    let first = stream.next_page().await.unwrap().unwrap();
    assert_eq!(first.items.len(), 2);
    assert!(stream.next_page().await.unwrap().is_none());
    assert!(!stream.was_absent());
    assert!(!stream.has_more());
    assert_eq!(stream.pages_fetched(), 1);
}

#[tokio::test]
async fn test_graphql_stream_follows_cursor() {
    let mock_server = setup_mock_server().await;
    let dir = tempfile::tempdir().unwrap();

    mock_with_auth("/graphql", "POST")
        .respond_with(success_response(json!({
            "data": {"repository": {"labels": {
                "nodes": [{"name": "bug"}, {"name": "docs"}],
                "pageInfo": {"hasNextPage": true, "endCursor": "Y3Vyc29yOjI="}
            }}}
        })))
        .up_to_n_times(1)
        .mount(&mock_server)
        .await;
    mock_with_auth("/graphql", "POST")
        .and(body_partial_json(json!({"variables": {"after": "Y3Vyc29yOjI="}})))
        .respond_with(success_response(json!({
            "data": {"repository": {"labels": {
                "nodes": [{"name": "security"}],
                "pageInfo": {"hasNextPage": false, "endCursor": "Y3Vyc29yOjM="}
            }}}
        })))
        .expect(1)
        .mount(&mock_server)
        .await;

    let client = GitHubClient::new(test_config(&mock_server, dir.path()).organization("acme").build().unwrap()).unwrap();
    let query = "query($owner: String!, $name: String!, $after: String) { repository(owner: $owner, name: $name) { labels(first: 100, after: $after) { nodes { name } pageInfo { hasNextPage endCursor } } } }";
    let stream = PageStream::graphql(
        &client,
        query,
        json!({"owner": "acme", "name": "widgets", "after": null}),
        &["repository", "labels"],
        EndpointKind::RepoMetadata,
    );

    let labels: Vec<String> = stream
        .collect_all()
        .await
        .unwrap()
        .iter()
        .map(|l| l["name"].as_str().unwrap().to_string())
        .collect();
    assert_eq!(labels, vec!["bug", "docs", "security"]);
}

#[tokio::test]
async fn test_pulls_stop_at_window_start() {
    let mock_server = setup_mock_server().await;
    let dir = tempfile::tempdir().unwrap();
    let (since, until) = window();
    let route = "/repos/acme/widgets/pulls";

    mock_with_auth(route, "GET")
        .and(query_param("page", "1"))
        .and(query_param("state", "all"))
        .and(query_param("sort", "updated"))
        .and(query_param("direction", "desc"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!([
                    {"number": 12, "updated_at": api_time(until + chrono::Duration::hours(1))},
                    {"number": 11, "updated_at": api_time(until - chrono::Duration::days(1))},
                    {"number": 10, "updated_at": api_time(since + chrono::Duration::days(1))},
                    {"number": 9, "updated_at": api_time(since - chrono::Duration::days(1))}
                ]))
                .insert_header("link", link_next(&mock_server, route, 2).as_str()),
        )
        .expect(1)
        .mount(&mock_server)
        .await;
    mock_with_auth(route, "GET")
        .and(query_param("page", "2"))
        .respond_with(success_response(json!([{"number": 8}])))
        .expect(0)
        .mount(&mock_server)
        .await;

    let client = GitHubClient::new(test_config(&mock_server, dir.path()).organization("acme").build().unwrap()).unwrap();
    let store = RawStore::new(dir.path());
    let ctx = CollectContext::new(Arc::new(client), store.clone());
    let repo = RepoTarget::new("acme", "widgets");

    let report = PullsCollector.collect(&ctx, &repo).await.unwrap();
    assert_eq!(report.records, 2);
    assert_eq!(report.pages, 1);
    assert!(!report.absent);

    let records = store.read_records("acme/widgets", EndpointKind::Pulls).await.unwrap();
    assert_eq!(records.len(), 2);
    assert!(records.iter().all(|r| r.page == 1 && r.endpoint == route));
    assert_eq!(store.read_numbers("acme/widgets", EndpointKind::Pulls).await.unwrap(), vec![10, 11]);
}

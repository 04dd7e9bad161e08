//! Pagination over both API surfaces.
//!
//! A [`PageStream`] is a finite, lazily fetched sequence of pages for one
//! logical query. REST streams follow the `Link: rel="next"` URL; GraphQL
//! streams follow `pageInfo.endCursor` of one connection.

use crate::client::{ApiRequest, Fetch, GitHubClient};
use crate::errors::CollectorResult;
use crate::types::{EndpointKind, Surface};
use reqwest::header::HeaderMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

/// Pagination links parsed from Link header.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PaginationLinks {
    /// URL for the next page.
    pub next: Option<String>,
    /// URL for the previous page.
    pub prev: Option<String>,
    /// URL for the first page.
    pub first: Option<String>,
    /// URL for the last page.
    pub last: Option<String>,
}

impl PaginationLinks {
    /// Parses pagination links from the Link header (RFC 8288).
    pub fn from_header(header_value: &str) -> Self {
        let mut links = Self::default();

        for part in header_value.split(',') {
            let mut url = None;
            let mut rel = None;

            for segment in part.split(';') {
                let segment = segment.trim();
                if segment.starts_with('<') && segment.ends_with('>') {
                    url = Some(segment[1..segment.len() - 1].to_string());
                } else if let Some(value) = segment.strip_prefix("rel=") {
                    rel = Some(value.trim_matches('"').to_string());
                }
            }

            if let (Some(url), Some(rel)) = (url, rel) {
                match rel.as_str() {
                    "next" => links.next = Some(url),
                    "prev" => links.prev = Some(url),
                    "first" => links.first = Some(url),
                    "last" => links.last = Some(url),
                    _ => {}
                }
            }
        }

        links
    }

    /// Parses pagination links from response headers.
    pub fn from_headers(headers: &HeaderMap) -> Self {
        headers
            .get("link")
            .and_then(|v| v.to_str().ok())
            .map(Self::from_header)
            .unwrap_or_default()
    }

    /// Returns true if there is a next page.
    pub fn has_next(&self) -> bool {
        self.next.is_some()
    }

    /// Gets the total page count from the last link.
    pub fn total_pages(&self) -> Option<u32> {
        self.last.as_deref().and_then(extract_page_number)
    }
}

/// GraphQL connection page info.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PageInfo {
    /// Whether there are more pages.
    #[serde(default)]
    pub has_next_page: bool,
    /// Cursor of the last item.
    pub end_cursor: Option<String>,
}

/// One page of raw items.
#[derive(Debug, Clone)]
pub struct Page {
    /// Items, untouched.
    pub items: Vec<Value>,
    /// 1-based page number within the stream.
    pub number: u32,
    /// Surface the page came from.
    pub surface: Surface,
    /// Correlation id of the response.
    pub correlation_id: String,
}

impl Page {
    /// Returns the number of items in this page.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Returns true if the page is empty.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

#[derive(Debug, Clone)]
enum Cursor {
    Rest {
        request: ApiRequest,
        items_key: Option<String>,
    },
    GraphQl {
        query: String,
        variables: Value,
        connection: Vec<String>,
    },
}

/// Lazy page sequence for one logical query.
///
/// The stream ends with `Ok(None)`. A resource that turns out to be absent
/// ends the stream without error; [`PageStream::was_absent`] is set only when
/// that happens before the first page. Errors end it with `Err`.
pub struct PageStream<'a> {
    client: &'a GitHubClient,
    endpoint: EndpointKind,
    cursor: Cursor,
    page: u32,
    exhausted: bool,
    was_absent: bool,
}

impl<'a> PageStream<'a> {
    /// Starts a REST stream at page 1.
    pub fn rest(client: &'a GitHubClient, path: impl Into<String>, endpoint: EndpointKind) -> Self {
        let per_page = client.config().output.per_page.min(100);
        let request = ApiRequest::get(path)
            .for_endpoint(endpoint)
            .with_query("per_page", per_page)
            .with_query("page", 1);
        Self::new(
            client,
            endpoint,
            Cursor::Rest {
                request,
                items_key: None,
            },
        )
    }

    /// Starts a GraphQL stream over the connection at `connection` (a path of
    /// field names below `data`). The cursor is passed as `$after`.
    pub fn graphql(
        client: &'a GitHubClient,
        query: impl Into<String>,
        variables: Value,
        connection: &[&str],
        endpoint: EndpointKind,
    ) -> Self {
        Self::new(
            client,
            endpoint,
            Cursor::GraphQl {
                query: query.into(),
                variables,
                connection: connection.iter().map(|s| s.to_string()).collect(),
            },
        )
    }

    fn new(client: &'a GitHubClient, endpoint: EndpointKind, cursor: Cursor) -> Self {
        Self {
            client,
            endpoint,
            cursor,
            page: 0,
            exhausted: false,
            was_absent: false,
        }
    }

    /// Adds a query parameter to the first REST request.
    pub fn with_query(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        if let Cursor::Rest { request, .. } = &mut self.cursor {
            request.query.push((key.into(), value.to_string()));
        }
        self
    }

    /// Adds every field of a serializable value to the first REST request.
    pub fn with_params<P: Serialize>(mut self, params: &P) -> CollectorResult<Self> {
        if let Cursor::Rest { request, .. } = &mut self.cursor {
            *request = request.clone().with_params(params)?;
        }
        Ok(self)
    }

    /// Reads items from this field of a REST object body instead of the body itself.
    pub fn items_key(mut self, key: impl Into<String>) -> Self {
        if let Cursor::Rest { items_key, .. } = &mut self.cursor {
            *items_key = Some(key.into());
        }
        self
    }

    /// Returns true if there may be more pages.
    pub fn has_more(&self) -> bool {
        !self.exhausted
    }

    /// Returns true if the stream ended because the resource was absent.
    pub fn was_absent(&self) -> bool {
        self.was_absent
    }

    /// Pages fetched so far.
    pub fn pages_fetched(&self) -> u32 {
        self.page
    }

    /// Stops the stream; later calls to [`PageStream::next_page`] return `None`.
    pub fn finish_early(&mut self) {
        self.exhausted = true;
    }

    /// Fetches the next page.
    pub async fn next_page(&mut self) -> CollectorResult<Option<Page>> {
        if self.exhausted {
            return Ok(None);
        }

        let result = match &mut self.cursor {
            Cursor::Rest { request, items_key } => {
                let fetch = self.client.execute(request).await?;
                match fetch {
                    Fetch::Found(response) => {
                        let items = rest_items(response.body, items_key.as_deref());
                        match response.links.next {
                            Some(next) => {
                                *request = ApiRequest::get(next).for_endpoint(self.endpoint);
                            }
                            None => self.exhausted = true,
                        }
                        Some((items, Surface::Rest, response.correlation_id))
                    }
                    Fetch::Absent { status } => {
                        debug!(endpoint = %self.endpoint, status = status, "Stream resource absent");
                        None
                    }
                }
            }
            Cursor::GraphQl {
                query,
                variables,
                connection,
            } => {
                let fetch = self
                    .client
                    .graphql(query, variables.clone(), self.endpoint)
                    .await?;
                match fetch {
                    Fetch::Found(response) => {
                        let node = connection
                            .iter()
                            .fold(&response.body, |value, key| &value[key.as_str()]);
                        let items = connection_items(node);
                        let info: PageInfo = node
                            .get("pageInfo")
                            .cloned()
                            .and_then(|v| serde_json::from_value(v).ok())
                            .unwrap_or_default();

                        match info.end_cursor {
                            Some(cursor) if info.has_next_page => {
                                variables["after"] = Value::String(cursor);
                            }
                            _ => self.exhausted = true,
                        }
                        Some((items, Surface::GraphQl, response.correlation_id))
                    }
                    Fetch::Absent { status } => {
                        debug!(endpoint = %self.endpoint, status = status, "Query target absent");
                        None
                    }
                }
            }
        };

        match result {
            Some((items, surface, correlation_id)) => {
                self.page += 1;
                self.client.metrics().record_page(self.endpoint);
                Ok(Some(Page {
                    items,
                    number: self.page,
                    surface,
                    correlation_id,
                }))
            }
            None => {
                // A listing that vanishes mid-stream still produced data.
                self.exhausted = true;
                self.was_absent = self.page == 0;
                Ok(None)
            }
        }
    }

    /// Collects all items from all pages.
    pub async fn collect_all(mut self) -> CollectorResult<Vec<Value>> {
        let mut all_items = Vec::new();

        while let Some(page) = self.next_page().await? {
            all_items.extend(page.items);
        }

        Ok(all_items)
    }
}

fn rest_items(body: Value, items_key: Option<&str>) -> Vec<Value> {
    let body = match items_key {
        Some(key) => match body {
            Value::Object(mut map) => map.remove(key).unwrap_or(Value::Null),
            _ => Value::Null,
        },
        None => body,
    };
    match body {
        Value::Array(items) => items,
        Value::Null => Vec::new(),
        single => vec![single],
    }
}

fn connection_items(connection: &Value) -> Vec<Value> {
    if let Some(nodes) = connection.get("nodes").and_then(Value::as_array) {
        return nodes.iter().filter(|n| !n.is_null()).cloned().collect();
    }
    connection
        .get("edges")
        .and_then(Value::as_array)
        .map(|edges| {
            edges
                .iter()
                .filter_map(|e| e.get("node"))
                .filter(|n| !n.is_null())
                .cloned()
                .collect()
        })
        .unwrap_or_default()
}

/// Extracts page number from a URL.
pub fn extract_page_number(url: &str) -> Option<u32> {
    url::Url::parse(url).ok().and_then(|u| {
        u.query_pairs()
            .find(|(k, _)| k == "page")
            .and_then(|(_, v)| v.parse().ok())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_link_header() {
        let header = r#"<https://api.github.com/repos?page=2>; rel="next", <https://api.github.com/repos?page=5>; rel="last""#;
        let links = PaginationLinks::from_header(header);

        assert_eq!(links.next, Some("https://api.github.com/repos?page=2".to_string()));
        assert_eq!(links.last, Some("https://api.github.com/repos?page=5".to_string()));
        assert!(links.prev.is_none());
        assert!(links.first.is_none());
        assert_eq!(links.total_pages(), Some(5));
    }

    #[test]
    fn test_parse_full_link_header() {
        let header = r#"<https://api.github.com/repos?page=1>; rel="first", <https://api.github.com/repos?page=2>; rel="prev", <https://api.github.com/repos?page=4>; rel="next", <https://api.github.com/repos?page=5>; rel="last""#;
        let links = PaginationLinks::from_header(header);

        assert!(links.first.is_some());
        assert!(links.prev.is_some());
        assert!(links.has_next());
        assert!(links.last.is_some());
    }

    #[test]
    fn test_rest_items_shapes() {
        assert_eq!(rest_items(json!([1, 2]), None).len(), 2);
        assert!(rest_items(Value::Null, None).is_empty());
        assert_eq!(rest_items(json!({"enabled": true}), None), vec![json!({"enabled": true})]);
        assert_eq!(
            rest_items(json!({"total_count": 1, "items": [{"id": 7}]}), Some("items")),
            vec![json!({"id": 7})]
        );
        assert!(rest_items(json!({"total_count": 0}), Some("items")).is_empty());
    }

    #[test]
    fn test_connection_items() {
        let nodes = json!({"nodes": [{"id": 1}, null, {"id": 2}]});
        assert_eq!(connection_items(&nodes).len(), 2);

        let edges = json!({"edges": [{"node": {"id": 1}}, {"cursor": "x"}]});
        assert_eq!(connection_items(&edges), vec![json!({"id": 1})]);

        assert!(connection_items(&Value::Null).is_empty());
    }

    #[test]
    fn test_page_info_deserialize() {
        let info: PageInfo =
            serde_json::from_value(json!({"hasNextPage": true, "endCursor": "Y3Vyc29y"})).unwrap();
        assert!(info.has_next_page);
        assert_eq!(info.end_cursor.as_deref(), Some("Y3Vyc29y"));
    }
}

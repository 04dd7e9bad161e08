//! GraphQL access to GitHub's GraphQL API v4.

use crate::client::{Fetch, GitHubClient};
use crate::errors::{CollectorError, CollectorErrorKind, CollectorResult};
use crate::types::EndpointKind;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// GraphQL service over a shared client.
pub struct GraphQLService<'a> {
    client: &'a GitHubClient,
}

impl<'a> GraphQLService<'a> {
    /// Creates a new GraphQL service.
    pub fn new(client: &'a GitHubClient) -> Self {
        Self { client }
    }

    /// Executes a query and deserializes its `data` member.
    ///
    /// `None` when the queried object is absent for this token.
    pub async fn query<T: DeserializeOwned>(
        &self,
        query: &str,
        variables: Value,
        endpoint: EndpointKind,
    ) -> CollectorResult<Option<T>> {
        let response = match self.execute_raw(query, variables, endpoint).await? {
            Fetch::Found(response) => response,
            Fetch::Absent { .. } => return Ok(None),
        };
        serde_json::from_value(response.body).map(Some).map_err(|e| {
            let error = CollectorError::new(
                CollectorErrorKind::DeserializationError,
                format!("Unexpected GraphQL data shape: {}", e),
            )
            .with_status(response.status)
            .with_cause(e);
            match response.request_id {
                Some(id) => error.with_request_id(id),
                None => error,
            }
        })
    }

    /// Executes a query and returns the raw `data` member.
    pub async fn execute_raw(
        &self,
        query: &str,
        variables: Value,
        endpoint: EndpointKind,
    ) -> CollectorResult<Fetch> {
        self.client.graphql(query, variables, endpoint).await
    }
}

/// GraphQL error item.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GraphQLError {
    /// Error message.
    #[serde(default)]
    pub message: String,
    /// Error type (e.g., "RATE_LIMITED", "NOT_FOUND").
    #[serde(rename = "type")]
    pub error_type: Option<String>,
    /// Path to the field that caused the error.
    pub path: Option<Vec<Value>>,
    /// Additional error extensions.
    pub extensions: Option<HashMap<String, Value>>,
}

impl GraphQLError {
    /// Returns true for the error type GitHub uses when the query budget is spent.
    pub fn is_rate_limited(&self) -> bool {
        self.error_type.as_deref() == Some("RATE_LIMITED")
    }

    /// Returns true for errors that mean "the object is not there for this token".
    pub fn is_absent(&self) -> bool {
        matches!(self.error_type.as_deref(), Some("NOT_FOUND") | Some("FORBIDDEN"))
    }

    /// Dotted field path, e.g. `repository.pullRequests`.
    pub fn path_string(&self) -> Option<String> {
        self.path.as_ref().map(|p| {
            p.iter()
                .map(|v| match v {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                })
                .collect::<Vec<_>>()
                .join(".")
        })
    }
}

/// Parses the `errors` member of a GraphQL payload; malformed items are skipped.
pub fn parse_errors(body: &Value) -> Vec<GraphQLError> {
    body.get("errors")
        .and_then(Value::as_array)
        .map(|errors| {
            errors
                .iter()
                .filter_map(|e| serde_json::from_value(e.clone()).ok())
                .collect()
        })
        .unwrap_or_default()
}

/// Returns true if every top-level field of `data` is null or `data` is missing.
pub fn data_is_empty(body: &Value) -> bool {
    match body.get("data") {
        None | Some(Value::Null) => true,
        Some(Value::Object(fields)) => fields.values().all(Value::is_null),
        Some(_) => false,
    }
}

// Query source module - executes resource graph queries page by page
//
// The probe handler only depends on the `QueryExecutor` trait, so the remote
// API can be swapped for a stub in tests. `ResourceGraphExecutor` talks to the
// Azure Resource Graph REST API with a caller-supplied bearer token.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::value::{Row, RowValue};

const RESOURCEGRAPH_API_VERSION: &str = "2021-03-01";

const QUOTA_REMAINING_HEADER: &str = "x-ms-user-quota-remaining";

/// Errors that can occur while executing a query
#[derive(Error, Debug)]
pub enum QueryError {
    #[error("query request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("query API returned status {status}: {body}")]
    Status { status: u16, body: String },
}

/// One page request of a query
#[derive(Debug, Clone, PartialEq)]
pub struct QueryRequest {
    pub query: String,
    /// Subscriptions to query; empty lets the API use every accessible one
    pub subscriptions: Vec<String>,
    pub skip: u32,
    pub top: u32,
}

/// One page of query results
#[derive(Debug, Clone, Default)]
pub struct QueryPage {
    /// Total number of records of the whole query, across all pages
    pub total_records: u64,
    pub rows: Vec<Row>,
    /// Remaining request quota reported by the API, if any
    pub quota_remaining: Option<i64>,
}

/// Source of result rows for the probe handler
#[async_trait]
pub trait QueryExecutor: Send + Sync {
    /// Executes one page of a query
    ///
    /// # Returns
    /// * `Ok(QueryPage)` - Rows of the requested page plus the total record count
    /// * `Err(QueryError)` - Transport failure or non-success response
    async fn execute(&self, request: &QueryRequest) -> Result<QueryPage, QueryError>;
}

#[derive(Serialize)]
struct ResourceGraphRequest<'a> {
    #[serde(skip_serializing_if = "<[String]>::is_empty")]
    subscriptions: &'a [String],
    query: &'a str,
    options: ResourceGraphOptions,
}

#[derive(Serialize)]
struct ResourceGraphOptions {
    #[serde(rename = "$top")]
    top: u32,
    #[serde(rename = "$skip")]
    skip: u32,
    #[serde(rename = "resultFormat")]
    result_format: &'static str,
}

#[derive(Deserialize)]
struct ResourceGraphResponse {
    #[serde(rename = "totalRecords", default)]
    total_records: u64,
    #[serde(default)]
    data: serde_json::Value,
}

impl ResourceGraphResponse {
    /// Result rows of an `objectArray` response; anything else yields no rows
    fn into_page(self, quota_remaining: Option<i64>) -> QueryPage {
        let rows = match self.data {
            serde_json::Value::Array(items) => items
                .into_iter()
                .filter_map(|item| match RowValue::from(item) {
                    RowValue::Object(row) => Some(row),
                    _ => None,
                })
                .collect(),
            _ => Vec::new(),
        };

        QueryPage {
            total_records: self.total_records,
            rows,
            quota_remaining,
        }
    }
}

/// Azure Resource Graph REST client
pub struct ResourceGraphExecutor {
    client: Client,
    endpoint: String,
    token: Option<String>,
}

impl ResourceGraphExecutor {
    /// Creates a new executor
    ///
    /// # Arguments
    /// * `endpoint` - Resource manager endpoint, e.g. `https://management.azure.com`
    /// * `token` - Bearer token sent with every request, if any
    pub fn new(endpoint: &str, token: Option<String>) -> Result<Self, QueryError> {
        let client = Client::builder()
            .user_agent(concat!("resourcegraph-exporter/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(ResourceGraphExecutor {
            client,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            token,
        })
    }

    fn url(&self) -> String {
        format!(
            "{}/providers/Microsoft.ResourceGraph/resources?api-version={}",
            self.endpoint, RESOURCEGRAPH_API_VERSION
        )
    }
}

#[async_trait]
impl QueryExecutor for ResourceGraphExecutor {
    async fn execute(&self, request: &QueryRequest) -> Result<QueryPage, QueryError> {
        let body = ResourceGraphRequest {
            subscriptions: &request.subscriptions,
            query: &request.query,
            options: ResourceGraphOptions {
                top: request.top,
                skip: request.skip,
                result_format: "objectArray",
            },
        };

        debug!("executing query page (skip {}, top {})", request.skip, request.top);

        let mut builder = self.client.post(self.url()).json(&body);
        if let Some(token) = &self.token {
            builder = builder.bearer_auth(token);
        }

        let response = builder.send().await?;

        let quota_remaining = response
            .headers()
            .get(QUOTA_REMAINING_HEADER)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.parse::<i64>().ok());

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(QueryError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let result: ResourceGraphResponse = response.json().await?;
        Ok(result.into_page(quota_remaining))
    }
}

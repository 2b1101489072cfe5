//! Graph store adapter (Cypher over the Neo4j HTTP API).
//!
//! One request per query against the transactional commit endpoint
//! (`POST {url}/db/{database}/tx/commit`). Requests carry
//! `access-mode: READ`, so write clauses are refused by the server.
//! Rows are returned as JSON objects keyed by the `RETURN` column names.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;

use crate::config::GraphConfig;
use crate::error::GraphQueryError;
use crate::models::Row;

#[async_trait]
pub trait GraphBackend: Send + Sync {
    /// Run one Cypher statement and return its rows.
    async fn run(&self, cypher: &str) -> Result<Vec<Row>, GraphQueryError>;

    async fn ping(&self) -> Result<(), GraphQueryError> {
        self.run("RETURN 1").await.map(|_| ())
    }
}

/// Used when no `[graph]` section is configured.
pub struct DisabledGraphBackend;

#[async_trait]
impl GraphBackend for DisabledGraphBackend {
    async fn run(&self, _cypher: &str) -> Result<Vec<Row>, GraphQueryError> {
        Err(GraphQueryError::new("graph store is not configured"))
    }
}

pub struct Neo4jHttpBackend {
    endpoint: String,
    user: String,
    password: Option<String>,
    http: reqwest::Client,
}

impl Neo4jHttpBackend {
    /// Build the client. The password is read from `password_env`; when the
    /// variable is unset requests are sent without credentials.
    pub fn new(config: &GraphConfig) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.query_timeout_secs))
            .build()?;

        Ok(Self {
            endpoint: format!(
                "{}/db/{}/tx/commit",
                config.url.trim_end_matches('/'),
                config.database
            ),
            user: config.user.clone(),
            password: std::env::var(&config.password_env).ok(),
            http,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[derive(Deserialize)]
struct TxResponse {
    #[serde(default)]
    results: Vec<TxResult>,
    #[serde(default)]
    errors: Vec<TxError>,
}

#[derive(Deserialize)]
struct TxResult {
    columns: Vec<String>,
    #[serde(default)]
    data: Vec<TxRow>,
}

#[derive(Deserialize)]
struct TxRow {
    row: Vec<Value>,
}

#[derive(Deserialize)]
struct TxError {
    code: String,
    message: String,
}

#[async_trait]
impl GraphBackend for Neo4jHttpBackend {
    async fn run(&self, cypher: &str) -> Result<Vec<Row>, GraphQueryError> {
        debug!(endpoint = %self.endpoint, "running graph query");

        let body = json!({
            "statements": [{ "statement": cypher, "resultDataContents": ["row"] }]
        });

        let mut request = self
            .http
            .post(&self.endpoint)
            .header("access-mode", "READ")
            .json(&body);
        if let Some(password) = &self.password {
            request = request.basic_auth(&self.user, Some(password));
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(GraphQueryError::new(format!("HTTP {}: {}", status, text)));
        }

        let parsed: TxResponse = response.json().await?;
        rows_from_response(parsed)
    }
}

fn rows_from_response(response: TxResponse) -> Result<Vec<Row>, GraphQueryError> {
    if let Some(err) = response.errors.first() {
        return Err(GraphQueryError::new(format!("{}: {}", err.code, err.message)));
    }

    let Some(result) = response.results.into_iter().next() else {
        return Ok(Vec::new());
    };

    Ok(result
        .data
        .into_iter()
        .map(|data| result.columns.iter().cloned().zip(data.row).collect())
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(value: Value) -> Result<Vec<Row>, GraphQueryError> {
        rows_from_response(serde_json::from_value(value).unwrap())
    }

    #[test]
    fn test_rows_keyed_by_columns() {
        let rows = parse(json!({
            "results": [{
                "columns": ["shop", "products"],
                "data": [
                    { "row": ["Alpha", 3], "meta": [null, null] },
                    { "row": ["Beta", 1], "meta": [null, null] }
                ]
            }],
            "errors": []
        }))
        .unwrap();

        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0]["shop"], json!("Alpha"));
        assert_eq!(rows[1]["products"], json!(1));
    }

    #[test]
    fn test_server_errors_become_query_errors() {
        let err = parse(json!({
            "results": [],
            "errors": [{
                "code": "Neo.ClientError.Statement.SyntaxError",
                "message": "Invalid input 'RETRUN'"
            }]
        }))
        .unwrap_err();
        assert!(err.message.contains("SyntaxError"));
        assert!(err.message.contains("RETRUN"));
    }

    #[test]
    fn test_no_results_is_empty() {
        assert!(parse(json!({ "results": [], "errors": [] })).unwrap().is_empty());
    }

    #[test]
    fn test_endpoint_built_from_config() {
        let backend = Neo4jHttpBackend::new(&GraphConfig {
            url: "http://localhost:7474/".into(),
            database: "shop".into(),
            user: "neo4j".into(),
            password_env: "NLQ_TEST_UNSET_PASSWORD".into(),
            query_timeout_secs: 5,
        })
        .unwrap();
        assert_eq!(backend.endpoint(), "http://localhost:7474/db/shop/tx/commit");
    }

    #[tokio::test]
    async fn test_disabled_backend_fails() {
        assert!(DisabledGraphBackend.ping().await.is_err());
    }
}

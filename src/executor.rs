//! Query execution against the backend named by the query's tool.
//!
//! Execution never fails with an error: every backend error, timeout or
//! unsupported tool is reported as [`ExecutionOutcome::Failure`] carrying the
//! message the repair loop will see.

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, instrument, warn};

use crate::config::Config;
use crate::graph::{DisabledGraphBackend, GraphBackend, Neo4jHttpBackend};
use crate::models::{ExecutionOutcome, GeneratedQuery, ToolName};
use crate::render::render_rows;
use crate::tabular::{SqlTabularBackend, TabularBackend};

#[derive(Debug, Clone)]
pub struct ExecutorSettings {
    pub tabular_timeout: Duration,
    pub graph_timeout: Duration,
    pub preview_rows: usize,
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        Self {
            tabular_timeout: Duration::from_secs(15),
            graph_timeout: Duration::from_secs(15),
            preview_rows: 10,
        }
    }
}

/// Result of a connectivity check, for `nlq check`.
#[derive(Debug, Clone)]
pub struct BackendStatus {
    pub backend: &'static str,
    pub result: Result<(), String>,
}

pub struct Executor {
    tabular: Arc<dyn TabularBackend>,
    graph: Arc<dyn GraphBackend>,
    settings: ExecutorSettings,
}

impl Executor {
    pub fn new(
        tabular: Arc<dyn TabularBackend>,
        graph: Arc<dyn GraphBackend>,
        settings: ExecutorSettings,
    ) -> Self {
        Self {
            tabular,
            graph,
            settings,
        }
    }

    /// Build both backends from configuration. A missing `[graph]` section
    /// yields a backend that fails every query.
    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        let tabular = Arc::new(SqlTabularBackend::connect_lazy(&config.tabular)?);
        let (graph, graph_timeout): (Arc<dyn GraphBackend>, u64) = match &config.graph {
            Some(g) => (Arc::new(Neo4jHttpBackend::new(g)?), g.query_timeout_secs),
            None => (Arc::new(DisabledGraphBackend), config.tabular.query_timeout_secs),
        };

        Ok(Self::new(
            tabular,
            graph,
            ExecutorSettings {
                tabular_timeout: Duration::from_secs(config.tabular.query_timeout_secs),
                graph_timeout: Duration::from_secs(graph_timeout),
                preview_rows: config.pipeline.preview_rows,
            },
        ))
    }

    #[instrument(skip_all, fields(tool = %query.chosen_tool))]
    pub async fn execute(&self, query: &GeneratedQuery) -> ExecutionOutcome {
        let rows = match query.chosen_tool {
            ToolName::Tabular => {
                let timeout = self.settings.tabular_timeout;
                match tokio::time::timeout(timeout, self.tabular.run(&query.query)).await {
                    Ok(Ok(rows)) => rows,
                    Ok(Err(e)) => return self.failed(e.to_string()),
                    Err(_) => return self.failed(format!("tabular query timed out after {:?}", timeout)),
                }
            }
            ToolName::Graph => {
                let timeout = self.settings.graph_timeout;
                match tokio::time::timeout(timeout, self.graph.run(&query.query)).await {
                    Ok(Ok(rows)) => rows,
                    Ok(Err(e)) => return self.failed(e.to_string()),
                    Err(_) => return self.failed(format!("graph query timed out after {:?}", timeout)),
                }
            }
            ToolName::Unsupported => {
                return self.failed("unsupported tool: expected tabular_query or graph_query".into())
            }
        };

        info!(rows = rows.len(), "query succeeded");
        let rendered = render_rows(query.chosen_tool, &rows, self.settings.preview_rows);
        ExecutionOutcome::Success { rows, rendered }
    }

    fn failed(&self, message: String) -> ExecutionOutcome {
        warn!(error = %message, "query failed");
        ExecutionOutcome::failure(message)
    }

    /// Check both backends.
    pub async fn check_health(&self) -> Vec<BackendStatus> {
        vec![
            BackendStatus {
                backend: "tabular",
                result: self.tabular.ping().await.map_err(|e| e.to_string()),
            },
            BackendStatus {
                backend: "graph",
                result: self.graph.ping().await.map_err(|e| e.to_string()),
            },
        ]
    }
}

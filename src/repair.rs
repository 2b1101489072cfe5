//! Query repair after a failed execution.
//!
//! One inference call per attempt, given the failing query and the backend's
//! error message. The bound on attempts lives in the pipeline, not here.

use std::sync::Arc;
use std::time::Duration;

use tracing::instrument;

use crate::error::InferenceError;
use crate::grounding::normalize_query;
use crate::inference::{invoke, ChatMessage, InferenceClient};
use crate::models::{GeneratedQuery, RepairedQuery, ToolName};
use crate::schema::SchemaDescriptor;

const INSTRUCTIONS: &str = "\
A database query failed. Fix it using the error message and the schema \
below. Keep the same query language. Return only the corrected query text.";

pub struct Repairer {
    schema: Arc<SchemaDescriptor>,
    client: Arc<dyn InferenceClient>,
    timeout: Duration,
}

impl Repairer {
    pub fn new(
        schema: Arc<SchemaDescriptor>,
        client: Arc<dyn InferenceClient>,
        timeout: Duration,
    ) -> Self {
        Self {
            schema,
            client,
            timeout,
        }
    }

    /// Ask for a corrected version of `failed`. The tool is carried over.
    #[instrument(skip_all, fields(tool = %failed.chosen_tool))]
    pub async fn repair(
        &self,
        failed: &GeneratedQuery,
        error: &str,
    ) -> Result<GeneratedQuery, InferenceError> {
        let system = format!("{}\n\n{}", INSTRUCTIONS, self.schema.render_prompt());
        let messages = [ChatMessage::user(format!(
            "Language: {}\nQuery:\n{}\n\nError:\n{}",
            language(failed.chosen_tool),
            failed.query,
            error
        ))];

        let repaired: RepairedQuery =
            invoke(self.client.as_ref(), &system, &messages, self.timeout).await?;

        Ok(GeneratedQuery {
            thought: format!("repair of previous query after: {}", error),
            chosen_tool: failed.chosen_tool,
            query: normalize_query(failed.chosen_tool, &repaired.query),
        })
    }
}

fn language(tool: ToolName) -> &'static str {
    match tool {
        ToolName::Tabular => "SQL",
        ToolName::Graph => "Cypher",
        ToolName::Unsupported => "unknown",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inference::ScriptedClient;
    use crate::schema::tests::shop_schema;
    use serde_json::json;

    #[tokio::test]
    async fn test_repair_keeps_tool() {
        let client = Arc::new(ScriptedClient::new().respond(
            "RepairedQuery",
            json!({ "query": "MATCH (s:Shop) RETURN s.seller_name;" }),
        ));
        let repairer = Repairer::new(Arc::new(shop_schema()), client.clone(), Duration::from_secs(1));
        let failed = GeneratedQuery {
            thought: String::new(),
            chosen_tool: ToolName::Graph,
            query: "MATCH (s:Shop RETURN s".into(),
        };

        let fixed = repairer.repair(&failed, "Invalid input 'R'").await.unwrap();
        assert_eq!(fixed.chosen_tool, ToolName::Graph);
        assert_eq!(fixed.query, "MATCH (s:Shop) RETURN s.seller_name");

        let sent = &client.calls()[0].messages[0].content;
        assert!(sent.contains("Cypher"));
        assert!(sent.contains("Invalid input 'R'"));
    }

    #[tokio::test]
    async fn test_repair_inference_failure_is_fatal() {
        let client = Arc::new(ScriptedClient::new());
        let repairer = Repairer::new(Arc::new(shop_schema()), client, Duration::from_secs(1));
        let failed = GeneratedQuery {
            thought: String::new(),
            chosen_tool: ToolName::Tabular,
            query: "SELECT".into(),
        };
        assert!(matches!(
            repairer.repair(&failed, "syntax error").await,
            Err(InferenceError::Provider(_))
        ));
    }
}

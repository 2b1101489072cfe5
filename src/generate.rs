//! Query generation for the dispatched plan step.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, instrument, warn};

use crate::error::InferenceError;
use crate::grounding::{check_query, normalize_query, SqlDialect};
use crate::inference::{invoke, ChatMessage, InferenceClient};
use crate::models::{GeneratedQuery, Plan};
use crate::schema::SchemaDescriptor;

const INSTRUCTIONS: &str = "\
You write one database query for the step below. For `tabular_query` write \
SQL; for `graph_query` write Cypher. Use only the tables, columns, labels, \
properties and relationship types in the schema. Return only the query \
text in `query`: no prose, no markdown fences.";

pub struct Generator {
    schema: Arc<SchemaDescriptor>,
    client: Arc<dyn InferenceClient>,
    dialect: SqlDialect,
    timeout: Duration,
}

impl Generator {
    pub fn new(
        schema: Arc<SchemaDescriptor>,
        client: Arc<dyn InferenceClient>,
        dialect: SqlDialect,
        timeout: Duration,
    ) -> Self {
        Self {
            schema,
            client,
            dialect,
            timeout,
        }
    }

    /// Produce a query for the first step of `plan`.
    ///
    /// The result always carries the step's tool, whatever the model
    /// answered. Empty output and references to names outside the schema
    /// fail with [`InferenceError::Invalid`].
    #[instrument(skip_all)]
    pub async fn generate(&self, plan: &Plan) -> Result<GeneratedQuery, InferenceError> {
        let step = plan
            .dispatched_steps()
            .first()
            .ok_or_else(|| InferenceError::Invalid("plan has no steps".into()))?;

        let system = format!("{}\n\n{}", INSTRUCTIONS, self.schema.render_prompt());
        let messages = [ChatMessage::user(format!(
            "Goal: {}\nTool: {}\nStep: {}",
            plan.ultimate_goal, step.tool_name, step.tool_input
        ))];

        let mut generated: GeneratedQuery =
            invoke(self.client.as_ref(), &system, &messages, self.timeout).await?;

        if generated.chosen_tool != step.tool_name {
            warn!(
                proposed = %generated.chosen_tool,
                step_tool = %step.tool_name,
                "re-tagging generated query with the step's tool"
            );
            generated.chosen_tool = step.tool_name;
        }

        generated.query = normalize_query(generated.chosen_tool, &generated.query);
        check_query(&self.schema, self.dialect, generated.chosen_tool, &generated.query)
            .map_err(|v| InferenceError::Invalid(v.to_string()))?;

        debug!(tool = %generated.chosen_tool, query = %generated.query, "generated query");
        Ok(generated)
    }
}

//! Plan construction and tool selection.
//!
//! The model proposes the steps; the choice of backend is decided here
//! from the shape of the [`QueryStructure`]:
//!
//! | Shape | Tool | Strength |
//! |-------|------|----------|
//! | ≥ 2 relations, all graph edges, no aggregation | `graph_query` | required |
//! | any aggregation, or filters without traversal | `tabular_query` | required |
//! | anything else | `tabular_query` | default (hint only) |
//!
//! A required tool overrides whatever the model put on the dispatched step.

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, instrument, warn};

use crate::error::InferenceError;
use crate::inference::{invoke, ChatMessage, InferenceClient};
use crate::models::{Plan, QueryStructure, ToolName};
use crate::schema::SchemaDescriptor;

const INSTRUCTIONS: &str = "\
You plan how to answer a structured database request. Two tools exist: \
`tabular_query` runs SQL against the tabular store (aggregation, filtering, \
sorting over flat records) and `graph_query` runs Cypher against the graph \
store (multi-hop relationship traversal). Return numbered steps starting at \
1, each with the tool to use and a precise instruction for writing the query.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolPreference {
    /// The dispatched step must use this tool.
    Required(ToolName),
    /// Suggested to the model; its choice stands.
    Default(ToolName),
}

impl ToolPreference {
    pub fn tool(&self) -> ToolName {
        match self {
            ToolPreference::Required(t) | ToolPreference::Default(t) => *t,
        }
    }
}

/// Deterministic tool policy for a grounded structure.
pub fn tool_policy(structure: &QueryStructure, schema: &SchemaDescriptor) -> ToolPreference {
    let multi_hop = structure.relations.len() >= 2
        && structure.relations.iter().all(|r| {
            r.relation_name
                .as_deref()
                .is_some_and(|name| schema.is_graph_edge(name))
        });

    if multi_hop && structure.calculations.is_empty() {
        return ToolPreference::Required(ToolName::Graph);
    }

    if !structure.calculations.is_empty()
        || (structure.has_filters() && structure.relations.is_empty())
    {
        return ToolPreference::Required(ToolName::Tabular);
    }

    ToolPreference::Default(ToolName::Tabular)
}

pub struct Planner {
    schema: Arc<SchemaDescriptor>,
    client: Arc<dyn InferenceClient>,
    timeout: Duration,
}

impl Planner {
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

    /// Build a plan whose `ultimate_goal` equals the structure's goal.
    #[instrument(skip_all)]
    pub async fn plan(&self, structure: &QueryStructure) -> Result<Plan, InferenceError> {
        let preference = tool_policy(structure, &self.schema);
        let hint = match preference {
            ToolPreference::Required(t) => format!("The first step MUST use `{}`.", t),
            ToolPreference::Default(t) => format!("Prefer `{}` unless traversal is needed.", t),
        };
        let system = format!(
            "{}\n{}\n\n{}",
            INSTRUCTIONS,
            hint,
            self.schema.render_prompt()
        );
        let request = serde_json::to_string_pretty(structure)
            .map_err(|e| InferenceError::Invalid(e.to_string()))?;
        let messages = [ChatMessage::user(request)];

        let mut plan: Plan =
            invoke(self.client.as_ref(), &system, &messages, self.timeout).await?;
        plan.validate_sequence().map_err(InferenceError::Invalid)?;

        plan.ultimate_goal = structure.ultimate_goal.clone();

        if let ToolPreference::Required(tool) = preference {
            if let Some(step) = plan.steps.first_mut() {
                if step.tool_name != tool {
                    warn!(proposed = %step.tool_name, required = %tool, "overriding planned tool");
                    step.tool_name = tool;
                }
            }
        }

        info!(steps = plan.steps.len(), tool = %plan.steps[0].tool_name, "plan ready");
        Ok(plan)
    }
}

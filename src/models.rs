//! Core data types that flow through the query pipeline.
//!
//! Types that are the target of a structured inference call derive
//! [`JsonSchema`]; their doc comments become the field descriptions the
//! model sees. Every other type is plain request-scoped data.

use schemars::JsonSchema;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::fmt;

/// One result row, keyed by column (or Cypher return) name.
pub type Row = serde_json::Map<String, Value>;

// ═══════════════════════════════════════════════════════════════════════
// Extraction
// ═══════════════════════════════════════════════════════════════════════

/// Comparison operator of a [`Filter`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum Operator {
    #[serde(rename = "=")]
    Eq,
    #[serde(rename = "!=", alias = "<>")]
    Ne,
    #[serde(rename = ">")]
    Gt,
    #[serde(rename = "<")]
    Lt,
    #[serde(rename = ">=")]
    Gte,
    #[serde(rename = "<=")]
    Lte,
    #[serde(rename = "LIKE", alias = "like")]
    Like,
    #[serde(rename = "IN", alias = "in")]
    In,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Filter {
    /// The field/property name to filter on. Must match a name in the
    /// provided schemas; null when it cannot be mapped.
    pub field: Option<String>,
    /// The comparison operator.
    pub operator: Operator,
    /// The value to compare against, as text (e.g. 'Iphone 14 Pro Max', 1000, 99.99).
    #[serde(deserialize_with = "text_from_scalar")]
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct CoreEntity {
    /// The table or node label the user targets (e.g. 'products', 'Category').
    /// Must exist in the schemas; null when no entity can be mapped.
    pub entity_name: Option<String>,
    /// Filters applied to this entity.
    #[serde(default)]
    pub filters: Vec<Filter>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "UPPERCASE")]
pub enum AggregateKind {
    Count,
    Avg,
    Sum,
    Min,
    Max,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Calculation {
    /// The aggregation to perform.
    pub calculation_type: AggregateKind,
    /// The entity the calculation runs over (e.g. 'products').
    pub target_entity: Option<String>,
    /// The field aggregated (e.g. 'price_actual' for AVG). Omit only for COUNT.
    #[serde(default)]
    pub target_field: Option<String>,
    /// The entity or field to group results by (e.g. 'shops').
    #[serde(default)]
    pub group_by: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Relation {
    /// The starting entity (e.g. 'Shop').
    pub source: Option<String>,
    /// The ending entity (e.g. 'Product').
    pub target: Option<String>,
    /// The relationship name (e.g. 'SELLS'). Must be a graph edge type or
    /// inferable from foreign keys in the tabular store; null otherwise.
    pub relation_name: Option<String>,
}

/// Structured representation of one user request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct QueryStructure {
    /// Main entities the user wants to retrieve or filter on. MUST be empty
    /// when the request is unrelated to the data described by the schemas.
    pub targets: Vec<CoreEntity>,
    /// Aggregate calculations requested by the user.
    #[serde(default)]
    pub calculations: Vec<Calculation>,
    /// Relationships to traverse.
    #[serde(default)]
    pub relations: Vec<Relation>,
    /// A plain-language summary of the user's final objective.
    pub ultimate_goal: String,
}

impl QueryStructure {
    /// Structural checks that do not need the schema.
    pub fn validate(&self) -> Result<(), String> {
        for calc in &self.calculations {
            if calc.calculation_type != AggregateKind::Count && calc.target_field.is_none() {
                return Err(format!(
                    "{:?} calculation on {} has no target field",
                    calc.calculation_type,
                    calc.target_entity.as_deref().unwrap_or("<unresolved>")
                ));
            }
        }
        Ok(())
    }

    pub fn has_filters(&self) -> bool {
        self.targets.iter().any(|t| !t.filters.is_empty())
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Planning and generation
// ═══════════════════════════════════════════════════════════════════════

/// Backend a step or query is bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
pub enum ToolName {
    #[serde(rename = "tabular_query")]
    Tabular,
    #[serde(rename = "graph_query")]
    Graph,
    /// Any tool name outside the supported set.
    #[serde(rename = "unsupported", other)]
    #[schemars(skip)]
    Unsupported,
}

impl ToolName {
    pub fn as_str(&self) -> &'static str {
        match self {
            ToolName::Tabular => "tabular_query",
            ToolName::Graph => "graph_query",
            ToolName::Unsupported => "unsupported",
        }
    }
}

impl fmt::Display for ToolName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Step {
    /// Sequential order of the step, starting from 1.
    pub step_id: u32,
    /// Why this step is needed and why its tool was chosen.
    pub thought: String,
    /// The tool that executes this step.
    pub tool_name: ToolName,
    /// A clear natural-language instruction for the query generator.
    pub tool_input: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Plan {
    /// The sequence of steps to execute.
    pub steps: Vec<Step>,
    /// A plain-language summary of the user's final objective.
    pub ultimate_goal: String,
}

impl Plan {
    /// Steps are non-empty, numbered 1, 2, 3, … and each names a known tool.
    pub fn validate_sequence(&self) -> Result<(), String> {
        if self.steps.is_empty() {
            return Err("plan has no steps".to_string());
        }
        for (idx, step) in self.steps.iter().enumerate() {
            let expected = idx as u32 + 1;
            if step.step_id != expected {
                return Err(format!(
                    "step ids must be contiguous from 1: expected {}, found {}",
                    expected, step.step_id
                ));
            }
            if step.tool_name == ToolName::Unsupported {
                return Err(format!(
                    "step {} names a tool other than {} or {}",
                    step.step_id,
                    ToolName::Tabular,
                    ToolName::Graph
                ));
            }
        }
        Ok(())
    }

    /// The steps the pipeline actually dispatches.
    ///
    /// Only the first step is executed. A multi-step executor would iterate
    /// this slice, feeding each step's rows into the next step's generation.
    pub fn dispatched_steps(&self) -> &[Step] {
        &self.steps[..self.steps.len().min(1)]
    }
}

/// A concrete query bound to one backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct GeneratedQuery {
    /// Brief reasoning for this query.
    pub thought: String,
    /// The tool that executes the query.
    pub chosen_tool: ToolName,
    /// The query itself: SQL for tabular_query, Cypher for graph_query.
    /// Only the query text, never a code block or host-language snippet.
    pub query: String,
}

/// Output of a repair call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct RepairedQuery {
    /// The corrected query string only, in the same query language.
    pub query: String,
}

/// Natural-language summary of query results.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct AnswerSummary {
    /// A short, direct answer to the user's question based on the rows.
    pub summary: String,
}

// ═══════════════════════════════════════════════════════════════════════
// Execution
// ═══════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExecutionOutcome {
    Success { rows: Vec<Row>, rendered: String },
    Failure { message: String },
}

impl ExecutionOutcome {
    pub fn failure(message: impl Into<String>) -> Self {
        ExecutionOutcome::Failure {
            message: message.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, ExecutionOutcome::Success { .. })
    }
}

/// Accepts a string, number, bool, or array of scalars as text.
fn text_from_scalar<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    fn scalar(v: &Value) -> String {
        match v {
            Value::String(s) => s.clone(),
            Value::Null => String::new(),
            other => other.to_string(),
        }
    }

    let value = Value::deserialize(deserializer)?;
    Ok(match &value {
        Value::Array(items) => items.iter().map(scalar).collect::<Vec<_>>().join(", "),
        other => scalar(other),
    })
}

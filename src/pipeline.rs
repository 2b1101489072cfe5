//! The query pipeline state machine.
//!
//! # Stages
//!
//! ```text
//!   Extract ──┬──▶ Plan ──▶ Generate ──▶ Execute ──┬──▶ Done
//!             │                           ▲        │
//!             │                           │        ▼
//!             │                           └──── Repair
//!             └──▶ Irrelevant ──▶ Done
//! ```
//!
//! Each request runs as one sequential future over its own
//! [`PipelineState`]. After every transition the configured
//! [`TransitionObserver`] sees `(from, to, &state)`.
//!
//! # Termination
//!
//! A run always reaches `Done` with exactly one result:
//!
//! - the redirect message, when extraction finds no target entity;
//! - the rendered rows (or the no-results message) after a successful execution;
//! - a [`PipelineError`] when any inference call fails, or when the query
//!   still fails after `max_repairs` repair attempts.
//!
//! Every query is checked against the schema right before execution. A
//! repaired query that references unknown names fails that attempt without
//! reaching a backend.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::answer::{failure_answer, success_answer, Summarizer, IRRELEVANT_MESSAGE};
use crate::config::Config;
use crate::error::{InferenceError, PipelineError};
use crate::executor::Executor;
use crate::extract::Extractor;
use crate::generate::Generator;
use crate::grounding::{check_query, SqlDialect};
use crate::inference::{create_client, InferenceClient};
use crate::models::{ExecutionOutcome, GeneratedQuery, Plan, QueryStructure, Row};
use crate::planner::Planner;
use crate::repair::Repairer;
use crate::router::{route, Route};
use crate::schema::SchemaDescriptor;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Extract,
    Plan,
    Irrelevant,
    Generate,
    Execute,
    Repair,
    Done,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Extract => "extract",
            Stage::Plan => "plan",
            Stage::Irrelevant => "irrelevant",
            Stage::Generate => "generate",
            Stage::Execute => "execute",
            Stage::Repair => "repair",
            Stage::Done => "done",
        };
        f.write_str(name)
    }
}

/// Request-scoped state of one run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PipelineState {
    pub user_text: String,
    pub query_structure: Option<QueryStructure>,
    pub plan: Option<Plan>,
    pub generated: Option<GeneratedQuery>,
    pub outcome: Option<ExecutionOutcome>,
    pub final_answer: Option<String>,
    pub needs_repair: bool,
    pub repair_attempts: u32,
}

impl PipelineState {
    pub fn new(user_text: &str) -> Self {
        Self {
            user_text: user_text.to_string(),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Transition {
    pub from: Stage,
    pub to: Stage,
}

impl fmt::Display for Transition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.from, self.to)
    }
}

/// Hook invoked after every state transition.
pub trait TransitionObserver: Send + Sync {
    fn on_transition(&self, from: Stage, to: Stage, state: &PipelineState);
}

pub struct NoopObserver;

impl TransitionObserver for NoopObserver {
    fn on_transition(&self, _from: Stage, _to: Stage, _state: &PipelineState) {}
}

/// Logs each transition at `info`.
pub struct TracingObserver;

impl TransitionObserver for TracingObserver {
    fn on_transition(&self, from: Stage, to: Stage, state: &PipelineState) {
        info!(%from, %to, repairs = state.repair_attempts, "pipeline transition");
    }
}

/// Terminal event delivered to the caller of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TerminalEvent {
    Completed { response: String },
    Error { error: String },
}

/// Everything a finished run produced.
#[derive(Debug)]
pub struct PipelineReport {
    pub run_id: Uuid,
    pub state: PipelineState,
    pub transcript: Vec<Transition>,
    pub result: Result<String, PipelineError>,
}

impl PipelineReport {
    pub fn event(&self) -> TerminalEvent {
        match &self.result {
            Ok(response) => TerminalEvent::Completed {
                response: response.clone(),
            },
            Err(e) => TerminalEvent::Error {
                error: e.to_string(),
            },
        }
    }

    /// Text to show the user, for either outcome.
    pub fn answer(&self) -> String {
        match &self.result {
            Ok(response) => response.clone(),
            Err(e) => failure_answer(e),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub max_repairs: u32,
    pub inference_timeout: Duration,
    pub summarize: bool,
    pub summary_rows: usize,
    /// Dialect generated SQL is parsed in before it reaches the store.
    pub sql_dialect: SqlDialect,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            max_repairs: 3,
            inference_timeout: Duration::from_secs(30),
            summarize: false,
            summary_rows: 20,
            sql_dialect: SqlDialect::Sqlite,
        }
    }
}

impl PipelineSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_repairs: config.pipeline.max_repairs,
            inference_timeout: Duration::from_secs(config.llm.timeout_secs),
            summarize: config.pipeline.summarize,
            summary_rows: config.pipeline.summary_rows,
            sql_dialect: SqlDialect::for_kind(&config.tabular.kind),
        }
    }
}

pub struct Pipeline {
    schema: Arc<SchemaDescriptor>,
    extractor: Extractor,
    planner: Planner,
    generator: Generator,
    repairer: Repairer,
    executor: Executor,
    summarizer: Option<Summarizer>,
    observer: Arc<dyn TransitionObserver>,
    settings: PipelineSettings,
}

impl Pipeline {
    pub fn new(
        schema: Arc<SchemaDescriptor>,
        client: Arc<dyn InferenceClient>,
        executor: Executor,
        settings: PipelineSettings,
    ) -> Self {
        let timeout = settings.inference_timeout;
        let summarizer = settings
            .summarize
            .then(|| Summarizer::new(client.clone(), timeout, settings.summary_rows));

        Self {
            extractor: Extractor::new(schema.clone(), client.clone(), timeout),
            planner: Planner::new(schema.clone(), client.clone(), timeout),
            generator: Generator::new(
                schema.clone(),
                client.clone(),
                settings.sql_dialect,
                timeout,
            ),
            repairer: Repairer::new(schema.clone(), client, timeout),
            schema,
            executor,
            summarizer,
            observer: Arc::new(NoopObserver),
            settings,
        }
    }

    /// Load the schema, inference client and backends named by `config`.
    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        let schema = Arc::new(SchemaDescriptor::load(&config.schema.path)?);
        let client: Arc<dyn InferenceClient> = Arc::from(create_client(&config.llm)?);
        let executor = Executor::from_config(config)?;
        Ok(Self::new(
            schema,
            client,
            executor,
            PipelineSettings::from_config(config),
        ))
    }

    pub fn with_observer(mut self, observer: Arc<dyn TransitionObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn schema(&self) -> &SchemaDescriptor {
        &self.schema
    }

    pub fn executor(&self) -> &Executor {
        &self.executor
    }

    /// Run one request to completion.
    #[instrument(skip_all, fields(run_id = tracing::field::Empty))]
    pub async fn run(&self, user_text: &str) -> PipelineReport {
        let run_id = Uuid::new_v4();
        tracing::Span::current().record("run_id", tracing::field::display(run_id));

        let mut state = PipelineState::new(user_text);
        let mut transcript = Vec::new();
        let mut stage = Stage::Extract;

        let result = loop {
            match self.step(stage, &mut state).await {
                Ok(Stage::Done) => {
                    self.advance(&mut transcript, stage, Stage::Done, &state);
                    break Ok(state.final_answer.clone().unwrap_or_default());
                }
                Ok(next) => {
                    self.advance(&mut transcript, stage, next, &state);
                    stage = next;
                }
                Err(err) => {
                    warn!(%stage, error = %err, "pipeline run failed");
                    state.final_answer = Some(failure_answer(&err));
                    self.advance(&mut transcript, stage, Stage::Done, &state);
                    break Err(err);
                }
            }
        };

        PipelineReport {
            run_id,
            state,
            transcript,
            result,
        }
    }

    /// Run one request unless `cancel` completes first. Dropping the run
    /// releases any checked-out connection and aborts in-flight requests.
    pub async fn run_until<F>(&self, user_text: &str, cancel: F) -> PipelineReport
    where
        F: Future<Output = ()>,
    {
        tokio::select! {
            report = self.run(user_text) => report,
            _ = cancel => {
                info!("pipeline run cancelled");
                PipelineReport {
                    run_id: Uuid::new_v4(),
                    state: PipelineState::new(user_text),
                    transcript: Vec::new(),
                    result: Err(PipelineError::Cancelled),
                }
            }
        }
    }

    fn advance(
        &self,
        transcript: &mut Vec<Transition>,
        from: Stage,
        to: Stage,
        state: &PipelineState,
    ) {
        transcript.push(Transition { from, to });
        self.observer.on_transition(from, to, state);
    }

    async fn step(&self, stage: Stage, state: &mut PipelineState) -> Result<Stage, PipelineError> {
        match stage {
            Stage::Extract => {
                let structure = self
                    .extractor
                    .extract(&state.user_text)
                    .await
                    .map_err(|e| PipelineError::inference(stage, e))?;
                let next = match route(&structure) {
                    Route::Continue => Stage::Plan,
                    Route::Irrelevant => Stage::Irrelevant,
                };
                state.query_structure = Some(structure);
                Ok(next)
            }

            Stage::Irrelevant => {
                state.final_answer = Some(IRRELEVANT_MESSAGE.to_string());
                Ok(Stage::Done)
            }

            Stage::Plan => {
                let structure = required(stage, state.query_structure.as_ref(), "query structure")?;
                let plan = self
                    .planner
                    .plan(structure)
                    .await
                    .map_err(|e| PipelineError::inference(stage, e))?;
                state.plan = Some(plan);
                Ok(Stage::Generate)
            }

            Stage::Generate => {
                let plan = required(stage, state.plan.as_ref(), "plan")?;
                let generated = self
                    .generator
                    .generate(plan)
                    .await
                    .map_err(|e| PipelineError::inference(stage, e))?;
                state.generated = Some(generated);
                Ok(Stage::Execute)
            }

            Stage::Execute => {
                let query = required(stage, state.generated.as_ref(), "generated query")?;
                let outcome = match check_query(
                    &self.schema,
                    self.settings.sql_dialect,
                    query.chosen_tool,
                    &query.query,
                ) {
                    Ok(()) => self.executor.execute(query).await,
                    Err(v) => ExecutionOutcome::failure(format!(
                        "query rejected before execution: {}",
                        v
                    )),
                };

                match outcome {
                    ExecutionOutcome::Success { rows, rendered } => {
                        let summary = self.summarize(state, &rows).await;
                        state.final_answer =
                            Some(success_answer(&rows, &rendered, summary.as_deref()));
                        state.needs_repair = false;
                        state.outcome = Some(ExecutionOutcome::Success { rows, rendered });
                        Ok(Stage::Done)
                    }
                    ExecutionOutcome::Failure { message } => {
                        state.outcome = Some(ExecutionOutcome::failure(message.clone()));
                        if state.repair_attempts < self.settings.max_repairs {
                            state.needs_repair = true;
                            Ok(Stage::Repair)
                        } else {
                            state.needs_repair = false;
                            Err(PipelineError::RepairsExhausted {
                                attempts: state.repair_attempts,
                                last_error: message,
                            })
                        }
                    }
                }
            }

            Stage::Repair => {
                let error = match &state.outcome {
                    Some(ExecutionOutcome::Failure { message }) => message.clone(),
                    _ => String::new(),
                };
                let failed = required(stage, state.generated.as_ref(), "generated query")?;
                let repaired = self
                    .repairer
                    .repair(failed, &error)
                    .await
                    .map_err(|e| PipelineError::inference(stage, e))?;
                state.repair_attempts += 1;
                state.generated = Some(repaired);
                state.needs_repair = false;
                Ok(Stage::Execute)
            }

            Stage::Done => Ok(Stage::Done),
        }
    }

    async fn summarize(&self, state: &PipelineState, rows: &[Row]) -> Option<String> {
        let summarizer = self.summarizer.as_ref()?;
        if rows.is_empty() {
            return None;
        }
        let goal = state
            .plan
            .as_ref()
            .map(|p| p.ultimate_goal.as_str())
            .unwrap_or(&state.user_text);

        match summarizer.summarize(goal, rows).await {
            Ok(summary) => Some(summary),
            Err(e) => {
                warn!(error = %e, "summary failed; answering with the rendered rows");
                None
            }
        }
    }
}

fn required<'a, T>(stage: Stage, value: Option<&'a T>, what: &str) -> Result<&'a T, PipelineError> {
    value.ok_or_else(|| PipelineError::Internal(format!("{} missing at {} stage", what, stage)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{GraphQueryError, TabularQueryError};
    use crate::executor::ExecutorSettings;
    use crate::graph::{DisabledGraphBackend, GraphBackend};
    use crate::inference::ScriptedClient;
    use crate::schema::tests::shop_schema;
    use crate::tabular::TabularBackend;
    use async_trait::async_trait;
    use serde_json::{json, Value};
    use std::sync::Mutex;

    /// Fails queries containing "BROKEN", answers the rest with one row.
    #[derive(Default)]
    struct FakeTabular {
        seen: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl TabularBackend for FakeTabular {
        async fn run(&self, query: &str) -> Result<Vec<Row>, TabularQueryError> {
            self.seen.lock().unwrap().push(query.to_string());
            if query.contains("BROKEN") {
                return Err(TabularQueryError::new("near \"BROKEN\": syntax error"));
            }
            Ok(vec![json!({ "seller_name": "Alpha", "product_count": 2 })
                .as_object()
                .cloned()
                .unwrap()])
        }
    }

    struct EmptyGraph;

    #[async_trait]
    impl GraphBackend for EmptyGraph {
        async fn run(&self, _cypher: &str) -> Result<Vec<Row>, GraphQueryError> {
            Ok(vec![])
        }
    }

    #[derive(Default)]
    struct Recorder(Mutex<Vec<(Stage, Stage)>>);

    impl TransitionObserver for Recorder {
        fn on_transition(&self, from: Stage, to: Stage, _state: &PipelineState) {
            self.0.lock().unwrap().push((from, to));
        }
    }

    fn relevant() -> Value {
        json!({
            "targets": [{ "entity_name": "products" }],
            "calculations": [{ "calculation_type": "COUNT", "target_entity": "products", "group_by": "shops" }],
            "ultimate_goal": "count products per shop"
        })
    }

    fn plan(tool: &str) -> Value {
        json!({
            "steps": [{ "step_id": 1, "thought": "aggregate", "tool_name": tool, "tool_input": "count products per shop" }],
            "ultimate_goal": "ignored"
        })
    }

    fn generated(query: &str) -> Value {
        json!({ "thought": "", "chosen_tool": "tabular_query", "query": query })
    }

    fn pipeline(
        client: ScriptedClient,
        settings: PipelineSettings,
    ) -> (Pipeline, Arc<ScriptedClient>, Arc<FakeTabular>) {
        let client = Arc::new(client);
        let tabular = Arc::new(FakeTabular::default());
        let executor = Executor::new(
            tabular.clone(),
            Arc::new(EmptyGraph),
            ExecutorSettings::default(),
        );
        let p = Pipeline::new(Arc::new(shop_schema()), client.clone(), executor, settings);
        (p, client, tabular)
    }

    const GOOD_SQL: &str = "SELECT s.seller_name, COUNT(p.id) AS product_count FROM shops s JOIN products p ON p.shop_id = s.id GROUP BY s.seller_name";
    const BROKEN_SQL: &str = "SELECT title FROM products WHERE title = 'BROKEN'";

    #[tokio::test]
    async fn test_irrelevant_short_circuit() {
        let (p, client, tabular) = pipeline(
            ScriptedClient::new().respond("QueryStructure", json!({ "targets": [], "ultimate_goal": "weather" })),
            PipelineSettings::default(),
        );
        let report = p.run("what's the weather in Hanoi?").await;

        assert_eq!(report.result.as_deref(), Ok(IRRELEVANT_MESSAGE));
        assert_eq!(
            report.transcript,
            vec![
                Transition { from: Stage::Extract, to: Stage::Irrelevant },
                Transition { from: Stage::Irrelevant, to: Stage::Done },
            ]
        );
        assert_eq!(client.calls().len(), 1);
        assert!(tabular.seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_happy_path_transitions_and_observer() {
        let recorder = Arc::new(Recorder::default());
        let (p, _, _) = pipeline(
            ScriptedClient::new()
                .respond("QueryStructure", relevant())
                .respond("Plan", plan("tabular_query"))
                .respond("GeneratedQuery", generated(GOOD_SQL)),
            PipelineSettings::default(),
        );
        let p = p.with_observer(recorder.clone());
        let report = p.run("how many products does each shop sell?").await;

        let answer = report.result.as_ref().unwrap();
        assert!(answer.starts_with("Here are the results of the query:"));
        assert!(answer.contains("| Alpha | 2 |"));
        assert_eq!(report.state.plan.as_ref().unwrap().ultimate_goal, "count products per shop");
        assert_eq!(
            *recorder.0.lock().unwrap(),
            vec![
                (Stage::Extract, Stage::Plan),
                (Stage::Plan, Stage::Generate),
                (Stage::Generate, Stage::Execute),
                (Stage::Execute, Stage::Done),
            ]
        );
        assert_eq!(
            report.event(),
            TerminalEvent::Completed { response: answer.clone() }
        );
    }

    #[tokio::test]
    async fn test_repair_recovers() {
        let (p, _, tabular) = pipeline(
            ScriptedClient::new()
                .respond("QueryStructure", relevant())
                .respond("Plan", plan("tabular_query"))
                .respond("GeneratedQuery", generated(BROKEN_SQL))
                .respond("RepairedQuery", json!({ "query": GOOD_SQL })),
            PipelineSettings::default(),
        );
        let report = p.run("count products per shop").await;

        assert!(report.result.is_ok());
        assert_eq!(report.state.repair_attempts, 1);
        assert!(!report.state.needs_repair);
        assert_eq!(tabular.seen.lock().unwrap().len(), 2);
        assert!(report
            .transcript
            .contains(&Transition { from: Stage::Repair, to: Stage::Execute }));
    }

    #[tokio::test]
    async fn test_repairs_are_bounded() {
        let mut client = ScriptedClient::new()
            .respond("QueryStructure", relevant())
            .respond("Plan", plan("tabular_query"))
            .respond("GeneratedQuery", generated(BROKEN_SQL));
        for _ in 0..10 {
            client = client.respond("RepairedQuery", json!({ "query": BROKEN_SQL }));
        }
        let settings = PipelineSettings {
            max_repairs: 2,
            ..PipelineSettings::default()
        };
        let (p, client, tabular) = pipeline(client, settings);
        let report = p.run("count products per shop").await;

        assert_eq!(
            report.result,
            Err(PipelineError::RepairsExhausted {
                attempts: 2,
                last_error: "tabular query failed: near \"BROKEN\": syntax error".into(),
            })
        );
        assert_eq!(client.calls_for("RepairedQuery"), 2);
        assert_eq!(tabular.seen.lock().unwrap().len(), 3);
        assert!(matches!(report.event(), TerminalEvent::Error { .. }));
        assert_eq!(report.transcript.last().unwrap().to, Stage::Done);
    }

    #[tokio::test]
    async fn test_zero_repairs_fails_on_first_error() {
        let settings = PipelineSettings {
            max_repairs: 0,
            ..PipelineSettings::default()
        };
        let (p, client, _) = pipeline(
            ScriptedClient::new()
                .respond("QueryStructure", relevant())
                .respond("Plan", plan("tabular_query"))
                .respond("GeneratedQuery", generated(BROKEN_SQL)),
            settings,
        );
        let report = p.run("count").await;
        assert!(matches!(
            report.result,
            Err(PipelineError::RepairsExhausted { attempts: 0, .. })
        ));
        assert_eq!(client.calls_for("RepairedQuery"), 0);
    }

    #[tokio::test]
    async fn test_unknown_planned_tool_is_fatal() {
        let (p, client, tabular) = pipeline(
            ScriptedClient::new()
                .respond("QueryStructure", relevant())
                .respond("Plan", plan("python_exec")),
            PipelineSettings::default(),
        );
        let report = p.run("count").await;

        assert!(matches!(
            report.result,
            Err(PipelineError::Inference {
                stage: Stage::Plan,
                source: InferenceError::Invalid(_)
            })
        ));
        assert_eq!(report.state.repair_attempts, 0);
        assert_eq!(client.calls_for("GeneratedQuery"), 0);
        assert_eq!(client.calls_for("RepairedQuery"), 0);
        assert!(tabular.seen.lock().unwrap().is_empty());
    }

    #[test]
    fn test_missing_state_is_internal_error() {
        let err = required::<Plan>(Stage::Generate, None, "plan").unwrap_err();
        assert_eq!(
            err,
            PipelineError::Internal("plan missing at generate stage".into())
        );
        assert!(!matches!(err, PipelineError::Inference { .. }));
    }

    #[tokio::test]
    async fn test_ungrounded_repair_counts_as_attempt() {
        let (p, _, tabular) = pipeline(
            ScriptedClient::new()
                .respond("QueryStructure", relevant())
                .respond("Plan", plan("tabular_query"))
                .respond("GeneratedQuery", generated(BROKEN_SQL))
                .respond("RepairedQuery", json!({ "query": "SELECT * FROM orders" }))
                .respond("RepairedQuery", json!({ "query": GOOD_SQL })),
            PipelineSettings::default(),
        );
        let report = p.run("count").await;

        assert!(report.result.is_ok());
        assert_eq!(report.state.repair_attempts, 2);
        let seen = tabular.seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert!(seen.iter().all(|q| !q.contains("orders")));
    }

    #[tokio::test]
    async fn test_inference_failure_is_fatal() {
        let (p, _, _) = pipeline(
            ScriptedClient::new()
                .respond("QueryStructure", relevant())
                .fail("Plan", InferenceError::Timeout(Duration::from_secs(30))),
            PipelineSettings::default(),
        );
        let report = p.run("count").await;

        assert_eq!(
            report.result,
            Err(PipelineError::inference(
                Stage::Plan,
                InferenceError::Timeout(Duration::from_secs(30))
            ))
        );
        assert_eq!(
            report.transcript.last(),
            Some(&Transition { from: Stage::Plan, to: Stage::Done })
        );
        match report.event() {
            TerminalEvent::Error { error } => assert!(error.contains("plan stage failed")),
            other => panic!("expected error event, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_summary_failure_falls_back_to_rows() {
        let settings = PipelineSettings {
            summarize: true,
            ..PipelineSettings::default()
        };
        let (p, _, _) = pipeline(
            ScriptedClient::new()
                .respond("QueryStructure", relevant())
                .respond("Plan", plan("tabular_query"))
                .respond("GeneratedQuery", generated(GOOD_SQL))
                .fail("AnswerSummary", InferenceError::Provider("down".into())),
            settings,
        );
        let report = p.run("count").await;
        assert!(report
            .result
            .unwrap()
            .starts_with("Here are the results of the query:"));
    }

    #[tokio::test]
    async fn test_summary_leads_answer() {
        let settings = PipelineSettings {
            summarize: true,
            ..PipelineSettings::default()
        };
        let (p, _, _) = pipeline(
            ScriptedClient::new()
                .respond("QueryStructure", relevant())
                .respond("Plan", plan("tabular_query"))
                .respond("GeneratedQuery", generated(GOOD_SQL))
                .respond("AnswerSummary", json!({ "summary": "Alpha sells 2 products." })),
            settings,
        );
        let answer = p.run("count").await.result.unwrap();
        assert!(answer.starts_with("Alpha sells 2 products.\n\n| seller_name"));
    }

    #[tokio::test]
    async fn test_graph_without_backend_exhausts_repairs() {
        let client = Arc::new(
            ScriptedClient::new()
                .respond("QueryStructure", json!({
                    "targets": [{ "entity_name": "Shop" }],
                    "relations": [
                        { "source": "Shop", "target": "Product", "relation_name": "SELLS" },
                        { "source": "Product", "target": "Category", "relation_name": "BELONGS_TO" }
                    ],
                    "ultimate_goal": "categories reachable from shops"
                }))
                .respond("Plan", plan("tabular_query"))
                .respond("GeneratedQuery", json!({
                    "thought": "",
                    "chosen_tool": "graph_query",
                    "query": "MATCH (s:Shop)-[:SELLS]->(:Product)-[:BELONGS_TO]->(c:Category) RETURN DISTINCT c.name"
                })),
        );
        let executor = Executor::new(
            Arc::new(FakeTabular::default()),
            Arc::new(DisabledGraphBackend),
            ExecutorSettings::default(),
        );
        let settings = PipelineSettings {
            max_repairs: 0,
            ..PipelineSettings::default()
        };
        let p = Pipeline::new(Arc::new(shop_schema()), client, executor, settings);
        let report = p.run("which categories do shops reach?").await;

        assert_eq!(
            report.state.plan.as_ref().unwrap().steps[0].tool_name,
            crate::models::ToolName::Graph
        );
        match report.result {
            Err(PipelineError::RepairsExhausted { last_error, .. }) => {
                assert!(last_error.contains("not configured"))
            }
            other => panic!("unexpected result {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_run_until_cancelled() {
        struct Hanging;

        #[async_trait]
        impl InferenceClient for Hanging {
            fn model_name(&self) -> &str {
                "hanging"
            }
            async fn complete(
                &self,
                _request: crate::inference::InferenceRequest<'_>,
            ) -> Result<Value, InferenceError> {
                std::future::pending().await
            }
        }

        let executor = Executor::new(
            Arc::new(FakeTabular::default()),
            Arc::new(EmptyGraph),
            ExecutorSettings::default(),
        );
        let p = Pipeline::new(
            Arc::new(shop_schema()),
            Arc::new(Hanging),
            executor,
            PipelineSettings::default(),
        );
        let report = p
            .run_until("count", tokio::time::sleep(Duration::from_millis(20)))
            .await;
        assert_eq!(report.result, Err(PipelineError::Cancelled));
    }
}

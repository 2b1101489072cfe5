//! Error taxonomy for the query pipeline.
//!
//! | Error | Raised by | Effect |
//! |-------|-----------|--------|
//! | [`InferenceError`] | extract / plan / generate / repair / summarize | fatal for the request |
//! | [`TabularQueryError`] | tabular backend | becomes `ExecutionOutcome::Failure`, drives repair |
//! | [`GraphQueryError`] | graph backend | becomes `ExecutionOutcome::Failure`, drives repair |
//! | [`PipelineError`] | orchestrator | terminal `error` event |
//!
//! A request that cannot be grounded in the schema is *not* an error: the
//! router sends it to the irrelevant-query branch.

use std::time::Duration;
use thiserror::Error;

use crate::pipeline::Stage;

/// Failure of a structured inference call.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum InferenceError {
    /// The provider rejected the request or could not be reached.
    #[error("inference provider error: {0}")]
    Provider(String),

    /// The provider answered, but not with an instance of the target type.
    #[error("malformed structured output: {0}")]
    Malformed(String),

    /// The output parsed but violates a pipeline invariant.
    #[error("invalid structured output: {0}")]
    Invalid(String),

    #[error("inference call timed out after {0:?}")]
    Timeout(Duration),

    #[error("inference provider is disabled")]
    Disabled,
}

#[derive(Error, Debug, Clone, PartialEq)]
#[error("tabular query failed: {message}")]
pub struct TabularQueryError {
    pub message: String,
}

impl TabularQueryError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl From<sqlx::Error> for TabularQueryError {
    fn from(err: sqlx::Error) -> Self {
        Self::new(err.to_string())
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
#[error("graph query failed: {message}")]
pub struct GraphQueryError {
    pub message: String,
}

impl GraphQueryError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl From<reqwest::Error> for GraphQueryError {
    fn from(err: reqwest::Error) -> Self {
        Self::new(err.to_string())
    }
}

/// Terminal failure of one pipeline run.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PipelineError {
    #[error("{stage} stage failed: {source}")]
    Inference {
        stage: Stage,
        #[source]
        source: InferenceError,
    },

    #[error("query still failing after {attempts} repair attempt(s): {last_error}")]
    RepairsExhausted { attempts: u32, last_error: String },

    #[error("request was cancelled")]
    Cancelled,

    /// A stage ran without the state an earlier stage should have left.
    #[error("internal pipeline error: {0}")]
    Internal(String),
}

impl PipelineError {
    pub fn inference(stage: Stage, source: InferenceError) -> Self {
        Self::Inference { stage, source }
    }
}

//! User-facing answer text.
//!
//! Every run ends in exactly one of: the redirect for unrelated requests,
//! a rendering of the result rows (optionally preceded by a model-written
//! summary), the fixed no-results message, or a failure report.

use std::sync::Arc;
use std::time::Duration;

use tracing::{instrument, warn};

use crate::error::{InferenceError, PipelineError};
use crate::inference::{invoke, ChatMessage, InferenceClient};
use crate::models::{AnswerSummary, Row};

pub const IRRELEVANT_MESSAGE: &str = "Sorry, I am an assistant specialised in product and \
sales data. I could not find anything related to this question, or the current data does \
not support it. Please try a different question.";

pub const NO_RESULTS_MESSAGE: &str = "The query ran successfully but found no matching data.";

const RESULTS_HEADER: &str = "Here are the results of the query:";

const SUMMARY_INSTRUCTIONS: &str = "\
Answer the user's goal in one or two sentences using only the result rows \
provided. Do not invent values.";

/// Answer for a successful execution.
pub fn success_answer(rows: &[Row], rendered: &str, summary: Option<&str>) -> String {
    if rows.is_empty() {
        return NO_RESULTS_MESSAGE.to_string();
    }
    match summary {
        Some(s) => format!("{}\n\n{}", s.trim(), rendered.trim_end()),
        None => format!("{}\n\n{}", RESULTS_HEADER, rendered.trim_end()),
    }
}

/// Answer for a run that ended in a pipeline error.
pub fn failure_answer(err: &PipelineError) -> String {
    match err {
        PipelineError::RepairsExhausted { attempts, last_error } => format!(
            "I could not run a working query for this question after {} repair attempt(s). Last error: {}",
            attempts, last_error
        ),
        PipelineError::Inference { stage, .. } => format!(
            "I could not process this question: the {} stage failed. Please try again.",
            stage
        ),
        PipelineError::Cancelled => "The request was cancelled.".to_string(),
        PipelineError::Internal(_) => {
            "I could not process this question because of an internal error.".to_string()
        }
    }
}

/// Writes a short natural-language answer over the first rows of a result.
pub struct Summarizer {
    client: Arc<dyn InferenceClient>,
    timeout: Duration,
    max_rows: usize,
}

impl Summarizer {
    pub fn new(client: Arc<dyn InferenceClient>, timeout: Duration, max_rows: usize) -> Self {
        Self {
            client,
            timeout,
            max_rows,
        }
    }

    #[instrument(skip_all, fields(rows = rows.len()))]
    pub async fn summarize(&self, goal: &str, rows: &[Row]) -> Result<String, InferenceError> {
        let shown = &rows[..rows.len().min(self.max_rows)];
        let data = serde_json::to_string(shown).map_err(|e| InferenceError::Invalid(e.to_string()))?;
        let messages = [ChatMessage::user(format!(
            "Goal: {}\nRows ({} of {}):\n{}",
            goal,
            shown.len(),
            rows.len(),
            data
        ))];

        let out: AnswerSummary =
            invoke(self.client.as_ref(), SUMMARY_INSTRUCTIONS, &messages, self.timeout).await?;
        if out.summary.trim().is_empty() {
            warn!("summary came back empty");
            return Err(InferenceError::Invalid("empty summary".into()));
        }
        Ok(out.summary)
    }
}

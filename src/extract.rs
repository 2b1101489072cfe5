//! Query-structure extraction.
//!
//! Turns free user text into a [`QueryStructure`] with one structured
//! inference call, then grounds every name in the result against the
//! [`SchemaDescriptor`]. A name the schema cannot account for becomes
//! `None`; the model's spelling never leaks downstream.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, instrument};

use crate::error::InferenceError;
use crate::inference::{invoke, ChatMessage, InferenceClient};
use crate::models::{Calculation, CoreEntity, Filter, QueryStructure, Relation};
use crate::schema::SchemaDescriptor;

const INSTRUCTIONS: &str = "\
You analyse a user's request against the database schemas below and return \
its structure. Use only entity, field and relationship names that appear in \
the schemas; use null for anything you cannot map. If the request has \
nothing to do with the data described, return an empty `targets` list.";

pub struct Extractor {
    schema: Arc<SchemaDescriptor>,
    client: Arc<dyn InferenceClient>,
    timeout: Duration,
}

impl Extractor {
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

    /// Extract and ground the structure of `user_text`.
    ///
    /// # Errors
    ///
    /// Any inference failure, or [`InferenceError::Invalid`] when the
    /// returned structure breaks a structural rule (e.g. `AVG` with no field).
    #[instrument(skip(self, user_text), fields(schema = %self.schema.version))]
    pub async fn extract(&self, user_text: &str) -> Result<QueryStructure, InferenceError> {
        let system = format!("{}\n\n{}", INSTRUCTIONS, self.schema.render_prompt());
        let messages = [ChatMessage::user(user_text)];

        let raw: QueryStructure =
            invoke(self.client.as_ref(), &system, &messages, self.timeout).await?;
        raw.validate().map_err(InferenceError::Invalid)?;

        let grounded = ground(&self.schema, raw);
        debug!(
            targets = grounded.targets.len(),
            calculations = grounded.calculations.len(),
            relations = grounded.relations.len(),
            "extracted query structure"
        );
        Ok(grounded)
    }
}

/// Replace every name in `structure` with its canonical schema name, or
/// `None` when it does not resolve.
pub fn ground(schema: &SchemaDescriptor, structure: QueryStructure) -> QueryStructure {
    let targets = structure
        .targets
        .into_iter()
        .map(|target| {
            let entity = target
                .entity_name
                .as_deref()
                .and_then(|e| schema.resolve_entity(e));
            let filters = target
                .filters
                .into_iter()
                .map(|f| Filter {
                    field: f
                        .field
                        .as_deref()
                        .and_then(|term| schema.resolve_field(entity.as_deref(), term)),
                    ..f
                })
                .collect();
            CoreEntity {
                entity_name: entity,
                filters,
            }
        })
        .collect();

    let calculations = structure
        .calculations
        .into_iter()
        .map(|calc| {
            let entity = calc
                .target_entity
                .as_deref()
                .and_then(|e| schema.resolve_entity(e));
            Calculation {
                target_field: calc
                    .target_field
                    .as_deref()
                    .and_then(|f| schema.resolve_field(entity.as_deref(), f)),
                group_by: calc
                    .group_by
                    .as_deref()
                    .and_then(|g| schema.resolve_group_key(entity.as_deref(), g)),
                target_entity: entity,
                calculation_type: calc.calculation_type,
            }
        })
        .collect();

    let relations = structure
        .relations
        .into_iter()
        .map(|rel| {
            let source = rel.source.as_deref().and_then(|s| schema.resolve_entity(s));
            let target = rel.target.as_deref().and_then(|t| schema.resolve_entity(t));
            let name = rel.relation_name.as_deref().unwrap_or("");
            let relation_name = match (&source, &target) {
                (Some(s), Some(t)) => schema.resolve_relation(s, t, name),
                _ => schema
                    .graph
                    .edges
                    .iter()
                    .find(|e| !name.is_empty() && e.relation.eq_ignore_ascii_case(name))
                    .map(|e| e.relation.clone()),
            };
            Relation {
                source,
                target,
                relation_name,
            }
        })
        .collect();

    QueryStructure {
        targets,
        calculations,
        relations,
        ultimate_goal: structure.ultimate_goal,
    }
}

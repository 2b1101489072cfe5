//! # nlq-harness
//!
//! A staged agent that turns a free-text question into a validated query
//! against one of two stores, a tabular store (SQL) and a graph store
//! (Cypher), runs it, and repairs it when execution fails.
//!
//! ## Architecture
//!
//! ```text
//!  question
//!     │
//!     ▼
//! ┌─────────┐   ┌────────┐   ┌─────────┐   ┌──────────┐   ┌──────────┐
//! │ Extract │──▶│ Router │──▶│ Planner │──▶│ Generate │──▶│ Executor │──▶ answer
//! └─────────┘   └───┬────┘   └─────────┘   └──────────┘   └────┬─────┘
//!                   │                                ▲         │ failure
//!                   ▼                                │         ▼
//!               redirect                             └──── ┌────────┐
//!                                                          │ Repair │
//!                                                          └────────┘
//! ```
//!
//! Every stage that needs a model goes through [`inference::invoke`], which
//! returns a typed value. Every name a stage emits is grounded in the
//! [`schema::SchemaDescriptor`].
//!
//! ## Quick Start
//!
//! ```bash
//! nlq schema                                   # what the model sees
//! nlq check                                    # check store connectivity
//! nlq ask "how many products does each shop sell?"
//! nlq serve                                    # POST /query
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`schema`] | Schema registry and name resolution |
//! | [`models`] | Core data types |
//! | [`inference`] | Structured inference clients |
//! | [`extract`] | Query-structure extraction |
//! | [`router`] | Relevance routing |
//! | [`planner`] | Plans and tool policy |
//! | [`generate`] | Query generation |
//! | [`grounding`] | Schema checks on query text |
//! | [`executor`] | Query dispatch |
//! | [`tabular`] | SQL store adapter |
//! | [`graph`] | Cypher store adapter |
//! | [`render`] | Result rendering |
//! | [`repair`] | Query repair |
//! | [`answer`] | User-facing answer text |
//! | [`pipeline`] | The state machine |
//! | [`server`] | HTTP adapter |

pub mod answer;
pub mod config;
pub mod error;
pub mod executor;
pub mod extract;
pub mod generate;
pub mod graph;
pub mod grounding;
pub mod inference;
pub mod models;
pub mod pipeline;
pub mod planner;
pub mod render;
pub mod repair;
pub mod router;
pub mod schema;
pub mod server;
pub mod tabular;

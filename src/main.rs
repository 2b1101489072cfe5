//! # nlq CLI
//!
//! The `nlq` binary runs the natural-language query pipeline once from the
//! command line, inspects the loaded schema, checks the backends, or starts
//! the HTTP adapter.
//!
//! ## Usage
//!
//! ```bash
//! nlq --config ./config/nlq.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `nlq ask "<question>"` | Run the pipeline and print the answer |
//! | `nlq schema` | Print the schema as shown to the model |
//! | `nlq check` | Check the tabular and graph stores |
//! | `nlq serve` | Start the HTTP server |
//!
//! Logs go to stderr and honour `RUST_LOG` (default `info`).

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use nlq_harness::config;
use nlq_harness::executor::Executor;
use nlq_harness::pipeline::{Pipeline, TracingObserver};
use nlq_harness::schema::SchemaDescriptor;
use nlq_harness::server;

/// Natural-language queries over a tabular and a graph store.
#[derive(Parser)]
#[command(
    name = "nlq",
    about = "Answer natural-language questions with SQL and Cypher queries",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/nlq.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the pipeline for one question.
    Ask {
        question: String,

        /// Print the terminal event as JSON.
        #[arg(long)]
        json: bool,

        /// Print state transitions and the executed query.
        #[arg(long)]
        trace: bool,
    },

    /// Print the loaded schema.
    Schema {
        /// Print the descriptor as JSON instead of the prompt rendering.
        #[arg(long)]
        json: bool,
    },

    /// Check backend connectivity.
    Check,

    /// Start the HTTP server.
    Serve,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Ask {
            question,
            json,
            trace,
        } => {
            let pipeline = Pipeline::from_config(&cfg)?.with_observer(Arc::new(TracingObserver));
            let report = pipeline
                .run_until(&question, async {
                    let _ = tokio::signal::ctrl_c().await;
                })
                .await;

            if trace {
                for transition in &report.transcript {
                    println!("# {}", transition);
                }
                if let Some(query) = &report.state.generated {
                    println!("# {} ({} repair(s)):", query.chosen_tool, report.state.repair_attempts);
                    for line in query.query.lines() {
                        println!("#   {}", line);
                    }
                }
                println!();
            }

            if json {
                println!("{}", serde_json::to_string_pretty(&report.event())?);
            } else {
                println!("{}", report.answer());
            }

            if report.result.is_err() {
                std::process::exit(1);
            }
        }
        Commands::Schema { json } => {
            let schema = SchemaDescriptor::load(&cfg.schema.path)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&schema)?);
            } else {
                print!("{}", schema.render_prompt());
            }
        }
        Commands::Check => {
            let executor = Executor::from_config(&cfg)?;
            let status = executor.check_health().await;

            println!("{:<10} {:<10} DETAIL", "BACKEND", "STATUS");
            for s in &status {
                match &s.result {
                    Ok(()) => println!("{:<10} {:<10} -", s.backend, "OK"),
                    Err(e) => println!("{:<10} {:<10} {}", s.backend, "FAILED", e),
                }
            }
            println!(
                "{:<10} {:<10} {}",
                "llm",
                cfg.llm.provider,
                cfg.llm.model.as_deref().unwrap_or("-")
            );

            if status.iter().any(|s| s.result.is_err()) {
                anyhow::bail!("one or more backends are unreachable");
            }
        }
        Commands::Serve => {
            let pipeline = Pipeline::from_config(&cfg)?.with_observer(Arc::new(TracingObserver));
            server::run_server(Arc::new(pipeline), &cfg.server.bind).await?;
        }
    }

    Ok(())
}

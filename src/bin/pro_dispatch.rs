//! Pro Dispatch CLI
//!
//! Runs the dispatch core against the Postgres database in `DATABASE_URL`.
//!
//! Usage:
//!   cargo run --features cli --bin pro-dispatch -- schema
//!   cargo run --features cli --bin pro-dispatch -- refs
//!   cargo run --features cli --bin pro-dispatch -- create-job --field service_type="TV Mounting"
//!   cargo run --features cli --bin pro-dispatch -- offer --job 1842 --pro pat@pro.test
//!   cargo run --features cli --bin pro-dispatch -- complete --job 1842

use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use serde_json::Value;

use pro_dispatch::{
    completion_response, Actor, AssignmentState, CompletionOrchestrator, CompletionRequest,
    DatabaseConfig, DispatchJobs, HttpNotifier, LogNotifier, NewJob, Notifier, OfferEngine,
    PgRowStore, PortalConfig, ProRef, ReferenceResolver, RowStore, SchemaResolver,
};

#[derive(Parser)]
#[command(name = "pro-dispatch")]
#[command(version)]
#[command(about = "Job dispatch and payout orchestration for the pro portal")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Discover and print the jobs/assignments table mapping
    Schema,

    /// Resolve the sequence, recipient and step references for new jobs
    Refs,

    /// Create a dispatch job in status `open`
    CreateJob {
        /// Column values in format key=value (can be specified multiple times)
        #[arg(long, short = 'f', value_parser = parse_key_val)]
        field: Vec<(String, String)>,

        /// Metadata entries in format key=value
        #[arg(long, short = 'm', value_parser = parse_key_val)]
        meta: Vec<(String, String)>,
    },

    /// Offer a job to a pro (explicit, stored on the job, nearest or first active)
    Offer {
        #[arg(long, short = 'j')]
        job: String,

        /// Pro id or e-mail
        #[arg(long, short = 'p')]
        pro: Option<String>,

        /// Assignment state to record
        #[arg(long, short = 's', default_value = "offer_sent")]
        state: AssignmentState,
    },

    /// Record the payout for a completed job
    Complete {
        #[arg(long, short = 'j')]
        job: String,

        /// Completing pro (id or e-mail); defaults to the job's assignee
        #[arg(long, short = 'p')]
        pro: Option<String>,

        /// Completion time, RFC 3339
        #[arg(long)]
        completed_at: Option<DateTime<Utc>>,
    },
}

/// Parse key=value pairs from command line
fn parse_key_val(s: &str) -> Result<(String, String), String> {
    let pos = s
        .find('=')
        .ok_or_else(|| format!("Invalid key=value pair: {}", s))?;
    Ok((s[..pos].to_string(), s[pos + 1..].to_string()))
}

fn print_json(value: &impl serde::Serialize) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cli = Cli::parse();
    let config = PortalConfig::from_env();

    let store: Arc<dyn RowStore> = Arc::new(
        PgRowStore::connect(&DatabaseConfig::default())
            .await
            .context("connecting to DATABASE_URL")?,
    );
    let schema = Arc::new(SchemaResolver::new(store.clone(), &config));

    match cli.command {
        Commands::Schema => {
            let descriptor = schema.resolve().await?;
            print_json(descriptor.as_ref())?;
        }
        Commands::Refs => {
            let refs = ReferenceResolver::new(store, schema, config.references.clone())
                .resolve()
                .await;
            print_json(&refs)?;
            if let Some(name) = refs.first_missing() {
                tracing::warn!(reference = name, "job creation would be refused");
                return Ok(ExitCode::FAILURE);
            }
        }
        Commands::CreateJob { field, meta } => {
            let references =
                ReferenceResolver::new(store.clone(), schema.clone(), config.references.clone());
            let jobs = DispatchJobs::new(store, schema, references);
            let job = jobs
                .create_dispatch_job(NewJob {
                    fields: field
                        .into_iter()
                        .map(|(k, v)| (k, Value::String(v)))
                        .collect(),
                    metadata: meta
                        .into_iter()
                        .map(|(k, v)| (k, Value::String(v)))
                        .collect(),
                })
                .await?;
            print_json(job.row())?;
        }
        Commands::Offer { job, pro, state } => {
            let engine = OfferEngine::new(store, schema, &config);
            let outcome = engine.ensure_offer(&job, pro.as_deref(), state).await?;
            print_json(&outcome)?;
        }
        Commands::Complete {
            job,
            pro,
            completed_at,
        } => {
            let notifier: Arc<dyn Notifier> = match &config.mail {
                Some(mail) => Arc::new(HttpNotifier::new(mail.clone())?),
                None => Arc::new(LogNotifier),
            };
            let actor = match pro.as_deref().and_then(ProRef::from_value) {
                Some(pro) => Actor::Pro(pro),
                None => Actor::System,
            };
            let orchestrator = CompletionOrchestrator::new(store, schema, notifier, &config);
            let request = CompletionRequest {
                completed_at,
                ..CompletionRequest::new(job, actor)
            };
            let result = orchestrator.complete(request).await;
            print_json(&completion_response(&result))?;
            if result.is_err() {
                return Ok(ExitCode::FAILURE);
            }
        }
    }

    Ok(ExitCode::SUCCESS)
}

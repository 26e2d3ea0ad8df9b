// Fanout worker CLI
//
// Design Decision: Use clap derive with env fallbacks mirroring OrchestratorConfig::from_env.
// Design Decision: Logs go to stderr so stdout carries only the task result JSON.

mod local;

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use fanout_durable::engine::OrchestratorConfig;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::local::{LocalRunner, Transform};

const DEFAULT_LOG_FILTER: &str = "fanout_worker=info,fanout_durable=info";

#[derive(Parser)]
#[command(name = "fanout-worker")]
#[command(about = "Run fan-out tasks end to end against in-memory backends")]
#[command(version)]
struct Cli {
    /// Worker name used to prefix output blobs
    #[arg(long, env = "FANOUT_WORKER_NAME", default_value = "worker", global = true)]
    worker_name: String,

    /// Retries after the first failed attempt of a blob task
    #[arg(long, env = "FANOUT_MAX_RETRIES", default_value_t = 3, global = true)]
    max_retries: u32,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Process a JSONL file as a blob task
    Process {
        /// Input file, one `["record", ...]` array per line
        #[arg(long, short)]
        input: PathBuf,

        /// Records handled by one task before the rest fans out
        #[arg(long, env = "FANOUT_SEGMENT_LIMIT", default_value_t = 1000)]
        segment_limit: usize,

        /// Records per processor call
        #[arg(long, env = "FANOUT_BATCH_SIZE", default_value_t = 100)]
        batch_size: usize,

        /// Transformation applied to each record
        #[arg(long, value_enum, default_value_t = Transform::Identity)]
        transform: Transform,

        /// Write the merged output here instead of stdout
        #[arg(long, short)]
        output: Option<PathBuf>,

        /// Download chunk size of the in-memory blob store, in bytes
        #[arg(long)]
        chunk_size: Option<usize>,

        /// JSON parameters forwarded to every batch
        #[arg(long)]
        parameters: Option<String>,
    },

    /// Run a whole-payload task that echoes its payload
    Eval {
        /// Payload as JSON
        #[arg(long)]
        json: String,
    },
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_writer(std::io::stderr),
        )
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    let base = OrchestratorConfig::from_env().with_worker_name(cli.worker_name);
    let retry_policy = base.retry_policy.clone().with_retries(cli.max_retries);
    let base = base.with_retry_policy(retry_policy);

    match cli.command {
        Commands::Process {
            input,
            segment_limit,
            batch_size,
            transform,
            output,
            chunk_size,
            parameters,
        } => {
            let parameters = parameters
                .map(|p| serde_json::from_str::<serde_json::Value>(&p))
                .transpose()
                .context("--parameters is not valid JSON")?;
            let content = tokio::fs::read(&input)
                .await
                .with_context(|| format!("failed to read {}", input.display()))?;
            let blob_name = input
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or("input.jsonl")
                .to_string();

            let config = base
                .with_segment_limit(segment_limit)
                .with_batch_size(batch_size);
            let runner = LocalRunner::new(config, chunk_size)?;

            tracing::info!(input = %input.display(), segment_limit, batch_size, ?transform, "processing blob");
            let run = runner
                .run_blob(&blob_name, content, transform, parameters.as_ref())
                .await?;
            tracing::info!(task_id = %run.task_id, failed = run.result.is_failed(), "task finished");

            println!("{}", run.result.to_json());
            if let Some(merged) = run.output {
                match output {
                    Some(path) => tokio::fs::write(&path, merged)
                        .await
                        .with_context(|| format!("failed to write {}", path.display()))?,
                    None => println!("{}", String::from_utf8_lossy(&merged)),
                }
            }
        }
        Commands::Eval { json } => {
            let payload: serde_json::Value =
                serde_json::from_str(&json).context("--json is not valid JSON")?;
            let runner = LocalRunner::new(base, None)?;

            let result = runner.run_payload(&payload).await?;
            println!("{}", result.to_json());
        }
    }

    Ok(())
}

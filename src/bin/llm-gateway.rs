#![forbid(unsafe_code)]

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use llm_gateway::gateway::DEFAULT_MAX_OUTPUT_TOKENS;
use llm_gateway::{
    Attribution, BatchSummary, BoundedExecutor, CompletionRequest, CompletionResponse,
    GatewayError, Message, NoopUsageSink, RequestGateway, StderrUsageSink, TaskFailure,
    TokenUsage, UsageSink,
};

#[derive(Parser)]
#[command(name = "llm-gateway", version, about = "Rate-limit-aware chat completion gateway")]
struct Cli {
    /// Write one JSON usage record per attempt to stderr
    #[arg(long, global = true)]
    usage: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Send a single prompt and print the response as JSON
    Complete {
        #[arg(long)]
        model: String,
        #[arg(long)]
        prompt: String,
        #[arg(long)]
        system: Option<String>,
        #[arg(long, default_value_t = DEFAULT_MAX_OUTPUT_TOKENS)]
        max_tokens: u32,
        #[arg(long)]
        temperature: Option<f32>,
    },
    /// Run every prompt in a JSONL file through the gateway
    ///
    /// Each input line is `{"prompt": "...", "system": "...", "id": "..."}`
    /// (`system` and `id` optional). One result line is written per input
    /// line, in input order.
    Batch {
        #[arg(long)]
        input: PathBuf,
        #[arg(long)]
        out: PathBuf,
        #[arg(long)]
        model: String,
        #[arg(long, default_value_t = 4)]
        concurrency: usize,
        #[arg(long, default_value_t = DEFAULT_MAX_OUTPUT_TOKENS)]
        max_tokens: u32,
    },
}

#[derive(Debug, Deserialize)]
struct BatchInput {
    #[serde(default)]
    id: Option<String>,
    prompt: String,
    #[serde(default)]
    system: Option<String>,
}

#[derive(Debug, Serialize)]
struct BatchOutput {
    index: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    id: Option<String>,
    ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    usage: Option<TokenUsage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let sink: Arc<dyn UsageSink> = if cli.usage {
        Arc::new(StderrUsageSink)
    } else {
        Arc::new(NoopUsageSink)
    };
    let gateway = RequestGateway::from_env(sink)?;

    match cli.command {
        Commands::Complete {
            model,
            prompt,
            system,
            max_tokens,
            temperature,
        } => {
            let mut req = CompletionRequest::new(
                model,
                build_messages(system, prompt),
                Attribution::new("cli_complete"),
            )
            .max_output_tokens(max_tokens);
            if let Some(t) = temperature {
                req = req.temperature(t);
            }
            let resp = gateway.execute(req).await?;
            println!("{}", serde_json::to_string_pretty(&resp)?);
        }
        Commands::Batch {
            input,
            out,
            model,
            concurrency,
            max_tokens,
        } => {
            let inputs = read_batch_inputs(&input)?;
            let job_id = Uuid::new_v4();
            tracing::info!(
                prompts = inputs.len(),
                concurrency,
                %job_id,
                "starting batch"
            );

            let ids: Vec<Option<String>> = inputs.iter().map(|i| i.id.clone()).collect();
            let tasks = inputs.into_iter().map(|item| {
                let gateway = gateway.clone();
                let req = CompletionRequest::new(
                    model.clone(),
                    build_messages(item.system, item.prompt),
                    Attribution::new("cli_batch").with_job(job_id),
                )
                .max_output_tokens(max_tokens);
                move || async move { gateway.execute(req).await }
            });
            let results = BoundedExecutor::execute(tasks, concurrency).await;

            write_batch_outputs(&out, &ids, &results)?;

            let summary = BatchSummary::from_results(&results);
            eprintln!("{}", serde_json::to_string(&summary)?);
            eprintln!("{}", serde_json::to_string_pretty(&gateway.pool().snapshot())?);
        }
    }

    Ok(())
}

fn build_messages(system: Option<String>, prompt: String) -> Vec<Message> {
    let mut messages = Vec::with_capacity(2);
    if let Some(system) = system {
        messages.push(Message::system(system));
    }
    messages.push(Message::user(prompt));
    messages
}

fn read_batch_inputs(path: &Path) -> Result<Vec<BatchInput>, Box<dyn std::error::Error>> {
    let raw = std::fs::read_to_string(path)?;
    let mut inputs = Vec::new();
    for (line_no, line) in raw.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let item: BatchInput = serde_json::from_str(line)
            .map_err(|e| format!("{}:{}: {e}", path.display(), line_no + 1))?;
        inputs.push(item);
    }
    Ok(inputs)
}

fn write_batch_outputs(
    path: &Path,
    ids: &[Option<String>],
    results: &[Result<CompletionResponse, TaskFailure<GatewayError>>],
) -> Result<(), Box<dyn std::error::Error>> {
    let mut file = BufWriter::new(File::create(path)?);
    for (index, result) in results.iter().enumerate() {
        let id = ids.get(index).cloned().flatten();
        let line = match result {
            Ok(resp) => BatchOutput {
                index,
                id,
                ok: true,
                text: Some(resp.text.clone()),
                usage: Some(resp.usage),
                error: None,
            },
            Err(err) => BatchOutput {
                index,
                id,
                ok: false,
                text: None,
                usage: None,
                error: Some(err.to_string()),
            },
        };
        writeln!(file, "{}", serde_json::to_string(&line)?)?;
    }
    file.flush()?;
    Ok(())
}

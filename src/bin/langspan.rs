//! langspan CLI: token estimates and traced stream replays.

use futures::StreamExt as _;
use langspan::config::Config;
use langspan::context;
use langspan::instrument::Instrumentor;
use langspan::provider::{ChatChunk, ChatMessage, ChatRequest};
use langspan::telemetry::{TelemetryConfig, init_telemetry};
use langspan::tokens;
use opentelemetry::KeyValue;
use std::path::PathBuf;

#[derive(clap::Parser)]
#[command(name = "langspan", about = "Trace generative-AI calls with OpenTelemetry")]
struct Cli {
    /// TOML config file; environment variables are used when omitted
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(clap::Subcommand)]
enum Command {
    /// Estimate the token count of a text
    Tokens {
        /// Model identifier used to pick the tokenizer
        #[arg(long, default_value = "gpt-4o")]
        model: String,
        /// Text to count
        text: String,
    },
    /// Replay newline-delimited deltas as a traced chat stream
    Replay {
        /// Model identifier recorded on the span
        #[arg(long, default_value = "gpt-4o")]
        model: String,
        /// Prompt sent as the single user message
        #[arg(long, default_value = "")]
        prompt: String,
        /// Stop after this many chunks, cancelling the rest
        #[arg(long)]
        take: Option<usize>,
        /// Extra span attributes as key=value
        #[arg(long = "attr", value_parser = parse_attribute)]
        attributes: Vec<(String, String)>,
        /// File with one delta per line
        file: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    use clap::Parser as _;

    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => Config::from_toml_file(path)?,
        None => Config::from_env()?,
    };

    match cli.command {
        Command::Tokens { model, text } => cmd_tokens(&model, &text),
        Command::Replay {
            model,
            prompt,
            take,
            attributes,
            file,
        } => cmd_replay(config, model, prompt, take, attributes, file).await,
    }
}

fn cmd_tokens(model: &str, text: &str) -> anyhow::Result<()> {
    match tokens::encoding_for_model(model) {
        Some(encoding) => println!("Encoding:   {}", encoding.name()),
        None => println!("Encoding:   - (unknown model)"),
    }
    match tokens::estimate_exact(text, model) {
        Ok(count) => println!("Exact:      {count}"),
        Err(e) => println!("Exact:      - ({e})"),
    }
    println!("Heuristic:  {}", tokens::estimate_heuristic(text));
    println!("Estimate:   {}", tokens::estimate(text, model));
    Ok(())
}

async fn cmd_replay(
    config: Config,
    model: String,
    prompt: String,
    take: Option<usize>,
    attributes: Vec<(String, String)>,
    file: PathBuf,
) -> anyhow::Result<()> {
    let guard = init_telemetry(TelemetryConfig::from(&config))?;
    let instrumentor = Instrumentor::global_with(config.instrumentation.clone());

    let content = tokio::fs::read_to_string(&file).await?;
    let chunks: Vec<Result<ChatChunk, std::io::Error>> = content
        .lines()
        .map(|line| Ok(ChatChunk::text(format!("{line}\n"))))
        .chain(std::iter::once(Ok(ChatChunk::finished("stop"))))
        .collect();

    let request = ChatRequest::new(model, vec![ChatMessage::user(prompt)]);
    let extra = context::attributes(
        attributes
            .into_iter()
            .map(|(key, value)| KeyValue::new(key, value)),
    );

    context::with_attributes(extra, async {
        let mut stream = instrumentor
            .trace_chat_stream("replay", request, |_| async {
                Ok::<_, std::io::Error>(futures::stream::iter(chunks))
            })
            .await?;
        tracing::info!(trace_id = %stream.span().trace_id(), "replaying stream");

        let mut yielded = 0usize;
        while let Some(chunk) = stream.next().await {
            if let Some(delta) = chunk?.delta {
                print!("{delta}");
            }
            yielded += 1;
            if take.is_some_and(|limit| yielded >= limit) {
                stream.cancel();
                break;
            }
        }
        anyhow::Ok(())
    })
    .await?;

    guard.force_flush();
    Ok(())
}

fn parse_attribute(raw: &str) -> Result<(String, String), String> {
    raw.split_once('=')
        .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        .filter(|(k, _)| !k.is_empty())
        .ok_or_else(|| format!("expected key=value, got {raw:?}"))
}

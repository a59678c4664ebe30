//! a3s-insight - ask questions about a dataset without sending it in cleartext

use a3s_insight::{AskRequest, InsightConfig, RequestOrchestrator, TranslationMode};
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "a3s-insight")]
#[command(author = "A3S Lab Team")]
#[command(version)]
#[command(about = "Privacy-preserving dataset question answering")]
struct Cli {
    /// Configuration file path (.json)
    #[arg(short, long, env = "A3S_INSIGHT_CONFIG")]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Ask a question, optionally about a file
    Ask {
        /// Dataset to upload first (.csv, .json, .txt, .md)
        #[arg(short, long)]
        file: Option<PathBuf>,

        /// Continue an existing session
        #[arg(short, long, conflicts_with = "file")]
        session: Option<String>,

        /// Answer translation mode (mixed or mirror); defaults to translation.mode
        #[arg(long)]
        mode: Option<TranslationMode>,

        /// The question
        question: String,
    },

    /// Upload a dataset and print the new session id
    Upload {
        file: PathBuf,
    },

    /// Print a session's message log
    History {
        session: String,
    },

    /// List stored sessions
    Sessions,

    /// Delete a session and everything stored for it
    Delete {
        session: String,
    },

    /// Show configuration
    Config {
        /// Show default configuration
        #[arg(long)]
        default: bool,
    },
}

fn load_config(path: Option<&PathBuf>) -> Result<InsightConfig> {
    match path {
        Some(path) => InsightConfig::from_file(path)
            .with_context(|| format!("Failed to load {}", path.display())),
        None => Ok(InsightConfig::default()),
    }
}

async fn upload(orchestrator: &RequestOrchestrator, file: &Path) -> Result<String> {
    let bytes = std::fs::read(file).with_context(|| format!("Failed to read {}", file.display()))?;
    let filename = file
        .file_name()
        .and_then(|n| n.to_str())
        .context("File name is not valid UTF-8")?;
    let receipt = orchestrator.upload(filename, &bytes).await?;
    eprintln!("{}", receipt.message);
    Ok(receipt.session_id)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("a3s_insight={}", log_level).into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let config = load_config(cli.config.as_ref())?;

    let build = || RequestOrchestrator::from_config(&config);

    match cli.command {
        Commands::Ask {
            file,
            session,
            mode,
            question,
        } => {
            let orchestrator = build()?;
            let session = match (file, session) {
                (Some(file), _) => Some(upload(&orchestrator, &file).await?),
                (None, session) => session,
            };
            let mut request = AskRequest::new(question);
            if let Some(mode) = mode {
                request = request.with_mode(mode);
            }
            if let Some(id) = session {
                request = request.in_session(id);
            }

            let reply = orchestrator.ask(request).await;
            println!("{}", reply.answer);
            if let Some(chart) = reply.chart {
                println!("{}", serde_json::to_string_pretty(&chart)?);
            }
            eprintln!(
                "[{} | session {} | privacy {}]",
                reply.agent, reply.session_id, reply.privacy_score
            );
        }
        Commands::Upload { file } => {
            let orchestrator = build()?;
            println!("{}", upload(&orchestrator, &file).await?);
        }
        Commands::History { session } => {
            for message in build()?.messages(&session)? {
                println!(
                    "[{}] {:?}: {}",
                    message.timestamp.format("%Y-%m-%d %H:%M:%S"),
                    message.role,
                    message.content
                );
            }
        }
        Commands::Sessions => {
            for summary in build()?.list_sessions()? {
                println!("{}  {}  {}", summary.session_id, summary.updated_at, summary.title);
            }
        }
        Commands::Delete { session } => {
            if build()?.delete_session(&session).await? {
                println!("Deleted {}", session);
            } else {
                println!("No session {}", session);
            }
        }
        Commands::Config { default } => {
            let shown = if default {
                InsightConfig::default()
            } else {
                config.clone()
            };
            println!("{}", serde_json::to_string_pretty(&shown)?);
        }
    }

    Ok(())
}

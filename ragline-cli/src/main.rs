//! Ragline CLI: grounded question answering, chat with tools, and answer
//! evaluation from the terminal.

mod commands;

use clap::Parser;
use std::path::PathBuf;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Ragline: answers grounded in your documents
#[derive(Parser, Debug)]
#[command(name = "ragline", version, about, long_about = None)]
struct Cli {
    /// LLM model to use
    #[arg(short, long, global = true)]
    model: Option<String>,

    /// Workspace directory
    #[arg(short, long, default_value = ".", global = true)]
    workspace: PathBuf,

    /// Increase verbosity (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Suppress non-essential output
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Answer a question from the given documents
    Ask {
        question: String,
        /// Files or directories to ingest (defaults to <workspace>/.ragline/docs)
        #[arg(short, long = "docs")]
        docs: Vec<PathBuf>,
        /// Print the answer as it is generated
        #[arg(long)]
        stream: bool,
        /// Have the judge model evaluate the answer
        #[arg(long)]
        evaluate: bool,
    },
    /// Chat with the model, with date/time and MCP tools available
    Chat {
        message: String,
        /// Continue (and save) a named conversation
        #[arg(short, long)]
        conversation: Option<String>,
        /// System prompt for this message
        #[arg(short, long)]
        system: Option<String>,
        /// Do not offer any tools
        #[arg(long)]
        no_tools: bool,
    },
    /// Judge whether an answer is relevant to a question and the documents
    Eval {
        question: String,
        /// The answer to judge
        #[arg(short, long)]
        answer: String,
        /// Files or directories to ingest (defaults to <workspace>/.ragline/docs)
        #[arg(short, long = "docs")]
        docs: Vec<PathBuf>,
    },
    /// List the tools offered to the chat model
    Tools,
    /// Manage configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(clap::Subcommand, Debug)]
enum ConfigAction {
    /// Write a default config to <workspace>/.ragline/config.toml
    Init,
    /// Show the effective configuration
    Show,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();

    // Human-readable stderr plus JSON file logging
    let filter = match cli.verbose {
        0 if cli.quiet => "error",
        0 => "warn,ragline=info,ragline_core=info,ragline_mcp=info",
        1 => "debug",
        _ => "trace",
    };
    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)));

    let log_dir = directories::ProjectDirs::from("dev", "ragline", "ragline")
        .map(|d| d.data_dir().join("logs"))
        .unwrap_or_else(|| PathBuf::from("."));
    let _ = std::fs::create_dir_all(&log_dir);
    let file_appender = tracing_appender::rolling::daily(&log_dir, "ragline.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);
    let json_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_writer(non_blocking)
        .with_filter(EnvFilter::new("debug"));

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(json_layer)
        .init();

    let workspace = cli
        .workspace
        .canonicalize()
        .unwrap_or_else(|_| std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")));

    if let Commands::Config { action } = cli.command {
        return commands::handle_config(action, &workspace);
    }

    let mut config = ragline_core::config::load_config(Some(&workspace), None)
        .map_err(|e| anyhow::anyhow!("Configuration error: {}", e))?;
    if let Some(model) = &cli.model {
        config.llm.model = model.clone();
    }
    for warning in config.llm.validate() {
        tracing::warn!("{}", warning);
    }

    commands::handle_command(cli.command, config, &workspace).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_ask_with_docs_and_flags() {
        let cli = Cli::try_parse_from([
            "ragline", "-v", "ask", "What is new?", "--docs", "a.md", "--docs", "notes/",
            "--stream", "--model", "gpt-4o",
        ])
        .unwrap();
        assert_eq!(cli.verbose, 1);
        assert_eq!(cli.model.as_deref(), Some("gpt-4o"));
        match cli.command {
            Commands::Ask {
                question,
                docs,
                stream,
                evaluate,
            } => {
                assert_eq!(question, "What is new?");
                assert_eq!(docs, vec![PathBuf::from("a.md"), PathBuf::from("notes/")]);
                assert!(stream);
                assert!(!evaluate);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn test_parse_eval_requires_answer() {
        assert!(Cli::try_parse_from(["ragline", "eval", "Q?"]).is_err());
        let cli = Cli::try_parse_from(["ragline", "eval", "Q?", "--answer", "A."]).unwrap();
        assert!(matches!(cli.command, Commands::Eval { ref answer, .. } if answer == "A."));
    }

    #[test]
    fn test_parse_chat_options() {
        let cli = Cli::try_parse_from([
            "ragline",
            "chat",
            "What is my name?",
            "--conversation",
            "c1",
            "--system",
            "Be brief.",
        ])
        .unwrap();
        match cli.command {
            Commands::Chat {
                conversation,
                system,
                no_tools,
                ..
            } => {
                assert_eq!(conversation.as_deref(), Some("c1"));
                assert_eq!(system.as_deref(), Some("Be brief."));
                assert!(!no_tools);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }
}

//! chatmux - Terminal Client for Streaming Chat
//!
//! Thin front-end over `chatmux-core`: sends a message and prints the answer
//! as it streams, or manages the conversation list.
//!
//! # Usage
//!
//! ```bash
//! # Ask in a new conversation
//! chatmux send "图书馆几点开门？"
//!
//! # Follow up in an existing one
//! chatmux send --conversation 42 "周末呢？"
//!
//! # Manage conversations
//! chatmux list --page 1 --size 20
//! chatmux history 42
//! chatmux new "选课咨询"
//! chatmux rename 42 "开放时间"
//! chatmux delete 42
//!
//! # Verbose logging
//! RUST_LOG=debug chatmux send "hi"
//! ```
//!
//! Answer text goes to stdout; status lines, sources and errors go to stderr.
//!
//! # Exit Codes
//!
//! - `0`: answer streamed (or cancelled with `SIGINT`)
//! - `1`: the stream failed
//! - `75`: the server is at capacity (rate limit, busy, overloaded); retry later
//!
//! # Signals
//!
//! - `SIGINT` during `send`: cancels the stream and exits without an error

use std::io::Write;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing::{debug, info, warn};

use chatmux_core::config::{self, ConfigOverrides};
use chatmux_core::{
    ConversationId, HttpChatStore, HttpTransport, Message, SenderRole, SessionMultiplexer,
    StateKey, StreamFailure, StreamUpdate, UpdateKind,
};

/// Exit code for a send refused because the server is at capacity
const EXIT_BUSY: u8 = 75;

/// chatmux - streaming chat client
#[derive(Parser, Debug)]
#[command(name = "chatmux")]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Configuration file path
    #[arg(short = 'c', long, env = "CHATMUX_CONFIG", value_name = "FILE")]
    config: Option<PathBuf>,

    /// API root of the chat server
    #[arg(long, value_name = "URL")]
    base_url: Option<String>,

    /// Value sent as X-User-Id
    #[arg(long, value_name = "ID")]
    user_id: Option<String>,

    /// Bearer token
    #[arg(long, value_name = "TOKEN")]
    token: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'l', long, env = "CHATMUX_LOG_LEVEL", default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Send a message and stream the answer
    Send {
        /// Message text
        text: String,

        /// Existing conversation; omitted starts a new one
        #[arg(long, value_name = "ID")]
        conversation: Option<i64>,
    },

    /// List conversations
    List {
        /// Page number, starting at 1
        #[arg(long, default_value_t = 1)]
        page: u32,

        /// Page size
        #[arg(long, default_value_t = 20)]
        size: u32,
    },

    /// Print a conversation's history
    History {
        /// Conversation id
        id: i64,
    },

    /// Create an empty conversation
    New {
        /// Title (defaults to the server's "新对话")
        title: Option<String>,
    },

    /// Rename a conversation
    Rename {
        /// Conversation id
        id: i64,
        /// New title
        title: String,
    },

    /// Delete a conversation
    Delete {
        /// Conversation id
        id: i64,
    },
}

/// Initialize logging to stderr
fn init_logging(level: &str) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        tracing_subscriber::EnvFilter::new(format!("chatmux={level},chatmux_core={level}"))
    });

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|e| anyhow::anyhow!("Failed to initialize logging: {e}"))
}

/// Load configuration and wire the multiplexer
fn build_multiplexer(args: &Args) -> Result<SessionMultiplexer> {
    let path = args.config.clone().or_else(config::default_config_path);
    let mut config = config::load_config_from_path(path).context("Failed to load configuration")?;

    ConfigOverrides {
        base_url: args.base_url.clone(),
        user_id: args.user_id.clone(),
        auth_token: args.token.clone(),
    }
    .apply(&mut config);
    config.validate()?;

    debug!(base_url = %config.base_url, user_id = %config.user_id, "Resolved configuration");

    let transport = HttpTransport::from_config(&config).context("Failed to build transport")?;
    let store = HttpChatStore::from_config(&config).context("Failed to build store")?;
    Ok(SessionMultiplexer::new(
        config,
        Arc::new(transport),
        Arc::new(store),
    ))
}

enum Step {
    Updates(Vec<StreamUpdate>),
    Interrupted,
}

/// Stream one answer to the terminal
async fn send(
    mux: &mut SessionMultiplexer,
    text: &str,
    conversation: Option<i64>,
) -> Result<ExitCode> {
    let session = mux.start_stream(text, conversation.map(ConversationId))?;
    info!(session = %session, "Sending");

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    let mut failure = None;
    while mux.active_count() > 0 {
        let step = tokio::select! {
            updates = mux.next_update() => Step::Updates(updates),
            _ = &mut ctrl_c => Step::Interrupted,
        };

        let updates = match step {
            Step::Updates(updates) => updates,
            Step::Interrupted => mux.cancel_session(session),
        };
        for update in &updates {
            if let Some(error) = render(mux, update)? {
                failure = Some(error);
            }
        }
    }

    exit_for(failure)
}

/// Map a send's failure to the process outcome
///
/// Capacity refusals are a warning with their own exit code; anything else
/// is an error.
fn exit_for(failure: Option<StreamFailure>) -> Result<ExitCode> {
    match failure {
        None => Ok(ExitCode::SUCCESS),
        Some(failure) if failure.kind.is_capacity() => {
            warn!(kind = ?failure.kind, detail = %failure.detail, "Server at capacity");
            eprintln!("warning: {}", failure.user_message());
            Ok(ExitCode::from(EXIT_BUSY))
        }
        Some(failure) => bail!(failure.user_message()),
    }
}

fn role_label(role: SenderRole) -> &'static str {
    match role {
        SenderRole::User => "USER",
        SenderRole::Bot => "BOT",
        SenderRole::System => "SYSTEM",
    }
}

/// Print one update; returns the failure that ended the session, if any
fn render(mux: &SessionMultiplexer, update: &StreamUpdate) -> Result<Option<StreamFailure>> {
    let mut stdout = std::io::stdout().lock();
    match &update.kind {
        UpdateKind::Migrated { conversation_id } => {
            eprintln!("[conversation {conversation_id}]");
        }
        UpdateKind::Status { status, .. } if !status.is_empty() => {
            eprintln!("… {status}");
        }
        UpdateKind::Content { text } => {
            write!(stdout, "{text}")?;
            stdout.flush()?;
        }
        UpdateKind::MessageFinalized { intermediate, .. } => {
            writeln!(stdout)?;
            if *intermediate {
                writeln!(stdout)?;
            }
        }
        UpdateKind::Finished => {
            if let Some(message) = mux.messages(update.key).last() {
                print_sources(message);
            }
        }
        UpdateKind::Failed { failure } => {
            writeln!(stdout)?;
            return Ok(Some(failure.clone()));
        }
        UpdateKind::Cancelled => eprintln!("\n[cancelled]"),
        UpdateKind::Status { .. } | UpdateKind::Sources { .. } => {}
    }
    Ok(None)
}

fn print_sources(message: &Message) {
    let Some(meta) = &message.metadata else {
        return;
    };
    for (i, source) in meta.sources.iter().enumerate() {
        eprintln!("[{}] {} ({:.2})", i + 1, source.title, source.similarity);
    }
    if let Some(ms) = meta.response_time_ms {
        eprintln!("({ms} ms)");
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let args = Args::parse();
    init_logging(&args.log_level)?;

    let mut mux = build_multiplexer(&args)?;

    match &args.command {
        Command::Send { text, conversation } => {
            return send(&mut mux, text, *conversation).await;
        }

        Command::List { page, size } => {
            mux.fetch_conversations(*page, *size).await?;
            for conv in mux.conversations() {
                println!(
                    "{}\t{}\t{}\t{}",
                    conv.id,
                    conv.title,
                    conv.message_count,
                    conv.updated_at.as_deref().unwrap_or("-")
                );
            }
        }

        Command::History { id } => {
            let id = ConversationId(*id);
            mux.fetch_messages(id).await?;
            for message in mux.messages(StateKey::Conversation(id)) {
                let role = role_label(message.sender_type);
                println!("[{role}] {}", message.content);
                if message.is_last_in_round {
                    print_sources(message);
                }
            }
        }

        Command::New { title } => {
            let conv = mux.create_conversation(title.as_deref()).await?;
            println!("{}\t{}", conv.id, conv.title);
        }

        Command::Rename { id, title } => {
            mux.rename_conversation(ConversationId(*id), title).await?;
        }

        Command::Delete { id } => {
            mux.delete_conversation(ConversationId(*id)).await?;
        }
    }

    Ok(ExitCode::SUCCESS)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capacity_failure_is_a_warning() {
        let busy = StreamFailure::new(None, "系统繁忙，请稍后再试");
        assert_eq!(exit_for(Some(busy)).unwrap(), ExitCode::from(EXIT_BUSY));

        let limited = StreamFailure::new(Some(429), "too many requests");
        assert_eq!(exit_for(Some(limited)).unwrap(), ExitCode::from(EXIT_BUSY));
    }

    #[test]
    fn test_generic_failure_is_an_error() {
        let failure = StreamFailure::new(Some(500), "boom");
        assert!(exit_for(Some(failure)).is_err());
        assert_eq!(exit_for(None).unwrap(), ExitCode::SUCCESS);
    }

    #[test]
    fn test_role_labels() {
        assert_eq!(role_label(SenderRole::User), "USER");
        assert_eq!(role_label(SenderRole::Bot), "BOT");
        assert_eq!(role_label(SenderRole::System), "SYSTEM");
    }
}

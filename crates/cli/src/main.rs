//! CLI entrypoint and subcommand orchestration.

mod config;
mod media;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use proto::{AgentResponse, ArtifactMeta, ArtifactSummary, ProgressEvent};

#[cfg(not(test))]
use std::sync::Arc;

#[cfg(not(test))]
use agent::{OpenAiProvider, RuntimeOptions, SqliteArtifactStore, StudioRuntime, ToolRegistry, TurnLog};
#[cfg(not(test))]
use config::Config;
#[cfg(not(test))]
use proto::{ConversationId, InboundTurn, MediaAttachment};
#[cfg(not(test))]
use tokio::io::{AsyncBufReadExt, BufReader};
#[cfg(not(test))]
use tokio::sync::mpsc;
#[cfg(not(test))]
use tokio_util::sync::CancellationToken;
#[cfg(not(test))]
use tools::{BackendRouter, HttpMediaBackend, MediaBackend};
#[cfg(not(test))]
use tracing::{info, warn};
#[cfg(not(test))]
use tracing_subscriber::{EnvFilter, Layer, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Top-level command-line arguments.
#[derive(Parser)]
#[command(name = "productstudio")]
#[command(about = "Product photo and video studio assistant", version = "0.1.0")]
struct Cli {
    /// Path to config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Enable debug logging to ~/.productstudio/logs/debug.log
    #[arg(long, default_value_t = false)]
    debug: bool,

    /// Conversation to resume or inspect
    #[arg(long, global = true)]
    conversation: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Interactive chat (default when no subcommand is given)
    Chat,

    /// Send a single message and exit
    Run {
        /// Message to send
        #[arg(short = 'e', long)]
        exec: String,

        /// Media files to upload with the message
        #[arg(long = "attach", value_name = "PATH")]
        attach: Vec<PathBuf>,
    },

    /// Inspect artifacts of a conversation
    Artifacts {
        #[command(subcommand)]
        command: ArtifactCommands,
    },

    /// List stored conversations
    Conversations,

    /// Delete a conversation with all of its artifacts
    Forget,
}

#[derive(Subcommand)]
enum ArtifactCommands {
    /// Latest version of every artifact
    List,
    /// Every version of one artifact
    History { name: String },
    /// Write an artifact version to a file
    Export {
        name: String,
        /// Version to export (latest when omitted)
        #[arg(long)]
        version: Option<u32>,
        #[arg(long)]
        out: PathBuf,
    },
}

/// One line of interactive input.
#[derive(Debug, PartialEq, Eq)]
enum ChatInput {
    Attach(PathBuf),
    ListArtifacts,
    Quit,
    Message(String),
    Empty,
    Unknown(String),
}

fn parse_chat_line(line: &str) -> ChatInput {
    let line = line.trim();
    if line.is_empty() {
        return ChatInput::Empty;
    }
    let Some(command) = line.strip_prefix('/') else {
        return ChatInput::Message(line.to_string());
    };
    let (name, rest) = command.split_once(' ').unwrap_or((command, ""));
    match (name, rest.trim()) {
        ("attach", "") => ChatInput::Unknown("/attach needs a path".to_string()),
        ("attach", path) => ChatInput::Attach(PathBuf::from(path)),
        ("artifacts", _) => ChatInput::ListArtifacts,
        ("quit" | "exit", _) => ChatInput::Quit,
        _ => ChatInput::Unknown(format!("unknown command /{name}")),
    }
}

#[cfg(not(test))]
#[tokio::main]
/// Program entrypoint.
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let command = cli.command.unwrap_or(Commands::Chat);

    let console_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));

    // WorkerGuard must outlive main() so buffered file writes are flushed on exit.
    let _file_guard: Option<tracing_appender::non_blocking::WorkerGuard>;

    if cli.debug {
        let log_dir = config::data_dir().join("logs");
        std::fs::create_dir_all(&log_dir).ok();
        let appender = tracing_appender::rolling::daily(&log_dir, "debug.log");
        let (writer, guard) = tracing_appender::non_blocking(appender);
        _file_guard = Some(guard);

        let console = fmt::layer().with_target(false).with_filter(console_filter);
        let file = fmt::layer()
            .with_writer(writer)
            .with_target(true)
            .with_ansi(false)
            .with_filter(EnvFilter::new("debug,hyper_util=info,reqwest=info,sqlx=info"));
        tracing_subscriber::registry()
            .with(console)
            .with(file)
            .init();
        info!(
            version = env!("CARGO_PKG_VERSION"),
            log_level = %cli.log_level,
            "========== productstudio session start =========="
        );
    } else {
        _file_guard = None;
        fmt()
            .with_env_filter(console_filter)
            .with_target(false)
            .init();
    }

    let config = Config::load(cli.config.as_deref())?;
    let conversation = cli.conversation.map(ConversationId::from);

    match command {
        Commands::Chat => cmd_chat(config, conversation).await,
        Commands::Run { exec, attach } => cmd_run(config, conversation, exec, attach).await,
        Commands::Artifacts { command } => {
            let conversation = require_conversation(conversation)?;
            cmd_artifacts(config, conversation, command).await
        }
        Commands::Conversations => cmd_conversations(config).await,
        Commands::Forget => cmd_forget(config, require_conversation(conversation)?).await,
    }
}

#[cfg(not(test))]
fn require_conversation(conversation: Option<ConversationId>) -> anyhow::Result<ConversationId> {
    conversation.ok_or_else(|| anyhow::anyhow!("--conversation <id> is required for this command"))
}

#[cfg(not(test))]
/// Creates a runtime with the SQLite store, configured backends and LLM provider.
async fn build_runtime(config: &Config) -> anyhow::Result<StudioRuntime> {
    let pool = agent::db::open_pool(&config.database.url).await?;
    let store = Arc::new(SqliteArtifactStore::new(pool.clone()));
    let turn_log = Arc::new(TurnLog::new(pool));

    let api_key = config.resolve_api_key();
    if api_key.is_empty() {
        warn!("No API key configured. Set STUDIO_API_KEY or OPENAI_API_KEY.");
    }
    let llm: Arc<dyn agent::LlmProvider> = match config.agent.effective_base_url() {
        Some(base_url) => Arc::new(OpenAiProvider::with_base_url(&api_key, base_url)),
        None => Arc::new(OpenAiProvider::new(&api_key)),
    };

    let remote = config.backend.endpoint().map(|endpoint| {
        Arc::new(HttpMediaBackend::new(endpoint, config.backend.api_key())) as Arc<dyn MediaBackend>
    });
    if remote.is_none() {
        warn!("No media backend endpoint configured; only local transforms are available");
    }
    let backend = Arc::new(BackendRouter::with_local_transforms(remote));

    Ok(StudioRuntime::new(
        llm,
        store,
        turn_log,
        backend,
        Arc::new(ToolRegistry::builtin()),
        RuntimeOptions {
            model: config.agent.effective_model().to_string(),
            max_tool_rounds: config.agent.max_tool_rounds,
            max_upload_bytes: config.uploads.max_bytes,
        },
    ))
}

#[cfg(not(test))]
/// Runs one turn, printing progress as it arrives. Ctrl-C cancels the turn.
async fn run_turn(runtime: &StudioRuntime, turn: InboundTurn) -> Result<AgentResponse, proto::Error> {
    let cancel = CancellationToken::new();
    let (tx, mut rx) = mpsc::channel::<ProgressEvent>(64);
    let printer = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            if let Some(line) = format_progress(&event) {
                eprintln!("{line}");
            }
        }
    });

    // The turn future is never dropped early: Ctrl-C only fires the token and
    // the runtime unwinds itself, keeping the transcript consistent.
    let turn = runtime.process_turn(turn, &cancel, Some(tx));
    tokio::pin!(turn);
    let mut watching = true;
    let result = loop {
        tokio::select! {
            result = &mut turn => break result,
            signal = tokio::signal::ctrl_c(), if watching => {
                watching = false;
                match signal {
                    Ok(()) => {
                        eprintln!("Cancelling...");
                        cancel.cancel();
                    }
                    Err(e) => warn!("Ctrl-C handler unavailable: {e}"),
                }
            }
        }
    };
    printer.await.ok();
    result
}

#[cfg(not(test))]
async fn cmd_chat(config: Config, conversation: Option<ConversationId>) -> anyhow::Result<()> {
    let runtime = build_runtime(&config).await?;
    let conversation = conversation.unwrap_or_default();
    println!("Conversation {conversation}");
    println!("Commands: /attach <path>, /artifacts, /quit");

    let mut pending: Vec<MediaAttachment> = Vec::new();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        match parse_chat_line(&line) {
            ChatInput::Empty => {}
            ChatInput::Quit => break,
            ChatInput::Unknown(msg) => eprintln!("{msg}"),
            ChatInput::Attach(path) => match media::read_attachment(&path).await {
                Ok(attachment) => {
                    println!("Attached {} (sent with your next message)", path.display());
                    pending.push(attachment);
                }
                Err(e) => eprintln!("Error: {e:#}"),
            },
            ChatInput::ListArtifacts => {
                let listed = runtime.artifacts(&conversation).await?;
                println!("{}", format_artifact_list(&listed));
            }
            ChatInput::Message(text) => {
                let mut turn = InboundTurn::text(conversation.clone(), text);
                for attachment in pending.drain(..) {
                    turn = turn.with_media(attachment);
                }
                match run_turn(&runtime, turn).await {
                    Ok(response) => println!("{}", format_response(&response)),
                    Err(e) => eprintln!("Error: {e}"),
                }
            }
        }
    }

    runtime.close_conversation(&conversation, false).await?;
    println!("Resume with: productstudio --conversation {conversation}");
    Ok(())
}

#[cfg(not(test))]
async fn cmd_run(
    config: Config,
    conversation: Option<ConversationId>,
    exec: String,
    attach: Vec<PathBuf>,
) -> anyhow::Result<()> {
    let runtime = build_runtime(&config).await?;
    let conversation = conversation.unwrap_or_default();

    let mut turn = InboundTurn::text(conversation.clone(), exec);
    for path in &attach {
        turn = turn.with_media(media::read_attachment(path).await?);
    }

    let response = run_turn(&runtime, turn).await?;
    println!("{}", format_response(&response));
    runtime.close_conversation(&conversation, false).await?;
    eprintln!("Conversation {conversation}");
    Ok(())
}

#[cfg(not(test))]
async fn cmd_artifacts(
    config: Config,
    conversation: ConversationId,
    command: ArtifactCommands,
) -> anyhow::Result<()> {
    let runtime = build_runtime(&config).await?;
    let store = runtime.store();
    match command {
        ArtifactCommands::List => {
            println!("{}", format_artifact_list(&store.list(&conversation).await?));
        }
        ArtifactCommands::History { name } => {
            for meta in store.history(&conversation, &name).await? {
                println!("{}", format_history_line(&meta));
            }
        }
        ArtifactCommands::Export { name, version, out } => {
            let artifact = store.get(&conversation, &name, version).await?;
            tokio::fs::write(&out, &artifact.data).await?;
            println!(
                "Wrote {} ({} bytes) to {}",
                artifact.meta.artifact_ref(),
                artifact.meta.size_bytes,
                out.display()
            );
        }
    }
    Ok(())
}

#[cfg(not(test))]
async fn cmd_conversations(config: Config) -> anyhow::Result<()> {
    let runtime = build_runtime(&config).await?;
    for summary in runtime.turn_log().list_conversations().await? {
        println!(
            "{}  {}  {:>4} msgs  {}",
            summary.id,
            summary.updated_at.format("%Y-%m-%d %H:%M"),
            summary.message_count,
            summary.title
        );
    }
    Ok(())
}

#[cfg(not(test))]
async fn cmd_forget(config: Config, conversation: ConversationId) -> anyhow::Result<()> {
    let runtime = build_runtime(&config).await?;
    let report = runtime.close_conversation(&conversation, true).await?;
    println!(
        "Removed {} artifact version(s){}",
        report.artifacts_removed,
        if report.transcript_removed { " and the transcript" } else { "" }
    );
    Ok(())
}

fn format_artifact_list(artifacts: &[ArtifactSummary]) -> String {
    if artifacts.is_empty() {
        return "No artifacts yet.".to_string();
    }
    artifacts
        .iter()
        .enumerate()
        .map(|(i, a)| {
            format!(
                "{:>2}. {}@v{} ({}, {})",
                i + 1,
                a.name,
                a.latest_version,
                a.media_kind,
                a.produced_by
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn format_history_line(meta: &ArtifactMeta) -> String {
    let inputs = if meta.inputs.is_empty() {
        "-".to_string()
    } else {
        meta.inputs
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(", ")
    };
    format!(
        "v{}  {}  {} bytes  by {}  from {}",
        meta.version,
        meta.created_at.format("%Y-%m-%d %H:%M:%S"),
        meta.size_bytes,
        meta.produced_by,
        inputs
    )
}

fn format_response(response: &AgentResponse) -> String {
    let mut out = response.content.clone();
    if !response.produced.is_empty() {
        let produced: Vec<String> = response.produced.iter().map(ToString::to_string).collect();
        out.push_str(&format!("\n\nProduced: {}", produced.join(", ")));
    }
    for step in &response.failed_steps {
        out.push_str(&format!(
            "\nFailed: {} ({}): {}",
            step.tool_name, step.error_kind, step.message
        ));
    }
    for rejected in &response.rejected_uploads {
        out.push_str(&format!("\nRejected upload {}: {}", rejected.item, rejected.reason));
    }
    out
}

fn format_progress(event: &ProgressEvent) -> Option<String> {
    match event {
        ProgressEvent::UploadStored { artifact, media_kind } => {
            Some(format!("  stored {artifact} ({media_kind})"))
        }
        ProgressEvent::UploadRejected { item, reason } => {
            Some(format!("  rejected {item}: {reason}"))
        }
        ProgressEvent::Thinking { .. } => None,
        ProgressEvent::ToolCallStarted {
            tool_name, inputs, ..
        } => Some(format!("  {tool_name}({})...", inputs.join(", "))),
        ProgressEvent::ToolCallFinished {
            tool_name,
            output: Some(output),
            ..
        } => Some(format!("  {tool_name} -> {output}")),
        ProgressEvent::ToolCallFinished {
            tool_name, error, ..
        } => Some(format!(
            "  {tool_name} failed: {}",
            error.as_deref().unwrap_or("unknown error")
        )),
    }
}

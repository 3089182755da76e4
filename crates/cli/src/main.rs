mod config;
mod error;

use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{Local, TimeZone};
use clap::{Parser, Subcommand};
use runtime::{ChatEventKind, ChatRequest, ConnectionManager, OllamaBackend, Orchestrator};
use serde_json::Value;
use storage::{Conversation, MessageStore, Role, SqliteStore, ToolCatalogStore, UserId};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use config::Config;
use error::{Error, Result};

const CONFIG_FILE: &str = "rigging.toml";
const DB_FILE: &str = "rigging.db";
const USER_ID_FILE: &str = "user_id";

#[derive(Parser)]
#[command(name = "rigging")]
#[command(about = "Chat with a local model that can call MCP tool servers", long_about = None)]
#[command(version)]
struct Cli {
    /// Config file
    #[arg(short, long, global = true, default_value = CONFIG_FILE)]
    config: PathBuf,

    /// Log debug output to stderr
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start an interactive chat
    Chat {
        /// Continue a conversation (ID prefix match supported)
        #[arg(long)]
        conversation: Option<String>,
        /// Connect a local server script, in addition to configured ones
        #[arg(long = "server")]
        servers: Vec<PathBuf>,
        /// Connect a remote server URL, in addition to configured ones
        #[arg(long = "url")]
        urls: Vec<String>,
    },
    /// List the models installed on the Ollama host
    Models,
    /// List the stored tool catalog
    Tools,
    /// List conversations
    Conversations {
        /// Show only the last N conversations
        #[arg(short, long, default_value = "10")]
        limit: usize,
    },
    /// Print a conversation transcript
    History {
        /// Conversation ID (prefix match supported)
        #[arg(short, long)]
        conversation: String,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    if let Err(e) = run(cli).await {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

fn init_tracing(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
        .init();
}

async fn run(cli: Cli) -> Result<()> {
    let config = Config::load_or_default(&cli.config)?.with_env();

    match cli.command {
        Some(Commands::Chat {
            conversation,
            servers,
            urls,
        }) => cmd_chat(config, conversation.as_deref(), servers, urls).await,
        None => cmd_chat(config, None, Vec::new(), Vec::new()).await,
        Some(Commands::Models) => cmd_models(&config).await,
        Some(Commands::Tools) => cmd_tools(&config).await,
        Some(Commands::Conversations { limit }) => cmd_conversations(&config, limit).await,
        Some(Commands::History { conversation }) => cmd_history(&config, &conversation).await,
    }
}

async fn cmd_chat(
    config: Config,
    conversation: Option<&str>,
    servers: Vec<PathBuf>,
    urls: Vec<String>,
) -> Result<()> {
    println!("rigging v{}", env!("CARGO_PKG_VERSION"));

    let data_dir = data_dir();
    std::fs::create_dir_all(&data_dir)?;
    let db_path = db_path(&config, &data_dir);
    let store = Arc::new(SqliteStore::open(&db_path)?);
    let user_id = user_id(&config, &data_dir)?;
    println!("Conversations stored at: {}", db_path.display());

    let tools = Arc::new(ConnectionManager::new(Arc::clone(&store)));
    let mut options = config.mcp.clone();
    options.server_paths.extend(servers);
    options.server_urls.extend(urls);

    let result = tools.connect_with_options(user_id, &options).await;
    for error in &result.errors {
        eprintln!("Warning: {error}");
    }
    for outcome in result.outcomes.iter().filter(|o| o.connected()) {
        println!("Connected to {} ({} tools)", outcome.server, outcome.tools);
    }

    let mut conversation_id = match conversation {
        Some(prefix) => {
            let found = find_conversation(&*store, user_id, prefix).await?;
            println!("Continuing: {}", found.title);
            Some(found.id)
        }
        None => None,
    };

    let backend = OllamaBackend::builder().host(&config.backend.host).build();
    println!("Backend: {backend}");
    println!("Model: {}", config.backend.model);
    println!("Type 'quit' or Ctrl+D to exit.\n");

    let orchestrator = Arc::new(Orchestrator::new(
        backend,
        Arc::clone(&store),
        Arc::clone(&tools),
        config.orchestrator(),
    ));

    let stdin = io::stdin();
    let mut stdout = io::stdout();

    loop {
        print!("> ");
        stdout.flush()?;

        let mut line = String::new();
        if stdin.lock().read_line(&mut line)? == 0 {
            break;
        }

        let input = line.trim();
        if input.is_empty() {
            continue;
        }
        if input == "quit" || input == "exit" {
            break;
        }

        let mut request = ChatRequest::new(user_id, input);
        request.conversation_id = conversation_id;
        let mut events = orchestrator.stream_chat(request);

        println!();
        // Length of the round's text already on screen.
        let mut shown = 0;
        while let Some(event) = events.recv().await {
            match event.kind {
                ChatEventKind::Message { content } => {
                    print!("{}", content.get(shown..).unwrap_or(&content));
                    stdout.flush()?;
                    shown = content.len();
                }
                ChatEventKind::ToolCall { name, arguments } => {
                    if shown > 0 {
                        println!();
                        shown = 0;
                    }
                    println!("[tool] {name} {}", Value::Object(arguments));
                }
                ChatEventKind::ToolResult {
                    name,
                    content,
                    is_error,
                    ..
                } => {
                    let label = if is_error { "tool error" } else { "tool result" };
                    println!("[{label}] {name}: {}", truncate(&content, 200));
                }
                ChatEventKind::Error { message, .. } => {
                    eprintln!("Error: {message}");
                }
                ChatEventKind::Done {
                    conversation_id: id,
                } => {
                    conversation_id = Some(id);
                }
            }
        }
        println!("\n");
    }

    let closed = tools.disconnect_all(user_id).await;
    if !closed.is_empty() {
        println!("\nDisconnected: {}", closed.join(", "));
    }
    println!("\nChat ended.");
    Ok(())
}

async fn cmd_models(config: &Config) -> Result<()> {
    let backend = OllamaBackend::builder().host(&config.backend.host).build();
    let models = backend
        .list_models()
        .await
        .map_err(runtime::Error::from)?;

    if models.is_empty() {
        println!("No models installed on {}.", config.backend.host);
        return Ok(());
    }

    println!("{:<40}  {:>10}  DEFAULT", "MODEL", "SIZE");
    println!("{}", "-".repeat(80));

    for model in models {
        let default = if model.name == config.backend.model { "*" } else { "" };
        println!("{:<40}  {:>10}  {default}", model.name, format_size(model.size));
    }

    Ok(())
}

/// Human-readable byte count, one decimal place from KB up.
fn format_size(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["KB", "MB", "GB", "TB"];
    if bytes < 1000 {
        return format!("{bytes} B");
    }
    let mut value = bytes as f64;
    let mut unit = "B";
    for next in UNITS {
        if value < 1000.0 {
            break;
        }
        value /= 1000.0;
        unit = next;
    }
    format!("{value:.1} {unit}")
}

async fn cmd_tools(config: &Config) -> Result<()> {
    let (store, user_id) = open_store(config)?;
    let tools = store.find_tools(user_id).await?;

    if tools.is_empty() {
        println!("No tools found. Connect a server with 'rigging chat' first.");
        return Ok(());
    }

    println!("{:<40}  {:<8}  DESCRIPTION", "TOOL", "ENABLED");
    println!("{}", "-".repeat(80));

    for tool in tools {
        let enabled = if tool.enabled { "yes" } else { "no" };
        println!(
            "{:<40}  {:<8}  {}",
            tool.qualified_name,
            enabled,
            truncate(&tool.description, 60)
        );
    }

    Ok(())
}

async fn cmd_conversations(config: &Config, limit: usize) -> Result<()> {
    let (store, user_id) = open_store(config)?;
    let conversations = store.find_conversations(user_id).await?;

    if conversations.is_empty() {
        println!("No conversations found.");
        return Ok(());
    }

    println!("{:<36}  {:<16}  TITLE", "CONVERSATION ID", "STARTED");
    println!("{}", "-".repeat(80));

    for conversation in conversations.into_iter().take(limit) {
        let started = Local
            .from_utc_datetime(&conversation.created_at.naive_utc())
            .format("%Y-%m-%d %H:%M");
        println!("{:<36}  {:<16}  {}", conversation.id, started, conversation.title);
    }

    Ok(())
}

async fn cmd_history(config: &Config, prefix: &str) -> Result<()> {
    let (store, user_id) = open_store(config)?;
    let conversation = find_conversation(&store, user_id, prefix).await?;
    let messages = store.find_messages(conversation.id).await?;

    println!("Conversation: {} ({})\n", conversation.id, conversation.title);

    for message in messages {
        let time = Local
            .from_utc_datetime(&message.created_at.naive_utc())
            .format("%H:%M:%S");
        let role = match message.role {
            Role::User => "USER",
            Role::Assistant => "ASSISTANT",
            Role::Tool => "TOOL",
        };
        if !message.content.is_empty() {
            println!("[{time}] {role}: {}", truncate(&message.content, 200));
        }
        for call in &message.tool_calls {
            println!(
                "[{time}] TOOL CALL: {} {}",
                call.name,
                Value::Object(call.arguments.clone())
            );
        }
    }

    Ok(())
}

async fn find_conversation<S: MessageStore>(
    store: &S,
    user_id: UserId,
    prefix: &str,
) -> Result<Conversation> {
    let conversations = store.find_conversations(user_id).await?;
    let mut matching: Vec<Conversation> = conversations
        .into_iter()
        .filter(|c| c.id.to_string().starts_with(prefix))
        .collect();

    match matching.len() {
        0 => Err(Error::ConversationNotFound {
            prefix: prefix.to_string(),
        }),
        1 => Ok(matching.remove(0)),
        _ => Err(Error::AmbiguousConversation {
            prefix: prefix.to_string(),
            matches: matching.iter().map(|c| c.id.to_string()).collect(),
        }),
    }
}

fn truncate(text: &str, max_chars: usize) -> String {
    let single_line = text.replace('\n', " ");
    if single_line.chars().count() > max_chars {
        let head: String = single_line.chars().take(max_chars).collect();
        format!("{head}...")
    } else {
        single_line
    }
}

fn open_store(config: &Config) -> Result<(SqliteStore, UserId)> {
    let data_dir = data_dir();
    let db_path = db_path(config, &data_dir);

    if !db_path.exists() {
        return Err(Error::DatabaseNotFound { path: db_path });
    }

    let store = SqliteStore::open(&db_path)?;
    Ok((store, user_id(config, &data_dir)?))
}

fn db_path(config: &Config, data_dir: &Path) -> PathBuf {
    config
        .storage
        .path
        .clone()
        .unwrap_or_else(|| data_dir.join(DB_FILE))
}

/// The configured user, or one generated on first use and kept on disk.
fn user_id(config: &Config, data_dir: &Path) -> Result<UserId> {
    if let Some(id) = config.user_id {
        return Ok(id);
    }

    let path = data_dir.join(USER_ID_FILE);
    match std::fs::read_to_string(&path) {
        Ok(content) => Ok(content.trim().parse()?),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            let id = UserId::new();
            std::fs::create_dir_all(data_dir)?;
            std::fs::write(&path, id.to_string())?;
            tracing::info!(user = %id, "generated local user id");
            Ok(id)
        }
        Err(e) => Err(e.into()),
    }
}

fn data_dir() -> PathBuf {
    dirs_data_dir().unwrap_or_else(|| ".rigging".into())
}

fn dirs_data_dir() -> Option<PathBuf> {
    #[cfg(target_os = "macos")]
    {
        std::env::var_os("HOME").map(|h| PathBuf::from(h).join(".local/share/rigging"))
    }
    #[cfg(target_os = "linux")]
    {
        std::env::var_os("XDG_DATA_HOME")
            .map(PathBuf::from)
            .or_else(|| std::env::var_os("HOME").map(|h| PathBuf::from(h).join(".local/share")))
            .map(|p| p.join("rigging"))
    }
    #[cfg(target_os = "windows")]
    {
        std::env::var_os("APPDATA").map(|h| PathBuf::from(h).join("rigging"))
    }
    #[cfg(not(any(target_os = "macos", target_os = "linux", target_os = "windows")))]
    {
        None
    }
}

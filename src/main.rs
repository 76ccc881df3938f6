use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use dive_stream::config::resolve_config;
use dive_stream::{
    Attachment, ChatEngine, ChatError, Collaborators, ElicitationRequest, Message,
    PendingAuthorization, SessionKey,
};
use tokio::io::AsyncWriteExt;
use tracing::warn;
use tracing_subscriber::EnvFilter;

/// Chat with the agent backend from a terminal
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to the config file (defaults to the platform config directory)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Send a message and stream the answer
    Send {
        text: String,

        /// Continue an existing conversation
        #[arg(long)]
        chat: Option<String>,

        /// Attach a file (repeatable)
        #[arg(long = "file", value_name = "PATH")]
        files: Vec<PathBuf>,
    },

    /// Print a stored conversation
    Show {
        #[arg(value_name = "CHAT_ID")]
        chat_id: String,
    },
}

/// Prints interactive requests; the terminal cannot complete them
struct TerminalCollaborators;

#[async_trait::async_trait]
impl Collaborators for TerminalCollaborators {
    fn prompt_authorization(&self, pending: &PendingAuthorization) {
        eprintln!(
            "\n[{} needs authorization] open {}",
            pending.tool_name, pending.auth_url
        );
    }

    fn elicitation_requested(&self, request: &ElicitationRequest) {
        eprintln!("\n[input requested] {}", request.message);
    }
}

fn init_tracing() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("dive_stream=info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

fn last_text(engine: &ChatEngine, key: &SessionKey) -> String {
    engine
        .session(key)
        .and_then(|view| view.messages.last().map(|m| m.text.clone()))
        .unwrap_or_default()
}

/// Write whatever part of the answer has not been printed yet
async fn print_progress(text: &str, printed: &mut usize) {
    if text.len() < *printed || !text.is_char_boundary(*printed) {
        *printed = 0;
    }
    let fresh = &text[*printed..];
    if fresh.is_empty() {
        return;
    }
    let mut stdout = tokio::io::stdout();
    let _ = stdout.write_all(fresh.as_bytes()).await;
    let _ = stdout.flush().await;
    *printed = text.len();
}

async fn send(
    engine: ChatEngine,
    text: String,
    chat: Option<String>,
    files: Vec<PathBuf>,
) -> Result<(), ChatError> {
    let attachments = files
        .into_iter()
        .map(|path| Attachment::Reference(path.to_string_lossy().into_owned()))
        .collect();
    let handle = engine
        .send(chat.map(SessionKey::bound), text, attachments)
        .await?;
    let started = handle.key().clone();

    let mut updates = engine.registry().subscribe();
    let printer = {
        let engine = engine.clone();
        let started = started.clone();
        tokio::spawn(async move {
            let mut printed = 0;
            while updates.changed().await.is_ok() {
                let key = engine.resolve(&started);
                print_progress(&last_text(&engine, &key), &mut printed).await;
            }
        })
    };

    let finished = handle.finished();
    tokio::pin!(finished);
    let key = tokio::select! {
        key = &mut finished => key?,
        _ = tokio::signal::ctrl_c() => {
            if let Err(e) = engine.abort(&started).await {
                warn!(error = %e, "abort failed");
            }
            finished.await?
        }
    };
    printer.abort();

    let view = engine.session(&key);
    if let Some(last) = view.as_ref().and_then(|v| v.messages.last()) {
        println!();
        if last.is_error {
            eprintln!("[error] {}", last.text.trim());
        }
    }
    match key.chat_id() {
        Some(id) => eprintln!("chat id: {}", id),
        None => eprintln!("conversation was not assigned an id"),
    }
    Ok(())
}

fn print_message(message: &Message) {
    if message.is_sent {
        println!("> {}", message.text);
    } else {
        println!("{}", message.text);
    }
    for file in &message.files {
        println!("  [file] {}", file.name());
    }
    println!();
}

async fn show(engine: ChatEngine, chat_id: String) -> Result<(), ChatError> {
    let session = engine.load(&chat_id).await?;
    if let Some(title) = &session.title {
        println!("# {}\n", title);
    }
    for message in &session.messages {
        print_message(message);
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), ChatError> {
    init_tracing();
    let cli = Cli::parse();

    let config = resolve_config(cli.config.as_deref())?;
    let engine = ChatEngine::from_config(&config, Arc::new(TerminalCollaborators))?;

    match cli.command {
        Commands::Send { text, chat, files } => send(engine, text, chat, files).await,
        Commands::Show { chat_id } => show(engine, chat_id).await,
    }
}

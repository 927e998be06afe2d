use std::io::{self, Write};
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use pixelstream_contracts::conversations::{ConversationStore, ConversationUpdate, Message};
use pixelstream_contracts::events::SseWriter;
use pixelstream_contracts::request::{AttachmentRef, GenerationOptions, GenerationRequest};
use pixelstream_engine::{
    mime_for_path, EngineConfig, GenerationEngine, GenerationSummary, StreamOutcome,
    DEFAULT_ATTACHMENT_MIME,
};
use serde_json::{json, Value};
use tracing_subscriber::EnvFilter;

const HISTORY_WINDOW: usize = 6;

#[derive(Debug, Parser)]
#[command(name = "pixelstream", version, about = "Streaming image generation CLI")]
struct Cli {
    /// Overrides PIXELSTREAM_DATA_DIR.
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,
    /// Overrides PIXELSTREAM_MODEL (`dryrun` works offline).
    #[arg(long, global = true)]
    model: Option<String>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run one generation and stream its events to stdout as SSE frames.
    Generate(GenerateArgs),
    #[command(subcommand)]
    Conversations(ConversationsCommand),
    /// Print the valid aspect ratios, image sizes and modes.
    Options,
}

#[derive(Debug, Args)]
struct GenerateArgs {
    #[arg(long, default_value = "")]
    prompt: String,
    /// Upload or generated file name, optionally suffixed with `:<mime>`.
    #[arg(long = "attach")]
    attachments: Vec<String>,
    #[arg(long)]
    aspect_ratio: Option<String>,
    #[arg(long)]
    image_size: Option<String>,
    #[arg(long, default_value = "standard")]
    mode: String,
    #[arg(long)]
    edit_type: Option<String>,
    /// Ask for the image only (standard mode).
    #[arg(long)]
    no_text: bool,
    /// Read history from, and record the turn into, this conversation.
    #[arg(long)]
    conversation: Option<String>,
}

#[derive(Debug, Subcommand)]
enum ConversationsCommand {
    List,
    Show {
        id: String,
    },
    Create {
        #[arg(long)]
        title: Option<String>,
    },
    Rename {
        id: String,
        title: String,
    },
    Delete {
        id: String,
    },
    DeleteMessage {
        id: String,
        index: usize,
    },
}

fn main() {
    init_tracing();
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("pixelstream error: {err:#}");
            std::process::exit(1);
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env("PIXELSTREAM_LOG").unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    let mut config = EngineConfig::from_env();
    if let Some(data_dir) = cli.data_dir {
        config.data_dir = data_dir;
    }
    if let Some(model) = cli.model {
        config.model = model;
    }

    match cli.command {
        Command::Generate(args) => run_generate(&config, args),
        Command::Conversations(command) => {
            config.ensure_dirs()?;
            let store = open_store(&config)?;
            run_conversations(&store, command)?;
            Ok(0)
        }
        Command::Options => {
            print_json(&serde_json::to_value(GenerationOptions::catalog())?)?;
            Ok(0)
        }
    }
}

fn run_generate(config: &EngineConfig, args: GenerateArgs) -> Result<i32> {
    let engine = GenerationEngine::new(config)?;
    let store = match &args.conversation {
        Some(_) => Some(open_store(config)?),
        None => None,
    };

    let mut request = GenerationRequest::new(args.prompt.clone());
    request.attachments = args
        .attachments
        .iter()
        .map(|raw| parse_attachment(raw))
        .collect();
    request.aspect_ratio = args.aspect_ratio.clone();
    request.image_size = args.image_size.clone();
    request.mode = args.mode.clone();
    request.edit_type = args.edit_type.clone();
    request.include_text = !args.no_text;
    if let (Some(store), Some(id)) = (&store, &args.conversation) {
        request.history = history_window(store.get(id)?.messages);
    }
    let attachments = request.attachments.clone();

    let mut sink = SseWriter::new(io::stdout().lock());
    let outcome = engine
        .run(request, &mut sink)
        .map_err(|err| anyhow!("invalid request: {err}"))?;

    match outcome {
        StreamOutcome::Completed(summary) => {
            if let (Some(store), Some(id)) = (&store, &args.conversation) {
                let turn = conversation_turn(&args.prompt, &args.mode, &attachments, &summary);
                store
                    .append_messages(id, turn)
                    .with_context(|| format!("failed to record turn in conversation {id}"))?;
                tracing::info!("recorded turn in conversation {id}");
            }
            Ok(0)
        }
        StreamOutcome::Abandoned => {
            tracing::warn!("stdout closed before the stream finished");
            Ok(1)
        }
        StreamOutcome::PolicyBlocked
        | StreamOutcome::Interrupted(_)
        | StreamOutcome::Failed(_) => Ok(2),
    }
}

fn run_conversations(store: &ConversationStore, command: ConversationsCommand) -> Result<()> {
    match command {
        ConversationsCommand::List => {
            let rows = store
                .list()
                .into_iter()
                .map(|conversation| {
                    json!({
                        "id": conversation.id,
                        "title": conversation.title,
                        "messages": conversation.messages.len(),
                        "updated_at": conversation.updated_at,
                    })
                })
                .collect::<Vec<_>>();
            print_json(&Value::Array(rows))
        }
        ConversationsCommand::Show { id } => print_json(&serde_json::to_value(store.get(&id)?)?),
        ConversationsCommand::Create { title } => {
            print_json(&serde_json::to_value(store.create(title.as_deref())?)?)
        }
        ConversationsCommand::Rename { id, title } => {
            let update = ConversationUpdate {
                title: Some(title),
                messages: None,
            };
            print_json(&serde_json::to_value(store.update(&id, update)?)?)
        }
        ConversationsCommand::Delete { id } => {
            store.delete(&id)?;
            print_json(&json!({ "deleted": id }))
        }
        ConversationsCommand::DeleteMessage { id, index } => {
            let messages = store.delete_message(&id, index)?;
            print_json(&json!({ "id": id, "messages": messages }))
        }
    }
}

/// `name` or `name:mime/type`; without a MIME the extension decides.
fn parse_attachment(raw: &str) -> AttachmentRef {
    if let Some((name, mime)) = raw.rsplit_once(':') {
        if mime.contains('/') && !name.is_empty() {
            return AttachmentRef {
                filename: name.to_string(),
                mime_type: mime.to_string(),
            };
        }
    }
    AttachmentRef {
        filename: raw.to_string(),
        mime_type: mime_for_path(Path::new(raw))
            .unwrap_or(DEFAULT_ATTACHMENT_MIME)
            .to_string(),
    }
}

fn history_window(messages: Vec<Message>) -> Vec<Message> {
    let skip = messages.len().saturating_sub(HISTORY_WINDOW);
    messages.into_iter().skip(skip).collect()
}

fn open_store(config: &EngineConfig) -> Result<ConversationStore> {
    let store = ConversationStore::open(config.conversations_path())?;
    tracing::debug!("conversation store at {}", store.path().display());
    Ok(store)
}

fn conversation_turn(
    prompt: &str,
    mode: &str,
    attachments: &[AttachmentRef],
    summary: &GenerationSummary,
) -> Vec<Message> {
    let mut user = Message::user(prompt);
    user.extra.insert("mode".to_string(), Value::String(mode.to_string()));
    if !attachments.is_empty() {
        user.extra.insert("files".to_string(), json!(attachments));
    }

    let mut model = Message::model(summary.full_text.clone(), Some(summary.image.path.clone()));
    if !summary.thinking.is_empty() {
        model
            .extra
            .insert("thinking".to_string(), Value::String(summary.thinking.clone()));
    }
    if !summary.thinking_images.is_empty() {
        model
            .extra
            .insert("thinking_images".to_string(), json!(summary.thinking_images));
    }
    if let Some(grounding) = summary.grounding.as_ref().filter(|grounding| !grounding.is_empty()) {
        model.extra.insert("grounding".to_string(), json!(grounding));
    }
    vec![user, model]
}

fn print_json(value: &Value) -> Result<()> {
    let mut out = io::stdout().lock();
    serde_json::to_writer_pretty(&mut out, value)?;
    writeln!(out)?;
    Ok(())
}

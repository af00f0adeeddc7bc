use std::{path::PathBuf, sync::Arc, time::Duration};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use client_core::{
    siblings::SiblingStep,
    speech::{AudioClip, SpeechSession},
    stream::StreamState,
    thread::render_thread,
    ChatClient, ChatHandle, ClientEvent,
};
use shared::domain::{Author, ChatId, NodeId};
use tokio::sync::broadcast;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

mod config;
mod speech;

use config::{load_settings, DEFAULT_SETTINGS_FILE};
use speech::EspeakSynthesizer;

#[derive(Parser, Debug)]
#[command(name = "chat-cli", version, about = "Terminal client for the chat service")]
struct Args {
    /// Settings file; missing files fall back to defaults.
    #[arg(long, default_value = DEFAULT_SETTINGS_FILE)]
    config: PathBuf,
    /// Overrides the configured API base URL.
    #[arg(long)]
    api_base: Option<String>,
    /// Read finished replies aloud.
    #[arg(long)]
    speak: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List chats, newest first.
    Chats {
        #[arg(long, default_value_t = 0)]
        page: u32,
        #[arg(long)]
        size: Option<u32>,
    },
    New {
        #[arg(long)]
        title: Option<String>,
    },
    /// Print the current thread of a chat with version markers.
    Show { chat: String },
    Send {
        chat: String,
        text: String,
        /// Seconds to wait for the streamed reply.
        #[arg(long, default_value_t = 120)]
        wait: u64,
    },
    Edit {
        chat: String,
        node: String,
        text: String,
        #[arg(long, default_value_t = 120)]
        wait: u64,
    },
    Regenerate {
        chat: String,
        #[arg(long, default_value_t = 120)]
        wait: u64,
    },
    Stop { chat: String },
    Rename { chat: String, title: String },
    Delete { chat: String },
    DeleteAll,
    /// Switch a message to its previous or next version.
    Versions {
        chat: String,
        node: String,
        #[arg(value_enum)]
        direction: Direction,
    },
    Transcribe {
        file: PathBuf,
        #[arg(long, default_value = "audio/webm")]
        mime: String,
    },
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Direction {
    Prev,
    Next,
}

impl From<Direction> for SiblingStep {
    fn from(direction: Direction) -> Self {
        match direction {
            Direction::Prev => SiblingStep::Previous,
            Direction::Next => SiblingStep::Next,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let mut settings = load_settings(&args.config)?;
    if let Some(api_base) = args.api_base.clone() {
        settings.api_base = api_base;
    }

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(settings.log_filter.as_str()));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let client = ChatClient::new(settings.client_config()?);
    let speech = Arc::new(SpeechSession::new(Arc::new(EspeakSynthesizer::default())));
    speech.set_auto_reply(args.speak || settings.auto_reply);
    let follower = speech.follow(client.subscribe_events());

    let page_size = settings.page_size;
    let result = run(&client, args.command, page_size).await;

    tokio::task::yield_now().await;
    if speech.is_speaking().await {
        wait_for_speech(&speech).await;
    }
    follower.abort();
    result
}

async fn run(client: &Arc<ChatClient>, command: Command, page_size: u32) -> Result<()> {
    match command {
        Command::Chats { page, size } => {
            let chats = client.list_chats(page, size.unwrap_or(page_size)).await?;
            for chat in chats {
                println!(
                    "{}  {}  {}",
                    chat.id,
                    chat.create_time.format("%Y-%m-%d %H:%M"),
                    chat.title
                );
            }
        }
        Command::New { title } => {
            let chat = client.create_chat(title.as_deref()).await?;
            println!("{}  {}", chat.id, chat.title);
        }
        Command::Show { chat } => {
            client.select_chat(&ChatId::new(chat)).await?;
            print_thread(client).await;
        }
        Command::Send { chat, text, wait } => {
            let chat_id = ChatId::new(chat);
            let events = open(client, &chat_id).await?;
            client.post_message(&chat_id, &text).await?;
            await_reply(client, events, wait).await;
        }
        Command::Edit {
            chat,
            node,
            text,
            wait,
        } => {
            let chat_id = ChatId::new(chat);
            let events = open(client, &chat_id).await?;
            client
                .edit_message(&chat_id, &NodeId::new(node), &text)
                .await?;
            await_reply(client, events, wait).await;
        }
        Command::Regenerate { chat, wait } => {
            let chat_id = ChatId::new(chat);
            let events = open(client, &chat_id).await?;
            client.regenerate_response(&chat_id).await?;
            await_reply(client, events, wait).await;
        }
        Command::Stop { chat } => {
            let chat_id = ChatId::new(chat);
            client.select_chat(&chat_id).await?;
            client.stop_generating(&chat_id).await?;
            println!("stopped generation in {chat_id}");
        }
        Command::Rename { chat, title } => {
            let chat = client
                .update_chat_title(&ChatId::new(chat), &title)
                .await?;
            println!("{}  {}", chat.id, chat.title);
        }
        Command::Delete { chat } => {
            let chat_id = ChatId::new(chat);
            client.delete_chat(&chat_id).await?;
            println!("deleted {chat_id}");
        }
        Command::DeleteAll => {
            client.delete_all_chats().await?;
            println!("deleted all chats");
        }
        Command::Versions {
            chat,
            node,
            direction,
        } => {
            let chat_id = ChatId::new(chat);
            client.select_chat(&chat_id).await?;
            let shown = client
                .switch_version(&chat_id, &NodeId::new(node), direction.into())
                .await?;
            info!(node_id = %shown, "showing version");
            print_thread(client).await;
        }
        Command::Transcribe { file, mime } => {
            let bytes = tokio::fs::read(&file)
                .await
                .with_context(|| format!("failed to read {}", file.display()))?;
            let file_name = file
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_else(|| "audio".to_string());
            let transcription = client
                .transcribe(AudioClip::new(bytes, file_name, mime))
                .await?;
            println!("{}", transcription.text);
        }
    }
    Ok(())
}

/// Selects `chat_id` and requires a live stream, since replies arrive over it.
async fn open(
    client: &Arc<ChatClient>,
    chat_id: &ChatId,
) -> Result<broadcast::Receiver<ClientEvent>> {
    let events = client.subscribe_events();
    client.select_chat(chat_id).await?;
    let stream = client.stream_snapshot();
    if stream.state != StreamState::Open {
        let reason = stream
            .last_error
            .map(|err| err.to_string())
            .unwrap_or_else(|| "stream closed".to_string());
        bail!("cannot follow replies for {chat_id}: {reason}");
    }
    Ok(events)
}

async fn await_reply(
    client: &Arc<ChatClient>,
    mut events: broadcast::Receiver<ClientEvent>,
    wait_secs: u64,
) {
    let waited = tokio::time::timeout(Duration::from_secs(wait_secs), async {
        loop {
            match events.recv().await {
                Ok(ClientEvent::MessageFinalized { .. }) => return,
                Ok(ClientEvent::StreamStateChanged(snapshot))
                    if snapshot.state == StreamState::Closed =>
                {
                    warn!(error = ?snapshot.last_error, "stream closed before the reply finished");
                    return;
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => return,
            }
        }
    })
    .await;
    if waited.is_err() {
        warn!(wait_secs, "gave up waiting for the reply");
    }
    print_thread(client).await;
}

async fn wait_for_speech(speech: &SpeechSession) {
    while speech.is_speaking().await {
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

async fn print_thread(client: &ChatClient) {
    let store = client.conversation_snapshot().await;
    if let Some(title) = store.title().filter(|title| !title.is_empty()) {
        println!("# {title}");
    }
    let (Some(mapping), Some(current)) = (store.mapping(), store.current_node()) else {
        println!("(empty conversation)");
        return;
    };

    for entry in render_thread(mapping, current) {
        let who = match entry.author() {
            Author::User => "you",
            Author::Assistant => "assistant",
        };
        let versions = if entry.versions.has_versions() {
            format!(" <{}/{}>", entry.versions.position, entry.versions.total)
        } else {
            String::new()
        };
        let streaming = if entry.is_streaming() { " …" } else { "" };
        println!("[{}] {who}{versions}: {}{streaming}", entry.node_id(), entry.text);
    }
}

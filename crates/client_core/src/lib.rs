use std::sync::Arc;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder};
use serde::de::DeserializeOwned;
use shared::{
    domain::{Chat, ChatId, Conversation, NodeId},
    error::DomainError,
    protocol::{
        ConversationQuery, CreateChatRequest, EditMessageQuery, ListChatsQuery,
        MessageContentRequest, Transcription, UpdateTitleRequest,
    },
};
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, error, info, warn};

pub mod config;
pub mod directory;
pub mod error;
pub mod events;
pub mod reconciler;
pub mod siblings;
pub mod speech;
pub mod status;
pub mod stream;
pub mod thread;
pub mod tree;

pub use config::ClientConfig;
pub use error::{ClientError, ClientResult};
pub use events::ClientEvent;

use directory::{sort_newest_first, ChatDirectory};
use events::merge_events;
use reconciler::Reconciler;
use siblings::{move_sibling, SiblingStep};
use speech::{AudioClip, HttpTranscriber, Transcriber};
use status::{Concern, RequestStatus, RequestStatuses};
use stream::{SseConnector, StreamConnector, StreamSession, StreamSnapshot};
use tree::TreeStore;

pub const DEFAULT_CHAT_TITLE: &str = "New Chat";
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Request Orchestrator: the REST surface of the chat service, feeding every
/// conversation payload through the [`Reconciler`].
#[async_trait]
pub trait ChatHandle: Send + Sync {
    /// Fetches one page of chat summaries, merges it into the directory and
    /// returns that page newest first. [`ChatClient::chats`] has everything loaded.
    async fn list_chats(&self, page: u32, size: u32) -> ClientResult<Vec<Chat>>;
    async fn create_chat(&self, title: Option<&str>) -> ClientResult<Chat>;
    async fn update_chat_title(&self, chat_id: &ChatId, title: &str) -> ClientResult<Chat>;
    async fn delete_chat(&self, chat_id: &ChatId) -> ClientResult<()>;
    async fn delete_all_chats(&self) -> ClientResult<()>;
    async fn select_chat(&self, chat_id: &ChatId) -> ClientResult<()>;
    async fn deselect_chat(&self);
    async fn fetch_conversation(
        &self,
        chat_id: &ChatId,
        query: ConversationQuery,
    ) -> ClientResult<()>;
    /// Not idempotent. Never retried.
    async fn post_message(&self, chat_id: &ChatId, text: &str) -> ClientResult<()>;
    async fn edit_message(&self, chat_id: &ChatId, node_id: &NodeId, text: &str)
        -> ClientResult<()>;
    async fn regenerate_response(&self, chat_id: &ChatId) -> ClientResult<()>;
    async fn stop_generating(&self, chat_id: &ChatId) -> ClientResult<()>;
    /// Moves to the neighbouring version of `node_id` and returns the node now shown.
    async fn switch_version(
        &self,
        chat_id: &ChatId,
        node_id: &NodeId,
        step: SiblingStep,
    ) -> ClientResult<NodeId>;
    async fn transcribe(&self, clip: AudioClip) -> ClientResult<Transcription>;
    fn subscribe_events(&self) -> broadcast::Receiver<ClientEvent>;
}

pub struct ChatClient {
    http: Client,
    config: ClientConfig,
    conversation: Arc<Mutex<Reconciler>>,
    chats: Mutex<ChatDirectory>,
    statuses: Mutex<RequestStatuses>,
    stream: StreamSession,
    transcriber: Arc<dyn Transcriber>,
    events: broadcast::Sender<ClientEvent>,
}

impl ChatClient {
    pub fn new(config: ClientConfig) -> Arc<Self> {
        let http = Client::new();
        let connector = Arc::new(SseConnector::new(http.clone(), config.clone()));
        let transcriber = Arc::new(HttpTranscriber::new(http.clone(), config.clone()));
        Self::new_with_dependencies(http, config, connector, transcriber)
    }

    pub fn new_with_dependencies(
        http: Client,
        config: ClientConfig,
        connector: Arc<dyn StreamConnector>,
        transcriber: Arc<dyn Transcriber>,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let conversation = Arc::new(Mutex::new(Reconciler::new()));
        let stream = StreamSession::new(connector, Arc::clone(&conversation), events.clone());
        Arc::new(Self {
            http,
            config,
            conversation,
            chats: Mutex::new(ChatDirectory::new()),
            statuses: Mutex::new(RequestStatuses::default()),
            stream,
            transcriber,
            events,
        })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Copy of the Tree Store, for deriving the thread outside the lock.
    pub async fn conversation_snapshot(&self) -> TreeStore {
        self.conversation.lock().await.store().clone()
    }

    pub async fn selected_chat(&self) -> Option<ChatId> {
        self.conversation.lock().await.selected_chat().cloned()
    }

    pub async fn is_assistant_responding(&self) -> bool {
        self.conversation.lock().await.is_assistant_responding()
    }

    /// Chat summaries, newest first.
    pub async fn chats(&self) -> Vec<Chat> {
        self.chats.lock().await.sorted()
    }

    pub async fn request_status(&self, concern: Concern) -> RequestStatus {
        self.statuses.lock().await.get(concern)
    }

    pub fn stream_snapshot(&self) -> StreamSnapshot {
        self.stream.snapshot()
    }

    async fn set_status(&self, concern: Concern, status: RequestStatus) {
        let changed = self.statuses.lock().await.set(concern, status);
        if changed {
            let _ = self
                .events
                .send(ClientEvent::RequestStatusChanged { concern, status });
        }
    }

    async fn track<T>(&self, concern: Concern, result: ClientResult<T>) -> ClientResult<T> {
        match &result {
            Ok(_) => self.set_status(concern, RequestStatus::Succeeded).await,
            Err(err) => {
                error!(concern = ?concern, error = %err, "request failed");
                self.set_status(concern, RequestStatus::Failed).await;
            }
        }
        result
    }

    async fn emit_chats(&self) {
        let chats = self.chats.lock().await.sorted();
        let _ = self.events.send(ClientEvent::ChatsUpdated(chats));
    }

    async fn send_json<T: DeserializeOwned>(
        &self,
        request: RequestBuilder,
        endpoint: &str,
    ) -> ClientResult<T> {
        request
            .send()
            .await
            .and_then(|response| response.error_for_status())
            .map_err(ClientError::transport(endpoint))?
            .json()
            .await
            .map_err(ClientError::transport(endpoint))
    }

    async fn send_empty(&self, request: RequestBuilder, endpoint: &str) -> ClientResult<()> {
        request
            .send()
            .await
            .and_then(|response| response.error_for_status())
            .map_err(ClientError::transport(endpoint))?;
        Ok(())
    }

    /// Routes a conversation payload into the tree. A payload for a chat that is
    /// no longer selected is dropped without failing the call; the result is
    /// then `false`.
    async fn reconcile(&self, incoming: Conversation, whole: bool) -> ClientResult<bool> {
        let mut reconciler = self.conversation.lock().await;
        let applied = if whole {
            reconciler.apply_full_conversation(incoming)
        } else {
            reconciler.apply_conversation_diff(incoming)
        };
        match applied {
            Ok(outcome) => {
                for event in merge_events(&reconciler, &outcome) {
                    let _ = self.events.send(event);
                }
                Ok(true)
            }
            Err(err) if err.is_stale() => {
                warn!(error = %err, "discarding response for a chat that is no longer selected");
                Ok(false)
            }
            Err(err) => Err(err.into()),
        }
    }

    /// A new generation may only be requested on the selected chat while
    /// nothing is streaming.
    async fn ensure_can_generate(&self, chat_id: &ChatId) -> ClientResult<()> {
        let reconciler = self.conversation.lock().await;
        match reconciler.selected_chat() {
            None => Err(DomainError::NoChatSelected.into()),
            Some(selected) if selected != chat_id => Err(DomainError::ChatNotSelected {
                requested: chat_id.clone(),
            }
            .into()),
            Some(_) if reconciler.is_assistant_responding() => {
                Err(DomainError::GenerationInFlight {
                    chat_id: chat_id.clone(),
                }
                .into())
            }
            Some(_) => Ok(()),
        }
    }

    /// The conversation status follows the selected chat only.
    async fn begin_conversation(&self, chat_id: &ChatId) {
        if self.selected_chat().await.as_ref() == Some(chat_id) {
            self.set_status(Concern::Conversation, RequestStatus::Loading)
                .await;
        }
    }

    /// Records how a conversation request for `chat_id` ended. Outcomes for a
    /// chat that is no longer selected leave the status alone, and a dropped
    /// payload for the selected chat returns it to `Idle`.
    async fn settle_conversation(
        &self,
        chat_id: &ChatId,
        outcome: ClientResult<bool>,
    ) -> ClientResult<()> {
        if self.selected_chat().await.as_ref() != Some(chat_id) {
            debug!(chat_id = %chat_id, "request settled after the chat was left");
            return outcome.map(|_| ());
        }
        match outcome {
            Ok(false) => {
                self.set_status(Concern::Conversation, RequestStatus::Idle)
                    .await;
                Ok(())
            }
            outcome => self.track(Concern::Conversation, outcome.map(|_| ())).await,
        }
    }

    async fn conversation_call(
        &self,
        chat_id: &ChatId,
        request: RequestBuilder,
        endpoint: &str,
    ) -> ClientResult<()> {
        self.begin_conversation(chat_id).await;
        let outcome = match self.send_json::<Conversation>(request, endpoint).await {
            Ok(conversation) => self.reconcile(conversation, false).await,
            Err(err) => Err(err),
        };
        self.settle_conversation(chat_id, outcome).await
    }

    fn conversation_endpoint(&self, chat_id: &ChatId) -> String {
        self.config.endpoint(&format!("chats/{chat_id}/conversation"))
    }
}

#[async_trait]
impl ChatHandle for ChatClient {
    async fn list_chats(&self, page: u32, size: u32) -> ClientResult<Vec<Chat>> {
        self.set_status(Concern::ChatList, RequestStatus::Loading).await;
        let endpoint = self.config.endpoint("chats");
        let fetched: ClientResult<Vec<Chat>> = self
            .send_json(
                self.http
                    .get(&endpoint)
                    .query(&ListChatsQuery { page, size }),
                &endpoint,
            )
            .await;
        let mut chats = self.track(Concern::ChatList, fetched).await?;

        debug!(page, size, count = chats.len(), "listed chats");
        self.chats.lock().await.extend(chats.iter().cloned());
        self.emit_chats().await;
        sort_newest_first(&mut chats);
        Ok(chats)
    }

    async fn create_chat(&self, title: Option<&str>) -> ClientResult<Chat> {
        let title = title
            .map(str::trim)
            .filter(|title| !title.is_empty())
            .unwrap_or(DEFAULT_CHAT_TITLE);
        let endpoint = self.config.endpoint("chats");
        self.set_status(Concern::ChatList, RequestStatus::Loading).await;
        let created: ClientResult<Chat> = self
            .send_json(
                self.http.post(&endpoint).json(&CreateChatRequest {
                    title: title.to_string(),
                }),
                &endpoint,
            )
            .await;
        let chat = self.track(Concern::ChatList, created).await?;

        info!(chat_id = %chat.id, "created chat");
        self.chats.lock().await.upsert(chat.clone());
        self.emit_chats().await;
        Ok(chat)
    }

    async fn update_chat_title(&self, chat_id: &ChatId, title: &str) -> ClientResult<Chat> {
        let endpoint = self.config.endpoint(&format!("chats/{chat_id}"));
        self.set_status(Concern::ChatList, RequestStatus::Loading).await;
        let renamed: ClientResult<Chat> = self
            .send_json(
                self.http.patch(&endpoint).json(&UpdateTitleRequest {
                    title: title.to_string(),
                }),
                &endpoint,
            )
            .await;
        let chat = self.track(Concern::ChatList, renamed).await?;

        self.chats.lock().await.upsert(chat.clone());
        self.emit_chats().await;

        let current_node = {
            let reconciler = self.conversation.lock().await;
            match reconciler.selected_chat() {
                Some(selected) if selected == chat_id => Some(
                    reconciler
                        .store()
                        .current_node()
                        .cloned()
                        .unwrap_or_default(),
                ),
                _ => None,
            }
        };
        if let Some(current_node) = current_node {
            let mut retitled = Conversation::empty(chat_id.clone());
            retitled.title = chat.title.clone();
            retitled.current_node = current_node;
            self.reconcile(retitled, false).await?;
        }
        Ok(chat)
    }

    async fn delete_chat(&self, chat_id: &ChatId) -> ClientResult<()> {
        let endpoint = self.config.endpoint(&format!("chats/{chat_id}"));
        self.set_status(Concern::ChatList, RequestStatus::Loading).await;
        let deleted = self.send_empty(self.http.delete(&endpoint), &endpoint).await;
        self.track(Concern::ChatList, deleted).await?;

        info!(chat_id = %chat_id, "deleted chat");
        self.chats.lock().await.remove(chat_id);
        self.emit_chats().await;
        if self.selected_chat().await.as_ref() == Some(chat_id) {
            self.deselect_chat().await;
        }
        Ok(())
    }

    async fn delete_all_chats(&self) -> ClientResult<()> {
        let endpoint = self.config.endpoint("chats");
        self.set_status(Concern::ChatList, RequestStatus::Loading).await;
        let deleted = self.send_empty(self.http.delete(&endpoint), &endpoint).await;
        self.track(Concern::ChatList, deleted).await?;

        info!("deleted all chats");
        self.chats.lock().await.clear();
        self.emit_chats().await;
        self.deselect_chat().await;
        Ok(())
    }

    async fn select_chat(&self, chat_id: &ChatId) -> ClientResult<()> {
        if chat_id.is_empty() {
            self.deselect_chat().await;
            return Ok(());
        }

        self.conversation.lock().await.select(chat_id.clone());
        let _ = self.events.send(ClientEvent::ConversationUpdated {
            chat_id: chat_id.clone(),
            changed: Vec::new(),
            assistant_responding: false,
        });

        if let Err(err) = self.stream.start(chat_id.clone()).await {
            let _ = self.events.send(ClientEvent::Error(err.to_string()));
        }

        let window = self.config.conversation_window;
        self.fetch_conversation(
            chat_id,
            ConversationQuery::window(window.upper_limit, window.lower_limit),
        )
        .await
    }

    async fn deselect_chat(&self) {
        self.stream.stop().await;
        self.conversation.lock().await.deselect();
        self.set_status(Concern::Conversation, RequestStatus::Idle)
            .await;
    }

    async fn fetch_conversation(
        &self,
        chat_id: &ChatId,
        query: ConversationQuery,
    ) -> ClientResult<()> {
        self.begin_conversation(chat_id).await;
        let endpoint = self.conversation_endpoint(chat_id);
        let whole = query.is_whole_conversation();

        let fetched: ClientResult<Conversation> = self
            .send_json(self.http.get(&endpoint).query(&query), &endpoint)
            .await;
        let outcome = match fetched {
            Ok(conversation) => self.reconcile(conversation, whole).await,
            Err(err) => Err(err),
        };
        self.settle_conversation(chat_id, outcome).await
    }

    async fn post_message(&self, chat_id: &ChatId, text: &str) -> ClientResult<()> {
        if text.trim().is_empty() {
            return Err(DomainError::EmptyMessage.into());
        }
        self.ensure_can_generate(chat_id).await?;

        let endpoint = self.conversation_endpoint(chat_id);
        self.conversation_call(
            chat_id,
            self.http.post(&endpoint).json(&MessageContentRequest {
                content: text.to_string(),
            }),
            &endpoint,
        )
        .await
    }

    async fn edit_message(
        &self,
        chat_id: &ChatId,
        node_id: &NodeId,
        text: &str,
    ) -> ClientResult<()> {
        if text.trim().is_empty() {
            return Err(DomainError::EmptyMessage.into());
        }
        self.ensure_can_generate(chat_id).await?;
        if !self.conversation.lock().await.store().contains(node_id) {
            return Err(DomainError::UnknownNode(node_id.clone()).into());
        }

        let endpoint = self.conversation_endpoint(chat_id);
        self.conversation_call(
            chat_id,
            self.http
                .patch(&endpoint)
                .query(&EditMessageQuery {
                    node_id: node_id.clone(),
                })
                .json(&MessageContentRequest {
                    content: text.to_string(),
                }),
            &endpoint,
        )
        .await
    }

    async fn regenerate_response(&self, chat_id: &ChatId) -> ClientResult<()> {
        self.ensure_can_generate(chat_id).await?;

        let endpoint = self
            .config
            .endpoint(&format!("chats/{chat_id}/conversation/regenerated-response"));
        self.conversation_call(chat_id, self.http.post(&endpoint), &endpoint)
            .await
    }

    async fn stop_generating(&self, chat_id: &ChatId) -> ClientResult<()> {
        let endpoint = self.config.endpoint(&format!(
            "chats/{chat_id}/conversation/stop-response-generating"
        ));
        self.begin_conversation(chat_id).await;
        let stopped = self.send_empty(self.http.post(&endpoint), &endpoint).await;
        self.settle_conversation(chat_id, stopped.map(|()| true))
            .await?;

        let mut reconciler = self.conversation.lock().await;
        match reconciler.mark_generation_stopped(chat_id) {
            Ok(()) => {
                info!(chat_id = %chat_id, "generation stopped");
                let _ = self.events.send(ClientEvent::ConversationUpdated {
                    chat_id: chat_id.clone(),
                    changed: Vec::new(),
                    assistant_responding: false,
                });
            }
            Err(err) => warn!(chat_id = %chat_id, error = %err, "stop for a chat that is not selected"),
        }
        Ok(())
    }

    async fn switch_version(
        &self,
        chat_id: &ChatId,
        node_id: &NodeId,
        step: SiblingStep,
    ) -> ClientResult<NodeId> {
        let target = {
            let reconciler = self.conversation.lock().await;
            if reconciler.selected_chat() != Some(chat_id) {
                return Err(DomainError::ChatNotSelected {
                    requested: chat_id.clone(),
                }
                .into());
            }
            let mapping = reconciler
                .store()
                .mapping()
                .filter(|mapping| mapping.contains_key(node_id))
                .ok_or_else(|| DomainError::UnknownNode(node_id.clone()))?;
            move_sibling(mapping, node_id, step)
        };
        if &target == node_id {
            return Ok(target);
        }

        debug!(chat_id = %chat_id, from = %node_id, to = %target, "switching version");
        self.fetch_conversation(
            chat_id,
            ConversationQuery::from_node(target.clone(), 0, self.config.version_window_lower),
        )
        .await?;
        Ok(target)
    }

    async fn transcribe(&self, clip: AudioClip) -> ClientResult<Transcription> {
        Ok(self.transcriber.transcribe(clip).await?)
    }

    fn subscribe_events(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }
}

#[cfg(test)]
#[path = "tests/fixtures.rs"]
mod fixtures;

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;

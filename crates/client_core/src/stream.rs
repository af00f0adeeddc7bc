//! Stream Session Manager: at most one live SSE connection, scoped to the
//! selected chat, feeding the [`Reconciler`].

use std::sync::Arc;

use async_trait::async_trait;
use eventsource_stream::Eventsource;
use futures::{stream::BoxStream, StreamExt};
use reqwest::{header, Client};
use shared::{
    domain::{ChatId, ChatNode, Conversation, Mapping, NodeId},
    protocol::{ContentFragment, StreamPayload},
};
use thiserror::Error;
use tokio::{
    sync::{broadcast, oneshot, watch, Mutex},
    task::JoinHandle,
};
use tracing::{debug, error, info, warn};

use crate::{
    config::ClientConfig,
    events::{merge_events, ClientEvent},
    reconciler::{MergeOutcome, ReconcileError, Reconciler, StreamedFragment},
};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StreamError {
    #[error("failed to open stream for chat {chat_id}: {message}")]
    Connect { chat_id: ChatId, message: String },
    #[error("stream transport failed: {0}")]
    Transport(String),
    #[error("malformed stream payload: {0}")]
    MalformedPayload(String),
}

/// Raw `data` fields of inbound events, in transport order.
pub type PayloadStream = BoxStream<'static, Result<String, StreamError>>;

#[async_trait]
pub trait StreamConnector: Send + Sync {
    async fn connect(&self, chat_id: &ChatId) -> Result<PayloadStream, StreamError>;
}

pub struct SseConnector {
    http: Client,
    config: ClientConfig,
}

impl SseConnector {
    pub fn new(http: Client, config: ClientConfig) -> Self {
        Self { http, config }
    }
}

#[async_trait]
impl StreamConnector for SseConnector {
    async fn connect(&self, chat_id: &ChatId) -> Result<PayloadStream, StreamError> {
        let url = self
            .config
            .endpoint(&format!("chats/{chat_id}/conversation/sse"));
        let response = self
            .http
            .get(&url)
            .header(header::ACCEPT, "text/event-stream")
            .send()
            .await
            .and_then(|response| response.error_for_status())
            .map_err(|err| StreamError::Connect {
                chat_id: chat_id.clone(),
                message: err.to_string(),
            })?;

        let payloads = response
            .bytes_stream()
            .eventsource()
            .filter_map(|event| async move {
                match event {
                    Ok(event) if event.data.trim().is_empty() => None,
                    Ok(event) => Some(Ok(event.data)),
                    Err(err) => Some(Err(StreamError::Transport(err.to_string()))),
                }
            });
        Ok(payloads.boxed())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum StreamState {
    #[default]
    Closed,
    Connecting,
    Open,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct StreamSnapshot {
    pub state: StreamState,
    pub chat_id: Option<ChatId>,
    pub last_error: Option<StreamError>,
    /// Incremented on every start/stop so a superseded reader cannot report state.
    pub generation: u64,
}

/// The one connection, pending or open. Dropping it aborts the reader task,
/// which cancels a connect still in flight or closes the socket.
struct ActiveStream {
    chat_id: ChatId,
    reader: JoinHandle<()>,
}

impl Drop for ActiveStream {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

pub struct StreamSession {
    connector: Arc<dyn StreamConnector>,
    conversation: Arc<Mutex<Reconciler>>,
    events: broadcast::Sender<ClientEvent>,
    snapshot: Arc<watch::Sender<StreamSnapshot>>,
    active: Mutex<Option<ActiveStream>>,
}

impl StreamSession {
    pub fn new(
        connector: Arc<dyn StreamConnector>,
        conversation: Arc<Mutex<Reconciler>>,
        events: broadcast::Sender<ClientEvent>,
    ) -> Self {
        let (snapshot, _) = watch::channel(StreamSnapshot::default());
        Self {
            connector,
            conversation,
            events,
            snapshot: Arc::new(snapshot),
            active: Mutex::new(None),
        }
    }

    pub fn snapshot(&self) -> StreamSnapshot {
        self.snapshot.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<StreamSnapshot> {
        self.snapshot.subscribe()
    }

    /// Opens the stream for `chat_id`, closing any stream of another chat first.
    /// An empty id behaves like [`StreamSession::stop`].
    ///
    /// The connect runs on the reader task, so the `active` slot is never held
    /// across it. If the attempt is superseded by `stop` or another `start`
    /// before it resolves, this returns `Ok` without a stream.
    pub async fn start(&self, chat_id: ChatId) -> Result<(), StreamError> {
        if chat_id.is_empty() {
            self.stop().await;
            return Ok(());
        }

        let opened = {
            let mut active = self.active.lock().await;
            let current = self.snapshot();
            if let Some(open) = active.as_ref() {
                if open.chat_id == chat_id && current.state == StreamState::Open {
                    debug!(chat_id = %chat_id, "stream already open");
                    return Ok(());
                }
            }
            if let Some(previous) = active.take() {
                info!(chat_id = %previous.chat_id, "closing stream before opening another");
            }

            let generation = current.generation + 1;
            self.publish(StreamSnapshot {
                state: StreamState::Connecting,
                chat_id: Some(chat_id.clone()),
                last_error: None,
                generation,
            });

            let (opened_tx, opened_rx) = oneshot::channel();
            let reader = StreamReader {
                chat_id: chat_id.clone(),
                generation,
                conversation: Arc::clone(&self.conversation),
                events: self.events.clone(),
                snapshot: Arc::clone(&self.snapshot),
            };
            *active = Some(ActiveStream {
                chat_id: chat_id.clone(),
                reader: tokio::spawn(reader.run(Arc::clone(&self.connector), opened_tx)),
            });
            opened_rx
        };

        match opened.await {
            Ok(result) => result,
            Err(_) => {
                debug!(chat_id = %chat_id, "stream attempt superseded before it opened");
                Ok(())
            }
        }
    }

    /// Closes the active stream, if any, and moves to `Closed`.
    pub async fn stop(&self) {
        let mut active = self.active.lock().await;
        if let Some(previous) = active.take() {
            info!(chat_id = %previous.chat_id, "stream closed");
        }
        let generation = self.snapshot.borrow().generation + 1;
        self.publish(StreamSnapshot {
            state: StreamState::Closed,
            chat_id: None,
            last_error: None,
            generation,
        });
    }

    fn publish(&self, snapshot: StreamSnapshot) {
        self.snapshot.send_replace(snapshot.clone());
        let _ = self.events.send(ClientEvent::StreamStateChanged(snapshot));
    }
}

struct StreamReader {
    chat_id: ChatId,
    generation: u64,
    conversation: Arc<Mutex<Reconciler>>,
    events: broadcast::Sender<ClientEvent>,
    snapshot: Arc<watch::Sender<StreamSnapshot>>,
}

impl StreamReader {
    async fn run(
        self,
        connector: Arc<dyn StreamConnector>,
        opened: oneshot::Sender<Result<(), StreamError>>,
    ) {
        let payloads = match connector.connect(&self.chat_id).await {
            Ok(payloads) => payloads,
            Err(err) => {
                error!(chat_id = %self.chat_id, error = %err, "failed to open stream");
                self.transition(StreamState::Closed, Some(err.clone()));
                let _ = opened.send(Err(err));
                return;
            }
        };

        info!(chat_id = %self.chat_id, "stream open");
        self.transition(StreamState::Open, None);
        let _ = opened.send(Ok(()));
        self.read(payloads).await;
    }

    async fn read(&self, mut payloads: PayloadStream) {
        while let Some(item) = payloads.next().await {
            match item {
                Ok(data) => self.handle(&data).await,
                Err(err) => {
                    error!(chat_id = %self.chat_id, error = %err, "stream transport error");
                    self.transition(StreamState::Closed, Some(err));
                    return;
                }
            }
        }
        info!(chat_id = %self.chat_id, "stream ended by server");
        self.transition(StreamState::Closed, None);
    }

    async fn handle(&self, data: &str) {
        let payload = match serde_json::from_str::<StreamPayload>(data) {
            Ok(payload) => payload,
            Err(err) => {
                let err = StreamError::MalformedPayload(err.to_string());
                warn!(chat_id = %self.chat_id, error = %err, "dropping stream payload");
                let _ = self.events.send(ClientEvent::Error(err.to_string()));
                return;
            }
        };

        let mut reconciler = self.conversation.lock().await;
        match route_payload(&mut reconciler, &self.chat_id, payload) {
            Ok(outcomes) => {
                for outcome in &outcomes {
                    for event in merge_events(&reconciler, outcome) {
                        let _ = self.events.send(event);
                    }
                }
            }
            Err(err) => {
                warn!(chat_id = %self.chat_id, error = %err, "stream payload not applied");
            }
        }
    }

    /// Moves this reader's own generation forward; a closed or superseded
    /// generation is left alone.
    fn transition(&self, state: StreamState, error: Option<StreamError>) {
        let mut published = None;
        self.snapshot.send_if_modified(|snapshot| {
            if snapshot.generation != self.generation || snapshot.state == StreamState::Closed {
                return false;
            }
            snapshot.state = state;
            snapshot.last_error = error;
            published = Some(snapshot.clone());
            true
        });
        if let Some(snapshot) = published {
            let _ = self.events.send(ClientEvent::StreamStateChanged(snapshot));
        }
    }
}

/// Hands one parsed payload to the reconciler's entry points.
///
/// A content fragment appends to its node. A conversation-shaped payload
/// inserts nodes the store has not seen through a diff (linking each into its
/// parent's children), then appends the parts carried by already-known nodes.
pub fn route_payload(
    reconciler: &mut Reconciler,
    stream_chat: &ChatId,
    payload: StreamPayload,
) -> Result<Vec<MergeOutcome>, ReconcileError> {
    match payload {
        StreamPayload::Content(fragment) => {
            route_content(reconciler, stream_chat, fragment).map(|outcome| vec![outcome])
        }
        StreamPayload::Conversation(conversation) => route_conversation(reconciler, conversation),
    }
}

fn route_content(
    reconciler: &mut Reconciler,
    stream_chat: &ChatId,
    fragment: ContentFragment,
) -> Result<MergeOutcome, ReconcileError> {
    let chat_id = fragment.chat_id.unwrap_or_else(|| stream_chat.clone());
    let parts = if fragment.content.is_empty() {
        Vec::new()
    } else {
        vec![fragment.content]
    };
    reconciler.apply_streamed_fragment(
        &chat_id,
        &fragment.node_id,
        &StreamedFragment {
            parts,
            is_final: fragment.is_final,
        },
    )
}

fn route_conversation(
    reconciler: &mut Reconciler,
    conversation: Conversation,
) -> Result<Vec<MergeOutcome>, ReconcileError> {
    match reconciler.selected_chat() {
        Some(selected) if *selected == conversation.id => {}
        Some(selected) => {
            return Err(ReconcileError::StaleResponse {
                expected: selected.clone(),
                received: conversation.id,
            })
        }
        None => return Err(ReconcileError::NoSelection),
    }

    let Conversation {
        id,
        title,
        create_time,
        current_node,
        mapping,
    } = conversation;

    let store = reconciler.store();
    let (fresh, mut known): (Vec<ChatNode>, Vec<ChatNode>) =
        mapping.into_values().partition(|node| !store.contains(&node.id));
    known.sort_by(|a, b| a.id.cmp(&b.id));

    let mut inserted: Mapping = fresh
        .into_iter()
        .map(|node| (node.id.clone(), node))
        .collect();
    let links: Vec<(NodeId, NodeId)> = inserted
        .values()
        .filter_map(|node| node.parent.clone().map(|parent| (node.id.clone(), parent)))
        .collect();
    for (child, parent) in links {
        if !inserted.contains_key(&parent) {
            if let Some(stored) = store.get(&parent) {
                inserted.insert(parent.clone(), stored.clone());
            }
        }
        if let Some(parent) = inserted.get_mut(&parent) {
            if !parent.children.contains(&child) {
                parent.children.push(child);
            }
        }
    }

    let moves_pointer = !current_node.is_empty() && store.current_node() != Some(&current_node);
    let renames = !title.is_empty() && store.title() != Some(title.as_str());

    let mut outcomes = Vec::new();
    if !inserted.is_empty() || moves_pointer || renames {
        outcomes.push(reconciler.apply_conversation_diff(Conversation {
            id: id.clone(),
            title,
            create_time,
            current_node,
            mapping: inserted,
        })?);
    }

    for node in known {
        let content = node.message.content;
        if content.parts.is_empty() && !content.is_final {
            continue;
        }
        let fragment = StreamedFragment {
            parts: content.parts,
            is_final: content.is_final,
        };
        match reconciler.apply_streamed_fragment(&id, &node.id, &fragment) {
            Ok(outcome) => outcomes.push(outcome),
            Err(err @ ReconcileError::NodeFinalized(_)) => {
                debug!(node_id = %node.id, error = %err, "skipping parts for final node");
            }
            Err(err) => return Err(err),
        }
    }
    Ok(outcomes)
}

#[cfg(test)]
#[path = "tests/stream_tests.rs"]
mod tests;

use std::{
    collections::{HashMap, VecDeque},
    convert::Infallible,
    sync::{
        atomic::{AtomicBool, Ordering},
        Mutex as StdMutex,
    },
    time::Duration,
};

use axum::{
    extract::{Path, State},
    http::{Method, StatusCode, Uri},
    response::sse::{Event, Sse},
    routing::{get, patch, post},
    Json, Router,
};
use chrono::{TimeZone, Utc};
use futures::{stream::BoxStream, StreamExt};
use tokio::{net::TcpListener, sync::mpsc};
use tokio_stream::wrappers::UnboundedReceiverStream;

use super::*;
use crate::{
    fixtures::{assistant, conversation, texts, user},
    stream::StreamState,
    thread::build_thread,
};

#[derive(Clone, Default)]
struct ChatService {
    chats: Arc<StdMutex<Vec<Chat>>>,
    conversations: Arc<StdMutex<HashMap<String, Conversation>>>,
    replies: Arc<StdMutex<VecDeque<Conversation>>>,
    requests: Arc<StdMutex<Vec<String>>>,
    feeds: Arc<StdMutex<HashMap<String, mpsc::UnboundedReceiver<String>>>>,
    fail_requests: Arc<AtomicBool>,
}

impl ChatService {
    fn with_conversation(self, conversation: Conversation) -> Self {
        self.conversations
            .lock()
            .expect("conversations")
            .insert(conversation.id.to_string(), conversation);
        self
    }

    fn with_chats(self, chats: Vec<Chat>) -> Self {
        *self.chats.lock().expect("chats") = chats;
        self
    }

    fn reply_with(&self, conversation: Conversation) {
        self.replies
            .lock()
            .expect("replies")
            .push_back(conversation);
    }

    fn feed(&self, chat_id: &str) -> mpsc::UnboundedSender<String> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.feeds
            .lock()
            .expect("feeds")
            .insert(chat_id.to_string(), rx);
        tx
    }

    fn record(&self, method: &Method, uri: &Uri, body: &str) {
        let mut line = format!("{method} {uri}");
        if !body.is_empty() {
            line.push(' ');
            line.push_str(body);
        }
        self.requests.lock().expect("requests").push(line);
    }

    fn requests_matching(&self, prefix: &str) -> Vec<String> {
        self.requests
            .lock()
            .expect("requests")
            .iter()
            .filter(|line| line.starts_with(prefix))
            .cloned()
            .collect()
    }

    fn failing(&self) -> Result<(), StatusCode> {
        if self.fail_requests.load(Ordering::SeqCst) {
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        } else {
            Ok(())
        }
    }
}

fn chat(id: &str, title: &str, hour: u32) -> Chat {
    Chat {
        id: ChatId::from(id),
        title: title.to_string(),
        create_time: Utc
            .with_ymd_and_hms(2024, 5, 1, hour, 0, 0)
            .single()
            .expect("valid timestamp"),
    }
}

async fn handle_list_chats(
    State(service): State<ChatService>,
    method: Method,
    uri: Uri,
) -> Result<Json<Vec<Chat>>, StatusCode> {
    service.record(&method, &uri, "");
    service.failing()?;
    Ok(Json(service.chats.lock().expect("chats").clone()))
}

async fn handle_create_chat(
    State(service): State<ChatService>,
    method: Method,
    uri: Uri,
    Json(request): Json<CreateChatRequest>,
) -> Json<Chat> {
    service.record(&method, &uri, &request.title);
    Json(chat("C9", &request.title, 12))
}

async fn handle_rename_chat(
    State(service): State<ChatService>,
    Path(id): Path<String>,
    method: Method,
    uri: Uri,
    Json(request): Json<UpdateTitleRequest>,
) -> Json<Chat> {
    service.record(&method, &uri, &request.title);
    Json(chat(&id, &request.title, 9))
}

async fn handle_delete(State(service): State<ChatService>, method: Method, uri: Uri) -> StatusCode {
    service.record(&method, &uri, "");
    match service.failing() {
        Ok(()) => StatusCode::NO_CONTENT,
        Err(status) => status,
    }
}

async fn handle_get_conversation(
    State(service): State<ChatService>,
    Path(id): Path<String>,
    method: Method,
    uri: Uri,
) -> Result<Json<Conversation>, StatusCode> {
    service.record(&method, &uri, "");
    service.failing()?;
    service
        .conversations
        .lock()
        .expect("conversations")
        .get(&id)
        .cloned()
        .map(Json)
        .ok_or(StatusCode::NOT_FOUND)
}

async fn handle_generation(
    State(service): State<ChatService>,
    method: Method,
    uri: Uri,
    body: String,
) -> Result<Json<Conversation>, StatusCode> {
    service.record(&method, &uri, &body);
    service.failing()?;
    service
        .replies
        .lock()
        .expect("replies")
        .pop_front()
        .map(Json)
        .ok_or(StatusCode::INTERNAL_SERVER_ERROR)
}

async fn handle_stop(State(service): State<ChatService>, method: Method, uri: Uri) -> StatusCode {
    service.record(&method, &uri, "");
    StatusCode::OK
}

async fn handle_sse(
    State(service): State<ChatService>,
    Path(id): Path<String>,
) -> Result<Sse<BoxStream<'static, Result<Event, Infallible>>>, StatusCode> {
    let rx = service
        .feeds
        .lock()
        .expect("feeds")
        .remove(&id)
        .ok_or(StatusCode::NOT_FOUND)?;
    let events = UnboundedReceiverStream::new(rx)
        .map(|data| Ok(Event::default().data(data)))
        .boxed();
    Ok(Sse::new(events))
}

async fn spawn_chat_service(service: ChatService) -> String {
    std::env::set_var("NO_PROXY", "127.0.0.1,localhost");
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind listener");
    let addr = listener.local_addr().expect("listener addr");
    let app = Router::new()
        .route(
            "/api/v1/chats",
            get(handle_list_chats)
                .post(handle_create_chat)
                .delete(handle_delete),
        )
        .route(
            "/api/v1/chats/:id",
            patch(handle_rename_chat).delete(handle_delete),
        )
        .route(
            "/api/v1/chats/:id/conversation",
            get(handle_get_conversation)
                .post(handle_generation)
                .patch(handle_generation),
        )
        .route(
            "/api/v1/chats/:id/conversation/regenerated-response",
            post(handle_generation),
        )
        .route(
            "/api/v1/chats/:id/conversation/stop-response-generating",
            post(handle_stop),
        )
        .route("/api/v1/chats/:id/conversation/sse", get(handle_sse))
        .with_state(service);
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    format!("http://{addr}/api/v1")
}

async fn client_for(service: &ChatService) -> Arc<ChatClient> {
    let base = spawn_chat_service(service.clone()).await;
    ChatClient::new(ClientConfig::new(&base).expect("config"))
}

async fn next_matching(
    events: &mut broadcast::Receiver<ClientEvent>,
    predicate: impl Fn(&ClientEvent) -> bool,
) -> ClientEvent {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let event = events.recv().await.expect("event channel open");
            if predicate(&event) {
                return event;
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

async fn thread_texts(client: &ChatClient) -> Vec<String> {
    let store = client.conversation_snapshot().await;
    let (Some(mapping), Some(current)) = (store.mapping(), store.current_node()) else {
        return Vec::new();
    };
    texts(build_thread(mapping, current))
}

fn empty_chat(id: &str) -> Conversation {
    conversation(id, "", Vec::<shared::domain::ChatNode>::new())
}

#[tokio::test]
async fn list_chats_merges_into_the_directory_newest_first() {
    let service = ChatService::default().with_chats(vec![
        chat("C1", "older", 8),
        chat("C2", "newer", 10),
    ]);
    let client = client_for(&service).await;
    let mut events = client.subscribe_events();

    let chats = client.list_chats(2, 20).await.expect("list chats");

    let ids: Vec<&str> = chats.iter().map(|chat| chat.id.as_str()).collect();
    assert_eq!(ids, vec!["C2", "C1"]);
    assert_eq!(
        client.request_status(Concern::ChatList).await,
        RequestStatus::Succeeded
    );
    assert_eq!(
        service.requests_matching("GET /api/v1/chats"),
        vec!["GET /api/v1/chats?page=2&size=20"]
    );
    next_matching(&mut events, |event| matches!(event, ClientEvent::ChatsUpdated(_))).await;
}

#[tokio::test]
async fn failed_chat_list_reports_failed_status() {
    let service = ChatService::default();
    service.fail_requests.store(true, Ordering::SeqCst);
    let client = client_for(&service).await;

    let err = client.list_chats(0, 20).await.expect_err("server error");

    assert!(err.is_transport());
    assert_eq!(
        client.request_status(Concern::ChatList).await,
        RequestStatus::Failed
    );
    assert!(client.chats().await.is_empty());
}

#[tokio::test]
async fn create_chat_defaults_the_title() {
    let service = ChatService::default();
    let client = client_for(&service).await;

    let created = client.create_chat(Some("  ")).await.expect("create");

    assert_eq!(created.title, DEFAULT_CHAT_TITLE);
    assert_eq!(
        service.requests_matching("POST /api/v1/chats"),
        vec!["POST /api/v1/chats New Chat"]
    );
    assert_eq!(client.chats().await, vec![created]);
}

#[tokio::test]
async fn select_chat_opens_the_stream_and_fetches_the_default_window() {
    let service = ChatService::default().with_conversation(conversation(
        "C1",
        "n2",
        [
            user("n1", None, &["n2"], "Hi"),
            assistant("n2", Some("n1"), &[], &["Hello"], true),
        ],
    ));
    let _feed = service.feed("C1");
    let client = client_for(&service).await;

    client.select_chat(&ChatId::from("C1")).await.expect("select");

    assert_eq!(client.stream_snapshot().state, StreamState::Open);
    assert_eq!(client.selected_chat().await, Some(ChatId::from("C1")));
    assert_eq!(thread_texts(&client).await, vec!["Hi", "Hello"]);
    assert_eq!(
        service.requests_matching("GET /api/v1/chats/C1/conversation"),
        vec!["GET /api/v1/chats/C1/conversation?upperLimit=100&lowerLimit=100"]
    );
    assert_eq!(
        client.request_status(Concern::Conversation).await,
        RequestStatus::Succeeded
    );
}

#[tokio::test]
async fn response_for_another_chat_is_discarded() {
    let mut foreign = empty_chat("C2");
    foreign.mapping = crate::fixtures::mapping([user("x1", None, &[], "elsewhere")]);
    foreign.current_node = NodeId::from("x1");
    let service = ChatService::default();
    service
        .conversations
        .lock()
        .expect("conversations")
        .insert("C1".to_string(), foreign);
    let client = client_for(&service).await;

    client
        .select_chat(&ChatId::from("C1"))
        .await
        .expect("stale payload is not an error");

    let store = client.conversation_snapshot().await;
    assert_eq!(store.chat_id(), Some(&ChatId::from("C1")));
    assert!(store.is_empty());
    assert_eq!(
        client.request_status(Concern::Conversation).await,
        RequestStatus::Idle
    );
}

#[tokio::test]
async fn new_chat_post_and_stream_render_the_reply() {
    let service = ChatService::default().with_conversation(empty_chat("C1"));
    let feed = service.feed("C1");
    service.reply_with(conversation("C1", "n1", [user("n1", None, &[], "Hi")]));
    let client = client_for(&service).await;
    let mut events = client.subscribe_events();
    let c1 = ChatId::from("C1");

    client.select_chat(&c1).await.expect("select");
    assert_eq!(client.stream_snapshot().state, StreamState::Open);
    client.post_message(&c1, "Hi").await.expect("post");
    assert_eq!(thread_texts(&client).await, vec!["Hi"]);

    let assistant_node = conversation(
        "C1",
        "n2",
        [
            user("n1", None, &["n2"], "Hi"),
            assistant("n2", Some("n1"), &[], &[], false),
        ],
    );
    feed.send(serde_json::to_string(&assistant_node).expect("encode"))
        .expect("send");
    next_matching(&mut events, |event| {
        matches!(
            event,
            ClientEvent::ConversationUpdated {
                assistant_responding: true,
                ..
            }
        )
    })
    .await;

    let err = client
        .post_message(&c1, "another")
        .await
        .expect_err("generation in flight");
    assert!(matches!(
        err,
        ClientError::Domain(DomainError::GenerationInFlight { .. })
    ));

    feed.send(r#"{"nodeId":"n2","content":"He"}"#.to_string())
        .expect("send");
    feed.send(r#"{"nodeId":"n2","content":"llo","final":true}"#.to_string())
        .expect("send");
    let finalized = next_matching(&mut events, |event| {
        matches!(event, ClientEvent::MessageFinalized { .. })
    })
    .await;

    assert_eq!(
        finalized,
        ClientEvent::MessageFinalized {
            chat_id: c1.clone(),
            node_id: NodeId::from("n2"),
            text: "Hello".to_string(),
        }
    );
    assert_eq!(thread_texts(&client).await, vec!["Hi", "Hello"]);
    assert!(!client.is_assistant_responding().await);
    assert_eq!(
        service.requests_matching("POST /api/v1/chats/C1/conversation"),
        vec![r#"POST /api/v1/chats/C1/conversation {"content":"Hi"}"#]
    );
}

#[tokio::test]
async fn empty_or_unselected_messages_are_refused_locally() {
    let service = ChatService::default().with_conversation(empty_chat("C1"));
    let client = client_for(&service).await;
    let c1 = ChatId::from("C1");

    let err = client.post_message(&c1, "hi").await.expect_err("nothing selected");
    assert!(matches!(err, ClientError::Domain(DomainError::NoChatSelected)));

    client.select_chat(&c1).await.expect("select");
    let err = client.post_message(&c1, "   ").await.expect_err("empty");
    assert!(matches!(err, ClientError::Domain(DomainError::EmptyMessage)));
    let err = client
        .post_message(&ChatId::from("C2"), "hi")
        .await
        .expect_err("other chat");
    assert!(matches!(
        err,
        ClientError::Domain(DomainError::ChatNotSelected { .. })
    ));

    assert!(service
        .requests_matching("POST /api/v1/chats/C1/conversation")
        .is_empty());
}

#[tokio::test]
async fn edit_sends_the_node_id_and_adds_a_version() {
    let service = ChatService::default().with_conversation(conversation(
        "C1",
        "n2",
        [
            user("u0", None, &["a0"], "Hello there"),
            assistant("a0", Some("u0"), &["n1"], &["General Kenobi"], true),
            user("n1", Some("a0"), &["n2"], "How are you?"),
            assistant("n2", Some("n1"), &[], &["Fine"], true),
        ],
    ));
    let client = client_for(&service).await;
    let c1 = ChatId::from("C1");
    client.select_chat(&c1).await.expect("select");

    let mut edited = conversation(
        "C1",
        "n3",
        [
            assistant("a0", Some("u0"), &["n1", "n3"], &["General Kenobi"], true),
            user("n3", Some("a0"), &[], "How are you doing?"),
        ],
    );
    edited.title.clear();
    service.reply_with(edited);
    client
        .edit_message(&c1, &NodeId::from("n1"), "How are you doing?")
        .await
        .expect("edit");

    assert_eq!(
        service.requests_matching("PATCH"),
        vec![r#"PATCH /api/v1/chats/C1/conversation?nodeId=n1 {"content":"How are you doing?"}"#]
    );
    let store = client.conversation_snapshot().await;
    assert_eq!(store.current_node(), Some(&NodeId::from("n3")));
    assert!(store.contains(&NodeId::from("n1")));
    assert_eq!(
        thread_texts(&client).await,
        vec!["Hello there", "General Kenobi", "How are you doing?"]
    );

    let err = client
        .edit_message(&c1, &NodeId::from("ghost"), "text")
        .await
        .expect_err("unknown node");
    assert!(matches!(
        err,
        ClientError::Domain(DomainError::UnknownNode(_))
    ));
}

#[tokio::test]
async fn switch_version_fetches_from_the_target_sibling() {
    let branches = crate::fixtures::branching_mapping();
    let mut initial = empty_chat("C1");
    initial.current_node = NodeId::from("u2");
    initial.mapping = branches;
    let service = ChatService::default().with_conversation(initial);
    let client = client_for(&service).await;
    let c1 = ChatId::from("C1");
    client.select_chat(&c1).await.expect("select");

    let mut moved = empty_chat("C1");
    moved.current_node = NodeId::from("u3");
    moved.mapping = crate::fixtures::mapping([
        user("u3", Some("a1"), &["a3"], "second question, edited"),
        assistant("a3", Some("u3"), &[], &["edited answer"], true),
    ]);
    service
        .conversations
        .lock()
        .expect("conversations")
        .insert("C1".to_string(), moved);

    let target = client
        .switch_version(&c1, &NodeId::from("u2"), SiblingStep::Next)
        .await
        .expect("switch");
    assert_eq!(target, NodeId::from("u3"));
    assert_eq!(
        client.conversation_snapshot().await.current_node(),
        Some(&NodeId::from("u3"))
    );
    assert!(service
        .requests_matching("GET")
        .contains(&"GET /api/v1/chats/C1/conversation?currentNode=u3&upperLimit=0&lowerLimit=100".to_string()));

    let before = service.requests_matching("GET").len();
    let unchanged = client
        .switch_version(&c1, &NodeId::from("u3"), SiblingStep::Next)
        .await
        .expect("last version");
    assert_eq!(unchanged, NodeId::from("u3"));
    assert_eq!(service.requests_matching("GET").len(), before);
}

#[tokio::test]
async fn regenerate_and_stop_follow_the_generation_lifecycle() {
    let service = ChatService::default().with_conversation(conversation(
        "C1",
        "a1",
        [
            user("u1", None, &["a1"], "Hi"),
            assistant("a1", Some("u1"), &[], &["Hello"], true),
        ],
    ));
    let client = client_for(&service).await;
    let c1 = ChatId::from("C1");
    client.select_chat(&c1).await.expect("select");

    let mut regenerated = conversation(
        "C1",
        "a2",
        [
            user("u1", None, &["a1", "a2"], "Hi"),
            assistant("a2", Some("u1"), &[], &[], false),
        ],
    );
    regenerated.title.clear();
    service.reply_with(regenerated);

    client.regenerate_response(&c1).await.expect("regenerate");
    assert!(client.is_assistant_responding().await);

    let err = client
        .regenerate_response(&c1)
        .await
        .expect_err("still generating");
    assert!(matches!(
        err,
        ClientError::Domain(DomainError::GenerationInFlight { .. })
    ));

    client.stop_generating(&c1).await.expect("stop");
    assert!(!client.is_assistant_responding().await);
    assert_eq!(
        service.requests_matching("POST /api/v1/chats/C1/conversation/"),
        vec![
            "POST /api/v1/chats/C1/conversation/regenerated-response",
            "POST /api/v1/chats/C1/conversation/stop-response-generating",
        ]
    );
}

#[tokio::test]
async fn renaming_the_selected_chat_updates_list_and_conversation() {
    let service = ChatService::default()
        .with_chats(vec![chat("C1", "New Chat", 8)])
        .with_conversation(conversation("C1", "n1", [user("n1", None, &[], "Hi")]));
    let client = client_for(&service).await;
    let c1 = ChatId::from("C1");
    client.list_chats(0, 20).await.expect("list");
    client.select_chat(&c1).await.expect("select");

    client
        .update_chat_title(&c1, "Greetings")
        .await
        .expect("rename");

    assert_eq!(client.chats().await[0].title, "Greetings");
    let store = client.conversation_snapshot().await;
    assert_eq!(store.title(), Some("Greetings"));
    assert_eq!(store.current_node(), Some(&NodeId::from("n1")));
}

#[tokio::test]
async fn deleting_the_selected_chat_deselects_it() {
    let service = ChatService::default()
        .with_chats(vec![chat("C1", "first", 8), chat("C2", "second", 9)])
        .with_conversation(empty_chat("C1"));
    let _feed = service.feed("C1");
    let client = client_for(&service).await;
    let c1 = ChatId::from("C1");
    client.list_chats(0, 20).await.expect("list");
    client.select_chat(&c1).await.expect("select");

    client.delete_chat(&c1).await.expect("delete");

    assert_eq!(client.selected_chat().await, None);
    assert_eq!(client.stream_snapshot().state, StreamState::Closed);
    let remaining: Vec<ChatId> = client.chats().await.into_iter().map(|chat| chat.id).collect();
    assert_eq!(remaining, vec![ChatId::from("C2")]);

    client.delete_all_chats().await.expect("delete all");
    assert!(client.chats().await.is_empty());
    assert_eq!(
        service.requests_matching("DELETE"),
        vec!["DELETE /api/v1/chats/C1", "DELETE /api/v1/chats"]
    );
}

#[tokio::test]
async fn list_chats_returns_the_fetched_page() {
    let service = ChatService::default().with_chats(vec![
        chat("C1", "first", 8),
        chat("C2", "second", 9),
    ]);
    let client = client_for(&service).await;
    client.list_chats(0, 2).await.expect("first page");

    *service.chats.lock().expect("chats") = vec![chat("C0", "oldest", 1)];
    let page = client.list_chats(1, 2).await.expect("second page");

    let page_ids: Vec<&str> = page.iter().map(|chat| chat.id.as_str()).collect();
    assert_eq!(page_ids, vec!["C0"]);
    let all: Vec<ChatId> = client.chats().await.into_iter().map(|chat| chat.id).collect();
    assert_eq!(
        all,
        vec![ChatId::from("C2"), ChatId::from("C1"), ChatId::from("C0")]
    );
}

#[tokio::test]
async fn failed_post_reports_failed_conversation_status() {
    let service = ChatService::default().with_conversation(empty_chat("C1"));
    let client = client_for(&service).await;
    let c1 = ChatId::from("C1");
    client.select_chat(&c1).await.expect("select");
    assert_eq!(
        client.request_status(Concern::Conversation).await,
        RequestStatus::Succeeded
    );

    service.fail_requests.store(true, Ordering::SeqCst);
    let err = client.post_message(&c1, "Hi").await.expect_err("server error");

    assert!(err.is_transport());
    assert_eq!(
        client.request_status(Concern::Conversation).await,
        RequestStatus::Failed
    );
    assert!(client.conversation_snapshot().await.is_empty());
}

#[tokio::test]
async fn failed_delete_reports_failed_chat_list_status() {
    let service = ChatService::default().with_chats(vec![chat("C1", "first", 8)]);
    let client = client_for(&service).await;
    client.list_chats(0, 20).await.expect("list");

    service.fail_requests.store(true, Ordering::SeqCst);
    let err = client
        .delete_chat(&ChatId::from("C1"))
        .await
        .expect_err("server error");

    assert!(err.is_transport());
    assert_eq!(
        client.request_status(Concern::ChatList).await,
        RequestStatus::Failed
    );
    assert_eq!(client.chats().await.len(), 1);
}

#[tokio::test]
async fn fetch_for_a_chat_that_is_not_selected_leaves_the_status() {
    let service = ChatService::default()
        .with_conversation(empty_chat("C1"))
        .with_conversation(empty_chat("C2"));
    let client = client_for(&service).await;
    let c1 = ChatId::from("C1");
    client.select_chat(&c1).await.expect("select");

    service.fail_requests.store(true, Ordering::SeqCst);
    client
        .fetch_conversation(&c1, ConversationQuery::default())
        .await
        .expect_err("server error");
    assert_eq!(
        client.request_status(Concern::Conversation).await,
        RequestStatus::Failed
    );

    service.fail_requests.store(false, Ordering::SeqCst);
    client
        .fetch_conversation(&ChatId::from("C2"), ConversationQuery::default())
        .await
        .expect("stale payload is not an error");

    assert_eq!(
        client.request_status(Concern::Conversation).await,
        RequestStatus::Failed
    );
    assert_eq!(client.selected_chat().await, Some(c1));
}

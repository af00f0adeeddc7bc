use thiserror::Error;

use crate::domain::{ChatId, NodeId};

/// Requests refused locally before anything is sent to the chat service.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DomainError {
    #[error("assistant is still responding in chat {chat_id}")]
    GenerationInFlight { chat_id: ChatId },
    #[error("message text must not be empty")]
    EmptyMessage,
    #[error("no chat is selected")]
    NoChatSelected,
    #[error("chat {requested} is not the selected chat")]
    ChatNotSelected { requested: ChatId },
    #[error("node {0} is not part of the loaded conversation")]
    UnknownNode(NodeId),
}

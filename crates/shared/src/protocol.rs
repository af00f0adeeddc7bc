use serde::{Deserialize, Serialize};

use crate::domain::{ChatId, Conversation, NodeId};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateChatRequest {
    pub title: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateTitleRequest {
    pub title: String,
}

/// Body of post/edit message calls.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageContentRequest {
    pub content: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListChatsQuery {
    pub page: u32,
    pub size: u32,
}

/// Window of a conversation fetch. Absent fields mean "server default / all available".
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationQuery {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_node: Option<NodeId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upper_limit: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lower_limit: Option<u32>,
}

impl ConversationQuery {
    pub fn window(upper_limit: u32, lower_limit: u32) -> Self {
        Self {
            current_node: None,
            upper_limit: Some(upper_limit),
            lower_limit: Some(lower_limit),
        }
    }

    pub fn from_node(node_id: NodeId, upper_limit: u32, lower_limit: u32) -> Self {
        Self {
            current_node: Some(node_id),
            upper_limit: Some(upper_limit),
            lower_limit: Some(lower_limit),
        }
    }

    /// True when the fetch asks for the whole conversation rather than a window.
    pub fn is_whole_conversation(&self) -> bool {
        self.current_node.is_none() && self.upper_limit.is_none() && self.lower_limit.is_none()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EditMessageQuery {
    pub node_id: NodeId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transcription {
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<f64>,
}

/// One incremental piece of assistant output addressed to a single node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContentFragment {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chat_id: Option<ChatId>,
    pub node_id: NodeId,
    #[serde(default)]
    pub content: String,
    #[serde(rename = "final", default)]
    pub is_final: bool,
}

/// Data of one SSE event on `/chats/{id}/conversation/sse`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StreamPayload {
    Content(ContentFragment),
    Conversation(Conversation),
}

use std::{collections::HashMap, fmt};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(
            Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }

            pub fn is_empty(&self) -> bool {
                self.0.is_empty()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }
    };
}

id_newtype!(ChatId);
id_newtype!(NodeId);

/// Nodes of one conversation keyed by id. Parent/child links are ids into this map.
pub type Mapping = HashMap<NodeId, ChatNode>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Author {
    #[serde(alias = "USER")]
    User,
    #[serde(alias = "ASSISTANT")]
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Chat {
    pub id: ChatId,
    pub title: String,
    pub create_time: DateTime<Utc>,
}

/// Full chat detail: summary fields plus the (possibly windowed) node tree.
///
/// Stream fragments reuse this shape with only `id`, `currentNode` and a partial
/// `mapping`, so everything but `id` defaults when absent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    pub id: ChatId,
    #[serde(default)]
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub create_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub current_node: NodeId,
    #[serde(default)]
    pub mapping: Mapping,
}

impl Conversation {
    /// A conversation with no nodes yet, as it exists right after chat creation.
    pub fn empty(id: ChatId) -> Self {
        Self {
            id,
            title: String::new(),
            create_time: None,
            current_node: NodeId::default(),
            mapping: Mapping::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatNode {
    pub id: NodeId,
    #[serde(default)]
    pub parent: Option<NodeId>,
    /// Ordered oldest to newest; the last entry is the default branch.
    #[serde(default)]
    pub children: Vec<NodeId>,
    pub message: Message,
}

impl ChatNode {
    pub fn is_root(&self) -> bool {
        self.parent.is_none()
    }

    pub fn newest_child(&self) -> Option<&NodeId> {
        self.children.last()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: NodeId,
    pub author: Author,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub create_time: Option<DateTime<Utc>>,
    pub content: Content,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Content {
    #[serde(rename = "type", default = "default_content_type")]
    pub content_type: String,
    #[serde(default)]
    pub parts: Vec<String>,
    #[serde(rename = "final", default)]
    pub is_final: bool,
}

fn default_content_type() -> String {
    "text".to_string()
}

impl Content {
    pub fn text(parts: impl IntoIterator<Item = impl Into<String>>, is_final: bool) -> Self {
        Self {
            content_type: default_content_type(),
            parts: parts.into_iter().map(Into::into).collect(),
            is_final,
        }
    }

    /// Display text: parts concatenated in order.
    pub fn joined(&self) -> String {
        self.parts.concat()
    }
}

//! Canonical node storage for the single selected conversation.
//!
//! Reads are public. Every mutator is crate-private so that only the
//! [`Reconciler`](crate::reconciler::Reconciler) writes to the store.

use shared::domain::{ChatId, ChatNode, Conversation, Mapping, NodeId};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TreeStore {
    conversation: Option<Conversation>,
    revision: u64,
}

impl TreeStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn conversation(&self) -> Option<&Conversation> {
        self.conversation.as_ref()
    }

    pub fn chat_id(&self) -> Option<&ChatId> {
        self.conversation.as_ref().map(|conversation| &conversation.id)
    }

    pub fn title(&self) -> Option<&str> {
        self.conversation
            .as_ref()
            .map(|conversation| conversation.title.as_str())
    }

    /// The pointer node, or `None` while nothing is selected or the conversation is empty.
    pub fn current_node(&self) -> Option<&NodeId> {
        self.conversation
            .as_ref()
            .map(|conversation| &conversation.current_node)
            .filter(|node_id| !node_id.is_empty())
    }

    pub fn mapping(&self) -> Option<&Mapping> {
        self.conversation
            .as_ref()
            .map(|conversation| &conversation.mapping)
    }

    pub fn get(&self, node_id: &NodeId) -> Option<&ChatNode> {
        self.mapping().and_then(|mapping| mapping.get(node_id))
    }

    pub fn contains(&self, node_id: &NodeId) -> bool {
        self.get(node_id).is_some()
    }

    pub fn len(&self) -> usize {
        self.mapping().map_or(0, Mapping::len)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Bumped once per call that actually changed something.
    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub(crate) fn select(&mut self, chat_id: ChatId) {
        self.conversation = Some(Conversation::empty(chat_id));
        self.revision += 1;
    }

    pub(crate) fn clear(&mut self) {
        if self.conversation.take().is_some() {
            self.revision += 1;
        }
    }

    /// Inserts or fully replaces a node. Returns false when the stored node was already equal.
    pub(crate) fn put(&mut self, node: ChatNode) -> bool {
        let Some(conversation) = self.conversation.as_mut() else {
            return false;
        };
        if conversation.mapping.get(&node.id) == Some(&node) {
            return false;
        }
        conversation.mapping.insert(node.id.clone(), node);
        self.revision += 1;
        true
    }

    pub(crate) fn node_mut(&mut self, node_id: &NodeId) -> Option<&mut ChatNode> {
        self.conversation
            .as_mut()
            .and_then(|conversation| conversation.mapping.get_mut(node_id))
    }

    pub(crate) fn touch(&mut self) {
        self.revision += 1;
    }

    pub(crate) fn set_current_node(&mut self, node_id: NodeId) -> bool {
        let Some(conversation) = self.conversation.as_mut() else {
            return false;
        };
        if conversation.current_node == node_id {
            return false;
        }
        conversation.current_node = node_id;
        self.revision += 1;
        true
    }

    pub(crate) fn set_title(&mut self, title: String) -> bool {
        let Some(conversation) = self.conversation.as_mut() else {
            return false;
        };
        if conversation.title == title {
            return false;
        }
        conversation.title = title;
        self.revision += 1;
        true
    }

    /// Overwrites nodes per id and never removes absent ones. Returns the ids that changed.
    pub(crate) fn merge(&mut self, nodes: impl IntoIterator<Item = ChatNode>) -> Vec<NodeId> {
        let mut changed = Vec::new();
        for node in nodes {
            let node_id = node.id.clone();
            if self.put(node) {
                changed.push(node_id);
            }
        }
        changed.sort();
        changed
    }

    /// Swaps in a whole conversation. Only valid for a fetch of the same conversation.
    /// Returns the ids that were added, changed or dropped.
    pub(crate) fn replace(&mut self, incoming: Conversation) -> Vec<NodeId> {
        let Some(conversation) = self.conversation.as_mut() else {
            return Vec::new();
        };
        if conversation.id != incoming.id || *conversation == incoming {
            return Vec::new();
        }

        let mut changed: Vec<NodeId> = incoming
            .mapping
            .iter()
            .filter(|(node_id, node)| conversation.mapping.get(*node_id) != Some(*node))
            .map(|(node_id, _)| node_id.clone())
            .collect();
        changed.extend(
            conversation
                .mapping
                .keys()
                .filter(|node_id| !incoming.mapping.contains_key(*node_id))
                .cloned(),
        );
        changed.sort();

        *conversation = incoming;
        self.revision += 1;
        changed
    }
}

#[cfg(test)]
#[path = "tests/tree_tests.rs"]
mod tests;

//! The only writer of the [`TreeStore`].
//!
//! Two entry points mutate the tree: [`Reconciler::apply_conversation_diff`]
//! (full-node overwrite per id) and [`Reconciler::apply_streamed_fragment`]
//! (append-only on one node's parts). Both validate before touching the store,
//! so a rejected call leaves it exactly as it was.

use shared::domain::{Author, ChatId, ChatNode, Conversation, NodeId};
use thiserror::Error;
use tracing::{debug, warn};

use crate::tree::TreeStore;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReconcileError {
    #[error("no conversation is selected")]
    NoSelection,
    #[error("stale response for chat {received}; selected chat is {expected}")]
    StaleResponse { expected: ChatId, received: ChatId },
    #[error("node {0} is not part of the selected conversation")]
    UnknownNode(NodeId),
    #[error("current node {0} is not present after the merge")]
    UnknownCurrentNode(NodeId),
    #[error("node {0} is final and accepts no more fragments")]
    NodeFinalized(NodeId),
}

impl ReconcileError {
    pub fn is_stale(&self) -> bool {
        matches!(self, Self::StaleResponse { .. } | Self::NoSelection)
    }
}

/// Content streamed into one node.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamedFragment {
    pub parts: Vec<String>,
    pub is_final: bool,
}

impl StreamedFragment {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            parts: vec![text.into()],
            is_final: false,
        }
    }

    pub fn finished(mut self) -> Self {
        self.is_final = true;
        self
    }
}

/// What one accepted call changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeOutcome {
    pub chat_id: ChatId,
    pub changed: Vec<NodeId>,
    pub current_node_changed: bool,
    pub title_changed: bool,
    /// Assistant nodes whose content became final during this call.
    pub finalized: Vec<NodeId>,
}

impl MergeOutcome {
    fn new(chat_id: ChatId) -> Self {
        Self {
            chat_id,
            ..Self::default()
        }
    }

    pub fn is_noop(&self) -> bool {
        self.changed.is_empty() && !self.current_node_changed && !self.title_changed
    }
}

#[derive(Debug, Default)]
pub struct Reconciler {
    store: TreeStore,
    assistant_responding: bool,
}

impl Reconciler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn store(&self) -> &TreeStore {
        &self.store
    }

    pub fn selected_chat(&self) -> Option<&ChatId> {
        self.store.chat_id()
    }

    pub fn is_assistant_responding(&self) -> bool {
        self.assistant_responding
    }

    /// Drops whatever conversation was held and starts an empty one for `chat_id`.
    pub fn select(&mut self, chat_id: ChatId) {
        debug!(chat_id = %chat_id, "selecting conversation");
        self.store.select(chat_id);
        self.assistant_responding = false;
    }

    pub fn deselect(&mut self) {
        self.store.clear();
        self.assistant_responding = false;
    }

    /// Generation was stopped remotely; nothing more is expected for the active node.
    pub fn mark_generation_stopped(&mut self, chat_id: &ChatId) -> Result<(), ReconcileError> {
        self.ensure_selected(chat_id)?;
        self.assistant_responding = false;
        Ok(())
    }

    /// Merges a (possibly partial) snapshot: every incoming node replaces the
    /// stored node with the same id, nodes absent from the snapshot are kept.
    pub fn apply_conversation_diff(
        &mut self,
        incoming: Conversation,
    ) -> Result<MergeOutcome, ReconcileError> {
        self.ensure_selected(&incoming.id)?;
        if !incoming.current_node.is_empty()
            && !incoming.mapping.contains_key(&incoming.current_node)
            && !self.store.contains(&incoming.current_node)
        {
            return Err(ReconcileError::UnknownCurrentNode(incoming.current_node));
        }

        let Conversation {
            id,
            title,
            create_time: _,
            current_node,
            mapping,
        } = incoming;
        let mut outcome = MergeOutcome::new(id);

        let nodes: Vec<ChatNode> = mapping
            .into_values()
            .map(|node| self.guard_final(node, &mut outcome.finalized))
            .collect();
        outcome.changed = self.store.merge(nodes);
        // Fragments often omit the title; an empty one never clears it.
        if !title.is_empty() {
            outcome.title_changed = self.store.set_title(title);
        }
        if !current_node.is_empty() {
            outcome.current_node_changed = self.store.set_current_node(current_node);
        }
        outcome.finalized.retain(|node_id| outcome.changed.contains(node_id));

        self.refresh_responding(&outcome);
        debug!(
            chat_id = %outcome.chat_id,
            changed = outcome.changed.len(),
            current_node_changed = outcome.current_node_changed,
            "applied conversation diff"
        );
        Ok(outcome)
    }

    /// Replaces the whole mapping from a fetch of the entire conversation.
    pub fn apply_full_conversation(
        &mut self,
        incoming: Conversation,
    ) -> Result<MergeOutcome, ReconcileError> {
        self.ensure_selected(&incoming.id)?;
        if !incoming.current_node.is_empty() && !incoming.mapping.contains_key(&incoming.current_node)
        {
            return Err(ReconcileError::UnknownCurrentNode(incoming.current_node));
        }

        let mut outcome = MergeOutcome::new(incoming.id.clone());
        let previous_current = self.store.current_node().cloned();
        let previous_title = self.store.title().map(str::to_string);

        let mut incoming = incoming;
        let mapping = std::mem::take(&mut incoming.mapping);
        incoming.mapping = mapping
            .into_iter()
            .map(|(node_id, node)| (node_id, self.guard_final(node, &mut outcome.finalized)))
            .collect();

        outcome.changed = self.store.replace(incoming);
        outcome.current_node_changed = self.store.current_node().cloned() != previous_current;
        outcome.title_changed = self.store.title().map(str::to_string) != previous_title;
        outcome.finalized.retain(|node_id| outcome.changed.contains(node_id));

        self.refresh_responding(&outcome);
        debug!(
            chat_id = %outcome.chat_id,
            changed = outcome.changed.len(),
            "replaced conversation"
        );
        Ok(outcome)
    }

    /// Appends streamed parts to one node. Never touches links or the pointer.
    pub fn apply_streamed_fragment(
        &mut self,
        chat_id: &ChatId,
        node_id: &NodeId,
        fragment: &StreamedFragment,
    ) -> Result<MergeOutcome, ReconcileError> {
        self.ensure_selected(chat_id)?;
        let Some(node) = self.store.get(node_id) else {
            warn!(chat_id = %chat_id, node_id = %node_id, "fragment for unknown node dropped");
            return Err(ReconcileError::UnknownNode(node_id.clone()));
        };
        if node.message.content.is_final {
            warn!(chat_id = %chat_id, node_id = %node_id, "fragment for final node dropped");
            return Err(ReconcileError::NodeFinalized(node_id.clone()));
        }

        let mut outcome = MergeOutcome::new(chat_id.clone());
        if fragment.parts.is_empty() && !fragment.is_final {
            return Ok(outcome);
        }

        if let Some(node) = self.store.node_mut(node_id) {
            let content = &mut node.message.content;
            content.parts.extend(fragment.parts.iter().cloned());
            content.is_final = fragment.is_final;
            if fragment.is_final && node.message.author == Author::Assistant {
                outcome.finalized.push(node_id.clone());
            }
        }
        self.store.touch();
        outcome.changed.push(node_id.clone());

        self.refresh_responding(&outcome);
        Ok(outcome)
    }

    fn ensure_selected(&self, chat_id: &ChatId) -> Result<(), ReconcileError> {
        match self.store.chat_id() {
            None => {
                warn!(chat_id = %chat_id, "no conversation selected; update discarded");
                Err(ReconcileError::NoSelection)
            }
            Some(selected) if selected != chat_id => {
                warn!(
                    selected = %selected,
                    received = %chat_id,
                    "stale conversation update discarded"
                );
                Err(ReconcileError::StaleResponse {
                    expected: selected.clone(),
                    received: chat_id.clone(),
                })
            }
            Some(_) => Ok(()),
        }
    }

    /// Final content only gives way to final content. A non-final incoming node
    /// over a final stored node keeps the stored content and takes the rest.
    fn guard_final(&self, mut incoming: ChatNode, finalized: &mut Vec<NodeId>) -> ChatNode {
        match self.store.get(&incoming.id) {
            Some(existing) if existing.message.content.is_final => {
                if !incoming.message.content.is_final {
                    incoming.message.content = existing.message.content.clone();
                }
            }
            _ => {
                if incoming.message.content.is_final
                    && incoming.message.author == Author::Assistant
                {
                    finalized.push(incoming.id.clone());
                }
            }
        }
        incoming
    }

    fn refresh_responding(&mut self, outcome: &MergeOutcome) {
        let Some(current) = self.store.current_node().and_then(|id| self.store.get(id)) else {
            return;
        };
        if current.message.content.is_final {
            self.assistant_responding = false;
        } else if outcome.current_node_changed || outcome.changed.contains(&current.id) {
            self.assistant_responding = true;
        }
    }
}

#[cfg(test)]
#[path = "tests/reconciler_tests.rs"]
mod tests;

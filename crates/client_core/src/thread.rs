//! Derives the linear thread to render from the node tree and a pointer node.

use std::collections::HashSet;

use shared::domain::{Author, Mapping, Message, NodeId};

use crate::siblings::{sibling_info, SiblingInfo};

/// Messages from the root down to `current_node`, then down the newest branch to a leaf.
///
/// Returns an empty thread when `current_node` is not loaded. A parent or child
/// id missing from `mapping` ends the walk in that direction, so a windowed
/// fetch yields a truncated thread rather than an error.
pub fn build_thread<'a>(mapping: &'a Mapping, current_node: &NodeId) -> Vec<&'a Message> {
    let Some(current) = mapping.get(current_node) else {
        return Vec::new();
    };

    let mut visited = HashSet::from([&current.id]);

    let mut ancestors = Vec::new();
    let mut cursor = current;
    while let Some(parent) = cursor.parent.as_ref().and_then(|id| mapping.get(id)) {
        if !visited.insert(&parent.id) {
            break;
        }
        ancestors.push(&parent.message);
        cursor = parent;
    }
    ancestors.reverse();

    let mut thread = ancestors;
    thread.push(&current.message);

    let mut cursor = current;
    while let Some(child) = cursor.newest_child().and_then(|id| mapping.get(id)) {
        if !visited.insert(&child.id) {
            break;
        }
        thread.push(&child.message);
        cursor = child;
    }

    thread
}

/// One row of the rendered thread.
#[derive(Debug, Clone, PartialEq)]
pub struct ThreadEntry<'a> {
    pub message: &'a Message,
    pub versions: SiblingInfo,
    pub text: String,
}

impl ThreadEntry<'_> {
    pub fn node_id(&self) -> &NodeId {
        &self.message.id
    }

    pub fn author(&self) -> Author {
        self.message.author
    }

    pub fn is_streaming(&self) -> bool {
        !self.message.content.is_final && self.message.author == Author::Assistant
    }
}

pub fn render_thread<'a>(mapping: &'a Mapping, current_node: &NodeId) -> Vec<ThreadEntry<'a>> {
    build_thread(mapping, current_node)
        .into_iter()
        .map(|message| ThreadEntry {
            message,
            versions: sibling_info(mapping, &message.id),
            text: message.content.joined(),
        })
        .collect()
}

#[cfg(test)]
#[path = "tests/thread_tests.rs"]
mod tests;

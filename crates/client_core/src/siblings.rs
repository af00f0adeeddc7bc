//! Version navigation between nodes that share a parent.

use shared::domain::{Mapping, NodeId};

/// 1-based position of a node among its parent's children.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SiblingInfo {
    pub position: usize,
    pub total: usize,
}

impl SiblingInfo {
    pub const SINGLE: Self = Self {
        position: 1,
        total: 1,
    };

    pub fn has_versions(&self) -> bool {
        self.total > 1
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SiblingStep {
    Previous,
    Next,
}

impl SiblingStep {
    fn offset(self) -> isize {
        match self {
            Self::Previous => -1,
            Self::Next => 1,
        }
    }
}

/// Roots, nodes outside the fetched window, and nodes whose parent is not
/// loaded all report a single version.
pub fn sibling_info(mapping: &Mapping, node_id: &NodeId) -> SiblingInfo {
    let Some(siblings) = siblings_of(mapping, node_id) else {
        return SiblingInfo::SINGLE;
    };
    match siblings.iter().position(|sibling| sibling == node_id) {
        Some(index) => SiblingInfo {
            position: index + 1,
            total: siblings.len(),
        },
        None => SiblingInfo::SINGLE,
    }
}

/// Resolves the neighbouring version. Stepping past either end returns `node_id`.
pub fn move_sibling(mapping: &Mapping, node_id: &NodeId, step: SiblingStep) -> NodeId {
    let Some(siblings) = siblings_of(mapping, node_id).filter(|siblings| !siblings.is_empty())
    else {
        return node_id.clone();
    };
    let Some(index) = siblings.iter().position(|sibling| sibling == node_id) else {
        return node_id.clone();
    };

    let last = siblings.len() - 1;
    let target = index.saturating_add_signed(step.offset()).min(last);
    siblings[target].clone()
}

fn siblings_of<'a>(mapping: &'a Mapping, node_id: &NodeId) -> Option<&'a [NodeId]> {
    let parent_id = mapping.get(node_id)?.parent.as_ref()?;
    mapping
        .get(parent_id)
        .map(|parent| parent.children.as_slice())
}

#[cfg(test)]
#[path = "tests/siblings_tests.rs"]
mod tests;

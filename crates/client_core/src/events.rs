use shared::domain::{Author, Chat, ChatId, NodeId};

use crate::{
    reconciler::{MergeOutcome, Reconciler},
    status::{Concern, RequestStatus},
    stream::StreamSnapshot,
};

#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    ChatsUpdated(Vec<Chat>),
    ConversationUpdated {
        chat_id: ChatId,
        changed: Vec<NodeId>,
        assistant_responding: bool,
    },
    MessageFinalized {
        chat_id: ChatId,
        node_id: NodeId,
        text: String,
    },
    RequestStatusChanged {
        concern: Concern,
        status: RequestStatus,
    },
    StreamStateChanged(StreamSnapshot),
    Error(String),
}

/// Events describing an accepted merge. Empty for a no-op merge.
pub(crate) fn merge_events(reconciler: &Reconciler, outcome: &MergeOutcome) -> Vec<ClientEvent> {
    if outcome.is_noop() {
        return Vec::new();
    }

    let mut events = vec![ClientEvent::ConversationUpdated {
        chat_id: outcome.chat_id.clone(),
        changed: outcome.changed.clone(),
        assistant_responding: reconciler.is_assistant_responding(),
    }];
    for node_id in &outcome.finalized {
        let Some(node) = reconciler.store().get(node_id) else {
            continue;
        };
        if node.message.author != Author::Assistant {
            continue;
        }
        events.push(ClientEvent::MessageFinalized {
            chat_id: outcome.chat_id.clone(),
            node_id: node_id.clone(),
            text: node.message.content.joined(),
        });
    }
    events
}

//! Chat summaries shown in the side list. Independent of the selected conversation.

use std::collections::HashMap;

use shared::domain::{Chat, ChatId};

#[derive(Debug, Clone, Default)]
pub struct ChatDirectory {
    chats: HashMap<ChatId, Chat>,
}

impl ChatDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn upsert(&mut self, chat: Chat) {
        self.chats.insert(chat.id.clone(), chat);
    }

    pub fn extend(&mut self, chats: impl IntoIterator<Item = Chat>) {
        for chat in chats {
            self.upsert(chat);
        }
    }

    pub fn remove(&mut self, chat_id: &ChatId) -> Option<Chat> {
        self.chats.remove(chat_id)
    }

    pub fn clear(&mut self) {
        self.chats.clear();
    }

    pub fn sorted(&self) -> Vec<Chat> {
        let mut chats: Vec<Chat> = self.chats.values().cloned().collect();
        sort_newest_first(&mut chats);
        chats
    }
}

/// Newest first; ties broken by id so the order is stable.
pub fn sort_newest_first(chats: &mut [Chat]) {
    chats.sort_by(|a, b| {
        b.create_time
            .cmp(&a.create_time)
            .then_with(|| a.id.cmp(&b.id))
    });
}

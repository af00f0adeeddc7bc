use std::fmt;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum RequestStatus {
    #[default]
    Idle,
    Loading,
    Succeeded,
    Failed,
}

impl fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Idle => "idle",
            Self::Loading => "loading",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
        };
        f.write_str(label)
    }
}

/// What a status refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Concern {
    ChatList,
    Conversation,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RequestStatuses {
    pub chat_list: RequestStatus,
    pub conversation: RequestStatus,
}

impl RequestStatuses {
    pub fn get(&self, concern: Concern) -> RequestStatus {
        match concern {
            Concern::ChatList => self.chat_list,
            Concern::Conversation => self.conversation,
        }
    }

    /// Returns true when the status actually moved.
    pub fn set(&mut self, concern: Concern, status: RequestStatus) -> bool {
        let slot = match concern {
            Concern::ChatList => &mut self.chat_list,
            Concern::Conversation => &mut self.conversation,
        };
        let changed = *slot != status;
        *slot = status;
        changed
    }
}

//! Per-chat rolling conversation memory.
//!
//! Every group chat the bot has seen gets its own bounded log of turns,
//! oldest evicted first. Rooms are created lazily and live for the process
//! lifetime; deactivating the bot never clears them.

use std::collections::{HashMap, VecDeque};

use serde::Serialize;

/// Most recent turns kept per chat. The persona prompt is prepended at
/// request time and never counts against this.
pub const MEMORY_CAPACITY: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// One role-tagged message. Serializes directly into the chat-completions
/// wire format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Turn {
    pub role: Role,
    pub content: String,
}

impl Turn {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

#[derive(Debug, Default)]
pub struct ConversationMemory {
    rooms: HashMap<i64, VecDeque<Turn>>,
}

impl ConversationMemory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a turn to the chat's log, evicting the oldest turn when the
    /// log is at capacity. Creates the room if it does not exist yet.
    pub fn append(&mut self, chat_id: i64, turn: Turn) {
        let log = self.rooms.entry(chat_id).or_default();
        if log.len() == MEMORY_CAPACITY {
            log.pop_front();
        }
        log.push_back(turn);
    }

    /// Create an empty room if the chat has never been seen.
    pub fn ensure_room(&mut self, chat_id: i64) {
        self.rooms.entry(chat_id).or_default();
    }

    pub fn has_room(&self, chat_id: i64) -> bool {
        self.rooms.contains_key(&chat_id)
    }

    /// Ordered copy of the chat's turns, oldest first. Unknown chats yield
    /// an empty list.
    pub fn snapshot(&self, chat_id: i64) -> Vec<Turn> {
        self.rooms
            .get(&chat_id)
            .map(|log| log.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Remove up to `count` turns from the newest end. Returns how many
    /// were actually removed.
    pub fn pop_last(&mut self, chat_id: i64, count: usize) -> usize {
        let Some(log) = self.rooms.get_mut(&chat_id) else {
            return 0;
        };
        let mut removed = 0;
        while removed < count && log.pop_back().is_some() {
            removed += 1;
        }
        removed
    }

    pub fn last_role(&self, chat_id: i64) -> Option<Role> {
        self.rooms
            .get(&chat_id)
            .and_then(|log| log.back())
            .map(|turn| turn.role)
    }

    /// True for unknown rooms as well as known-but-empty ones.
    pub fn is_empty(&self, chat_id: i64) -> bool {
        self.rooms
            .get(&chat_id)
            .map(|log| log.is_empty())
            .unwrap_or(true)
    }
}

//! Chats the host has seen, in first-seen order.

use std::collections::HashSet;

use parking_lot::RwLock;

use chorus_core::Chat;

#[derive(Debug, Default)]
struct Inner {
    order: Vec<Chat>,
    seen: HashSet<Chat>,
}

/// Every chat a message arrived from since startup.
#[derive(Debug, Default)]
pub struct ChatDirectory {
    inner: RwLock<Inner>,
}

impl ChatDirectory {
    /// Creates an empty directory.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `chat`; returns `true` when it was new.
    pub fn record(&self, chat: &Chat) -> bool {
        if self.inner.read().seen.contains(chat) {
            return false;
        }
        let mut inner = self.inner.write();
        if !inner.seen.insert(chat.clone()) {
            return false;
        }
        inner.order.push(chat.clone());
        true
    }

    /// Known chats in first-seen order.
    pub fn chats(&self) -> Vec<Chat> {
        self.inner.read().order.clone()
    }

    /// Number of known chats.
    pub fn len(&self) -> usize {
        self.inner.read().order.len()
    }

    /// Returns `true` when no chat has been seen.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

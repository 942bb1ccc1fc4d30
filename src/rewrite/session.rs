use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use crate::models::ConversationTurn;

/// Hard cap on turns kept per conversation.
pub const MAX_TURNS: usize = 10;

/// Per-conversation bounded history rings, owned by the query rewriter.
/// The ring holds at most [`MAX_TURNS`] turns; older turns fall off.
pub struct ConversationStore {
    conversations: Mutex<HashMap<String, VecDeque<ConversationTurn>>>,
}

impl ConversationStore {
    pub fn new() -> Self {
        Self {
            conversations: Mutex::new(HashMap::new()),
        }
    }

    pub fn record(&self, conversation_id: &str, turn: ConversationTurn) {
        let mut conversations = self.conversations.lock().expect("session lock poisoned");
        let ring = conversations.entry(conversation_id.to_string()).or_default();
        ring.push_back(turn);
        while ring.len() > MAX_TURNS {
            ring.pop_front();
        }
    }

    /// The last `limit` turns, oldest first.
    pub fn history(&self, conversation_id: &str, limit: usize) -> Vec<ConversationTurn> {
        let conversations = self.conversations.lock().expect("session lock poisoned");
        match conversations.get(conversation_id) {
            Some(ring) => {
                let skip = ring.len().saturating_sub(limit);
                ring.iter().skip(skip).cloned().collect()
            }
            None => vec![],
        }
    }

    /// Drop a conversation's history (conversation end).
    pub fn forget(&self, conversation_id: &str) {
        self.conversations
            .lock()
            .expect("session lock poisoned")
            .remove(conversation_id);
    }

    pub fn conversation_count(&self) -> usize {
        self.conversations.lock().expect("session lock poisoned").len()
    }
}

impl Default for ConversationStore {
    fn default() -> Self {
        Self::new()
    }
}

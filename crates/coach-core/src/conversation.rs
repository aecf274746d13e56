use serde::{Deserialize, Serialize};

use crate::messages::ChatMessage;

/// Conversation state for one (user, coach) pair.
///
/// `recent_messages` holds every message not yet folded into `summary`, in
/// chronological order. `message_count` counts every message ever appended
/// and never decreases except through an explicit clear.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ConversationWindow {
    pub recent_messages: Vec<ChatMessage>,
    pub summary: Option<String>,
    pub message_count: u64,
}

impl ConversationWindow {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.recent_messages.is_empty() && self.summary.is_none() && self.message_count == 0
    }

    /// Messages older than the last `keep_recent`, i.e. those a compression
    /// pass may fold into the summary.
    pub fn foldable(&self, keep_recent: usize) -> &[ChatMessage] {
        let boundary = self.recent_messages.len().saturating_sub(keep_recent);
        &self.recent_messages[..boundary]
    }
}

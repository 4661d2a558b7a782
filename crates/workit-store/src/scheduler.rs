use std::collections::HashMap;

use tokio::task::AbortHandle;

/// Background tasks owned by a store session.
///
/// Conversation-scoped tasks (delayed replies) die with their conversation;
/// everything dies with the session.
#[derive(Default)]
pub struct TaskRegistry {
    by_conversation: HashMap<String, Vec<AbortHandle>>,
    session: Vec<AbortHandle>,
}

impl TaskRegistry {
    pub fn track_session(&mut self, handle: AbortHandle) {
        self.session.retain(|h| !h.is_finished());
        self.session.push(handle);
    }

    pub fn track_conversation(&mut self, conversation_id: &str, handle: AbortHandle) {
        let handles = self.by_conversation.entry(conversation_id.to_string()).or_default();
        handles.retain(|h| !h.is_finished());
        handles.push(handle);
    }

    /// Aborts the conversation's pending tasks. Returns how many were still live.
    pub fn cancel_conversation(&mut self, conversation_id: &str) -> usize {
        self.by_conversation
            .remove(conversation_id)
            .map(abort_all)
            .unwrap_or(0)
    }

    pub fn cancel_all(&mut self) -> usize {
        let mut cancelled = abort_all(std::mem::take(&mut self.session));
        for (_, handles) in self.by_conversation.drain() {
            cancelled += abort_all(handles);
        }
        cancelled
    }

    pub fn pending(&self, conversation_id: &str) -> usize {
        self.by_conversation
            .get(conversation_id)
            .map(|handles| handles.iter().filter(|h| !h.is_finished()).count())
            .unwrap_or(0)
    }
}

fn abort_all(handles: Vec<AbortHandle>) -> usize {
    let mut live = 0;
    for h in handles {
        if !h.is_finished() {
            live += 1;
        }
        h.abort();
    }
    live
}

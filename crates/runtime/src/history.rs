//! Per-session conversation history.

use crate::types::{Message, Role};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Characters per estimated token.
const CHARS_PER_TOKEN: usize = 4;

/// Cheap deterministic token estimate for one message: content, tool call
/// names and arguments, and a small fixed overhead for the role framing.
pub fn estimate_message_tokens(message: &Message) -> usize {
    let mut chars = message.content.len();
    for call in &message.tool_calls {
        chars += call.name.len() + call.arguments.to_string().len();
    }
    chars.div_ceil(CHARS_PER_TOKEN) + 1
}

pub fn estimate_tokens(messages: &[Message]) -> usize {
    messages.iter().map(estimate_message_tokens).sum()
}

/// Drop the oldest messages until the estimate fits `token_limit`.
///
/// The most recent message is always kept, and tool-role messages left at the
/// front (their assistant call was trimmed away) are dropped as well.
pub fn trim_to_limit(messages: Vec<Message>, token_limit: usize) -> Vec<Message> {
    if token_limit == 0 || messages.is_empty() {
        return messages;
    }
    let mut total = estimate_tokens(&messages);
    let mut start = 0;
    while total > token_limit && start + 1 < messages.len() {
        total -= estimate_message_tokens(&messages[start]);
        start += 1;
    }
    while start + 1 < messages.len() && messages[start].role == Role::Tool {
        start += 1;
    }
    if start > 0 {
        debug!("Trimmed {} messages from outgoing history", start);
    }
    messages.into_iter().skip(start).collect()
}

/// Message list of one session.
///
/// Only one turn per session runs at a time (the session gate guarantees
/// it); the mutex makes the value shareable and is held only for copies and
/// in-place edits.
#[derive(Debug, Default)]
pub struct History {
    messages: Mutex<Vec<Message>>,
}

impl History {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_messages(messages: Vec<Message>) -> Self {
        Self {
            messages: Mutex::new(messages),
        }
    }

    pub fn append(&self, message: Message) {
        self.messages.lock().push(message);
    }

    pub fn snapshot(&self) -> Vec<Message> {
        self.messages.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.messages.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.lock().is_empty()
    }

    /// Replace the first `count` messages with `replacement`.
    pub fn replace_prefix(&self, count: usize, replacement: Message) {
        let mut messages = self.messages.lock();
        let count = count.min(messages.len());
        messages.splice(..count, std::iter::once(replacement));
    }
}

struct Entry {
    history: Arc<History>,
    last_used: u64,
}

/// Lazily created histories, bounded by session count.
pub struct HistoryStore {
    sessions: Mutex<HashMap<String, Entry>>,
    clock: Mutex<u64>,
    max_sessions: usize,
}

impl HistoryStore {
    pub fn new(max_sessions: usize) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            clock: Mutex::new(0),
            max_sessions: max_sessions.max(1),
        }
    }

    /// History for `session_id`, created on first use. Evicts the least
    /// recently used idle session when the store is over capacity.
    ///
    /// A history still referenced outside the store belongs to a turn in
    /// flight and is never evicted; when every session is in use the store
    /// grows past `max_sessions` until one of them goes idle.
    pub fn get(&self, session_id: &str) -> Arc<History> {
        let tick = {
            let mut clock = self.clock.lock();
            *clock += 1;
            *clock
        };
        let mut sessions = self.sessions.lock();
        if let Some(entry) = sessions.get_mut(session_id) {
            entry.last_used = tick;
            return Arc::clone(&entry.history);
        }

        while sessions.len() >= self.max_sessions {
            let oldest = sessions
                .iter()
                .filter(|(_, entry)| Arc::strong_count(&entry.history) == 1)
                .min_by_key(|(_, entry)| entry.last_used)
                .map(|(key, _)| key.clone());
            match oldest {
                Some(key) => {
                    debug!("Evicting history for session: {}", key);
                    sessions.remove(&key);
                }
                None => {
                    debug!(
                        "All {} sessions in use, exceeding capacity of {}",
                        sessions.len(),
                        self.max_sessions
                    );
                    break;
                }
            }
        }

        let history = Arc::new(History::new());
        sessions.insert(
            session_id.to_string(),
            Entry {
                history: Arc::clone(&history),
                last_used: tick,
            },
        );
        history
    }

    pub fn contains(&self, session_id: &str) -> bool {
        self.sessions.lock().contains_key(session_id)
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.lock().is_empty()
    }
}

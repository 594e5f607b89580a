use std::{
    collections::{HashMap, VecDeque},
    sync::{
        Mutex,
        atomic::{AtomicU64, Ordering},
    },
};

pub const HISTORY_CONTEXT_MARKER: &str = "[Chat messages since your last reply - for context]";
pub const CURRENT_MESSAGE_MARKER: &str = "[Current message - respond to this]";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryEntry {
    pub sender: String,
    pub body: String,
    /// Unix milliseconds.
    pub timestamp_ms: i64,
    pub message_id: String,
}

/// Conversations tracked before the least recently active one is dropped.
pub const MAX_HISTORY_CONVERSATIONS: usize = 1000;

/// Group messages the bot saw but did not answer, kept per conversation so
/// the next answered message can carry them as context.
pub struct ChatHistories {
    inner: Mutex<HashMap<String, Pending>>,
    max_conversations: usize,
    seq: AtomicU64,
}

struct Pending {
    entries: VecDeque<HistoryEntry>,
    touched: u64,
}

impl Default for ChatHistories {
    fn default() -> Self {
        Self::with_max_conversations(MAX_HISTORY_CONVERSATIONS)
    }
}

impl ChatHistories {
    pub fn with_max_conversations(max_conversations: usize) -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
            max_conversations: max_conversations.max(1),
            seq: AtomicU64::new(0),
        }
    }

    /// Append an entry, keeping at most `limit` per conversation.
    pub fn record(&self, key: &str, entry: HistoryEntry, limit: usize) {
        if limit == 0 {
            return;
        }
        let touched = self.seq.fetch_add(1, Ordering::Relaxed);
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let pending = inner.entry(key.to_string()).or_insert_with(|| Pending {
            entries: VecDeque::new(),
            touched,
        });
        pending.touched = touched;
        pending.entries.push_back(entry);
        while pending.entries.len() > limit {
            pending.entries.pop_front();
        }
        while inner.len() > self.max_conversations {
            let Some(stale) = inner
                .iter()
                .min_by_key(|(_, p)| p.touched)
                .map(|(k, _)| k.clone())
            else {
                break;
            };
            inner.remove(&stale);
        }
    }

    /// Remove and return the pending entries, oldest first.
    ///
    /// Taking is atomic, so two interleaved dispatches for the same
    /// conversation never both replay the same entries.
    pub fn take(&self, key: &str, limit: usize) -> Vec<HistoryEntry> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let Some(Pending { entries, .. }) = inner.remove(key) else {
            return Vec::new();
        };
        let skip = entries.len().saturating_sub(limit);
        entries.into_iter().skip(skip).collect()
    }

    pub fn pending(&self, key: &str) -> usize {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.get(key).map_or(0, |p| p.entries.len())
    }
}

/// Prefix the current message with formatted pending entries.
pub fn build_pending_context(
    entries: &[HistoryEntry],
    current_message: &str,
    format_entry: impl Fn(&HistoryEntry) -> String,
) -> String {
    if entries.is_empty() {
        return current_message.to_string();
    }
    let history = entries
        .iter()
        .map(format_entry)
        .collect::<Vec<_>>()
        .join("\n");
    format!("{HISTORY_CONTEXT_MARKER}\n{history}\n\n{CURRENT_MESSAGE_MARKER}\n{current_message}")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(n: usize) -> HistoryEntry {
        HistoryEntry {
            sender: format!("user{n}"),
            body: format!("message {n}"),
            timestamp_ms: n as i64,
            message_id: format!("m{n}"),
        }
    }

    #[test]
    fn keeps_only_the_newest_entries() {
        let histories = ChatHistories::default();
        for n in 0..5 {
            histories.record("cid", entry(n), 3);
        }
        assert_eq!(histories.pending("cid"), 3);
        let taken = histories.take("cid", 3);
        assert_eq!(
            taken.iter().map(|e| e.message_id.as_str()).collect::<Vec<_>>(),
            vec!["m2", "m3", "m4"]
        );
        assert_eq!(histories.pending("cid"), 0);
        assert!(histories.take("cid", 3).is_empty());
    }

    #[test]
    fn quiet_conversations_are_dropped_first() {
        let histories = ChatHistories::with_max_conversations(2);
        histories.record("a", entry(1), 5);
        histories.record("b", entry(2), 5);
        histories.record("a", entry(3), 5);
        histories.record("c", entry(4), 5);
        assert_eq!(histories.pending("b"), 0);
        assert_eq!(histories.pending("a"), 2);
        assert_eq!(histories.pending("c"), 1);
    }

    #[test]
    fn zero_limit_disables_recording() {
        let histories = ChatHistories::default();
        histories.record("cid", entry(1), 0);
        assert_eq!(histories.pending("cid"), 0);
    }

    #[test]
    fn pending_context_wraps_current_message() {
        let body = build_pending_context(&[entry(1), entry(2)], "now", |e| {
            format!("{}: {}", e.sender, e.body)
        });
        assert_eq!(
            body,
            format!(
                "{HISTORY_CONTEXT_MARKER}\nuser1: message 1\nuser2: message 2\n\n\
                 {CURRENT_MESSAGE_MARKER}\nnow"
            )
        );
        assert_eq!(build_pending_context(&[], "now", |_| String::new()), "now");
    }
}

use std::{collections::HashMap, sync::RwLock};

use dingbot_channels::ChatType;

use crate::event::MessageContext;

/// Where a reply goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplyTarget {
    /// Key for session webhooks and rate limiting.
    pub conversation_id: String,
    pub chat_type: ChatType,
    /// Recipient of REST sends in direct chats.
    pub user_id: Option<String>,
}

impl ReplyTarget {
    pub fn from_context(ctx: &MessageContext) -> Self {
        Self {
            conversation_id: ctx.chat_id.clone(),
            chat_type: ctx.chat_type,
            user_id: (!ctx.is_group()).then(|| ctx.sender_id.clone()),
        }
    }

    pub fn direct(user_id: &str) -> Self {
        Self {
            conversation_id: user_id.to_string(),
            chat_type: ChatType::Direct,
            user_id: Some(user_id.to_string()),
        }
    }

    pub fn group(conversation_id: &str) -> Self {
        Self {
            conversation_id: conversation_id.to_string(),
            chat_type: ChatType::Group,
            user_id: None,
        }
    }
}

/// Reply targets learned from inbound traffic, keyed by conversation ID and,
/// for direct chats, by the sender's user ID.
///
/// The least recently recorded key is evicted once the directory is full.
pub struct ConversationDirectory {
    inner: RwLock<DirectoryInner>,
    capacity: usize,
}

#[derive(Default)]
struct DirectoryInner {
    targets: HashMap<String, (ReplyTarget, u64)>,
    seq: u64,
}

impl ConversationDirectory {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: RwLock::new(DirectoryInner::default()),
            capacity: capacity.max(1),
        }
    }

    pub fn record(&self, target: &ReplyTarget) {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        inner.seq += 1;
        let seq = inner.seq;
        inner
            .targets
            .insert(target.conversation_id.clone(), (target.clone(), seq));
        if let Some(user_id) = target.user_id.as_ref() {
            inner.targets.insert(user_id.clone(), (target.clone(), seq));
        }
        while inner.targets.len() > self.capacity {
            let Some(oldest) = inner
                .targets
                .iter()
                .min_by_key(|(_, (_, seen))| *seen)
                .map(|(id, _)| id.clone())
            else {
                break;
            };
            inner.targets.remove(&oldest);
        }
    }

    pub fn lookup(&self, id: &str) -> Option<ReplyTarget> {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        inner.targets.get(id).map(|(target, _)| target.clone())
    }
}

/// Split an outbound address into an optional chat-type hint and the bare ID.
///
/// Accepts `chat:`, `group:`, `user:`, `dingtalk:` and `dingtalk:group:`
/// prefixes, as produced in inbound `From`/`To` fields.
pub fn parse_address(to: &str) -> (Option<ChatType>, &str) {
    let to = to.trim();
    let to = strip_prefix_ignore_case(to, "dingtalk:").unwrap_or(to);
    for (prefix, kind) in [
        ("group:", ChatType::Group),
        ("chat:", ChatType::Group),
        ("user:", ChatType::Direct),
    ] {
        if let Some(rest) = strip_prefix_ignore_case(to, prefix) {
            return (Some(kind), rest.trim());
        }
    }
    (None, to)
}

fn strip_prefix_ignore_case<'a>(s: &'a str, prefix: &str) -> Option<&'a str> {
    let head = s.get(..prefix.len())?;
    head.eq_ignore_ascii_case(prefix).then(|| &s[prefix.len()..])
}

/// Guess the chat type from the shape of an ID: open conversation IDs start
/// with `cid`, anything else is taken as a user ID.
pub fn guess_chat_type(id: &str) -> ChatType {
    if id.starts_with("cid") {
        ChatType::Group
    } else {
        ChatType::Direct
    }
}

/// Resolve an outbound address, preferring what inbound traffic taught us.
pub fn resolve_target(directory: &ConversationDirectory, to: &str) -> ReplyTarget {
    let (hint, id) = parse_address(to);
    if let Some(known) = directory.lookup(id)
        && hint.is_none_or(|h| h == known.chat_type)
    {
        return known;
    }
    match hint.unwrap_or_else(|| guess_chat_type(id)) {
        ChatType::Direct => ReplyTarget::direct(id),
        ChatType::Group => ReplyTarget::group(id),
    }
}

use dingbot_channels::{
    ChatType,
    gating::{DmPolicy, GroupPolicy, matches_allowlist},
};

use crate::{config::DingTalkAccountConfig, event::MessageContext};

/// Why an inbound message was not forwarded to the agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AccessDenied {
    NotMentioned,
    GroupsDisabled,
    GroupNotAllowed,
    SenderNotAllowed,
}

impl std::fmt::Display for AccessDenied {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotMentioned => write!(f, "bot not mentioned in group"),
            Self::GroupsDisabled => write!(f, "group messages disabled"),
            Self::GroupNotAllowed => write!(f, "group not on allowlist"),
            Self::SenderNotAllowed => write!(f, "sender not on DM allowlist"),
        }
    }
}

/// Decide whether a message may reach the agent. No I/O, no side effects.
///
/// Groups: the mention gate runs first, then the group policy.
/// Direct messages: `open` and `pairing` pass (pairing is the host's
/// approval flow), `allowlist` needs the sender on `allowFrom`.
pub fn check_access(
    config: &DingTalkAccountConfig,
    ctx: &MessageContext,
) -> Result<(), AccessDenied> {
    match ctx.chat_type {
        ChatType::Group => {
            if config.require_mention && !ctx.mentioned_bot {
                return Err(AccessDenied::NotMentioned);
            }
            match config.group_policy {
                GroupPolicy::Open => Ok(()),
                GroupPolicy::Allowlist => {
                    if group_allowlisted(&ctx.chat_id, &config.group_allow_from) {
                        Ok(())
                    } else {
                        Err(AccessDenied::GroupNotAllowed)
                    }
                },
                GroupPolicy::Disabled => Err(AccessDenied::GroupsDisabled),
            }
        },
        ChatType::Direct => match config.dm_policy {
            DmPolicy::Open | DmPolicy::Pairing => Ok(()),
            DmPolicy::Allowlist => {
                if allowlisted(&ctx.sender_id, &config.allow_from) {
                    Ok(())
                } else {
                    Err(AccessDenied::SenderNotAllowed)
                }
            },
        },
    }
}

/// Conversation IDs are case-sensitive base64, so groups need an exact entry.
fn group_allowlisted(chat_id: &str, entries: &[String]) -> bool {
    entries.iter().any(|e| e.trim() == chat_id)
}

fn allowlisted(id: &str, entries: &[String]) -> bool {
    let normalized: Vec<String> = entries
        .iter()
        .map(|e| normalize_allow_entry(e))
        .filter(|e| !e.is_empty())
        .collect();
    matches_allowlist(id, &normalized)
}

/// Strip a `dingtalk:` or `user:` prefix (any case) from an allowlist entry.
pub fn normalize_allow_entry(entry: &str) -> String {
    let trimmed = entry.trim();
    for prefix in ["dingtalk:", "user:"] {
        if trimmed.len() >= prefix.len()
            && trimmed.is_char_boundary(prefix.len())
            && trimmed[..prefix.len()].eq_ignore_ascii_case(prefix)
        {
            return trimmed[prefix.len()..].trim().to_string();
        }
    }
    trimmed.to_string()
}

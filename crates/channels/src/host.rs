//! Host runtime consumed by channel plugins.
//!
//! The host owns agent routing, session keys, envelope formatting and the
//! agent round-trip itself. Plugins translate their wire events into an
//! [`InboundContext`] and give the host a [`ReplyDispatcher`] that turns the
//! agent's replies back into channel sends.

use std::sync::Arc;

use {
    anyhow::Result,
    async_trait::async_trait,
    serde::{Deserialize, Serialize},
};

use crate::plugin::ChatType;

/// Kind of peer an inbound message is routed by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PeerKind {
    Dm,
    Group,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutePeer {
    pub kind: PeerKind,
    pub id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteRequest {
    pub channel: String,
    pub account_id: String,
    pub peer: RoutePeer,
}

/// Agent and session an inbound message resolves to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentRoute {
    pub agent_id: String,
    pub session_key: String,
    pub account_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemEventOptions {
    pub session_key: String,
    /// Dedup key; the host drops a second event with the same key.
    pub context_key: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvelopeParams {
    /// Channel display name (e.g. "DingTalk").
    pub channel: String,
    pub from: String,
    /// Unix milliseconds.
    pub timestamp_ms: i64,
    pub body: String,
}

/// Inbound message context handed to the agent.
///
/// Field names mirror the host's context keys.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct InboundContext {
    pub body: String,
    pub raw_body: String,
    pub command_body: String,
    pub from: String,
    pub to: String,
    pub session_key: String,
    pub account_id: String,
    pub chat_type: ChatType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub group_subject: Option<String>,
    pub sender_name: String,
    pub sender_id: String,
    pub provider: String,
    pub surface: String,
    pub message_sid: String,
    /// Unix milliseconds.
    pub timestamp: i64,
    pub was_mentioned: bool,
    pub command_authorized: bool,
    pub originating_channel: String,
    pub originating_to: String,
}

/// Which stage of an agent run produced a reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplyKind {
    Tool,
    Block,
    Final,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplyPayload {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub media_url: Option<String>,
    /// Channel-native interactive card.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub card: Option<serde_json::Value>,
}

impl ReplyPayload {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.text.as_deref().is_none_or(|t| t.trim().is_empty())
            && self.media_url.is_none()
            && self.card.is_none()
    }
}

/// Replies accepted but not yet delivered, per kind.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueuedCounts {
    pub tool: usize,
    pub block: usize,
    #[serde(rename = "final")]
    pub final_reply: usize,
}

impl QueuedCounts {
    pub fn total(&self) -> usize {
        self.tool + self.block + self.final_reply
    }

    pub fn get_mut(&mut self, kind: ReplyKind) -> &mut usize {
        match kind {
            ReplyKind::Tool => &mut self.tool,
            ReplyKind::Block => &mut self.block,
            ReplyKind::Final => &mut self.final_reply,
        }
    }
}

/// Reply sink a plugin hands to the host for one inbound message.
#[async_trait]
pub trait ReplyDispatcher: Send + Sync {
    /// Deliver a payload right away, bypassing the queue.
    async fn dispatch(&self, payload: ReplyPayload, kind: ReplyKind) -> Result<()>;

    /// Queue an intermediate block of a streamed reply.
    /// Returns `false` when the payload was refused.
    fn send_block_reply(&self, payload: ReplyPayload) -> bool;

    /// Queue the final reply. Returns `false` when the payload was refused.
    fn send_final_reply(&self, payload: ReplyPayload) -> bool;

    fn queued_counts(&self) -> QueuedCounts;

    /// Resolves once every queued reply has been delivered or dropped.
    async fn wait_for_idle(&self);
}

/// Result of one agent round-trip.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchOutcome {
    pub queued_final: bool,
    pub counts: QueuedCounts,
}

/// Services the host exposes to channel plugins.
#[async_trait]
pub trait ChannelHost: Send + Sync {
    fn resolve_agent_route(&self, request: &RouteRequest) -> Result<AgentRoute>;

    fn enqueue_system_event(&self, text: &str, options: SystemEventOptions);

    fn format_agent_envelope(&self, params: &EnvelopeParams) -> String;

    fn finalize_inbound_context(&self, context: InboundContext) -> InboundContext;

    /// Run the agent for `context` and feed its replies to `dispatcher`.
    async fn dispatch_reply_from_config(
        &self,
        context: InboundContext,
        dispatcher: Arc<dyn ReplyDispatcher>,
    ) -> Result<DispatchOutcome>;

    /// Host-wide default for group history buffering.
    fn group_history_limit(&self) -> Option<usize> {
        None
    }
}

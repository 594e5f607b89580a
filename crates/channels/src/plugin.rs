use std::collections::HashMap;

use {
    anyhow::Result,
    async_trait::async_trait,
    serde::{Deserialize, Serialize},
};

/// Text sent to a user once the host approves their pairing request.
pub const PAIRING_APPROVED_MESSAGE: &str =
    "Your access has been approved. Send a message to start chatting.";

/// Kind of conversation a message belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatType {
    Direct,
    Group,
}

impl ChatType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Direct => "direct",
            Self::Group => "group",
        }
    }

    pub fn is_group(self) -> bool {
        matches!(self, Self::Group)
    }
}

/// Static description of a channel, shown in the host's channel picker.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelMeta {
    pub id: &'static str,
    pub label: &'static str,
    pub selection_label: &'static str,
    pub docs_path: &'static str,
    pub blurb: &'static str,
    pub order: u32,
}

/// What a channel can do.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelCapabilities {
    pub chat_types: Vec<ChatType>,
    pub polls: bool,
    pub threads: bool,
    pub media: bool,
    pub reactions: bool,
    pub edit: bool,
    pub reply: bool,
    pub native_commands: bool,
}

/// Whether the agent may use tools in a group conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ToolPolicy {
    pub allowed: bool,
    pub reason: Option<String>,
}

impl ToolPolicy {
    #[must_use]
    pub fn allowed() -> Self {
        Self {
            allowed: true,
            reason: None,
        }
    }

    #[must_use]
    pub fn denied(reason: impl Into<String>) -> Self {
        Self {
            allowed: false,
            reason: Some(reason.into()),
        }
    }
}

/// Core channel plugin trait. Each messaging platform implements this.
#[async_trait]
pub trait ChannelPlugin: Send + Sync {
    /// Channel identifier (e.g. "dingtalk").
    fn id(&self) -> &str;

    /// Human-readable channel name.
    fn name(&self) -> &str;

    fn meta(&self) -> ChannelMeta;

    fn capabilities(&self) -> ChannelCapabilities;

    /// JSON schema of the channel's config subtree.
    fn config_schema(&self) -> serde_json::Value;

    /// Start an account connection.
    async fn start_account(&mut self, account_id: &str, config: serde_json::Value) -> Result<()>;

    /// Stop an account connection. Resolves once teardown is complete.
    async fn stop_account(&mut self, account_id: &str) -> Result<()>;

    /// Get outbound adapter for sending messages.
    fn outbound(&self) -> Option<&dyn ChannelOutbound>;

    /// Get status adapter for health checks.
    fn status(&self) -> Option<&dyn ChannelStatus>;

    fn pairing(&self) -> Option<&dyn ChannelPairing> {
        None
    }

    fn security(&self) -> Option<&dyn ChannelSecurity> {
        None
    }

    fn onboarding(&self) -> Option<&dyn ChannelOnboarding> {
        None
    }

    /// Lines appended to the agent's message-tool instructions.
    fn message_tool_hints(&self) -> Vec<String> {
        Vec::new()
    }

    fn group_tool_policy(&self, _account_id: &str, _group_id: &str) -> ToolPolicy {
        ToolPolicy::allowed()
    }

    /// Config key prefixes whose change requires restarting this channel.
    fn reload_config_prefixes(&self) -> Vec<String> {
        Vec::new()
    }
}

/// Send messages to a channel.
#[async_trait]
pub trait ChannelOutbound: Send + Sync {
    async fn send_text(&self, account_id: &str, to: &str, text: &str) -> Result<()>;
    async fn send_markdown(&self, account_id: &str, to: &str, title: &str, text: &str)
    -> Result<()>;
    async fn send_card(&self, account_id: &str, to: &str, card: &serde_json::Value) -> Result<()>;
}

/// Probe channel account health.
#[async_trait]
pub trait ChannelStatus: Send + Sync {
    /// Actively check that the account's credentials work.
    async fn probe(&self, account_id: &str) -> Result<ChannelHealthSnapshot>;

    /// Cheap snapshot of the running account, `None` if it was never started.
    fn snapshot(&self, account_id: &str) -> Option<AccountSnapshot>;
}

/// Channel health snapshot.
#[derive(Debug, Clone)]
pub struct ChannelHealthSnapshot {
    pub connected: bool,
    pub account_id: String,
    pub details: Option<String>,
}

/// Runtime view of one account for the host's status page.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountSnapshot {
    pub account_id: String,
    pub enabled: bool,
    pub configured: bool,
    pub running: bool,
    pub connected: bool,
    pub status: String,
    /// Unix seconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connected_at: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub reconnect_count: u64,
    pub messages_received: u64,
    pub messages_sent: u64,
}

/// Pairing hooks used by the host's sender-approval flow.
#[async_trait]
pub trait ChannelPairing: Send + Sync {
    /// Label of the identifier users are asked for (e.g. "dingtalkUserId").
    fn id_label(&self) -> &str;

    /// Normalize an allowlist entry typed by an operator.
    fn normalize_allow_entry(&self, entry: &str) -> String;

    /// Tell a freshly approved user they can start chatting.
    async fn notify_approval(&self, account_id: &str, id: &str) -> Result<()>;
}

/// Security review of a channel config.
pub trait ChannelSecurity: Send + Sync {
    /// Human-readable warnings about risky settings in the host config.
    fn collect_warnings(&self, config: &serde_json::Value) -> Vec<String>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OnboardingFieldKind {
    Text,
    Password,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OnboardingField {
    pub key: &'static str,
    pub label: &'static str,
    pub kind: OnboardingFieldKind,
    pub required: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OnboardingStep {
    pub id: &'static str,
    pub title: &'static str,
    pub fields: Vec<OnboardingField>,
}

/// Interactive setup wizard for a channel.
pub trait ChannelOnboarding: Send + Sync {
    fn steps(&self) -> Vec<OnboardingStep>;

    /// Merge the collected field values into the host config and return it.
    fn apply(
        &self,
        config: serde_json::Value,
        values: &HashMap<String, String>,
    ) -> Result<serde_json::Value>;
}

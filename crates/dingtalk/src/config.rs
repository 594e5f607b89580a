use std::time::Duration;

use {
    dingbot_channels::gating::{DmPolicy, GroupPolicy},
    secrecy::{ExposeSecret, Secret},
    serde::{Deserialize, Serialize},
};

use crate::error::{Error, Result};

pub const DEFAULT_API_BASE: &str = "https://api.dingtalk.com";
pub const DEFAULT_STREAM_ENDPOINT: &str = "wss://connect-api.dingtalk.com/stream";
pub const DEFAULT_HISTORY_LIMIT: usize = 50;
/// Floor for `reconnectIntervalMs`, so a zero never spins.
const MIN_RECONNECT_INTERVAL_MS: u64 = 100;

/// Configuration for the DingTalk bot account (`channels.dingtalk`).
#[derive(Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct DingTalkAccountConfig {
    pub enabled: bool,

    /// App key (client ID) of the DingTalk application.
    pub app_key: String,

    /// App secret (client secret).
    #[serde(serialize_with = "serialize_secret")]
    pub app_secret: Secret<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,

    pub dm_policy: DmPolicy,

    /// Staff IDs allowed to DM the bot under the allowlist policy.
    pub allow_from: Vec<String>,

    pub group_policy: GroupPolicy,

    /// Conversation IDs allowed under the group allowlist policy.
    pub group_allow_from: Vec<String>,

    /// Only answer group messages that @mention the bot.
    pub require_mention: bool,

    /// Pending group messages kept as context; falls back to the host default.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub history_limit: Option<usize>,

    /// Fixed stream endpoint. When unset the endpoint is obtained from the
    /// gateway open-connection call.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream_endpoint: Option<String>,

    pub api_base: String,

    /// Robot code for REST sends; defaults to the app key.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub robot_code: Option<String>,

    pub heartbeat_interval_ms: u64,
    pub reconnect_interval_ms: u64,
    pub max_reconnect_interval_ms: u64,
    pub reconnect_jitter: bool,

    /// Retention for session webhooks that carry no expiry of their own.
    pub webhook_ttl_secs: u64,
    pub webhook_capacity: usize,

    /// Longest text sent in one message, in characters.
    pub text_chunk_limit: usize,
}

impl std::fmt::Debug for DingTalkAccountConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DingTalkAccountConfig")
            .field("enabled", &self.enabled)
            .field("app_key", &self.app_key)
            .field("app_secret", &"[REDACTED]")
            .field("agent_id", &self.agent_id)
            .field("dm_policy", &self.dm_policy)
            .field("allow_from", &self.allow_from)
            .field("group_policy", &self.group_policy)
            .field("group_allow_from", &self.group_allow_from)
            .field("require_mention", &self.require_mention)
            .field("history_limit", &self.history_limit)
            .field("stream_endpoint", &self.stream_endpoint)
            .field("api_base", &self.api_base)
            .field("robot_code", &self.robot_code)
            .finish_non_exhaustive()
    }
}

fn serialize_secret<S: serde::Serializer>(
    secret: &Secret<String>,
    serializer: S,
) -> std::result::Result<S::Ok, S::Error> {
    serializer.serialize_str(secret.expose_secret())
}

impl Default for DingTalkAccountConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            app_key: String::new(),
            app_secret: Secret::new(String::new()),
            agent_id: None,
            dm_policy: DmPolicy::Pairing,
            allow_from: Vec::new(),
            group_policy: GroupPolicy::Open,
            group_allow_from: Vec::new(),
            require_mention: true,
            history_limit: None,
            stream_endpoint: None,
            api_base: DEFAULT_API_BASE.into(),
            robot_code: None,
            heartbeat_interval_ms: 30_000,
            reconnect_interval_ms: 5_000,
            max_reconnect_interval_ms: 60_000,
            reconnect_jitter: true,
            webhook_ttl_secs: 90 * 60,
            webhook_capacity: 1024,
            text_chunk_limit: 4000,
        }
    }
}

impl DingTalkAccountConfig {
    /// Parse the host's config subtree for this channel.
    pub fn from_value(value: serde_json::Value) -> Result<Self> {
        if value.is_null() {
            return Ok(Self::default());
        }
        serde_json::from_value(value).map_err(Error::config)
    }

    pub fn robot_code(&self) -> &str {
        self.robot_code
            .as_deref()
            .filter(|c| !c.trim().is_empty())
            .unwrap_or(self.app_key.trim())
    }

    pub fn api_base(&self) -> &str {
        self.api_base.trim_end_matches('/')
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms.max(1_000))
    }

    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_millis(self.reconnect_interval_ms.max(MIN_RECONNECT_INTERVAL_MS))
    }

    /// Backoff ceiling; never below the base reconnect interval.
    pub fn max_reconnect_interval(&self) -> Duration {
        Duration::from_millis(self.max_reconnect_interval_ms).max(self.reconnect_interval())
    }

    pub fn webhook_ttl(&self) -> Duration {
        Duration::from_secs(self.webhook_ttl_secs)
    }

    /// Effective group history limit, 0 meaning no buffering.
    pub fn history_limit(&self, host_default: Option<usize>) -> usize {
        self.history_limit
            .or(host_default)
            .unwrap_or(DEFAULT_HISTORY_LIMIT)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_behaviour() {
        let cfg = DingTalkAccountConfig::from_value(serde_json::json!({
            "appKey": "ding123",
            "appSecret": "s3cret",
        }))
        .unwrap();
        assert!(cfg.enabled);
        assert_eq!(cfg.dm_policy, DmPolicy::Pairing);
        assert_eq!(cfg.group_policy, GroupPolicy::Open);
        assert!(cfg.require_mention);
        assert_eq!(cfg.robot_code(), "ding123");
        assert_eq!(cfg.heartbeat_interval(), Duration::from_secs(30));
        assert_eq!(cfg.reconnect_interval(), Duration::from_secs(5));
        assert_eq!(cfg.history_limit(None), DEFAULT_HISTORY_LIMIT);
        assert_eq!(cfg.history_limit(Some(7)), 7);
    }

    #[test]
    fn parses_camel_case_keys() {
        let cfg = DingTalkAccountConfig::from_value(serde_json::json!({
            "appKey": "k",
            "appSecret": "s",
            "dmPolicy": "allowlist",
            "allowFrom": ["u1"],
            "groupPolicy": "disabled",
            "groupAllowFrom": ["cid1"],
            "requireMention": false,
            "historyLimit": 0,
            "robotCode": "robot-1",
            "apiBase": "http://localhost:1234/",
        }))
        .unwrap();
        assert_eq!(cfg.dm_policy, DmPolicy::Allowlist);
        assert_eq!(cfg.allow_from, vec!["u1".to_string()]);
        assert_eq!(cfg.group_policy, GroupPolicy::Disabled);
        assert!(!cfg.require_mention);
        assert_eq!(cfg.history_limit(Some(9)), 0);
        assert_eq!(cfg.robot_code(), "robot-1");
        assert_eq!(cfg.api_base(), "http://localhost:1234");
    }

    #[test]
    fn negative_history_limit_is_a_config_error() {
        let err = DingTalkAccountConfig::from_value(serde_json::json!({ "historyLimit": -1 }))
            .unwrap_err();
        assert!(matches!(err, Error::Config { .. }));
    }

    #[test]
    fn debug_redacts_secret() {
        let cfg = DingTalkAccountConfig {
            app_secret: Secret::new("top-secret".into()),
            ..Default::default()
        };
        let debug = format!("{cfg:?}");
        assert!(debug.contains("[REDACTED]"));
        assert!(!debug.contains("top-secret"));
    }

    #[test]
    fn backoff_ceiling_never_below_base() {
        let cfg = DingTalkAccountConfig {
            reconnect_interval_ms: 10_000,
            max_reconnect_interval_ms: 1_000,
            ..Default::default()
        };
        assert_eq!(cfg.max_reconnect_interval(), Duration::from_secs(10));
    }
}

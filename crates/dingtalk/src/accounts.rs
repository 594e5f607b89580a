use {
    secrecy::{ExposeSecret, Secret},
    serde::Serialize,
};

use crate::{
    config::DingTalkAccountConfig,
    error::{Error, Result},
};

pub const DEFAULT_ACCOUNT_ID: &str = "default";

/// App credentials extracted from the channel config.
#[derive(Clone)]
pub struct DingTalkCredentials {
    pub app_key: String,
    pub app_secret: Secret<String>,
    pub agent_id: Option<String>,
}

impl std::fmt::Debug for DingTalkCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DingTalkCredentials")
            .field("app_key", &self.app_key)
            .field("app_secret", &"[REDACTED]")
            .field("agent_id", &self.agent_id)
            .finish()
    }
}

/// Extract credentials, or `None` when the app key or secret is missing.
pub fn resolve_credentials(config: &DingTalkAccountConfig) -> Option<DingTalkCredentials> {
    let app_key = config.app_key.trim();
    let app_secret = config.app_secret.expose_secret().trim();
    if app_key.is_empty() || app_secret.is_empty() {
        return None;
    }
    Some(DingTalkCredentials {
        app_key: app_key.to_string(),
        app_secret: Secret::new(app_secret.to_string()),
        agent_id: config
            .agent_id
            .as_deref()
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .map(str::to_string),
    })
}

/// Like [`resolve_credentials`], but a missing credential is a config error.
pub fn require_credentials(config: &DingTalkAccountConfig) -> Result<DingTalkCredentials> {
    resolve_credentials(config)
        .ok_or_else(|| Error::config("appKey and appSecret are required for DingTalk"))
}

/// Account summary the host shows in channel listings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolvedAccount {
    pub account_id: String,
    pub enabled: bool,
    pub configured: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub app_key: Option<String>,
}

pub fn resolve_account(
    account_id: Option<&str>,
    config: &DingTalkAccountConfig,
) -> ResolvedAccount {
    let credentials = resolve_credentials(config);
    ResolvedAccount {
        account_id: account_id.unwrap_or(DEFAULT_ACCOUNT_ID).to_string(),
        enabled: config.enabled,
        configured: credentials.is_some(),
        app_key: credentials.map(|c| c.app_key),
    }
}

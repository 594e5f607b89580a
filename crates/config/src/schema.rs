use serde::{Deserialize, Serialize};

/// Root of `dingbot.{toml,yaml,yml,json}`.
///
/// Channel subtrees stay untyped here; each channel crate parses its own.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DingbotConfig {
    pub logging: LoggingConfig,
    pub channels: ChannelsConfig,
}

impl DingbotConfig {
    pub fn from_value(value: &serde_json::Value) -> crate::Result<Self> {
        if value.is_null() {
            return Ok(Self::default());
        }
        Ok(serde_json::from_value(value.clone())?)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter directive; `RUST_LOG` takes precedence.
    pub level: String,
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            json: false,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelsConfig {
    /// Host-wide group history default, overridden per account.
    #[serde(rename = "historyLimit", skip_serializing_if = "Option::is_none")]
    pub history_limit: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dingtalk: Option<serde_json::Value>,
}

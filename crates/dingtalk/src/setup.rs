//! Helpers over the host config tree.
//!
//! The channel lives under `channels.dingtalk`. The section itself is the
//! `default` account; further accounts go under `channels.dingtalk.accounts`
//! and inherit any top-level field they do not set.

use std::collections::HashMap;

use {
    dingbot_channels::{OnboardingField, OnboardingFieldKind, OnboardingStep, gating::GroupPolicy},
    serde::Serialize,
    serde_json::{Map, Value, json},
};

use crate::{
    CHANNEL_ID,
    accounts::{DEFAULT_ACCOUNT_ID, ResolvedAccount},
    config::{
        DEFAULT_API_BASE, DEFAULT_HISTORY_LIMIT, DEFAULT_STREAM_ENDPOINT, DingTalkAccountConfig,
    },
    error::{Error, Result},
};

const ACCOUNTS_KEY: &str = "accounts";

fn section(root: &Value) -> Option<&Map<String, Value>> {
    root.get("channels")
        .and_then(|c| c.get(CHANNEL_ID))
        .and_then(Value::as_object)
}

/// Account IDs present in the config, `default` first.
pub fn list_account_ids(root: &Value) -> Vec<String> {
    let Some(section) = section(root) else {
        return Vec::new();
    };
    let mut ids: Vec<String> = section
        .get(ACCOUNTS_KEY)
        .and_then(Value::as_object)
        .map(|accounts| accounts.keys().cloned().collect())
        .unwrap_or_default();
    ids.sort();
    let has_top_level = section.keys().any(|k| k != ACCOUNTS_KEY);
    if (has_top_level || ids.is_empty()) && !ids.iter().any(|id| id == DEFAULT_ACCOUNT_ID) {
        ids.insert(0, DEFAULT_ACCOUNT_ID.to_string());
    }
    ids
}

/// Effective raw config of one account, `Null` when it does not exist.
pub fn account_config_value(root: &Value, account_id: &str) -> Value {
    let Some(section) = section(root) else {
        return Value::Null;
    };
    let mut merged: Map<String, Value> = section
        .iter()
        .filter(|(key, _)| key.as_str() != ACCOUNTS_KEY)
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect();
    match section
        .get(ACCOUNTS_KEY)
        .and_then(|accounts| accounts.get(account_id))
        .and_then(Value::as_object)
    {
        Some(overrides) => {
            for (key, value) in overrides {
                merged.insert(key.clone(), value.clone());
            }
        },
        None if account_id != DEFAULT_ACCOUNT_ID => return Value::Null,
        None => {},
    }
    Value::Object(merged)
}

pub fn load_account(root: &Value, account_id: &str) -> Result<DingTalkAccountConfig> {
    DingTalkAccountConfig::from_value(account_config_value(root, account_id))
}

pub fn resolve_account(root: &Value, account_id: Option<&str>) -> Result<ResolvedAccount> {
    let account_id = account_id.unwrap_or(DEFAULT_ACCOUNT_ID);
    let config = load_account(root, account_id)?;
    Ok(crate::accounts::resolve_account(Some(account_id), &config))
}

pub fn is_configured(root: &Value, account_id: &str) -> bool {
    resolve_account(root, Some(account_id)).is_ok_and(|a| a.configured)
}

/// What `dingbot status` and the host's channel page show for an account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountDescription {
    #[serde(flatten)]
    pub account: ResolvedAccount,
    pub dm_policy: &'static str,
    pub group_policy: &'static str,
    pub require_mention: bool,
    pub allow_from: Vec<String>,
    pub group_allow_from: Vec<String>,
}

pub fn describe_account(root: &Value, account_id: &str) -> Result<AccountDescription> {
    let config = load_account(root, account_id)?;
    Ok(AccountDescription {
        account: crate::accounts::resolve_account(Some(account_id), &config),
        dm_policy: config.dm_policy.as_str(),
        group_policy: config.group_policy.as_str(),
        require_mention: config.require_mention,
        allow_from: format_allow_from(&config.allow_from),
        group_allow_from: format_group_allow_from(&config.group_allow_from),
    })
}

fn object_entry<'a>(
    map: &'a mut Map<String, Value>,
    key: &str,
) -> Result<&'a mut Map<String, Value>> {
    let value = map
        .entry(key.to_string())
        .or_insert_with(|| Value::Object(Map::new()));
    if value.is_null() {
        *value = Value::Object(Map::new());
    }
    value
        .as_object_mut()
        .ok_or_else(|| Error::config(format!("`{key}` must be an object")))
}

fn section_mut(root: &mut Value) -> Result<&mut Map<String, Value>> {
    if root.is_null() {
        *root = json!({});
    }
    let root = root
        .as_object_mut()
        .ok_or_else(|| Error::config("config root must be an object"))?;
    let channels = object_entry(root, "channels")?;
    object_entry(channels, CHANNEL_ID)
}

/// The map holding an account's own fields, created on demand.
fn account_slot_mut<'a>(
    root: &'a mut Value,
    account_id: &str,
) -> Result<&'a mut Map<String, Value>> {
    let section = section_mut(root)?;
    let listed = section
        .get(ACCOUNTS_KEY)
        .and_then(Value::as_object)
        .is_some_and(|accounts| accounts.contains_key(account_id));
    if account_id == DEFAULT_ACCOUNT_ID && !listed {
        return Ok(section);
    }
    let accounts = object_entry(section, ACCOUNTS_KEY)?;
    object_entry(accounts, account_id)
}

pub fn set_account_enabled(root: &mut Value, account_id: &str, enabled: bool) -> Result<()> {
    account_slot_mut(root, account_id)?.insert("enabled".into(), Value::Bool(enabled));
    Ok(())
}

/// Remove an account. Returns whether anything was removed.
pub fn delete_account(root: &mut Value, account_id: &str) -> bool {
    let Some(channels) = root.get_mut("channels").and_then(Value::as_object_mut) else {
        return false;
    };
    let Some(section) = channels.get_mut(CHANNEL_ID).and_then(Value::as_object_mut) else {
        return false;
    };

    if let Some(accounts) = section.get_mut(ACCOUNTS_KEY).and_then(Value::as_object_mut)
        && accounts.remove(account_id).is_some()
    {
        if accounts.is_empty() {
            section.remove(ACCOUNTS_KEY);
        }
        if section.is_empty() {
            channels.remove(CHANNEL_ID);
        }
        return true;
    }

    if account_id != DEFAULT_ACCOUNT_ID {
        return false;
    }
    let before = section.len();
    section.retain(|key, _| key == ACCOUNTS_KEY);
    let removed = section.len() != before;
    if section.is_empty() {
        channels.remove(CHANNEL_ID);
    }
    removed
}

/// Merge `patch` into an account and enable it.
pub fn apply_account_config(root: &mut Value, account_id: &str, patch: Value) -> Result<()> {
    let patch = match patch {
        Value::Object(map) => map,
        Value::Null => Map::new(),
        _ => return Err(Error::config("account config patch must be an object")),
    };
    let slot = account_slot_mut(root, account_id)?;
    let mut merged = slot.clone();
    merged.extend(patch);
    merged.insert("enabled".into(), Value::Bool(true));

    let mut own = merged.clone();
    own.remove(ACCOUNTS_KEY);
    DingTalkAccountConfig::from_value(Value::Object(own))?;
    *slot = merged;
    Ok(())
}

/// Normalize allowlist entries for display and storage.
pub fn format_allow_from<S: AsRef<str>>(entries: &[S]) -> Vec<String> {
    entries
        .iter()
        .map(|e| e.as_ref().trim())
        .filter(|e| !e.is_empty())
        .map(str::to_lowercase)
        .collect()
}

/// Group conversation IDs are case-sensitive: trim only.
pub fn format_group_allow_from<S: AsRef<str>>(entries: &[S]) -> Vec<String> {
    entries
        .iter()
        .map(|e| e.as_ref().trim())
        .filter(|e| !e.is_empty())
        .map(str::to_string)
        .collect()
}

/// JSON schema of one account config.
pub fn config_schema() -> Value {
    json!({
        "type": "object",
        "additionalProperties": false,
        "properties": {
            "enabled": { "type": "boolean", "default": true },
            "appKey": { "type": "string", "description": "DingTalk app key (client ID)" },
            "appSecret": { "type": "string", "description": "DingTalk app secret (client secret)" },
            "agentId": { "type": "string" },
            "dmPolicy": {
                "type": "string",
                "enum": ["open", "pairing", "allowlist"],
                "default": "pairing",
            },
            "allowFrom": { "type": "array", "items": { "type": "string" } },
            "groupPolicy": {
                "type": "string",
                "enum": ["open", "allowlist", "disabled"],
                "default": "open",
            },
            "groupAllowFrom": { "type": "array", "items": { "type": "string" } },
            "requireMention": { "type": "boolean", "default": true },
            "historyLimit": { "type": "integer", "minimum": 0, "default": DEFAULT_HISTORY_LIMIT },
            "streamEndpoint": {
                "type": "string",
                "description": format!("Fixed stream URL; normally obtained from the gateway (fallback {DEFAULT_STREAM_ENDPOINT})"),
            },
            "apiBase": { "type": "string", "default": DEFAULT_API_BASE },
            "robotCode": { "type": "string", "description": "Robot code for API sends; defaults to appKey" },
            "heartbeatIntervalMs": { "type": "integer", "minimum": 1000, "default": 30_000 },
            "reconnectIntervalMs": { "type": "integer", "minimum": 100, "default": 5_000 },
            "maxReconnectIntervalMs": { "type": "integer", "minimum": 0, "default": 60_000 },
            "reconnectJitter": { "type": "boolean", "default": true },
            "webhookTtlSecs": { "type": "integer", "minimum": 0, "default": 5_400 },
            "webhookCapacity": { "type": "integer", "minimum": 1, "default": 1_024 },
            "textChunkLimit": { "type": "integer", "minimum": 1, "default": 4_000 },
        },
    })
}

/// Warnings about risky settings, one per affected account.
pub fn collect_warnings(root: &Value) -> Vec<String> {
    let mut warnings = Vec::new();
    for account_id in list_account_ids(root) {
        let Ok(config) = load_account(root, &account_id) else {
            warnings.push(format!(
                "- DingTalk account `{account_id}`: config is invalid and will not start."
            ));
            continue;
        };
        if !config.enabled || config.group_policy != GroupPolicy::Open {
            continue;
        }
        let label = if account_id == DEFAULT_ACCOUNT_ID {
            "DingTalk groups".to_string()
        } else {
            format!("DingTalk account `{account_id}` groups")
        };
        let trigger = if config.require_mention {
            "any member of any group who mentions the bot can trigger it"
        } else {
            "any message in any group the bot is in triggers it"
        };
        warnings.push(format!(
            "- {label}: groupPolicy=\"open\", so {trigger}. Set groupPolicy=\"allowlist\" and list \
             conversation IDs in groupAllowFrom to restrict."
        ));
    }
    warnings
}

pub fn onboarding_steps() -> Vec<OnboardingStep> {
    vec![OnboardingStep {
        id: "credentials",
        title: "DingTalk app credentials",
        fields: vec![
            OnboardingField {
                key: "appKey",
                label: "App key (client ID)",
                kind: OnboardingFieldKind::Text,
                required: true,
            },
            OnboardingField {
                key: "appSecret",
                label: "App secret",
                kind: OnboardingFieldKind::Password,
                required: true,
            },
        ],
    }]
}

/// Write onboarding answers into the default account.
pub fn apply_onboarding(mut root: Value, values: &HashMap<String, String>) -> Result<Value> {
    let mut patch = Map::new();
    for step in onboarding_steps() {
        for field in step.fields {
            let value = values
                .get(field.key)
                .map(|v| v.trim())
                .filter(|v| !v.is_empty());
            match value {
                Some(value) => {
                    patch.insert(field.key.into(), Value::String(value.to_string()));
                },
                None if field.required => {
                    return Err(Error::config(format!("{} is required", field.label)));
                },
                None => {},
            }
        }
    }
    apply_account_config(&mut root, DEFAULT_ACCOUNT_ID, Value::Object(patch))?;
    Ok(root)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn root() -> Value {
        json!({
            "channels": {
                "dingtalk": {
                    "appKey": "ding123",
                    "appSecret": "s3cret",
                    "dmPolicy": "allowlist",
                    "allowFrom": [" Manager4220 ", ""],
                    "groupAllowFrom": [" cidAbC== "],
                    "accounts": {
                        "ops": { "appKey": "dingops", "groupPolicy": "allowlist" },
                    },
                },
            },
        })
    }

    #[test]
    fn lists_default_then_named_accounts() {
        assert_eq!(list_account_ids(&root()), vec!["default", "ops"]);
        assert!(list_account_ids(&json!({})).is_empty());
        let only_named = json!({ "channels": { "dingtalk": { "accounts": { "a": {} } } } });
        assert_eq!(list_account_ids(&only_named), vec!["a"]);
    }

    #[test]
    fn named_accounts_inherit_top_level_fields() {
        let ops = load_account(&root(), "ops").unwrap();
        assert_eq!(ops.app_key, "dingops");
        assert_eq!(ops.group_policy, GroupPolicy::Allowlist);
        assert!(is_configured(&root(), "ops"));
        assert!(account_config_value(&root(), "missing").is_null());
        assert!(!is_configured(&root(), "missing"));
    }

    #[test]
    fn describes_account() {
        let description = describe_account(&root(), "default").unwrap();
        assert!(description.account.configured);
        assert_eq!(description.dm_policy, "allowlist");
        assert_eq!(description.allow_from, vec!["manager4220"]);
        assert_eq!(description.group_allow_from, vec!["cidAbC=="]);
        let value = serde_json::to_value(&description).unwrap();
        assert_eq!(value["accountId"], "default");
        assert_eq!(value["appKey"], "ding123");
    }

    #[test]
    fn enable_and_delete() {
        let mut root = root();
        set_account_enabled(&mut root, "ops", false).unwrap();
        assert_eq!(root["channels"]["dingtalk"]["accounts"]["ops"]["enabled"], false);
        set_account_enabled(&mut root, "default", false).unwrap();
        assert_eq!(root["channels"]["dingtalk"]["enabled"], false);

        assert!(delete_account(&mut root, "ops"));
        assert!(!delete_account(&mut root, "ops"));
        assert!(root["channels"]["dingtalk"].get("accounts").is_none());
        assert!(delete_account(&mut root, "default"));
        assert!(root["channels"].get("dingtalk").is_none());
    }

    #[test]
    fn apply_creates_and_enables() {
        let mut root = Value::Null;
        apply_account_config(&mut root, "default", json!({ "appKey": "k", "appSecret": "s" }))
            .unwrap();
        assert_eq!(root["channels"]["dingtalk"]["enabled"], true);
        assert!(is_configured(&root, "default"));

        apply_account_config(&mut root, "ops", json!({ "dmPolicy": "open" })).unwrap();
        assert_eq!(root["channels"]["dingtalk"]["accounts"]["ops"]["dmPolicy"], "open");

        let err = apply_account_config(&mut root, "ops", json!({ "dmPolicy": "sometimes" }))
            .unwrap_err();
        assert!(matches!(err, Error::Config { .. }));
        assert_eq!(root["channels"]["dingtalk"]["accounts"]["ops"]["dmPolicy"], "open");
    }

    #[test]
    fn warns_about_open_groups_only() {
        let warnings = collect_warnings(&root());
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].starts_with("- DingTalk groups: groupPolicy=\"open\""));
        assert!(warnings[0].contains("mentions the bot"));
    }

    #[test]
    fn onboarding_requires_both_credentials() {
        let mut values = HashMap::new();
        values.insert("appKey".to_string(), " ding123 ".to_string());
        let err = apply_onboarding(Value::Null, &values).unwrap_err();
        assert!(err.to_string().contains("App secret"));

        values.insert("appSecret".to_string(), "s3cret".to_string());
        let root = apply_onboarding(Value::Null, &values).unwrap();
        assert_eq!(root["channels"]["dingtalk"]["appKey"], "ding123");
        assert_eq!(root["channels"]["dingtalk"]["enabled"], true);
    }

    #[test]
    fn schema_is_closed() {
        let schema = config_schema();
        assert_eq!(schema["additionalProperties"], false);
        assert_eq!(schema["properties"]["historyLimit"]["minimum"], 0);
        assert_eq!(schema["properties"]["requireMention"]["default"], true);
    }
}

//! `run`, `status`, `send` and `schema`.

use std::{path::Path, sync::Arc};

use {
    anyhow::{Result, anyhow},
    dingbot_channels::ChannelPlugin,
    dingbot_dingtalk::{
        DingTalkPlugin,
        accounts::{DEFAULT_ACCOUNT_ID, require_credentials},
        auth::TokenCache,
        outbound::{DingTalkSender, MessageBody, SenderParts},
        setup::{
            account_config_value, collect_warnings, config_schema, describe_account,
            list_account_ids, load_account,
        },
        stats::StatsHandle,
        target::ConversationDirectory,
        webhook::SessionWebhookStore,
    },
    serde_json::Value,
    tracing::{info, warn},
};

use crate::console_host::ConsoleHost;

/// Start every selected, enabled account and serve until Ctrl-C.
pub async fn run(
    root: &Value,
    selected: &[String],
    echo: bool,
    history_limit: Option<usize>,
) -> Result<()> {
    let account_ids: Vec<String> = list_account_ids(root)
        .into_iter()
        .filter(|id| selected.is_empty() || selected.contains(id))
        .collect();
    if account_ids.is_empty() {
        anyhow::bail!("no DingTalk account configured, run `dingbot channels setup` first");
    }

    let host = ConsoleHost::new(echo).with_history_limit(history_limit);
    let mut plugin = DingTalkPlugin::new().with_host(Arc::new(host));

    for account_id in &account_ids {
        let config = account_config_value(root, account_id);
        if let Err(e) = plugin.start_account(account_id, config).await {
            warn!(account_id = %account_id, error = %e, "failed to start DingTalk account");
        }
    }

    let running = plugin.account_ids();
    if running.is_empty() {
        anyhow::bail!("no DingTalk account could be started");
    }
    for warning in collect_warnings(root) {
        warn!("{warning}");
    }
    for account_id in &running {
        if let Some(mut status) = plugin.subscribe_status(account_id) {
            let account_id = account_id.clone();
            tokio::spawn(async move {
                while status.changed().await.is_ok() {
                    let current = *status.borrow_and_update();
                    info!(
                        account_id = %account_id,
                        status = current.as_str(),
                        "DingTalk stream status"
                    );
                }
            });
        }
    }
    info!(accounts = ?running, "dingbot running, press Ctrl-C to stop");

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    for account_id in running {
        if let Err(e) = plugin.stop_account(&account_id).await {
            warn!(account_id = %account_id, error = %e, "failed to stop DingTalk account");
        }
    }
    Ok(())
}

pub fn status(root: &Value) -> Result<()> {
    let account_ids = list_account_ids(root);
    if account_ids.is_empty() {
        println!("No DingTalk account configured.");
        return Ok(());
    }
    for account_id in account_ids {
        match describe_account(root, &account_id) {
            Ok(description) => println!("{}", serde_json::to_string_pretty(&description)?),
            Err(e) => println!("{account_id}: {e}"),
        }
    }
    let warnings = collect_warnings(root);
    if !warnings.is_empty() {
        println!();
        println!("Security warnings:");
        for warning in warnings {
            println!("{warning}");
        }
    }
    Ok(())
}

pub struct SendArgs<'a> {
    pub account: &'a str,
    pub to: &'a str,
    pub message: &'a str,
    pub markdown_title: Option<&'a str>,
}

/// One REST send, without opening the stream.
pub async fn send(root: &Value, args: SendArgs<'_>) -> Result<()> {
    let config = load_account(root, args.account)?;
    let credentials = require_credentials(&config)?;
    let http = reqwest::Client::new();
    let sender = DingTalkSender::new(SenderParts {
        http: http.clone(),
        tokens: Arc::new(TokenCache::new(http, config.api_base(), &credentials)),
        webhooks: Arc::new(SessionWebhookStore::new(config.webhook_ttl(), 1)),
        directory: Arc::new(ConversationDirectory::new(1)),
        stats: StatsHandle::new(),
        api_base: config.api_base().to_string(),
        robot_code: config.robot_code().to_string(),
        chunk_limit: config.text_chunk_limit,
    });
    let body = match args.markdown_title {
        Some(title) => MessageBody::Markdown {
            title: title.to_string(),
            text: args.message.to_string(),
        },
        None => MessageBody::Text(args.message.to_string()),
    };
    let route = sender.send(args.to, body).await?;
    println!("Sent to {} via {route:?}.", args.to);
    Ok(())
}

pub fn schema() -> Result<()> {
    println!("{}", serde_json::to_string_pretty(&config_schema())?);
    Ok(())
}

/// Account to use when none is given: `default` if present, else the only one.
pub fn pick_account(root: &Value, requested: Option<String>) -> Result<String> {
    if let Some(account) = requested {
        return Ok(account);
    }
    let ids = list_account_ids(root);
    if ids.iter().any(|id| id == DEFAULT_ACCOUNT_ID) {
        return Ok(DEFAULT_ACCOUNT_ID.to_string());
    }
    match ids.as_slice() {
        [only] => Ok(only.clone()),
        [] => Err(anyhow!("no DingTalk account configured")),
        _ => Err(anyhow!(
            "several DingTalk accounts configured, pick one with --account: {}",
            ids.join(", ")
        )),
    }
}

/// Read a config file for commands that don't edit it.
pub fn load_root(path: Option<&Path>) -> Result<Value> {
    match path {
        Some(path) => Ok(dingbot_config::load_config_value(path)?),
        None => Ok(dingbot_config::discover_and_load()?.1),
    }
}

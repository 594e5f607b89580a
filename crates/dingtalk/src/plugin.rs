use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
    time::{Duration, Instant, UNIX_EPOCH},
};

use {
    anyhow::Result,
    async_trait::async_trait,
    dingbot_channels::{
        AccountSnapshot, ChannelCapabilities, ChannelHealthSnapshot, ChannelHost, ChannelMeta,
        ChannelOnboarding, ChannelOutbound, ChannelPairing, ChannelPlugin, ChannelSecurity,
        ChannelStatus, ChatType, Error as ChannelError, OnboardingStep, PAIRING_APPROVED_MESSAGE,
        ToolPolicy,
    },
    tokio_util::sync::CancellationToken,
    tracing::{info, warn},
};

use crate::{
    CHANNEL_ID,
    access::normalize_allow_entry,
    accounts::require_credentials,
    auth::TokenCache,
    config::DingTalkAccountConfig,
    dispatch::{InboundProcessor, ProcessorParts},
    outbound::{DingTalkSender, MessageBody, SenderParts},
    setup,
    state::{AccountState, AccountStateMap},
    stats::{ConnectionStatus, StatsHandle},
    stream::{StreamClient, StreamParts, StreamSettings},
    target::ConversationDirectory,
    webhook::SessionWebhookStore,
};

/// Cache TTL for probe results.
const PROBE_CACHE_TTL: Duration = Duration::from_secs(30);

/// DingTalk Stream-mode channel plugin.
pub struct DingTalkPlugin {
    accounts: AccountStateMap,
    outbound: DingTalkOutbound,
    host: Option<Arc<dyn ChannelHost>>,
    http: reqwest::Client,
    probe_cache: RwLock<HashMap<String, (ChannelHealthSnapshot, Instant)>>,
}

impl DingTalkPlugin {
    pub fn new() -> Self {
        let accounts: AccountStateMap = Arc::new(RwLock::new(HashMap::new()));
        let outbound = DingTalkOutbound {
            accounts: Arc::clone(&accounts),
        };
        Self {
            accounts,
            outbound,
            host: None,
            http: reqwest::Client::new(),
            probe_cache: RwLock::new(HashMap::new()),
        }
    }

    pub fn with_host(mut self, host: Arc<dyn ChannelHost>) -> Self {
        self.host = Some(host);
        self
    }

    /// List all active account IDs.
    pub fn account_ids(&self) -> Vec<String> {
        let accounts = self.accounts.read().unwrap_or_else(|e| e.into_inner());
        accounts.keys().cloned().collect()
    }

    pub fn has_account(&self, account_id: &str) -> bool {
        let accounts = self.accounts.read().unwrap_or_else(|e| e.into_inner());
        accounts.contains_key(account_id)
    }

    /// Watch the connection status of a running account.
    pub fn subscribe_status(
        &self,
        account_id: &str,
    ) -> Option<tokio::sync::watch::Receiver<ConnectionStatus>> {
        let accounts = self.accounts.read().unwrap_or_else(|e| e.into_inner());
        accounts.get(account_id).map(|s| s.stats.subscribe())
    }
}

impl Default for DingTalkPlugin {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ChannelPlugin for DingTalkPlugin {
    fn id(&self) -> &str {
        CHANNEL_ID
    }

    fn name(&self) -> &str {
        "DingTalk"
    }

    fn meta(&self) -> ChannelMeta {
        ChannelMeta {
            id: CHANNEL_ID,
            label: "DingTalk",
            selection_label: "DingTalk (钉钉)",
            docs_path: "/channels/dingtalk",
            blurb: "DingTalk enterprise bots over Stream mode, no public webhook required.",
            order: 80,
        }
    }

    fn capabilities(&self) -> ChannelCapabilities {
        ChannelCapabilities {
            chat_types: vec![ChatType::Direct, ChatType::Group],
            media: true,
            reply: true,
            ..Default::default()
        }
    }

    fn config_schema(&self) -> serde_json::Value {
        setup::config_schema()
    }

    async fn start_account(&mut self, account_id: &str, config: serde_json::Value) -> Result<()> {
        let config = DingTalkAccountConfig::from_value(config)?;
        if !config.enabled {
            info!(account_id, "DingTalk account disabled, not starting");
            return Ok(());
        }
        let credentials = require_credentials(&config)?;
        let host = self.host.clone().ok_or(ChannelError::HostMissing)?;

        if self.has_account(account_id) {
            self.stop_account(account_id).await?;
        }
        info!(account_id, app_key = %credentials.app_key, "starting DingTalk account");

        let config = Arc::new(config);
        let stats = StatsHandle::new();
        let tokens = Arc::new(TokenCache::new(
            self.http.clone(),
            config.api_base(),
            &credentials,
        ));
        let webhooks = Arc::new(SessionWebhookStore::new(
            config.webhook_ttl(),
            config.webhook_capacity,
        ));
        let directory = Arc::new(ConversationDirectory::new(config.webhook_capacity));
        let sender = Arc::new(DingTalkSender::new(SenderParts {
            http: self.http.clone(),
            tokens: Arc::clone(&tokens),
            webhooks: Arc::clone(&webhooks),
            directory: Arc::clone(&directory),
            stats: stats.clone(),
            api_base: config.api_base().to_string(),
            robot_code: config.robot_code().to_string(),
            chunk_limit: config.text_chunk_limit,
        }));
        let processor = InboundProcessor::new(ProcessorParts {
            account_id: account_id.to_string(),
            config: Arc::clone(&config),
            host,
            webhooks,
            directory,
            sender: Arc::clone(&sender),
        });
        let app_key = credentials.app_key.clone();
        let client = StreamClient::new(StreamParts {
            account_id: account_id.to_string(),
            settings: StreamSettings::from_config(&config),
            credentials,
            http: self.http.clone(),
            tokens: Arc::clone(&tokens),
            handler: Arc::new(processor),
            stats: stats.clone(),
        });

        client.start().await?;

        let cancel = CancellationToken::new();
        let task = tokio::spawn({
            let client = client.clone();
            let cancel = cancel.clone();
            async move { client.serve(cancel).await }
        });

        let mut accounts = self.accounts.write().unwrap_or_else(|e| e.into_inner());
        accounts.insert(account_id.to_string(), AccountState {
            account_id: account_id.to_string(),
            config,
            app_key,
            tokens,
            stats,
            client,
            sender,
            cancel,
            task: Some(task),
        });
        Ok(())
    }

    async fn stop_account(&mut self, account_id: &str) -> Result<()> {
        let state = {
            let mut accounts = self.accounts.write().unwrap_or_else(|e| e.into_inner());
            accounts.remove(account_id)
        };
        let Some(mut state) = state else {
            warn!(account_id, "DingTalk account not found");
            return Ok(());
        };

        info!(account_id, "stopping DingTalk account");
        state.cancel.cancel();
        if let Some(task) = state.task.take()
            && let Err(e) = task.await
        {
            warn!(account_id, error = %e, "DingTalk account task did not shut down cleanly");
        }
        if let Ok(mut cache) = self.probe_cache.write() {
            cache.remove(account_id);
        }
        info!(account_id, "DingTalk account stopped");
        Ok(())
    }

    fn outbound(&self) -> Option<&dyn ChannelOutbound> {
        Some(&self.outbound)
    }

    fn status(&self) -> Option<&dyn ChannelStatus> {
        Some(self)
    }

    fn pairing(&self) -> Option<&dyn ChannelPairing> {
        Some(self)
    }

    fn security(&self) -> Option<&dyn ChannelSecurity> {
        Some(self)
    }

    fn onboarding(&self) -> Option<&dyn ChannelOnboarding> {
        Some(self)
    }

    fn message_tool_hints(&self) -> Vec<String> {
        vec!["- DingTalk targeting: omit `target` to reply to the current conversation.".into()]
    }

    fn group_tool_policy(&self, _account_id: &str, _group_id: &str) -> ToolPolicy {
        ToolPolicy::allowed()
    }

    fn reload_config_prefixes(&self) -> Vec<String> {
        vec![format!("channels.{CHANNEL_ID}")]
    }
}

#[async_trait]
impl ChannelStatus for DingTalkPlugin {
    async fn probe(&self, account_id: &str) -> Result<ChannelHealthSnapshot> {
        if let Ok(cache) = self.probe_cache.read()
            && let Some((snap, ts)) = cache.get(account_id)
            && ts.elapsed() < PROBE_CACHE_TTL
        {
            return Ok(snap.clone());
        }

        let running = {
            let accounts = self.accounts.read().unwrap_or_else(|e| e.into_inner());
            accounts
                .get(account_id)
                .map(|s| (Arc::clone(&s.tokens), s.stats.status(), s.app_key.clone()))
        };

        let result = match running {
            Some((tokens, status, app_key)) => match tokens.get_access_token().await {
                Ok(_) => ChannelHealthSnapshot {
                    connected: status == ConnectionStatus::Connected,
                    account_id: account_id.to_string(),
                    details: Some(format!("App key: {app_key}, stream {}", status.as_str())),
                },
                Err(e) => ChannelHealthSnapshot {
                    connected: false,
                    account_id: account_id.to_string(),
                    details: Some(format!("token exchange failed: {e}")),
                },
            },
            None => ChannelHealthSnapshot {
                connected: false,
                account_id: account_id.to_string(),
                details: Some("account not started".into()),
            },
        };

        if let Ok(mut cache) = self.probe_cache.write() {
            cache.insert(account_id.to_string(), (result.clone(), Instant::now()));
        }
        Ok(result)
    }

    fn snapshot(&self, account_id: &str) -> Option<AccountSnapshot> {
        let accounts = self.accounts.read().unwrap_or_else(|e| e.into_inner());
        let state = accounts.get(account_id)?;
        let stats = state.stats.snapshot();
        Some(AccountSnapshot {
            account_id: state.account_id.clone(),
            enabled: state.config.enabled,
            configured: true,
            running: state.is_running(),
            connected: stats.status == ConnectionStatus::Connected,
            status: stats.status.as_str().to_string(),
            connected_at: stats
                .connected_at
                .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
                .map(|d| d.as_secs()),
            last_error: stats.last_error,
            reconnect_count: stats.reconnect_count,
            messages_received: stats.messages_received,
            messages_sent: stats.messages_sent,
        })
    }
}

#[async_trait]
impl ChannelPairing for DingTalkPlugin {
    fn id_label(&self) -> &str {
        "dingtalkUserId"
    }

    fn normalize_allow_entry(&self, entry: &str) -> String {
        normalize_allow_entry(entry)
    }

    async fn notify_approval(&self, account_id: &str, id: &str) -> Result<()> {
        let user_id = normalize_allow_entry(id);
        self.outbound
            .send_text(account_id, &format!("user:{user_id}"), PAIRING_APPROVED_MESSAGE)
            .await
    }
}

impl ChannelSecurity for DingTalkPlugin {
    fn collect_warnings(&self, config: &serde_json::Value) -> Vec<String> {
        setup::collect_warnings(config)
    }
}

impl ChannelOnboarding for DingTalkPlugin {
    fn steps(&self) -> Vec<OnboardingStep> {
        setup::onboarding_steps()
    }

    fn apply(
        &self,
        config: serde_json::Value,
        values: &HashMap<String, String>,
    ) -> Result<serde_json::Value> {
        Ok(setup::apply_onboarding(config, values)?)
    }
}

/// Outbound adapter over the running accounts.
pub struct DingTalkOutbound {
    pub(crate) accounts: AccountStateMap,
}

impl DingTalkOutbound {
    fn sender(&self, account_id: &str) -> Result<Arc<DingTalkSender>> {
        let accounts = self.accounts.read().unwrap_or_else(|e| e.into_inner());
        let state = accounts
            .get(account_id)
            .ok_or_else(|| ChannelError::unknown_account(account_id))?;
        if !state.is_running() {
            return Err(ChannelError::not_running(account_id).into());
        }
        Ok(Arc::clone(&state.sender))
    }
}

#[async_trait]
impl ChannelOutbound for DingTalkOutbound {
    async fn send_text(&self, account_id: &str, to: &str, text: &str) -> Result<()> {
        let sender = self.sender(account_id)?;
        sender.send(to, MessageBody::Text(text.to_string())).await?;
        Ok(())
    }

    async fn send_markdown(
        &self,
        account_id: &str,
        to: &str,
        title: &str,
        text: &str,
    ) -> Result<()> {
        let sender = self.sender(account_id)?;
        sender
            .send(to, MessageBody::Markdown {
                title: title.to_string(),
                text: text.to_string(),
            })
            .await?;
        Ok(())
    }

    async fn send_card(&self, account_id: &str, to: &str, card: &serde_json::Value) -> Result<()> {
        let sender = self.sender(account_id)?;
        sender.send(to, MessageBody::Card(card.clone())).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::error::Error,
        dingbot_channels::{
            AgentRoute, DispatchOutcome, EnvelopeParams, InboundContext, ReplyDispatcher,
            RouteRequest, SystemEventOptions,
        },
        futures::{SinkExt, StreamExt},
        tokio::net::TcpListener,
        tokio_tungstenite::{accept_async, tungstenite::Message},
    };

    struct NullHost;

    #[async_trait]
    impl ChannelHost for NullHost {
        fn resolve_agent_route(&self, request: &RouteRequest) -> Result<AgentRoute> {
            Ok(AgentRoute {
                agent_id: "main".into(),
                session_key: format!("agent:main:dingtalk:{}", request.peer.id),
                account_id: request.account_id.clone(),
            })
        }

        fn enqueue_system_event(&self, _text: &str, _options: SystemEventOptions) {}

        fn format_agent_envelope(&self, params: &EnvelopeParams) -> String {
            params.body.clone()
        }

        fn finalize_inbound_context(&self, context: InboundContext) -> InboundContext {
            context
        }

        async fn dispatch_reply_from_config(
            &self,
            _context: InboundContext,
            _dispatcher: Arc<dyn ReplyDispatcher>,
        ) -> Result<DispatchOutcome> {
            Ok(DispatchOutcome::default())
        }
    }

    fn plugin() -> DingTalkPlugin {
        DingTalkPlugin::new().with_host(Arc::new(NullHost))
    }

    #[test]
    fn describes_itself() {
        let plugin = plugin();
        assert_eq!(plugin.id(), "dingtalk");
        let meta = plugin.meta();
        assert_eq!(meta.selection_label, "DingTalk (钉钉)");
        assert_eq!(meta.order, 80);
        let caps = plugin.capabilities();
        assert_eq!(caps.chat_types, vec![ChatType::Direct, ChatType::Group]);
        assert!(caps.media && caps.reply);
        assert!(!caps.polls && !caps.threads && !caps.reactions && !caps.edit);
        assert_eq!(plugin.pairing().unwrap().id_label(), "dingtalkUserId");
        assert_eq!(
            plugin
                .pairing()
                .unwrap()
                .normalize_allow_entry(" DingTalk:manager4220 "),
            "manager4220"
        );
        assert!(plugin.message_tool_hints()[0].contains("omit `target`"));
        assert!(plugin.group_tool_policy("default", "cidGroup==").allowed);
        assert_eq!(plugin.reload_config_prefixes(), vec!["channels.dingtalk"]);
    }

    #[tokio::test]
    async fn missing_credentials_fail_start() {
        let mut plugin = plugin();
        let err = plugin
            .start_account("default", serde_json::json!({ "appKey": "ding123" }))
            .await
            .unwrap_err();
        assert!(matches!(err.downcast_ref::<Error>(), Some(Error::Config { .. })));
        assert!(!plugin.has_account("default"));
    }

    #[tokio::test]
    async fn start_requires_a_host() {
        let mut plugin = DingTalkPlugin::new();
        let err = plugin
            .start_account(
                "default",
                serde_json::json!({ "appKey": "k", "appSecret": "s" }),
            )
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ChannelError>(),
            Some(ChannelError::HostMissing)
        ));
    }

    #[tokio::test]
    async fn disabled_account_is_not_started() {
        let mut plugin = plugin();
        plugin
            .start_account("default", serde_json::json!({ "enabled": false }))
            .await
            .unwrap();
        assert!(plugin.account_ids().is_empty());
        assert!(plugin.status().unwrap().snapshot("default").is_none());
    }

    #[tokio::test]
    async fn outbound_to_unknown_account_fails() {
        let plugin = plugin();
        let err = plugin
            .outbound()
            .unwrap()
            .send_text("nope", "user:u1", "hi")
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ChannelError>(),
            Some(ChannelError::UnknownAccount { .. })
        ));
        let probe = plugin.status().unwrap().probe("nope").await.unwrap();
        assert!(!probe.connected);
    }

    #[tokio::test]
    async fn account_lifecycle() {
        let mut server = mockito::Server::new_async().await;
        let _token = server
            .mock("POST", "/v1.0/oauth2/accessToken")
            .with_body(r#"{"accessToken":"tok","expireIn":7200}"#)
            .create_async()
            .await;
        let approval = server
            .mock("POST", "/v1.0/robot/oToMessages/batchSend")
            .match_body(mockito::Matcher::PartialJson(serde_json::json!({
                "robotCode": "ding123",
                "userIds": ["u9"],
                "msgKey": "sampleText",
            })))
            .with_body("{}")
            .expect(1)
            .create_async()
            .await;

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let endpoint = format!("ws://{}", listener.local_addr().unwrap());
        let (closed_tx, closed_rx) = tokio::sync::oneshot::channel();
        tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(tcp).await.unwrap();
            while let Some(Ok(msg)) = ws.next().await {
                if matches!(msg, Message::Close(_)) {
                    let _ = ws.send(Message::Close(None)).await;
                    break;
                }
            }
            let _ = closed_tx.send(());
        });

        let mut plugin = plugin();
        plugin
            .start_account(
                "default",
                serde_json::json!({
                    "appKey": "ding123",
                    "appSecret": "s3cret",
                    "apiBase": server.url(),
                    "streamEndpoint": endpoint,
                }),
            )
            .await
            .unwrap();

        let snapshot = plugin.status().unwrap().snapshot("default").unwrap();
        assert!(snapshot.running);
        assert!(snapshot.connected);
        assert_eq!(snapshot.status, "connected");
        assert!(snapshot.connected_at.is_some());

        let probe = plugin.status().unwrap().probe("default").await.unwrap();
        assert!(probe.connected);
        assert!(probe.details.unwrap().contains("ding123"));

        plugin
            .pairing()
            .unwrap()
            .notify_approval("default", "dingtalk:u9")
            .await
            .unwrap();
        approval.assert_async().await;
        assert_eq!(
            plugin
                .status()
                .unwrap()
                .snapshot("default")
                .unwrap()
                .messages_sent,
            1
        );

        plugin.stop_account("default").await.unwrap();
        assert!(plugin.status().unwrap().snapshot("default").is_none());
        tokio::time::timeout(Duration::from_secs(5), closed_rx)
            .await
            .unwrap()
            .unwrap();
    }

    #[test]
    fn onboarding_writes_credentials() {
        let plugin = plugin();
        let onboarding = plugin.onboarding().unwrap();
        assert_eq!(onboarding.steps()[0].fields.len(), 2);
        let values = HashMap::from([
            ("appKey".to_string(), "ding123".to_string()),
            ("appSecret".to_string(), "s3cret".to_string()),
        ]);
        let config = onboarding.apply(serde_json::Value::Null, &values).unwrap();
        assert_eq!(config["channels"]["dingtalk"]["appSecret"], "s3cret");
        assert!(
            plugin
                .security()
                .unwrap()
                .collect_warnings(&config)
                .iter()
                .any(|w| w.contains("groupPolicy=\"open\""))
        );
    }
}

use std::{
    sync::Arc,
    time::{SystemTime, UNIX_EPOCH},
};

use {
    async_trait::async_trait,
    dingbot_channels::{
        ChannelHost, EnvelopeParams, InboundContext, PeerKind, ReplyDispatcher, RoutePeer,
        RouteRequest, SystemEventOptions,
    },
    tracing::{debug, error, info},
};

use crate::{
    CHANNEL_ID,
    access::{AccessDenied, check_access},
    config::DingTalkAccountConfig,
    error::{Error, Result},
    event::{InboundEvent, MessageContext, translate},
    frame::StreamFrame,
    history::{ChatHistories, HistoryEntry, build_pending_context},
    outbound::DingTalkSender,
    reply::DingTalkReplyDispatcher,
    stream::FrameHandler,
    target::{ConversationDirectory, ReplyTarget},
    webhook::SessionWebhookStore,
};

/// Channel label shown to the agent in envelopes.
const ENVELOPE_CHANNEL: &str = "DingTalk";

const PREVIEW_CHARS: usize = 160;

/// Turns inbound bot callbacks into agent dispatches.
#[derive(Clone)]
pub struct InboundProcessor {
    account_id: String,
    config: Arc<DingTalkAccountConfig>,
    host: Arc<dyn ChannelHost>,
    webhooks: Arc<SessionWebhookStore>,
    directory: Arc<ConversationDirectory>,
    histories: Arc<ChatHistories>,
    sender: Arc<DingTalkSender>,
}

pub struct ProcessorParts {
    pub account_id: String,
    pub config: Arc<DingTalkAccountConfig>,
    pub host: Arc<dyn ChannelHost>,
    pub webhooks: Arc<SessionWebhookStore>,
    pub directory: Arc<ConversationDirectory>,
    pub sender: Arc<DingTalkSender>,
}

impl InboundProcessor {
    pub fn new(parts: ProcessorParts) -> Self {
        Self {
            account_id: parts.account_id,
            config: parts.config,
            host: parts.host,
            webhooks: parts.webhooks,
            directory: parts.directory,
            histories: Arc::new(ChatHistories::default()),
            sender: parts.sender,
        }
    }

    fn history_limit(&self) -> usize {
        self.config.history_limit(self.host.group_history_limit())
    }

    /// Capture reply routing from an event and apply the access policy.
    ///
    /// Returns the message when it should reach the agent. Group messages
    /// held back only by the mention gate are kept as history.
    pub fn admit(&self, event: &InboundEvent, header_message_id: &str) -> Option<MessageContext> {
        if let Some(url) = event.session_webhook.as_deref() {
            self.webhooks
                .store_until(&event.conversation_id, url, event.webhook_expiry());
        }

        let ctx = translate(event, header_message_id);
        self.directory.record(&ReplyTarget::from_context(&ctx));

        if ctx.content.is_empty() {
            debug!(
                account_id = %self.account_id,
                chat_id = %ctx.chat_id,
                message_id = %ctx.message_id,
                msgtype = %ctx.content_type,
                "ignoring DingTalk message without text"
            );
            return None;
        }

        let denied = match check_access(&self.config, &ctx) {
            Ok(()) => return Some(ctx),
            Err(denied) => denied,
        };
        debug!(
            account_id = %self.account_id,
            chat_id = %ctx.chat_id,
            sender_id = %ctx.sender_id,
            reason = %denied,
            "DingTalk message rejected"
        );

        if denied == AccessDenied::NotMentioned {
            let mentioned = MessageContext {
                mentioned_bot: true,
                ..ctx.clone()
            };
            if check_access(&self.config, &mentioned).is_ok() {
                self.histories.record(
                    &ctx.chat_id,
                    HistoryEntry {
                        sender: ctx.sender_label().to_string(),
                        body: ctx.content.clone(),
                        timestamp_ms: timestamp_or_now(ctx.timestamp_ms),
                        message_id: ctx.message_id.clone(),
                    },
                    self.history_limit(),
                );
            }
        }
        None
    }

    /// Route one admitted message to the agent and deliver its replies.
    pub async fn dispatch(&self, ctx: MessageContext) -> Result<()> {
        let is_group = ctx.is_group();
        let peer = if is_group {
            RoutePeer {
                kind: PeerKind::Group,
                id: ctx.chat_id.clone(),
            }
        } else {
            RoutePeer {
                kind: PeerKind::Dm,
                id: ctx.sender_id.clone(),
            }
        };
        let route = self
            .host
            .resolve_agent_route(&RouteRequest {
                channel: CHANNEL_ID.into(),
                account_id: self.account_id.clone(),
                peer,
            })
            .map_err(|e| Error::dispatch(format!("route resolution failed: {e:#}")))?;

        let (from, to) = if is_group {
            (
                format!("dingtalk:group:{}", ctx.chat_id),
                format!("chat:{}", ctx.chat_id),
            )
        } else {
            (
                format!("dingtalk:{}", ctx.sender_id),
                format!("user:{}", ctx.sender_id),
            )
        };
        let group_label = ctx.chat_title.clone().unwrap_or_else(|| ctx.chat_id.clone());

        let preview = preview(&ctx.content);
        let event_text = if is_group {
            format!("DingTalk message in group {group_label}: {preview}")
        } else {
            format!("DingTalk DM from {}: {preview}", ctx.sender_label())
        };
        self.host.enqueue_system_event(&event_text, SystemEventOptions {
            session_key: route.session_key.clone(),
            context_key: format!("dingtalk:message:{}:{}", ctx.chat_id, ctx.message_id),
        });

        let timestamp_ms = timestamp_or_now(ctx.timestamp_ms);
        let envelope_from = if is_group {
            format!("{group_label} - {}", ctx.sender_label())
        } else {
            ctx.sender_label().to_string()
        };
        let mut body = self.host.format_agent_envelope(&EnvelopeParams {
            channel: ENVELOPE_CHANNEL.into(),
            from: envelope_from,
            timestamp_ms,
            body: ctx.content.clone(),
        });
        if is_group {
            let pending = self.histories.take(&ctx.chat_id, self.history_limit());
            body = build_pending_context(&pending, &body, |entry| {
                self.host.format_agent_envelope(&EnvelopeParams {
                    channel: ENVELOPE_CHANNEL.into(),
                    from: format!("{group_label} - {}", entry.sender),
                    timestamp_ms: entry.timestamp_ms,
                    body: entry.body.clone(),
                })
            });
        }

        let context = self.host.finalize_inbound_context(InboundContext {
            body,
            raw_body: ctx.content.clone(),
            command_body: ctx.content.clone(),
            from,
            to: to.clone(),
            session_key: route.session_key,
            account_id: route.account_id,
            chat_type: ctx.chat_type,
            group_subject: is_group.then(|| group_label.clone()),
            sender_name: ctx.sender_label().to_string(),
            sender_id: ctx.sender_id.clone(),
            provider: CHANNEL_ID.into(),
            surface: CHANNEL_ID.into(),
            message_sid: ctx.message_id.clone(),
            timestamp: timestamp_ms,
            was_mentioned: ctx.mentioned_bot,
            command_authorized: true,
            originating_channel: CHANNEL_ID.into(),
            originating_to: to,
        });

        info!(
            account_id = %self.account_id,
            chat_id = %ctx.chat_id,
            message_id = %ctx.message_id,
            agent_id = %route.agent_id,
            "dispatching DingTalk message"
        );
        let dispatcher = Arc::new(DingTalkReplyDispatcher::new(
            Arc::clone(&self.sender),
            ReplyTarget::from_context(&ctx),
        ));
        let outcome = self
            .host
            .dispatch_reply_from_config(
                context,
                Arc::clone(&dispatcher) as Arc<dyn ReplyDispatcher>,
            )
            .await
            .map_err(|e| Error::dispatch(format!("{e:#}")))?;
        dispatcher.wait_for_idle().await;
        debug!(
            account_id = %self.account_id,
            chat_id = %ctx.chat_id,
            queued_final = outcome.queued_final,
            "DingTalk dispatch finished"
        );
        Ok(())
    }
}

#[async_trait]
impl FrameHandler for InboundProcessor {
    async fn handle_callback(&self, frame: &StreamFrame) -> Result<()> {
        if !frame.is_bot_message() {
            debug!(
                account_id = %self.account_id,
                topic = frame.topic(),
                "ignoring DingTalk callback"
            );
            return Ok(());
        }
        let event = InboundEvent::parse(&frame.data)?;
        let Some(ctx) = self.admit(&event, frame.message_id()) else {
            return Ok(());
        };

        // The agent round-trip outlives the ack.
        let processor = self.clone();
        tokio::spawn(async move {
            let chat_id = ctx.chat_id.clone();
            let message_id = ctx.message_id.clone();
            if let Err(e) = processor.dispatch(ctx).await {
                error!(
                    account_id = %processor.account_id,
                    chat_id,
                    message_id,
                    error = %e,
                    "DingTalk message lost"
                );
            }
        });
        Ok(())
    }
}

fn preview(text: &str) -> String {
    let collapsed = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.chars().count() <= PREVIEW_CHARS {
        return collapsed;
    }
    let mut cut: String = collapsed.chars().take(PREVIEW_CHARS).collect();
    cut.push('…');
    cut
}

fn timestamp_or_now(timestamp_ms: i64) -> i64 {
    if timestamp_ms > 0 {
        return timestamp_ms;
    }
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_millis() as i64)
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::{
            accounts::DingTalkCredentials, auth::TokenCache, frame::FrameType,
            history::HISTORY_CONTEXT_MARKER, outbound::SenderParts, stats::StatsHandle,
        },
        dingbot_channels::{AgentRoute, ChatType, DispatchOutcome, ReplyPayload},
        secrecy::Secret,
        std::{sync::Mutex, time::Duration},
    };

    #[derive(Default)]
    struct RecordingHost {
        routes: Mutex<Vec<RouteRequest>>,
        events: Mutex<Vec<(String, SystemEventOptions)>>,
        contexts: Mutex<Vec<InboundContext>>,
        reply: Option<&'static str>,
    }

    #[async_trait]
    impl ChannelHost for RecordingHost {
        fn resolve_agent_route(&self, request: &RouteRequest) -> anyhow::Result<AgentRoute> {
            self.routes.lock().unwrap().push(request.clone());
            let kind = match request.peer.kind {
                PeerKind::Dm => "dm",
                PeerKind::Group => "group",
            };
            Ok(AgentRoute {
                agent_id: "main".into(),
                session_key: format!("agent:main:dingtalk:{kind}:{}", request.peer.id),
                account_id: request.account_id.clone(),
            })
        }

        fn enqueue_system_event(&self, text: &str, options: SystemEventOptions) {
            self.events.lock().unwrap().push((text.to_string(), options));
        }

        fn format_agent_envelope(&self, params: &EnvelopeParams) -> String {
            format!("[{}] {}: {}", params.channel, params.from, params.body)
        }

        fn finalize_inbound_context(&self, context: InboundContext) -> InboundContext {
            context
        }

        async fn dispatch_reply_from_config(
            &self,
            context: InboundContext,
            dispatcher: Arc<dyn ReplyDispatcher>,
        ) -> anyhow::Result<DispatchOutcome> {
            self.contexts.lock().unwrap().push(context);
            let queued_final = self
                .reply
                .is_some_and(|text| dispatcher.send_final_reply(ReplyPayload::text(text)));
            Ok(DispatchOutcome {
                queued_final,
                counts: dispatcher.queued_counts(),
            })
        }
    }

    struct Fixture {
        server: mockito::ServerGuard,
        host: Arc<RecordingHost>,
        processor: InboundProcessor,
        webhooks: Arc<SessionWebhookStore>,
    }

    async fn fixture(config: serde_json::Value, reply: Option<&'static str>) -> Fixture {
        let server = mockito::Server::new_async().await;
        let config = DingTalkAccountConfig::from_value(config).unwrap();
        let http = reqwest::Client::new();
        let credentials = DingTalkCredentials {
            app_key: "key".into(),
            app_secret: Secret::new("secret".into()),
            agent_id: None,
        };
        let webhooks = Arc::new(SessionWebhookStore::new(Duration::from_secs(600), 16));
        let directory = Arc::new(ConversationDirectory::new(16));
        let sender = Arc::new(DingTalkSender::new(SenderParts {
            http: http.clone(),
            tokens: Arc::new(TokenCache::new(http, &server.url(), &credentials)),
            webhooks: Arc::clone(&webhooks),
            directory: Arc::clone(&directory),
            stats: StatsHandle::new(),
            api_base: server.url(),
            robot_code: "key".into(),
            chunk_limit: 4000,
        }));
        let host = Arc::new(RecordingHost {
            reply,
            ..Default::default()
        });
        let processor = InboundProcessor::new(ProcessorParts {
            account_id: "default".into(),
            config: Arc::new(config),
            host: Arc::clone(&host) as Arc<dyn ChannelHost>,
            webhooks: Arc::clone(&webhooks),
            directory,
            sender,
        });
        Fixture {
            server,
            host,
            processor,
            webhooks,
        }
    }

    fn dm_event(webhook: Option<String>) -> InboundEvent {
        let mut event = serde_json::json!({
            "conversationId": "cidDm==",
            "conversationType": "1",
            "senderStaffId": "u1",
            "senderId": "$:LWCP_v1:$u1",
            "senderNick": "Alice",
            "chatbotUserId": "$:LWCP_v1:$bot",
            "msgId": "m1",
            "msgtype": "text",
            "text": { "content": "hello" },
        });
        if let Some(url) = webhook {
            event["sessionWebhook"] = url.into();
        }
        InboundEvent::parse(&event.to_string()).unwrap()
    }

    fn group_event(msg_id: &str, text: &str, mentioned: bool) -> InboundEvent {
        InboundEvent::parse(
            &serde_json::json!({
                "conversationId": "cidGroup==",
                "conversationType": "2",
                "conversationTitle": "Ops",
                "senderStaffId": "u2",
                "senderNick": "Bob",
                "chatbotUserId": "$:LWCP_v1:$bot",
                "isInAtList": mentioned,
                "msgId": msg_id,
                "createAt": 1_700_000_000_000_i64,
                "msgtype": "text",
                "text": { "content": text },
            })
            .to_string(),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn open_dm_is_routed_and_answered_via_webhook() {
        let mut f = fixture(serde_json::json!({ "dmPolicy": "open" }), Some("hi")).await;
        let hook = f
            .server
            .mock("POST", "/hook")
            .match_body(mockito::Matcher::PartialJson(serde_json::json!({
                "msgtype": "text",
                "text": { "content": "hi" },
            })))
            .with_body(r#"{"errcode":0,"errmsg":"ok"}"#)
            .expect(1)
            .create_async()
            .await;

        let event = dm_event(Some(format!("{}/hook", f.server.url())));
        let ctx = f.processor.admit(&event, "hdr-1").unwrap();
        assert_eq!(f.webhooks.len(), 1);
        f.processor.dispatch(ctx).await.unwrap();

        let routes = f.host.routes.lock().unwrap().clone();
        assert_eq!(routes.len(), 1);
        assert_eq!(routes[0].channel, "dingtalk");
        assert_eq!(routes[0].peer, RoutePeer {
            kind: PeerKind::Dm,
            id: "u1".into(),
        });

        let contexts = f.host.contexts.lock().unwrap().clone();
        let context = &contexts[0];
        assert_eq!(context.from, "dingtalk:u1");
        assert_eq!(context.to, "user:u1");
        assert_eq!(context.chat_type, ChatType::Direct);
        assert_eq!(context.raw_body, "hello");
        assert_eq!(context.body, "[DingTalk] Alice: hello");
        assert_eq!(context.session_key, "agent:main:dingtalk:dm:u1");
        assert!(context.command_authorized);

        let events = f.host.events.lock().unwrap().clone();
        assert_eq!(events[0].0, "DingTalk DM from Alice: hello");
        assert_eq!(events[0].1.context_key, "dingtalk:message:cidDm==:m1");
        hook.assert_async().await;
    }

    #[tokio::test]
    async fn dm_without_webhook_replies_through_the_api() {
        let mut f = fixture(serde_json::json!({ "dmPolicy": "open" }), Some("hi")).await;
        let token = f
            .server
            .mock("POST", "/v1.0/oauth2/accessToken")
            .with_body(r#"{"accessToken":"tok","expireIn":7200}"#)
            .expect(1)
            .create_async()
            .await;
        let api = f
            .server
            .mock("POST", "/v1.0/robot/oToMessages/batchSend")
            .match_header("x-acs-dingtalk-access-token", "tok")
            .match_body(mockito::Matcher::PartialJson(serde_json::json!({
                "robotCode": "key",
                "userIds": ["u1"],
                "msgKey": "sampleText",
            })))
            .with_body(r#"{"processQueryKey":"q"}"#)
            .expect(1)
            .create_async()
            .await;

        let ctx = f.processor.admit(&dm_event(None), "hdr-1").unwrap();
        f.processor.dispatch(ctx).await.unwrap();
        token.assert_async().await;
        api.assert_async().await;
    }

    #[tokio::test]
    async fn unmentioned_group_message_is_acked_but_not_dispatched() {
        let mut f = fixture(serde_json::Value::Null, Some("hi")).await;
        let hook = f
            .server
            .mock("POST", mockito::Matcher::Any)
            .expect(0)
            .create_async()
            .await;

        let frame = StreamFrame {
            spec_version: Some("1.0".into()),
            frame_type: FrameType::Callback,
            headers: crate::frame::FrameHeaders {
                message_id: "hdr-7".into(),
                topic: crate::frame::TOPIC_BOT_MESSAGE.into(),
                ..Default::default()
            },
            data: serde_json::to_string(&serde_json::json!({
                "conversationId": "cidGroup==",
                "conversationType": "2",
                "senderStaffId": "u2",
                "msgId": "g1",
                "msgtype": "text",
                "text": { "content": "anyone around?" },
            }))
            .unwrap(),
        };
        f.processor.handle_callback(&frame).await.unwrap();
        tokio::task::yield_now().await;

        assert!(f.host.routes.lock().unwrap().is_empty());
        assert!(f.host.contexts.lock().unwrap().is_empty());
        assert_eq!(f.processor.histories.pending("cidGroup=="), 1);
        hook.assert_async().await;
    }

    #[tokio::test]
    async fn unmentioned_messages_become_context_for_the_next_mention() {
        let f = fixture(serde_json::Value::Null, None).await;
        assert!(
            f.processor
                .admit(&group_event("g1", "build is red", false), "h1")
                .is_none()
        );
        assert!(
            f.processor
                .admit(&group_event("g2", "again", false), "h2")
                .is_none()
        );

        let ctx = f
            .processor
            .admit(&group_event("g3", "@bot what broke?", true), "h3")
            .unwrap();
        f.processor.dispatch(ctx).await.unwrap();

        let contexts = f.host.contexts.lock().unwrap().clone();
        let context = &contexts[0];
        assert!(context.body.starts_with(HISTORY_CONTEXT_MARKER));
        assert!(context.body.contains("[DingTalk] Ops - Bob: build is red"));
        assert!(context.body.ends_with("[DingTalk] Ops - Bob: @bot what broke?"));
        assert_eq!(context.group_subject.as_deref(), Some("Ops"));
        assert_eq!(context.to, "chat:cidGroup==");
        assert_eq!(context.from, "dingtalk:group:cidGroup==");
        assert!(context.was_mentioned);
        assert_eq!(f.processor.histories.pending("cidGroup=="), 0);

        let routes = f.host.routes.lock().unwrap().clone();
        assert_eq!(routes[0].peer.kind, PeerKind::Group);
        let events = f.host.events.lock().unwrap().clone();
        assert_eq!(events[0].0, "DingTalk message in group Ops: @bot what broke?");
    }

    #[tokio::test]
    async fn disallowed_group_leaves_no_history() {
        let f = fixture(
            serde_json::json!({ "groupPolicy": "allowlist", "groupAllowFrom": ["cidOther"] }),
            None,
        )
        .await;
        assert!(
            f.processor
                .admit(&group_event("g1", "hello", false), "h1")
                .is_none()
        );
        assert_eq!(f.processor.histories.pending("cidGroup=="), 0);
    }

    #[test]
    fn preview_collapses_whitespace_and_truncates() {
        assert_eq!(preview("  a \n\n b\tc "), "a b c");
        let long = "x".repeat(200);
        let cut = preview(&long);
        assert_eq!(cut.chars().count(), PREVIEW_CHARS + 1);
        assert!(cut.ends_with('…'));
    }
}

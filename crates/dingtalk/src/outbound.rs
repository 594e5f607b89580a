use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::Duration,
};

use {
    dingbot_channels::ChatType,
    secrecy::ExposeSecret,
    serde::Deserialize,
    serde_json::json,
    tokio::time::Instant,
    tracing::{debug, warn},
};

use crate::{
    auth::TokenCache,
    error::{Error, Result},
    stats::StatsHandle,
    target::{ConversationDirectory, ReplyTarget, resolve_target},
    webhook::SessionWebhookStore,
};

/// Minimum spacing between two sends to the same conversation.
pub const SEND_INTERVAL: Duration = Duration::from_secs(1);

const ACCESS_TOKEN_HEADER: &str = "x-acs-dingtalk-access-token";

/// Message body in one of the three kinds DingTalk robots can send.
#[derive(Debug, Clone, PartialEq)]
pub enum MessageBody {
    Text(String),
    Markdown { title: String, text: String },
    Card(serde_json::Value),
}

impl MessageBody {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Text(_) => "text",
            Self::Markdown { .. } => "markdown",
            Self::Card(_) => "card",
        }
    }

    /// Body accepted by session webhooks: `{msgtype, text|markdown|interactive}`.
    pub fn to_message_json(&self) -> serde_json::Value {
        match self {
            Self::Text(content) => json!({ "msgtype": "text", "text": { "content": content } }),
            Self::Markdown { title, text } => json!({
                "msgtype": "markdown",
                "markdown": { "title": title, "text": text },
            }),
            Self::Card(card) => json!({ "msgtype": "interactive", "interactive": card }),
        }
    }

    /// Robot template key and parameters for the REST send endpoints.
    pub fn robot_template(&self) -> (&'static str, serde_json::Value) {
        match self {
            Self::Text(content) => ("sampleText", json!({ "content": content })),
            Self::Markdown { title, text } => {
                ("sampleMarkdown", json!({ "title": title, "text": text }))
            },
            Self::Card(card) => ("sampleActionCard", card.clone()),
        }
    }

    /// Split over-long text bodies; other kinds are sent as they are.
    pub fn into_chunks(self, limit: usize) -> Vec<Self> {
        match self {
            Self::Text(text) => chunk_text(&text, limit).into_iter().map(Self::Text).collect(),
            Self::Markdown { title, text } => chunk_text(&text, limit)
                .into_iter()
                .map(|text| Self::Markdown {
                    title: title.clone(),
                    text,
                })
                .collect(),
            card @ Self::Card(_) => vec![card],
        }
    }
}

/// Split `text` into pieces of at most `limit` characters, preferring line
/// boundaries.
pub fn chunk_text(text: &str, limit: usize) -> Vec<String> {
    if limit == 0 || text.chars().count() <= limit {
        return vec![text.to_string()];
    }
    let mut chunks = Vec::new();
    let mut current = String::new();
    let mut current_len = 0;
    for line in text.split_inclusive('\n') {
        let line_len = line.chars().count();
        if current_len + line_len > limit && !current.is_empty() {
            chunks.push(std::mem::take(&mut current));
            current_len = 0;
        }
        if line_len > limit {
            let chars: Vec<char> = line.chars().collect();
            for piece in chars.chunks(limit) {
                chunks.push(piece.iter().collect());
            }
            continue;
        }
        current.push_str(line);
        current_len += line_len;
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

/// Per-conversation send pacing. Early sends wait for their slot instead of
/// being dropped.
pub struct RateLimiter {
    interval: Duration,
    next_slot: Mutex<HashMap<String, Instant>>,
}

impl RateLimiter {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            next_slot: Mutex::new(HashMap::new()),
        }
    }

    /// Reserve the next slot for `key` and sleep until it opens.
    pub async fn acquire(&self, key: &str) {
        let slot = {
            let mut slots = self.next_slot.lock().unwrap_or_else(|e| e.into_inner());
            let now = Instant::now();
            if slots.len() > 256 {
                slots.retain(|_, at| *at > now);
            }
            let slot = match slots.get(key) {
                Some(at) if *at > now => *at,
                _ => now,
            };
            slots.insert(key.to_string(), slot + self.interval);
            slot
        };
        if slot > Instant::now() {
            debug!(conversation_id = key, "delaying send to respect rate limit");
            tokio::time::sleep_until(slot).await;
        }
    }
}

/// Which path delivered a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendRoute {
    Webhook,
    Api,
}

#[derive(Debug, Default, Deserialize)]
struct WebhookResponse {
    #[serde(default)]
    errcode: i64,
    #[serde(default)]
    errmsg: String,
}

/// Sends messages through the session webhook when one is known, else the
/// robot REST API.
pub struct DingTalkSender {
    http: reqwest::Client,
    tokens: Arc<TokenCache>,
    webhooks: Arc<SessionWebhookStore>,
    directory: Arc<ConversationDirectory>,
    limiter: RateLimiter,
    stats: StatsHandle,
    api_base: String,
    robot_code: String,
    chunk_limit: usize,
}

pub struct SenderParts {
    pub http: reqwest::Client,
    pub tokens: Arc<TokenCache>,
    pub webhooks: Arc<SessionWebhookStore>,
    pub directory: Arc<ConversationDirectory>,
    pub stats: StatsHandle,
    pub api_base: String,
    pub robot_code: String,
    pub chunk_limit: usize,
}

impl DingTalkSender {
    pub fn new(parts: SenderParts) -> Self {
        Self {
            http: parts.http,
            tokens: parts.tokens,
            webhooks: parts.webhooks,
            directory: parts.directory,
            limiter: RateLimiter::new(SEND_INTERVAL),
            stats: parts.stats,
            api_base: parts.api_base.trim_end_matches('/').to_string(),
            robot_code: parts.robot_code,
            chunk_limit: parts.chunk_limit,
        }
    }

    /// Send to an address such as `user:<id>`, `chat:<cid>` or a bare ID.
    pub async fn send(&self, to: &str, body: MessageBody) -> Result<SendRoute> {
        let target = resolve_target(&self.directory, to);
        self.send_to(&target, body).await
    }

    pub async fn send_to(&self, target: &ReplyTarget, body: MessageBody) -> Result<SendRoute> {
        let mut route = SendRoute::Webhook;
        for chunk in body.into_chunks(self.chunk_limit) {
            route = self.send_one(target, &chunk).await?;
        }
        Ok(route)
    }

    async fn send_one(&self, target: &ReplyTarget, body: &MessageBody) -> Result<SendRoute> {
        self.limiter.acquire(&target.conversation_id).await;

        if let Some(url) = self.webhooks.get(&target.conversation_id) {
            match self.post_webhook(&url, body).await {
                Ok(()) => {
                    self.stats.record_sent();
                    debug!(
                        conversation_id = %target.conversation_id,
                        kind = body.kind(),
                        "sent via session webhook"
                    );
                    return Ok(SendRoute::Webhook);
                },
                Err(e) => {
                    warn!(
                        conversation_id = %target.conversation_id,
                        error = %e,
                        "session webhook send failed, falling back to API"
                    );
                },
            }
        }

        self.post_api(target, body).await?;
        self.stats.record_sent();
        debug!(conversation_id = %target.conversation_id, kind = body.kind(), "sent via robot API");
        Ok(SendRoute::Api)
    }

    async fn post_webhook(&self, url: &str, body: &MessageBody) -> Result<()> {
        let resp = self
            .http
            .post(url)
            .json(&body.to_message_json())
            .send()
            .await?;
        let status = resp.status();
        let text = resp.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(Error::send(format!("webhook returned {status}: {text}")));
        }
        let parsed: WebhookResponse = serde_json::from_str(&text).unwrap_or_default();
        if parsed.errcode != 0 {
            return Err(Error::send(format!(
                "webhook rejected message ({}): {}",
                parsed.errcode, parsed.errmsg
            )));
        }
        Ok(())
    }

    async fn post_api(&self, target: &ReplyTarget, body: &MessageBody) -> Result<()> {
        let token = self.tokens.get_access_token().await?;
        let (msg_key, msg_param) = body.robot_template();
        let (url, payload) = match target.chat_type {
            ChatType::Direct => {
                let user_id = target
                    .user_id
                    .as_deref()
                    .unwrap_or(target.conversation_id.as_str());
                (
                    format!("{}/v1.0/robot/oToMessages/batchSend", self.api_base),
                    json!({
                        "robotCode": self.robot_code,
                        "userIds": [user_id],
                        "msgKey": msg_key,
                        "msgParam": msg_param.to_string(),
                    }),
                )
            },
            ChatType::Group => (
                format!("{}/v1.0/robot/groupMessages/send", self.api_base),
                json!({
                    "robotCode": self.robot_code,
                    "openConversationId": target.conversation_id,
                    "msgKey": msg_key,
                    "msgParam": msg_param.to_string(),
                }),
            ),
        };

        let resp = self
            .http
            .post(url)
            .header(ACCESS_TOKEN_HEADER, token.expose_secret())
            .json(&payload)
            .send()
            .await?;
        let status = resp.status();
        if status == reqwest::StatusCode::UNAUTHORIZED {
            self.tokens.invalidate();
        }
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(Error::send(format!("robot API returned {status}: {text}")));
        }
        Ok(())
    }
}

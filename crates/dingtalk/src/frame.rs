//! DingTalk Stream wire frames.
//!
//! Every frame is a JSON object with a `type` (`SYSTEM`, `EVENT`,
//! `CALLBACK`), a header map carrying the `messageId` used for
//! acknowledgment and the `topic`, and a `data` string holding the
//! JSON-encoded payload. Acks echo the header `messageId`.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::{
    config::DEFAULT_STREAM_ENDPOINT,
    error::{Error, Result},
};

/// Topic of robot message callbacks.
pub const TOPIC_BOT_MESSAGE: &str = "/v1.0/im/bot/messages/get";
/// SYSTEM topic the server uses for keep-alive probes.
pub const TOPIC_PING: &str = "ping";
/// SYSTEM topic asking the client to reconnect elsewhere.
pub const TOPIC_DISCONNECT: &str = "disconnect";

const JSON_CONTENT_TYPE: &str = "application/json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum FrameType {
    System,
    Event,
    Callback,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct FrameHeaders {
    pub message_id: String,
    pub topic: String,
    pub content_type: Option<String>,
    pub time: Option<String>,
    pub app_id: Option<String>,
    #[serde(flatten)]
    pub extra: HashMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamFrame {
    #[serde(default)]
    pub spec_version: Option<String>,
    #[serde(rename = "type")]
    pub frame_type: FrameType,
    #[serde(default)]
    pub headers: FrameHeaders,
    #[serde(default)]
    pub data: String,
}

impl StreamFrame {
    pub fn parse(text: &str) -> Result<Self> {
        let frame: Self = serde_json::from_str(text).map_err(Error::parse)?;
        if frame.headers.message_id.is_empty() {
            return Err(Error::parse("stream frame without headers.messageId"));
        }
        Ok(frame)
    }

    pub fn message_id(&self) -> &str {
        &self.headers.message_id
    }

    pub fn topic(&self) -> &str {
        &self.headers.topic
    }

    pub fn is_bot_message(&self) -> bool {
        self.frame_type == FrameType::Callback && self.topic() == TOPIC_BOT_MESSAGE
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct AckHeaders {
    content_type: &'static str,
    message_id: String,
}

/// Response frame acknowledging one inbound frame.
#[derive(Debug, Clone, Serialize)]
pub struct AckFrame {
    code: u16,
    headers: AckHeaders,
    message: &'static str,
    data: String,
}

impl AckFrame {
    fn new(message_id: &str, data: serde_json::Value) -> Self {
        Self {
            code: 200,
            headers: AckHeaders {
                content_type: JSON_CONTENT_TYPE,
                message_id: message_id.to_string(),
            },
            message: "OK",
            data: data.to_string(),
        }
    }

    /// Ack for a callback that was processed.
    pub fn callback_success(message_id: &str, timestamp_ms: i64) -> Self {
        Self::new(
            message_id,
            serde_json::json!({ "success": true, "timestamp": timestamp_ms }),
        )
    }

    /// Ack for a callback whose processing failed. Still stops redelivery.
    pub fn callback_failure(message_id: &str, error: &str) -> Self {
        Self::new(
            message_id,
            serde_json::json!({ "success": false, "error": error }),
        )
    }

    pub fn event_success(message_id: &str) -> Self {
        Self::new(
            message_id,
            serde_json::json!({ "status": "SUCCESS", "message": "success" }),
        )
    }

    /// Reply to a SYSTEM ping, echoing its payload.
    pub fn pong(message_id: &str, data: &str) -> Self {
        Self {
            data: data.to_string(),
            ..Self::new(message_id, serde_json::Value::Null)
        }
    }

    pub fn message_id(&self) -> &str {
        &self.headers.message_id
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

#[derive(Debug, Serialize)]
struct Subscription {
    #[serde(rename = "type")]
    kind: &'static str,
    topic: &'static str,
}

/// Body of the gateway open-connection call.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenConnectionRequest<'a> {
    client_id: &'a str,
    client_secret: &'a str,
    subscriptions: Vec<Subscription>,
    ua: &'static str,
}

impl<'a> OpenConnectionRequest<'a> {
    pub fn new(client_id: &'a str, client_secret: &'a str) -> Self {
        Self {
            client_id,
            client_secret,
            subscriptions: vec![
                Subscription {
                    kind: "CALLBACK",
                    topic: TOPIC_BOT_MESSAGE,
                },
                Subscription {
                    kind: "EVENT",
                    topic: "*",
                },
            ],
            ua: concat!("dingbot/", env!("CARGO_PKG_VERSION")),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct OpenConnectionResponse {
    #[serde(default)]
    pub endpoint: String,
    pub ticket: String,
}

impl OpenConnectionResponse {
    /// Transport URL: the endpoint with the one-time ticket appended.
    /// An empty endpoint falls back to the public stream host.
    pub fn stream_url(&self) -> Result<String> {
        let endpoint = if self.endpoint.is_empty() {
            DEFAULT_STREAM_ENDPOINT
        } else {
            self.endpoint.as_str()
        };
        let mut url = url::Url::parse(endpoint).map_err(Error::transport)?;
        url.query_pairs_mut().append_pair("ticket", &self.ticket);
        Ok(url.into())
    }
}

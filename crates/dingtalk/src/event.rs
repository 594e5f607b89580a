use std::time::Instant;

use {
    dingbot_channels::ChatType,
    serde::Deserialize,
};

use crate::{
    error::{Error, Result},
    webhook::expiry_from_epoch_ms,
};

/// `conversationType` value DingTalk uses for group chats ("1" is a DM).
const GROUP_CONVERSATION_TYPE: &str = "2";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TextContent {
    pub content: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AtUser {
    pub dingtalk_id: String,
    pub staff_id: Option<String>,
}

/// Robot message callback payload (`data` of a bot-message frame).
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct InboundEvent {
    pub msgtype: String,
    pub text: Option<TextContent>,
    /// Non-text bodies (`richText`, `picture`, `audio`, `file`, ...).
    pub content: Option<serde_json::Value>,
    pub msg_id: String,
    pub sender_id: String,
    pub sender_staff_id: Option<String>,
    pub sender_nick: Option<String>,
    pub chatbot_user_id: String,
    pub conversation_id: String,
    pub conversation_type: String,
    pub conversation_title: Option<String>,
    pub at_users: Vec<AtUser>,
    pub is_in_at_list: Option<bool>,
    pub session_webhook: Option<String>,
    /// Epoch milliseconds after which `session_webhook` stops working.
    pub session_webhook_expired_time: Option<i64>,
    pub create_at: Option<i64>,
    pub robot_code: Option<String>,
}

impl InboundEvent {
    pub fn parse(data: &str) -> Result<Self> {
        let event: Self = serde_json::from_str(data).map_err(Error::parse)?;
        if event.conversation_id.is_empty() {
            return Err(Error::parse("bot message without conversationId"));
        }
        Ok(event)
    }

    pub fn chat_type(&self) -> ChatType {
        if self.conversation_type == GROUP_CONVERSATION_TYPE {
            ChatType::Group
        } else {
            ChatType::Direct
        }
    }

    /// Staff ID when the sender belongs to the org, else the opaque sender ID.
    pub fn sender(&self) -> &str {
        self.sender_staff_id
            .as_deref()
            .filter(|id| !id.is_empty())
            .unwrap_or(self.sender_id.as_str())
    }

    pub fn mentions_bot(&self) -> bool {
        if self.is_in_at_list == Some(true) {
            return true;
        }
        !self.chatbot_user_id.is_empty()
            && self
                .at_users
                .iter()
                .any(|user| user.dingtalk_id == self.chatbot_user_id)
    }

    pub fn webhook_expiry(&self) -> Option<Instant> {
        self.session_webhook_expired_time.map(expiry_from_epoch_ms)
    }

    /// Plain-text rendering of the message body.
    pub fn content_text(&self) -> String {
        let content = self.content.as_ref();
        let field = |key: &str| {
            content
                .and_then(|c| c.get(key))
                .and_then(serde_json::Value::as_str)
                .map(str::to_string)
        };
        match self.msgtype.as_str() {
            "text" => self
                .text
                .as_ref()
                .map(|t| t.content.trim().to_string())
                .unwrap_or_default(),
            "richText" => content
                .and_then(|c| c.get("richText"))
                .and_then(serde_json::Value::as_array)
                .map(|parts| {
                    parts
                        .iter()
                        .filter_map(|p| p.get("text").and_then(serde_json::Value::as_str))
                        .collect::<Vec<_>>()
                        .join("")
                        .trim()
                        .to_string()
                })
                .unwrap_or_default(),
            "markdown" => field("text").unwrap_or_default(),
            "audio" => field("recognition").unwrap_or_else(|| "<media:audio>".into()),
            "picture" => "<media:image>".into(),
            "video" => "<media:video>".into(),
            "file" => match field("fileName") {
                Some(name) => format!("<media:file> {name}"),
                None => "<media:file>".into(),
            },
            _ => self
                .text
                .as_ref()
                .map(|t| t.content.trim().to_string())
                .unwrap_or_default(),
        }
    }
}

/// Normalized view of one inbound message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageContext {
    pub chat_id: String,
    pub message_id: String,
    pub sender_id: String,
    pub sender_name: Option<String>,
    pub chat_type: ChatType,
    pub mentioned_bot: bool,
    pub content: String,
    pub content_type: String,
    /// Group title, when DingTalk sent one.
    pub chat_title: Option<String>,
    /// Unix milliseconds; 0 when the event carried no `createAt`.
    pub timestamp_ms: i64,
}

impl MessageContext {
    pub fn is_group(&self) -> bool {
        self.chat_type.is_group()
    }

    /// Display name, falling back to the sender ID.
    pub fn sender_label(&self) -> &str {
        self.sender_name
            .as_deref()
            .filter(|n| !n.is_empty())
            .unwrap_or(self.sender_id.as_str())
    }
}

/// Map a wire event into a [`MessageContext`].
///
/// `header_message_id` stands in for events that carry no `msgId`.
pub fn translate(event: &InboundEvent, header_message_id: &str) -> MessageContext {
    let message_id = if event.msg_id.is_empty() {
        header_message_id.to_string()
    } else {
        event.msg_id.clone()
    };
    MessageContext {
        chat_id: event.conversation_id.clone(),
        message_id,
        sender_id: event.sender().to_string(),
        sender_name: event.sender_nick.clone().filter(|n| !n.is_empty()),
        chat_type: event.chat_type(),
        mentioned_bot: event.mentions_bot(),
        content: event.content_text(),
        content_type: event.msgtype.clone(),
        chat_title: event.conversation_title.clone().filter(|t| !t.is_empty()),
        timestamp_ms: event.create_at.unwrap_or_default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn group_event() -> InboundEvent {
        InboundEvent::parse(
            r#"{
                "conversationId": "cidGroup==",
                "atUsers": [{"dingtalkId": "$:LWCP_v1:$bot"}, {"dingtalkId": "other"}],
                "chatbotCorpId": "corp",
                "chatbotUserId": "$:LWCP_v1:$bot",
                "msgId": "msgA",
                "senderNick": "Alice",
                "isAdmin": false,
                "senderStaffId": "manager4220",
                "sessionWebhookExpiredTime": 1700000000000,
                "createAt": 1699990000000,
                "senderCorpId": "corp",
                "conversationType": "2",
                "senderId": "$:LWCP_v1:$alice",
                "conversationTitle": "Ops",
                "isInAtList": true,
                "sessionWebhook": "https://oapi.dingtalk.com/robot/sendBySession?session=abc",
                "text": {"content": " @bot deploy please "},
                "robotCode": "dingrobot",
                "msgtype": "text"
            }"#,
        )
        .unwrap()
    }

    #[test]
    fn translates_group_text() {
        let ctx = translate(&group_event(), "hdr");
        assert_eq!(ctx, MessageContext {
            chat_id: "cidGroup==".into(),
            message_id: "msgA".into(),
            sender_id: "manager4220".into(),
            sender_name: Some("Alice".into()),
            chat_type: ChatType::Group,
            mentioned_bot: true,
            content: "@bot deploy please".into(),
            content_type: "text".into(),
            chat_title: Some("Ops".into()),
            timestamp_ms: 1699990000000,
        });
    }

    #[test]
    fn direct_message_without_staff_id() {
        let event = InboundEvent::parse(
            r#"{"conversationId":"cidDm","conversationType":"1","senderId":"$:u","text":{"content":"hello"},"msgtype":"text"}"#,
        )
        .unwrap();
        let ctx = translate(&event, "hdr-9");
        assert_eq!(ctx.chat_type, ChatType::Direct);
        assert_eq!(ctx.sender_id, "$:u");
        assert_eq!(ctx.message_id, "hdr-9");
        assert!(!ctx.mentioned_bot);
        assert_eq!(ctx.sender_label(), "$:u");
    }

    #[test]
    fn mention_detected_from_at_users_only() {
        let mut event = group_event();
        event.is_in_at_list = None;
        assert!(event.mentions_bot());
        event.at_users.retain(|u| u.dingtalk_id == "other");
        assert!(!event.mentions_bot());
    }

    #[test]
    fn rich_text_is_flattened() {
        let event = InboundEvent::parse(
            r#"{"conversationId":"c","msgtype":"richText","content":{"richText":[{"text":"line one "},{"downloadCode":"x","type":"picture"},{"text":"and two"}]}}"#,
        )
        .unwrap();
        assert_eq!(event.content_text(), "line one and two");
    }

    #[test]
    fn media_placeholders() {
        let audio = InboundEvent::parse(
            r#"{"conversationId":"c","msgtype":"audio","content":{"recognition":"你好","duration":3}}"#,
        )
        .unwrap();
        assert_eq!(audio.content_text(), "你好");
        let file = InboundEvent::parse(
            r#"{"conversationId":"c","msgtype":"file","content":{"fileName":"report.pdf"}}"#,
        )
        .unwrap();
        assert_eq!(file.content_text(), "<media:file> report.pdf");
    }

    #[test]
    fn missing_conversation_is_parse_error() {
        assert!(matches!(
            InboundEvent::parse(r#"{"msgtype":"text"}"#),
            Err(Error::Parse { .. })
        ));
        assert!(InboundEvent::parse("{oops").is_err());
    }
}

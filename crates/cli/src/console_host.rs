//! Minimal [`ChannelHost`] for running the channel without an agent runtime.
//!
//! Every routed message is logged. With `--echo` the host answers each
//! message with its own text, which exercises the full reply path.

use std::sync::Arc;

use {
    anyhow::Result,
    async_trait::async_trait,
    dingbot_channels::{
        AgentRoute, ChannelHost, DispatchOutcome, EnvelopeParams, InboundContext, PeerKind,
        ReplyDispatcher, ReplyPayload, RouteRequest, SystemEventOptions,
    },
    tracing::info,
};

const AGENT_ID: &str = "main";

pub struct ConsoleHost {
    echo: bool,
    history_limit: Option<usize>,
}

impl ConsoleHost {
    pub fn new(echo: bool) -> Self {
        Self {
            echo,
            history_limit: None,
        }
    }

    pub fn with_history_limit(mut self, limit: Option<usize>) -> Self {
        self.history_limit = limit;
        self
    }
}

#[async_trait]
impl ChannelHost for ConsoleHost {
    fn resolve_agent_route(&self, request: &RouteRequest) -> Result<AgentRoute> {
        let kind = match request.peer.kind {
            PeerKind::Dm => "dm",
            PeerKind::Group => "group",
        };
        Ok(AgentRoute {
            agent_id: AGENT_ID.into(),
            session_key: format!(
                "agent:{AGENT_ID}:{}:{}:{kind}:{}",
                request.channel, request.account_id, request.peer.id
            ),
            account_id: request.account_id.clone(),
        })
    }

    fn enqueue_system_event(&self, text: &str, options: SystemEventOptions) {
        info!(session_key = %options.session_key, context_key = %options.context_key, "{text}");
    }

    fn format_agent_envelope(&self, params: &EnvelopeParams) -> String {
        let when = chrono::DateTime::from_timestamp_millis(params.timestamp_ms)
            .map(|t| t.format("%Y-%m-%d %H:%M:%S UTC").to_string())
            .unwrap_or_default();
        format!("[{} {} {when}] {}", params.channel, params.from, params.body)
    }

    fn finalize_inbound_context(&self, mut context: InboundContext) -> InboundContext {
        if context.command_body.is_empty() {
            context.command_body = context.raw_body.clone();
        }
        context
    }

    async fn dispatch_reply_from_config(
        &self,
        context: InboundContext,
        dispatcher: Arc<dyn ReplyDispatcher>,
    ) -> Result<DispatchOutcome> {
        info!(
            session_key = %context.session_key,
            chat_type = context.chat_type.as_str(),
            sender_id = %context.sender_id,
            message_id = %context.message_sid,
            "{}",
            context.body
        );
        let queued_final =
            self.echo && dispatcher.send_final_reply(ReplyPayload::text(context.raw_body));
        Ok(DispatchOutcome {
            queued_final,
            counts: dispatcher.queued_counts(),
        })
    }

    fn group_history_limit(&self) -> Option<usize> {
        self.history_limit
    }
}

use std::sync::{
    Arc, Mutex,
    atomic::{AtomicBool, Ordering},
};

use {
    anyhow::Result,
    async_trait::async_trait,
    dingbot_channels::{QueuedCounts, ReplyDispatcher, ReplyKind, ReplyPayload},
    tokio::sync::{mpsc, watch},
    tracing::warn,
};

use crate::{
    outbound::{DingTalkSender, MessageBody},
    target::ReplyTarget,
};

/// Longest markdown title taken from the first line of a reply.
const MARKDOWN_TITLE_CHARS: usize = 20;

/// Turn an agent reply into a DingTalk message body.
pub fn payload_to_body(payload: ReplyPayload) -> Option<MessageBody> {
    if let Some(card) = payload.card {
        return Some(MessageBody::Card(card));
    }
    let mut text = payload.text.unwrap_or_default().trim().to_string();
    if let Some(url) = payload.media_url {
        if !text.is_empty() {
            text.push_str("\n\n");
        }
        text.push_str(&url);
    }
    if text.is_empty() {
        return None;
    }
    if looks_like_markdown(&text) {
        let title = markdown_title(&text);
        Some(MessageBody::Markdown { title, text })
    } else {
        Some(MessageBody::Text(text))
    }
}

fn looks_like_markdown(text: &str) -> bool {
    text.contains("```")
        || text.contains("**")
        || text.contains("](")
        || text.lines().any(|line| {
            let line = line.trim_start();
            line.starts_with('#') || line.starts_with("- ") || line.starts_with("> ")
        })
}

fn markdown_title(text: &str) -> String {
    let first = text
        .lines()
        .map(|l| l.trim().trim_start_matches('#').trim())
        .find(|l| !l.is_empty())
        .unwrap_or("Reply");
    first.chars().take(MARKDOWN_TITLE_CHARS).collect()
}

struct Queue {
    counts: Mutex<QueuedCounts>,
    pending: watch::Sender<usize>,
}

impl Queue {
    fn adjust(&self, kind: ReplyKind, delta: isize) {
        let total = {
            let mut counts = self.counts.lock().unwrap_or_else(|e| e.into_inner());
            let slot = counts.get_mut(kind);
            *slot = slot.saturating_add_signed(delta);
            counts.total()
        };
        self.pending.send_replace(total);
    }
}

/// Reply sink for one inbound message, delivering through [`DingTalkSender`].
///
/// Queued replies are delivered in order by a background task; dropping the
/// dispatcher lets that task finish the queue and exit.
pub struct DingTalkReplyDispatcher {
    sender: Arc<DingTalkSender>,
    target: ReplyTarget,
    tx: mpsc::UnboundedSender<(ReplyKind, MessageBody)>,
    queue: Arc<Queue>,
    final_queued: AtomicBool,
}

impl DingTalkReplyDispatcher {
    pub fn new(sender: Arc<DingTalkSender>, target: ReplyTarget) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<(ReplyKind, MessageBody)>();
        let (pending, _) = watch::channel(0);
        let queue = Arc::new(Queue {
            counts: Mutex::new(QueuedCounts::default()),
            pending,
        });

        let worker_sender = Arc::clone(&sender);
        let worker_target = target.clone();
        let worker_queue = Arc::clone(&queue);
        tokio::spawn(async move {
            while let Some((kind, body)) = rx.recv().await {
                if let Err(e) = worker_sender.send_to(&worker_target, body).await {
                    warn!(
                        conversation_id = %worker_target.conversation_id,
                        ?kind,
                        error = %e,
                        "failed to deliver DingTalk reply"
                    );
                }
                worker_queue.adjust(kind, -1);
            }
        });

        Self {
            sender,
            target,
            tx,
            queue,
            final_queued: AtomicBool::new(false),
        }
    }

    pub fn target(&self) -> &ReplyTarget {
        &self.target
    }

    fn enqueue(&self, kind: ReplyKind, payload: ReplyPayload) -> bool {
        let Some(body) = payload_to_body(payload) else {
            return false;
        };
        self.queue.adjust(kind, 1);
        if self.tx.send((kind, body)).is_err() {
            self.queue.adjust(kind, -1);
            return false;
        }
        true
    }
}

#[async_trait]
impl ReplyDispatcher for DingTalkReplyDispatcher {
    async fn dispatch(&self, payload: ReplyPayload, kind: ReplyKind) -> Result<()> {
        let Some(body) = payload_to_body(payload) else {
            return Ok(());
        };
        // In flight until the send settles, so idle waits cover it too.
        self.queue.adjust(kind, 1);
        let sent = self.sender.send_to(&self.target, body).await;
        self.queue.adjust(kind, -1);
        if let Err(e) = sent {
            warn!(
                conversation_id = %self.target.conversation_id,
                ?kind,
                error = %e,
                "failed to send DingTalk reply"
            );
            return Err(e.into());
        }
        Ok(())
    }

    fn send_block_reply(&self, payload: ReplyPayload) -> bool {
        if self.final_queued.load(Ordering::SeqCst) {
            return false;
        }
        self.enqueue(ReplyKind::Block, payload)
    }

    fn send_final_reply(&self, payload: ReplyPayload) -> bool {
        if self.final_queued.swap(true, Ordering::SeqCst) {
            return false;
        }
        let accepted = self.enqueue(ReplyKind::Final, payload);
        if !accepted {
            self.final_queued.store(false, Ordering::SeqCst);
        }
        accepted
    }

    fn queued_counts(&self) -> QueuedCounts {
        *self.queue.counts.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn wait_for_idle(&self) {
        let mut rx = self.queue.pending.subscribe();
        let _ = rx.wait_for(|pending| *pending == 0).await;
    }
}

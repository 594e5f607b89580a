//! Stream connection manager.
//!
//! Owns the single long-lived link to the DingTalk stream gateway: token
//! acquisition, transport open, heartbeat and idle detection, frame
//! acknowledgment, and reconnect with exponential backoff. One
//! [`StreamClient`] exists per account activation; once
//! [`StreamClient::disconnect`] has run it refuses to connect again.

use std::{
    sync::{
        Arc, Mutex,
        atomic::{AtomicU32, Ordering},
    },
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use {
    async_trait::async_trait,
    futures::{SinkExt, StreamExt},
    rand::Rng,
    secrecy::ExposeSecret,
    tokio::{
        net::TcpStream,
        sync::{Mutex as AsyncMutex, watch},
        task::JoinHandle,
        time::{Instant, MissedTickBehavior},
    },
    tokio_tungstenite::{
        MaybeTlsStream, WebSocketStream, connect_async,
        tungstenite::{
            Message,
            client::IntoClientRequest,
            http::{HeaderValue, header::AUTHORIZATION},
        },
    },
    tokio_util::sync::CancellationToken,
    tracing::{debug, info, warn},
};

use crate::{
    accounts::DingTalkCredentials,
    auth::TokenCache,
    config::DingTalkAccountConfig,
    error::{Error, Result},
    frame::{
        AckFrame, FrameType, OpenConnectionRequest, OpenConnectionResponse, StreamFrame,
        TOPIC_DISCONNECT, TOPIC_PING,
    },
    stats::{ConnectionStats, ConnectionStatus, StatsHandle},
};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

const ACCESS_TOKEN_HEADER: &str = "x-acs-dingtalk-access-token";

/// Missed heartbeats after which a silent transport is treated as closed.
const IDLE_HEARTBEATS: u32 = 3;

/// Upper bound on the jitter added to a reconnect delay, as a fraction.
const MAX_JITTER: f64 = 0.2;

/// Connection tuning, resolved from the account config.
#[derive(Debug, Clone)]
pub struct StreamSettings {
    pub api_base: String,
    /// Fixed transport URL; when `None` it comes from the gateway.
    pub endpoint: Option<String>,
    pub heartbeat_interval: Duration,
    pub reconnect_interval: Duration,
    pub max_reconnect_interval: Duration,
    pub jitter: bool,
}

impl StreamSettings {
    pub fn from_config(config: &DingTalkAccountConfig) -> Self {
        Self {
            api_base: config.api_base().to_string(),
            endpoint: config
                .stream_endpoint
                .as_deref()
                .map(str::trim)
                .filter(|e| !e.is_empty())
                .map(str::to_string),
            heartbeat_interval: config.heartbeat_interval(),
            reconnect_interval: config.reconnect_interval(),
            max_reconnect_interval: config.max_reconnect_interval(),
            jitter: config.reconnect_jitter,
        }
    }
}

/// Delay before reconnect attempt `attempt` (1-based).
pub fn backoff_delay(settings: &StreamSettings, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(16);
    let delay = settings
        .reconnect_interval
        .saturating_mul(1 << exponent)
        .min(settings.max_reconnect_interval);
    if !settings.jitter || delay.is_zero() {
        return delay;
    }
    let extra = rand::rng().random_range(0.0..=MAX_JITTER);
    delay + delay.mul_f64(extra)
}

/// Receives bot-message callbacks. The returned result decides whether the
/// frame is acked as a success or a failure; it is acked either way.
#[async_trait]
pub trait FrameHandler: Send + Sync {
    async fn handle_callback(&self, frame: &StreamFrame) -> Result<()>;
}

pub struct StreamParts {
    pub account_id: String,
    pub settings: StreamSettings,
    pub credentials: DingTalkCredentials,
    pub http: reqwest::Client,
    pub tokens: Arc<TokenCache>,
    pub handler: Arc<dyn FrameHandler>,
    pub stats: StatsHandle,
}

struct Session {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

struct Inner {
    account_id: String,
    settings: StreamSettings,
    credentials: DingTalkCredentials,
    http: reqwest::Client,
    tokens: Arc<TokenCache>,
    handler: Arc<dyn FrameHandler>,
    stats: StatsHandle,
    /// Fired by `disconnect`; never reset.
    shutdown: CancellationToken,
    /// Serializes connect attempts.
    connect_lock: AsyncMutex<()>,
    session: Mutex<Option<Session>>,
    reconnect: Mutex<Option<JoinHandle<()>>>,
    /// Reconnect attempts since the last successful open.
    attempt: AtomicU32,
}

#[derive(Default)]
struct FrameOutcome {
    ack: Option<String>,
    disconnect: bool,
}

/// Handle to the stream connection of one account. Cheap to clone.
#[derive(Clone)]
pub struct StreamClient {
    inner: Arc<Inner>,
}

impl StreamClient {
    pub fn new(parts: StreamParts) -> Self {
        Self {
            inner: Arc::new(Inner {
                account_id: parts.account_id,
                settings: parts.settings,
                credentials: parts.credentials,
                http: parts.http,
                tokens: parts.tokens,
                handler: parts.handler,
                stats: parts.stats,
                shutdown: CancellationToken::new(),
                connect_lock: AsyncMutex::new(()),
                session: Mutex::new(None),
                reconnect: Mutex::new(None),
                attempt: AtomicU32::new(0),
            }),
        }
    }

    pub fn stats(&self) -> ConnectionStats {
        self.inner.stats.snapshot()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.inner.stats.subscribe()
    }

    /// Open the connection. Returns at once when already connected.
    ///
    /// A failure other than [`Error::Stopped`] leaves the status at
    /// `Error` and schedules a reconnect.
    pub async fn connect(&self) -> Result<()> {
        let inner = &self.inner;
        if inner.shutdown.is_cancelled() {
            return Err(Error::Stopped);
        }
        if inner.stats.status() == ConnectionStatus::Connected {
            return Ok(());
        }

        let _connecting = inner.connect_lock.lock().await;
        if inner.shutdown.is_cancelled() {
            return Err(Error::Stopped);
        }
        if inner.stats.status() == ConnectionStatus::Connected {
            return Ok(());
        }

        inner.stats.set_status(ConnectionStatus::Connecting);
        info!(account_id = %inner.account_id, "connecting DingTalk stream");

        let opened = tokio::select! {
            biased;
            () = inner.shutdown.cancelled() => Err(Error::Stopped),
            opened = self.open_transport() => opened,
        };

        match opened {
            Ok(ws) => {
                inner.attempt.store(0, Ordering::SeqCst);
                inner.stats.update(|s| {
                    s.status = ConnectionStatus::Connected;
                    s.connected_at = Some(SystemTime::now());
                    s.last_error = None;
                });
                let cancel = inner.shutdown.child_token();
                let mut session = inner.session.lock().unwrap_or_else(|e| e.into_inner());
                let task = tokio::spawn(self.clone().run_session(ws, cancel.clone()));
                *session = Some(Session { cancel, task });
                info!(account_id = %inner.account_id, "DingTalk stream connected");
                Ok(())
            },
            Err(Error::Stopped) => Err(Error::Stopped),
            Err(e) => {
                inner.stats.update(|s| {
                    s.status = ConnectionStatus::Error;
                    s.last_error = Some(e.to_string());
                });
                warn!(account_id = %inner.account_id, error = %e, "DingTalk stream connect failed");
                self.schedule_reconnect();
                Err(e)
            },
        }
    }

    /// Stop for good: cancel timers, close the transport, and wait for the
    /// session task to finish. Safe to call in any state, repeatedly.
    pub async fn disconnect(&self) {
        let inner = &self.inner;
        inner.shutdown.cancel();
        inner.stats.set_status(ConnectionStatus::Disconnecting);

        let reconnect = inner
            .reconnect
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(task) = reconnect {
            task.abort();
        }

        // An in-flight connect sees the shutdown and releases the lock.
        let _connecting = inner.connect_lock.lock().await;
        let session = inner
            .session
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(session) = session {
            session.cancel.cancel();
            if let Err(e) = session.task.await
                && e.is_panic()
            {
                warn!(account_id = %inner.account_id, "DingTalk stream session panicked");
            }
        }

        inner.stats.update(|s| {
            s.status = ConnectionStatus::Disconnected;
            s.connected_at = None;
        });
        info!(account_id = %inner.account_id, "DingTalk stream disconnected");
    }

    /// Connect and keep the connection alive until `cancel` fires, then tear
    /// down. Resolves only after teardown is complete.
    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        self.start().await?;
        self.serve(cancel).await;
        Ok(())
    }

    /// First connect of an activation.
    ///
    /// Credential and token failures tear the client down and are returned;
    /// anything else is left to the background reconnect.
    pub async fn start(&self) -> Result<()> {
        match self.connect().await {
            Ok(()) | Err(Error::Stopped) => Ok(()),
            Err(e) if e.is_fatal_on_start() => {
                self.disconnect().await;
                Err(e)
            },
            Err(e) => {
                warn!(
                    account_id = %self.inner.account_id,
                    error = %e,
                    "initial DingTalk connect failed, retrying in background"
                );
                Ok(())
            },
        }
    }

    /// Wait for `cancel` (or a direct `disconnect`), then tear down.
    pub async fn serve(&self, cancel: CancellationToken) {
        tokio::select! {
            () = cancel.cancelled() => {},
            () = self.inner.shutdown.cancelled() => {},
        }
        self.disconnect().await;
    }

    async fn open_transport(&self) -> Result<WsStream> {
        let token = self.inner.tokens.get_access_token().await?;
        let url = self.resolve_stream_url().await?;
        debug!(account_id = %self.inner.account_id, "opening DingTalk stream transport");

        let mut request = url.as_str().into_client_request()?;
        let headers = request.headers_mut();
        headers.insert(
            ACCESS_TOKEN_HEADER,
            HeaderValue::from_str(token.expose_secret()).map_err(Error::auth)?,
        );
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {}", token.expose_secret()))
                .map_err(Error::auth)?,
        );

        let (ws, _response) = connect_async(request).await.map_err(Error::transport)?;
        Ok(ws)
    }

    async fn resolve_stream_url(&self) -> Result<String> {
        let inner = &self.inner;
        if let Some(endpoint) = inner.settings.endpoint.as_ref() {
            return Ok(endpoint.clone());
        }

        let url = format!("{}/v1.0/gateway/connections/open", inner.settings.api_base);
        let body = OpenConnectionRequest::new(
            &inner.credentials.app_key,
            inner.credentials.app_secret.expose_secret(),
        );
        let resp = inner
            .http
            .post(url)
            .json(&body)
            .send()
            .await
            .map_err(Error::transport)?;
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(Error::transport(format!(
                "gateway open returned {status}: {text}"
            )));
        }
        let opened: OpenConnectionResponse = resp.json().await.map_err(Error::transport)?;
        opened.stream_url()
    }

    async fn run_session(self, ws: WsStream, cancel: CancellationToken) {
        let reason = self.drive_session(ws, &cancel).await;
        self.on_session_closed(&reason);
    }

    /// Pump one open transport until it closes; returns why it ended.
    async fn drive_session(&self, ws: WsStream, cancel: &CancellationToken) -> String {
        let account_id = self.inner.account_id.as_str();
        let (mut sink, mut stream) = ws.split();

        let period = self.inner.settings.heartbeat_interval;
        let idle_timeout = period * IDLE_HEARTBEATS;
        let mut heartbeat = tokio::time::interval_at(Instant::now() + period, period);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut last_seen = Instant::now();

        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => {
                    let _ = sink.send(Message::Close(None)).await;
                    return "stopped".into();
                },
                _ = heartbeat.tick() => {
                    if last_seen.elapsed() >= idle_timeout {
                        return format!("no traffic for {}s", idle_timeout.as_secs());
                    }
                    if let Err(e) = sink.send(Message::Ping(Vec::new().into())).await {
                        return format!("heartbeat failed: {e}");
                    }
                },
                msg = stream.next() => {
                    let text = match msg {
                        Some(Ok(Message::Text(text))) => text.as_str().to_owned(),
                        Some(Ok(Message::Binary(data))) => {
                            String::from_utf8_lossy(&data).into_owned()
                        },
                        Some(Ok(Message::Close(frame))) => {
                            return match frame {
                                Some(frame) => format!(
                                    "closed by server: {} {}",
                                    u16::from(frame.code),
                                    frame.reason.as_str()
                                ),
                                None => "closed by server".into(),
                            };
                        },
                        Some(Ok(_)) => {
                            last_seen = Instant::now();
                            continue;
                        },
                        Some(Err(e)) => return format!("transport error: {e}"),
                        None => return "transport ended".into(),
                    };
                    last_seen = Instant::now();

                    let outcome = self.process_frame(&text).await;
                    if let Some(ack) = outcome.ack
                        && let Err(e) = sink.send(Message::Text(ack.into())).await
                    {
                        warn!(account_id, error = %e, "failed to send DingTalk ack");
                    }
                    if outcome.disconnect {
                        let _ = sink.send(Message::Close(None)).await;
                        return "server requested disconnect".into();
                    }
                },
            }
        }
    }

    async fn process_frame(&self, text: &str) -> FrameOutcome {
        let account_id = self.inner.account_id.as_str();
        let frame = match StreamFrame::parse(text) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(account_id, error = %e, "dropping malformed DingTalk frame");
                return FrameOutcome::default();
            },
        };
        let message_id = frame.message_id();

        let (ack, disconnect) = match frame.frame_type {
            FrameType::System => match frame.topic() {
                TOPIC_PING => (Some(AckFrame::pong(message_id, &frame.data)), false),
                TOPIC_DISCONNECT => {
                    info!(account_id, "DingTalk asked the stream to reconnect");
                    (None, true)
                },
                topic => {
                    debug!(account_id, topic, "ignoring DingTalk system frame");
                    (None, false)
                },
            },
            FrameType::Event => {
                debug!(account_id, message_id, topic = frame.topic(), "DingTalk event");
                (Some(AckFrame::event_success(message_id)), false)
            },
            FrameType::Callback => {
                self.inner.stats.record_received();
                let ack = match self.inner.handler.handle_callback(&frame).await {
                    Ok(()) => AckFrame::callback_success(message_id, now_ms()),
                    Err(e) => {
                        warn!(account_id, message_id, error = %e, "DingTalk callback failed");
                        AckFrame::callback_failure(message_id, &e.to_string())
                    },
                };
                (Some(ack), false)
            },
        };

        let ack = match ack.map(|a| a.to_json()) {
            Some(Ok(json)) => Some(json),
            Some(Err(e)) => {
                warn!(account_id, message_id, error = %e, "failed to encode DingTalk ack");
                None
            },
            None => None,
        };
        FrameOutcome { ack, disconnect }
    }

    fn on_session_closed(&self, reason: &str) {
        let inner = &self.inner;
        inner
            .session
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if inner.shutdown.is_cancelled() {
            debug!(account_id = %inner.account_id, reason, "DingTalk stream session ended");
            return;
        }
        inner.stats.update(|s| {
            s.status = ConnectionStatus::Disconnected;
            s.connected_at = None;
        });
        warn!(account_id = %inner.account_id, reason, "DingTalk stream closed");
        self.schedule_reconnect();
    }

    fn schedule_reconnect(&self) {
        let inner = &self.inner;
        if inner.shutdown.is_cancelled() {
            return;
        }
        let attempt = inner.attempt.fetch_add(1, Ordering::SeqCst) + 1;
        let delay = backoff_delay(&inner.settings, attempt);
        inner.stats.update(|s| s.reconnect_count += 1);
        info!(
            account_id = %inner.account_id,
            attempt,
            delay_ms = delay.as_millis() as u64,
            "scheduling DingTalk stream reconnect"
        );

        let client = self.clone();
        let task = tokio::spawn(async move {
            tokio::select! {
                () = client.inner.shutdown.cancelled() => {},
                () = tokio::time::sleep(delay) => {
                    if let Err(e) = client.connect().await {
                        debug!(
                            account_id = %client.inner.account_id,
                            error = %e,
                            "reconnect attempt failed"
                        );
                    }
                },
            }
        });

        let previous = inner
            .reconnect
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .replace(task);
        // A failed reconnect schedules the next one from inside the previous task.
        if let Some(previous) = previous
            && !previous.is_finished()
            && tokio::task::try_id() != Some(previous.id())
        {
            previous.abort();
        }
    }
}

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_millis() as i64)
}

/// Crate-wide result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Failures of the DingTalk channel.
///
/// A policy rejection is not an error; see [`crate::access::AccessDenied`].
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Missing or invalid credentials/config. Fatal to startup.
    #[error("invalid DingTalk config: {message}")]
    Config { message: String },

    /// Token exchange failed. Retried on the next token request.
    #[error("DingTalk token exchange failed: {message}")]
    Auth { message: String },

    /// Stream open/send failure. Triggers a reconnect.
    #[error("DingTalk stream transport error: {message}")]
    Transport { message: String },

    /// Malformed inbound payload. The message is dropped.
    #[error("malformed DingTalk payload: {message}")]
    Parse { message: String },

    /// Forwarding to the host agent failed. The message is lost.
    #[error("agent dispatch failed: {message}")]
    Dispatch { message: String },

    /// Webhook or REST send failed.
    #[error("DingTalk send failed: {message}")]
    Send { message: String },

    /// The connection manager was disconnected and cannot be reused.
    #[error("DingTalk stream connection stopped")]
    Stopped,

    #[error(transparent)]
    Http(#[from] reqwest::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
}

impl Error {
    #[must_use]
    pub fn config(message: impl std::fmt::Display) -> Self {
        Self::Config {
            message: message.to_string(),
        }
    }

    #[must_use]
    pub fn auth(message: impl std::fmt::Display) -> Self {
        Self::Auth {
            message: message.to_string(),
        }
    }

    #[must_use]
    pub fn transport(message: impl std::fmt::Display) -> Self {
        Self::Transport {
            message: message.to_string(),
        }
    }

    #[must_use]
    pub fn parse(message: impl std::fmt::Display) -> Self {
        Self::Parse {
            message: message.to_string(),
        }
    }

    #[must_use]
    pub fn dispatch(message: impl std::fmt::Display) -> Self {
        Self::Dispatch {
            message: message.to_string(),
        }
    }

    #[must_use]
    pub fn send(message: impl std::fmt::Display) -> Self {
        Self::Send {
            message: message.to_string(),
        }
    }

    /// Whether a failed initial connect should abort startup instead of
    /// retrying in the background.
    pub fn is_fatal_on_start(&self) -> bool {
        matches!(self, Self::Config { .. } | Self::Auth { .. })
    }
}

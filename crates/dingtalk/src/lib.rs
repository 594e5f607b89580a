//! DingTalk channel plugin for dingbot.
//!
//! Holds an outbound Stream-mode WebSocket per account, so no public webhook
//! is needed. Inbound robot messages pass the DM/group gates in [`access`]
//! and are forwarded to the host agent; replies go back through the
//! conversation's session webhook, falling back to the robot REST API.

pub mod access;
pub mod accounts;
pub mod auth;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod event;
pub mod frame;
pub mod history;
pub mod outbound;
pub mod plugin;
pub mod reply;
pub mod setup;
pub mod state;
pub mod stats;
pub mod stream;
pub mod target;
pub mod webhook;

/// Channel identifier used in config paths, routes and session keys.
pub const CHANNEL_ID: &str = "dingtalk";

pub use {
    config::DingTalkAccountConfig,
    error::{Error, Result},
    plugin::{DingTalkOutbound, DingTalkPlugin},
    stats::{ConnectionStats, ConnectionStatus},
    stream::{StreamClient, StreamSettings},
};
